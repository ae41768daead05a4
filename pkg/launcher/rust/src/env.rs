// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const EXEC_PATH_VAR: &str = "PYMAPDL_MAPDL_EXEC";
pub const VERSION_VAR: &str = "PYMAPDL_MAPDL_VERSION";
pub const START_INSTANCE_VAR: &str = "PYMAPDL_START_INSTANCE";
pub const IP_VAR: &str = "PYMAPDL_IP";
pub const PORT_VAR: &str = "PYMAPDL_PORT";
pub const NPROC_VAR: &str = "PYMAPDL_NPROC";
pub const RUNNING_ON_HPC_VAR: &str = "PYMAPDL_RUNNING_ON_HPC";
pub const PROVISIONING_CONFIG_VAR: &str = "ANSYS_PLATFORM_INSTANCEMANAGEMENT_CONFIG";
pub const INSTALL_ROOT_PREFIX: &str = "AWP_ROOT";

/// Set on every child so the solver skips its interactive diagnostics.
pub const NODIAG_VAR: &str = "ANS_CMD_NODIAG";
/// Disables the solver's own lock file check.
pub const LOCK_VAR: &str = "ANSYS_LOCK";

/// A frozen copy of environment variables.
///
/// Resolution reads the environment only through a snapshot, so a launch
/// plan depends on its inputs and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the value of `key`, treating empty values as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// All `AWP_ROOT<ver>` variables as `(ver, root)` pairs.
    pub fn install_roots(&self) -> Vec<(u32, PathBuf)> {
        self.vars
            .iter()
            .filter_map(|(k, v)| {
                let ver = k.strip_prefix(INSTALL_ROOT_PREFIX)?.parse().ok()?;
                if v.trim().is_empty() {
                    return None;
                }
                Some((ver, PathBuf::from(v)))
            })
            .collect()
    }

    /// Look up `program` in the snapshot's `PATH`.
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        let path = self.get("PATH")?;
        std::env::split_paths(path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Parse a boolean-ish environment value. Only `true`/`false` in any case
/// are accepted.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
