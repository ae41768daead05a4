// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::version::SolverVersion;

pub const DEFAULT_JOBNAME: &str = "file";

fn default_jobname() -> String {
    DEFAULT_JOBNAME.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    LocalGrpc,
    LocalConsole,
    Remote,
    Hpc,
    Delegated,
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMode::LocalGrpc => "local-grpc",
            LaunchMode::LocalConsole => "local-console",
            LaunchMode::Remote => "remote",
            LaunchMode::Hpc => "hpc",
            LaunchMode::Delegated => "delegated",
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, LaunchMode::LocalGrpc | LaunchMode::LocalConsole)
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-grpc" | "grpc" => Ok(LaunchMode::LocalGrpc),
            "local-console" | "console" => Ok(LaunchMode::LocalConsole),
            "remote" => Ok(LaunchMode::Remote),
            "hpc" => Ok(LaunchMode::Hpc),
            "delegated" => Ok(LaunchMode::Delegated),
            other => Err(format!("unknown launch mode: {other}")),
        }
    }
}

/// What the caller asked for. Nothing here is validated; [`crate::resolve`]
/// turns it into a [`crate::LaunchPlan`] or rejects it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfiguration {
    /// `None` lets the resolver pick from the environment.
    pub mode: Option<LaunchMode>,
    pub start_instance: Option<bool>,
    pub exec_path: Option<PathBuf>,
    /// `None` means the newest installation found.
    pub version: Option<SolverVersion>,
    pub host: Option<String>,
    /// Kept wider than `u16` so out-of-range values reach validation
    /// instead of failing deserialization with a less useful message.
    pub port: Option<u32>,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_jobname")]
    pub jobname: String,
    pub nproc: Option<u32>,
    pub ram_mb: Option<u64>,
    pub distributed: Option<bool>,
    pub additional_switches: Vec<String>,
    #[serde(deserialize_with = "deserialize_seconds")]
    pub timeout: Option<Duration>,
    pub env_overrides: HashMap<String, String>,
    pub replace_env: bool,
    pub student: bool,
    pub override_lock: bool,
    #[serde(default = "default_true")]
    pub clear_on_connect: bool,
    pub scheduler_options: BTreeMap<String, String>,
    pub output_file: Option<PathBuf>,
    pub probe_port: bool,
}

impl Default for LaunchConfiguration {
    fn default() -> Self {
        Self {
            mode: None,
            start_instance: None,
            exec_path: None,
            version: None,
            host: None,
            port: None,
            working_dir: None,
            jobname: default_jobname(),
            nproc: None,
            ram_mb: None,
            distributed: None,
            additional_switches: Vec::new(),
            timeout: None,
            env_overrides: HashMap::new(),
            replace_env: false,
            student: false,
            override_lock: false,
            clear_on_connect: true,
            scheduler_options: BTreeMap::new(),
            output_file: None,
            probe_port: false,
        }
    }
}

impl LaunchConfiguration {
    pub fn new(mode: LaunchMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    /// Options set to a non-default value that make no sense when attaching
    /// to a server somebody else started.
    pub fn options_outside_remote_allow_list(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        let mut check = |name: &'static str, is_set: bool| {
            if is_set {
                set.push(name);
            }
        };
        check("exec_path", self.exec_path.is_some());
        check("version", self.version.is_some());
        check("working_dir", self.working_dir.is_some());
        check("distributed", self.distributed.is_some());
        check("additional_switches", !self.additional_switches.is_empty());
        check("env_overrides", !self.env_overrides.is_empty());
        check("nproc", self.nproc.is_some());
        check("ram_mb", self.ram_mb.is_some());
        check("jobname", self.jobname != DEFAULT_JOBNAME);
        check("student", self.student);
        check("override_lock", self.override_lock);
        check("replace_env", self.replace_env);
        check("scheduler_options", !self.scheduler_options.is_empty());
        check("output_file", self.output_file.is_some());
        check("probe_port", self.probe_port);
        set
    }
}

fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<f64> = Option::deserialize(deserializer)?;
    match secs {
        None => Ok(None),
        Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
        Some(s) => Err(serde::de::Error::custom(format!(
            "timeout must be a non-negative number of seconds, got {s}"
        ))),
    }
}

/// Read a [`LaunchConfiguration`] from a YAML file.
pub fn load_config(path: &Path) -> anyhow::Result<LaunchConfiguration> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: LaunchConfiguration =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
