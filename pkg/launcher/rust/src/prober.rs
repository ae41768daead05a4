// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Read-only inspection of the host: which solver installations exist and
//! whether a batch scheduler is reachable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{debug, warn};

use crate::env::{self, EnvSnapshot};
use crate::version::SolverVersion;

const STANDARD_ROOTS: &[&str] = &["/usr/ansys_inc", "/ansys_inc", "/opt/ansys_inc"];
const STUDENT_DIR: &str = "ANSYS Student";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Installation {
    pub version: SolverVersion,
    pub student: bool,
    pub path: PathBuf,
}

impl Installation {
    fn from_path(version: SolverVersion, path: PathBuf) -> Self {
        let student = is_student_path(&path);
        Self {
            version,
            student,
            path,
        }
    }
}

pub(crate) fn is_student_path(path: &Path) -> bool {
    path.to_string_lossy().to_lowercase().contains("student")
}

/// Allocation sizes visible when this process itself runs inside a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub job_id: Option<String>,
    pub cores: Option<u32>,
    pub mem_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerInfo {
    /// Directory holding `sbatch`, `scontrol` and `scancel`.
    pub bin_dir: PathBuf,
    pub allocation: Allocation,
}

pub struct EnvironmentProber {
    env: EnvSnapshot,
    search_roots: Vec<PathBuf>,
    cache_file: Option<PathBuf>,
    cached: OnceLock<BTreeSet<Installation>>,
}

impl EnvironmentProber {
    pub fn new(env: EnvSnapshot) -> Self {
        Self {
            env,
            search_roots: STANDARD_ROOTS.iter().map(PathBuf::from).collect(),
            cache_file: None,
            cached: OnceLock::new(),
        }
    }

    pub fn from_process_env() -> Self {
        Self::new(EnvSnapshot::from_process())
    }

    /// Replace the standard installation roots.
    pub fn with_search_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_roots = roots;
        self.cached = OnceLock::new();
        self
    }

    pub fn with_extra_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_roots.push(root.into());
        self.cached = OnceLock::new();
        self
    }

    /// A file listing known executables, one path per line.
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self.cached = OnceLock::new();
        self
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    /// Drop the cached discovery result. The next call rescans.
    pub fn refresh(&mut self) {
        self.cached = OnceLock::new();
    }

    /// Every installation found. An empty set is not an error.
    pub fn discover_installations(&self) -> &BTreeSet<Installation> {
        self.cached.get_or_init(|| {
            let found = self.scan();
            debug!("discovered {} solver installation(s)", found.len());
            found
        })
    }

    fn scan(&self) -> BTreeSet<Installation> {
        let mut found = BTreeSet::new();

        for (ver, root) in self.env.install_roots() {
            let Ok(version) = SolverVersion::new(ver) else {
                debug!("ignoring AWP_ROOT{ver}: unsupported version");
                continue;
            };
            if let Some(exe) = executable_in(&root, version) {
                found.insert(Installation::from_path(version, exe));
            }
        }

        for root in &self.search_roots {
            scan_root(root, &mut found);
            scan_root(&root.join(STUDENT_DIR), &mut found);
        }

        if let Some(cache) = &self.cache_file {
            read_cache(cache, &mut found);
        }

        found
    }

    /// `Some` when `sbatch` is on the snapshot's `PATH`.
    pub fn detect_scheduler_environment(&self) -> Option<SchedulerInfo> {
        let sbatch = self.env.which("sbatch")?;
        let bin_dir = sbatch.parent()?.to_path_buf();
        Some(SchedulerInfo {
            bin_dir,
            allocation: self.allocation(),
        })
    }

    fn allocation(&self) -> Allocation {
        let on_hpc = self
            .env
            .get(env::RUNNING_ON_HPC_VAR)
            .and_then(env::parse_bool)
            .unwrap_or(true);
        if !on_hpc {
            return Allocation::default();
        }

        let num = |key: &str| self.env.get(key).and_then(|v| v.trim().parse::<u32>().ok());
        let cores = match (num("SLURM_NTASKS"), num("SLURM_CPUS_PER_TASK")) {
            (Some(tasks), Some(cpus)) => Some(tasks.saturating_mul(cpus)),
            (Some(tasks), None) => Some(tasks),
            (None, cpus) => cpus,
        };
        Allocation {
            job_id: self.env.get("SLURM_JOB_ID").map(str::to_string),
            cores,
            mem_mb: self
                .env
                .get("SLURM_MEM_PER_NODE")
                .and_then(|v| v.trim().parse().ok()),
        }
    }

    /// Path of the provisioning integration's configuration file, if one is
    /// configured and present.
    pub fn provisioning_config(&self) -> Option<PathBuf> {
        let path = PathBuf::from(self.env.get(env::PROVISIONING_CONFIG_VAR)?);
        if path.is_file() {
            Some(path)
        } else {
            warn!(
                "{} points to {}, which does not exist",
                env::PROVISIONING_CONFIG_VAR,
                path.display()
            );
            None
        }
    }
}

fn executable_in(version_root: &Path, version: SolverVersion) -> Option<PathBuf> {
    let bin = version_root.join("ansys").join("bin");
    [format!("ansys{version}"), "mapdl".to_string()]
        .into_iter()
        .map(|name| bin.join(name))
        .find(|p| p.is_file())
}

fn scan_root(root: &Path, found: &mut BTreeSet<Installation>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(ver) = name
            .to_str()
            .and_then(|n| n.strip_prefix('v'))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(version) = SolverVersion::new(ver) else {
            continue;
        };
        if let Some(exe) = executable_in(&entry.path(), version) {
            found.insert(Installation::from_path(version, exe));
        }
    }
}

fn read_cache(cache: &Path, found: &mut BTreeSet<Installation>) {
    let contents = match std::fs::read_to_string(cache) {
        Ok(c) => c,
        Err(e) => {
            debug!("installation cache {} unreadable: {e}", cache.display());
            return;
        }
    };
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let path = PathBuf::from(line);
        if !path.is_file() {
            debug!("cached executable {line} no longer exists");
            continue;
        }
        match version_from_path(&path) {
            Some(version) => {
                found.insert(Installation::from_path(version, path));
            }
            None => debug!("cannot tell the version of cached executable {line}"),
        }
    }
}

/// Pull the version out of a path such as `/ansys_inc/v242/ansys/bin/mapdl`.
pub(crate) fn version_from_path(path: &Path) -> Option<SolverVersion> {
    path.components().rev().find_map(|c| {
        let part = c.as_os_str().to_str()?;
        let digits = part
            .strip_prefix('v')
            .or_else(|| part.strip_prefix("ansys"))?;
        if digits.len() != 3 {
            return None;
        }
        SolverVersion::new(digits.parse().ok()?).ok()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::fs;

    fn install(root: &Path, ver: u32, name: &str) -> PathBuf {
        let bin = root.join(format!("v{ver}")).join("ansys").join("bin");
        fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(name);
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        exe
    }

    fn versions(prober: &EnvironmentProber) -> Vec<(u32, bool)> {
        prober
            .discover_installations()
            .iter()
            .map(|i| (i.version.as_u32(), i.student))
            .collect()
    }

    #[test]
    fn test_discovers_standard_and_student_roots() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), 231, "ansys231");
        install(dir.path(), 242, "mapdl");
        install(&dir.path().join(STUDENT_DIR), 242, "ansys242");
        // not a version directory
        fs::create_dir_all(dir.path().join("shared_files")).unwrap();

        let prober = EnvironmentProber::new(EnvSnapshot::default())
            .with_search_roots(vec![dir.path().to_path_buf()]);
        assert_eq!(
            versions(&prober),
            vec![(231, false), (242, false), (242, true)]
        );
    }

    #[test]
    fn test_empty_discovery_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let prober = EnvironmentProber::new(EnvSnapshot::default())
            .with_search_roots(vec![dir.path().join("missing")]);
        assert!(prober.discover_installations().is_empty());
    }

    #[test]
    fn test_awp_root_variables() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), 222, "ansys222");
        let env = EnvSnapshot::from_pairs([(
            "AWP_ROOT222",
            dir.path().join("v222").to_str().unwrap(),
        )]);
        let prober = EnvironmentProber::new(env).with_search_roots(vec![]);
        let found: Vec<_> = prober.discover_installations().iter().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, exe);
    }

    #[test]
    fn test_cache_file_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(&dir.path().join("custom"), 241, "mapdl");
        let cache = dir.path().join("installs.txt");
        fs::write(
            &cache,
            format!("{}\n\n/gone/v232/ansys/bin/mapdl\n", exe.display()),
        )
        .unwrap();

        let mut prober = EnvironmentProber::new(EnvSnapshot::default())
            .with_search_roots(vec![])
            .with_cache_file(&cache);
        assert_eq!(versions(&prober), vec![(241, false)]);

        // cached until refreshed
        fs::write(&cache, "").unwrap();
        assert_eq!(versions(&prober), vec![(241, false)]);
        prober.refresh();
        assert!(prober.discover_installations().is_empty());
    }

    #[test]
    fn test_version_from_path() {
        assert_eq!(
            version_from_path(Path::new("/ansys_inc/v242/ansys/bin/mapdl")).map(|v| v.as_u32()),
            Some(242)
        );
        assert_eq!(
            version_from_path(Path::new("/opt/x/ansys211")).map(|v| v.as_u32()),
            Some(211)
        );
        assert_eq!(version_from_path(Path::new("/opt/solver/bin/run")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_scheduler_environment() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sbatch = dir.path().join("sbatch");
        fs::write(&sbatch, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&sbatch, fs::Permissions::from_mode(0o755)).unwrap();

        let env = EnvSnapshot::from_pairs([
            ("PATH", dir.path().to_str().unwrap()),
            ("SLURM_JOB_ID", "77"),
            ("SLURM_NTASKS", "4"),
            ("SLURM_CPUS_PER_TASK", "2"),
            ("SLURM_MEM_PER_NODE", "8000"),
        ]);
        let info = EnvironmentProber::new(env.clone())
            .detect_scheduler_environment()
            .unwrap();
        assert_eq!(info.bin_dir, dir.path());
        assert_eq!(info.allocation.job_id.as_deref(), Some("77"));
        assert_eq!(info.allocation.cores, Some(8));
        assert_eq!(info.allocation.mem_mb, Some(8000));

        let off = EnvironmentProber::new(env.with("PYMAPDL_RUNNING_ON_HPC", "false"))
            .detect_scheduler_environment()
            .unwrap();
        assert_eq!(off.allocation, Allocation::default());

        let none = EnvironmentProber::new(EnvSnapshot::from_pairs([("PATH", "/nonexistent")]));
        assert!(none.detect_scheduler_environment().is_none());
    }

    #[test]
    fn test_provisioning_config_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("pim.json");
        fs::write(&cfg, "{}").unwrap();

        let present = EnvironmentProber::new(EnvSnapshot::from_pairs([(
            env::PROVISIONING_CONFIG_VAR,
            cfg.to_str().unwrap(),
        )]));
        assert_eq!(present.provisioning_config(), Some(cfg.clone()));

        let missing = EnvironmentProber::new(EnvSnapshot::from_pairs([(
            env::PROVISIONING_CONFIG_VAR,
            "/nonexistent/pim.json",
        )]));
        assert_eq!(missing.provisioning_config(), None);
    }
}
