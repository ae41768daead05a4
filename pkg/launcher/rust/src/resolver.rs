// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Turns a [`LaunchConfiguration`] into a validated [`LaunchPlan`].
//!
//! Resolution is a pure function of the configuration and the prober's
//! read-only view of the host. Nothing is spawned, bound or written here.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::config::{LaunchConfiguration, LaunchMode};
use crate::env::{self, EnvSnapshot};
use crate::error::{LaunchError, Result};
use crate::prober::{self, EnvironmentProber, Installation, SchedulerInfo};
use crate::version::SolverVersion;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 50052;
pub const DEFAULT_NPROC: u32 = 2;

pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_HPC_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DELEGATED_TIMEOUT: Duration = Duration::from_secs(120);

const PARALLEL_SWITCHES: &[&str] = &["-smp", "-dmp", "-mpi", "-dis"];
const DISTRIBUTED_SWITCHES: &[&str] = &["-dmp", "-mpi", "-dis"];

/// Compute resources requested from the batch scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResources {
    pub nodes: u32,
    pub cores: u32,
    pub mem_mb: Option<u64>,
}

/// The validated form of a [`LaunchConfiguration`]. Never mutated after
/// [`resolve`] returns it.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub mode: LaunchMode,
    pub exec_path: Option<PathBuf>,
    pub version: Option<SolverVersion>,
    pub student: bool,
    pub host: String,
    /// Pinned port. `None` lets the allocator choose.
    pub port: Option<u16>,
    pub working_dir: Option<PathBuf>,
    pub jobname: String,
    pub nproc: u32,
    pub ram_mb: Option<u64>,
    pub distributed: Option<bool>,
    /// Exactly as configured.
    pub additional_switches: Vec<String>,
    pub timeout: Duration,
    pub env_overrides: HashMap<String, String>,
    pub replace_env: bool,
    /// The complete environment handed to the child.
    pub env: BTreeMap<String, String>,
    pub override_lock: bool,
    pub clear_on_connect: bool,
    pub output_file: Option<PathBuf>,
    pub probe_port: bool,
    pub scheduler: Option<SchedulerInfo>,
    pub scheduler_options: BTreeMap<String, String>,
    pub resources: Option<JobResources>,
    pub provisioning_config: Option<PathBuf>,
}

impl LaunchPlan {
    /// The parallel-mode switch added ahead of the caller's switches.
    fn parallel_switch(&self) -> Option<&'static str> {
        match self.distributed {
            Some(true) => Some("-dis"),
            Some(false) => Some("-smp"),
            None if self.student && !has_any(&self.additional_switches, PARALLEL_SWITCHES) => {
                Some("-smp")
            }
            None => None,
        }
    }

    /// Arguments after the executable. `port` adds the gRPC server flags.
    pub fn args(&self, port: Option<u16>) -> Vec<String> {
        let mut args = vec![
            "-j".to_string(),
            self.jobname.clone(),
            "-np".to_string(),
            self.nproc.to_string(),
        ];
        if let Some(ram) = self.ram_mb {
            args.push("-m".to_string());
            args.push(ram.to_string());
        }
        if let Some(sw) = self.parallel_switch() {
            args.push(sw.to_string());
        }
        args.extend(self.additional_switches.iter().cloned());
        if let Some(port) = port {
            args.push("-port".to_string());
            args.push(port.to_string());
            args.push("-grpc".to_string());
        }
        args
    }

    /// The full command line, executable first. Empty for plans that spawn
    /// nothing.
    pub fn command(&self, port: Option<u16>) -> Vec<String> {
        match &self.exec_path {
            Some(exe) => {
                let mut cmd = vec![exe.display().to_string()];
                cmd.extend(self.args(port));
                cmd
            }
            None => Vec::new(),
        }
    }

    pub fn lock_file(&self) -> Option<PathBuf> {
        self.working_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.lock", self.jobname)))
    }
}

fn has_any(switches: &[String], wanted: &[&str]) -> bool {
    switches
        .iter()
        .any(|s| wanted.iter().any(|w| s.eq_ignore_ascii_case(w)))
}

/// Validate and normalize `config` against what `prober` sees.
pub fn resolve(config: &LaunchConfiguration, prober: &EnvironmentProber) -> Result<LaunchPlan> {
    let env = prober.env();
    let mode = select_mode(config, prober)?;
    debug!("[{}] resolving {mode} launch", config.jobname);

    let plan = match mode {
        LaunchMode::Remote => resolve_remote(config, env)?,
        LaunchMode::Delegated => resolve_delegated(config, prober)?,
        LaunchMode::LocalGrpc | LaunchMode::LocalConsole | LaunchMode::Hpc => {
            resolve_spawned(config, prober, mode)?
        }
    };
    Ok(plan)
}

fn start_instance(config: &LaunchConfiguration, env: &EnvSnapshot) -> Result<Option<bool>> {
    let from_env = match env.get(env::START_INSTANCE_VAR) {
        Some(raw) => Some(env::parse_bool(raw).ok_or_else(|| {
            LaunchError::config(format!(
                "{} must be 'true' or 'false', got {raw:?}",
                env::START_INSTANCE_VAR
            ))
        })?),
        None => None,
    };
    Ok(config.start_instance.or(from_env))
}

fn exec_pinned(config: &LaunchConfiguration, env: &EnvSnapshot) -> bool {
    config.exec_path.is_some() || env.get(env::EXEC_PATH_VAR).is_some()
}

fn select_mode(config: &LaunchConfiguration, prober: &EnvironmentProber) -> Result<LaunchMode> {
    let env = prober.env();
    let start = start_instance(config, env)?;

    if let Some(mode) = config.mode {
        match (mode, start) {
            (LaunchMode::Remote, Some(true)) => {
                return Err(LaunchError::config(
                    "mode 'remote' conflicts with start_instance=true",
                ));
            }
            (m, Some(false)) if m != LaunchMode::Remote => {
                return Err(LaunchError::config(format!(
                    "mode '{m}' starts a server but start_instance=false asks to attach to one"
                )));
            }
            _ => {}
        }
        return Ok(mode);
    }

    if start == Some(false)
        || (start.is_none() && (config.host.is_some() || env.get(env::IP_VAR).is_some()))
    {
        return Ok(LaunchMode::Remote);
    }

    if !exec_pinned(config, env) && prober.provisioning_config().is_some() {
        return Ok(LaunchMode::Delegated);
    }

    // grpc or console is decided once the version is known
    Ok(LaunchMode::LocalGrpc)
}

fn parse_port(raw: u32) -> Result<u16> {
    u16::try_from(raw)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| LaunchError::config(format!("port {raw} is outside 1-65535")))
}

fn port_preference(config: &LaunchConfiguration, env: &EnvSnapshot) -> Result<Option<u16>> {
    if let Some(port) = config.port {
        return parse_port(port).map(Some);
    }
    match env.get(env::PORT_VAR) {
        Some(raw) => {
            let port: u32 = raw.trim().parse().map_err(|_| {
                LaunchError::config(format!("{} is not a port: {raw:?}", env::PORT_VAR))
            })?;
            parse_port(port).map(Some)
        }
        None => Ok(None),
    }
}

fn base_plan(config: &LaunchConfiguration, mode: LaunchMode, timeout: Duration) -> LaunchPlan {
    LaunchPlan {
        mode,
        exec_path: None,
        version: config.version,
        student: false,
        host: DEFAULT_HOST.to_string(),
        port: None,
        working_dir: None,
        jobname: config.jobname.clone(),
        nproc: config.nproc.unwrap_or(DEFAULT_NPROC),
        ram_mb: config.ram_mb,
        distributed: config.distributed,
        additional_switches: config.additional_switches.clone(),
        timeout: config.timeout.unwrap_or(timeout),
        env_overrides: config.env_overrides.clone(),
        replace_env: config.replace_env,
        env: BTreeMap::new(),
        override_lock: config.override_lock,
        clear_on_connect: config.clear_on_connect,
        output_file: config.output_file.clone(),
        probe_port: config.probe_port,
        scheduler: None,
        scheduler_options: config.scheduler_options.clone(),
        resources: None,
        provisioning_config: None,
    }
}

fn resolve_remote(config: &LaunchConfiguration, env: &EnvSnapshot) -> Result<LaunchPlan> {
    if let Some(option) = config.options_outside_remote_allow_list().first() {
        return Err(LaunchError::config(format!(
            "option '{option}' cannot be used when connecting to a server that was started elsewhere"
        )));
    }
    let mut plan = base_plan(config, LaunchMode::Remote, DEFAULT_REMOTE_TIMEOUT);
    plan.host = config
        .host
        .clone()
        .or_else(|| env.get(env::IP_VAR).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    plan.port = Some(port_preference(config, env)?.unwrap_or(DEFAULT_PORT));
    Ok(plan)
}

fn resolve_delegated(
    config: &LaunchConfiguration,
    prober: &EnvironmentProber,
) -> Result<LaunchPlan> {
    if config.exec_path.is_some() {
        return Err(LaunchError::config(
            "exec_path cannot be combined with delegated provisioning",
        ));
    }
    let provisioning = prober.provisioning_config().ok_or_else(|| {
        LaunchError::config(format!(
            "delegated mode needs {} to name a provisioning configuration file",
            env::PROVISIONING_CONFIG_VAR
        ))
    })?;
    let mut plan = base_plan(config, LaunchMode::Delegated, DEFAULT_DELEGATED_TIMEOUT);
    plan.version = version_hint(config, prober.env())?;
    plan.provisioning_config = Some(provisioning);
    Ok(plan)
}

fn version_hint(config: &LaunchConfiguration, env: &EnvSnapshot) -> Result<Option<SolverVersion>> {
    match config.version {
        Some(v) => Ok(Some(v)),
        None => match env.get(env::VERSION_VAR) {
            Some(raw) => SolverVersion::parse_hint(raw),
            None => Ok(None),
        },
    }
}

struct ResolvedExecutable {
    path: PathBuf,
    version: Option<SolverVersion>,
    student: bool,
}

fn absolute_file(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(LaunchError::missing_executable(path.to_path_buf()));
    }
    std::path::absolute(path)
        .map_err(|e| LaunchError::ExecutableNotFound(format!("{}: {e}", path.display())))
}

fn pick_installation(
    installations: impl Iterator<Item = Installation>,
    prefer_student: bool,
) -> Option<Installation> {
    let (students, regular): (Vec<_>, Vec<_>) = installations.partition(|i| i.student);
    let newest = |v: Vec<Installation>| v.into_iter().max_by_key(|i| i.version);
    if prefer_student {
        newest(students).or_else(|| newest(regular))
    } else {
        newest(regular).or_else(|| newest(students))
    }
}

fn resolve_executable(
    config: &LaunchConfiguration,
    prober: &EnvironmentProber,
) -> Result<ResolvedExecutable> {
    let env = prober.env();
    let hint = version_hint(config, env)?;

    let pinned = config
        .exec_path
        .clone()
        .or_else(|| env.get(env::EXEC_PATH_VAR).map(PathBuf::from));
    if let Some(path) = pinned {
        let path = absolute_file(&path)?;
        let version = hint.or_else(|| prober::version_from_path(&path));
        let student = prober::is_student_path(&path);
        return Ok(ResolvedExecutable {
            path,
            version,
            student,
        });
    }

    if let Some(version) = hint {
        let from_root = env
            .install_roots()
            .into_iter()
            .filter(|(ver, _)| *ver == version.as_u32())
            .find_map(|(_, root)| {
                let bin = root.join("ansys").join("bin");
                [bin.join(format!("ansys{version}")), bin.join("mapdl")]
                    .into_iter()
                    .find(|p| p.is_file())
            });
        if let Some(path) = from_root {
            let student = prober::is_student_path(&path);
            return Ok(ResolvedExecutable {
                path: absolute_file(&path)?,
                version: Some(version),
                student,
            });
        }
    }

    let candidates = prober
        .discover_installations()
        .iter()
        .filter(|i| hint.is_none_or(|v| i.version == v))
        .cloned();
    match pick_installation(candidates, config.student) {
        Some(found) => Ok(ResolvedExecutable {
            path: found.path,
            version: Some(found.version),
            student: found.student,
        }),
        None => Err(LaunchError::ExecutableNotFound(match hint {
            Some(v) => format!(
                "no installation of version {v}; set exec_path, {} or AWP_ROOT{v}",
                env::EXEC_PATH_VAR
            ),
            None => format!(
                "no installation discovered; set exec_path or {}",
                env::EXEC_PATH_VAR
            ),
        })),
    }
}

fn child_env(config: &LaunchConfiguration, env: &EnvSnapshot) -> BTreeMap<String, String> {
    let mut merged = if config.replace_env {
        BTreeMap::new()
    } else {
        env.vars().clone()
    };
    merged.insert(env::NODIAG_VAR.to_string(), "TRUE".to_string());
    merged.extend(
        config
            .env_overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    merged
}

fn planned_working_dir(config: &LaunchConfiguration) -> Result<PathBuf> {
    match &config.working_dir {
        Some(dir) => std::path::absolute(dir).map_err(|e| {
            LaunchError::config(format!("working_dir {}: {e}", dir.display()))
        }),
        None => {
            let unique = uuid::Uuid::new_v4().simple();
            Ok(std::env::temp_dir().join(format!("mapdl_{unique}")))
        }
    }
}

fn check_switch_conflicts(config: &LaunchConfiguration) -> Result<()> {
    match config.distributed {
        Some(true) if has_any(&config.additional_switches, &["-smp"]) => Err(LaunchError::config(
            "distributed=true cannot be combined with the '-smp' switch",
        )),
        Some(false) if has_any(&config.additional_switches, DISTRIBUTED_SWITCHES) => {
            Err(LaunchError::config(
                "distributed=false cannot be combined with a distributed switch (-dis, -dmp, -mpi)",
            ))
        }
        _ => Ok(()),
    }
}

fn resolve_spawned(
    config: &LaunchConfiguration,
    prober: &EnvironmentProber,
    requested: LaunchMode,
) -> Result<LaunchPlan> {
    let env = prober.env();
    check_switch_conflicts(config)?;

    let scheduler = if requested == LaunchMode::Hpc {
        Some(check_hpc(config, prober)?)
    } else {
        if let Some(host) = &config.host
            && !matches!(host.as_str(), "localhost" | "127.0.0.1")
        {
            return Err(LaunchError::config(format!(
                "host {host} is not local; use mode 'remote' to connect to another machine"
            )));
        }
        None
    };

    let port = port_preference(config, env)?;
    let exe = resolve_executable(config, prober)?;

    let mode = match (requested, exe.version) {
        (LaunchMode::LocalGrpc | LaunchMode::Hpc, Some(v)) if !v.has_grpc() => {
            if config.mode.is_some() {
                return Err(LaunchError::config(format!(
                    "version {v} has no gRPC server; gRPC needs {} or newer",
                    crate::version::GRPC_MIN_VERSION
                )));
            }
            LaunchMode::LocalConsole
        }
        (m, _) => m,
    };

    if mode == LaunchMode::LocalConsole && !cfg!(unix) {
        return Err(LaunchError::config(
            "console mode is only available on Linux",
        ));
    }

    let default_timeout = if mode == LaunchMode::Hpc {
        DEFAULT_HPC_TIMEOUT
    } else {
        DEFAULT_LOCAL_TIMEOUT
    };
    let mut plan = base_plan(config, mode, default_timeout);
    plan.exec_path = Some(exe.path);
    plan.version = exe.version;
    plan.student = exe.student;
    plan.port = port;
    plan.working_dir = Some(planned_working_dir(config)?);
    plan.env = child_env(config, env);

    let env_nproc = env
        .get(env::NPROC_VAR)
        .map(|raw| {
            raw.trim().parse::<u32>().map_err(|_| {
                LaunchError::config(format!("{} is not a number: {raw:?}", env::NPROC_VAR))
            })
        })
        .transpose()?;

    if let Some(info) = scheduler {
        plan.nproc = config
            .nproc
            .or(env_nproc)
            .or(info.allocation.cores)
            .unwrap_or(DEFAULT_NPROC);
        plan.ram_mb = config.ram_mb.or(info.allocation.mem_mb);
        plan.port = Some(port.unwrap_or(DEFAULT_PORT));
        plan.resources = Some(JobResources {
            nodes: node_count(&config.scheduler_options)?,
            cores: plan.nproc,
            mem_mb: plan.ram_mb,
        });
        plan.scheduler = Some(info);
    } else {
        plan.nproc = config.nproc.or(env_nproc).unwrap_or(DEFAULT_NPROC);
    }

    if plan.nproc == 0 {
        return Err(LaunchError::config("nproc must be at least 1"));
    }
    Ok(plan)
}

fn check_hpc(config: &LaunchConfiguration, prober: &EnvironmentProber) -> Result<SchedulerInfo> {
    if config.host.is_some() {
        return Err(LaunchError::config(
            "host cannot be set for hpc mode; the scheduler picks the node",
        ));
    }
    if config
        .scheduler_options
        .keys()
        .any(|k| k.trim_start_matches('-') == "wrap")
    {
        return Err(LaunchError::config(
            "scheduler option 'wrap' is reserved for the solver command",
        ));
    }
    if !config.scheduler_options.is_empty() && config.nproc.is_none() {
        return Err(LaunchError::config(
            "nproc must be set explicitly when scheduler_options are given",
        ));
    }
    prober.detect_scheduler_environment().ok_or_else(|| {
        LaunchError::config("hpc mode requested but no 'sbatch' was found on PATH")
    })
}

fn node_count(options: &BTreeMap<String, String>) -> Result<u32> {
    let Some(raw) = options
        .iter()
        .find(|(k, _)| matches!(k.trim_start_matches('-'), "nodes" | "N"))
        .map(|(_, v)| v)
    else {
        return Ok(1);
    };
    raw.trim()
        .parse()
        .map_err(|_| LaunchError::config(format!("scheduler option nodes={raw:?} is not a number")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        exe: PathBuf,
    }

    fn install(root: &Path, ver: u32) -> PathBuf {
        let bin = root.join(format!("v{ver}")).join("ansys").join("bin");
        fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(format!("ansys{ver}"));
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        exe
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ansys_inc");
        let exe = dir.path().join("run");
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        Fixture {
            root,
            exe,
            _dir: dir,
        }
    }

    fn prober(fx: &Fixture, env: EnvSnapshot) -> EnvironmentProber {
        EnvironmentProber::new(env).with_search_roots(vec![fx.root.clone()])
    }

    fn local(fx: &Fixture) -> LaunchConfiguration {
        let mut config = LaunchConfiguration::new(LaunchMode::LocalGrpc);
        config.exec_path = Some(fx.exe.clone());
        config
    }

    fn config_err(r: Result<LaunchPlan>) -> String {
        match r {
            Err(LaunchError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_with_exec_path_is_rejected() {
        let fx = fixture();
        let mut config = LaunchConfiguration::new(LaunchMode::Remote);
        config.host = Some("10.0.0.5".to_string());
        config.exec_path = Some(fx.exe.clone());
        let msg = config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
        assert!(msg.contains("exec_path"), "{msg}");
    }

    #[test]
    fn test_remote_names_first_disallowed_option() {
        let fx = fixture();
        let mut config = LaunchConfiguration::new(LaunchMode::Remote);
        config.additional_switches = vec!["-b".to_string()];
        let msg = config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
        assert!(msg.contains("additional_switches"), "{msg}");
    }

    #[test]
    fn test_remote_defaults_from_env() {
        let fx = fixture();
        let env = EnvSnapshot::from_pairs([("PYMAPDL_IP", "10.1.2.3"), ("PYMAPDL_PORT", "50070")]);
        let plan = resolve(&LaunchConfiguration::default(), &prober(&fx, env)).unwrap();
        assert_eq!(plan.mode, LaunchMode::Remote);
        assert_eq!(plan.host, "10.1.2.3");
        assert_eq!(plan.port, Some(50070));
        assert_eq!(plan.timeout, DEFAULT_REMOTE_TIMEOUT);
        assert!(plan.command(plan.port).is_empty());
    }

    #[test]
    fn test_start_instance_env() {
        let fx = fixture();
        let env = EnvSnapshot::from_pairs([("PYMAPDL_START_INSTANCE", "FALSE")]);
        let plan = resolve(&LaunchConfiguration::default(), &prober(&fx, env)).unwrap();
        assert_eq!(plan.mode, LaunchMode::Remote);
        assert_eq!(plan.host, DEFAULT_HOST);
        assert_eq!(plan.port, Some(DEFAULT_PORT));

        let bad = EnvSnapshot::from_pairs([("PYMAPDL_START_INSTANCE", "maybe")]);
        let msg = config_err(resolve(&LaunchConfiguration::default(), &prober(&fx, bad)));
        assert!(msg.contains("PYMAPDL_START_INSTANCE"), "{msg}");
    }

    #[test]
    fn test_contradictory_modes() {
        let fx = fixture();
        let mut config = local(&fx);
        config.start_instance = Some(false);
        config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));

        let mut config = LaunchConfiguration::new(LaunchMode::Remote);
        config.start_instance = Some(true);
        config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
    }

    #[test]
    fn test_port_range() {
        let fx = fixture();
        for bad in [0, 65_536, 100_000] {
            let mut config = local(&fx);
            config.port = Some(bad);
            let msg = config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
            assert!(msg.contains(&bad.to_string()), "{msg}");
        }
        let mut config = local(&fx);
        config.port = Some(65_535);
        assert_eq!(
            resolve(&config, &prober(&fx, EnvSnapshot::default()))
                .unwrap()
                .port,
            Some(65_535)
        );
    }

    #[test]
    fn test_plan_carries_unnormalized_fields() {
        let fx = fixture();
        let mut config = local(&fx);
        config.timeout = Some(Duration::from_secs(7));
        config.jobname = "beam".to_string();
        config.ram_mb = Some(1024);
        config.additional_switches = vec!["-b".to_string(), "nolist".to_string()];
        config.env_overrides.insert("FOO".to_string(), "bar".to_string());
        config.override_lock = true;
        config.clear_on_connect = false;
        config.probe_port = true;

        let plan = resolve(&config, &prober(&fx, EnvSnapshot::default())).unwrap();
        assert_eq!(plan.timeout, Duration::from_secs(7));
        assert_eq!(plan.jobname, "beam");
        assert_eq!(plan.ram_mb, Some(1024));
        assert_eq!(plan.additional_switches, config.additional_switches);
        assert_eq!(plan.env_overrides, config.env_overrides);
        assert!(plan.override_lock);
        assert!(!plan.clear_on_connect);
        assert!(plan.probe_port);
        assert_eq!(plan.host, DEFAULT_HOST);
        assert!(plan.exec_path.as_ref().unwrap().is_absolute());
    }

    #[test]
    fn test_default_timeouts() {
        let fx = fixture();
        let plan = resolve(&local(&fx), &prober(&fx, EnvSnapshot::default())).unwrap();
        assert_eq!(plan.timeout, DEFAULT_LOCAL_TIMEOUT);
    }

    #[test]
    fn test_command_assembly() {
        let fx = fixture();
        let mut config = local(&fx);
        config.jobname = "beam".to_string();
        config.nproc = Some(4);
        config.ram_mb = Some(2048);
        config.distributed = Some(true);
        config.additional_switches = vec!["-b".to_string()];
        let plan = resolve(&config, &prober(&fx, EnvSnapshot::default())).unwrap();

        let cmd = plan.command(Some(50060));
        assert_eq!(cmd[0], plan.exec_path.as_ref().unwrap().display().to_string());
        assert_eq!(
            &cmd[1..],
            &[
                "-j", "beam", "-np", "4", "-m", "2048", "-dis", "-b", "-port", "50060", "-grpc"
            ]
        );
        assert_eq!(plan.args(None), vec!["-j", "beam", "-np", "4", "-m", "2048", "-dis", "-b"]);
    }

    #[test]
    fn test_distributed_conflicts() {
        let fx = fixture();
        let mut config = local(&fx);
        config.distributed = Some(true);
        config.additional_switches = vec!["-SMP".to_string()];
        config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));

        config.distributed = Some(false);
        config.additional_switches = vec!["-dmp".to_string()];
        config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
    }

    #[test]
    fn test_executable_precedence() {
        let fx = fixture();
        let discovered = install(&fx.root, 242);
        let from_env_exec = install(&fx.root.join("other"), 232);

        // discovery
        let plan =
            resolve(&LaunchConfiguration::default(), &prober(&fx, EnvSnapshot::default())).unwrap();
        assert_eq!(plan.exec_path, Some(discovered.clone()));
        assert_eq!(plan.version.unwrap().as_u32(), 242);

        // environment variable beats discovery
        let env = EnvSnapshot::from_pairs([("PYMAPDL_MAPDL_EXEC", from_env_exec.to_str().unwrap())]);
        let plan = resolve(&LaunchConfiguration::default(), &prober(&fx, env.clone())).unwrap();
        assert_eq!(plan.exec_path, Some(from_env_exec));
        assert_eq!(plan.version.unwrap().as_u32(), 232);

        // explicit argument beats both
        let plan = resolve(&local(&fx), &prober(&fx, env)).unwrap();
        assert_eq!(plan.exec_path, Some(fx.exe.clone()));
        assert_eq!(plan.version, None);
    }

    #[test]
    fn test_awp_root_for_requested_version() {
        let fx = fixture();
        install(&fx.root, 242);
        let custom = fx.root.join("custom");
        let exe = install(&custom, 232);
        let env = EnvSnapshot::from_pairs([(
            "AWP_ROOT232",
            custom.join("v232").to_str().unwrap(),
        )]);
        let mut config = LaunchConfiguration::default();
        config.version = Some(SolverVersion::new(232).unwrap());
        let plan = resolve(&config, &prober(&fx, env)).unwrap();
        assert_eq!(plan.exec_path, Some(exe));
    }

    #[test]
    fn test_student_preference_and_forced_smp() {
        let fx = fixture();
        install(&fx.root, 241);
        let student = install(&fx.root.join("ANSYS Student"), 232);

        let plan =
            resolve(&LaunchConfiguration::default(), &prober(&fx, EnvSnapshot::default())).unwrap();
        assert_eq!(plan.version.unwrap().as_u32(), 241);
        assert!(!plan.args(None).contains(&"-smp".to_string()));

        let mut config = LaunchConfiguration::default();
        config.student = true;
        let plan = resolve(&config, &prober(&fx, EnvSnapshot::default())).unwrap();
        assert_eq!(plan.exec_path, Some(student));
        assert!(plan.student);
        assert!(plan.args(None).contains(&"-smp".to_string()));

        config.additional_switches = vec!["-dmp".to_string()];
        let plan = resolve(&config, &prober(&fx, EnvSnapshot::default())).unwrap();
        assert!(!plan.args(None).contains(&"-smp".to_string()));
    }

    #[test]
    fn test_no_executable_anywhere() {
        let fx = fixture();
        let err = resolve(&LaunchConfiguration::default(), &prober(&fx, EnvSnapshot::default()))
            .unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound(_)), "{err}");

        let mut config = LaunchConfiguration::default();
        config.exec_path = Some(PathBuf::from("/nonexistent/solver"));
        let err = resolve(&config, &prober(&fx, EnvSnapshot::default())).unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound(_)), "{err}");
    }

    #[test]
    fn test_legacy_version_falls_back_to_console() {
        let fx = fixture();
        install(&fx.root, 202);
        let plan =
            resolve(&LaunchConfiguration::default(), &prober(&fx, EnvSnapshot::default())).unwrap();
        assert_eq!(plan.mode, LaunchMode::LocalConsole);

        let config = LaunchConfiguration::new(LaunchMode::LocalGrpc);
        let msg = config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
        assert!(msg.contains("gRPC"), "{msg}");
    }

    #[test]
    fn test_env_merge_overrides_win() {
        let fx = fixture();
        let env = EnvSnapshot::from_pairs([("HOME", "/root"), ("ANS_CMD_NODIAG", "FALSE")]);
        let mut config = local(&fx);
        config.env_overrides.insert("HOME".to_string(), "/work".to_string());
        let plan = resolve(&config, &prober(&fx, env.clone())).unwrap();
        assert_eq!(plan.env.get("HOME").unwrap(), "/work");
        assert_eq!(plan.env.get("ANS_CMD_NODIAG").unwrap(), "TRUE");

        config.replace_env = true;
        config.env_overrides.clear();
        config.env_overrides.insert("ONLY".to_string(), "1".to_string());
        let plan = resolve(&config, &prober(&fx, env)).unwrap();
        assert_eq!(plan.env.len(), 2);
        assert!(plan.env.contains_key("ONLY"));
        assert!(!plan.env.contains_key("HOME"));
    }

    #[test]
    fn test_local_mode_rejects_foreign_host() {
        let fx = fixture();
        let mut config = local(&fx);
        config.host = Some("10.0.0.5".to_string());
        config_err(resolve(&config, &prober(&fx, EnvSnapshot::default())));
        config.host = Some("localhost".to_string());
        assert_eq!(
            resolve(&config, &prober(&fx, EnvSnapshot::default()))
                .unwrap()
                .host,
            DEFAULT_HOST
        );
    }

    #[test]
    fn test_working_dir_planned_when_missing() {
        let fx = fixture();
        let a = resolve(&local(&fx), &prober(&fx, EnvSnapshot::default())).unwrap();
        let b = resolve(&local(&fx), &prober(&fx, EnvSnapshot::default())).unwrap();
        let (a, b) = (a.working_dir.unwrap(), b.working_dir.unwrap());
        assert!(a.starts_with(std::env::temp_dir()));
        assert_ne!(a, b);
        assert!(!a.exists(), "resolution must not create directories");
    }

    #[test]
    fn test_delegated_selected_when_configured() {
        let fx = fixture();
        let cfg = fx.root.parent().unwrap().join("pim.json");
        fs::write(&cfg, "{}").unwrap();
        let env = EnvSnapshot::from_pairs([(
            "ANSYS_PLATFORM_INSTANCEMANAGEMENT_CONFIG",
            cfg.to_str().unwrap(),
        )]);

        let plan = resolve(&LaunchConfiguration::default(), &prober(&fx, env.clone())).unwrap();
        assert_eq!(plan.mode, LaunchMode::Delegated);
        assert_eq!(plan.provisioning_config, Some(cfg));

        // a pinned executable keeps the launch local
        let plan = resolve(&local(&fx), &prober(&fx, env)).unwrap();
        assert_eq!(plan.mode, LaunchMode::LocalGrpc);
    }

    #[cfg(unix)]
    #[test]
    fn test_hpc_checks() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture();
        let bin = fx.root.parent().unwrap().join("slurm");
        fs::create_dir_all(&bin).unwrap();
        let sbatch = bin.join("sbatch");
        fs::write(&sbatch, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&sbatch, fs::Permissions::from_mode(0o755)).unwrap();
        let env = EnvSnapshot::from_pairs([("PATH", bin.to_str().unwrap())]);

        let mut config = local(&fx);
        config.mode = Some(LaunchMode::Hpc);
        let plan = resolve(&config, &prober(&fx, env.clone())).unwrap();
        assert_eq!(plan.timeout, DEFAULT_HPC_TIMEOUT);
        assert_eq!(plan.port, Some(DEFAULT_PORT));
        assert_eq!(
            plan.resources,
            Some(JobResources {
                nodes: 1,
                cores: DEFAULT_NPROC,
                mem_mb: None
            })
        );

        config.scheduler_options.insert("partition".to_string(), "short".to_string());
        let msg = config_err(resolve(&config, &prober(&fx, env.clone())));
        assert!(msg.contains("nproc"), "{msg}");

        config.nproc = Some(8);
        config.scheduler_options.insert("nodes".to_string(), "2".to_string());
        let plan = resolve(&config, &prober(&fx, env.clone())).unwrap();
        assert_eq!(plan.resources.unwrap().nodes, 2);

        config.scheduler_options.insert("wrap".to_string(), "hostname".to_string());
        let msg = config_err(resolve(&config, &prober(&fx, env)));
        assert!(msg.contains("wrap"), "{msg}");

        // no scheduler on PATH
        config.scheduler_options.clear();
        config_err(resolve(
            &config,
            &prober(&fx, EnvSnapshot::from_pairs([("PATH", "/nonexistent")])),
        ));
    }
}
