// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Batch scheduler integration. Slurm is the only implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use tokio::process::Command;

use crate::error::{LaunchError, Result};
use crate::resolver::JobResources;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Configuring,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Other(String),
}

impl JobState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => JobState::Pending,
            "CONFIGURING" => JobState::Configuring,
            "RUNNING" => JobState::Running,
            "COMPLETING" => JobState::Completing,
            "COMPLETED" => JobState::Completed,
            "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" => JobState::Failed,
            "CANCELLED" | "PREEMPTED" | "DEADLINE" => JobState::Cancelled,
            "TIMEOUT" => JobState::Timeout,
            other => JobState::Other(other.to_string()),
        }
    }

    /// The job is over and will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completing
                | JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Configuring => "CONFIGURING",
            JobState::Running => "RUNNING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::Other(s) => s,
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub batch_host: Option<String>,
}

/// Everything needed to put the solver in the queue.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub jobname: String,
    pub working_dir: PathBuf,
    pub resources: JobResources,
    pub options: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl JobSubmission {
    /// Where the job's stdout and stderr land. `%j` is filled in by the
    /// scheduler.
    pub fn output_pattern(&self) -> PathBuf {
        self.working_dir.join(format!("{}.%j.out", self.jobname))
    }

    pub fn output_file(&self, job: &JobId) -> PathBuf {
        self.working_dir
            .join(format!("{}.{}.out", self.jobname, job))
    }

    pub fn sbatch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--job-name".to_string(),
            self.jobname.clone(),
            "--chdir".to_string(),
            self.working_dir.display().to_string(),
            "--output".to_string(),
            self.output_pattern().display().to_string(),
            "--nodes".to_string(),
            self.resources.nodes.to_string(),
            "--ntasks".to_string(),
            self.resources.cores.to_string(),
        ];
        if let Some(mem) = self.resources.mem_mb {
            args.push("--mem".to_string());
            args.push(format!("{mem}M"));
        }
        for (key, value) in &self.options {
            let key = key.trim_start_matches('-');
            if matches!(key, "nodes" | "N") {
                continue;
            }
            match (key.len(), value.is_empty()) {
                (1, true) => args.push(format!("-{key}")),
                (1, false) => {
                    args.push(format!("-{key}"));
                    args.push(value.clone());
                }
                (_, true) => args.push(format!("--{key}")),
                (_, false) => args.push(format!("--{key}={value}")),
            }
        }
        args.push("--wrap".to_string());
        args.push(shell_join(&self.command));
        args
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn shell_join(command: &[String]) -> String {
    command
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn submit(&self, job: &JobSubmission) -> Result<JobId>;
    async fn status(&self, job: &JobId) -> Result<JobStatus>;
    async fn cancel(&self, job: &JobId) -> Result<()>;
}

/// Drives `sbatch`, `scontrol` and `scancel`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    bin_dir: PathBuf,
}

impl SlurmScheduler {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    async fn run(
        &self,
        program: &Path,
        args: &[String],
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = env {
            cmd.env_clear().envs(env);
        }
        debug!("running {} {}", program.display(), args.join(" "));
        let output = cmd
            .output()
            .await
            .map_err(|e| LaunchError::spawn(program.display().to_string(), e))?;
        if !output.status.success() {
            return Err(LaunchError::spawn(
                program.display().to_string(),
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[allow(clippy::expect_used)]
static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("invalid regex"));
#[allow(clippy::expect_used)]
static JOB_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"JobState=(\S+)").expect("invalid regex"));
#[allow(clippy::expect_used)]
static BATCH_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BatchHost=(\S+)").expect("invalid regex"));

pub fn parse_job_id(sbatch_stdout: &str) -> Result<JobId> {
    JOB_ID_RE
        .captures(sbatch_stdout)
        .and_then(|c| c.get(1))
        .map(|m| JobId(m.as_str().to_string()))
        .ok_or_else(|| {
            LaunchError::spawn(
                "sbatch",
                format!("no job id in output: {}", sbatch_stdout.trim()),
            )
        })
}

pub fn parse_job_status(scontrol_stdout: &str) -> Result<JobStatus> {
    let state = JOB_STATE_RE
        .captures(scontrol_stdout)
        .and_then(|c| c.get(1))
        .map(|m| JobState::parse(m.as_str()))
        .ok_or_else(|| LaunchError::spawn("scontrol", "no JobState in output"))?;
    let batch_host = BATCH_HOST_RE
        .captures(scontrol_stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|h| !h.is_empty() && h != "(null)");
    Ok(JobStatus { state, batch_host })
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit(&self, job: &JobSubmission) -> Result<JobId> {
        let stdout = self
            .run(&self.tool("sbatch"), &job.sbatch_args(), Some(&job.env))
            .await?;
        let id = parse_job_id(&stdout)?;
        info!("[{}] submitted batch job {id}", job.jobname);
        Ok(id)
    }

    async fn status(&self, job: &JobId) -> Result<JobStatus> {
        let args = ["show", "jobid", "-dd", job.0.as_str()].map(String::from);
        let stdout = self.run(&self.tool("scontrol"), &args, None).await?;
        parse_job_status(&stdout)
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        self.run(&self.tool("scancel"), &[job.0.clone()], None)
            .await
            .map(|_| ())
    }
}
