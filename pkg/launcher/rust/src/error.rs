// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Every way a launch or connection attempt can fail.
///
/// Variants carrying `output_tail` hold the last captured lines of solver
/// output. Callers should show it, not parse it.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("invalid launch configuration: {0}")]
    Configuration(String),

    #[error("no usable MAPDL executable found: {0}")]
    ExecutableNotFound(String),

    #[error("port {port} is unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },

    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error(
        "server did not become ready within {}s{}",
        timeout.as_secs_f64(),
        format_tail(output_tail)
    )]
    ReadinessTimeout {
        timeout: Duration,
        output_tail: String,
    },

    #[error("process exited with {status} before becoming ready{}", format_tail(output_tail))]
    ProcessExited { status: String, output_tail: String },

    #[error(
        "batch job {job_id} did not leave the queue within {}s (last state: {state})",
        timeout.as_secs_f64()
    )]
    SchedulerQueueTimeout {
        job_id: String,
        state: String,
        timeout: Duration,
    },

    #[error("cannot reach server at {host}:{port}: {reason}")]
    RemoteUnreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("launch cancelled")]
    Cancelled,
}

impl LaunchError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        LaunchError::Configuration(msg.into())
    }

    pub(crate) fn spawn(program: impl Into<String>, reason: impl ToString) -> Self {
        LaunchError::Spawn {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn lock_file(path: &std::path::Path) -> Self {
        LaunchError::Configuration(format!(
            "lock file exists at {}; set override_lock or delete it to start the solver",
            path.display()
        ))
    }

    pub(crate) fn missing_executable(path: PathBuf) -> Self {
        LaunchError::ExecutableNotFound(format!("{} is not a file", path.display()))
    }

    /// The captured output attached to the error, if any.
    pub fn output_tail(&self) -> Option<&str> {
        match self {
            LaunchError::ReadinessTimeout { output_tail, .. }
            | LaunchError::ProcessExited { output_tail, .. } => Some(output_tail),
            _ => None,
        }
    }
}

fn format_tail(tail: &str) -> String {
    if tail.trim().is_empty() {
        String::new()
    } else {
        format!("; last output:\n{tail}")
    }
}
