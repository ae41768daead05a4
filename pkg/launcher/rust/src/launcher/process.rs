// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Spawning a local solver and waiting for it to come up.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::{ChildStdin, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::env::LOCK_VAR;
use crate::error::{LaunchError, Result};
use crate::lifecycle::{OwnedProcess, Ownership, ServerHandle};
use crate::output::OutputBuffer;
use crate::port::PortLease;
use crate::readiness::{ReadinessCheck, ReadinessResult, await_ready};
use crate::resolver::LaunchPlan;

const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
const EXIT_WAIT: Duration = Duration::from_secs(1);

pub(crate) struct Spawned {
    pub(crate) process: OwnedProcess,
    pub(crate) output: OutputBuffer,
    pub(crate) stdin: Option<ChildStdin>,
}

/// Create the working directory and clear what a previous run left there.
/// Returns extra variables for the child.
pub(crate) async fn prepare_working_dir(plan: &LaunchPlan) -> Result<Vec<(String, String)>> {
    let Some(dir) = plan.working_dir.as_deref() else {
        return Ok(Vec::new());
    };
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        LaunchError::spawn(
            plan.jobname.clone(),
            format!("cannot create working directory {}: {e}", dir.display()),
        )
    })?;

    let mut extra_env = Vec::new();
    if let Some(lock) = plan.lock_file()
        && lock.exists()
    {
        if !plan.override_lock {
            return Err(LaunchError::lock_file(&lock));
        }
        match tokio::fs::remove_file(&lock).await {
            Ok(()) => info!("[{}] removed stale lock file {}", plan.jobname, lock.display()),
            Err(e) => {
                warn!(
                    "[{}] cannot remove lock file {}: {e}; starting with {LOCK_VAR}=OFF",
                    plan.jobname,
                    lock.display()
                );
                extra_env.push((LOCK_VAR.to_string(), "OFF".to_string()));
            }
        }
    }

    remove_stale_err_files(dir, &plan.jobname).await;
    Ok(extra_env)
}

async fn remove_stale_err_files(dir: &Path, jobname: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(jobname) && name.ends_with(".err") {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!("[{jobname}] removed stale {name}"),
                Err(e) => debug!("[{jobname}] cannot remove {name}: {e}"),
            }
        }
    }
}

/// Start the solver with `args`. Output goes to the returned buffer, either
/// captured from pipes or followed from `output_file`.
pub(crate) fn spawn_solver(
    plan: &LaunchPlan,
    args: &[String],
    extra_env: &[(String, String)],
    console: bool,
) -> Result<Spawned> {
    let exe = plan
        .exec_path
        .as_deref()
        .ok_or_else(|| LaunchError::config("nothing to spawn: no executable in plan"))?;
    let program = exe.display().to_string();

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .env_clear()
        .envs(&plan.env)
        .envs(extra_env.iter().map(|(k, v)| (k, v)))
        .kill_on_drop(true)
        .stdin(if console {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    if let Some(dir) = &plan.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    // earlier runs may have left a marker in the file; only what this
    // process appends counts
    let follow_from = match &plan.output_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    LaunchError::spawn(&program, format!("opening {}: {e}", path.display()))
                })?;
            let start = file
                .metadata()
                .map_err(|e| LaunchError::spawn(&program, e))?
                .len();
            let err = file
                .try_clone()
                .map_err(|e| LaunchError::spawn(&program, e))?;
            cmd.stdout(file).stderr(err);
            Some((path.clone(), start))
        }
        None => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        }
    };

    let mut child = cmd.spawn().map_err(|e| LaunchError::spawn(&program, e))?;
    info!(
        "[{}] spawned (pid={}, cmd={} {})",
        plan.jobname,
        child.id().unwrap_or(0),
        program,
        args.join(" ")
    );

    let output = OutputBuffer::default();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    let mut process = OwnedProcess::new(child, None);
    if let Some(stdout) = stdout {
        process.readers.push(output.capture(stdout));
    }
    if let Some(stderr) = stderr {
        process.readers.push(output.capture(stderr));
    }
    if let Some((path, start)) = follow_from {
        let follower = output.follow_file(path, start, process.follow.clone());
        process.readers.push(follower);
    }
    Ok(Spawned {
        process,
        output,
        stdin,
    })
}

/// Attach the port lease to a spawned process.
pub(crate) fn hold_lease(spawned: &mut Spawned, lease: PortLease) {
    spawned.process.lease = Some(lease);
}

/// Wait for `check`, the process exiting, or `cancel`, whichever comes
/// first. Anything short of ready stops the process before the error is
/// returned.
pub(crate) async fn validate(
    plan: &LaunchPlan,
    mut process: OwnedProcess,
    output: OutputBuffer,
    check: &dyn ReadinessCheck,
    port: u16,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<ServerHandle> {
    enum Outcome {
        Checked(ReadinessResult),
        Exited(String),
        Cancelled,
    }

    let outcome = tokio::select! {
        r = await_ready(check, plan.timeout) => Outcome::Checked(r),
        status = process.child.wait() => {
            process.exited = true;
            Outcome::Exited(match status {
                Ok(s) => s.to_string(),
                Err(e) => e.to_string(),
            })
        }
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    let verdict = match outcome {
        Outcome::Checked(ReadinessResult::Ready { marker }) => Ok(marker),
        Outcome::Checked(ReadinessResult::TimedOut { output_tail }) => {
            Err(LaunchError::ReadinessTimeout {
                timeout: plan.timeout,
                output_tail,
            })
        }
        Outcome::Checked(ReadinessResult::Failed {
            reason,
            output_tail,
        }) => {
            let status = match timeout(EXIT_WAIT, process.child.wait()).await {
                Ok(Ok(s)) => {
                    process.exited = true;
                    s.to_string()
                }
                _ => reason,
            };
            Err(LaunchError::ProcessExited {
                status,
                output_tail,
            })
        }
        Outcome::Exited(status) => {
            let _ = timeout(OUTPUT_DRAIN, output.wait_closed()).await;
            Err(LaunchError::ProcessExited {
                status,
                output_tail: output.tail(),
            })
        }
        Outcome::Cancelled => Err(LaunchError::Cancelled),
    };

    let mut handle = ServerHandle::new(
        plan.mode,
        plan.host.clone(),
        port,
        plan.jobname.clone(),
        Ownership::Process(process),
    );
    handle.version = plan.version;
    handle.working_dir = plan.working_dir.clone();
    handle.clear_on_connect = plan.clear_on_connect;
    handle.output = Some(output);
    handle.grace = grace;

    match verdict {
        Ok(marker) => {
            info!("[{}] ready ({marker})", plan.jobname);
            Ok(handle)
        }
        Err(e) => {
            warn!("[{}] launch failed: {e}", plan.jobname);
            if let Err(stop_err) = handle.stop(true).await {
                debug!("[{}] cleanup after failed launch: {stop_err}", plan.jobname);
            }
            Err(e)
        }
    }
}
