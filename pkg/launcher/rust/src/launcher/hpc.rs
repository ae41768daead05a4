// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Running the solver as a batch job.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::LaunchMode;
use crate::error::{LaunchError, Result};
use crate::launcher::process;
use crate::lifecycle::{OwnedJob, Ownership, ServerHandle};
use crate::output::OutputBuffer;
use crate::readiness::{
    AllOf, LogPattern, PortProbe, ReadinessCheck, ReadinessResult, await_ready,
};
use crate::resolver::{DEFAULT_PORT, JobResources, LaunchPlan};
use crate::slurm::{JobId, JobState, JobSubmission, Scheduler};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Submit the solver, wait for the job to start, then wait for the server
/// inside it. Every failure after submission cancels the job.
pub(crate) async fn launch(
    plan: &LaunchPlan,
    scheduler: Arc<dyn Scheduler>,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<ServerHandle> {
    let working_dir = plan
        .working_dir
        .clone()
        .ok_or_else(|| LaunchError::config("batch jobs need a working directory"))?;
    process::prepare_working_dir(plan).await?;

    let port = plan.port.unwrap_or(DEFAULT_PORT);
    let submission = JobSubmission {
        jobname: plan.jobname.clone(),
        working_dir,
        resources: plan.resources.clone().unwrap_or(JobResources {
            nodes: 1,
            cores: plan.nproc,
            mem_mb: plan.ram_mb,
        }),
        options: plan.scheduler_options.clone(),
        command: plan.command(Some(port)),
        env: plan.env.clone(),
    };

    // a submission racing `cancel` could queue a job whose id is never seen
    let id = scheduler.submit(&submission).await?;
    let mut job = OwnedJob {
        id: id.clone(),
        scheduler: Arc::clone(&scheduler),
        follow: CancellationToken::new(),
        cancelled: false,
    };
    if cancel.is_cancelled() {
        abandon(&mut job, &plan.jobname).await;
        return Err(LaunchError::Cancelled);
    }

    let deadline = Instant::now() + plan.timeout;
    let waited = wait_running(
        plan,
        scheduler.as_ref(),
        &id,
        deadline,
        poll_interval,
        cancel,
    )
    .await;
    let batch_host = match waited {
        Ok(host) => host,
        Err(e) => {
            abandon(&mut job, &plan.jobname).await;
            return Err(e);
        }
    };
    let host = resolve_host(&batch_host, port).await;
    info!("[{}] job {id} running on {batch_host} ({host}:{port})", plan.jobname);

    let output = OutputBuffer::default();
    output.follow_file(submission.output_file(&id), 0, job.follow.clone());

    let log = LogPattern::grpc(output.clone());
    let check: Box<dyn ReadinessCheck> = if plan.probe_port {
        Box::new(AllOf::new(vec![
            Box::new(log),
            Box::new(PortProbe::new(host.clone(), port)),
        ]))
    } else {
        Box::new(log)
    };
    let result = tokio::select! {
        r = await_ready(check.as_ref(), plan.timeout) => Some(r),
        _ = cancel.cancelled() => None,
    };

    let mut handle = ServerHandle::new(
        LaunchMode::Hpc,
        host,
        port,
        plan.jobname.clone(),
        Ownership::Job(job),
    );
    handle.version = plan.version;
    handle.working_dir = plan.working_dir.clone();
    handle.clear_on_connect = plan.clear_on_connect;
    handle.output = Some(output);

    let err = match result {
        Some(ReadinessResult::Ready { marker }) => {
            info!("[{}] ready ({marker})", plan.jobname);
            return Ok(handle);
        }
        Some(ReadinessResult::TimedOut { output_tail }) => LaunchError::ReadinessTimeout {
            timeout: plan.timeout,
            output_tail,
        },
        Some(ReadinessResult::Failed {
            reason,
            output_tail,
        }) => LaunchError::ProcessExited {
            status: reason,
            output_tail,
        },
        None => LaunchError::Cancelled,
    };
    warn!("[{}] launch failed: {err}", plan.jobname);
    if let Err(e) = handle.stop(true).await {
        debug!("[{}] cleanup after failed launch: {e}", plan.jobname);
    }
    Err(err)
}

/// Poll until the job runs and return its batch host.
async fn wait_running(
    plan: &LaunchPlan,
    scheduler: &dyn Scheduler,
    id: &JobId,
    deadline: Instant,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut last = JobState::Pending;
    loop {
        match scheduler.status(id).await {
            Ok(status) => {
                if status.state != last {
                    debug!("[{}] job {id} is {}", plan.jobname, status.state);
                }
                match status.state {
                    JobState::Running => {
                        if let Some(host) = status.batch_host {
                            return Ok(host);
                        }
                    }
                    ref state if state.is_terminal() => {
                        return Err(LaunchError::spawn(
                            "sbatch",
                            format!("job {id} ended in state {state} before the server started"),
                        ));
                    }
                    _ => {}
                }
                last = status.state;
            }
            // freshly submitted jobs are not always visible yet
            Err(e) => debug!("[{}] job {id} status unavailable: {e}", plan.jobname),
        }

        if Instant::now() >= deadline {
            return Err(LaunchError::SchedulerQueueTimeout {
                job_id: id.to_string(),
                state: last.to_string(),
                timeout: plan.timeout,
            });
        }
        let next = (Instant::now() + poll_interval).min(deadline);
        tokio::select! {
            _ = sleep_until(next) => {}
            _ = cancel.cancelled() => return Err(LaunchError::Cancelled),
        }
    }
}

async fn abandon(job: &mut OwnedJob, jobname: &str) {
    job.cancelled = true;
    match job.scheduler.cancel(&job.id).await {
        Ok(()) => info!("[{jobname}] cancelled batch job {}", job.id),
        Err(e) => warn!("[{jobname}] cancelling job {} failed: {e}", job.id),
    }
}

/// The address to dial for `batch_host`. Falls back to the name itself
/// when it does not resolve here.
async fn resolve_host(batch_host: &str, port: u16) -> String {
    match tokio::net::lookup_host((batch_host, port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.ip().to_string(),
            None => batch_host.to_string(),
        },
        Err(e) => {
            debug!("cannot resolve {batch_host}: {e}");
            batch_host.to_string()
        }
    }
}
