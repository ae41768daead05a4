// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! What a successful launch returns, and how it is torn down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::LaunchMode;
use crate::error::Result;
use crate::launcher::console::ConsoleSession;
use crate::output::OutputBuffer;
use crate::port::PortLease;
use crate::provisioning::{InstanceId, ProvisioningService};
use crate::slurm::{JobId, Scheduler};
use crate::version::SolverVersion;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);

/// A solver process this crate spawned.
pub(crate) struct OwnedProcess {
    pub(crate) child: Child,
    pub(crate) pid: Option<u32>,
    pub(crate) lease: Option<PortLease>,
    pub(crate) readers: Vec<JoinHandle<()>>,
    /// Stops the output-file follower, if any.
    pub(crate) follow: CancellationToken,
    pub(crate) exited: bool,
}

impl OwnedProcess {
    pub(crate) fn new(child: Child, lease: Option<PortLease>) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            lease,
            readers: Vec::new(),
            follow: CancellationToken::new(),
            exited: false,
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, name: &str, sig: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pid), sig) {
            debug!("[{name}] failed to send {sig} to process group {pid}: {e}");
        }
    }

    #[cfg(unix)]
    async fn terminate(&mut self, name: &str, grace: Duration, force: bool) {
        use nix::sys::signal::Signal;

        if !force {
            info!("[{name}] sending SIGTERM");
            self.signal_group(name, Signal::SIGTERM);
            if timeout(grace, self.child.wait()).await.is_ok() {
                // the solver may leave helpers behind in its group
                self.signal_group(name, Signal::SIGKILL);
                return;
            }
            warn!(
                "[{name}] still running after {}s, sending SIGKILL",
                grace.as_secs_f64()
            );
        } else {
            info!("[{name}] sending SIGKILL");
        }
        self.signal_group(name, Signal::SIGKILL);
        if timeout(SIGKILL_TIMEOUT, self.child.wait()).await.is_err() {
            warn!("[{name}] still running after SIGKILL, giving up");
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self, name: &str, _grace: Duration, _force: bool) {
        if let Err(e) = self.child.start_kill() {
            debug!("[{name}] kill failed: {e}");
        }
        if timeout(SIGKILL_TIMEOUT, self.child.wait()).await.is_err() {
            warn!("[{name}] still running after kill, giving up");
        }
    }

    fn try_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.exited = true;
                false
            }
        }
    }
}

impl Drop for OwnedProcess {
    fn drop(&mut self) {
        self.follow.cancel();
        if !self.exited {
            #[cfg(unix)]
            self.signal_group("drop", nix::sys::signal::Signal::SIGKILL);
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// A batch job this crate submitted.
pub(crate) struct OwnedJob {
    pub(crate) id: JobId,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) follow: CancellationToken,
    pub(crate) cancelled: bool,
}

impl Drop for OwnedJob {
    fn drop(&mut self) {
        self.follow.cancel();
        if self.cancelled {
            return;
        }
        // best effort: a dropped handle must not leave the job queued
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let scheduler = Arc::clone(&self.scheduler);
            let id = self.id.clone();
            rt.spawn(async move {
                if let Err(e) = scheduler.cancel(&id).await {
                    warn!("failed to cancel dropped job {id}: {e}");
                }
            });
        } else {
            warn!("job {} dropped outside a runtime and left running", self.id);
        }
    }
}

/// An instance created by the provisioning integration.
pub(crate) struct DelegatedInstance {
    pub(crate) id: InstanceId,
    pub(crate) service: Arc<dyn ProvisioningService>,
    pub(crate) released: bool,
}

pub(crate) enum Ownership {
    Process(OwnedProcess),
    Job(OwnedJob),
    Delegated(DelegatedInstance),
    External,
}

/// A reachable solver server.
///
/// When `started_locally` is true the handle exclusively owns the process or
/// batch job behind it, and [`ServerHandle::stop`] tears it down. Otherwise
/// `stop` never signals anything.
pub struct ServerHandle {
    pub host: String,
    pub port: u16,
    pub started_locally: bool,
    pub version: Option<SolverVersion>,
    pub mode: LaunchMode,
    pub jobname: String,
    pub working_dir: Option<PathBuf>,
    pub clear_on_connect: bool,
    pub(crate) ownership: Ownership,
    pub(crate) output: Option<OutputBuffer>,
    pub(crate) console: Option<ConsoleSession>,
    pub(crate) grace: Duration,
    stopped: bool,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("started_locally", &self.started_locally)
            .field("version", &self.version)
            .field("mode", &self.mode)
            .field("pid", &self.pid())
            .field("job_id", &self.job_id())
            .finish()
    }
}

impl ServerHandle {
    pub(crate) fn new(
        mode: LaunchMode,
        host: String,
        port: u16,
        jobname: String,
        ownership: Ownership,
    ) -> Self {
        let started_locally = matches!(ownership, Ownership::Process(_) | Ownership::Job(_));
        Self {
            host,
            port,
            started_locally,
            version: None,
            mode,
            jobname,
            working_dir: None,
            clear_on_connect: true,
            ownership,
            output: None,
            console: None,
            grace: DEFAULT_GRACE,
            stopped: false,
        }
    }

    /// `host:port`, ready to dial.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.ownership {
            Ownership::Process(p) => p.pid,
            _ => None,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match &self.ownership {
            Ownership::Job(j) => Some(&j.id),
            _ => None,
        }
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        match &self.ownership {
            Ownership::Delegated(d) => Some(&d.id),
            _ => None,
        }
    }

    /// Captured solver output, when this crate is capturing it.
    pub fn output(&self) -> Option<&OutputBuffer> {
        self.output.as_ref()
    }

    /// The line-oriented channel of a console-mode server.
    pub fn console(&self) -> Option<&ConsoleSession> {
        self.console.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Tear down what this handle owns. Safe to call more than once.
    ///
    /// Local processes get SIGTERM, then SIGKILL after the grace window
    /// (`force` skips straight to SIGKILL). Batch jobs are cancelled.
    /// Delegated instances are handed back to the integration once. Remote
    /// handles are left alone.
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        if self.stopped {
            debug!("[{}] already stopped", self.jobname);
            return Ok(());
        }
        self.stopped = true;
        self.console = None;
        let address = self.address();

        match &mut self.ownership {
            Ownership::Process(proc) => {
                if proc.try_alive() {
                    proc.terminate(&self.jobname, self.grace, force).await;
                }
                proc.exited = true;
                proc.follow.cancel();
                proc.lease = None;
                info!("[{}] stopped", self.jobname);
                Ok(())
            }
            Ownership::Job(job) => {
                job.follow.cancel();
                let result = job.scheduler.cancel(&job.id).await;
                job.cancelled = true;
                match &result {
                    Ok(()) => info!("[{}] cancelled batch job {}", self.jobname, job.id),
                    Err(e) => warn!("[{}] cancelling job {} failed: {e}", self.jobname, job.id),
                }
                result
            }
            Ownership::Delegated(inst) => {
                if inst.released {
                    return Ok(());
                }
                inst.released = true;
                info!("[{}] releasing delegated instance {}", self.jobname, inst.id);
                inst.service.delete_instance(&inst.id).await
            }
            Ownership::External => {
                debug!(
                    "[{}] {address} was not started here, leaving it running",
                    self.jobname
                );
                Ok(())
            }
        }
    }

    /// Whether the owned process or job is still running. Never fails:
    /// anything that cannot be checked counts as not alive.
    pub async fn is_alive(&mut self) -> bool {
        match &mut self.ownership {
            Ownership::Process(proc) => proc.try_alive(),
            Ownership::Job(job) => {
                if job.cancelled {
                    return false;
                }
                match job.scheduler.status(&job.id).await {
                    Ok(status) => !status.state.is_terminal(),
                    Err(e) => {
                        debug!("[{}] job {} status unknown: {e}", self.jobname, job.id);
                        false
                    }
                }
            }
            Ownership::Delegated(_) | Ownership::External => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use crate::provisioning::InstanceSpec;
    use crate::slurm::{JobState, JobStatus, JobSubmission};
    use async_trait::async_trait;
    use std::process::Stdio;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::process::Command;

    fn spawn(script: &str) -> Child {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn().unwrap()
    }

    fn process_handle(child: Child) -> ServerHandle {
        ServerHandle::new(
            LaunchMode::LocalGrpc,
            "127.0.0.1".to_string(),
            50052,
            "test".to_string(),
            Ownership::Process(OwnedProcess::new(child, None)),
        )
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut handle = process_handle(spawn("sleep 60"));
        assert!(handle.started_locally);
        assert!(handle.is_alive().await);

        handle.stop(false).await.unwrap();
        assert!(!handle.is_alive().await);
        handle.stop(false).await.unwrap();
        handle.stop(true).await.unwrap();
        assert!(handle.is_stopped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let mut handle = process_handle(spawn("trap '' TERM; sleep 60 & wait"));
        handle.grace = Duration::from_millis(200);
        let started = std::time::Instant::now();
        handle.stop(false).await.unwrap();
        assert!(!handle.is_alive().await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_force_stop() {
        let mut handle = process_handle(spawn("sleep 60"));
        handle.stop(true).await.unwrap();
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn test_stop_releases_lease() {
        let allocator = crate::port::PortAllocator::new(42000..42100);
        let lease = allocator.allocate(None).unwrap();
        let port = lease.port();
        let mut handle = ServerHandle::new(
            LaunchMode::LocalGrpc,
            "127.0.0.1".to_string(),
            port,
            "test".to_string(),
            Ownership::Process(OwnedProcess::new(spawn("sleep 60"), Some(lease))),
        );
        assert!(allocator.is_leased(port));
        handle.stop(false).await.unwrap();
        assert!(!allocator.is_leased(port));
    }

    #[tokio::test]
    async fn test_exited_process_is_not_alive() {
        let mut handle = process_handle(spawn("exit 3"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_alive().await);
        handle.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_external_handle_is_never_touched() {
        let mut handle = ServerHandle::new(
            LaunchMode::Remote,
            "10.0.0.5".to_string(),
            50052,
            "file".to_string(),
            Ownership::External,
        );
        assert!(!handle.started_locally);
        assert!(!handle.is_alive().await);
        handle.stop(true).await.unwrap();
        handle.stop(true).await.unwrap();
        assert_eq!(handle.address(), "10.0.0.5:50052");
    }

    #[derive(Default)]
    struct FakeScheduler {
        cancels: AtomicUsize,
        state: Mutex<Option<JobState>>,
    }

    #[async_trait]
    impl Scheduler for FakeScheduler {
        async fn submit(&self, _job: &JobSubmission) -> Result<JobId> {
            Ok(JobId("1".to_string()))
        }
        async fn status(&self, _job: &JobId) -> Result<JobStatus> {
            match self.state.lock().unwrap().clone() {
                Some(state) => Ok(JobStatus {
                    state,
                    batch_host: Some("node01".to_string()),
                }),
                None => Err(LaunchError::spawn("scontrol", "invalid job id")),
            }
        }
        async fn cancel(&self, _job: &JobId) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = Some(JobState::Cancelled);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_job_handle() {
        let scheduler = Arc::new(FakeScheduler::default());
        *scheduler.state.lock().unwrap() = Some(JobState::Running);
        let mut handle = ServerHandle::new(
            LaunchMode::Hpc,
            "node01".to_string(),
            50052,
            "file".to_string(),
            Ownership::Job(OwnedJob {
                id: JobId("1".to_string()),
                scheduler: scheduler.clone(),
                follow: CancellationToken::new(),
                cancelled: false,
            }),
        );
        assert!(handle.started_locally);
        assert!(handle.is_alive().await);
        handle.stop(false).await.unwrap();
        handle.stop(false).await.unwrap();
        assert!(!handle.is_alive().await);
        assert_eq!(scheduler.cancels.load(Ordering::SeqCst), 1);
        drop(handle);
        assert_eq!(scheduler.cancels.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct FakeService {
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl ProvisioningService for FakeService {
        async fn create_instance(&self, _spec: &InstanceSpec) -> Result<InstanceId> {
            Ok(InstanceId("instances/abc".to_string()))
        }
        async fn wait_until_ready(&self, _id: &InstanceId, _timeout: Duration) -> Result<String> {
            Ok("10.0.0.9:50052".to_string())
        }
        async fn delete_instance(&self, _id: &InstanceId) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delegated_stop_forwards_once() {
        let service = Arc::new(FakeService::default());
        let mut handle = ServerHandle::new(
            LaunchMode::Delegated,
            "10.0.0.9".to_string(),
            50052,
            "file".to_string(),
            Ownership::Delegated(DelegatedInstance {
                id: InstanceId("instances/abc".to_string()),
                service: service.clone(),
                released: false,
            }),
        );
        assert!(!handle.started_locally);
        assert!(!handle.is_alive().await);
        handle.stop(false).await.unwrap();
        handle.stop(false).await.unwrap();
        assert_eq!(service.deletes.load(Ordering::SeqCst), 1);
    }
}
