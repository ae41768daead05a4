// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Turning a configuration into a reachable server.

pub mod console;
mod grpc;
mod hpc;
mod process;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::config::{LaunchConfiguration, LaunchMode};
use crate::error::{LaunchError, Result};
use crate::lifecycle::{DEFAULT_GRACE, ServerHandle};
use crate::port::PortAllocator;
use crate::prober::EnvironmentProber;
use crate::provisioning::{PimClient, ProvisioningService, provision};
use crate::remote;
use crate::resolver::{self, LaunchPlan};
use crate::slurm::{Scheduler, SlurmScheduler};

/// How a resolved plan gets its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Spawn locally, wait for the gRPC listener.
    LocalGrpc,
    /// Spawn locally, drive the interactive console.
    LocalConsole,
    /// Connect to a server that is already running.
    Remote,
    /// Submit a batch job, wait for it to run, then for the server.
    Hpc,
    /// Ask the provisioning integration for an instance.
    Delegated,
}

impl LaunchStrategy {
    pub fn for_plan(plan: &LaunchPlan) -> Self {
        match plan.mode {
            LaunchMode::LocalGrpc => LaunchStrategy::LocalGrpc,
            LaunchMode::LocalConsole => LaunchStrategy::LocalConsole,
            LaunchMode::Remote => LaunchStrategy::Remote,
            LaunchMode::Hpc => LaunchStrategy::Hpc,
            LaunchMode::Delegated => LaunchStrategy::Delegated,
        }
    }
}

impl fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaunchStrategy::LocalGrpc => "local-grpc",
            LaunchStrategy::LocalConsole => "local-console",
            LaunchStrategy::Remote => "remote",
            LaunchStrategy::Hpc => "hpc",
            LaunchStrategy::Delegated => "delegated",
        };
        f.write_str(s)
    }
}

/// Entry point for launching servers.
///
/// Cheap to share behind an [`Arc`]; concurrent launches draw ports from the
/// same allocator and never collide.
pub struct Launcher {
    prober: EnvironmentProber,
    ports: Arc<PortAllocator>,
    scheduler: Option<Arc<dyn Scheduler>>,
    provisioner: Option<Arc<dyn ProvisioningService>>,
    grace: Duration,
    poll_interval: Duration,
}

impl Launcher {
    pub fn new(prober: EnvironmentProber) -> Self {
        Self {
            prober,
            ports: PortAllocator::shared(),
            scheduler: None,
            provisioner: None,
            grace: DEFAULT_GRACE,
            poll_interval: hpc::POLL_INTERVAL,
        }
    }

    pub fn from_process_env() -> Self {
        Self::new(EnvironmentProber::from_process_env())
    }

    pub fn with_port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    /// Use `scheduler` for batch jobs instead of the detected Slurm tools.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use `service` for delegated launches instead of the configured one.
    pub fn with_provisioning_service(mut self, service: Arc<dyn ProvisioningService>) -> Self {
        self.provisioner = Some(service);
        self
    }

    /// Time a stopping solver gets between SIGTERM and SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn prober(&self) -> &EnvironmentProber {
        &self.prober
    }

    /// Forget cached discovery results. Installations are probed again on
    /// the next launch.
    pub fn refresh(&mut self) {
        self.prober.refresh();
    }

    /// Validate `config` without starting anything.
    pub fn resolve(&self, config: &LaunchConfiguration) -> Result<LaunchPlan> {
        resolver::resolve(config, &self.prober)
    }

    pub async fn launch(&self, config: &LaunchConfiguration) -> Result<ServerHandle> {
        self.launch_with_cancel(config, &CancellationToken::new())
            .await
    }

    /// Like [`Launcher::launch`], giving up with [`LaunchError::Cancelled`]
    /// once `cancel` fires. Anything already started is stopped first.
    pub async fn launch_with_cancel(
        &self,
        config: &LaunchConfiguration,
        cancel: &CancellationToken,
    ) -> Result<ServerHandle> {
        let plan = self.resolve(config)?;
        self.launch_plan(&plan, cancel).await
    }

    pub async fn launch_plan(
        &self,
        plan: &LaunchPlan,
        cancel: &CancellationToken,
    ) -> Result<ServerHandle> {
        let strategy = LaunchStrategy::for_plan(plan);
        info!("[{}] launching ({strategy})", plan.jobname);
        debug!("[{}] plan: {plan:?}", plan.jobname);

        // nothing can become ready in no time; do not spawn just to kill it
        if plan.timeout.is_zero() {
            return Err(LaunchError::ReadinessTimeout {
                timeout: plan.timeout,
                output_tail: String::new(),
            });
        }
        if cancel.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }

        match strategy {
            LaunchStrategy::LocalGrpc => grpc::launch(plan, &self.ports, self.grace, cancel).await,
            LaunchStrategy::LocalConsole => console::launch(plan, self.grace, cancel).await,
            LaunchStrategy::Remote => tokio::select! {
                r = remote::connect_plan(plan) => r,
                _ = cancel.cancelled() => Err(LaunchError::Cancelled),
            },
            LaunchStrategy::Hpc => {
                let scheduler = self.scheduler_for(plan)?;
                hpc::launch(plan, scheduler, self.poll_interval, cancel).await
            }
            LaunchStrategy::Delegated => {
                let service = self.provisioner_for(plan)?;
                provision(plan, service, cancel).await
            }
        }
    }

    fn scheduler_for(&self, plan: &LaunchPlan) -> Result<Arc<dyn Scheduler>> {
        if let Some(scheduler) = &self.scheduler {
            return Ok(Arc::clone(scheduler));
        }
        let info = plan
            .scheduler
            .as_ref()
            .ok_or_else(|| LaunchError::config("no batch scheduler detected"))?;
        Ok(Arc::new(SlurmScheduler::new(info.bin_dir.clone())))
    }

    fn provisioner_for(&self, plan: &LaunchPlan) -> Result<Arc<dyn ProvisioningService>> {
        if let Some(service) = &self.provisioner {
            return Ok(Arc::clone(service));
        }
        let path = plan
            .provisioning_config
            .as_deref()
            .ok_or_else(|| LaunchError::config("no provisioning configuration"))?;
        Ok(Arc::new(PimClient::from_config_file(path)?))
    }
}
