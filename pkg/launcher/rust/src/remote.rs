// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::time::Duration;

use log::{info, warn};

use crate::config::LaunchMode;
use crate::error::{LaunchError, Result};
use crate::lifecycle::{Ownership, ServerHandle};
use crate::readiness::PortProbe;
use crate::resolver::LaunchPlan;

/// Attach to a server somebody else started. Only checks that the port
/// accepts a connection within `timeout`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<ServerHandle> {
    match PortProbe::new(host, port).probe_once(timeout).await {
        Ok(()) => {
            info!("connected to {host}:{port}");
            Ok(ServerHandle::new(
                LaunchMode::Remote,
                host.to_string(),
                port,
                crate::config::DEFAULT_JOBNAME.to_string(),
                Ownership::External,
            ))
        }
        Err(e) => {
            warn!("{host}:{port} unreachable: {e}");
            Err(LaunchError::RemoteUnreachable {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })
        }
    }
}

pub(crate) async fn connect_plan(plan: &LaunchPlan) -> Result<ServerHandle> {
    let port = plan
        .port
        .ok_or_else(|| LaunchError::config("remote connection without a port"))?;
    let mut handle = connect(&plan.host, port, plan.timeout).await?;
    handle.jobname = plan.jobname.clone();
    handle.clear_on_connect = plan.clear_on_connect;
    Ok(handle)
}
