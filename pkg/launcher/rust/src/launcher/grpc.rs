// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::launcher::process;
use crate::lifecycle::ServerHandle;
use crate::port::PortAllocator;
use crate::readiness::{AllOf, LogPattern, PortProbe, ReadinessCheck};
use crate::resolver::LaunchPlan;

/// Start a local solver with its gRPC server on a leased port.
pub(crate) async fn launch(
    plan: &LaunchPlan,
    ports: &Arc<PortAllocator>,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<ServerHandle> {
    let extra_env = process::prepare_working_dir(plan).await?;

    let mut lease = ports.allocate(plan.port)?;
    let port = lease.port();
    let args = plan.args(Some(port));
    // the solver binds the port itself from here on
    lease.hand_off();
    let mut spawned = process::spawn_solver(plan, &args, &extra_env, false)?;
    process::hold_lease(&mut spawned, lease);

    let log = LogPattern::grpc(spawned.output.clone());
    let check: Box<dyn ReadinessCheck> = if plan.probe_port {
        Box::new(AllOf::new(vec![
            Box::new(log),
            Box::new(PortProbe::new(plan.host.clone(), port)),
        ]))
    } else {
        Box::new(log)
    };

    process::validate(
        plan,
        spawned.process,
        spawned.output,
        check.as_ref(),
        port,
        grace,
        cancel,
    )
    .await
}
