// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Launching several servers at once.

use std::sync::Arc;

use log::{info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::LaunchConfiguration;
use crate::error::{LaunchError, Result};
use crate::launcher::Launcher;
use crate::lifecycle::ServerHandle;

/// What one failed launch means for the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Every launch stands on its own.
    #[default]
    Independent,
    /// The first failure cancels in-flight launches and stops the ones that
    /// already succeeded.
    AllOrNothing,
}

/// Launch every configuration concurrently. Results come back in input
/// order, one per configuration.
pub async fn launch_many(
    launcher: Arc<Launcher>,
    configs: Vec<LaunchConfiguration>,
    policy: BatchPolicy,
) -> Vec<Result<ServerHandle>> {
    let total = configs.len();
    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<(usize, Result<ServerHandle>)> = JoinSet::new();
    for (index, config) in configs.into_iter().enumerate() {
        let launcher = Arc::clone(&launcher);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = launcher.launch_with_cancel(&config, &cancel).await;
            (index, result)
        });
    }

    let mut results: Vec<Option<Result<ServerHandle>>> = (0..total).map(|_| None).collect();
    let mut failed = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Err(e) = &result {
                    warn!("launch {index} of {total} failed: {e}");
                    failed = true;
                }
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(e) => {
                warn!("launch task did not complete: {e}");
                failed = true;
            }
        }
        if failed && policy == BatchPolicy::AllOrNothing && !cancel.is_cancelled() {
            info!("cancelling the rest of the batch");
            cancel.cancel();
        }
    }

    let mut results: Vec<Result<ServerHandle>> = results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(LaunchError::spawn("launch task", "did not complete"))))
        .collect();

    if failed && policy == BatchPolicy::AllOrNothing {
        for result in &mut results {
            if let Ok(handle) = result {
                if let Err(e) = handle.stop(false).await {
                    warn!("[{}] failed to stop after batch failure: {e}", handle.jobname);
                }
                *result = Err(LaunchError::Cancelled);
            }
        }
    }
    results
}
