// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Legacy line-oriented console mode. Unix only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{LaunchError, Result};
use crate::launcher::process;
use crate::lifecycle::ServerHandle;
use crate::output::OutputBuffer;
use crate::readiness::{ReadinessCheck, ReadinessResult};
use crate::resolver::LaunchPlan;

/// Printed once the console is waiting for commands.
pub const CONSOLE_READY_MARKER: &str = "BEGIN:";
/// Printed when the solver wants a keypress to go on.
const CONTINUE_PROMPT: &str = "CONTINUE";

/// Stdin and captured output of a console-mode solver.
#[derive(Clone)]
pub struct ConsoleSession {
    stdin: Arc<Mutex<ChildStdin>>,
    output: OutputBuffer,
}

impl ConsoleSession {
    pub(crate) fn new(stdin: ChildStdin, output: OutputBuffer) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(stdin)),
            output,
        }
    }

    /// Write one command line.
    pub async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }
}

/// Ready on the console prompt; answers continuation prompts along the way.
pub(crate) struct ConsoleHandshake {
    session: ConsoleSession,
}

impl ConsoleHandshake {
    pub(crate) fn new(session: ConsoleSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ReadinessCheck for ConsoleHandshake {
    async fn wait(&self) -> ReadinessResult {
        let output = self.session.output();
        let mut seq = 0;
        loop {
            let (lines, eof) = output.lines_since(seq);
            for (s, line) in lines {
                seq = s + 1;
                if line.contains(CONSOLE_READY_MARKER) {
                    return ReadinessResult::Ready {
                        marker: CONSOLE_READY_MARKER.to_string(),
                    };
                }
                if line.contains(CONTINUE_PROMPT) {
                    debug!("answering console prompt: {line}");
                    if let Err(e) = self.session.send_line("").await {
                        return ReadinessResult::Failed {
                            reason: format!("console stdin closed: {e}"),
                            output_tail: output.tail(),
                        };
                    }
                }
            }
            if eof {
                return ReadinessResult::Failed {
                    reason: "output ended before the console prompt".to_string(),
                    output_tail: output.tail(),
                };
            }
            output.wait_past(seq).await;
        }
    }

    fn output_tail(&self) -> String {
        self.session.output().tail()
    }
}

pub(crate) async fn launch(
    plan: &LaunchPlan,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<ServerHandle> {
    let extra_env = process::prepare_working_dir(plan).await?;
    let mut spawned = process::spawn_solver(plan, &plan.args(None), &extra_env, true)?;
    let stdin = spawned
        .stdin
        .take()
        .ok_or_else(|| LaunchError::spawn(plan.jobname.clone(), "console stdin not available"))?;
    let session = ConsoleSession::new(stdin, spawned.output.clone());
    let check = ConsoleHandshake::new(session.clone());

    let mut handle = process::validate(
        plan,
        spawned.process,
        spawned.output,
        &check,
        0,
        grace,
        cancel,
    )
    .await?;
    handle.console = Some(session);
    Ok(handle)
}
