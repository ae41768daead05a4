// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Deciding when a started server can take requests.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;

use crate::output::OutputBuffer;

/// Printed by the gRPC server once its listener is up.
pub const GRPC_READY_MARKERS: &[&str] = &["Server listening on", "START GRPC SERVER"];

const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessResult {
    Ready { marker: String },
    TimedOut { output_tail: String },
    Failed { reason: String, output_tail: String },
}

impl ReadinessResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessResult::Ready { .. })
    }
}

/// One way of telling that a server is ready.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Resolve once the server is ready, or once it never can be. Timing out
    /// is left to [`await_ready`].
    async fn wait(&self) -> ReadinessResult;

    /// Output to attach when the check does not succeed.
    fn output_tail(&self) -> String {
        String::new()
    }
}

/// Run `check` with a hard cutoff. A zero timeout fails without waiting.
pub async fn await_ready(check: &dyn ReadinessCheck, timeout: Duration) -> ReadinessResult {
    if timeout.is_zero() {
        return ReadinessResult::TimedOut {
            output_tail: check.output_tail(),
        };
    }
    match tokio::time::timeout(timeout, check.wait()).await {
        Ok(result) => result,
        Err(_) => ReadinessResult::TimedOut {
            output_tail: check.output_tail(),
        },
    }
}

/// Scan new output lines for any of `markers`.
pub struct LogPattern {
    output: OutputBuffer,
    markers: Vec<String>,
}

impl LogPattern {
    pub fn new(output: OutputBuffer, markers: &[&str]) -> Self {
        Self {
            output,
            markers: markers.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn grpc(output: OutputBuffer) -> Self {
        Self::new(output, GRPC_READY_MARKERS)
    }
}

#[async_trait]
impl ReadinessCheck for LogPattern {
    async fn wait(&self) -> ReadinessResult {
        let mut seq = 0;
        loop {
            let (lines, eof) = self.output.lines_since(seq);
            for (s, line) in lines {
                seq = s + 1;
                if let Some(marker) = self.markers.iter().find(|m| line.contains(m.as_str())) {
                    debug!("readiness marker seen: {line}");
                    return ReadinessResult::Ready {
                        marker: marker.clone(),
                    };
                }
            }
            if eof {
                return ReadinessResult::Failed {
                    reason: "output ended before the server reported it was listening"
                        .to_string(),
                    output_tail: self.output.tail(),
                };
            }
            self.output.wait_past(seq).await;
        }
    }

    fn output_tail(&self) -> String {
        self.output.tail()
    }
}

/// Repeated TCP connects until one succeeds.
pub struct PortProbe {
    host: String,
    port: u16,
    interval: Duration,
}

impl PortProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            interval: PROBE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// A single bounded connect attempt.
    pub async fn probe_once(&self, timeout: Duration) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }
}

#[async_trait]
impl ReadinessCheck for PortProbe {
    async fn wait(&self) -> ReadinessResult {
        loop {
            match self.probe_once(PROBE_CONNECT_TIMEOUT).await {
                Ok(()) => {
                    return ReadinessResult::Ready {
                        marker: format!("{}:{} accepting connections", self.host, self.port),
                    };
                }
                Err(e) => debug!("probe {}:{} not ready: {e}", self.host, self.port),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Every check must pass, in order. The first non-ready result wins.
pub struct AllOf {
    checks: Vec<Box<dyn ReadinessCheck>>,
}

impl AllOf {
    pub fn new(checks: Vec<Box<dyn ReadinessCheck>>) -> Self {
        Self { checks }
    }
}

#[async_trait]
impl ReadinessCheck for AllOf {
    async fn wait(&self) -> ReadinessResult {
        let mut last = ReadinessResult::Failed {
            reason: "no readiness checks configured".to_string(),
            output_tail: String::new(),
        };
        for check in &self.checks {
            last = check.wait().await;
            if !last.is_ready() {
                return last;
            }
        }
        last
    }

    fn output_tail(&self) -> String {
        self.checks
            .iter()
            .map(|c| c.output_tail())
            .find(|t| !t.is_empty())
            .unwrap_or_default()
    }
}
