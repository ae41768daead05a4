// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Bounded capture of solver output.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CAPACITY_BYTES: usize = 64 * 1024;
const TAIL_LINES: usize = 40;
const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct State {
    lines: VecDeque<(u64, String)>,
    bytes: usize,
    next_seq: u64,
    open_streams: usize,
    eof: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

/// Ring buffer of output lines. Oldest lines are dropped once the total
/// size exceeds the capacity. Every line gets a sequence number so readers
/// can ask for what is new since they last looked.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Inner>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.bytes += line.len();
            state.lines.push_back((seq, line));
            while state.bytes > self.inner.capacity && state.lines.len() > 1 {
                if let Some((_, old)) = state.lines.pop_front() {
                    state.bytes -= old.len();
                }
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// Mark the stream finished. Waiters see `eof` once what they have not
    /// read yet is drained.
    pub fn close(&self) {
        self.state().eof = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().eof
    }

    /// Read `reader` line by line into the buffer on a background task. The
    /// buffer is closed when every captured stream has ended.
    pub fn capture<R>(&self, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.state().open_streams += 1;
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => buffer.push(line),
                    Ok(None) => break,
                    Err(e) => {
                        debug!("output stream error: {e}");
                        break;
                    }
                }
            }
            let done = {
                let mut state = buffer.state();
                state.open_streams = state.open_streams.saturating_sub(1);
                state.open_streams == 0
            };
            if done {
                buffer.close();
            }
        })
    }

    /// Tail a file that another process appends to, starting at byte
    /// `start`, until `stop` fires. A missing file is waited for. Partial
    /// trailing lines are held back until their newline arrives.
    pub fn follow_file(
        &self,
        path: PathBuf,
        start: u64,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut offset = usize::try_from(start).unwrap_or(usize::MAX);
            let mut partial = String::new();
            loop {
                if let Ok(data) = tokio::fs::read(&path).await {
                    if data.len() < offset {
                        debug!("{} was truncated, reading from the start", path.display());
                        offset = 0;
                        partial.clear();
                    }
                    let fresh = data.get(offset..).unwrap_or_default();
                    offset = data.len();
                    partial.push_str(&String::from_utf8_lossy(fresh));
                    while let Some(pos) = partial.find('\n') {
                        let rest = partial.split_off(pos + 1);
                        buffer.push(partial.trim_end_matches(['\r', '\n']));
                        partial = rest;
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
                }
            }
        })
    }

    /// Lines with a sequence number of at least `seq`, and whether the
    /// stream has ended.
    pub fn lines_since(&self, seq: u64) -> (Vec<(u64, String)>, bool) {
        let state = self.state();
        let lines = state
            .lines
            .iter()
            .filter(|(s, _)| *s >= seq)
            .cloned()
            .collect();
        (lines, state.eof)
    }

    /// Wait until a line numbered `seq` or later exists, or the stream ends.
    pub async fn wait_past(&self, seq: u64) {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.state();
                if state.next_seq > seq || state.eof {
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn wait_closed(&self) {
        self.wait_past(u64::MAX).await
    }

    /// The last few lines, newline separated.
    pub fn tail(&self) -> String {
        let state = self.state();
        let skip = state.lines.len().saturating_sub(TAIL_LINES);
        state
            .lines
            .iter()
            .skip(skip)
            .map(|(_, l)| l.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
