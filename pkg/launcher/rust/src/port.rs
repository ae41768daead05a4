// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::debug;

use crate::error::{LaunchError, Result};
use crate::resolver::DEFAULT_PORT;

const SCAN_END: u16 = 60000;

static SHARED: OnceLock<Arc<PortAllocator>> = OnceLock::new();

/// Hands out ports to concurrent launches in this process.
///
/// A port stays leased from `allocate` until its [`PortLease`] is dropped,
/// which for a successful launch is when the server is stopped. The lock is
/// only held while the leased set is read or updated.
#[derive(Debug)]
pub struct PortAllocator {
    leased: Mutex<BTreeSet<u16>>,
    scan: Range<u16>,
}

impl PortAllocator {
    pub fn new(scan: Range<u16>) -> Arc<Self> {
        Arc::new(Self {
            leased: Mutex::new(BTreeSet::new()),
            scan,
        })
    }

    /// The allocator every [`crate::Launcher`] uses unless given another.
    pub fn shared() -> Arc<Self> {
        Arc::clone(SHARED.get_or_init(|| Self::new(DEFAULT_PORT..SCAN_END)))
    }

    fn leased(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.leased.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased().contains(&port)
    }

    /// Reserve `preferred`, or the first free port of the scan range.
    ///
    /// A preferred port that is taken fails with `PortUnavailable`; it is
    /// never swapped for another one.
    pub fn allocate(self: &Arc<Self>, preferred: Option<u16>) -> Result<PortLease> {
        let mut leased = self.leased();

        if let Some(port) = preferred {
            if leased.contains(&port) {
                return Err(LaunchError::PortUnavailable {
                    port,
                    reason: "already leased by another launch in this process".to_string(),
                });
            }
            let listener = bind(port).map_err(|e| LaunchError::PortUnavailable {
                port,
                reason: e.to_string(),
            })?;
            leased.insert(port);
            return Ok(self.lease(port, listener));
        }

        for port in self.scan.clone() {
            if leased.contains(&port) {
                continue;
            }
            match bind(port) {
                Ok(listener) => {
                    leased.insert(port);
                    return Ok(self.lease(port, listener));
                }
                Err(e) => debug!("port {port} in use: {e}"),
            }
        }
        Err(LaunchError::PortUnavailable {
            port: self.scan.start,
            reason: format!(
                "no free port between {} and {}",
                self.scan.start, self.scan.end
            ),
        })
    }

    fn lease(self: &Arc<Self>, port: u16, listener: TcpListener) -> PortLease {
        debug!("leased port {port}");
        PortLease {
            port,
            listener: Some(listener),
            allocator: Arc::clone(self),
        }
    }

    fn release(&self, port: u16) {
        if self.leased().remove(&port) {
            debug!("released port {port}");
        }
    }
}

fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
}

/// A reserved port. Holds the test-bind open until [`PortLease::hand_off`]
/// so nothing else on the host grabs it first.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    listener: Option<TcpListener>,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the test-bind so the solver can bind the port itself. The port
    /// stays leased until the lease is dropped.
    pub fn hand_off(&mut self) {
        self.listener = None;
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
