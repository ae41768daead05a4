// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Launch and connection orchestration for MAPDL solver servers.
//!
//! Given a [`LaunchConfiguration`], the [`Launcher`] decides whether to spawn
//! a local gRPC or console server, submit a batch job, hand the request to a
//! provisioning service, or attach to a server that is already running. Every
//! path ends in a [`ServerHandle`] the caller can dial and later stop.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod config;
pub mod env;
mod error;
pub mod launcher;
pub mod lifecycle;
pub mod output;
pub mod pool;
pub mod port;
pub mod prober;
pub mod provisioning;
pub mod readiness;
pub mod remote;
pub mod resolver;
pub mod slurm;
pub mod version;

// Re-export the public API
pub use config::{LaunchConfiguration, LaunchMode, load_config};
pub use env::EnvSnapshot;
pub use error::{LaunchError, Result};
pub use launcher::{LaunchStrategy, Launcher};
pub use lifecycle::ServerHandle;
pub use pool::{BatchPolicy, launch_many};
pub use port::{PortAllocator, PortLease};
pub use prober::{EnvironmentProber, Installation, SchedulerInfo};
pub use readiness::ReadinessResult;
pub use resolver::{LaunchPlan, resolve};
pub use version::SolverVersion;
