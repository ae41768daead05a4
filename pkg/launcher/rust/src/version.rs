// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::{LaunchError, Result};

/// Releases this launcher knows how to start, newest first.
pub const SUPPORTED_VERSIONS: &[u32] = &[
    252, 251, 242, 241, 232, 231, 222, 221, 212, 211, 202, 201, 195, 194, 193, 192, 191,
];

/// First release that ships the gRPC server.
pub const GRPC_MIN_VERSION: u32 = 211;

/// A solver release encoded as three digits, e.g. `242` for 2024 R2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SolverVersion(u32);

impl SolverVersion {
    pub fn new(raw: u32) -> Result<Self> {
        if SUPPORTED_VERSIONS.contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(LaunchError::config(format!(
                "unsupported solver version {raw}; supported versions are {}",
                SUPPORTED_VERSIONS
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn has_grpc(self) -> bool {
        self.0 >= GRPC_MIN_VERSION
    }

    /// Parse a user supplied hint. `latest` (or an empty string) means no
    /// preference and yields `None`.
    pub fn parse_hint(hint: &str) -> Result<Option<Self>> {
        let hint = hint.trim();
        if hint.is_empty() || hint.eq_ignore_ascii_case("latest") {
            return Ok(None);
        }
        hint.parse().map(Some)
    }
}

impl FromStr for SolverVersion {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || LaunchError::config(format!("cannot parse solver version {s:?}"));

        // 2024R2
        let upper = s.to_ascii_uppercase();
        if let Some((year, release)) = upper.split_once('R')
            && year.len() == 4
        {
            let year: u32 = year.parse().map_err(|_| invalid())?;
            let release: u32 = release.parse().map_err(|_| invalid())?;
            return Self::new((year % 100) * 10 + release);
        }

        // 24.2
        if let Some((major, minor)) = s.split_once('.') {
            let major: u32 = major.parse().map_err(|_| invalid())?;
            let minor: u32 = minor.parse().map_err(|_| invalid())?;
            return Self::new(major * 10 + minor);
        }

        Self::new(s.parse().map_err(|_| invalid())?)
    }
}

impl fmt::Display for SolverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for SolverVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Float(f64),
            Str(String),
        }
        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Int(n) => SolverVersion::new(n),
            // 24.2 in YAML arrives as a float
            Raw::Float(f) => format!("{f:.1}").parse(),
            Raw::Str(s) => s.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}
