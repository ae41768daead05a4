// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Delegated provisioning: ask an instance-management service for a solver
//! instead of starting one here.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::LaunchMode;
use crate::error::{LaunchError, Result};
use crate::lifecycle::{DelegatedInstance, Ownership, ServerHandle};
use crate::resolver::LaunchPlan;

const PRODUCT_NAME: &str = "mapdl";
const GRPC_SERVICE: &str = "grpc";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to ask the service for.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSpec {
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
}

#[async_trait]
pub trait ProvisioningService: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceId>;

    /// Wait until the instance reports ready and return its gRPC address as
    /// `host:port`.
    async fn wait_until_ready(&self, id: &InstanceId, timeout: Duration) -> Result<String>;

    async fn delete_instance(&self, id: &InstanceId) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PimConfig {
    pub version: u32,
    pub pim: PimEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PimEndpoint {
    pub uri: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub tls: bool,
}

impl PimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LaunchError::config(format!(
                "reading provisioning configuration {}: {e}",
                path.display()
            ))
        })?;
        let config: PimConfig = serde_json::from_str(&raw).map_err(|e| {
            LaunchError::config(format!(
                "parsing provisioning configuration {}: {e}",
                path.display()
            ))
        })?;
        if config.version != 1 {
            return Err(LaunchError::config(format!(
                "unsupported provisioning configuration version {}",
                config.version
            )));
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct InstanceResource {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    services: HashMap<String, ServiceEndpoint>,
}

#[derive(Debug, Deserialize)]
struct ServiceEndpoint {
    uri: String,
}

/// REST client for the product instance management service.
pub struct PimClient {
    base: String,
    http: reqwest::Client,
}

fn service_error(e: impl ToString) -> LaunchError {
    LaunchError::spawn("provisioning service", e)
}

impl PimClient {
    pub fn new(endpoint: &PimEndpoint) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (k, v) in &endpoint.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| LaunchError::config(format!("provisioning header {k:?}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| LaunchError::config(format!("provisioning header {k:?}: {e}")))?;
            headers.insert(name, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(service_error)?;

        let uri = endpoint.uri.trim_end_matches('/');
        let base = if uri.contains("://") {
            uri.to_string()
        } else if endpoint.tls {
            format!("https://{uri}")
        } else {
            format!("http://{uri}")
        };
        Ok(Self { base, http })
    }

    pub fn from_config_file(path: &Path) -> Result<Self> {
        Self::new(&PimConfig::load(path)?.pim)
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<InstanceResource> {
        self.http
            .get(format!("{}/v1/{}", self.base, id))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(service_error)?
            .json()
            .await
            .map_err(service_error)
    }
}

/// `dns:host:port` and `host:port` both come back as `host:port`.
fn grpc_address(uri: &str) -> &str {
    uri.strip_prefix("dns:").unwrap_or(uri)
}

#[async_trait]
impl ProvisioningService for PimClient {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceId> {
        let created: InstanceResource = self
            .http
            .post(format!("{}/v1/instances", self.base))
            .json(spec)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(service_error)?
            .json()
            .await
            .map_err(service_error)?;
        Ok(InstanceId(created.name))
    }

    async fn wait_until_ready(&self, id: &InstanceId, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_status = String::new();
        loop {
            let instance = self.get_instance(id).await?;
            if instance.ready {
                let service = instance.services.get(GRPC_SERVICE).ok_or_else(|| {
                    service_error(format!("instance {id} is ready but exposes no grpc service"))
                })?;
                return Ok(grpc_address(&service.uri).to_string());
            }
            if let Some(msg) = instance.status_message {
                debug!("instance {id}: {msg}");
                last_status = msg;
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Err(LaunchError::ReadinessTimeout {
                    timeout,
                    output_tail: last_status,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        self.http
            .delete(format!("{}/v1/{}", self.base, id))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(service_error)?;
        Ok(())
    }
}

fn split_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| service_error(format!("malformed service address {address:?}")))?;
    let port = port
        .parse()
        .map_err(|_| service_error(format!("malformed service port in {address:?}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Forward the launch to `service` and wrap the result in a handle that
/// hands teardown back to it. The instance is released again if it never
/// becomes usable or `cancel` fires first.
pub async fn provision(
    plan: &LaunchPlan,
    service: Arc<dyn ProvisioningService>,
    cancel: &CancellationToken,
) -> Result<ServerHandle> {
    let spec = InstanceSpec {
        product_name: PRODUCT_NAME.to_string(),
        product_version: plan.version.map(|v| v.to_string()),
    };
    // let the request land so a cancelled launch can still release it
    let id = service.create_instance(&spec).await?;
    info!("[{}] requested delegated instance {id}", plan.jobname);

    let ready = if cancel.is_cancelled() {
        Err(LaunchError::Cancelled)
    } else {
        tokio::select! {
            r = service.wait_until_ready(&id, plan.timeout) => r,
            _ = cancel.cancelled() => Err(LaunchError::Cancelled),
        }
    };
    let endpoint = ready.and_then(|address| {
        let (host, port) = split_address(&address)?;
        Ok((address, host, port))
    });
    let (address, host, port) = match endpoint {
        Ok(endpoint) => endpoint,
        Err(e) => {
            if let Err(del) = service.delete_instance(&id).await {
                warn!("[{}] failed to release instance {id}: {del}", plan.jobname);
            }
            return Err(e);
        }
    };
    info!("[{}] delegated instance {id} ready at {address}", plan.jobname);

    let mut handle = ServerHandle::new(
        LaunchMode::Delegated,
        host,
        port,
        plan.jobname.clone(),
        Ownership::Delegated(DelegatedInstance {
            id,
            service,
            released: false,
        }),
    );
    handle.version = plan.version;
    handle.clear_on_connect = plan.clear_on_connect;
    Ok(handle)
}
