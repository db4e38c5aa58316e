// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use pilot_computer::{Computer, HttpComputer};
use pilot_config::ComputerSpec;
use pilot_schema::PortError;

/// The provisioner port: opens and closes computers by spec/name.
///
/// The actual VM/container lifecycle is an external collaborator; the core
/// only needs these two operations.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn open(&self, spec: &ComputerSpec) -> Result<Arc<dyn Computer>, PortError>;
    async fn close(&self, name: &str) -> Result<(), PortError>;
}

/// Client for an HTTP provisioner service.
///
/// - `POST /open`  with the spec → `{ "url": "<computer rpc url>" }`
/// - `POST /close` with `{ "name": … }`
pub struct HttpProvisioner {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn open(&self, spec: &ComputerSpec) -> Result<Arc<dyn Computer>, PortError> {
        let url = format!("{}/open", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("POST {url}: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PortError::Target(format!("invalid provisioner reply: {e}")))?;
        if !status.is_success() {
            return Err(PortError::Target(format!("provisioner {status}: {body}")));
        }
        let computer_url = body["url"]
            .as_str()
            .ok_or_else(|| PortError::Target("provisioner reply without url".into()))?;
        info!(%computer_url, "computer provisioned");
        let computer = HttpComputer::connect(computer_url).await?;
        Ok(Arc::new(computer))
    }

    async fn close(&self, name: &str) -> Result<(), PortError> {
        let url = format!("{}/close", self.base_url);
        self.client
            .post(&url)
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("POST {url}: {e}")))?;
        Ok(())
    }
}

/// Pre-provisioned computers handed out by spec match.  Used by the `run`
/// command (one known computer) and by tests.
pub struct StaticProvisioner {
    available: Mutex<Vec<Arc<dyn Computer>>>,
    closed: Mutex<Vec<String>>,
}

impl StaticProvisioner {
    pub fn new(computers: Vec<Arc<dyn Computer>>) -> Self {
        Self { available: Mutex::new(computers), closed: Mutex::new(Vec::new()) }
    }

    /// Names passed to `close`, for shutdown assertions.
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn open(&self, spec: &ComputerSpec) -> Result<Arc<dyn Computer>, PortError> {
        let mut available = self.available.lock().unwrap();
        let pos = available
            .iter()
            .position(|c| spec.accepts(c.os_type(), c.provider_type(), c.name()))
            .ok_or_else(|| {
                PortError::Target(format!("no pre-provisioned computer matches {spec:?}"))
            })?;
        Ok(available.remove(pos))
    }

    async fn close(&self, name: &str) -> Result<(), PortError> {
        self.closed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
