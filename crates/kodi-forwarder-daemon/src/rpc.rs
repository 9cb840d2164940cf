//! Kodi JSON-RPC side channel
//!
//! The RPC interface is used for two things only: the liveness probe
//! (`JSONRPC.Ping`) and the polite half of power-off (`System.Shutdown`).
//! Both are plain HTTP POSTs with a fixed short timeout; a timeout counts
//! as a failure like any other.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::session::ControlPoint;

pub struct JsonRpcClient {
    url: String,
    user: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl JsonRpcClient {
    pub fn new(
        host: &str,
        port: u16,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: format!("http://{host}:{port}/jsonrpc"),
            user,
            password,
            client,
        })
    }

    async fn call(&self, method: &str) -> Result<reqwest::StatusCode, reqwest::Error> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": 1,
        });

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        Ok(request.send().await?.status())
    }
}

#[async_trait]
impl ControlPoint for JsonRpcClient {
    async fn ping(&self) -> bool {
        match self.call("JSONRPC.Ping").await {
            Ok(status) if status.is_success() => true,
            Ok(status) if status == reqwest::StatusCode::UNAUTHORIZED => {
                tracing::warn!("RPC ping rejected: check the configured credentials");
                false
            }
            Ok(status) => {
                tracing::debug!("RPC ping answered with {}", status);
                false
            }
            Err(e) => {
                tracing::debug!("RPC ping failed: {}", e);
                false
            }
        }
    }

    async fn shutdown(&self) -> bool {
        match self.call("System.Shutdown").await {
            Ok(status) if status.is_success() => true,
            Ok(status) => {
                tracing::warn!("RPC shutdown answered with {}", status);
                false
            }
            Err(e) => {
                tracing::warn!("RPC shutdown failed: {}", e);
                false
            }
        }
    }
}
