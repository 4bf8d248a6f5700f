// src/network/transport.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerReply {
    pub status: u16,
    pub body: Value,
}

impl PeerReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound request path to peers. HTTP in production; tests swap in an
/// in-process router.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn post_json(&self, base_url: &str, path: &str, body: &Value) -> Result<PeerReply>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn post_json(&self, base_url: &str, path: &str, body: &Value) -> Result<PeerReply> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.with_context(|| format!("read body of {}", url))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok(PeerReply { status, body })
    }
}
