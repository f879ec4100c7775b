//! Audit-time HTTP client for participant nodes.
//!
//! Nodes expose an audit endpoint reporting their identity, clock HMAC,
//! and the current challenge solution. [`NodeClient`] is the seam;
//! [`MockNodeClient`] scripts responses per node for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use dtsn_common::error::CoreError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// What a node reports when audited. All fields optional: a node that
/// answers with garbage simply fails the corresponding predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAuditReport {
    pub public_ip: Option<String>,
    pub public_uri: Option<String>,
    /// The node's solution to the current audit challenge, 32-byte hex.
    pub calendar_solution: Option<String>,
    /// `HMAC-SHA256(hmac_key, addr || uri || minute)` computed at the
    /// node's clock; doubles as the clock-skew probe.
    pub minute_hmac: Option<String>,
    pub version: Option<String>,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch the audit report from a node's public URI. An `Err` means the
    /// node was unreachable.
    async fn fetch_report(&self, public_uri: &str) -> Result<NodeAuditReport, CoreError>;
}

pub struct HttpNodeClient {
    client: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new() -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Fatal(format!("http client: {}", e)))?;
        Ok(HttpNodeClient { client })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn fetch_report(&self, public_uri: &str) -> Result<NodeAuditReport, CoreError> {
        let url = format!("{}/audit", public_uri.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("node unreachable: {}", e)))?
            .error_for_status()
            .map_err(|e| CoreError::DependencyUnavailable(format!("node audit error: {}", e)))?;
        resp.json()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("node audit body: {}", e)))
    }
}

/// Scripted node responses keyed by public URI; URIs without a script are
/// unreachable.
#[derive(Default)]
pub struct MockNodeClient {
    reports: Mutex<HashMap<String, NodeAuditReport>>,
}

impl MockNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, public_uri: &str, report: NodeAuditReport) {
        self.reports.lock().insert(public_uri.to_string(), report);
    }

    pub fn unscript(&self, public_uri: &str) {
        self.reports.lock().remove(public_uri);
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn fetch_report(&self, public_uri: &str) -> Result<NodeAuditReport, CoreError> {
        self.reports
            .lock()
            .get(public_uri)
            .cloned()
            .ok_or_else(|| CoreError::DependencyUnavailable("node unreachable".into()))
    }
}
