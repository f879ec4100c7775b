//! Token service client: balance reads and reward transfers.
//!
//! The token service is an external collaborator; [`TokenService`] is the
//! seam. [`HttpTokenService`] talks to the real service with a 10 s
//! timeout; [`MockTokenService`] is fully in-memory for tests and local
//! stacks, with configurable balances and failure injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use dtsn_common::error::CoreError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait TokenService: Send + Sync {
    /// Current balance of `addr`, in grains.
    async fn balance(&self, addr: &str) -> Result<u64, CoreError>;

    /// Transfer `value` grains to `to_addr`; returns the transaction id.
    async fn transfer(&self, to_addr: &str, value: u64) -> Result<String, CoreError>;
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Deserialize)]
struct TransferResponse {
    trx_id: String,
}

pub struct HttpTokenService {
    client: reqwest::Client,
    base: String,
}

impl HttpTokenService {
    pub fn new(base: impl Into<String>) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Fatal(format!("http client: {}", e)))?;
        Ok(HttpTokenService {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn balance(&self, addr: &str) -> Result<u64, CoreError> {
        let url = format!("{}/balance/{}", self.base, addr);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("token service: {}", e)))?
            .error_for_status()
            .map_err(|e| CoreError::DependencyUnavailable(format!("token service: {}", e)))?;
        let body: BalanceResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("token service body: {}", e)))?;
        Ok(body.balance)
    }

    async fn transfer(&self, to_addr: &str, value: u64) -> Result<String, CoreError> {
        let url = format!("{}/transfer", self.base);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "to_addr": to_addr, "value": value }))
            .send()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("token service: {}", e)))?
            .error_for_status()
            .map_err(|e| CoreError::DependencyUnavailable(format!("token service: {}", e)))?;
        let body: TransferResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("token service body: {}", e)))?;
        Ok(body.trx_id)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK
// ════════════════════════════════════════════════════════════════════════════

/// In-memory token service for tests and local stacks.
pub struct MockTokenService {
    default_balance: u64,
    balances: Mutex<HashMap<String, u64>>,
    transfers: Mutex<Vec<(String, u64)>>,
    fail_transfers: Mutex<bool>,
    next_trx: Mutex<u64>,
}

impl MockTokenService {
    pub fn new() -> Self {
        Self::with_balance(u64::MAX)
    }

    /// Every unknown address reports `balance`.
    pub fn with_balance(balance: u64) -> Self {
        MockTokenService {
            default_balance: balance,
            balances: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            fail_transfers: Mutex::new(false),
            next_trx: Mutex::new(1),
        }
    }

    pub fn set_balance(&self, addr: &str, balance: u64) {
        self.balances.lock().insert(addr.to_string(), balance);
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        *self.fail_transfers.lock() = fail;
    }

    /// Transfers attempted so far, in order.
    pub fn transfers(&self) -> Vec<(String, u64)> {
        self.transfers.lock().clone()
    }
}

impl Default for MockTokenService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenService for MockTokenService {
    async fn balance(&self, addr: &str) -> Result<u64, CoreError> {
        Ok(self
            .balances
            .lock()
            .get(addr)
            .copied()
            .unwrap_or(self.default_balance))
    }

    async fn transfer(&self, to_addr: &str, value: u64) -> Result<String, CoreError> {
        if *self.fail_transfers.lock() {
            return Err(CoreError::DependencyUnavailable("transfer refused".into()));
        }
        self.transfers.lock().push((to_addr.to_string(), value));
        let mut next = self.next_trx.lock();
        let id = format!("trx-{:04}", *next);
        *next += 1;
        Ok(id)
    }
}
