//! Audit Engine: periodic rounds, per-node evaluation, retention pruning.
//!
//! Two halves with different election rules:
//!
//! - the **producer** (leader-only) generates challenges, dispatches one
//!   `audit_node` task per reachable node, decays URI-less scores, and
//!   schedules pruning;
//! - the **worker** (any process) consumes tasks, queries the node,
//!   evaluates the eight predicates, and records the outcome.

use chrono::{Timelike, Utc};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use dtsn_common::bus::{Delivery, MessageBus, QUEUE_OUT_AUDIT};
use dtsn_common::config::AuditConfig;
use dtsn_common::crypto::verify_update_hmac;
use dtsn_common::error::CoreError;
use dtsn_common::leader::{LeaderState, ROLE_AUDIT_PRODUCER};
use dtsn_common::messages::AuditMessage;

use crate::challenge::ChallengeManager;
use crate::client::{NodeAuditReport, NodeClient};
use crate::registry::{version_gte, AuditRow, RegisteredNode, RegistryStore};
use crate::token::TokenService;

/// How often the worker polls an empty audit queue.
const WORKER_IDLE_SECS: u64 = 2;

pub struct AuditEngine {
    registry: RegistryStore,
    challenge: Arc<ChallengeManager>,
    bus: Arc<dyn MessageBus>,
    leader: Arc<LeaderState>,
    token: Arc<dyn TokenService>,
    node_client: Arc<dyn NodeClient>,
    cfg: AuditConfig,
    shutdown: Arc<Notify>,
}

impl AuditEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: RegistryStore,
        challenge: Arc<ChallengeManager>,
        bus: Arc<dyn MessageBus>,
        leader: Arc<LeaderState>,
        token: Arc<dyn TokenService>,
        node_client: Arc<dyn NodeClient>,
        cfg: AuditConfig,
    ) -> Self {
        AuditEngine {
            registry,
            challenge,
            bus,
            leader,
            token,
            node_client,
            cfg,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    // ────────────────────────────────────────────────────────────────────
    // producer
    // ────────────────────────────────────────────────────────────────────

    /// Generate a fresh challenge. Leader-only; a no-op elsewhere.
    pub fn generate_challenge(&self) -> Result<bool, CoreError> {
        if !self.leader.is_leader(ROLE_AUDIT_PRODUCER) {
            return Ok(false);
        }
        self.challenge.generate()?;
        Ok(true)
    }

    /// One audit round: dispatch tasks, decay URI-less scores, schedule
    /// pruning, and top off credits once per day. Returns the number of
    /// tasks dispatched.
    pub async fn produce_round(&self) -> Result<usize, CoreError> {
        if !self.leader.is_leader(ROLE_AUDIT_PRODUCER) {
            return Ok(0);
        }

        let nodes = self.registry.all()?;
        let active_node_count = nodes.iter().filter(|n| n.audit_score > 0).count() as u64;

        let mut dispatched = 0usize;
        for node in nodes.iter().filter(|n| n.public_uri.is_some()) {
            let last = self.registry.last_audit(&node.tnt_addr)?;
            let task = AuditMessage::AuditNode {
                tnt_addr: node.tnt_addr.clone(),
                public_uri: node.public_uri.clone().unwrap_or_default(),
                active_node_count,
                last_audit_at_ms: last.as_ref().map(|row| row.audit_at_ms),
                last_audit_passed: last.as_ref().map(|row| row.all_pass()),
            };
            let payload = serde_json::to_vec(&task)
                .map_err(|e| CoreError::Fatal(format!("task codec: {}", e)))?;
            self.bus
                .publish(QUEUE_OUT_AUDIT, payload)
                .await
                .map_err(|e| CoreError::DependencyUnavailable(format!("audit publish: {}", e)))?;
            dispatched += 1;
        }

        let decayed = self.registry.decay_uriless_scores()?;

        let prune = AuditMessage::Prune {
            batch: self.cfg.prune_batch,
        };
        let payload = serde_json::to_vec(&prune)
            .map_err(|e| CoreError::Fatal(format!("task codec: {}", e)))?;
        self.bus
            .publish(QUEUE_OUT_AUDIT, payload)
            .await
            .map_err(|e| CoreError::DependencyUnavailable(format!("audit publish: {}", e)))?;

        let today = (Utc::now().timestamp() / 86_400) as u64;
        self.registry
            .daily_credit_topoff(self.cfg.daily_credit_topoff, today)?;

        info!(dispatched, decayed, active_node_count, "audit round dispatched");
        Ok(dispatched)
    }

    // ────────────────────────────────────────────────────────────────────
    // worker
    // ────────────────────────────────────────────────────────────────────

    /// Consume one audit-queue message. Returns false when the queue was
    /// empty.
    pub async fn consume_once(&self) -> Result<bool, CoreError> {
        let delivery = match self.bus.get(QUEUE_OUT_AUDIT).await {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(false),
            Err(e) => return Err(CoreError::DependencyUnavailable(format!("audit get: {}", e))),
        };

        match serde_json::from_slice::<AuditMessage>(&delivery.payload) {
            Ok(AuditMessage::AuditNode {
                tnt_addr,
                public_uri,
                ..
            }) => {
                if let Err(e) = self.audit_node(&tnt_addr, &public_uri).await {
                    // record/score failures are retryable; put the task back
                    warn!(%tnt_addr, error = %e, "audit task failed, nacking");
                    self.nack(&delivery).await;
                    return Ok(true);
                }
                self.ack(&delivery).await;
            }
            Ok(AuditMessage::Prune { batch }) => {
                match self.prune_batch(batch).await {
                    Ok(removed) if removed >= batch => {
                        // more rows remain: schedule the next batch
                        let next = AuditMessage::Prune { batch };
                        if let Ok(payload) = serde_json::to_vec(&next) {
                            if let Err(e) = self.bus.publish(QUEUE_OUT_AUDIT, payload).await {
                                warn!(error = %e, "failed to schedule next prune batch");
                            }
                        }
                        self.ack(&delivery).await;
                    }
                    Ok(_) => self.ack(&delivery).await,
                    Err(e) => {
                        warn!(error = %e, "prune failed, nacking");
                        self.nack(&delivery).await;
                    }
                }
            }
            Err(e) => {
                // unknown or malformed task types are dropped, not requeued
                warn!(error = %e, "unknown audit message, dropping");
                self.ack(&delivery).await;
            }
        }
        Ok(true)
    }

    /// Query one node and fold the eight predicates into the registry.
    pub async fn audit_node(&self, tnt_addr: &str, public_uri: &str) -> Result<AuditRow, CoreError> {
        let Some(node) = self.registry.get(tnt_addr)? else {
            return Err(CoreError::NotFound(format!("node {} vanished", tnt_addr)));
        };

        let report = self.node_client.fetch_report(public_uri).await.ok();
        let row = self.evaluate(&node, public_uri, report.as_ref()).await?;

        self.registry.record_audit(&row)?;
        self.registry.apply_audit_outcome(tnt_addr, row.all_pass())?;
        info!(
            tnt_addr,
            reachable = row.reachable,
            pass = row.all_pass(),
            "node audited"
        );
        Ok(row)
    }

    async fn evaluate(
        &self,
        node: &RegisteredNode,
        public_uri: &str,
        report: Option<&NodeAuditReport>,
    ) -> Result<AuditRow, CoreError> {
        let audit_at_ms = Utc::now().timestamp_millis() as u64;
        let Some(report) = report else {
            // unreachable: every predicate fails
            return Ok(AuditRow {
                tnt_addr: node.tnt_addr.clone(),
                audit_at_ms,
                reachable: false,
                public_ip_pass: false,
                public_uri_pass: false,
                time_pass: false,
                cal_state_pass: false,
                min_credits_pass: false,
                node_version_pass: false,
                tnt_balance_pass: false,
            });
        };

        let expected_ip = uri_host_ip(public_uri);
        let public_ip_pass = match (&expected_ip, &report.public_ip) {
            (Some(expected), Some(reported)) => {
                IpAddr::from_str(reported).map(|ip| ip == *expected).unwrap_or(false)
            }
            _ => false,
        };

        let public_uri_pass = report
            .public_uri
            .as_deref()
            .map(|u| u.trim_end_matches('/') == public_uri.trim_end_matches('/'))
            .unwrap_or(false);

        // the node's minute HMAC is the clock probe: it only verifies when
        // the node's clock is within one minute of ours
        let time_pass = report
            .minute_hmac
            .as_deref()
            .map(|mac| {
                verify_update_hmac(&node.hmac_key, &node.tnt_addr, public_uri, mac, Utc::now())
            })
            .unwrap_or(false);

        let cal_state_pass = self
            .challenge
            .solution_matches(report.calendar_solution.as_deref())?;

        let min_credits_pass = node.tnt_credit >= self.cfg.min_credit;

        let node_version_pass = report
            .version
            .as_deref()
            .map(|v| version_gte(v, &self.cfg.min_version_existing))
            .unwrap_or(false);

        let tnt_balance_pass = match self.token.balance(&node.tnt_addr).await {
            Ok(balance) => balance >= self.cfg.min_balance_grains,
            Err(e) => {
                warn!(tnt_addr = %node.tnt_addr, error = %e, "balance check failed during audit");
                false
            }
        };

        Ok(AuditRow {
            tnt_addr: node.tnt_addr.clone(),
            audit_at_ms,
            reachable: true,
            public_ip_pass,
            public_uri_pass,
            time_pass,
            cal_state_pass,
            min_credits_pass,
            node_version_pass,
            tnt_balance_pass,
        })
    }

    async fn prune_batch(&self, batch: usize) -> Result<usize, CoreError> {
        let cutoff_ms = Utc::now().timestamp_millis() as u64
            - self.cfg.prune_retention_secs * 1_000;
        let removed = self.registry.prune_audits(cutoff_ms, batch)?;
        if removed > 0 {
            info!(removed, "audit rows pruned");
        }
        Ok(removed)
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.bus.ack(delivery).await {
            warn!(error = %e, "audit ack failed");
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        if let Err(e) = self.bus.nack(delivery).await {
            error!(error = %e, "audit nack failed");
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // loops
    // ────────────────────────────────────────────────────────────────────

    /// Seconds until the next round slot. Rounds sit half a period off the
    /// top of the hour so they never collide with anchor runs.
    fn secs_until_next_round(&self) -> u64 {
        let period = self.cfg.round_interval_secs.max(1);
        let now = Utc::now();
        let into_hour = now.minute() as u64 * 60 + now.second() as u64;
        let offset = (period / 2) % period;
        let phase = (into_hour + period - offset) % period;
        period - phase
    }

    /// Producer loop: challenges at their own cadence, rounds at theirs.
    pub async fn run_producer(self: Arc<Self>) {
        info!(
            challenge_secs = self.cfg.challenge_interval_secs,
            round_secs = self.cfg.round_interval_secs,
            "audit producer started"
        );
        let mut challenge_interval = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.challenge_interval_secs.max(1),
        ));
        let mut next_round = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.secs_until_next_round());
        loop {
            tokio::select! {
                _ = challenge_interval.tick() => {
                    if let Err(e) = self.generate_challenge() {
                        error!(error = %e, "challenge generation failed");
                    }
                }
                _ = tokio::time::sleep_until(next_round) => {
                    if let Err(e) = self.produce_round().await {
                        error!(error = %e, "audit round failed");
                    }
                    next_round = tokio::time::Instant::now()
                        + std::time::Duration::from_secs(self.cfg.round_interval_secs.max(1));
                }
                _ = self.shutdown.notified() => {
                    info!("audit producer stopping");
                    break;
                }
            }
        }
    }

    /// Worker loop: drain the audit queue, idle briefly when empty.
    pub async fn run_worker(self: Arc<Self>) {
        info!("audit worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("audit worker stopping");
                    break;
                }
                worked = self.consume_once() => {
                    match worked {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::time::sleep(std::time::Duration::from_secs(WORKER_IDLE_SECS)).await;
                        }
                        Err(e) => {
                            error!(error = %e, "audit consume failed");
                            tokio::time::sleep(std::time::Duration::from_secs(WORKER_IDLE_SECS)).await;
                        }
                    }
                }
            }
        }
    }
}

/// Host IP of a registered public URI.
fn uri_host_ip(public_uri: &str) -> Option<IpAddr> {
    let url = reqwest::Url::parse(public_uri).ok()?;
    IpAddr::from_str(url.host_str()?).ok()
}
