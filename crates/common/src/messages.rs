//! Typed wire payloads for the bus queues.
//!
//! Every payload is UTF-8 JSON tagged with a `type` property; the tag is
//! the multiplexing key on the shared inbound queue. Unknown tags are acked
//! and dropped by consumers (with a log record), so the enums here only
//! model the types this core understands.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::merkle::ProofOp;

// ════════════════════════════════════════════════════════════════════════════
// INBOUND: work.in.cal
// ════════════════════════════════════════════════════════════════════════════

/// Messages multiplexed on the inbound calendar queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkMessage {
    /// An aggregation root from an upstream aggregator.
    #[serde(rename = "aggregator")]
    Aggregator { agg_id: Uuid, agg_root: String },

    /// A submitted bitcoin transaction carrying an anchor root.
    #[serde(rename = "btctx")]
    BtcTx {
        btctx_id: String,
        /// Raw transaction body, hex. Contains the anchor root hex somewhere
        /// inside; the engine splits around it.
        btctx_body: String,
        anchor_btc_agg_id: String,
        anchor_btc_agg_root: String,
    },

    /// A confirmation from the bitcoin monitor: the transaction landed in
    /// a block whose merkle root is `btchead_root`.
    #[serde(rename = "btcmon")]
    BtcMon {
        btctx_id: String,
        btchead_height: u64,
        btchead_root: String,
        /// Path from the txid to the block merkle root, `sha-256-x2` ops.
        path: Vec<ProofOp>,
    },

    /// A reward grant to pay out and record.
    #[serde(rename = "reward")]
    Reward {
        node: RewardShare,
        #[serde(skip_serializing_if = "Option::is_none")]
        core: Option<RewardShare>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardShare {
    pub address: String,
    pub amount: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// OUTBOUND: work.out.state
// ════════════════════════════════════════════════════════════════════════════

/// Anchor pointer inside a proof state: where the replayed value can be
/// checked against this calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorSpec {
    pub anchor_id: String,
    pub uris: Vec<String>,
}

/// An ordered operation list plus an optional anchor pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofState {
    pub ops: Vec<ProofOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorSpec>,
}

/// Proof-segment messages published to the state queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateMessage {
    /// Binds one aggregation root to a calendar block hash.
    #[serde(rename = "cal")]
    Cal {
        agg_id: Uuid,
        cal_id: u64,
        cal_state: ProofState,
    },

    /// Binds one calendar block hash to a bitcoin anchor aggregation root.
    #[serde(rename = "anchor_btc_agg")]
    AnchorBtcAgg {
        cal_id: u64,
        anchor_btc_agg_id: String,
        anchor_btc_agg_state: ProofState,
    },

    /// Binds an anchor aggregation root to a bitcoin transaction id.
    #[serde(rename = "btctx")]
    BtcTx {
        btctx_id: String,
        btctx_state: ProofState,
    },

    /// Binds a bitcoin transaction id to a confirmed block merkle root.
    #[serde(rename = "btchead")]
    BtcHead {
        btctx_id: String,
        btchead_height: u64,
        btchead_state: ProofState,
    },
}

// ════════════════════════════════════════════════════════════════════════════
// OUTBOUND: work.out.btctx / work.out.btcmon
// ════════════════════════════════════════════════════════════════════════════

/// Request to the bitcoin transaction service: anchor this root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "btctx")]
pub struct BtcTxRequest {
    pub anchor_btc_agg_id: String,
    pub anchor_btc_agg_root: String,
}

/// Request to the bitcoin monitor: watch this transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "btcmon")]
pub struct BtcMonRequest {
    pub tx_id: String,
}

// ════════════════════════════════════════════════════════════════════════════
// AUDIT QUEUE
// ════════════════════════════════════════════════════════════════════════════

/// Messages on the audit work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditMessage {
    /// Audit one node.
    #[serde(rename = "audit_node")]
    AuditNode {
        tnt_addr: String,
        public_uri: String,
        /// Nodes with a positive audit score at dispatch time.
        active_node_count: u64,
        /// When this node was last audited, if ever.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_audit_at_ms: Option<u64>,
        /// Whether that last audit passed in full.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_audit_passed: Option<bool>,
    },

    /// Delete audit-log rows older than the retention horizon.
    #[serde(rename = "prune")]
    Prune { batch: usize },
}
