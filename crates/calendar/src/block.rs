//! Calendar block structure and hash construction.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use dtsn_common::crypto::{decode_value, sha256_hex};

/// Current block schema version.
pub const BLOCK_VERSION: u64 = 1;

/// 64 hex zeros: genesis `prev_hash` and genesis `data_val`.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Block type tag. `data_id`/`data_val` meaning is type-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    /// Genesis; exactly one per calendar, id 0.
    #[serde(rename = "gen")]
    Gen,
    /// Calendar aggregation: `data_val` is the merkle root over the tick's
    /// aggregation roots, `data_id` repeats the block id.
    #[serde(rename = "cal")]
    Cal,
    /// NIST beacon value: `data_id` is the beacon timestamp.
    #[serde(rename = "nist")]
    Nist,
    /// Bitcoin anchor submission: `data_val` is the anchor aggregation
    /// root, `data_id` is empty until confirmation.
    #[serde(rename = "btc-a")]
    BtcA,
    /// Bitcoin anchor confirmation: `data_id` is the bitcoin block height,
    /// `data_val` the block merkle root.
    #[serde(rename = "btc-c")]
    BtcC,
    /// Token reward payout record.
    #[serde(rename = "reward")]
    Reward,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Gen => "gen",
            BlockType::Cal => "cal",
            BlockType::Nist => "nist",
            BlockType::BtcA => "btc-a",
            BlockType::BtcC => "btc-c",
            BlockType::Reward => "reward",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of the append-only calendar.
///
/// Blocks are created once and never mutated or deleted. `hash` commits to
/// every other field except `sig`; `sig` is the signer's detached
/// signature over the ASCII hex of `hash`, prefixed with the signer's
/// public-key fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: u64,
    /// Seconds since epoch at append time.
    pub time: u64,
    pub version: u64,
    /// Identifies the writing deployment; lets multiple stacks share
    /// downstream consumers.
    pub stack_id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub data_id: String,
    pub data_val: String,
    pub prev_hash: String,
    pub hash: String,
    /// `fingerprint12:base64Signature`.
    pub sig: String,
}

impl Block {
    /// The hash preimage prefix: `id:time:version:stackId:type:dataId`.
    pub fn hash_prefix(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.id, self.time, self.version, self.stack_id, self.block_type, self.data_id
        )
    }

    /// `SHA-256( utf8(prefix) || bytes(data_val) || bytes(prev_hash) )`
    /// where `data_val` decodes as hex when it parses as hex and UTF-8
    /// otherwise, and `prev_hash` always decodes as hex.
    pub fn compute_hash(&self) -> Result<String> {
        let mut preimage = self.hash_prefix().into_bytes();
        preimage.extend_from_slice(&decode_value(&self.data_val));
        let prev = hex::decode(&self.prev_hash)
            .map_err(|e| anyhow!("prev_hash is not hex: {}", e))?;
        preimage.extend_from_slice(&prev);
        Ok(sha256_hex(&preimage))
    }

    /// Verify the stored `hash` against the block's own fields.
    pub fn hash_is_valid(&self) -> bool {
        self.compute_hash().map(|h| h == self.hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtsn_common::crypto::sha256_hex;

    fn sample_block() -> Block {
        Block {
            id: 1,
            time: 1_700_000_000,
            version: BLOCK_VERSION,
            stack_id: "stack-a".into(),
            block_type: BlockType::Cal,
            data_id: "1".into(),
            data_val: "aa".repeat(32),
            prev_hash: "bb".repeat(32),
            hash: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn type_tags_serialize_to_wire_names() {
        assert_eq!(serde_json::to_string(&BlockType::BtcA).unwrap(), r#""btc-a""#);
        assert_eq!(serde_json::to_string(&BlockType::Gen).unwrap(), r#""gen""#);
        let t: BlockType = serde_json::from_str(r#""btc-c""#).unwrap();
        assert_eq!(t, BlockType::BtcC);
    }

    #[test]
    fn hash_matches_manual_construction() {
        let mut b = sample_block();
        let mut preimage = b"1:1700000000:1:stack-a:cal:1".to_vec();
        preimage.extend_from_slice(&[0xaa; 32]);
        preimage.extend_from_slice(&[0xbb; 32]);
        let expected = sha256_hex(&preimage);

        b.hash = b.compute_hash().unwrap();
        assert_eq!(b.hash, expected);
        assert!(b.hash_is_valid());
    }

    #[test]
    fn utf8_data_val_hashes_as_utf8() {
        let mut b = sample_block();
        b.block_type = BlockType::Reward;
        b.data_id = "txabc".into();
        b.data_val = "0xdead:500".into(); // colon makes it non-hex

        let mut preimage = format!("1:1700000000:1:stack-a:reward:txabc").into_bytes();
        preimage.extend_from_slice(b"0xdead:500");
        preimage.extend_from_slice(&[0xbb; 32]);
        assert_eq!(b.compute_hash().unwrap(), sha256_hex(&preimage));
    }

    #[test]
    fn tampering_breaks_hash() {
        let mut b = sample_block();
        b.hash = b.compute_hash().unwrap();
        b.data_val = "cc".repeat(32);
        assert!(!b.hash_is_valid());
    }

    #[test]
    fn empty_data_id_allowed() {
        let mut b = sample_block();
        b.block_type = BlockType::BtcA;
        b.data_id = String::new();
        b.hash = b.compute_hash().unwrap();
        assert!(b.hash.len() == 64 && b.hash_is_valid());
        assert!(b.hash_prefix().ends_with("btc-a:"));
    }
}
