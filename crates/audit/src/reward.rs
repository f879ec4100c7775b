//! Reward Engine: pays out token grants and records them on the calendar.
//!
//! Delivery is at-most-once by design: the inbound message is acked after
//! the transfers are *attempted*, success or not, because a redelivered
//! reward would pay the node twice. A failed transfer is logged once and
//! dropped.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

use dtsn_calendar::{Block, BlockAppender, BlockType, DataId};
use dtsn_common::bus::{Delivery, MessageBus};
use dtsn_common::lock::{LockService, CALENDAR_LOCK_KEY};
use dtsn_common::messages::RewardShare;

use crate::token::TokenService;

pub struct RewardEngine {
    appender: BlockAppender,
    locks: LockService,
    bus: Arc<dyn MessageBus>,
    token: Arc<dyn TokenService>,
}

impl RewardEngine {
    pub fn new(
        appender: BlockAppender,
        locks: LockService,
        bus: Arc<dyn MessageBus>,
        token: Arc<dyn TokenService>,
    ) -> Self {
        RewardEngine {
            appender,
            locks,
            bus,
            token,
        }
    }

    /// Handle one reward message. Always acks the delivery, whatever the
    /// transfer outcome.
    pub async fn handle(
        &self,
        node: RewardShare,
        core: Option<RewardShare>,
        delivery: Delivery,
    ) -> Option<Block> {
        let block = match self.pay_and_record(&node, core.as_ref()).await {
            Ok(block) => block,
            Err(e) => {
                // at-most-once: log and move on, never retry a transfer
                error!(node_addr = %node.address, error = %e, "reward handling failed");
                None
            }
        };
        if let Err(e) = self.bus.ack(&delivery).await {
            warn!(error = %e, "reward ack failed");
        }
        block
    }

    async fn pay_and_record(
        &self,
        node: &RewardShare,
        core: Option<&RewardShare>,
    ) -> Result<Option<Block>> {
        let node_trx = match self.token.transfer(&node.address, node.amount).await {
            Ok(trx) => trx,
            Err(e) => {
                error!(
                    node_addr = %node.address,
                    amount = node.amount,
                    error = %e,
                    "node reward transfer failed; grant dropped"
                );
                return Ok(None);
            }
        };
        info!(node_addr = %node.address, amount = node.amount, trx = %node_trx, "node reward paid");

        let core_paid = match core {
            Some(share) => match self.token.transfer(&share.address, share.amount).await {
                Ok(trx) => {
                    info!(core_addr = %share.address, amount = share.amount, trx = %trx, "core reward paid");
                    Some((share, trx))
                }
                Err(e) => {
                    error!(core_addr = %share.address, error = %e, "core reward transfer failed");
                    None
                }
            },
            None => None,
        };

        // data_id: nodeTx[:coreTx], data_val: nodeAddr:nodeAmount[:coreAddr:coreAmount]
        let (data_id, data_val) = match &core_paid {
            Some((share, core_trx)) => (
                format!("{}:{}", node_trx, core_trx),
                format!(
                    "{}:{}:{}:{}",
                    node.address, node.amount, share.address, share.amount
                ),
            ),
            None => (node_trx, format!("{}:{}", node.address, node.amount)),
        };

        let mut lease = self.locks.acquire(CALENDAR_LOCK_KEY, "reward").await;
        let appended = self
            .appender
            .append(BlockType::Reward, DataId::Fixed(data_id), data_val)
            .await;
        lease.release();

        Ok(Some(appended?))
    }
}
