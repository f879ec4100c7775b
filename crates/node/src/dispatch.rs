//! Inbound dispatcher: multiplexes `work.in.cal` onto the engines.
//!
//! One queue carries aggregator roots, submitted transactions, monitor
//! confirmations, and reward grants, distinguished by the `type` tag.
//! Ownership of the delivery moves to whichever engine takes the message;
//! unknown tags are acked and dropped with a log record.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use dtsn_audit::RewardEngine;
use dtsn_calendar::{AnchorEngine, CalendarWriter};
use dtsn_common::bus::{MessageBus, QUEUE_IN_CAL};
use dtsn_common::messages::WorkMessage;

const IDLE_MS: u64 = 500;

pub struct InboundDispatcher {
    bus: Arc<dyn MessageBus>,
    writer: Arc<CalendarWriter>,
    anchor: Arc<AnchorEngine>,
    reward: Arc<RewardEngine>,
    shutdown: Arc<Notify>,
}

impl InboundDispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        writer: Arc<CalendarWriter>,
        anchor: Arc<AnchorEngine>,
        reward: Arc<RewardEngine>,
    ) -> Self {
        InboundDispatcher {
            bus,
            writer,
            anchor,
            reward,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Route one inbound message. Returns false when the queue was empty.
    pub async fn poll_once(&self) -> bool {
        let delivery = match self.bus.get(QUEUE_IN_CAL).await {
            Ok(Some(d)) => d,
            Ok(None) => return false,
            Err(e) => {
                error!(error = %e, "inbound get failed");
                return false;
            }
        };

        match serde_json::from_slice::<WorkMessage>(&delivery.payload) {
            Ok(WorkMessage::Aggregator { agg_id, agg_root }) => {
                self.writer.enqueue_root(agg_id, agg_root, delivery).await;
            }
            Ok(WorkMessage::BtcTx {
                btctx_id,
                btctx_body,
                anchor_btc_agg_root,
                ..
            }) => {
                self.anchor
                    .handle_btctx(btctx_id, btctx_body, anchor_btc_agg_root, delivery)
                    .await;
            }
            Ok(WorkMessage::BtcMon {
                btctx_id,
                btchead_height,
                btchead_root,
                path,
            }) => {
                self.anchor
                    .enqueue_monitor(btctx_id, btchead_height, btchead_root, path, delivery);
            }
            Ok(WorkMessage::Reward { node, core }) => {
                self.reward.handle(node, core, delivery).await;
            }
            Err(e) => {
                warn!(error = %e, "unknown inbound message type, dropping");
                if let Err(ack_err) = self.bus.ack(&delivery).await {
                    warn!(error = %ack_err, "ack of unknown message failed");
                }
            }
        }
        true
    }

    pub async fn run(self: Arc<Self>) {
        info!("inbound dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("inbound dispatcher stopping");
                    break;
                }
                handled = self.poll_once() => {
                    if !handled {
                        tokio::time::sleep(std::time::Duration::from_millis(IDLE_MS)).await;
                    }
                }
            }
        }
    }
}
