//! Message bus abstraction.
//!
//! The calendar core talks to its collaborators through durable queues with
//! at-least-once delivery. `MessageBus` is the seam: the in-process
//! [`MemoryBus`] backs single-binary deployments and every test, while a
//! broker-backed implementation can be dropped in behind the same trait.
//!
//! ## Delivery semantics
//!
//! - `publish` returns only once the message is durably enqueued (confirm
//!   semantics). A publish failure must be treated as if the message never
//!   existed.
//! - `get` hands out a [`Delivery`] that stays in flight until acked or
//!   nacked. At most `prefetch` deliveries per queue may be in flight.
//! - `nack` returns the message to the *head* of its queue and marks it
//!   redelivered, matching broker requeue behavior.
//! - On a lost connection a broker-backed implementation discards all
//!   in-progress work (unacked messages are redelivered) and reconnects
//!   every 5 s; `requeue_inflight` models the same event in-process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Inbound work for the calendar service.
pub const QUEUE_IN_CAL: &str = "work.in.cal";
/// Proof-segment state messages for downstream proof assembly.
pub const QUEUE_OUT_STATE: &str = "work.out.state";
/// Anchor roots awaiting bitcoin transaction submission.
pub const QUEUE_OUT_BTCTX: &str = "work.out.btctx";
/// Transaction ids awaiting confirmation monitoring.
pub const QUEUE_OUT_BTCMON: &str = "work.out.btcmon";
/// Per-node audit tasks.
pub const QUEUE_OUT_AUDIT: &str = "work.out.audit";
/// External task-handler work (per-predicate scoring lives there).
pub const QUEUE_TASK_HANDLER: &str = "task-handler-queue";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// One in-flight message. Owned by the consumer until acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Cheap availability probe. Callers that must not take durable local
    /// actions while the bus is down (the anchor path) gate on this.
    async fn ping(&self) -> Result<(), BusError>;

    /// Durably enqueue `payload` on `queue`; confirm semantics.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Take the next message, or `None` when the queue is empty or the
    /// prefetch window is full.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BusError>;

    /// Acknowledge a delivery; the message is gone for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Reject a delivery; the message returns to the head of its queue.
    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Ready (not in-flight) messages currently on `queue`.
    async fn depth(&self, queue: &str) -> usize;
}

// ════════════════════════════════════════════════════════════════════════════
// IN-MEMORY BUS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>, bool)>,
    inflight: HashMap<u64, (Vec<u8>, bool)>,
}

/// In-process implementation of [`MessageBus`].
///
/// FIFO per queue with in-flight tracking; `requeue_inflight` simulates a
/// connection loss, returning every unacked delivery to its queue head the
/// way a broker would on channel close.
pub struct MemoryBus {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: Mutex<u64>,
    prefetch: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_prefetch(10)
    }

    pub fn with_prefetch(prefetch: usize) -> Self {
        MemoryBus {
            queues: Mutex::new(HashMap::new()),
            next_tag: Mutex::new(1),
            prefetch: prefetch.max(1),
        }
    }

    /// Return all unacked deliveries to the heads of their queues.
    pub fn requeue_inflight(&self) {
        let mut queues = self.queues.lock();
        for state in queues.values_mut() {
            let mut tags: Vec<u64> = state.inflight.keys().copied().collect();
            tags.sort_unstable();
            // newest first so the oldest ends up at the very head
            for tag in tags.into_iter().rev() {
                if let Some((payload, _)) = state.inflight.remove(&tag) {
                    state.ready.push_front((tag, payload, true));
                }
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut queues = self.queues.lock();
        let tag = {
            let mut next = self.next_tag.lock();
            let t = *next;
            *next += 1;
            t
        };
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back((tag, payload, false));
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        if state.inflight.len() >= self.prefetch {
            return Ok(None);
        }
        match state.ready.pop_front() {
            Some((tag, payload, redelivered)) => {
                state.inflight.insert(tag, (payload.clone(), redelivered));
                Ok(Some(Delivery {
                    queue: queue.to_string(),
                    tag,
                    payload,
                    redelivered,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or(BusError::UnknownDelivery(delivery.tag))?;
        state
            .inflight
            .remove(&delivery.tag)
            .ok_or(BusError::UnknownDelivery(delivery.tag))?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or(BusError::UnknownDelivery(delivery.tag))?;
        let (payload, _) = state
            .inflight
            .remove(&delivery.tag)
            .ok_or(BusError::UnknownDelivery(delivery.tag))?;
        state.ready.push_front((delivery.tag, payload, true));
        Ok(())
    }

    async fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|s| s.ready.len())
            .unwrap_or(0)
    }
}
