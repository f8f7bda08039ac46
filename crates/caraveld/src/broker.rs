use crate::message::QueuedMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The durable broker is the only source of truth for pending work.
/// `dequeue` transfers exclusive ownership of a message to the caller until
/// it is either acked (done) or enqueued back (redriven without ack).
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Non-blocking: `None` when the queue is currently empty
    async fn dequeue(&self) -> anyhow::Result<Option<QueuedMessage>>;

    /// Hand an owned message back to the broker without acknowledging it
    async fn enqueue(&self, msg: QueuedMessage) -> anyhow::Result<()>;

    async fn ack(&self, msg: &QueuedMessage) -> anyhow::Result<()>;
}

struct MemoryBrokerState {
    ready: VecDeque<QueuedMessage>,
    /// Dequeued but not yet acked, with the time we handed them out
    unacked: HashMap<Uuid, (QueuedMessage, Instant)>,
}

/// In-memory broker with visibility-timeout redelivery: a message that is
/// dequeued but neither acked nor re-enqueued becomes eligible again after
/// the visibility timeout, matching the redelivery behavior the dispatch
/// loop assumes of the durable broker.
pub struct MemoryBroker {
    state: Mutex<MemoryBrokerState>,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryBrokerState {
                ready: VecDeque::new(),
                unacked: HashMap::new(),
            }),
            visibility_timeout,
        }
    }

    pub fn submit(&self, msg: QueuedMessage) {
        self.state.lock().ready.push_back(msg);
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.state.lock().unacked.len()
    }

    fn redrive_expired(state: &mut MemoryBrokerState, visibility_timeout: Duration) {
        let expired: Vec<Uuid> = state
            .unacked
            .iter()
            .filter(|(_, (_, since))| since.elapsed() >= visibility_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((msg, _)) = state.unacked.remove(&id) {
                state.ready.push_back(msg);
            }
        }
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn dequeue(&self) -> anyhow::Result<Option<QueuedMessage>> {
        let mut state = self.state.lock();
        Self::redrive_expired(&mut state, self.visibility_timeout);
        match state.ready.pop_front() {
            Some(msg) => {
                state
                    .unacked
                    .insert(msg.id, (msg.clone(), Instant::now()));
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn enqueue(&self, msg: QueuedMessage) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.unacked.remove(&msg.id);
        state.ready.push_back(msg);
        Ok(())
    }

    async fn ack(&self, msg: &QueuedMessage) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        match state.unacked.entry(msg.id) {
            Entry::Occupied(entry) => {
                entry.remove();
                Ok(())
            }
            Entry::Vacant(_) => {
                // Already redelivered elsewhere; acking is best-effort
                tracing::debug!("ack for unknown message {}", msg.id);
                Ok(())
            }
        }
    }
}
