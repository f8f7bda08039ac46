use crate::event_store::EventStore;
use crate::message::QueuedMessage;
use async_trait::async_trait;
use caravel_log_types::{Event, EventKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Reason text recorded when a message exceeds its time-in-queue budget
pub const TIMED_OUT_IN_QUEUE: &str = "Timed out in queue.";

/// Reason text recorded when the recipient domain has no mail exchangers
pub const DOMAIN_NOT_FOUND: &str = "550 Domain Not Found.";

/// The terminal classification of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    Delivered,
    Deferred,
    ServiceUnavailable,
    Throttled,
    Failed,
    TimedOut,
}

/// A durable state change applied to a message by the recorder
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTransition {
    pub message_id: Uuid,
    pub disposition: Disposition,
    pub reason: Option<String>,
    pub source_ip: Option<String>,
    pub mx_host: Option<String>,
    pub attempts: u16,
    pub timestamp: DateTime<Utc>,
}

/// Persistent message state lives with an external collaborator; the core
/// only pushes state transitions through this seam.
#[async_trait]
pub trait MessageStateStore: Send + Sync {
    async fn apply(&self, transition: &DeliveryTransition) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    transitions: Mutex<Vec<DeliveryTransition>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<DeliveryTransition> {
        self.transitions.lock().clone()
    }

    pub fn transitions_for(&self, message_id: Uuid) -> Vec<DeliveryTransition> {
        self.transitions
            .lock()
            .iter()
            .filter(|t| t.message_id == message_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStateStore for MemoryStateStore {
    async fn apply(&self, transition: &DeliveryTransition) -> anyhow::Result<()> {
        self.transitions.lock().push(transition.clone());
        Ok(())
    }
}

/// Converts delivery outcomes into durable message state transitions and
/// emits the corresponding events. Operations are idempotent per
/// (message id, attempt, outcome kind): replaying an attempt that was
/// already durably recorded is a no-op.
pub struct OutcomeRecorder {
    state: Arc<dyn MessageStateStore>,
    events: Arc<dyn EventStore>,
    recorded: DashMap<(Uuid, u16, Disposition), ()>,
}

impl OutcomeRecorder {
    pub fn new(state: Arc<dyn MessageStateStore>, events: Arc<dyn EventStore>) -> Self {
        Self {
            state,
            events,
            recorded: DashMap::new(),
        }
    }

    pub async fn record_success(
        &self,
        msg: &mut QueuedMessage,
        source: IpAddr,
        mx_host: &str,
    ) -> anyhow::Result<()> {
        self.record(
            msg,
            Disposition::Delivered,
            None,
            Some(source.to_string()),
            Some(mx_host.to_string()),
            Some(EventKind::Other),
        )
        .await
    }

    /// Permanent failure. The queue-timeout reason maps to its own
    /// disposition and event kind; everything else is a bounce.
    pub async fn record_failure(
        &self,
        msg: &mut QueuedMessage,
        reason: &str,
        source: Option<IpAddr>,
        mx_host: Option<&str>,
    ) -> anyhow::Result<()> {
        let (disposition, kind) = if reason == TIMED_OUT_IN_QUEUE {
            (Disposition::TimedOut, EventKind::TimedOutInQueue)
        } else {
            (Disposition::Failed, EventKind::Bounce)
        };
        self.record(
            msg,
            disposition,
            Some(reason),
            source.map(|ip| ip.to_string()),
            mx_host.map(|h| h.to_string()),
            Some(kind),
        )
        .await
    }

    pub async fn record_deferral(
        &self,
        msg: &mut QueuedMessage,
        reason: &str,
        source: Option<IpAddr>,
        mx_host: Option<&str>,
        inform_service_unavailable: bool,
    ) -> anyhow::Result<()> {
        let disposition = if inform_service_unavailable {
            Disposition::ServiceUnavailable
        } else {
            Disposition::Deferred
        };
        self.record(
            msg,
            disposition,
            Some(reason),
            source.map(|ip| ip.to_string()),
            mx_host.map(|h| h.to_string()),
            None,
        )
        .await
    }

    pub async fn record_throttle(
        &self,
        msg: &mut QueuedMessage,
        source: IpAddr,
        mx_host: &str,
    ) -> anyhow::Result<()> {
        self.record(
            msg,
            Disposition::Throttled,
            None,
            Some(source.to_string()),
            Some(mx_host.to_string()),
            None,
        )
        .await
    }

    pub async fn record_service_unavailable(
        &self,
        msg: &mut QueuedMessage,
        source: IpAddr,
    ) -> anyhow::Result<()> {
        self.record(
            msg,
            Disposition::ServiceUnavailable,
            None,
            Some(source.to_string()),
            None,
            None,
        )
        .await
    }

    async fn record(
        &self,
        msg: &mut QueuedMessage,
        disposition: Disposition,
        reason: Option<&str>,
        source_ip: Option<String>,
        mx_host: Option<String>,
        event: Option<EventKind>,
    ) -> anyhow::Result<()> {
        // The dequeuer owns the message exclusively, so check-then-insert
        // is race-free; the guard is only armed after the durable writes
        // so a failed write stays recordable
        let key = (msg.id, msg.attempts, disposition);
        if self.recorded.contains_key(&key) {
            return Ok(());
        }

        msg.attempts = msg.attempts.saturating_add(1);
        let transition = DeliveryTransition {
            message_id: msg.id,
            disposition,
            reason: reason.map(|r| r.to_string()),
            source_ip,
            mx_host,
            attempts: msg.attempts,
            timestamp: Utc::now(),
        };
        self.state.apply(&transition).await?;

        if let Some(kind) = event {
            let mut event = Event::new(kind, msg.id.to_string(), msg.recipient.clone());
            event.reason = transition.reason.clone();
            event.source_ip = transition.source_ip.clone();
            event.mx_host = transition.mx_host.clone();
            self.events.save(&event).await?;
        }

        self.recorded.insert(key, ());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_store::MemoryEventStore;

    fn fixture() -> (
        OutcomeRecorder,
        Arc<MemoryStateStore>,
        Arc<MemoryEventStore>,
        QueuedMessage,
    ) {
        let state = Arc::new(MemoryStateStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let recorder = OutcomeRecorder::new(state.clone(), events.clone());
        let msg = QueuedMessage::new(
            "from@example.com".to_string(),
            "to@example.com".to_string(),
            b"body".to_vec(),
            "default".to_string(),
        );
        (recorder, state, events, msg)
    }

    #[tokio::test]
    async fn success_emits_a_generic_event() {
        let (recorder, state, events, mut msg) = fixture();
        let source: IpAddr = "10.0.0.1".parse().unwrap();

        recorder
            .record_success(&mut msg, source, "mx1.example.com")
            .await
            .unwrap();

        let transitions = state.transitions_for(msg.id);
        k9::assert_equal!(transitions.len(), 1);
        k9::assert_equal!(transitions[0].disposition, Disposition::Delivered);
        k9::assert_equal!(msg.attempts, 1);

        let events = events.all();
        k9::assert_equal!(events.len(), 1);
        k9::assert_equal!(events[0].kind, EventKind::Other);
        assert!(!events[0].forwarded);
    }

    #[tokio::test]
    async fn bounce_carries_the_verbatim_reason() {
        let (recorder, state, events, mut msg) = fixture();

        recorder
            .record_failure(
                &mut msg,
                "550 no such user",
                Some("10.0.0.1".parse().unwrap()),
                Some("mx1.example.com"),
            )
            .await
            .unwrap();

        k9::assert_equal!(
            state.transitions_for(msg.id)[0].disposition,
            Disposition::Failed
        );
        let events = events.all();
        k9::assert_equal!(events[0].kind, EventKind::Bounce);
        k9::assert_equal!(events[0].reason.as_deref(), Some("550 no such user"));
    }

    #[tokio::test]
    async fn queue_timeout_has_its_own_event_kind() {
        let (recorder, state, events, mut msg) = fixture();

        recorder
            .record_failure(&mut msg, TIMED_OUT_IN_QUEUE, None, None)
            .await
            .unwrap();

        k9::assert_equal!(
            state.transitions_for(msg.id)[0].disposition,
            Disposition::TimedOut
        );
        k9::assert_equal!(events.all()[0].kind, EventKind::TimedOutInQueue);
    }

    #[tokio::test]
    async fn deferrals_do_not_emit_events() {
        let (recorder, state, events, mut msg) = fixture();

        recorder
            .record_deferral(&mut msg, "Failed to connect", None, None, false)
            .await
            .unwrap();

        k9::assert_equal!(
            state.transitions_for(msg.id)[0].disposition,
            Disposition::Deferred
        );
        assert!(events.all().is_empty());
    }

    #[tokio::test]
    async fn replaying_an_attempt_is_a_no_op() {
        let (recorder, state, events, mut msg) = fixture();

        recorder
            .record_failure(&mut msg, "550 go away", None, None)
            .await
            .unwrap();

        // A broker redelivery replays the same attempt counter
        let mut replay = msg.clone();
        replay.attempts = 0;
        recorder
            .record_failure(&mut replay, "550 go away", None, None)
            .await
            .unwrap();

        k9::assert_equal!(state.transitions_for(msg.id).len(), 1);
        k9::assert_equal!(events.all().len(), 1);
    }
}
