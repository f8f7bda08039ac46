use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An SMTP envelope address. An empty string is the null sender used by
/// bounce messages; recipients must always carry user@domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Eq)]
#[serde(transparent)]
pub struct EnvelopeAddress(String);

impl EnvelopeAddress {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if text.is_empty() {
            return Ok(Self::null_sender());
        }
        let fields: Vec<&str> = text.split('@').collect();
        anyhow::ensure!(
            fields.len() == 2 && !fields[0].is_empty() && !fields[1].is_empty(),
            "expected user@domain, got {text:?}"
        );
        Ok(Self(text.to_string()))
    }

    pub fn user(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[..at],
            None => "",
        }
    }

    pub fn domain(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[at + 1..],
            None => "",
        }
    }

    pub fn null_sender() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// A unit of outbound work. Whoever dequeued it from the broker owns it
/// exclusively until it is acked or re-enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    /// Envelope sender; may be empty (null sender)
    pub sender: String,
    /// Exactly one envelope recipient, local-part@host
    pub recipient: String,
    /// Opaque RFC-822 payload
    pub data: Vec<u8>,
    /// Which virtual-MTA group should carry this message
    pub group_id: String,
    pub queued_at: DateTime<Utc>,
    /// Earliest time the next delivery attempt may start.
    /// Invariant: `attempt_after >= queued_at`; only ever moves forward.
    pub attempt_after: DateTime<Utc>,
    /// Number of recorded delivery attempts
    pub attempts: u16,
}

impl QueuedMessage {
    pub fn new(sender: String, recipient: String, data: Vec<u8>, group_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sender,
            recipient,
            data,
            group_id,
            queued_at: now,
            attempt_after: now,
            attempts: 0,
        }
    }

    /// A message whose next permitted attempt has drifted more than
    /// `max_time_in_queue` past its enqueue time is terminal and must not
    /// be dispatched.
    pub fn is_timed_out(&self, max_time_in_queue: chrono::Duration) -> bool {
        self.attempt_after - self.queued_at > max_time_in_queue
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_parsing() {
        let addr = EnvelopeAddress::parse("user@example.com").unwrap();
        k9::assert_equal!(addr.user(), "user");
        k9::assert_equal!(addr.domain(), "example.com");

        k9::assert_equal!(
            EnvelopeAddress::parse("").unwrap(),
            EnvelopeAddress::null_sender()
        );

        assert!(EnvelopeAddress::parse("not-an-address").is_err());
        assert!(EnvelopeAddress::parse("@example.com").is_err());
        assert!(EnvelopeAddress::parse("user@").is_err());
        assert!(EnvelopeAddress::parse("a@b@c").is_err());
    }

    #[test]
    fn queue_timeout_compares_attempt_drift() {
        let mut msg = QueuedMessage::new(
            "a@example.com".to_string(),
            "b@example.com".to_string(),
            b"body".to_vec(),
            "default".to_string(),
        );
        let budget = chrono::Duration::minutes(60);
        assert!(!msg.is_timed_out(budget));

        msg.attempt_after = msg.queued_at + chrono::Duration::minutes(61);
        assert!(msg.is_timed_out(budget));
    }
}
