use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of delivery event that was recorded
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EventKind {
    /// A feedback-loop style complaint attributed to a message
    Abuse,
    /// The destination permanently refused the message
    Bounce,
    /// The message exceeded the maximum permitted time in queue
    TimedOutInQueue,
    /// Everything else, including successful deliveries
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abuse => "Abuse",
            Self::Bounce => "Bounce",
            Self::TimedOutInQueue => "TimedOutInQueue",
            Self::Other => "Other",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Abuse" => Ok(Self::Abuse),
            "Bounce" => Ok(Self::Bounce),
            "TimedOutInQueue" => Ok(Self::TimedOutInQueue),
            "Other" => Ok(Self::Other),
            _ => Err(format!("invalid EventKind {s}")),
        }
    }
}

/// A durable delivery event.
///
/// The `forwarded` flag is internal bookkeeping for the HTTP forwarder: it
/// transitions false->true exactly once and is deliberately excluded from
/// every wire shape below. Build the transmitted JSON via [`Event::wire`].
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub message_id: String,
    pub recipient: String,
    /// The verbatim peer response or local reason text, where applicable
    pub reason: Option<String>,
    pub source_ip: Option<String>,
    pub mx_host: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub forwarded: bool,
}

impl Event {
    pub fn new(kind: EventKind, message_id: String, recipient: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message_id,
            recipient,
            reason: None,
            source_ip: None,
            mx_host: None,
            timestamp: Utc::now(),
            forwarded: false,
        }
    }

    /// The JSON shape that is transmitted to the configured endpoint.
    /// Abuse, Bounce and TimedOutInQueue events each have their own typed
    /// shape; everything else uses the generic shape.
    pub fn wire(&self) -> EventWire<'_> {
        match self.kind {
            EventKind::Abuse => EventWire::Abuse {
                id: self.id,
                message_id: &self.message_id,
                recipient: &self.recipient,
                report: self.reason.as_deref(),
                timestamp: self.timestamp,
            },
            EventKind::Bounce => EventWire::Bounce {
                id: self.id,
                message_id: &self.message_id,
                recipient: &self.recipient,
                response: self.reason.as_deref(),
                source_ip: self.source_ip.as_deref(),
                mx_host: self.mx_host.as_deref(),
                timestamp: self.timestamp,
            },
            EventKind::TimedOutInQueue => EventWire::TimedOutInQueue {
                id: self.id,
                message_id: &self.message_id,
                recipient: &self.recipient,
                timestamp: self.timestamp,
            },
            EventKind::Other => EventWire::Generic {
                id: self.id,
                message_id: &self.message_id,
                recipient: &self.recipient,
                reason: self.reason.as_deref(),
                source_ip: self.source_ip.as_deref(),
                mx_host: self.mx_host.as_deref(),
                timestamp: self.timestamp,
            },
        }
    }
}

/// Wire shapes, one per event kind. None of them carries the internal
/// `forwarded` flag; the omission is structural rather than a post-hoc
/// scrub of the serialized text.
#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub enum EventWire<'a> {
    Abuse {
        id: Uuid,
        message_id: &'a str,
        recipient: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        report: Option<&'a str>,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
    Bounce {
        id: Uuid,
        message_id: &'a str,
        recipient: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_ip: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mx_host: Option<&'a str>,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
    TimedOutInQueue {
        id: Uuid,
        message_id: &'a str,
        recipient: &'a str,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "Other")]
    Generic {
        id: Uuid,
        message_id: &'a str,
        recipient: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_ip: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mx_host: Option<&'a str>,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(kind: EventKind) -> Event {
        let mut event = Event::new(kind, "msg-1".to_string(), "user@example.com".to_string());
        event.reason = Some("550 no such user".to_string());
        event.source_ip = Some("10.0.0.1".to_string());
        event.mx_host = Some("mx1.example.com".to_string());
        event
    }

    #[test]
    fn wire_is_tagged_by_kind() {
        for kind in [
            EventKind::Abuse,
            EventKind::Bounce,
            EventKind::TimedOutInQueue,
            EventKind::Other,
        ] {
            let json = serde_json::to_value(sample(kind).wire()).unwrap();
            k9::assert_equal!(json["type"].as_str().unwrap(), kind.as_str());
        }
    }

    #[test]
    fn wire_never_contains_forwarded() {
        for kind in [
            EventKind::Abuse,
            EventKind::Bounce,
            EventKind::TimedOutInQueue,
            EventKind::Other,
        ] {
            let mut event = sample(kind);
            event.forwarded = true;
            let body = serde_json::to_string(&event.wire()).unwrap();
            assert!(
                !body.to_ascii_lowercase().contains("forwarded"),
                "{body} must not leak the forwarded flag"
            );
        }
    }

    #[test]
    fn bounce_wire_carries_verbatim_response() {
        let body = serde_json::to_string(&sample(EventKind::Bounce).wire()).unwrap();
        assert!(body.contains("550 no such user"));
        assert!(body.contains("mx1.example.com"));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            EventKind::Abuse,
            EventKind::Bounce,
            EventKind::TimedOutInQueue,
            EventKind::Other,
        ] {
            k9::assert_equal!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }
}
