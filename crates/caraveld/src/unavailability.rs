use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// How long a 421 keeps a (source, destination) pair blacklisted
const COOL_OFF: chrono::Duration = chrono::Duration::minutes(1);

/// Short-lived record of (source IP, destination host) pairs that a peer
/// has told us to back off from with a 421. Consulted by the client pool
/// before it hands out a connection; entries expire after one minute and
/// are purged lazily on read. Never persisted.
#[derive(Default)]
pub struct UnavailabilityRegistry {
    entries: DashMap<(String, String), DateTime<Utc>>,
}

impl UnavailabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, source_ip: &str, host: &str, at: DateTime<Utc>) {
        self.entries
            .insert((source_ip.to_string(), host.to_string()), at);
    }

    pub fn is_unavailable(&self, source_ip: &str, host: &str, now: DateTime<Utc>) -> bool {
        let key = (source_ip.to_string(), host.to_string());
        // Copy the timestamp out so the shard guard is released before
        // any removal below
        let at = match self.entries.get(&key).map(|entry| *entry) {
            Some(at) => at,
            None => return false,
        };
        if now - at < COOL_OFF {
            true
        } else {
            self.entries.remove(&key);
            false
        }
    }

    pub fn contains(&self, source_ip: &str, host: &str) -> bool {
        self.entries
            .contains_key(&(source_ip.to_string(), host.to_string()))
    }
}
