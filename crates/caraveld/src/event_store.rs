use anyhow::Context;
use async_trait::async_trait;
use caravel_log_types::{Event, EventKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlite::{Connection, ConnectionThreadSafe, State};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use uuid::Uuid;

/// Durable home of delivery events. `save` is an upsert keyed by event id;
/// `events_for_forwarding` returns up to `limit` events whose `forwarded`
/// flag is still false.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn events_for_forwarding(&self, limit: usize) -> anyhow::Result<Vec<Event>>;
    async fn save(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn events_for_forwarding(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| !event.forwarded)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save(&self, event: &Event) -> anyhow::Result<()> {
        let mut events = self.events.lock();
        match events.iter_mut().find(|existing| existing.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => events.push(event.clone()),
        }
        Ok(())
    }
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SqliteEventStore {
    db: Arc<ConnectionThreadSafe>,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let path = path
            .to_str()
            .with_context(|| format!("event db path {path:?} is not valid UTF-8"))?;
        let mut db = Connection::open_thread_safe(path)
            .with_context(|| format!("failed to open event database {path}"))?;

        db.set_busy_timeout(
            BUSY_TIMEOUT
                .as_millis()
                .try_into()
                .expect("timeout to be in range"),
        )?;

        db.execute(
            r#"
CREATE TABLE IF NOT EXISTS events (
    id text PRIMARY KEY,
    kind text NOT NULL,
    message_id text NOT NULL,
    recipient text NOT NULL,
    reason text,
    source_ip text,
    mx_host text,
    timestamp DATETIME NOT NULL,
    forwarded bool NOT NULL DEFAULT 0
);
    "#,
        )?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Carry out the blocking operation on the database connection
    async fn perform<T: Send + 'static>(
        &self,
        func: impl FnOnce(&ConnectionThreadSafe) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let db = self.db.clone();
        spawn_blocking(move || (func)(&db)).await?
    }
}

fn row_to_event(stmt: &sqlite::Statement<'_>) -> anyhow::Result<Event> {
    let id: String = stmt.read("id")?;
    let kind: String = stmt.read("kind")?;
    let timestamp: String = stmt.read("timestamp")?;
    let forwarded: i64 = stmt.read("forwarded")?;

    Ok(Event {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid event id {id}"))?,
        kind: kind
            .parse::<EventKind>()
            .map_err(|err| anyhow::anyhow!(err))?,
        message_id: stmt.read("message_id")?,
        recipient: stmt.read("recipient")?,
        reason: stmt.read::<Option<String>, _>("reason")?,
        source_ip: stmt.read::<Option<String>, _>("source_ip")?,
        mx_host: stmt.read::<Option<String>, _>("mx_host")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .with_context(|| format!("invalid timestamp {timestamp}"))?
            .with_timezone(&Utc),
        forwarded: forwarded != 0,
    })
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn events_for_forwarding(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        self.perform(move |db| {
            let mut stmt = db.prepare(
                "SELECT * FROM events WHERE forwarded = 0
                 ORDER BY timestamp LIMIT $limit",
            )?;
            stmt.bind(("$limit", limit as i64))?;

            let mut events = vec![];
            while let Ok(State::Row) = stmt.next() {
                events.push(row_to_event(&stmt)?);
            }
            Ok(events)
        })
        .await
    }

    async fn save(&self, event: &Event) -> anyhow::Result<()> {
        let event = event.clone();
        self.perform(move |db| {
            let mut upsert = db.prepare(
                "INSERT INTO events
                 (id, kind, message_id, recipient, reason, source_ip, mx_host, timestamp, forwarded)
                 VALUES
                 ($id, $kind, $message_id, $recipient, $reason, $source_ip, $mx_host, $timestamp, $forwarded)
                 ON CONFLICT (id)
                 DO UPDATE SET forwarded=excluded.forwarded",
            )
            .context("prepare event upsert")?;

            upsert.bind(("$id", event.id.to_string().as_str()))?;
            upsert.bind(("$kind", event.kind.as_str()))?;
            upsert.bind(("$message_id", event.message_id.as_str()))?;
            upsert.bind(("$recipient", event.recipient.as_str()))?;
            upsert.bind(("$reason", event.reason.as_deref()))?;
            upsert.bind(("$source_ip", event.source_ip.as_deref()))?;
            upsert.bind(("$mx_host", event.mx_host.as_deref()))?;
            upsert.bind(("$timestamp", event.timestamp.to_rfc3339().as_str()))?;
            upsert.bind(("$forwarded", event.forwarded as i64))?;

            upsert.next().context("execute event upsert")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn event(kind: EventKind) -> Event {
        let mut event = Event::new(kind, "msg-1".to_string(), "user@example.com".to_string());
        event.reason = Some("550 no such user".to_string());
        event
    }

    #[tokio::test]
    async fn sqlite_round_trip_and_forwarded_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();

        let bounce = event(EventKind::Bounce);
        let timeout = event(EventKind::TimedOutInQueue);
        store.save(&bounce).await.unwrap();
        store.save(&timeout).await.unwrap();

        let pending = store.events_for_forwarding(10).await.unwrap();
        k9::assert_equal!(pending.len(), 2);
        let fetched = pending.iter().find(|e| e.id == bounce.id).unwrap();
        k9::assert_equal!(fetched.kind, EventKind::Bounce);
        k9::assert_equal!(fetched.reason.as_deref(), Some("550 no such user"));
        k9::assert_equal!(fetched.recipient, "user@example.com");

        // Marking forwarded removes it from the next fetch
        let mut done = bounce.clone();
        done.forwarded = true;
        store.save(&done).await.unwrap();

        let pending = store.events_for_forwarding(10).await.unwrap();
        k9::assert_equal!(pending.len(), 1);
        k9::assert_equal!(pending[0].id, timeout.id);
    }

    #[tokio::test]
    async fn fetch_honors_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();

        for _ in 0..15 {
            store.save(&event(EventKind::Other)).await.unwrap();
        }
        let pending = store.events_for_forwarding(10).await.unwrap();
        k9::assert_equal!(pending.len(), 10);
    }

    #[tokio::test]
    async fn memory_store_upserts_by_id() {
        let store = MemoryEventStore::new();
        let mut ev = event(EventKind::Bounce);
        store.save(&ev).await.unwrap();
        ev.forwarded = true;
        store.save(&ev).await.unwrap();

        assert!(store.events_for_forwarding(10).await.unwrap().is_empty());
        k9::assert_equal!(store.all().len(), 1);
    }
}
