use crate::event_store::EventStore;
use crate::lifecycle::{LifeCycleHandle, ShutdownSubscription};
use caravel_log_types::Event;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

/// How long to doze when there is nothing to forward
const EMPTY_STORE_SLEEP: Duration = Duration::from_secs(1);

/// How many unforwarded events one cycle picks up, which is also the
/// fan-out bound for concurrent posts
const BATCH_SIZE: usize = 10;

/// Ships durable events to the operator-configured HTTP endpoint with
/// at-least-once semantics: an event only transitions to `forwarded` once
/// the endpoint has acknowledged it with a `.`-prefixed body, and anything
/// less leaves it queued for the next cycle.
pub struct EventForwarder {
    store: Arc<dyn EventStore>,
    url: Url,
    client: reqwest::Client,
    lifecycle: LifeCycleHandle,
}

impl EventForwarder {
    /// Spawn the forwarder worker iff an endpoint is configured
    pub fn spawn(
        store: Arc<dyn EventStore>,
        url: Option<Url>,
        lifecycle: LifeCycleHandle,
    ) -> Option<JoinHandle<()>> {
        let url = url?;
        let forwarder = Self {
            store,
            url,
            client: reqwest::Client::new(),
            lifecycle: lifecycle.clone(),
        };
        let activity = lifecycle.activity();
        let shutdown = lifecycle.subscribe();
        Some(tokio::spawn(async move {
            forwarder.run(shutdown).await;
            drop(activity);
        }))
    }

    async fn run(&self, mut shutdown: ShutdownSubscription) {
        tracing::info!("event forwarder running, posting to {}", self.url);
        if let Err(err) = self.run_loop(&mut shutdown).await {
            // Per-event problems are logged and retried; only the loop
            // itself failing is fatal, and it takes the process with it
            tracing::error!("event forwarder failed: {err:#}, requesting shutdown");
            self.lifecycle.request_shutdown().await;
        }
        tracing::info!("event forwarder stopped");
    }

    async fn run_loop(&self, shutdown: &mut ShutdownSubscription) -> anyhow::Result<()> {
        while !shutdown.is_stopping() {
            let batch = self.store.events_for_forwarding(BATCH_SIZE).await?;
            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(EMPTY_STORE_SLEEP) => {}
                    _ = shutdown.shutting_down() => {}
                }
                continue;
            }

            futures::future::join_all(
                batch
                    .into_iter()
                    .map(|event| self.forward_event(event, shutdown.clone())),
            )
            .await;
        }
        Ok(())
    }

    /// Best-effort delivery of one event. Failures here never bubble:
    /// the event stays unforwarded and the next cycle retries it.
    async fn forward_event(&self, mut event: Event, shutdown: ShutdownSubscription) {
        if shutdown.is_stopping() {
            return;
        }

        let body = match serde_json::to_string(&event.wire()) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!("cannot serialize event {}: {err}", event.id);
                return;
            }
        };

        match self.post(body).await {
            Ok(true) => {
                event.forwarded = true;
                if let Err(err) = self.store.save(&event).await {
                    tracing::error!("failed to mark event {} forwarded: {err:#}", event.id);
                }
            }
            Ok(false) => {
                tracing::debug!("endpoint did not accept event {}", event.id);
            }
            Err(err) => {
                tracing::warn!("failed to forward event {}: {err:#}", event.id);
            }
        }
    }

    /// True iff the endpoint acknowledged: the response body's first
    /// non-whitespace character is `.`
    async fn post(&self, body: String) -> anyhow::Result<bool> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "text/json")
            .body(body)
            .send()
            .await?;
        let text = response.text().await?;
        Ok(text.trim_start().starts_with('.'))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_store::MemoryEventStore;
    use crate::lifecycle::LifeCycle;
    use caravel_log_types::EventKind;

    fn forwarder_for(
        store: Arc<MemoryEventStore>,
        url: &str,
        lifecycle: &LifeCycle,
    ) -> EventForwarder {
        EventForwarder {
            store,
            url: Url::parse(url).unwrap(),
            client: reqwest::Client::new(),
            lifecycle: lifecycle.handle(),
        }
    }

    fn event() -> Event {
        Event::new(
            EventKind::Bounce,
            "msg-1".to_string(),
            "user@example.com".to_string(),
        )
    }

    #[tokio::test]
    async fn dot_response_marks_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/events")
            .match_header("content-type", "text/json")
            .with_body(".\n")
            .expect(3)
            .create_async()
            .await;

        let store = Arc::new(MemoryEventStore::new());
        for _ in 0..3 {
            store.save(&event()).await.unwrap();
        }

        let lifecycle = LifeCycle::new();
        let forwarder = forwarder_for(
            store.clone(),
            &format!("{}/events", server.url()),
            &lifecycle,
        );

        let batch = store.events_for_forwarding(10).await.unwrap();
        futures::future::join_all(
            batch
                .into_iter()
                .map(|ev| forwarder.forward_event(ev, lifecycle.handle().subscribe())),
        )
        .await;

        mock.assert_async().await;
        // All three are now marked and absent from the next fetch
        assert!(store.events_for_forwarding(10).await.unwrap().is_empty());
        assert!(store.all().iter().all(|ev| ev.forwarded));
    }

    #[tokio::test]
    async fn non_dot_response_leaves_event_queued() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/events")
            .with_body("rejected")
            .create_async()
            .await;

        let store = Arc::new(MemoryEventStore::new());
        store.save(&event()).await.unwrap();

        let lifecycle = LifeCycle::new();
        let forwarder = forwarder_for(
            store.clone(),
            &format!("{}/events", server.url()),
            &lifecycle,
        );

        let batch = store.events_for_forwarding(10).await.unwrap();
        forwarder
            .forward_event(batch[0].clone(), lifecycle.handle().subscribe())
            .await;

        // Still unforwarded: the next cycle will retry
        k9::assert_equal!(store.events_for_forwarding(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_leaves_event_queued() {
        let store = Arc::new(MemoryEventStore::new());
        store.save(&event()).await.unwrap();

        let lifecycle = LifeCycle::new();
        let forwarder = forwarder_for(store.clone(), "http://127.0.0.1:1/events", &lifecycle);

        let batch = store.events_for_forwarding(10).await.unwrap();
        forwarder
            .forward_event(batch[0].clone(), lifecycle.handle().subscribe())
            .await;

        k9::assert_equal!(store.events_for_forwarding(10).await.unwrap().len(), 1);
    }

    /// One-shot HTTP server that captures the raw request body and
    /// acknowledges with a dot
    async fn capture_server() -> (String, tokio::sync::oneshot::Receiver<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let Ok(n) = stream.read(&mut chunk).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
                let Some(split) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let headers = String::from_utf8_lossy(&buf[..split]).to_ascii_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= split + 4 + content_length {
                    let body =
                        String::from_utf8_lossy(&buf[split + 4..split + 4 + content_length])
                            .to_string();
                    stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\nconnection: close\r\n\r\n.",
                        )
                        .await
                        .ok();
                    tx.send(body).ok();
                    return;
                }
            }
        });
        (format!("http://127.0.0.1:{port}/events"), rx)
    }

    #[tokio::test]
    async fn transmitted_body_is_scrubbed_of_forwarded() {
        let (url, captured) = capture_server().await;

        let store = Arc::new(MemoryEventStore::new());
        store.save(&event()).await.unwrap();

        let lifecycle = LifeCycle::new();
        let forwarder = forwarder_for(store.clone(), &url, &lifecycle);

        let batch = store.events_for_forwarding(10).await.unwrap();
        forwarder
            .forward_event(batch[0].clone(), lifecycle.handle().subscribe())
            .await;

        let body = captured.await.unwrap();
        assert!(body.contains("\"type\":\"Bounce\""), "{body}");
        assert!(
            !body.to_ascii_lowercase().contains("forwarded"),
            "{body} must not leak the forwarded flag"
        );
        // The dot acknowledgement marked it forwarded
        assert!(store.events_for_forwarding(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_configured_endpoint_means_no_worker() {
        let lifecycle = LifeCycle::new();
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        assert!(EventForwarder::spawn(store, None, lifecycle.handle()).is_none());
    }
}
