use crate::dns::MxRecord;
use crate::lifecycle::ShutdownSubscription;
use crate::unavailability::UnavailabilityRegistry;
use crate::virtual_mta::VirtualMta;
use caravel_smtp::{ClientError, SmtpClient, SmtpClientTimeouts};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RateLimit {
    pub limit: u64,
    pub period_seconds: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Connection cap per (source IP, destination host) unless the
    /// virtual MTA overrides it
    #[serde(default = "PoolConfig::default_max_connections")]
    pub max_connections_per_route: usize,

    /// Idle pooled connections older than this are closed by the sweep
    #[serde(default = "PoolConfig::default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    #[serde(default = "PoolConfig::default_smtp_port")]
    pub smtp_port: u16,

    /// Optional per-route message rate limit
    #[serde(default)]
    pub message_rate: Option<RateLimit>,
}

impl PoolConfig {
    fn default_max_connections() -> usize {
        10
    }
    fn default_idle_timeout_seconds() -> u64 {
        30
    }
    fn default_smtp_port() -> u16 {
        25
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_route: Self::default_max_connections(),
            idle_timeout_seconds: Self::default_idle_timeout_seconds(),
            smtp_port: Self::default_smtp_port(),
            message_rate: None,
        }
    }
}

/// The disjoint outcomes of a lease request. Everything except `Success`
/// leaves the caller without a connection; the dispatch loop decides what
/// each one means for the message.
#[derive(Debug)]
pub enum LeaseOutcome {
    Success(PooledClient),
    NoMxRecords,
    FailedToConnect,
    FailedMaxConnections,
    ServiceUnavailable,
    Throttled,
    FailedToAddToQueue,
    Unknown,
}

#[derive(Debug)]
struct IdleClient {
    client: SmtpClient,
    last_active: Instant,
}

#[derive(Debug, Default)]
struct RouteEntry {
    idle: Mutex<Vec<IdleClient>>,
    /// Leased plus idle connections tracked for this route
    connections: AtomicUsize,
    /// Set once the sweep has detached this entry from the index
    closed: AtomicBool,
}

impl RouteEntry {
    fn pop_idle(&self) -> Option<IdleClient> {
        self.idle.lock().pop()
    }

    fn reserve(&self, max: usize) -> bool {
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection lent out by the pool. Exactly one caller owns it at a
/// time. Dropping it without `SmtpClientPool::give_back` discards the
/// connection and frees its slot.
#[derive(Debug)]
pub struct PooledClient {
    smtp: Option<SmtpClient>,
    pub source: IpAddr,
    pub mx_host: String,
    entry: Option<Arc<RouteEntry>>,
}

impl PooledClient {
    pub fn smtp(&mut self) -> &mut SmtpClient {
        self.smtp.as_mut().expect("client still leased")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.release();
        }
    }
}

struct RateWindow {
    started: Instant,
    used: u64,
}

/// Caches open SMTP connections keyed by (source IP, destination host),
/// enforces per-route connection caps and message throttling, and refuses
/// routes the unavailability registry has blacklisted.
pub struct SmtpClientPool {
    routes: DashMap<String, Arc<RouteEntry>>,
    rate_windows: DashMap<String, RateWindow>,
    registry: Arc<UnavailabilityRegistry>,
    config: PoolConfig,
    timeouts: SmtpClientTimeouts,
}

fn route_key(source: IpAddr, host: &str) -> String {
    format!("{source}->{host}")
}

impl SmtpClientPool {
    pub fn new(
        config: PoolConfig,
        timeouts: SmtpClientTimeouts,
        registry: Arc<UnavailabilityRegistry>,
    ) -> Self {
        Self {
            routes: DashMap::new(),
            rate_windows: DashMap::new(),
            registry,
            config,
            timeouts,
        }
    }

    pub async fn lease(&self, vmta: &VirtualMta, mx_records: &[MxRecord]) -> LeaseOutcome {
        if mx_records.is_empty() {
            return LeaseOutcome::NoMxRecords;
        }

        let source = vmta.source_address;
        let max = vmta
            .max_connections
            .unwrap_or(self.config.max_connections_per_route);

        // The MX sequence is ordered for failover: a blocked or
        // unreachable candidate skips to the next one, and the skip
        // reasons only become the outcome once every host is exhausted
        let mut saw_unavailable = false;
        let mut saw_throttled = false;

        for mx in mx_records {
            if self
                .registry
                .is_unavailable(&source.to_string(), &mx.host, Utc::now())
            {
                saw_unavailable = true;
                continue;
            }

            let key = route_key(source, &mx.host);
            if !self.allow_message(&key) {
                saw_throttled = true;
                continue;
            }

            let entry = self.routes.entry(key).or_default().clone();

            if let Some(idle) = entry.pop_idle() {
                return LeaseOutcome::Success(PooledClient {
                    smtp: Some(idle.client),
                    source,
                    mx_host: mx.host.clone(),
                    entry: Some(entry),
                });
            }

            if !entry.reserve(max) {
                return LeaseOutcome::FailedMaxConnections;
            }
            if entry.closed.load(Ordering::SeqCst) {
                // Raced with the sweep detaching this route; the broker
                // will redeliver
                entry.release();
                return LeaseOutcome::FailedToAddToQueue;
            }

            match self.connect(source, &mx.host).await {
                Ok(client) => {
                    return LeaseOutcome::Success(PooledClient {
                        smtp: Some(client),
                        source,
                        mx_host: mx.host.clone(),
                        entry: Some(entry),
                    });
                }
                Err(err) if err.is_local_setup() => {
                    entry.release();
                    tracing::error!("cannot use source {source} for {}: {err}", mx.host);
                    return LeaseOutcome::Unknown;
                }
                Err(err) => {
                    entry.release();
                    tracing::debug!("failed to connect {source} -> {}: {err}", mx.host);
                    // Try the next candidate MX host
                }
            }
        }

        if saw_unavailable {
            LeaseOutcome::ServiceUnavailable
        } else if saw_throttled {
            LeaseOutcome::Throttled
        } else {
            LeaseOutcome::FailedToConnect
        }
    }

    async fn connect(&self, source: IpAddr, host: &str) -> Result<SmtpClient, ClientError> {
        let addrs = tokio::net::lookup_host((host, self.config.smtp_port))
            .await
            .map_err(|err| ClientError::ConnectFailed {
                address: host.to_string(),
                error: err.to_string(),
            })?;

        let mut last_error = None;
        for addr in addrs {
            // Keep the destination's address family aligned with the
            // source we must bind
            if addr.is_ipv4() != source.is_ipv4() {
                continue;
            }
            match SmtpClient::connect(addr, Some(source), host, self.timeouts).await {
                Ok(client) => return Ok(client),
                Err(err) if err.is_local_setup() => return Err(err),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| ClientError::ConnectFailed {
            address: host.to_string(),
            error: "no usable addresses".to_string(),
        }))
    }

    /// Return a cleanly finished client to the idle set for its route
    pub fn give_back(&self, mut client: PooledClient) {
        let (Some(entry), Some(smtp)) = (client.entry.take(), client.smtp.take()) else {
            return;
        };
        if entry.closed.load(Ordering::SeqCst) || !smtp.is_connected() {
            entry.release();
            return;
        }
        entry.idle.lock().push(IdleClient {
            client: smtp,
            last_active: Instant::now(),
        });
    }

    fn allow_message(&self, key: &str) -> bool {
        let Some(rate) = self.config.message_rate else {
            return true;
        };
        let period = Duration::from_secs(rate.period_seconds.max(1));
        let mut window = self
            .rate_windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow {
                started: Instant::now(),
                used: 0,
            });
        if window.started.elapsed() >= period {
            window.started = Instant::now();
            window.used = 0;
        }
        if window.used < rate.limit {
            window.used += 1;
            true
        } else {
            false
        }
    }

    /// Close idle connections past the idle timeout and detach routes
    /// with no remaining connections
    pub async fn sweep_idle(&self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_seconds);
        let mut expired = vec![];
        let mut empty_routes = vec![];

        for route in self.routes.iter() {
            let entry = route.value();
            {
                let mut idle = entry.idle.lock();
                let mut keep = Vec::with_capacity(idle.len());
                for client in idle.drain(..) {
                    if client.last_active.elapsed() >= idle_timeout {
                        entry.release();
                        expired.push(client);
                    } else {
                        keep.push(client);
                    }
                }
                *idle = keep;
            }
            if entry.connections.load(Ordering::SeqCst) == 0 {
                empty_routes.push((route.key().clone(), entry.clone()));
            }
        }

        for (key, entry) in empty_routes {
            entry.closed.store(true, Ordering::SeqCst);
            let removed = self
                .routes
                .remove_if(&key, |_, e| e.connections.load(Ordering::SeqCst) == 0)
                .is_some();
            if removed {
                tracing::debug!("reaping idle route {key}");
                self.rate_windows.remove(&key);
            } else {
                entry.closed.store(false, Ordering::SeqCst);
            }
        }

        for mut client in expired {
            client.client.quit().await.ok();
        }
    }

    pub fn start_sweep(self: &Arc<Self>, mut shutdown: ShutdownSubscription) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = Duration::from_secs(pool.config.idle_timeout_seconds.clamp(1, 60));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.shutting_down() => break,
                }
                pool.sweep_idle().await;
            }
        })
    }

    pub fn tracked_connections(&self, source: IpAddr, host: &str) -> usize {
        self.routes
            .get(&route_key(source, host))
            .map(|entry| entry.connections.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn idle_connections(&self, source: IpAddr, host: &str) -> usize {
        self.routes
            .get(&route_key(source, host))
            .map(|entry| entry.idle.lock().len())
            .unwrap_or(0)
    }
}
