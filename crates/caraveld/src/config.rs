use crate::client_pool::PoolConfig;
use crate::virtual_mta::VirtualMtaGroup;
use anyhow::Context;
use caravel_smtp::SmtpClientTimeouts;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// How many minutes a message may spend in queue before it is
    /// permanently failed instead of dispatched
    #[serde(default = "Config::default_max_time_in_queue_minutes")]
    pub max_time_in_queue_minutes: i64,

    /// Where to POST delivery events. Absent disables the forwarder.
    #[serde(default)]
    pub event_forwarding_http_post_url: Option<Url>,

    /// Durable event database. Absent keeps events in memory only,
    /// which is suitable for tests and ad-hoc runs.
    #[serde(default)]
    pub event_db_path: Option<PathBuf>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub smtp_client_timeouts: SmtpClientTimeouts,

    pub virtual_mta_groups: Vec<VirtualMtaGroup>,
}

impl Config {
    fn default_max_time_in_queue_minutes() -> i64 {
        // three days
        4320
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn max_time_in_queue(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_time_in_queue_minutes)
    }
}
