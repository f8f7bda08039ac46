use async_trait::async_trait;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{Name, TokioResolver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// A single mail exchanger for a recipient domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS: {0}")]
    ResolveFailed(String),
}

/// Resolves the ordered MX set for a recipient domain. The returned
/// records are sorted by ascending preference; NXDOMAIN and no-MX both
/// yield an empty sequence rather than an error.
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError>;
}

pub struct HickoryMxResolver {
    inner: TokioResolver,
}

impl HickoryMxResolver {
    pub fn new() -> Result<Self, hickory_resolver::ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
        })
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        let name = Name::from_utf8(domain)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {domain}: {err}")))?;

        let lookup = match self.inner.mx_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) => {
                return match err.proto().map(|err| err.kind()) {
                    Some(ProtoErrorKind::NoRecordsFound { .. }) => Ok(vec![]),
                    _ => Err(DnsError::ResolveFailed(format!(
                        "failed to query MX for {domain}: {err}"
                    ))),
                };
            }
        };

        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                host: mx
                    .exchange()
                    .to_utf8()
                    .trim_end_matches('.')
                    .to_string(),
                preference: mx.preference(),
            })
            .collect();
        records.sort_by_key(|record| record.preference);
        Ok(records)
    }
}

/// Fixed-answer resolver used by tests and local tooling
#[derive(Default)]
pub struct StaticMxResolver {
    answers: Mutex<HashMap<String, Vec<MxRecord>>>,
    calls: AtomicUsize,
}

impl StaticMxResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, domain: &str, records: Vec<MxRecord>) -> Self {
        self.answers.lock().insert(domain.to_string(), records);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MxResolver for StaticMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .answers
            .lock()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn static_resolver_sorted_answers() {
        let resolver = StaticMxResolver::new().answer(
            "example.com",
            vec![
                MxRecord {
                    host: "mx1.example.com".to_string(),
                    preference: 10,
                },
                MxRecord {
                    host: "mx2.example.com".to_string(),
                    preference: 20,
                },
            ],
        );

        let records = resolver.resolve_mx("example.com").await.unwrap();
        k9::assert_equal!(records.len(), 2);
        k9::assert_equal!(records[0].host, "mx1.example.com");
        k9::assert_equal!(resolver.call_count(), 1);

        let records = resolver.resolve_mx("nxdomain.example").await.unwrap();
        assert!(records.is_empty());
    }
}
