//! Owner DID resolution against the on-chain collaborator registry.
//!
//! The registry is an external service; the relay consumes it through the
//! [`OwnerRegistry`] trait. [`RpcRegistry`] is the production implementor:
//! a JSON-RPC read with a read-through TTL cache. [`StaticRegistry`] is a
//! fixed map for tests, injected via `Server::with_registry`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default cache TTL for resolved owner DIDs.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Deadline for a single registry read.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub type OwnerDidFuture<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Point lookup `(contractAddress, collaboratorAddress) → ownerDid`.
///
/// `None` means "unknown owner" — either the registry has no entry or the
/// read failed. Callers must treat both the same way.
pub trait OwnerRegistry: Send + Sync {
    fn owner_did<'a>(&'a self, contract: &'a str, collaborator: &'a str) -> OwnerDidFuture<'a>;
}

type AddressPair = (String, String);

struct CacheEntry {
    owner_did: Option<String>,
    fetched_at: Instant,
}

/// TTL-bounded in-process cache of resolutions. Positive and negative
/// results both land here; failed reads never do, so the next call
/// retries the registry.
struct TtlCache {
    entries: Mutex<HashMap<AddressPair, CacheEntry>>,
    ttl: Duration,
}

impl TtlCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Outer `None` = miss or expired; inner `Option` is the cached
    /// resolution (which may itself be a cached negative).
    fn lookup(&self, key: &AddressPair) -> Option<Option<String>> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.owner_did.clone())
    }

    fn store(&self, key: AddressPair, owner_did: Option<String>) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                owner_did,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// Registry read over JSON-RPC against `RPC_URL`, with a read-through TTL
/// cache keyed by the lowercased address pair.
pub struct RpcRegistry {
    http: reqwest::Client,
    url: String,
    cache: TtlCache,
}

impl RpcRegistry {
    pub fn new(url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible");
        Self {
            http,
            url: url.to_string(),
            cache: TtlCache::new(DEFAULT_TTL),
        }
    }

    async fn fetch(&self, contract: &str, collaborator: &str) -> Result<Option<String>, anyhow::Error> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "registry_ownerDid",
            "params": [contract, collaborator],
        });
        let resp: serde_json::Value = self.http.post(&self.url).json(&body).send().await?.json().await?;
        if let Some(err) = resp.get("error") {
            anyhow::bail!("registry RPC error: {err}");
        }
        // Empty string and null both mean "no owner recorded".
        Ok(resp
            .get("result")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()))
    }
}

impl OwnerRegistry for RpcRegistry {
    fn owner_did<'a>(&'a self, contract: &'a str, collaborator: &'a str) -> OwnerDidFuture<'a> {
        Box::pin(async move {
            let key = (contract.to_lowercase(), collaborator.to_lowercase());
            if let Some(cached) = self.cache.lookup(&key) {
                return cached;
            }
            match self.fetch(&key.0, &key.1).await {
                Ok(owner_did) => {
                    self.cache.store(key, owner_did.clone());
                    owner_did
                }
                Err(e) => {
                    tracing::warn!(
                        contract = %contract,
                        collaborator = %collaborator,
                        error = %e,
                        "registry read failed"
                    );
                    None
                }
            }
        })
    }
}

/// Fixed `(contract, collaborator) → ownerDid` map, for tests.
pub struct StaticRegistry {
    entries: HashMap<AddressPair, String>,
}

impl StaticRegistry {
    pub fn new(entries: impl IntoIterator<Item = (AddressPair, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|((contract, collaborator), did)| {
                    ((contract.to_lowercase(), collaborator.to_lowercase()), did)
                })
                .collect(),
        }
    }
}

impl OwnerRegistry for StaticRegistry {
    fn owner_did<'a>(&'a self, contract: &'a str, collaborator: &'a str) -> OwnerDidFuture<'a> {
        let result = self
            .entries
            .get(&(contract.to_lowercase(), collaborator.to_lowercase()))
            .cloned();
        Box::pin(std::future::ready(result))
    }
}
