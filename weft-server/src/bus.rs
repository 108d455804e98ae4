//! Shared session cache and cluster event bus.
//!
//! Two concerns on one shared store, consumed through two separate
//! handles: a keyed cache of session records
//! (`collab:session:<documentId>__<sessionDid>`, 24 h TTL, extendable)
//! behind [`SessionCache`], and a single pub/sub channel of tagged
//! [`BusEvent`]s behind [`EventBus`]. Every event carries the publisher's
//! `node_id` so a node ignores its own echo.
//!
//! Delivery is best-effort at-most-once — the bus is a soft coordination
//! layer, not a replicated log. The durable store dominates on divergence.
//!
//! [`MemoryBus`] is the bundled transport, implementing both traits over a
//! TTL'd map and a `tokio::sync::broadcast` channel. Handing the same
//! `Arc<MemoryBus>` to several relay processes is how a cluster (or a
//! multi-node test) is wired; a Redis-backed transport would implement the
//! same two traits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Cache TTL for session records.
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bus channel capacity; slow subscribers lag and drop, they never block
/// publishers.
const BUS_CAPACITY: usize = 1024;

/// Composite key for everything session-scoped.
pub fn session_key(document_id: &str, session_did: &str) -> String {
    format!("{document_id}__{session_did}")
}

/// Cache key for a session record.
pub fn cache_key(document_id: &str, session_did: &str) -> String {
    format!("collab:session:{}", session_key(document_id, session_did))
}

/// The session record as stored in the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSession {
    pub document_id: String,
    pub session_did: String,
    pub owner_did: String,
    pub room_info: Option<serde_json::Value>,
    /// Cluster-wide client set: union of every node's local set.
    pub clients: HashSet<String>,
    pub state: String,
}

/// An event on the cluster bus, tagged with its publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub node_id: String,
    #[serde(flatten)]
    pub kind: BusEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusEventKind {
    SessionCreated {
        session: CachedSession,
    },
    SessionUpdated {
        session: CachedSession,
    },
    SessionDeleted {
        document_id: String,
        session_did: String,
    },
    ClientJoined {
        document_id: String,
        session_did: String,
        client_id: String,
    },
    ClientLeft {
        document_id: String,
        session_did: String,
        client_id: String,
    },
    RoomInfoUpdated {
        document_id: String,
        session_did: String,
        room_info: Option<serde_json::Value>,
    },
    BroadcastMessage {
        document_id: String,
        session_did: String,
        /// Pre-serialized event envelope, replayed verbatim on every node.
        payload: String,
        exclude_client_id: Option<String>,
        /// Whether receivers may shed this under backpressure (awareness).
        droppable: bool,
    },
}

/// Subscription handle, separate from the publish side.
pub type BusReceiver = broadcast::Receiver<BusEvent>;

/// Cluster-wide keyed cache of session records. Single-key operations,
/// last-writer-wins; a cache, not source of truth.
pub trait SessionCache: Send + Sync {
    /// Read a record; implementations refresh the TTL on hit.
    fn get(&self, key: &str) -> Option<CachedSession>;
    /// Write a record, resetting its TTL.
    fn put(&self, key: &str, session: &CachedSession);
    fn delete(&self, key: &str);
    /// Add a client to the cached cluster-wide set.
    fn add_client(&self, key: &str, client_id: &str);
    /// Remove a client from the cached cluster-wide set.
    fn remove_client(&self, key: &str, client_id: &str);
}

/// The single pub/sub channel carrying cluster events.
pub trait EventBus: Send + Sync {
    /// Fire-and-forget: a bus with no subscribers is not an error.
    fn publish(&self, event: &BusEvent);
    /// Each node holds its own receiver, separate from the publish handle.
    fn subscribe(&self) -> BusReceiver;
}

struct CacheSlot {
    session: CachedSession,
    expires_at: Instant,
}

/// In-process cache + bus. One shared `Arc<MemoryBus>` is the cluster
/// coupling for co-located nodes and tests.
pub struct MemoryBus {
    cache: Mutex<HashMap<String, CacheSlot>>,
    tx: broadcast::Sender<BusEvent>,
    ttl: Duration,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(SESSION_TTL)
    }

    fn with_ttl(ttl: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
            tx,
            ttl,
        })
    }
}

impl SessionCache for MemoryBus {
    fn get(&self, key: &str) -> Option<CachedSession> {
        let mut cache = self.cache.lock();
        match cache.get_mut(key) {
            Some(slot) if slot.expires_at > Instant::now() => {
                slot.expires_at = Instant::now() + self.ttl;
                Some(slot.session.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, session: &CachedSession) {
        self.cache.lock().insert(
            key.to_string(),
            CacheSlot {
                session: session.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.cache.lock().remove(key);
    }

    fn add_client(&self, key: &str, client_id: &str) {
        let mut cache = self.cache.lock();
        if let Some(slot) = cache.get_mut(key) {
            slot.session.clients.insert(client_id.to_string());
            slot.expires_at = Instant::now() + self.ttl;
        }
    }

    fn remove_client(&self, key: &str, client_id: &str) {
        let mut cache = self.cache.lock();
        if let Some(slot) = cache.get_mut(key) {
            slot.session.clients.remove(client_id);
        }
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, event: &BusEvent) {
        let _ = self.tx.send(event.clone());
    }

    fn subscribe(&self) -> BusReceiver {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(document_id: &str) -> CachedSession {
        CachedSession {
            document_id: document_id.to_string(),
            session_did: "did:key:zS".to_string(),
            owner_did: "did:key:zO".to_string(),
            room_info: None,
            clients: HashSet::new(),
            state: "active".to_string(),
        }
    }

    fn key(document_id: &str) -> String {
        cache_key(document_id, "did:key:zS")
    }

    #[test]
    fn cache_roundtrip() {
        let bus = MemoryBus::new();
        bus.put(&key("d1"), &cached("d1"));
        let loaded = bus.get(&key("d1")).unwrap();
        assert_eq!(loaded.owner_did, "did:key:zO");
        assert!(bus.get(&key("d2")).is_none());
    }

    #[test]
    fn client_set_tracks_cluster_membership() {
        let bus = MemoryBus::new();
        bus.put(&key("d1"), &cached("d1"));
        bus.add_client(&key("d1"), "c1");
        bus.add_client(&key("d1"), "c2");
        bus.remove_client(&key("d1"), "c1");

        let clients = bus.get(&key("d1")).unwrap().clients;
        assert_eq!(clients.len(), 1);
        assert!(clients.contains("c2"));
    }

    #[test]
    fn delete_removes_entry() {
        let bus = MemoryBus::new();
        bus.put(&key("d1"), &cached("d1"));
        bus.delete(&key("d1"));
        assert!(bus.get(&key("d1")).is_none());
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let bus = MemoryBus::with_ttl(Duration::from_millis(0));
        bus.put(&key("d1"), &cached("d1"));
        assert!(bus.get(&key("d1")).is_none());
    }

    #[test]
    fn handles_share_one_store() {
        let bus = MemoryBus::new();
        let other = Arc::clone(&bus);
        bus.put(&key("d1"), &cached("d1"));
        assert!(other.get(&key("d1")).is_some());
    }

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = MemoryBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(&BusEvent {
            node_id: "node-1".into(),
            kind: BusEventKind::ClientJoined {
                document_id: "d1".into(),
                session_did: "did:key:zS".into(),
                client_id: "c1".into(),
            },
        });

        for rx in [&mut rx_a, &mut rx_b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.node_id, "node-1");
            assert!(matches!(event.kind, BusEventKind::ClientJoined { .. }));
        }
    }

    #[test]
    fn event_wire_tagging() {
        let event = BusEvent {
            node_id: "node-1".into(),
            kind: BusEventKind::SessionDeleted {
                document_id: "d1".into(),
                session_did: "did:key:zS".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SESSION_DELETED");
        assert_eq!(json["node_id"], "node-1");
    }
}
