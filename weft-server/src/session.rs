//! Session lifecycle and cross-node coherence.
//!
//! The manager owns the per-node session map and keeps it coherent with
//! the rest of the cluster through the shared cache + bus: every mutation
//! goes local map → cache → durable record → published event, and inbound
//! bus events are applied to the local map in place.
//!
//! The local map's client sets hold the cluster-wide membership view
//! (maintained by `CLIENT_JOINED`/`CLIENT_LEFT` events); local delivery
//! simply skips ids with no socket on this node. A session deactivates
//! when its client set empties — which, with the cluster-wide view, means
//! the whole session went idle, not just this node's slice of it.
//!
//! The hub registers a single broadcast handler at wiring time; the
//! manager only ever calls back through that opaque function, so there is
//! no ownership cycle between the two.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::bus::{
    cache_key, session_key, BusEvent, BusEventKind, CachedSession, EventBus, SessionCache,
};
use crate::db::{Db, SessionRow};
use crate::error::RelayError;

/// Local fan-out callback: `(local candidate client ids, payload,
/// exclude_client_id, droppable)`.
pub type BroadcastHandler = Arc<dyn Fn(&[String], &str, Option<&str>, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Inactive,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Inactive => "inactive",
            SessionState::Terminated => "terminated",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "inactive" => SessionState::Inactive,
            "terminated" => SessionState::Terminated,
            _ => SessionState::Active,
        }
    }
}

/// In-memory session entry.
#[derive(Debug, Clone)]
pub struct Session {
    pub document_id: String,
    pub session_did: String,
    pub owner_did: String,
    pub room_info: Option<serde_json::Value>,
    pub clients: HashSet<String>,
    pub state: SessionState,
}

impl Session {
    fn to_cached(&self) -> CachedSession {
        CachedSession {
            document_id: self.document_id.clone(),
            session_did: self.session_did.clone(),
            owner_did: self.owner_did.clone(),
            room_info: self.room_info.clone(),
            clients: self.clients.clone(),
            state: self.state.as_str().to_string(),
        }
    }

    fn from_cached(cached: CachedSession) -> Self {
        Session {
            document_id: cached.document_id,
            session_did: cached.session_did,
            owner_did: cached.owner_did,
            room_info: cached.room_info,
            clients: cached.clients,
            state: SessionState::parse(&cached.state),
        }
    }
}

pub struct SessionManager {
    node_id: String,
    sessions: RwLock<HashMap<String, Session>>,
    cache: Arc<dyn SessionCache>,
    bus: Arc<dyn EventBus>,
    db: Arc<Mutex<Db>>,
    broadcast_handler: RwLock<Option<BroadcastHandler>>,
}

impl SessionManager {
    pub fn new(
        node_id: &str,
        cache: Arc<dyn SessionCache>,
        bus: Arc<dyn EventBus>,
        db: Arc<Mutex<Db>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            sessions: RwLock::new(HashMap::new()),
            cache,
            bus,
            db,
            broadcast_handler: RwLock::new(None),
        })
    }

    /// One-way registration performed by the hub at wiring time.
    pub fn set_broadcast_handler(&self, handler: BroadcastHandler) {
        *self.broadcast_handler.write() = Some(handler);
    }

    /// Number of sessions mirrored on this node.
    pub fn local_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Run a closure against the durable store, logging instead of
    /// propagating failures — a sick store must not take sessions down.
    fn with_db<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Db) -> rusqlite::Result<R>,
    {
        let mut db = self.db.lock();
        match f(&mut db) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!(error = %e, "durable store error");
                None
            }
        }
    }

    fn publish(&self, kind: BusEventKind) {
        self.bus.publish(&BusEvent {
            node_id: self.node_id.clone(),
            kind,
        });
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // ── Public operations ──────────────────────────────────────────────

    /// Create (or re-activate) the session for a pair. Fails on terminated
    /// pairs — those are permanently retired.
    pub fn create_session(
        &self,
        document_id: &str,
        session_did: &str,
        owner_did: &str,
        room_info: Option<serde_json::Value>,
    ) -> Result<(), RelayError> {
        if self
            .with_db(|db| db.is_terminated(document_id, session_did))
            .unwrap_or(false)
        {
            return Err(RelayError::NotFound("session terminated".into()));
        }

        let session = Session {
            document_id: document_id.to_string(),
            session_did: session_did.to_string(),
            owner_did: owner_did.to_string(),
            room_info: room_info.clone(),
            clients: HashSet::new(),
            state: SessionState::Active,
        };

        self.sessions
            .write()
            .insert(session_key(document_id, session_did), session.clone());
        self.cache
            .put(&cache_key(document_id, session_did), &session.to_cached());

        let now = Self::now_ms();
        self.with_db(|db| {
            db.upsert_session(&SessionRow {
                document_id: document_id.to_string(),
                session_did: session_did.to_string(),
                owner_did: owner_did.to_string(),
                room_info: room_info.clone(),
                state: "active".to_string(),
                created_at: now,
                updated_at: now,
            })
        });

        self.publish(BusEventKind::SessionCreated {
            session: session.to_cached(),
        });
        tracing::info!(document_id, session_did, owner_did, "session created");
        Ok(())
    }

    /// Three-tier read: local map → shared cache → durable record.
    /// Fallback hits warm the faster tiers.
    pub fn get_session(&self, document_id: &str, session_did: &str) -> Option<Session> {
        let key = session_key(document_id, session_did);

        if let Some(session) = self.sessions.read().get(&key) {
            return Some(session.clone());
        }

        if let Some(cached) = self.cache.get(&cache_key(document_id, session_did)) {
            let session = Session::from_cached(cached);
            self.sessions.write().insert(key, session.clone());
            return Some(session);
        }

        let row = self.with_db(|db| db.get_session(document_id, session_did))??;
        let session = Session {
            document_id: row.document_id,
            session_did: row.session_did,
            owner_did: row.owner_did,
            room_info: row.room_info,
            clients: HashSet::new(),
            state: SessionState::parse(&row.state),
        };
        self.cache
            .put(&cache_key(document_id, session_did), &session.to_cached());
        self.sessions.write().insert(key, session.clone());
        Some(session)
    }

    /// Add a client to an existing session.
    pub fn add_client_to_session(
        &self,
        document_id: &str,
        session_did: &str,
        client_id: &str,
    ) -> Result<(), RelayError> {
        let key = session_key(document_id, session_did);
        {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| RelayError::NotFound("session not found".into()))?;
            session.clients.insert(client_id.to_string());
            session.state = SessionState::Active;
        }
        self.cache
            .add_client(&cache_key(document_id, session_did), client_id);
        self.publish(BusEventKind::ClientJoined {
            document_id: document_id.to_string(),
            session_did: session_did.to_string(),
            client_id: client_id.to_string(),
        });
        Ok(())
    }

    /// Remove a client; deactivates the session when its (cluster-wide)
    /// client set empties.
    pub fn remove_client_from_session(&self, document_id: &str, session_did: &str, client_id: &str) {
        let key = session_key(document_id, session_did);
        let now_empty = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&key) {
                Some(session) => {
                    session.clients.remove(client_id);
                    session.clients.is_empty()
                }
                None => false,
            }
        };

        self.cache
            .remove_client(&cache_key(document_id, session_did), client_id);
        if now_empty {
            self.deactivate_session(document_id, session_did);
        }
        self.publish(BusEventKind::ClientLeft {
            document_id: document_id.to_string(),
            session_did: session_did.to_string(),
            client_id: client_id.to_string(),
        });
    }

    /// Drop local state, delete the cache entry, mark the durable record
    /// inactive. The pair stays joinable through a fresh owner setup.
    pub fn deactivate_session(&self, document_id: &str, session_did: &str) {
        let key = session_key(document_id, session_did);
        let removed = self.sessions.write().remove(&key);
        self.cache.delete(&cache_key(document_id, session_did));
        let now = Self::now_ms();
        self.with_db(|db| db.set_session_state(document_id, session_did, "inactive", now));

        // Flip peer mirrors to inactive so no node keeps treating the
        // session as live.
        if let Some(mut session) = removed {
            session.state = SessionState::Inactive;
            session.clients.clear();
            self.publish(BusEventKind::SessionUpdated {
                session: session.to_cached(),
            });
        }
        tracing::info!(document_id, session_did, "session deactivated");
    }

    /// Permanently retire a pair: tombstone the durable record, delete the
    /// pair's update/commit rows, drop cache + local state, tell the
    /// cluster.
    pub fn terminate_session(
        &self,
        document_id: &str,
        session_did: &str,
    ) -> Result<(), RelayError> {
        let key = session_key(document_id, session_did);
        self.sessions.write().remove(&key);
        self.cache.delete(&cache_key(document_id, session_did));

        let now = Self::now_ms();
        {
            let mut db = self.db.lock();
            db.terminate_session(document_id, session_did, now)?;
        }

        self.publish(BusEventKind::SessionDeleted {
            document_id: document_id.to_string(),
            session_did: session_did.to_string(),
        });
        tracing::info!(document_id, session_did, "session terminated");
        Ok(())
    }

    /// Owner-writable metadata blob. Caller enforces the owner check.
    pub fn update_room_info(
        &self,
        document_id: &str,
        session_did: &str,
        room_info: Option<serde_json::Value>,
    ) {
        let key = session_key(document_id, session_did);
        let cached = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&key) {
                Some(session) => {
                    session.room_info = room_info.clone();
                    Some(session.to_cached())
                }
                None => None,
            }
        };
        if let Some(cached) = cached {
            self.cache
                .put(&cache_key(document_id, session_did), &cached);
        }
        let now = Self::now_ms();
        self.with_db(|db| db.set_room_info(document_id, session_did, room_info.as_ref(), now));
        self.publish(BusEventKind::RoomInfoUpdated {
            document_id: document_id.to_string(),
            session_did: session_did.to_string(),
            room_info,
        });
    }

    /// Fan a pre-serialized message out to every client of a session on
    /// every node. Local peers are served immediately, before the bus
    /// round-trip; remote nodes replay the event through the same handler.
    pub fn broadcast_to_all_nodes(
        &self,
        document_id: &str,
        session_did: &str,
        payload: &str,
        exclude_client_id: Option<&str>,
        droppable: bool,
    ) {
        self.deliver_local(document_id, session_did, payload, exclude_client_id, droppable);
        self.publish(BusEventKind::BroadcastMessage {
            document_id: document_id.to_string(),
            session_did: session_did.to_string(),
            payload: payload.to_string(),
            exclude_client_id: exclude_client_id.map(|s| s.to_string()),
            droppable,
        });
    }

    /// The cluster-wide client set: shared cache first, local map as the
    /// degradation path.
    pub fn cluster_clients(&self, document_id: &str, session_did: &str) -> Vec<String> {
        if let Some(cached) = self.cache.get(&cache_key(document_id, session_did)) {
            return cached.clients.into_iter().collect();
        }
        let key = session_key(document_id, session_did);
        self.sessions
            .read()
            .get(&key)
            .map(|s| s.clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn deliver_local(
        &self,
        document_id: &str,
        session_did: &str,
        payload: &str,
        exclude_client_id: Option<&str>,
        droppable: bool,
    ) {
        let key = session_key(document_id, session_did);
        let clients: Vec<String> = match self.sessions.read().get(&key) {
            Some(session) => session.clients.iter().cloned().collect(),
            None => return,
        };
        let handler = self.broadcast_handler.read().clone();
        if let Some(handler) = handler {
            handler(&clients, payload, exclude_client_id, droppable);
        }
    }

    // ── Bus event application ──────────────────────────────────────────

    /// Spawn the task that keeps the local map coherent with the cluster.
    pub fn spawn_event_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => manager.apply_bus_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Best-effort bus: drop what we missed and move on.
                        tracing::warn!(missed, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn apply_bus_event(&self, event: BusEvent) {
        if event.node_id == self.node_id {
            return;
        }
        match event.kind {
            BusEventKind::SessionCreated { session } => {
                // The only event allowed to introduce a session this node
                // has never seen.
                let key = session_key(&session.document_id, &session.session_did);
                self.sessions
                    .write()
                    .insert(key, Session::from_cached(session));
            }
            BusEventKind::SessionUpdated { session } => {
                let key = session_key(&session.document_id, &session.session_did);
                let mut sessions = self.sessions.write();
                if let Some(existing) = sessions.get_mut(&key) {
                    existing.room_info = session.room_info.clone();
                    existing.state = SessionState::parse(&session.state);
                }
            }
            BusEventKind::SessionDeleted {
                document_id,
                session_did,
            } => {
                let key = session_key(&document_id, &session_did);
                self.sessions.write().remove(&key);
            }
            BusEventKind::ClientJoined {
                document_id,
                session_did,
                client_id,
            } => {
                let key = session_key(&document_id, &session_did);
                let mut sessions = self.sessions.write();
                if let Some(session) = sessions.get_mut(&key) {
                    session.clients.insert(client_id);
                    session.state = SessionState::Active;
                }
            }
            BusEventKind::ClientLeft {
                document_id,
                session_did,
                client_id,
            } => {
                let key = session_key(&document_id, &session_did);
                let mut sessions = self.sessions.write();
                if let Some(session) = sessions.get_mut(&key) {
                    session.clients.remove(&client_id);
                }
            }
            BusEventKind::RoomInfoUpdated {
                document_id,
                session_did,
                room_info,
            } => {
                let key = session_key(&document_id, &session_did);
                let mut sessions = self.sessions.write();
                if let Some(session) = sessions.get_mut(&key) {
                    session.room_info = room_info;
                }
            }
            BusEventKind::BroadcastMessage {
                document_id,
                session_did,
                payload,
                exclude_client_id,
                droppable,
            } => {
                self.deliver_local(
                    &document_id,
                    &session_did,
                    &payload,
                    exclude_client_id.as_deref(),
                    droppable,
                );
            }
        }
    }
}
