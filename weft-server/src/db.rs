//! SQLite persistence layer.
//!
//! Holds the durable session records and the append-only update log
//! (updates + commit markers). Uses WAL mode for concurrent reads during
//! writes. Update rows are immutable except for the single
//! `committed: false → true` transition performed inside a commit
//! transaction.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult};
use serde::{Deserialize, Serialize};

/// Tag recorded on every update row. The relay never interprets payloads;
/// the tag exists so future payload kinds can coexist in the log.
pub const UPDATE_TYPE_CRDT: &str = "crdt";

/// Default page size for update history queries.
pub const DEFAULT_UPDATE_LIMIT: usize = 100;
/// Default page size for commit history queries.
pub const DEFAULT_COMMIT_LIMIT: usize = 10;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// Durable session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub document_id: String,
    pub session_did: String,
    pub owner_did: String,
    pub room_info: Option<serde_json::Value>,
    pub state: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An opaque append-only log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRow {
    pub id: String,
    pub document_id: String,
    pub session_did: String,
    pub data: String,
    pub update_type: String,
    pub committed: bool,
    pub commit_cid: Option<String>,
    pub created_at: i64,
}

/// A commit marker bundling update ids into an external snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRow {
    pub id: String,
    pub document_id: String,
    pub session_did: String,
    pub cid: String,
    pub updates: Vec<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            // Ties broken by id so pagination is stable.
            SortOrder::Asc => "created_at ASC, id ASC",
            SortOrder::Desc => "created_at DESC, id DESC",
        }
    }
}

/// Pagination and filtering for update history reads.
#[derive(Debug, Clone)]
pub struct UpdateQuery {
    pub limit: usize,
    pub offset: usize,
    pub committed: Option<bool>,
    pub sort: SortOrder,
}

impl Default for UpdateQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_UPDATE_LIMIT,
            offset: 0,
            committed: None,
            sort: SortOrder::Desc,
        }
    }
}

/// Pagination for commit history reads.
#[derive(Debug, Clone)]
pub struct CommitQuery {
    pub limit: usize,
    pub offset: usize,
    pub sort: SortOrder,
}

impl Default for CommitQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_COMMIT_LIMIT,
            offset: 0,
            sort: SortOrder::Desc,
        }
    }
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                document_id TEXT NOT NULL,
                session_did TEXT NOT NULL,
                owner_did   TEXT NOT NULL,
                room_info   TEXT,
                state       TEXT NOT NULL DEFAULT 'active',
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (document_id, session_did)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_doc_created
                ON sessions(document_id, created_at, session_did);

            CREATE TABLE IF NOT EXISTS document_updates (
                id          TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                session_did TEXT NOT NULL,
                data        TEXT NOT NULL,
                update_type TEXT NOT NULL,
                committed   INTEGER NOT NULL DEFAULT 0,
                commit_cid  TEXT,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_updates_doc
                ON document_updates(document_id);
            CREATE INDEX IF NOT EXISTS idx_updates_committed
                ON document_updates(committed);
            CREATE INDEX IF NOT EXISTS idx_updates_created
                ON document_updates(created_at);
            CREATE INDEX IF NOT EXISTS idx_updates_doc_committed_created
                ON document_updates(document_id, committed, created_at, session_did);
            CREATE INDEX IF NOT EXISTS idx_updates_uncommitted
                ON document_updates(document_id, created_at)
                WHERE committed = 0;

            CREATE TABLE IF NOT EXISTS document_commits (
                id           TEXT PRIMARY KEY,
                document_id  TEXT NOT NULL,
                session_did  TEXT NOT NULL,
                cid          TEXT NOT NULL,
                updates_json TEXT NOT NULL DEFAULT '[]',
                created_at   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_commits_doc
                ON document_commits(document_id);
            CREATE INDEX IF NOT EXISTS idx_commits_created
                ON document_commits(created_at);
            CREATE INDEX IF NOT EXISTS idx_commits_doc_created
                ON document_commits(document_id, created_at);
            ",
        )?;
        Ok(())
    }

    // ── Sessions ───────────────────────────────────────────────────────

    /// Insert or reactivate a session record. Preserves `created_at` and
    /// `owner_did` on conflict — the owner of a pair never changes.
    pub fn upsert_session(&self, row: &SessionRow) -> SqlResult<()> {
        let room_info = row
            .room_info
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));
        self.conn.execute(
            "INSERT INTO sessions (document_id, session_did, owner_did, room_info, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(document_id, session_did) DO UPDATE SET
                room_info=excluded.room_info,
                state=excluded.state,
                updated_at=excluded.updated_at",
            params![
                row.document_id,
                row.session_did,
                row.owner_did,
                room_info,
                row.state,
                row.created_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Load a session record. Terminated pairs are permanently retired and
    /// never returned here.
    pub fn get_session(&self, document_id: &str, session_did: &str) -> SqlResult<Option<SessionRow>> {
        self.conn
            .query_row(
                "SELECT document_id, session_did, owner_did, room_info, state, created_at, updated_at
                 FROM sessions
                 WHERE document_id = ?1 AND session_did = ?2 AND state != 'terminated'",
                params![document_id, session_did],
                map_session_row,
            )
            .optional()
    }

    /// Whether the pair has been terminated (tombstone check for setup).
    pub fn is_terminated(&self, document_id: &str, session_did: &str) -> SqlResult<bool> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM sessions WHERE document_id = ?1 AND session_did = ?2",
                params![document_id, session_did],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.as_deref() == Some("terminated"))
    }

    pub fn set_session_state(
        &self,
        document_id: &str,
        session_did: &str,
        state: &str,
        now_ms: i64,
    ) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE sessions SET state = ?3, updated_at = ?4
             WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did, state, now_ms],
        )?;
        Ok(())
    }

    pub fn set_room_info(
        &self,
        document_id: &str,
        session_did: &str,
        room_info: Option<&serde_json::Value>,
        now_ms: i64,
    ) -> SqlResult<()> {
        let room_info = room_info.map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".into()));
        self.conn.execute(
            "UPDATE sessions SET room_info = ?3, updated_at = ?4
             WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did, room_info, now_ms],
        )?;
        Ok(())
    }

    /// Terminate a session: tombstone the record and drop the pair's log.
    pub fn terminate_session(
        &mut self,
        document_id: &str,
        session_did: &str,
        now_ms: i64,
    ) -> SqlResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE sessions SET state = 'terminated', room_info = NULL, updated_at = ?3
             WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did, now_ms],
        )?;
        tx.execute(
            "DELETE FROM document_updates WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did],
        )?;
        tx.execute(
            "DELETE FROM document_commits WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did],
        )?;
        tx.commit()
    }

    // ── Updates ────────────────────────────────────────────────────────

    /// Append an update row. New rows are always uncommitted.
    pub fn insert_update(&self, row: &UpdateRow) -> SqlResult<()> {
        debug_assert!(!row.committed && row.commit_cid.is_none());
        self.conn.execute(
            "INSERT INTO document_updates (id, document_id, session_did, data, update_type, committed, commit_cid, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)",
            params![
                row.id,
                row.document_id,
                row.session_did,
                row.data,
                row.update_type,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    /// Persist a commit marker and, in the same transaction, mark every
    /// referenced update as committed with the commit's CID.
    ///
    /// Referenced ids that do not exist (a straggling update that never
    /// reached the store) are accepted and skipped — the CID is the
    /// authoritative record. Returns the number of updates transitioned.
    pub fn insert_commit(&mut self, row: &CommitRow) -> SqlResult<usize> {
        let tx = self.conn.transaction()?;

        let updates_json =
            serde_json::to_string(&row.updates).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "INSERT INTO document_commits (id, document_id, session_did, cid, updates_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.document_id,
                row.session_did,
                row.cid,
                updates_json,
                row.created_at,
            ],
        )?;

        let mut transitioned = 0;
        if !row.updates.is_empty() {
            let placeholders = vec!["?"; row.updates.len()].join(", ");
            let known: HashSet<String> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id FROM document_updates WHERE id IN ({placeholders})"
                ))?;
                let rows = stmt.query_map(params_from_iter(row.updates.iter()), |r| r.get(0))?;
                rows.collect::<SqlResult<_>>()?
            };
            let unknown: Vec<&String> =
                row.updates.iter().filter(|id| !known.contains(*id)).collect();
            if !unknown.is_empty() {
                tracing::warn!(
                    commit_id = %row.id,
                    document_id = %row.document_id,
                    unknown = ?unknown,
                    "commit references unknown update ids; transitioning known ids only"
                );
            }

            // committed = 0 guard: the transition is one-way and one-time.
            let update_sql = format!(
                "UPDATE document_updates SET committed = 1, commit_cid = ? \
                 WHERE committed = 0 AND id IN ({placeholders})"
            );
            let mut stmt = tx.prepare(&update_sql)?;
            let params_iter = std::iter::once(row.cid.clone()).chain(row.updates.iter().cloned());
            transitioned = stmt.execute(params_from_iter(params_iter))?;
        }

        tx.commit()?;
        Ok(transitioned)
    }

    /// Fetch a page of update rows for a document.
    pub fn updates_by_document(
        &self,
        document_id: &str,
        query: &UpdateQuery,
    ) -> SqlResult<Vec<UpdateRow>> {
        let mut sql = String::from(
            "SELECT id, document_id, session_did, data, update_type, committed, commit_cid, created_at
             FROM document_updates WHERE document_id = ?1",
        );
        if query.committed.is_some() {
            sql.push_str(" AND committed = ?2");
        }
        sql.push_str(&format!(
            " ORDER BY {} LIMIT {} OFFSET {}",
            query.sort.sql(),
            query.limit,
            query.offset
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match query.committed {
            Some(committed) => stmt
                .query_map(params![document_id, committed as i64], map_update_row)?
                .collect::<SqlResult<Vec<_>>>()?,
            None => stmt
                .query_map(params![document_id], map_update_row)?
                .collect::<SqlResult<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Fetch a page of commit rows for a document.
    pub fn commits_by_document(
        &self,
        document_id: &str,
        query: &CommitQuery,
    ) -> SqlResult<Vec<CommitRow>> {
        let sql = format!(
            "SELECT id, document_id, session_did, cid, updates_json, created_at
             FROM document_commits WHERE document_id = ?1
             ORDER BY {} LIMIT {} OFFSET {}",
            query.sort.sql(),
            query.limit,
            query.offset
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![document_id], map_commit_row)?;
        rows.collect()
    }

    /// Count update rows for a pair (used by tests and diagnostics).
    pub fn count_updates(&self, document_id: &str, session_did: &str) -> SqlResult<usize> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM document_updates WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did],
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )
    }

    pub fn count_commits(&self, document_id: &str, session_did: &str) -> SqlResult<usize> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM document_commits WHERE document_id = ?1 AND session_did = ?2",
            params![document_id, session_did],
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )
    }
}

fn map_session_row(row: &rusqlite::Row) -> SqlResult<SessionRow> {
    let room_info: Option<String> = row.get(3)?;
    Ok(SessionRow {
        document_id: row.get(0)?,
        session_did: row.get(1)?,
        owner_did: row.get(2)?,
        room_info: room_info.and_then(|s| serde_json::from_str(&s).ok()),
        state: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_update_row(row: &rusqlite::Row) -> SqlResult<UpdateRow> {
    Ok(UpdateRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        session_did: row.get(2)?,
        data: row.get(3)?,
        update_type: row.get(4)?,
        committed: row.get::<_, i64>(5)? != 0,
        commit_cid: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_commit_row(row: &rusqlite::Row) -> SqlResult<CommitRow> {
    let updates_json: String = row.get(4)?;
    Ok(CommitRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        session_did: row.get(2)?,
        cid: row.get(3)?,
        updates: serde_json::from_str(&updates_json).unwrap_or_default(),
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, doc: &str, ts: i64) -> UpdateRow {
        UpdateRow {
            id: id.to_string(),
            document_id: doc.to_string(),
            session_did: "did:key:zS".to_string(),
            data: format!("payload-{id}"),
            update_type: UPDATE_TYPE_CRDT.to_string(),
            committed: false,
            commit_cid: None,
            created_at: ts,
        }
    }

    fn commit(id: &str, doc: &str, cid: &str, updates: &[&str], ts: i64) -> CommitRow {
        CommitRow {
            id: id.to_string(),
            document_id: doc.to_string(),
            session_did: "did:key:zS".to_string(),
            cid: cid.to_string(),
            updates: updates.iter().map(|s| s.to_string()).collect(),
            created_at: ts,
        }
    }

    #[test]
    fn session_roundtrip_and_reactivation() {
        let db = Db::open_memory().unwrap();
        let row = SessionRow {
            document_id: "d1".into(),
            session_did: "did:key:zS".into(),
            owner_did: "did:key:zO".into(),
            room_info: Some(serde_json::json!({"title": "notes"})),
            state: "active".into(),
            created_at: 1000,
            updated_at: 1000,
        };
        db.upsert_session(&row).unwrap();

        let loaded = db.get_session("d1", "did:key:zS").unwrap().unwrap();
        assert_eq!(loaded.owner_did, "did:key:zO");
        assert_eq!(loaded.room_info.unwrap()["title"], "notes");

        db.set_session_state("d1", "did:key:zS", "inactive", 2000).unwrap();
        let loaded = db.get_session("d1", "did:key:zS").unwrap().unwrap();
        assert_eq!(loaded.state, "inactive");

        // Re-setup flips the row back to active, owner preserved.
        db.upsert_session(&SessionRow {
            state: "active".into(),
            updated_at: 3000,
            owner_did: "did:key:zIgnored".into(),
            ..row
        })
        .unwrap();
        let loaded = db.get_session("d1", "did:key:zS").unwrap().unwrap();
        assert_eq!(loaded.state, "active");
        assert_eq!(loaded.owner_did, "did:key:zO");
        assert_eq!(loaded.created_at, 1000);
    }

    #[test]
    fn terminated_sessions_are_invisible() {
        let mut db = Db::open_memory().unwrap();
        db.upsert_session(&SessionRow {
            document_id: "d1".into(),
            session_did: "did:key:zS".into(),
            owner_did: "did:key:zO".into(),
            room_info: None,
            state: "active".into(),
            created_at: 1000,
            updated_at: 1000,
        })
        .unwrap();
        db.terminate_session("d1", "did:key:zS", 2000).unwrap();

        assert!(db.get_session("d1", "did:key:zS").unwrap().is_none());
        assert!(db.is_terminated("d1", "did:key:zS").unwrap());
        assert!(!db.is_terminated("d1", "did:key:zOther").unwrap());
    }

    #[test]
    fn terminate_deletes_log_rows() {
        let mut db = Db::open_memory().unwrap();
        db.insert_update(&update("u1", "d1", 1000)).unwrap();
        db.insert_update(&update("u2", "d1", 1001)).unwrap();
        db.insert_commit(&commit("c1", "d1", "bafy1", &["u1"], 1002)).unwrap();

        db.terminate_session("d1", "did:key:zS", 2000).unwrap();

        assert_eq!(db.count_updates("d1", "did:key:zS").unwrap(), 0);
        assert_eq!(db.count_commits("d1", "did:key:zS").unwrap(), 0);
    }

    #[test]
    fn commit_transitions_referenced_updates_atomically() {
        let mut db = Db::open_memory().unwrap();
        db.insert_update(&update("u1", "d1", 1000)).unwrap();
        db.insert_update(&update("u2", "d1", 1001)).unwrap();
        db.insert_update(&update("u3", "d1", 1002)).unwrap();

        let n = db.insert_commit(&commit("c1", "d1", "bafyX", &["u1", "u2"], 1003)).unwrap();
        assert_eq!(n, 2);

        let rows = db.updates_by_document("d1", &UpdateQuery::default()).unwrap();
        for row in &rows {
            match row.id.as_str() {
                "u1" | "u2" => {
                    assert!(row.committed);
                    assert_eq!(row.commit_cid.as_deref(), Some("bafyX"));
                }
                "u3" => {
                    assert!(!row.committed);
                    assert!(row.commit_cid.is_none());
                }
                other => panic!("unexpected row {other}"),
            }
        }
    }

    #[test]
    fn commit_with_unknown_ids_transitions_known_only() {
        let mut db = Db::open_memory().unwrap();
        db.insert_update(&update("u1", "d1", 1000)).unwrap();

        let n = db
            .insert_commit(&commit("c1", "d1", "bafyX", &["u1", "u-missing"], 1001))
            .unwrap();
        assert_eq!(n, 1);

        // The commit row itself is persisted with both ids.
        let commits = db.commits_by_document("d1", &CommitQuery::default()).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].updates, vec!["u1", "u-missing"]);
    }

    #[test]
    fn committed_updates_keep_their_first_cid() {
        let mut db = Db::open_memory().unwrap();
        db.insert_update(&update("u1", "d1", 1000)).unwrap();
        db.insert_commit(&commit("c1", "d1", "bafyA", &["u1"], 1001)).unwrap();
        let n = db.insert_commit(&commit("c2", "d1", "bafyB", &["u1"], 1002)).unwrap();
        assert_eq!(n, 0);

        let rows = db.updates_by_document("d1", &UpdateQuery::default()).unwrap();
        assert_eq!(rows[0].commit_cid.as_deref(), Some("bafyA"));
    }

    #[test]
    fn update_pagination_and_filters() {
        let db = Db::open_memory().unwrap();
        for i in 0..5 {
            db.insert_update(&update(&format!("u{i}"), "d1", 1000 + i)).unwrap();
        }

        // Default sort is descending by created_at.
        let rows = db.updates_by_document("d1", &UpdateQuery::default()).unwrap();
        assert_eq!(rows[0].id, "u4");
        assert_eq!(rows[4].id, "u0");

        let rows = db
            .updates_by_document(
                "d1",
                &UpdateQuery {
                    limit: 2,
                    offset: 1,
                    sort: SortOrder::Asc,
                    committed: None,
                },
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "u1");
        assert_eq!(rows[1].id, "u2");

        let rows = db
            .updates_by_document(
                "d1",
                &UpdateQuery {
                    committed: Some(true),
                    ..UpdateQuery::default()
                },
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn ties_broken_by_id() {
        let db = Db::open_memory().unwrap();
        db.insert_update(&update("b", "d1", 1000)).unwrap();
        db.insert_update(&update("a", "d1", 1000)).unwrap();

        let rows = db.updates_by_document("d1", &UpdateQuery::default()).unwrap();
        assert_eq!(rows[0].id, "b");
        assert_eq!(rows[1].id, "a");
    }

    #[test]
    fn commits_isolated_by_document() {
        let mut db = Db::open_memory().unwrap();
        db.insert_commit(&commit("c1", "d1", "bafy1", &[], 1000)).unwrap();
        db.insert_commit(&commit("c2", "d2", "bafy2", &[], 1001)).unwrap();

        let d1 = db.commits_by_document("d1", &CommitQuery::default()).unwrap();
        assert_eq!(d1.len(), 1);
        assert_eq!(d1[0].cid, "bafy1");
    }
}
