//! Persistent `Adapter` backed by SQLite, one file per database.
//!
//! Layout on disk mirrors Cloudant/PouchDB's own local store:
//!
//! ```text
//! <root>/db.sync                                            main store
//! <root>/extensions/com.cloudant.attachments/<sha1-hex>      blob content
//! ```
//!
//! The main store keeps one row per revision (`revs`), with `current`
//! marking open leaves and `docs.winning_sequence` caching which leaf wins
//! so reads never need to walk the tree. Writes go through the same
//! deterministic winner-selection rule used everywhere else in the crate:
//! non-deleted leaves first, then highest generation, then highest revid.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use rouchdb_changes::{DocumentEvent, Event, EventBus, StoreEvent};
use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, AttachmentMeta, BulkDocsOptions,
    BulkGetDoc, BulkGetError, BulkGetResponse, BulkGetResult, ChangeEvent, ChangeRev,
    ChangesOptions, ChangesResponse, DbInfo, DocResult, Document, GetAttachmentOptions,
    GetOptions, OpenRevs, PutResponse, Revision, RevsDiffResponse, RevsDiffResult, Seq,
};
use rouchdb_core::error::{Result, RouchError};

fn db_err(e: rusqlite::Error) -> RouchError {
    RouchError::DatabaseError(e.to_string())
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS docs (
            doc_id INTEGER PRIMARY KEY,
            docid TEXT UNIQUE NOT NULL,
            winning_sequence INTEGER
        );
        CREATE TABLE IF NOT EXISTS revs (
            sequence INTEGER PRIMARY KEY,
            doc_id INTEGER NOT NULL REFERENCES docs(doc_id),
            parent INTEGER REFERENCES revs(sequence),
            revid TEXT NOT NULL,
            current INTEGER NOT NULL,
            deleted INTEGER NOT NULL,
            available INTEGER NOT NULL DEFAULT 1,
            json BLOB,
            UNIQUE(doc_id, revid)
        );
        CREATE INDEX IF NOT EXISTS idx_revs_doc_current ON revs(doc_id, current);
        CREATE TABLE IF NOT EXISTS attachments (
            sequence INTEGER NOT NULL REFERENCES revs(sequence),
            filename TEXT NOT NULL,
            key BLOB NOT NULL,
            type TEXT,
            encoding INTEGER NOT NULL DEFAULT 0,
            length INTEGER NOT NULL,
            encoded_length INTEGER NOT NULL,
            revpos INTEGER NOT NULL,
            UNIQUE(sequence, filename)
        );
        CREATE TABLE IF NOT EXISTS localdocs (
            docid TEXT PRIMARY KEY,
            json BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        INSERT OR IGNORE INTO info (key, value) VALUES ('schema_version', '2');
        "#,
    )
    .map_err(db_err)?;
    Ok(())
}

/// Collapse duplicate `(doc_id, revid)` rows left behind by schema-1
/// stores that lacked the uniqueness constraint: keep the row with the
/// lowest sequence, repoint children and attachments at it, drop the
/// rest, then recompute the winner for every document touched.
///
/// A no-op on any store created by `init_schema` above, since the
/// constraint there makes the duplicate condition unreachable going
/// forward; this only matters when opening a file written by an older
/// or foreign implementation.
fn repair_duplicates(conn: &Connection) -> Result<()> {
    let dup_groups: Vec<(i64, String, i64)> = {
        let mut stmt = conn
            .prepare(
                "SELECT doc_id, revid, MIN(sequence) FROM revs
                 GROUP BY doc_id, revid HAVING COUNT(*) > 1",
            )
            .map_err(db_err)?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?
    };

    if !dup_groups.is_empty() {
        tracing::warn!(groups = dup_groups.len(), "repairing duplicate revision rows from an older store");
    }

    let mut touched = HashSet::new();
    for (doc_id, revid, keep_seq) in dup_groups {
        touched.insert(doc_id);
        let dup_seqs: Vec<i64> = {
            let mut stmt = conn
                .prepare("SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2 AND sequence != ?3")
                .map_err(db_err)?;
            stmt.query_map(params![doc_id, revid, keep_seq], |row| row.get(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?
        };
        for dup_seq in dup_seqs {
            conn.execute("UPDATE revs SET parent = ?1 WHERE parent = ?2", params![keep_seq, dup_seq])
                .map_err(db_err)?;
            conn.execute(
                "DELETE FROM attachments WHERE sequence = ?1
                 AND filename IN (SELECT filename FROM attachments WHERE sequence = ?2)",
                params![dup_seq, keep_seq],
            )
            .map_err(db_err)?;
            conn.execute(
                "UPDATE attachments SET sequence = ?1 WHERE sequence = ?2",
                params![keep_seq, dup_seq],
            )
            .map_err(db_err)?;
            conn.execute("DELETE FROM revs WHERE sequence = ?1", params![dup_seq])
                .map_err(db_err)?;
        }
    }

    for doc_id in touched {
        recompute_winner(conn, doc_id)?;
    }
    Ok(())
}

/// Every current (leaf) revision of a document, winner first: non-deleted
/// before deleted, higher generation before lower, higher revid breaks ties.
fn current_leaves(conn: &Connection, doc_id: i64) -> Result<Vec<(i64, Revision, bool)>> {
    let mut stmt = conn
        .prepare("SELECT sequence, revid, deleted FROM revs WHERE doc_id = ?1 AND current = 1")
        .map_err(db_err)?;
    let mut leaves: Vec<(i64, Revision, bool)> = stmt
        .query_map(params![doc_id], |row| {
            let sequence: i64 = row.get(0)?;
            let revid: String = row.get(1)?;
            let deleted: i64 = row.get(2)?;
            Ok((sequence, revid, deleted != 0))
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?
        .into_iter()
        .map(|(seq, revid, deleted)| {
            let rev = revid.parse().unwrap_or_else(|_| Revision::new(0, String::new()));
            (seq, rev, deleted)
        })
        .collect();

    leaves.sort_by(|a, b| {
        a.2.cmp(&b.2)
            .then_with(|| b.1.pos.cmp(&a.1.pos))
            .then_with(|| b.1.hash.cmp(&a.1.hash))
    });
    Ok(leaves)
}

fn recompute_winner(conn: &Connection, doc_id: i64) -> Result<()> {
    let leaves = current_leaves(conn, doc_id)?;
    let winner = leaves.first().map(|(seq, _, _)| *seq);
    tracing::debug!(doc_id, leaves = leaves.len(), ?winner, "winner recomputed");
    conn.execute(
        "UPDATE docs SET winning_sequence = ?1 WHERE doc_id = ?2",
        params![winner, doc_id],
    )
    .map_err(db_err)?;
    Ok(())
}

fn find_doc_id(conn: &Connection, docid: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT doc_id FROM docs WHERE docid = ?1", params![docid], |row| row.get(0))
        .optional()
}

fn current_winner(conn: &Connection, doc_id: i64) -> rusqlite::Result<Option<(i64, Revision, bool)>> {
    let winning_seq: Option<i64> = conn.query_row(
        "SELECT winning_sequence FROM docs WHERE doc_id = ?1",
        params![doc_id],
        |row| row.get(0),
    )?;
    match winning_seq {
        None => Ok(None),
        Some(seq) => {
            let (revid, deleted): (String, i64) = conn.query_row(
                "SELECT revid, deleted FROM revs WHERE sequence = ?1",
                params![seq],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let rev = revid.parse().unwrap_or_else(|_| Revision::new(0, String::new()));
            Ok(Some((seq, rev, deleted != 0)))
        }
    }
}

fn conflict_revisions(conn: &Connection, doc_id: i64) -> rusqlite::Result<Vec<Revision>> {
    let winning_seq: Option<i64> = conn.query_row(
        "SELECT winning_sequence FROM docs WHERE doc_id = ?1",
        params![doc_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare("SELECT sequence, revid FROM revs WHERE doc_id = ?1 AND current = 1 AND deleted = 0")?;
    let rows = stmt.query_map(params![doc_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, revid) = row?;
        if Some(seq) != winning_seq {
            if let Ok(rev) = revid.parse() {
                out.push(rev);
            }
        }
    }
    Ok(out)
}

/// Deterministic revision hash: MD5 of the parent rev id (if any), the
/// deleted flag, the sorted attachment digests, and the body. No
/// randomness — a replayed write must hash identically so idempotent
/// pulls converge instead of forking.
fn new_hash(
    parent_rev_id: Option<&str>,
    deleted: bool,
    attachment_digests: &[String],
    data: &serde_json::Value,
) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    if let Some(parent) = parent_rev_id {
        hasher.update(parent.as_bytes());
    }
    hasher.update([deleted as u8]);
    let mut sorted = attachment_digests.to_vec();
    sorted.sort();
    for digest in &sorted {
        hasher.update(digest.as_bytes());
    }
    hasher.update(data.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sorted_attachment_digests(attachments: &HashMap<String, AttachmentMeta>) -> Vec<String> {
    let mut digests: Vec<String> = attachments.values().map(|a| a.digest.clone()).collect();
    digests.sort();
    digests
}

fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Walk `parent` pointers from `seq` to the root, returning revids'
/// hash components newest-first. Used to populate `Document::revisions`
/// for `GetOptions::revs` and `bulk_get`.
fn ancestor_chain(conn: &Connection, mut seq: i64) -> rusqlite::Result<Vec<String>> {
    let mut chain = Vec::new();
    loop {
        let (revid, parent): (String, Option<i64>) = conn.query_row(
            "SELECT revid, parent FROM revs WHERE sequence = ?1",
            params![seq],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let hash = revid.split_once('-').map(|(_, h)| h.to_string()).unwrap_or(revid);
        chain.push(hash);
        match parent {
            Some(p) => seq = p,
            None => break,
        }
    }
    Ok(chain)
}

/// A SQLite-backed `Adapter`. Construct one per database directory;
/// `Connection` is `Send` but not `Sync`, so every call takes the same
/// `Mutex` the way the in-memory adapter takes its `HashMap` lock.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
    root: PathBuf,
    name: String,
    event_bus: EventBus,
}

impl SqliteAdapter {
    /// Open (creating if absent) the database rooted at `root`, running
    /// the duplicate-revision repair migration before returning.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let conn = Connection::open(root.join("db.sync")).map_err(db_err)?;
        init_schema(&conn)?;
        repair_duplicates(&conn)?;
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("db")
            .to_string();
        let event_bus = EventBus::default();
        event_bus.publish(Event::Store(StoreEvent::Opened { name: name.clone() }));
        Ok(Self { conn: Mutex::new(conn), root, name, event_bus })
    }

    /// An ephemeral SQLite database, for tests that want the real storage
    /// engine without a temp directory. Attachment blobs still land on
    /// disk, under a process-unique scratch directory.
    pub fn in_memory(name: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        init_schema(&conn)?;
        let root = std::env::temp_dir().join(format!("rouchdb-sqlite-{}", uuid::Uuid::new_v4()));
        let name = name.into();
        let event_bus = EventBus::default();
        event_bus.publish(Event::Store(StoreEvent::Created { name: name.clone() }));
        Ok(Self { conn: Mutex::new(conn), root, name, event_bus })
    }

    /// The bus this store publishes document and lifecycle events to.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    fn attachments_dir(&self) -> PathBuf {
        self.root.join("extensions").join("com.cloudant.attachments")
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn put(&self, doc: Document) -> Result<PutResponse> {
        let conn = self.conn.lock().unwrap();
        let id = if doc.id.is_empty() { uuid::Uuid::new_v4().to_string() } else { doc.id.clone() };

        let doc_id = match find_doc_id(&conn, &id).map_err(db_err)? {
            Some(d) => d,
            None => {
                conn.execute("INSERT INTO docs (docid, winning_sequence) VALUES (?1, NULL)", params![id])
                    .map_err(db_err)?;
                conn.last_insert_rowid()
            }
        };

        let leaves = current_leaves(&conn, doc_id)?;
        let winner = leaves.first().cloned();
        let target = match &doc.rev {
            Some(rev) => leaves.iter().find(|(_, r, _)| r == rev).cloned(),
            None => None,
        };

        match (&doc.rev, &winner) {
            (None, Some((_, _, deleted))) if !deleted => return Err(RouchError::Conflict),
            (Some(_), Some(_)) if target.is_none() => return Err(RouchError::Conflict),
            (Some(_), None) => return Err(RouchError::Conflict),
            _ => {}
        }

        let parent = target.or_else(|| winner.filter(|(_, _, deleted)| *deleted));
        let new_pos = parent.as_ref().map(|(_, r, _)| r.pos + 1).unwrap_or(1);
        let parent_seq = parent.as_ref().map(|(seq, _, _)| *seq);
        let parent_hash = parent.as_ref().map(|(_, r, _)| r.hash.as_str());
        let attachment_digests = sorted_attachment_digests(&doc.attachments);
        let revid = format!(
            "{}-{}",
            new_pos,
            new_hash(parent_hash, doc.deleted, &attachment_digests, &doc.data)
        );

        if let Some(seq) = parent_seq {
            conn.execute("UPDATE revs SET current = 0 WHERE sequence = ?1", params![seq]).map_err(db_err)?;
        }

        let json_bytes = serde_json::to_vec(&doc.data)?;
        conn.execute(
            "INSERT INTO revs (doc_id, parent, revid, current, deleted, available, json)
             VALUES (?1, ?2, ?3, 1, ?4, 1, ?5)",
            params![doc_id, parent_seq, revid, doc.deleted as i64, json_bytes],
        )
        .map_err(db_err)?;

        recompute_winner(&conn, doc_id)?;
        drop(conn);

        let event = if doc.deleted {
            DocumentEvent::Deleted { doc_id: id.clone(), rev: revid.clone() }
        } else if new_pos == 1 {
            DocumentEvent::Created { doc_id: id.clone(), rev: revid.clone() }
        } else {
            DocumentEvent::Updated { doc_id: id.clone(), rev: revid.clone() }
        };
        self.event_bus.publish(Event::Document(event));

        Ok(PutResponse { ok: true, id, rev: revid })
    }

    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let conn = self.conn.lock().unwrap();
        let doc_id = find_doc_id(&conn, id)
            .map_err(db_err)?
            .ok_or_else(|| RouchError::NotFound(id.to_string()))?;

        let (seq, rev, deleted) = match &opts.rev {
            Some(r) => {
                let rev: Revision = r.parse()?;
                let (seq, deleted): (i64, i64) = conn
                    .query_row(
                        "SELECT sequence, deleted FROM revs WHERE doc_id = ?1 AND revid = ?2",
                        params![doc_id, rev.to_string()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(|_| RouchError::NotFound(format!("{}@{}", id, rev)))?;
                (seq, rev, deleted != 0)
            }
            None => {
                let (seq, rev, deleted) = current_winner(&conn, doc_id)
                    .map_err(db_err)?
                    .ok_or_else(|| RouchError::NotFound(id.to_string()))?;
                if deleted {
                    return Err(RouchError::NotFound(format!("{} deleted", id)));
                }
                (seq, rev, deleted)
            }
        };

        let json_bytes: Vec<u8> = conn
            .query_row("SELECT json FROM revs WHERE sequence = ?1", params![seq], |row| row.get(0))
            .map_err(db_err)?;
        let data = if json_bytes.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_slice(&json_bytes)?
        };

        let conflicts = if opts.conflicts { conflict_revisions(&conn, doc_id).map_err(db_err)? } else { Vec::new() };
        let revisions = if opts.revs { ancestor_chain(&conn, seq).map_err(db_err)? } else { Vec::new() };

        let mut attach_stmt = conn
            .prepare("SELECT filename, type, length, key FROM attachments WHERE sequence = ?1")
            .map_err(db_err)?;
        let attachments: HashMap<String, AttachmentMeta> = attach_stmt
            .query_map(params![seq], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?
            .into_iter()
            .map(|(filename, content_type, length, key)| {
                let digest = format!("sha1-{}", String::from_utf8_lossy(&key));
                (filename, AttachmentMeta { content_type, digest, length: length as u64, stub: true, data: None })
            })
            .collect();

        Ok(Document {
            id: id.to_string(),
            rev: Some(rev),
            deleted,
            data,
            attachments,
            conflicts,
            revisions,
        })
    }

    async fn remove(&self, id: &str, rev: &Revision) -> Result<PutResponse> {
        self.put(Document {
            id: id.to_string(),
            rev: Some(rev.clone()),
            deleted: true,
            data: serde_json::json!({}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: Vec::new(),
        })
        .await
    }

    async fn bulk_docs(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Result<Vec<DocResult>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            if opts.new_edits {
                match self.put(doc.clone()).await {
                    Ok(r) => results.push(DocResult { ok: true, id: r.id, rev: Some(r.rev), error: None, reason: None }),
                    Err(e) => results.push(DocResult {
                        ok: false,
                        id: doc.id,
                        rev: None,
                        error: Some("conflict".into()),
                        reason: Some(e.to_string()),
                    }),
                }
            } else {
                results.push(self.force_insert(doc));
            }
        }
        Ok(results)
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        let conn = self.conn.lock().unwrap();
        let order = if opts.descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT d.docid, r.revid, r.deleted, r.json
             FROM docs d JOIN revs r ON r.sequence = d.winning_sequence
             WHERE d.winning_sequence IS NOT NULL
             ORDER BY d.docid {order}"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut matched = Vec::new();
        for row in rows {
            let (docid, revid, deleted, json_bytes) = row.map_err(db_err)?;
            if deleted {
                continue;
            }
            if let Some(key) = &opts.key {
                if &docid != key {
                    continue;
                }
            }
            if let Some(keys) = &opts.keys {
                if !keys.contains(&docid) {
                    continue;
                }
            }
            if let Some(start) = &opts.start_key {
                if &docid < start {
                    continue;
                }
            }
            if let Some(end) = &opts.end_key {
                if opts.inclusive_end {
                    if &docid > end {
                        continue;
                    }
                } else if &docid >= end {
                    continue;
                }
            }
            matched.push((docid, revid, json_bytes));
        }

        let total_rows = matched.len() as u64;
        let mut matched: Vec<_> = matched.into_iter().skip(opts.skip as usize).collect();
        if let Some(limit) = opts.limit {
            matched.truncate(limit as usize);
        }

        let rows = matched
            .into_iter()
            .map(|(docid, revid, json_bytes)| {
                let doc = if opts.include_docs {
                    let data = if json_bytes.is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_slice(&json_bytes).unwrap_or(serde_json::json!({}))
                    };
                    let full = Document {
                        id: docid.clone(),
                        rev: revid.parse().ok(),
                        deleted: false,
                        data,
                        attachments: Default::default(),
                        conflicts: Vec::new(),
                        revisions: Vec::new(),
                    };
                    Some(full.to_json())
                } else {
                    None
                };
                AllDocsRow { id: docid.clone(), key: docid, value: AllDocsRowValue { rev: revid, deleted: None }, doc }
            })
            .collect();

        Ok(AllDocsResponse { total_rows, offset: opts.skip, rows })
    }

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        let conn = self.conn.lock().unwrap();
        let since = opts.since.as_num() as i64;

        let mut stmt = conn
            .prepare("SELECT doc_id, MAX(sequence) FROM revs WHERE sequence > ?1 GROUP BY doc_id ORDER BY MAX(sequence) ASC")
            .map_err(db_err)?;
        let mut entries: Vec<(i64, i64)> = stmt
            .query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        if opts.descending {
            entries.reverse();
        }
        if let Some(limit) = opts.limit {
            entries.truncate(limit as usize);
        }

        let mut results = Vec::new();
        let mut last_seq = opts.since.clone();
        for (doc_id, seq) in entries {
            let docid: String = conn
                .query_row("SELECT docid FROM docs WHERE doc_id = ?1", params![doc_id], |row| row.get(0))
                .map_err(db_err)?;
            if let Some(doc_ids) = &opts.doc_ids {
                if !doc_ids.contains(&docid) {
                    continue;
                }
            }

            let leaves = current_leaves(&conn, doc_id).map_err(db_err)?;
            let (winner_seq, rev, deleted) = match leaves.first().cloned() {
                Some(w) => w,
                None => continue,
            };

            let json_bytes: Vec<u8> = conn
                .query_row("SELECT json FROM revs WHERE sequence = ?1", params![winner_seq], |row| row.get(0))
                .map_err(db_err)?;
            let body = if json_bytes.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_slice(&json_bytes).unwrap_or(serde_json::json!({}))
            };

            if let Some(selector) = &opts.selector {
                if !rouchdb_query::matcher::matches(selector, &body) {
                    continue;
                }
            }

            let doc = if opts.include_docs {
                let full = Document {
                    id: docid.clone(),
                    rev: Some(rev.clone()),
                    deleted,
                    data: body,
                    attachments: Default::default(),
                    conflicts: Vec::new(),
                    revisions: Vec::new(),
                };
                Some(full.to_json())
            } else {
                None
            };

            // Emit every open leaf (winner first) so replication can
            // transmit conflicting branches, not only the winning revision.
            let changes: Vec<ChangeRev> = leaves.iter().map(|(_, r, _)| ChangeRev { rev: r.to_string() }).collect();

            last_seq = Seq::Num(seq as u64);
            results.push(ChangeEvent {
                seq: Seq::Num(seq as u64),
                id: docid,
                changes,
                deleted,
                doc,
            });
        }

        Ok(ChangesResponse { results, last_seq })
    }

    async fn info(&self) -> Result<DbInfo> {
        let conn = self.conn.lock().unwrap();
        let doc_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM docs d JOIN revs r ON r.sequence = d.winning_sequence WHERE r.deleted = 0",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let update_seq: i64 = conn
            .query_row("SELECT COALESCE(MAX(sequence), 0) FROM revs", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(DbInfo { db_name: self.name.clone(), doc_count: doc_count as u64, update_seq: Seq::Num(update_seq as u64) })
    }

    async fn compact(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE revs SET json = X'' WHERE current = 0", []).map_err(db_err)?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute_batch("DELETE FROM attachments; DELETE FROM revs; DELETE FROM docs; DELETE FROM localdocs;")
                .map_err(db_err)?;
        }
        let dir = self.attachments_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.event_bus.publish(Event::Store(StoreEvent::Deleted { name: self.name.clone() }));
        Ok(())
    }

    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let json_bytes: Option<Vec<u8>> = conn
            .query_row("SELECT json FROM localdocs WHERE docid = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        match json_bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_local(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let bytes = serde_json::to_vec(&value)?;
        conn.execute(
            "INSERT INTO localdocs (docid, json) VALUES (?1, ?2)
             ON CONFLICT(docid) DO UPDATE SET json = excluded.json",
            params![id, bytes],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn revs_diff(&self, revs: HashMap<String, Vec<String>>) -> Result<RevsDiffResponse> {
        let conn = self.conn.lock().unwrap();
        let mut results = HashMap::new();
        for (id, wanted) in revs {
            let doc_id = find_doc_id(&conn, &id).map_err(db_err)?;
            let missing: Vec<String> = wanted
                .into_iter()
                .filter(|r| {
                    let doc_id = match doc_id {
                        Some(d) => d,
                        None => return true,
                    };
                    let known: Option<i64> = conn
                        .query_row(
                            "SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2",
                            params![doc_id, r],
                            |row| row.get(0),
                        )
                        .optional()
                        .unwrap_or(None);
                    known.is_none()
                })
                .collect();
            if !missing.is_empty() {
                results.insert(id, RevsDiffResult { missing, possible_ancestors: Vec::new() });
            }
        }
        Ok(RevsDiffResponse { results })
    }

    async fn bulk_get(&self, docs: Vec<(String, Vec<String>)>) -> Result<BulkGetResponse> {
        let mut results = Vec::new();
        for (id, revs) in docs {
            let revs = if revs.is_empty() {
                match self.get(&id, GetOptions::default()).await {
                    Ok(d) => vec![d.rev.unwrap().to_string()],
                    Err(_) => vec![],
                }
            } else {
                revs
            };

            let mut bulk_docs = Vec::new();
            for rev in revs {
                let opts = GetOptions {
                    rev: Some(rev.clone()),
                    open_revs: Some(OpenRevs::Specific(vec![rev.clone()])),
                    revs: true,
                    ..Default::default()
                };
                match self.get(&id, opts).await {
                    Ok(doc) => bulk_docs.push(BulkGetDoc { ok: Some(doc.to_json()), error: None }),
                    Err(e) => bulk_docs.push(BulkGetDoc {
                        ok: None,
                        error: Some(BulkGetError { id: id.clone(), rev, error: "not_found".into(), reason: e.to_string() }),
                    }),
                }
            }
            results.push(BulkGetResult { id, docs: bulk_docs });
        }
        Ok(BulkGetResponse { results })
    }

    async fn put_attachment(
        &self,
        doc_id: &str,
        filename: &str,
        rev: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<PutResponse> {
        let conn = self.conn.lock().unwrap();
        let internal_id = find_doc_id(&conn, doc_id).map_err(db_err)?.ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;
        let current: Revision = rev.parse()?;
        let (winner_seq, winner_rev, _) = current_winner(&conn, internal_id)
            .map_err(db_err)?
            .ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;
        if winner_rev != current {
            return Err(RouchError::Conflict);
        }

        let new_pos = current.pos + 1;
        let digest_meta = format!("sha1-{}", sha1_hex(&data));
        let revid = format!(
            "{}-{}",
            new_pos,
            new_hash(
                Some(&current.hash),
                false,
                std::slice::from_ref(&digest_meta),
                &serde_json::json!({ "attachment": filename }),
            )
        );

        let json_bytes: Vec<u8> = conn
            .query_row("SELECT json FROM revs WHERE sequence = ?1", params![winner_seq], |row| row.get(0))
            .map_err(db_err)?;

        conn.execute("UPDATE revs SET current = 0 WHERE sequence = ?1", params![winner_seq]).map_err(db_err)?;
        conn.execute(
            "INSERT INTO revs (doc_id, parent, revid, current, deleted, available, json)
             VALUES (?1, ?2, ?3, 1, 0, 1, ?4)",
            params![internal_id, winner_seq, revid, json_bytes],
        )
        .map_err(db_err)?;
        let new_seq = conn.last_insert_rowid();

        let digest = sha1_hex(&data);
        let dir = self.attachments_dir();
        std::fs::create_dir_all(&dir)?;
        let blob_path = dir.join(&digest);
        if !blob_path.exists() {
            std::fs::write(&blob_path, &data)?;
        }

        conn.execute(
            "INSERT INTO attachments (sequence, filename, key, type, encoding, length, encoded_length, revpos)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, ?6)",
            params![new_seq, filename, digest.as_bytes(), content_type, data.len() as i64, new_pos as i64],
        )
        .map_err(db_err)?;

        recompute_winner(&conn, internal_id)?;
        drop(conn);

        self.event_bus.publish(Event::Document(DocumentEvent::Updated {
            doc_id: doc_id.to_string(),
            rev: revid.clone(),
        }));

        Ok(PutResponse { ok: true, id: doc_id.to_string(), rev: revid })
    }

    async fn get_attachment(&self, doc_id: &str, filename: &str, opts: GetAttachmentOptions) -> Result<Vec<u8>> {
        let conn = self.conn.lock().unwrap();
        let internal_id = find_doc_id(&conn, doc_id).map_err(db_err)?.ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;

        let seq = match &opts.rev {
            Some(r) => conn
                .query_row(
                    "SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2",
                    params![internal_id, r],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(|_| RouchError::NotFound(doc_id.to_string()))?,
            None => current_winner(&conn, internal_id)
                .map_err(db_err)?
                .map(|(seq, _, _)| seq)
                .ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?,
        };

        let key: Vec<u8> = conn
            .query_row(
                "SELECT key FROM attachments WHERE sequence = ?1 AND filename = ?2",
                params![seq, filename],
                |row| row.get(0),
            )
            .map_err(|_| RouchError::AttachmentMissing { doc_id: doc_id.to_string(), filename: filename.to_string() })?;

        let digest = String::from_utf8_lossy(&key).to_string();
        std::fs::read(self.attachments_dir().join(&digest))
            .map_err(|_| RouchError::AttachmentMissing { doc_id: doc_id.to_string(), filename: filename.to_string() })
    }
}

impl SqliteAdapter {
    /// Graft the incoming revision onto the tree without generating a new
    /// revision, for replication's `new_edits: false` path. `doc.revisions`
    /// carries the full ancestor chain newest-first (as `_revisions.ids`
    /// does); any ancestor not already present is inserted as an
    /// unavailable placeholder so the tree stays linear instead of forking
    /// a disconnected sibling root when the source has more history than
    /// the local store.
    fn force_insert(&self, doc: Document) -> DocResult {
        let conn = self.conn.lock().unwrap();
        let id = doc.id.clone();
        let rev = match &doc.rev {
            Some(r) => r.clone(),
            None => {
                return DocResult {
                    ok: false,
                    id,
                    rev: None,
                    error: Some("bad_request".into()),
                    reason: Some("missing _rev for new_edits=false".into()),
                }
            }
        };

        let doc_id = match find_doc_id(&conn, &id) {
            Ok(Some(d)) => d,
            Ok(None) => {
                if conn.execute("INSERT INTO docs (docid, winning_sequence) VALUES (?1, NULL)", params![id]).is_err() {
                    return DocResult { ok: false, id, rev: None, error: Some("internal_error".into()), reason: None };
                }
                conn.last_insert_rowid()
            }
            Err(e) => return DocResult { ok: false, id, rev: None, error: Some("internal_error".into()), reason: Some(e.to_string()) },
        };

        let existing: Option<i64> = conn
            .query_row(
                "SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2",
                params![doc_id, rev.to_string()],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);
        if existing.is_some() {
            return DocResult { ok: true, id, rev: Some(rev.to_string()), error: None, reason: None };
        }

        let chain: Vec<String> = if doc.revisions.is_empty() {
            vec![rev.hash.clone()]
        } else {
            doc.revisions.clone()
        };
        let root_pos = rev.pos - (chain.len() as u64 - 1);

        let mut parent_seq: Option<i64> = None;
        let mut leaf_seq: Option<i64> = None;
        for (offset, hash) in chain.iter().rev().enumerate() {
            let pos = root_pos + offset as u64;
            let is_leaf = pos == rev.pos;
            let revid = format!("{}-{}", pos, hash);

            let found: Option<i64> = conn
                .query_row(
                    "SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2",
                    params![doc_id, revid],
                    |row| row.get(0),
                )
                .optional()
                .unwrap_or(None);

            if let Some(seq) = found {
                parent_seq = Some(seq);
                if is_leaf {
                    leaf_seq = Some(seq);
                }
                continue;
            }

            if let Some(seq) = parent_seq {
                if conn.execute("UPDATE revs SET current = 0 WHERE sequence = ?1", params![seq]).is_err() {
                    return DocResult { ok: false, id, rev: None, error: Some("internal_error".into()), reason: None };
                }
            }

            let (json_bytes, deleted, available): (Option<Vec<u8>>, bool, bool) = if is_leaf {
                (Some(serde_json::to_vec(&doc.data).unwrap_or_default()), doc.deleted, true)
            } else {
                (None, false, false)
            };

            if conn
                .execute(
                    "INSERT INTO revs (doc_id, parent, revid, current, deleted, available, json)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
                    params![doc_id, parent_seq, revid, deleted as i64, available as i64, json_bytes],
                )
                .is_err()
            {
                return DocResult { ok: false, id, rev: None, error: Some("internal_error".into()), reason: None };
            }
            let new_seq = conn.last_insert_rowid();
            parent_seq = Some(new_seq);
            if is_leaf {
                leaf_seq = Some(new_seq);
            }
        }

        if let Some(seq) = leaf_seq {
            let dir = self.attachments_dir();
            for (filename, meta) in &doc.attachments {
                let Some(data) = &meta.data else { continue };
                if std::fs::create_dir_all(&dir).is_err() {
                    continue;
                }
                let content_digest = sha1_hex(data);
                let blob_path = dir.join(&content_digest);
                if !blob_path.exists() && std::fs::write(&blob_path, data).is_err() {
                    continue;
                }
                let _ = conn.execute(
                    "INSERT OR IGNORE INTO attachments (sequence, filename, key, type, encoding, length, encoded_length, revpos)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, ?6)",
                    params![seq, filename, content_digest.as_bytes(), meta.content_type, data.len() as i64, rev.pos as i64],
                );
            }
        }

        let _ = recompute_winner(&conn, doc_id);
        drop(conn);

        let event = if doc.deleted {
            DocumentEvent::Deleted { doc_id: id.clone(), rev: rev.to_string() }
        } else {
            DocumentEvent::Updated { doc_id: id.clone(), rev: rev.to_string() }
        };
        self.event_bus.publish(Event::Document(event));

        DocResult { ok: true, id, rev: Some(rev.to_string()), error: None, reason: None }
    }
}
