//! Ephemeral, in-process `Adapter` backed by a `HashMap`.
//!
//! Every write goes through the same revision-tree merge algorithm a
//! persistent adapter would use (`rouchdb_core::merge`), so behavior such as
//! conflict detection and winner selection is identical across adapters —
//! only durability differs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use rouchdb_changes::{DocumentEvent, Event, EventBus, StoreEvent};
use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, AttachmentMeta, BulkDocsOptions,
    BulkGetDoc, BulkGetError, BulkGetResponse, BulkGetResult, ChangeEvent, ChangeRev,
    ChangesOptions, ChangesResponse, DbInfo, DocResult, Document, GetAttachmentOptions,
    GetOptions, OpenRevs, PutResponse, Revision, RevsDiffResponse, RevsDiffResult, Seq,
};
use rouchdb_core::error::{Result, RouchError};
use rouchdb_core::merge;
use rouchdb_core::rev_tree::{self, NodeOpts, RevStatus, RevTree};

const DEFAULT_REVS_LIMIT: u64 = 1000;

fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Clone)]
struct AttachmentRecord {
    content_type: String,
    data: Vec<u8>,
}

struct StoredDoc {
    rev_tree: RevTree,
    bodies: HashMap<String, serde_json::Value>,
    attachments: HashMap<String, HashMap<String, AttachmentRecord>>,
}

impl StoredDoc {
    fn new() -> Self {
        Self {
            rev_tree: Vec::new(),
            bodies: HashMap::new(),
            attachments: HashMap::new(),
        }
    }
}

struct Inner {
    name: String,
    docs: HashMap<String, StoredDoc>,
    locals: HashMap<String, serde_json::Value>,
    seq_counter: u64,
    by_seq: BTreeMap<u64, String>,
}

/// An in-memory, `Send + Sync` database. Construct one per logical store;
/// cloning is cheap (shared `Arc`-free `Mutex` interior via `std::sync::Arc`
/// at the call site if multiple handles are needed).
pub struct MemoryAdapter {
    inner: Mutex<Inner>,
    event_bus: EventBus,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let event_bus = EventBus::default();
        event_bus.publish(Event::Store(StoreEvent::Opened { name: name.clone() }));
        Self {
            inner: Mutex::new(Inner {
                name,
                docs: HashMap::new(),
                locals: HashMap::new(),
                seq_counter: 0,
                by_seq: BTreeMap::new(),
            }),
            event_bus,
        }
    }

    /// The bus this store publishes document and lifecycle events to.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Deterministic revision hash: MD5 of the parent rev id (if any), the
    /// deleted flag, the sorted attachment digests, and the body. No
    /// randomness — replaying the same write (e.g. a replayed `forceInsert`)
    /// must produce byte-identical hashes so idempotent pulls converge.
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
}

fn sorted_attachment_digests(attachments: &HashMap<String, AttachmentMeta>) -> Vec<String> {
    let mut digests: Vec<String> = attachments.values().map(|a| a.digest.clone()).collect();
    digests.sort();
    digests
}

fn winner_revision(tree: &RevTree) -> Option<(Revision, bool)> {
    let leaves = rev_tree::collect_leaves(tree);
    leaves.first().map(|l| (Revision::new(l.pos, l.hash.clone()), l.deleted))
}

fn conflict_revisions(tree: &RevTree) -> Vec<Revision> {
    rev_tree::collect_leaves(tree)
        .into_iter()
        .skip(1)
        .filter(|l| !l.deleted)
        .map(|l| Revision::new(l.pos, l.hash))
        .collect()
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn put(&self, doc: Document) -> Result<PutResponse> {
        let mut inner = self.inner.lock().unwrap();
        let id = if doc.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            doc.id.clone()
        };

        let existing = inner.docs.entry(id.clone()).or_insert_with(StoredDoc::new);
        let leaves = rev_tree::collect_leaves(&existing.rev_tree);
        let winner = leaves.first().cloned();
        let target = match &doc.rev {
            Some(rev) => leaves.iter().find(|l| l.pos == rev.pos && l.hash == rev.hash),
            None => None,
        };

        match (&doc.rev, &winner) {
            (None, Some(w)) if !w.deleted => return Err(RouchError::Conflict),
            (Some(_), Some(_)) if target.is_none() => return Err(RouchError::Conflict),
            (Some(_), None) => return Err(RouchError::Conflict),
            _ => {}
        }

        let parent = target.or(winner.as_ref().filter(|w| w.deleted));
        let new_pos = parent.map(|p| p.pos + 1).unwrap_or(1);
        let attachment_digests = sorted_attachment_digests(&doc.attachments);
        let parent_hash = parent.map(|p| p.hash.as_str());
        let new_hash = Self::new_hash(parent_hash, doc.deleted, &attachment_digests, &doc.data);

        let hashes: Vec<String> = if let Some(p) = parent {
            vec![new_hash.clone(), p.hash.clone()]
        } else {
            vec![new_hash.clone()]
        };

        let opts = NodeOpts { deleted: doc.deleted };
        let new_path = rev_tree::build_path_from_revs(new_pos, &hashes, opts, RevStatus::Available);
        let (merged, _result) = merge::merge_tree(&existing.rev_tree, &new_path, DEFAULT_REVS_LIMIT);
        existing.rev_tree = merged;
        existing.bodies.insert(format!("{}-{}", new_pos, new_hash), doc.data.clone());

        inner.seq_counter += 1;
        let seq = inner.seq_counter;
        inner.by_seq.insert(seq, id.clone());
        drop(inner);

        let event = if doc.deleted {
            DocumentEvent::Deleted { doc_id: id.clone(), rev: format!("{}-{}", new_pos, new_hash) }
        } else if new_pos == 1 {
            DocumentEvent::Created { doc_id: id.clone(), rev: format!("{}-{}", new_pos, new_hash) }
        } else {
            DocumentEvent::Updated { doc_id: id.clone(), rev: format!("{}-{}", new_pos, new_hash) }
        };
        self.event_bus.publish(Event::Document(event));

        Ok(PutResponse {
            ok: true,
            id,
            rev: format!("{}-{}", new_pos, new_hash),
        })
    }

    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let inner = self.inner.lock().unwrap();
        let stored = inner
            .docs
            .get(id)
            .ok_or_else(|| RouchError::NotFound(id.to_string()))?;

        if stored.rev_tree.is_empty() {
            return Err(RouchError::NotFound(id.to_string()));
        }

        let (rev, deleted) = match &opts.rev {
            Some(r) => {
                let rev: Revision = r.parse()?;
                let leaves = rev_tree::collect_leaves(&stored.rev_tree);
                let deleted = leaves
                    .iter()
                    .find(|l| l.pos == rev.pos && l.hash == rev.hash)
                    .map(|l| l.deleted)
                    .unwrap_or(false);
                (rev, deleted)
            }
            None => winner_revision(&stored.rev_tree).ok_or_else(|| RouchError::NotFound(id.to_string()))?,
        };

        if deleted && opts.rev.is_none() {
            return Err(RouchError::NotFound(format!("{} deleted", id)));
        }

        let key = format!("{}-{}", rev.pos, rev.hash);
        let data = stored
            .bodies
            .get(&key)
            .cloned()
            .unwrap_or(serde_json::json!({}));

        let conflicts = if opts.conflicts {
            conflict_revisions(&stored.rev_tree)
        } else {
            Vec::new()
        };

        let revisions = if opts.revs {
            rev_tree::ancestor_chain(&stored.rev_tree, rev.pos, &rev.hash)
        } else {
            Vec::new()
        };

        let attachments = stored
            .attachments
            .get(&key)
            .map(|m| {
                m.iter()
                    .map(|(name, rec)| {
                        (
                            name.clone(),
                            AttachmentMeta {
                                content_type: rec.content_type.clone(),
                                digest: format!("sha1-{}", sha1_hex(&rec.data)),
                                length: rec.data.len() as u64,
                                stub: true,
                                data: None,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

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
                    Ok(r) => results.push(DocResult {
                        ok: true,
                        id: r.id,
                        rev: Some(r.rev),
                        error: None,
                        reason: None,
                    }),
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
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<&String> = inner
            .docs
            .iter()
            .filter(|(_, d)| !d.rev_tree.is_empty())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        if opts.descending {
            ids.reverse();
        }

        let mut rows = Vec::new();
        for id in ids {
            if let Some(key) = &opts.key {
                if id != key {
                    continue;
                }
            }
            if let Some(keys) = &opts.keys {
                if !keys.contains(id) {
                    continue;
                }
            }
            if let Some(start) = &opts.start_key {
                if id < start {
                    continue;
                }
            }
            if let Some(end) = &opts.end_key {
                if opts.inclusive_end {
                    if id > end {
                        continue;
                    }
                } else if id >= end {
                    continue;
                }
            }

            let stored = &inner.docs[id];
            let (rev, deleted) = match winner_revision(&stored.rev_tree) {
                Some(v) => v,
                None => continue,
            };
            if deleted {
                continue;
            }

            let doc = if opts.include_docs {
                let key = format!("{}-{}", rev.pos, rev.hash);
                let body = stored.bodies.get(&key).cloned().unwrap_or(serde_json::json!({}));
                let full = Document {
                    id: id.clone(),
                    rev: Some(rev.clone()),
                    deleted: false,
                    data: body,
                    attachments: Default::default(),
                    conflicts: Vec::new(),
                    revisions: Vec::new(),
                };
                Some(full.to_json())
            } else {
                None
            };

            rows.push(AllDocsRow {
                id: id.clone(),
                key: id.clone(),
                value: AllDocsRowValue {
                    rev: rev.to_string(),
                    deleted: None,
                },
                doc,
            });
        }

        let total_rows = rows.len() as u64;
        let skip = opts.skip as usize;
        let rows: Vec<AllDocsRow> = rows.into_iter().skip(skip).collect();
        let rows = if let Some(limit) = opts.limit {
            rows.into_iter().take(limit as usize).collect()
        } else {
            rows
        };

        Ok(AllDocsResponse {
            total_rows,
            offset: opts.skip,
            rows,
        })
    }

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        let inner = self.inner.lock().unwrap();
        let since = opts.since.as_num();

        let mut latest: HashMap<String, u64> = HashMap::new();
        for (seq, id) in inner.by_seq.range((since + 1)..) {
            latest.insert(id.clone(), *seq);
        }
        let mut entries: Vec<(u64, String)> = latest.into_iter().map(|(id, seq)| (seq, id)).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        if opts.descending {
            entries.reverse();
        }
        if let Some(limit) = opts.limit {
            entries.truncate(limit as usize);
        }

        let mut results = Vec::new();
        let mut last_seq = opts.since.clone();
        for (seq, id) in entries {
            if let Some(doc_ids) = &opts.doc_ids {
                if !doc_ids.contains(&id) {
                    continue;
                }
            }
            let stored = match inner.docs.get(&id) {
                Some(s) => s,
                None => continue,
            };
            let leaves = rev_tree::collect_leaves(&stored.rev_tree);
            let winner = match leaves.first() {
                Some(w) => w.clone(),
                None => continue,
            };

            if let Some(selector) = &opts.selector {
                let key = format!("{}-{}", winner.pos, winner.hash);
                let body = stored.bodies.get(&key).cloned().unwrap_or(serde_json::json!({}));
                if !rouchdb_mango_matches(selector, &body) {
                    continue;
                }
            }

            let doc = if opts.include_docs {
                let key = format!("{}-{}", winner.pos, winner.hash);
                let body = stored.bodies.get(&key).cloned().unwrap_or(serde_json::json!({}));
                let d = Document {
                    id: id.clone(),
                    rev: Some(Revision::new(winner.pos, winner.hash.clone())),
                    deleted: winner.deleted,
                    data: body,
                    attachments: Default::default(),
                    conflicts: Vec::new(),
                    revisions: Vec::new(),
                };
                Some(d.to_json())
            } else {
                None
            };

            // Emit every open leaf (winner first) so replication can transmit
            // conflicting branches, not only the winning revision.
            let changes: Vec<ChangeRev> = leaves
                .iter()
                .map(|l| ChangeRev { rev: format!("{}-{}", l.pos, l.hash) })
                .collect();

            last_seq = Seq::Num(seq);
            results.push(ChangeEvent {
                seq: Seq::Num(seq),
                id,
                changes,
                deleted: winner.deleted,
                doc,
            });
        }

        Ok(ChangesResponse { results, last_seq })
    }

    async fn info(&self) -> Result<DbInfo> {
        let inner = self.inner.lock().unwrap();
        let doc_count = inner
            .docs
            .values()
            .filter(|d| winner_revision(&d.rev_tree).map(|(_, del)| !del).unwrap_or(false))
            .count() as u64;
        Ok(DbInfo {
            db_name: inner.name.clone(),
            doc_count,
            update_seq: Seq::Num(inner.seq_counter),
        })
    }

    /// Blank the body of every non-leaf revision while leaving the tree
    /// structure (and every current leaf, including conflicts) intact. This
    /// is CouchDB's compaction contract, distinct from `revs_limit`
    /// ancestor stemming, which can delete whole branches.
    async fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for stored in inner.docs.values_mut() {
            let keep: HashSet<String> = rev_tree::collect_leaves(&stored.rev_tree)
                .into_iter()
                .map(|l| format!("{}-{}", l.pos, l.hash))
                .collect();
            stored.bodies.retain(|key, _| keep.contains(key));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let name = inner.name.clone();
        inner.docs.clear();
        inner.locals.clear();
        inner.by_seq.clear();
        inner.seq_counter = 0;
        drop(inner);
        self.event_bus.publish(Event::Store(StoreEvent::Deleted { name }));
        Ok(())
    }

    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.locals.get(id).cloned())
    }

    async fn put_local(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.locals.insert(id.to_string(), value);
        Ok(())
    }

    async fn revs_diff(
        &self,
        revs: HashMap<String, Vec<String>>,
    ) -> Result<RevsDiffResponse> {
        let inner = self.inner.lock().unwrap();
        let mut results = HashMap::new();
        for (id, wanted) in revs {
            let known = inner
                .docs
                .get(&id)
                .map(|d| rev_tree::all_revisions(&d.rev_tree))
                .unwrap_or_default();

            let missing: Vec<String> = wanted
                .into_iter()
                .filter(|r| {
                    let rev: std::result::Result<Revision, _> = r.parse();
                    match rev {
                        Ok(rev) => !known.get(&rev.pos).map(|hs| hs.contains(&rev.hash)).unwrap_or(false),
                        Err(_) => true,
                    }
                })
                .collect();

            if !missing.is_empty() {
                results.insert(
                    id,
                    RevsDiffResult {
                        missing,
                        possible_ancestors: Vec::new(),
                    },
                );
            }
        }
        Ok(RevsDiffResponse { results })
    }

    async fn bulk_get(&self, docs: Vec<(String, Vec<String>)>) -> Result<BulkGetResponse> {
        let mut results = Vec::new();
        for (id, revs) in docs {
            let revs = if revs.is_empty() {
                let got = self.get(&id, GetOptions::default()).await;
                match got {
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
                    Ok(doc) => bulk_docs.push(BulkGetDoc {
                        ok: Some(doc.to_json()),
                        error: None,
                    }),
                    Err(e) => bulk_docs.push(BulkGetDoc {
                        ok: None,
                        error: Some(BulkGetError {
                            id: id.clone(),
                            rev,
                            error: "not_found".into(),
                            reason: e.to_string(),
                        }),
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
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;
        let current: Revision = rev.parse()?;
        let (winner, _) = winner_revision(&stored.rev_tree).ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;
        if winner != current {
            return Err(RouchError::Conflict);
        }

        let new_pos = current.pos + 1;
        let digest = format!("sha1-{}", sha1_hex(&data));
        let new_hash = MemoryAdapter::new_hash(
            Some(&current.hash),
            false,
            std::slice::from_ref(&digest),
            &serde_json::json!({ "attachment": filename }),
        );
        let hashes = vec![new_hash.clone(), current.hash.clone()];
        let new_path = rev_tree::build_path_from_revs(new_pos, &hashes, NodeOpts::default(), RevStatus::Available);
        let (merged, _) = merge::merge_tree(&stored.rev_tree, &new_path, DEFAULT_REVS_LIMIT);
        let body = stored
            .bodies
            .get(&format!("{}-{}", current.pos, current.hash))
            .cloned()
            .unwrap_or(serde_json::json!({}));
        stored.rev_tree = merged;
        stored.bodies.insert(format!("{}-{}", new_pos, new_hash), body);
        stored
            .attachments
            .entry(format!("{}-{}", new_pos, new_hash))
            .or_default()
            .insert(
                filename.to_string(),
                AttachmentRecord {
                    content_type: content_type.to_string(),
                    data,
                },
            );

        inner.seq_counter += 1;
        let seq = inner.seq_counter;
        inner.by_seq.insert(seq, doc_id.to_string());
        drop(inner);

        self.event_bus.publish(Event::Document(DocumentEvent::Updated {
            doc_id: doc_id.to_string(),
            rev: format!("{}-{}", new_pos, new_hash),
        }));

        Ok(PutResponse {
            ok: true,
            id: doc_id.to_string(),
            rev: format!("{}-{}", new_pos, new_hash),
        })
    }

    async fn get_attachment(
        &self,
        doc_id: &str,
        filename: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let stored = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;

        let key = match &opts.rev {
            Some(r) => r.clone(),
            None => {
                let (rev, _) = winner_revision(&stored.rev_tree)
                    .ok_or_else(|| RouchError::NotFound(doc_id.to_string()))?;
                rev.to_string()
            }
        };

        stored
            .attachments
            .get(&key)
            .and_then(|m| m.get(filename))
            .map(|a| a.data.clone())
            .ok_or_else(|| RouchError::AttachmentMissing {
                doc_id: doc_id.to_string(),
                filename: filename.to_string(),
            })
    }
}

impl MemoryAdapter {
    fn force_insert(&self, doc: Document) -> DocResult {
        let mut inner = self.inner.lock().unwrap();
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

        let stored = inner.docs.entry(id.clone()).or_insert_with(StoredDoc::new);

        // Graft the incoming chain at its deepest known ancestor instead of
        // a disconnected single-node branch, when the source supplied one.
        let hashes = if doc.revisions.is_empty() {
            vec![rev.hash.clone()]
        } else {
            doc.revisions.clone()
        };
        let opts = NodeOpts { deleted: doc.deleted };
        let new_path = rev_tree::build_path_from_revs(rev.pos, &hashes, opts, RevStatus::Available);
        let (merged, _) = merge::merge_tree(&stored.rev_tree, &new_path, DEFAULT_REVS_LIMIT);
        stored.rev_tree = merged;
        let key = format!("{}-{}", rev.pos, rev.hash);
        stored.bodies.insert(key.clone(), doc.data);

        for (filename, meta) in &doc.attachments {
            if let Some(data) = &meta.data {
                stored.attachments.entry(key.clone()).or_default().insert(
                    filename.clone(),
                    AttachmentRecord {
                        content_type: meta.content_type.clone(),
                        data: data.clone(),
                    },
                );
            }
        }

        inner.seq_counter += 1;
        let seq = inner.seq_counter;
        inner.by_seq.insert(seq, id.clone());
        drop(inner);

        let event = if doc.deleted {
            DocumentEvent::Deleted { doc_id: id.clone(), rev: rev.to_string() }
        } else if rev.pos == 1 {
            DocumentEvent::Created { doc_id: id.clone(), rev: rev.to_string() }
        } else {
            DocumentEvent::Updated { doc_id: id.clone(), rev: rev.to_string() }
        };
        self.event_bus.publish(Event::Document(event));

        DocResult {
            ok: true,
            id,
            rev: Some(rev.to_string()),
            error: None,
            reason: None,
        }
    }
}

/// Minimal Mango-selector evaluator used to filter the changes feed without
/// depending on `rouchdb-query` (which itself depends on `rouchdb-core` and
/// would create a cycle with the adapter crates). Supports the small subset
/// of operators `rouchdb-query`'s post-hoc matcher also implements; the full
/// matcher lives there and adapters that need full selector power run it
/// upstream of `changes()`.
fn rouchdb_mango_matches(selector: &serde_json::Value, doc: &serde_json::Value) -> bool {
    let obj = match selector.as_object() {
        Some(o) => o,
        None => return true,
    };
    for (field, cond) in obj {
        let value = doc.get(field).cloned().unwrap_or(serde_json::Value::Null);
        if let Some(cond_obj) = cond.as_object() {
            for (op, expected) in cond_obj {
                let ok = match op.as_str() {
                    "$eq" => &value == expected,
                    "$ne" => &value != expected,
                    "$gt" => compare(&value, expected) == std::cmp::Ordering::Greater,
                    "$gte" => compare(&value, expected) != std::cmp::Ordering::Less,
                    "$lt" => compare(&value, expected) == std::cmp::Ordering::Less,
                    "$lte" => compare(&value, expected) != std::cmp::Ordering::Greater,
                    "$exists" => value.is_null() != expected.as_bool().unwrap_or(true),
                    _ => true,
                };
                if !ok {
                    return false;
                }
            }
        } else if &value != cond {
            return false;
        }
    }
    true
}

fn compare(a: &serde_json::Value, b: &serde_json::Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let db = MemoryAdapter::new("test");
        let doc = Document::from_json(serde_json::json!({"_id": "a", "name": "alice"})).unwrap();
        let r = db.put(doc).await.unwrap();
        assert_eq!(r.id, "a");

        let got = db.get("a", GetOptions::default()).await.unwrap();
        assert_eq!(got.data["name"], "alice");
    }

    #[tokio::test]
    async fn update_requires_matching_rev() {
        let db = MemoryAdapter::new("test");
        let doc = Document::from_json(serde_json::json!({"_id": "a", "v": 1})).unwrap();
        db.put(doc).await.unwrap();

        let stale = Document {
            id: "a".into(),
            rev: Some(Revision::new(1, "bogus".into())),
            deleted: false,
            data: serde_json::json!({"v": 2}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: Vec::new(),
        };
        assert!(matches!(db.put(stale).await, Err(RouchError::Conflict)));
    }

    #[tokio::test]
    async fn delete_then_get_not_found() {
        let db = MemoryAdapter::new("test");
        let doc = Document::from_json(serde_json::json!({"_id": "a"})).unwrap();
        let r = db.put(doc).await.unwrap();
        let rev: Revision = r.rev.parse().unwrap();
        db.remove("a", &rev).await.unwrap();

        assert!(db.get("a", GetOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn changes_since_reflects_latest_write_only() {
        let db = MemoryAdapter::new("test");
        let doc = Document::from_json(serde_json::json!({"_id": "a", "v": 1})).unwrap();
        let r1 = db.put(doc).await.unwrap();
        let rev: Revision = r1.rev.parse().unwrap();
        db.put(Document {
            id: "a".into(),
            rev: Some(rev),
            deleted: false,
            data: serde_json::json!({"v": 2}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: Vec::new(),
        })
        .await
        .unwrap();

        let changes = db.changes(ChangesOptions::default()).await.unwrap();
        assert_eq!(changes.results.len(), 1);
        assert_eq!(changes.results[0].id, "a");
    }

    #[tokio::test]
    async fn all_docs_skips_deleted() {
        let db = MemoryAdapter::new("test");
        db.put(Document::from_json(serde_json::json!({"_id": "a"})).unwrap())
            .await
            .unwrap();
        let r = db
            .put(Document::from_json(serde_json::json!({"_id": "b"})).unwrap())
            .await
            .unwrap();
        let rev: Revision = r.rev.parse().unwrap();
        db.remove("b", &rev).await.unwrap();

        let all = db.all_docs(AllDocsOptions::new()).await.unwrap();
        assert_eq!(all.rows.len(), 1);
        assert_eq!(all.rows[0].id, "a");
    }

    #[tokio::test]
    async fn hash_is_deterministic_across_replays() {
        let db1 = MemoryAdapter::new("test1");
        let db2 = MemoryAdapter::new("test2");
        let doc = Document::from_json(serde_json::json!({"_id": "a", "v": 1})).unwrap();
        let r1 = db1.put(doc.clone()).await.unwrap();
        let r2 = db2.put(doc).await.unwrap();
        assert_eq!(r1.rev, r2.rev);
    }

    #[tokio::test]
    async fn conflicting_leaves_both_survive_and_resolve() {
        let db = MemoryAdapter::new("test");
        let r = db
            .put(Document::from_json(serde_json::json!({"_id": "a", "v": 0})).unwrap())
            .await
            .unwrap();
        let parent: Revision = r.rev.parse().unwrap();

        // Two independent children of the same parent: a genuine conflict.
        db.force_insert(Document {
            id: "a".into(),
            rev: Some(Revision::new(2, "left".into())),
            deleted: false,
            data: serde_json::json!({"v": "left"}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: vec!["left".into(), parent.hash.clone()],
        });
        db.force_insert(Document {
            id: "a".into(),
            rev: Some(Revision::new(2, "right".into())),
            deleted: false,
            data: serde_json::json!({"v": "right"}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: vec!["right".into(), parent.hash],
        });

        let conflicted = db.get_conflicted_ids().await.unwrap();
        assert_eq!(conflicted, vec!["a".to_string()]);

        let changes = db.changes(ChangesOptions::default()).await.unwrap();
        assert_eq!(changes.results[0].changes.len(), 2);

        let winner = db.get("a", GetOptions::default()).await.unwrap();
        let kept = winner.rev.clone().unwrap();
        db.resolve_conflicts("a", &kept).await.unwrap();
        assert!(db.get_conflicted_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_insert_grafts_ancestor_chain() {
        let db = MemoryAdapter::new("test");
        db.force_insert(Document {
            id: "a".into(),
            rev: Some(Revision::new(3, "c".into())),
            deleted: false,
            data: serde_json::json!({"v": 3}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: vec!["c".into(), "b".into(), "a".into()],
        });

        let doc = db
            .get("a", GetOptions { revs: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(doc.revisions, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn compact_preserves_conflict_leaves() {
        let db = MemoryAdapter::new("test");
        let r = db
            .put(Document::from_json(serde_json::json!({"_id": "a"})).unwrap())
            .await
            .unwrap();
        let parent: Revision = r.rev.parse().unwrap();
        db.force_insert(Document {
            id: "a".into(),
            rev: Some(Revision::new(2, "conflict".into())),
            deleted: false,
            data: serde_json::json!({"v": "conflict"}),
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: vec!["conflict".into(), parent.hash],
        });

        db.compact().await.unwrap();

        let all = db.all_docs(AllDocsOptions::new()).await.unwrap();
        assert_eq!(all.rows.len(), 1);
        let conflicted = db.get_conflicted_ids().await.unwrap();
        assert_eq!(conflicted, vec!["a".to_string()]);
    }
}
