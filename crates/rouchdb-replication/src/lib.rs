//! Pull/push replication between any two `Adapter`s.
//!
//! Drives the standard CouchDB replication protocol: read the source's
//! `_changes` feed since the last checkpoint, ask the target which
//! revisions it's missing via `_revs_diff`, fetch those revisions with
//! `bulk_get` (falling back to per-revision `open_revs` fetches against
//! sources that don't support `_bulk_get`), and write them to the target
//! with `new_edits: false` (`forceInsert`). Checkpoints are
//! `_local/<replication-id>` documents on the source, matching CouchDB's
//! own checkpoint placement.
//!
//! `PullReplication` and `PushReplication` are thin, direction-labelled
//! wrappers around the same engine: a pull reads changes from a remote
//! source into a local target, a push reads changes from a local source
//! into a remote target. Both expose counters and an event bus so a
//! caller can observe progress without polling the result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;

use rouchdb_changes::{Event, EventBus, ReplicationEvent};
use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{BulkDocsOptions, ChangesOptions, Document, GetOptions, OpenRevs, Seq};
use rouchdb_core::error::{Result, RouchError};

/// Replication tuning knobs, mirroring the relevant subset of CouchDB's
/// replicator options.
#[derive(Clone)]
pub struct ReplicationOptions {
    /// Max number of `_changes` rows fetched per round trip.
    pub change_limit_per_batch: u64,
    /// Max number of documents written per `_bulk_docs` call on the target.
    pub insert_batch_size: u64,
    /// Fetch attachment bytes inline with the document body on pull,
    /// instead of leaving them as stubs for a later `get_attachment`.
    pub pull_attachments_inline: bool,
    /// Keep running after catching up, picking up further writes.
    pub continuous: bool,
    /// Restrict replication to specific document ids.
    pub doc_ids: Option<Vec<String>>,
    /// Max replay attempts for a transient (e.g. HTTP 429/5xx) failure.
    pub number_of_replays: u32,
    /// Base delay before the first retry; doubles on each subsequent replay.
    pub initial_backoff: Duration,
    /// Honor a source's `Retry-After` hint over the computed backoff when
    /// both are available.
    pub prefer_retry_after: bool,
    /// Cooperative cancellation; checked between batches.
    pub cancel: Option<CancellationToken>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            change_limit_per_batch: 100,
            insert_batch_size: 100,
            pull_attachments_inline: false,
            continuous: false,
            doc_ids: None,
            number_of_replays: 5,
            initial_backoff: Duration::from_millis(250),
            prefer_retry_after: true,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for ReplicationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationOptions")
            .field("change_limit_per_batch", &self.change_limit_per_batch)
            .field("insert_batch_size", &self.insert_batch_size)
            .field("pull_attachments_inline", &self.pull_attachments_inline)
            .field("continuous", &self.continuous)
            .field("doc_ids", &self.doc_ids)
            .field("number_of_replays", &self.number_of_replays)
            .field("initial_backoff", &self.initial_backoff)
            .field("prefer_retry_after", &self.prefer_retry_after)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationResult {
    pub ok: bool,
    pub docs_read: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
    pub errors: Vec<String>,
    pub last_seq: Option<String>,
}

/// Shared counters and event bus backing a running replication, exposed so
/// a caller can poll progress without waiting for `run()` to return.
struct ReplicationHandle {
    event_bus: EventBus,
    docs_read: AtomicU64,
    docs_written: AtomicU64,
    batches: AtomicU64,
    terminated: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ReplicationHandle {
    fn new(cancel: Option<CancellationToken>) -> Self {
        Self {
            event_bus: EventBus::default(),
            docs_read: AtomicU64::new(0),
            docs_written: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            cancel: Mutex::new(cancel),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| t.is_cancelled())
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.event_bus.publish(Event::Replication(ReplicationEvent::Terminated {
            docs_read: self.docs_read.load(Ordering::SeqCst),
            docs_written: self.docs_written.load(Ordering::SeqCst),
            batches: self.batches.load(Ordering::SeqCst),
        }));
    }
}

/// A running (or finished) pull replication: reads `_changes` from
/// `source` (typically remote) and writes into `target` (typically
/// local).
pub struct PullReplication<'a> {
    source: &'a dyn Adapter,
    target: &'a dyn Adapter,
    opts: ReplicationOptions,
    handle: ReplicationHandle,
}

impl<'a> PullReplication<'a> {
    pub fn new(source: &'a dyn Adapter, target: &'a dyn Adapter, opts: ReplicationOptions) -> Self {
        let handle = ReplicationHandle::new(opts.cancel.clone());
        Self { source, target, opts, handle }
    }

    /// Replace the cancellation token after construction.
    pub fn set_cancel(&mut self, cancel: CancellationToken) {
        *self.handle.cancel.lock().unwrap() = Some(cancel);
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.handle.event_bus
    }

    pub fn document_counter(&self) -> u64 {
        self.handle.docs_written.load(Ordering::SeqCst)
    }

    pub fn batch_counter(&self) -> u64 {
        self.handle.batches.load(Ordering::SeqCst)
    }

    pub fn is_replication_terminated(&self) -> bool {
        self.handle.terminated.load(Ordering::SeqCst)
    }

    pub async fn run(&self) -> Result<ReplicationResult> {
        run_core(self.source, self.target, &self.opts, &self.handle).await
    }
}

/// A running (or finished) push replication: reads `_changes` from
/// `source` (typically local) and writes into `target` (typically
/// remote). Identical engine to `PullReplication`, just named for the
/// direction it's used in.
pub struct PushReplication<'a> {
    source: &'a dyn Adapter,
    target: &'a dyn Adapter,
    opts: ReplicationOptions,
    handle: ReplicationHandle,
}

impl<'a> PushReplication<'a> {
    pub fn new(source: &'a dyn Adapter, target: &'a dyn Adapter, opts: ReplicationOptions) -> Self {
        let handle = ReplicationHandle::new(opts.cancel.clone());
        Self { source, target, opts, handle }
    }

    pub fn set_cancel(&mut self, cancel: CancellationToken) {
        *self.handle.cancel.lock().unwrap() = Some(cancel);
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.handle.event_bus
    }

    pub fn document_counter(&self) -> u64 {
        self.handle.docs_written.load(Ordering::SeqCst)
    }

    pub fn batch_counter(&self) -> u64 {
        self.handle.batches.load(Ordering::SeqCst)
    }

    pub fn is_replication_terminated(&self) -> bool {
        self.handle.terminated.load(Ordering::SeqCst)
    }

    pub async fn run(&self) -> Result<ReplicationResult> {
        run_core(self.source, self.target, &self.opts, &self.handle).await
    }
}

/// Replicate from `source` to `target`, one direction. A thin convenience
/// wrapper over `PullReplication`/`PushReplication` for callers that don't
/// need progress counters or an event bus.
pub async fn replicate(
    source: &dyn Adapter,
    target: &dyn Adapter,
    opts: ReplicationOptions,
) -> Result<ReplicationResult> {
    let handle = ReplicationHandle::new(opts.cancel.clone());
    run_core(source, target, &opts, &handle).await
}

async fn run_core(
    source: &dyn Adapter,
    target: &dyn Adapter,
    opts: &ReplicationOptions,
    handle: &ReplicationHandle,
) -> Result<ReplicationResult> {
    let repl_id = compute_replication_id(source, target, opts).await?;
    let checkpoint = with_retry(opts, || source.get_local(&repl_id)).await?;
    let mut since = checkpoint
        .as_ref()
        .and_then(|v| v.get("last_seq"))
        .and_then(|v| v.as_str())
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Seq::Num(n),
            Err(_) => Seq::Str(s.to_string()),
        })
        .unwrap_or_else(Seq::zero);

    let mut errors = Vec::new();
    let mut doc_write_failures = 0u64;
    // Whether `source.bulk_get` works at all; detected once on first use
    // and remembered for the rest of this run so a source that doesn't
    // implement `_bulk_get` isn't retried against it every batch.
    let mut bulk_get_supported: Option<bool> = None;

    loop {
        if handle.is_cancelled() {
            handle.terminate();
            return Err(RouchError::ReplicationCancelled);
        }

        let changes_opts = ChangesOptions {
            since: since.clone(),
            limit: Some(opts.change_limit_per_batch),
            include_docs: false,
            doc_ids: opts.doc_ids.clone(),
            ..Default::default()
        };
        let changes = with_retry(opts, || source.changes(changes_opts.clone())).await?;
        handle.batches.fetch_add(1, Ordering::SeqCst);

        if changes.results.is_empty() {
            break;
        }

        let mut revs: HashMap<String, Vec<String>> = HashMap::new();
        for event in &changes.results {
            revs.insert(
                event.id.clone(),
                event.changes.iter().map(|c| c.rev.clone()).collect(),
            );
        }

        let diff = with_retry(opts, || target.revs_diff(revs.clone())).await?;

        if !diff.results.is_empty() {
            let to_fetch: Vec<(String, Vec<String>)> = diff
                .results
                .iter()
                .map(|(id, r)| (id.clone(), r.missing.clone()))
                .collect();

            let fetched = fetch_docs(source, to_fetch, opts, &mut bulk_get_supported, &mut errors).await?;
            handle.docs_read.fetch_add(fetched.len() as u64, Ordering::SeqCst);

            for chunk in fetched.chunks(opts.insert_batch_size.max(1) as usize) {
                let results = with_retry(opts, || {
                    target.bulk_docs(chunk.to_vec(), BulkDocsOptions::replication())
                })
                .await?;
                for r in results {
                    if r.ok {
                        handle.docs_written.fetch_add(1, Ordering::SeqCst);
                    } else {
                        doc_write_failures += 1;
                        if let Some(reason) = r.reason {
                            errors.push(reason);
                        }
                    }
                }
            }
        }

        since = changes.last_seq.clone();
        if (changes.results.len() as u64) < opts.change_limit_per_batch {
            break;
        }
    }

    with_retry(opts, || {
        source.put_local(
            &repl_id,
            serde_json::json!({
                "replication_id": repl_id,
                "last_seq": since.to_query_string(),
            }),
        )
    })
    .await?;

    let docs_written = handle.docs_written.load(Ordering::SeqCst);

    Ok(ReplicationResult {
        ok: errors.is_empty(),
        docs_read: handle.docs_read.load(Ordering::SeqCst),
        docs_written,
        doc_write_failures,
        last_seq: Some(since.to_string()),
        errors,
    })
}

/// Fetch the requested `(id, [rev])` pairs from `source`. Tries
/// `bulk_get` first; if it fails and capability hasn't already been
/// decided this run, falls back to one `get` call per `(id, rev)` with
/// `open_revs` set, the way a source without `_bulk_get` support still
/// answers single-revision reads.
async fn fetch_docs(
    source: &dyn Adapter,
    to_fetch: Vec<(String, Vec<String>)>,
    opts: &ReplicationOptions,
    bulk_get_supported: &mut Option<bool>,
    errors: &mut Vec<String>,
) -> Result<Vec<Document>> {
    if *bulk_get_supported != Some(false) {
        match with_retry(opts, || source.bulk_get(to_fetch.clone())).await {
            Ok(bulk) => {
                *bulk_get_supported = Some(true);
                let mut docs = Vec::new();
                for result in bulk.results {
                    for item in result.docs {
                        match item.ok {
                            Some(body) => match Document::from_json(body) {
                                Ok(doc) => docs.push(doc),
                                Err(e) => errors.push(e.to_string()),
                            },
                            None => {
                                if let Some(e) = item.error {
                                    errors.push(format!("{}: {}", e.id, e.reason));
                                }
                            }
                        }
                    }
                }
                return Ok(docs);
            }
            Err(e) if bulk_get_supported.is_none() => {
                *bulk_get_supported = Some(false);
                tracing::warn!(error = %e, "source does not support bulk_get, falling back to open_revs fetches");
            }
            Err(e) => return Err(e),
        }
    }

    let mut docs = Vec::new();
    for (id, revs) in to_fetch {
        for rev in revs {
            let get_opts = GetOptions {
                rev: Some(rev.clone()),
                open_revs: Some(OpenRevs::Specific(vec![rev.clone()])),
                revs: true,
                ..Default::default()
            };
            match with_retry(opts, || source.get(&id, get_opts.clone())).await {
                Ok(doc) => docs.push(doc),
                Err(e) => errors.push(format!("{}@{}: {}", id, rev, e)),
            }
        }
    }
    Ok(docs)
}

/// Run a closure with exponential backoff while it returns
/// `RouchError::Transient`, matching CouchDB's 429-backoff convention.
/// Honors a `Retry-After` hint over the computed delay when
/// `opts.prefer_retry_after` is set and the hint is present.
async fn with_retry<T, F, Fut>(opts: &ReplicationOptions, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(RouchError::Transient { message, retry_after_secs }) if attempt < opts.number_of_replays => {
                attempt += 1;
                let backoff = match (opts.prefer_retry_after, retry_after_secs) {
                    (true, Some(secs)) => Duration::from_secs(secs),
                    _ => opts.initial_backoff * 2u32.pow(attempt.min(6)),
                };
                tracing::warn!(attempt, %message, ?backoff, "transient replication error, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Deterministic id for a (source, target, doc_ids) triple, used as the
/// checkpoint document id: `hex(SHA1(canonical_json({source, target,
/// doc_ids?})))`, matching CouchDB's own replication-id derivation.
///
/// `Adapter` exposes no stable endpoint identity beyond `info().db_name`
/// (no URL, no path), so `db_name` stands in for `source`/`target` here;
/// two distinct same-named local databases would collide. Filter and
/// selector replication aren't modeled by `ReplicationOptions` yet, so
/// they're omitted from the digest rather than faked.
async fn compute_replication_id(
    source: &dyn Adapter,
    target: &dyn Adapter,
    opts: &ReplicationOptions,
) -> Result<String> {
    let source_info = source.info().await?;
    let target_info = target.info().await?;
    let mut payload = serde_json::json!({
        "source": source_info.db_name,
        "target": target_info.db_name,
    });
    if let Some(doc_ids) = &opts.doc_ids {
        payload["doc_ids"] = serde_json::json!(doc_ids);
    }
    let canonical = serde_json::to_string(&payload)?;
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
