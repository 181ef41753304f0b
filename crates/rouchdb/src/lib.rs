//! `Database`: the batteries-included facade over RouchDB's storage
//! adapters, changes feed, replication protocol, and Mango query engine.
//!
//! Construct one with [`Database::memory`], [`Database::open`] (persistent
//! SQLite storage), or [`Database::http`] (a remote CouchDB-compatible
//! server), then use the same CRUD/replication/query API regardless of
//! which backend is underneath.

use std::path::Path;
use std::sync::Arc;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::PutResponse;
use rouchdb_core::error::Result;

pub use rouchdb_core::document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, BulkDocsOptions, ChangeEvent,
    ChangeRev, ChangesOptions, ChangesResponse, DbInfo, DocResult, Document, GetAttachmentOptions,
    GetOptions, OpenRevs, Revision,
};
pub use rouchdb_changes::{ChangesHandle, ChangesStreamOptions};
pub use rouchdb_core::error::RouchError;
pub use rouchdb_query::index::IndexType;
pub use rouchdb_query::{FindOptions, FindResponse, SortField};
pub use rouchdb_replication::{PullReplication, PushReplication, ReplicationOptions, ReplicationResult};

use rouchdb_query::index::IndexManager;

/// Result of a single-document write (`put`, `update`, `remove`).
///
/// Distinct from `rouchdb_core::document::PutResponse`: `rev` is optional so
/// failed writes that still need to report partial information (e.g. from
/// `_bulk_docs`) have somewhere to put `None`.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub ok: bool,
    pub id: String,
    pub rev: Option<String>,
}

impl From<PutResponse> for PutResult {
    fn from(r: PutResponse) -> Self {
        PutResult {
            ok: r.ok,
            id: r.id,
            rev: Some(r.rev),
        }
    }
}

/// A RouchDB database: CRUD, changes, replication, and Mango queries over
/// whichever [`Adapter`] backs it.
pub struct Database {
    adapter: Arc<dyn Adapter>,
    /// Shadow-table query index, when this backend has somewhere durable
    /// (or at least in-process) to keep one. `None` for `Database::http`,
    /// where `find` always falls back to a full remote scan.
    index: Option<tokio::sync::Mutex<IndexManager>>,
}

impl Database {
    fn from_adapter(adapter: Arc<dyn Adapter>, index: Option<IndexManager>) -> Self {
        Self {
            adapter,
            index: index.map(tokio::sync::Mutex::new),
        }
    }

    /// An ephemeral, in-process database. Data is lost when it's dropped.
    pub fn memory(name: impl Into<String>) -> Self {
        let index = IndexManager::in_memory().expect("in-memory index database");
        Self::from_adapter(Arc::new(rouchdb_adapter_memory::MemoryAdapter::new(name)), Some(index))
    }

    /// A persistent on-disk database. `kind` selects the storage engine;
    /// currently only `"sqlite"` is supported.
    pub fn open(path: impl AsRef<Path>, kind: &str) -> Result<Self> {
        match kind {
            "sqlite" => {
                let path = path.as_ref();
                let adapter = rouchdb_adapter_sqlite::SqliteAdapter::open(path)?;
                let index = IndexManager::open(&path.join("extensions/com.cloudant.sync.query/indexes.sync"))?;
                Ok(Self::from_adapter(Arc::new(adapter), Some(index)))
            }
            other => Err(RouchError::BadRequest(format!(
                "unknown adapter kind: {other}"
            ))),
        }
    }

    /// A database reachable over HTTP, speaking the CouchDB API.
    pub fn http(url: impl Into<String>) -> Self {
        Self::from_adapter(Arc::new(rouchdb_adapter_http::HttpAdapter::new(url)), None)
    }

    /// The raw [`Adapter`] backing this database, for operations (like
    /// attachments) this facade doesn't wrap directly.
    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    /// Create or fully overwrite a document. Use [`Database::update`] to
    /// edit an existing document.
    pub async fn put(&self, id: &str, data: serde_json::Value) -> Result<PutResult> {
        let doc = Document {
            id: id.to_string(),
            rev: None,
            deleted: false,
            data,
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: Vec::new(),
        };
        Ok(self.adapter.put(doc).await?.into())
    }

    /// Update an existing document; `rev` must match its current revision.
    pub async fn update(&self, id: &str, rev: &str, data: serde_json::Value) -> Result<PutResult> {
        let rev: Revision = rev.parse()?;
        let doc = Document {
            id: id.to_string(),
            rev: Some(rev),
            deleted: false,
            data,
            attachments: Default::default(),
            conflicts: Vec::new(),
            revisions: Vec::new(),
        };
        Ok(self.adapter.put(doc).await?.into())
    }

    /// Delete a document by writing a tombstone revision.
    pub async fn remove(&self, id: &str, rev: &str) -> Result<PutResult> {
        let rev: Revision = rev.parse()?;
        Ok(self.adapter.remove(id, &rev).await?.into())
    }

    /// Fetch the current winning revision of a document.
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.adapter.get(id, GetOptions::default()).await
    }

    /// Fetch a document with specific options (a given revision,
    /// `_conflicts`, full revision history).
    pub async fn get_with_opts(&self, id: &str, opts: GetOptions) -> Result<Document> {
        self.adapter.get(id, opts).await
    }

    /// Ids of every document with unresolved conflicting revisions.
    pub async fn get_conflicted_ids(&self) -> Result<Vec<String>> {
        self.adapter.get_conflicted_ids().await
    }

    /// Resolve a document's conflicts, keeping only `kept_rev` among its
    /// open leaves.
    pub async fn resolve_conflicts(&self, id: &str, kept_rev: &str) -> Result<()> {
        let kept_rev: Revision = kept_rev.parse()?;
        self.adapter.resolve_conflicts(id, &kept_rev).await
    }

    /// Write many documents in one call, generating new revisions.
    pub async fn bulk_docs(&self, docs: Vec<Document>) -> Result<Vec<DocResult>> {
        self.adapter.bulk_docs(docs, BulkDocsOptions::new()).await
    }

    pub async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        self.adapter.all_docs(opts).await
    }

    /// One-shot changes feed since a sequence.
    pub async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        self.adapter.changes(opts).await
    }

    /// A continuously-updating changes feed. Drop the handle (or call
    /// `.cancel()`) to stop it.
    pub fn live_changes(
        &self,
        opts: ChangesStreamOptions,
    ) -> (tokio::sync::mpsc::Receiver<ChangeEvent>, ChangesHandle) {
        rouchdb_changes::live_changes(self.adapter.clone(), opts)
    }

    /// Run a Mango selector query. Uses a covering shadow-table index when
    /// one exists for the selector's leading clause, falling back to a full
    /// scan evaluated by the in-memory matcher otherwise.
    pub async fn find(&self, opts: FindOptions) -> Result<FindResponse> {
        match &self.index {
            Some(index) => {
                let guard = index.lock().await;
                rouchdb_query::find(self.adapter.as_ref(), Some(&*guard), opts).await
            }
            None => rouchdb_query::find(self.adapter.as_ref(), None, opts).await,
        }
    }

    /// Declare a named Mango index over a set of (ascending) fields.
    pub async fn create_index(&self, name: &str, fields: Vec<SortField>) -> Result<()> {
        self.create_index_of_type(name, fields, IndexType::Json).await
    }

    /// Declare a store-wide full-text index, usable via a top-level
    /// `{"$text": {"$search": "..."}}` selector. At most one may exist.
    pub async fn create_text_index(&self, name: &str) -> Result<()> {
        self.create_index_of_type(name, Vec::new(), IndexType::Text).await
    }

    async fn create_index_of_type(&self, name: &str, fields: Vec<SortField>, kind: IndexType) -> Result<()> {
        let index = self.index.as_ref().ok_or_else(|| {
            RouchError::BadRequest("this backend has no local index store".into())
        })?;
        let guard = index.lock().await;
        rouchdb_query::create_index(self.adapter.as_ref(), &*guard, name, fields, kind).await
    }

    pub async fn info(&self) -> Result<DbInfo> {
        self.adapter.info().await
    }

    pub async fn compact(&self) -> Result<()> {
        self.adapter.compact().await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.adapter.destroy().await
    }

    /// Replicate every document from `self` to `other`.
    pub async fn replicate_to(&self, other: &Database) -> Result<ReplicationResult> {
        self.replicate_to_with_opts(other, ReplicationOptions::default())
            .await
    }

    pub async fn replicate_to_with_opts(
        &self,
        other: &Database,
        opts: ReplicationOptions,
    ) -> Result<ReplicationResult> {
        rouchdb_replication::replicate(self.adapter.as_ref(), other.adapter.as_ref(), opts).await
    }

    /// Replicate every document from `other` into `self`.
    pub async fn replicate_from(&self, other: &Database) -> Result<ReplicationResult> {
        self.replicate_from_with_opts(other, ReplicationOptions::default())
            .await
    }

    pub async fn replicate_from_with_opts(
        &self,
        other: &Database,
        opts: ReplicationOptions,
    ) -> Result<ReplicationResult> {
        rouchdb_replication::replicate(other.adapter.as_ref(), self.adapter.as_ref(), opts).await
    }

    /// Push then pull: replicate `self` to `other`, then `other` back into
    /// `self`. Returns `(push_result, pull_result)`.
    pub async fn sync(&self, other: &Database) -> Result<(ReplicationResult, ReplicationResult)> {
        let push = self.replicate_to(other).await?;
        let pull = self.replicate_from(other).await?;
        Ok((push, pull))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_update_remove_roundtrip() {
        let db = Database::memory("test");

        let r1 = db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();
        assert!(r1.ok);
        let rev = r1.rev.unwrap();

        let doc = db.get("doc1").await.unwrap();
        assert_eq!(doc.data["v"], 1);

        let r2 = db
            .update("doc1", &rev, serde_json::json!({"v": 2}))
            .await
            .unwrap();
        assert!(r2.ok);

        let doc = db.get("doc1").await.unwrap();
        assert_eq!(doc.data["v"], 2);

        db.remove("doc1", &r2.rev.unwrap()).await.unwrap();
        assert!(db.get("doc1").await.is_err());
    }

    #[tokio::test]
    async fn put_existing_without_rev_conflicts() {
        let db = Database::memory("test");
        db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();

        let result = db.put("doc1", serde_json::json!({"v": 2})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sync_between_two_memory_databases() {
        let a = Database::memory("a");
        let b = Database::memory("b");

        a.put("from_a", serde_json::json!({"side": "a"})).await.unwrap();
        b.put("from_b", serde_json::json!({"side": "b"})).await.unwrap();

        let (push, pull) = a.sync(&b).await.unwrap();
        assert!(push.ok);
        assert!(pull.ok);

        assert!(a.get("from_b").await.is_ok());
        assert!(b.get("from_a").await.is_ok());
    }

    #[tokio::test]
    async fn find_runs_mango_query_over_memory_adapter() {
        let db = Database::memory("test");
        db.put("a", serde_json::json!({"age": 30})).await.unwrap();
        db.put("b", serde_json::json!({"age": 20})).await.unwrap();

        let result = db
            .find(FindOptions {
                selector: serde_json::json!({"age": {"$gte": 25}}),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0]["age"], 30);
    }

    #[tokio::test]
    async fn find_uses_index_once_created() {
        let db = Database::memory("test");
        db.put("a", serde_json::json!({"age": 30})).await.unwrap();
        db.put("b", serde_json::json!({"age": 20})).await.unwrap();

        db.create_index("by_age", vec![SortField::Simple("age".into())]).await.unwrap();

        let result = db
            .find(FindOptions {
                selector: serde_json::json!({"age": 30}),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0]["age"], 30);
    }

    #[tokio::test]
    async fn http_database_has_no_local_index() {
        let db = Database::http("http://localhost:5984/test");
        let result = db.create_index("by_age", vec![SortField::Simple("age".into())]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sqlite_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), "sqlite").unwrap();
            db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();
        }
        let db = Database::open(dir.path(), "sqlite").unwrap();
        let doc = db.get("doc1").await.unwrap();
        assert_eq!(doc.data["v"], 1);
    }
}
