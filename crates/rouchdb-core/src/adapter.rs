use async_trait::async_trait;

use crate::document::{
    AllDocsOptions, AllDocsResponse, BulkDocsOptions, BulkGetResponse, ChangesOptions,
    ChangesResponse, DbInfo, Document, GetAttachmentOptions, GetOptions, PutResponse,
    RevsDiffResponse,
};
use crate::document::DocResult;
use crate::error::Result;
use crate::document::Revision;

/// Storage backend contract shared by every adapter (memory, sqlite, http).
///
/// Mirrors the CouchDB HTTP API closely enough that the replication engine
/// can drive any two adapters against each other without knowing which is
/// local and which is remote.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Insert or update a single document, generating a new revision.
    async fn put(&self, doc: Document) -> Result<PutResponse>;

    /// Fetch a document by id, honoring `GetOptions` (specific rev,
    /// conflicts, open_revs, full history).
    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document>;

    /// Delete a document by writing a tombstone revision.
    async fn remove(&self, id: &str, rev: &Revision) -> Result<PutResponse>;

    /// Insert documents with pre-existing revisions, merging them into each
    /// document's revision tree without generating new revisions. Used by
    /// replication (`new_edits: false`) and by ordinary multi-doc writes
    /// (`new_edits: true`, the default in `BulkDocsOptions::new()`).
    async fn bulk_docs(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Result<Vec<DocResult>>;

    /// List documents ordered by id.
    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse>;

    /// One-shot changes feed since a sequence.
    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse>;

    /// Current document count and update sequence.
    async fn info(&self) -> Result<DbInfo>;

    /// Discard non-winning, non-leaf revisions beyond the database's
    /// retained history; reclaim tombstoned document storage.
    async fn compact(&self) -> Result<()>;

    /// Irrecoverably remove the database and its on-disk state, if any.
    async fn destroy(&self) -> Result<()>;

    /// Read a `_local/<id>` checkpoint document. Local docs have no
    /// revision history and are excluded from replication and `_changes`.
    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>>;

    /// Write a `_local/<id>` checkpoint document.
    async fn put_local(&self, id: &str, value: serde_json::Value) -> Result<()>;

    /// For each requested `(id, [revs])`, report which revisions are
    /// missing from this database. Drives replication negotiation.
    async fn revs_diff(
        &self,
        revs: std::collections::HashMap<String, Vec<String>>,
    ) -> Result<RevsDiffResponse>;

    /// Fetch specific revisions of specific documents in one round trip,
    /// falling back internally to per-document `open_revs` semantics.
    async fn bulk_get(&self, docs: Vec<(String, Vec<String>)>) -> Result<BulkGetResponse>;

    /// Attach a binary blob to a specific revision of a document.
    async fn put_attachment(
        &self,
        doc_id: &str,
        filename: &str,
        rev: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<PutResponse>;

    /// Retrieve an attachment's bytes.
    async fn get_attachment(
        &self,
        doc_id: &str,
        filename: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>>;

    /// Stream the ids of every document that currently has unresolved
    /// conflicting revisions (more than one open, non-deleted leaf).
    ///
    /// The default implementation scans `all_docs` and re-fetches each
    /// document with `conflicts: true`; adapters with a cheaper way to
    /// answer this (a tree walk, a SQL query) should override it.
    async fn get_conflicted_ids(&self) -> Result<Vec<String>> {
        let all = self.all_docs(AllDocsOptions::new()).await?;
        let mut out = Vec::new();
        for row in all.rows {
            let doc = self
                .get(&row.id, GetOptions { conflicts: true, ..Default::default() })
                .await?;
            if !doc.conflicts.is_empty() {
                out.push(row.id);
            }
        }
        Ok(out)
    }

    /// Resolve a document's conflicts by deleting every open leaf except
    /// `kept_rev`. `kept_rev` itself is left untouched (it need not be the
    /// current winner, but stays a live leaf — only the losing branches are
    /// tombstoned).
    async fn resolve_conflicts(&self, doc_id: &str, kept_rev: &Revision) -> Result<()> {
        let doc = self
            .get(doc_id, GetOptions { conflicts: true, ..Default::default() })
            .await?;
        for rev in doc.conflicts {
            if &rev != kept_rev {
                self.remove(doc_id, &rev).await?;
            }
        }
        Ok(())
    }
}
