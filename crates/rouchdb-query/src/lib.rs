//! Mango selector query engine: a post-hoc matcher usable against any
//! `Adapter`, plus shadow-table index management for adapters that want to
//! accelerate lookups.

pub mod index;
pub mod matcher;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{AllDocsOptions, ChangesOptions, Seq};
use rouchdb_core::error::{Result, RouchError};

use index::{IndexField, IndexInfo, IndexManager, IndexType};

#[derive(Debug, Clone)]
pub enum SortField {
    Simple(String),
    WithDirection(std::collections::HashMap<String, String>),
}

/// Declare a named index, validating and backfilling it against `adapter`'s
/// current documents. See [`index::IndexManager::create_index`] for the
/// validation rules.
pub async fn create_index(
    adapter: &dyn Adapter,
    manager: &IndexManager,
    name: &str,
    fields: Vec<SortField>,
    kind: IndexType,
) -> Result<()> {
    let mut idx_fields = Vec::with_capacity(fields.len());
    for f in &fields {
        match f {
            SortField::Simple(n) => idx_fields.push(IndexField::asc(n.clone())),
            SortField::WithDirection(m) => {
                let (k, v) = m
                    .iter()
                    .next()
                    .ok_or_else(|| RouchError::BadRequest("empty sort direction".into()))?;
                idx_fields.push(IndexField {
                    name: k.clone(),
                    descending: v == "desc",
                });
            }
        }
    }
    manager.create_index(name, &idx_fields, kind)?;
    if let Some(info) = manager.list_indexes()?.into_iter().find(|i| i.name == name) {
        sync_index(adapter, manager, &info).await?;
    }
    Ok(())
}

/// Replay `adapter`'s changes feed since an index's last synced sequence
/// into its shadow table. Cheap no-op once the index is caught up.
async fn sync_index(adapter: &dyn Adapter, manager: &IndexManager, info: &IndexInfo) -> Result<()> {
    let since = manager.last_sequence(&info.name)?;
    let changes = adapter
        .changes(ChangesOptions {
            since: Seq::Num(since),
            include_docs: true,
            ..Default::default()
        })
        .await?;
    for event in &changes.results {
        if event.deleted {
            manager.remove_row(&info.name, &event.id)?;
            continue;
        }
        if let Some(doc) = &event.doc {
            let rev = event.changes.first().map(|c| c.rev.clone()).unwrap_or_default();
            manager.upsert_row(&info.name, &info.fields, info.kind, &event.id, &rev, doc)?;
        }
    }
    manager.set_last_sequence(&info.name, changes.last_seq.as_num())?;
    Ok(())
}

/// Narrow a selector's top-level clauses against any covering index,
/// returning candidate doc ids if one applies. `None` means no index
/// covered the selector and the caller should fall back to a full scan.
async fn indexed_candidates(
    adapter: &dyn Adapter,
    manager: &IndexManager,
    selector: &serde_json::Value,
) -> Result<Option<Vec<String>>> {
    let Some(map) = selector.as_object() else {
        return Ok(None);
    };

    if let Some(text_cond) = map.get("$text") {
        if let Some(needle) = text_cond.get("$search").and_then(|v| v.as_str()) {
            if let Some(info) = manager.list_indexes()?.into_iter().find(|i| i.kind == IndexType::Text) {
                sync_index(adapter, manager, &info).await?;
                return Ok(Some(manager.query_text(&info.name, needle)?));
            }
        }
        return Ok(None);
    }

    for (field, cond) in map {
        if field.starts_with('$') {
            continue;
        }
        let Some(info) = manager
            .list_indexes()?
            .into_iter()
            .find(|i| i.kind == IndexType::Json && i.fields.first().is_some_and(|f| f == field))
        else {
            continue;
        };
        if let Some((op, value)) = simple_condition(cond) {
            sync_index(adapter, manager, &info).await?;
            return Ok(Some(manager.query_field(&info.name, field, op, &value)?));
        }
    }
    Ok(None)
}

/// Only equality narrows via the index. Shadow columns are plain `TEXT`, so
/// a SQL `>`/`<` comparison on them is lexicographic rather than numeric —
/// safe for exact matches (any JSON scalar's canonical string form is an
/// exact match only for the same value) but not for range comparisons on
/// numeric fields (`"9" > "10"` as text). Range clauses always fall back to
/// the matcher instead of risking a false negative through the index.
fn simple_condition(cond: &serde_json::Value) -> Option<(&'static str, String)> {
    match cond {
        serde_json::Value::Object(ops) if ops.len() == 1 => {
            let (op, v) = ops.iter().next().unwrap();
            match op.as_str() {
                "$eq" => Some(("=", value_text(v))),
                _ => None,
            }
        }
        serde_json::Value::Object(_) => None,
        other => Some(("=", value_text(other))),
    }
}

fn value_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub selector: serde_json::Value,
    pub sort: Option<Vec<SortField>>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FindResponse {
    pub docs: Vec<serde_json::Value>,
}

/// Run a Mango query against an adapter's document set.
///
/// When `index` is given, a covering index (if one exists for the
/// selector's leading clause) narrows the candidate set via its shadow
/// table first; `matcher::matches` is always re-applied afterward so a
/// stale or partial index can never produce a wrong result, only a slower
/// one. With no applicable index, or `index: None`, this falls back to a
/// full `all_docs(include_docs: true)` scan evaluated by the matcher alone.
pub async fn find(
    adapter: &dyn Adapter,
    index: Option<&IndexManager>,
    opts: FindOptions,
) -> Result<FindResponse> {
    let candidates = match index {
        Some(manager) => indexed_candidates(adapter, manager, &opts.selector).await?,
        None => None,
    };

    let mut docs: Vec<serde_json::Value> = if let Some(ids) = candidates {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(doc) = adapter.get(&id, rouchdb_core::document::GetOptions::default()).await {
                let json = doc.to_json();
                if matcher::matches(&opts.selector, &json) {
                    out.push(json);
                }
            }
        }
        out
    } else {
        let all = adapter
            .all_docs(AllDocsOptions {
                include_docs: true,
                inclusive_end: true,
                ..Default::default()
            })
            .await?;
        all.rows
            .into_iter()
            .filter_map(|row| row.doc)
            .filter(|doc| matcher::matches(&opts.selector, doc))
            .collect()
    };

    if let Some(sort) = &opts.sort {
        docs.sort_by(|a, b| {
            for field in sort {
                let (name, ascending) = match field {
                    SortField::Simple(n) => (n.as_str(), true),
                    SortField::WithDirection(m) => {
                        let (k, v) = m.iter().next().expect("sort direction map must have one entry");
                        (k.as_str(), v != "desc")
                    }
                };
                let ordering = compare_values(&a[name], &b[name]);
                let ordering = if ascending { ordering } else { ordering.reverse() };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    if let Some(skip) = opts.skip {
        docs = docs.into_iter().skip(skip as usize).collect();
    }
    if let Some(limit) = opts.limit {
        docs.truncate(limit as usize);
    }

    if let Some(fields) = &opts.fields {
        docs = docs
            .into_iter()
            .map(|doc| {
                let mut projected = serde_json::Map::new();
                for f in fields {
                    if let Some(v) = doc.get(f) {
                        projected.insert(f.clone(), v.clone());
                    }
                }
                serde_json::Value::Object(projected)
            })
            .collect();
    }

    Ok(FindResponse { docs })
}

fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> std::cmp::Ordering {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
    }
    a.to_string().cmp(&b.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouchdb_core::document::{BulkDocsOptions, Document};
    use std::collections::HashMap;

    async fn put(db: &dyn Adapter, id: &str, data: serde_json::Value) {
        let doc = Document {
            id: id.into(),
            rev: None,
            deleted: false,
            data,
            attachments: HashMap::new(),
            conflicts: Vec::new(),
            revisions: Vec::new(),
        };
        db.bulk_docs(vec![doc], BulkDocsOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn find_filters_and_sorts() {
        let db = rouchdb_adapter_memory::MemoryAdapter::new("test");
        put(&db, "a", serde_json::json!({"name": "Alice", "age": 30})).await;
        put(&db, "b", serde_json::json!({"name": "Bob", "age": 25})).await;
        put(&db, "c", serde_json::json!({"name": "Charlie", "age": 35})).await;

        let result = find(
            &db,
            None,
            FindOptions {
                selector: serde_json::json!({"age": {"$gte": 30}}),
                sort: Some(vec![SortField::Simple("age".into())]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.docs.len(), 2);
        assert_eq!(result.docs[0]["name"], "Alice");
        assert_eq!(result.docs[1]["name"], "Charlie");
    }

    #[tokio::test]
    async fn find_projects_fields() {
        let db = rouchdb_adapter_memory::MemoryAdapter::new("test");
        put(&db, "a", serde_json::json!({"name": "Alice", "age": 30})).await;

        let result = find(
            &db,
            None,
            FindOptions {
                selector: serde_json::json!({}),
                fields: Some(vec!["name".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.docs[0].as_object().unwrap().len(), 1);
        assert_eq!(result.docs[0]["name"], "Alice");
    }

    #[tokio::test]
    async fn find_uses_covering_index_and_matcher_rechecks_result() {
        let db = rouchdb_adapter_memory::MemoryAdapter::new("test");
        put(&db, "a", serde_json::json!({"age": 30, "active": true})).await;
        put(&db, "b", serde_json::json!({"age": 30, "active": false})).await;
        put(&db, "c", serde_json::json!({"age": 20, "active": true})).await;

        let manager = IndexManager::in_memory().unwrap();
        create_index(&db, &manager, "by_age", vec![SortField::Simple("age".into())], IndexType::Json)
            .await
            .unwrap();

        // The index only covers `age`; `active` must still be checked by
        // the matcher after the shadow table narrows the candidate set.
        let result = find(
            &db,
            Some(&manager),
            FindOptions {
                selector: serde_json::json!({"age": 30, "active": true}),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0]["_id"], "a");
    }

    #[tokio::test]
    async fn find_refreshes_index_for_docs_written_after_creation() {
        let db = rouchdb_adapter_memory::MemoryAdapter::new("test");
        let manager = IndexManager::in_memory().unwrap();
        create_index(&db, &manager, "by_age", vec![SortField::Simple("age".into())], IndexType::Json)
            .await
            .unwrap();

        put(&db, "late", serde_json::json!({"age": 40})).await;

        let result = find(
            &db,
            Some(&manager),
            FindOptions {
                selector: serde_json::json!({"age": 40}),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0]["_id"], "late");
    }

    #[tokio::test]
    async fn find_top_level_text_search_uses_text_index() {
        let db = rouchdb_adapter_memory::MemoryAdapter::new("test");
        put(&db, "a", serde_json::json!({"bio": "loves rust"})).await;
        put(&db, "b", serde_json::json!({"bio": "loves golang"})).await;

        let manager = IndexManager::in_memory().unwrap();
        create_index(&db, &manager, "full_text", vec![], IndexType::Text)
            .await
            .unwrap();

        let result = find(
            &db,
            Some(&manager),
            FindOptions {
                selector: serde_json::json!({"$text": {"$search": "rust"}}),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0]["_id"], "a");
    }
}
