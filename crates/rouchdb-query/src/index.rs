//! Shadow-table index management.
//!
//! Each named index owns a table in the query extension database
//! (`<root>/extensions/com.cloudant.sync.query/indexes.sync`), one column
//! per indexed field plus `doc_id`/`rev`, kept current by replaying the main
//! store's `_changes` feed. Modeled on the `init_schema`/`execute_batch`
//! pattern used across the pack's other SQLite-backed stores.

use rusqlite::{params, Connection};

use rouchdb_core::error::{Result, RouchError};

pub struct IndexManager {
    conn: Connection,
}

/// A field an index is built over. Mango only supports ascending shadow
/// columns; a descending direction is rejected at `create_index` time.
#[derive(Debug, Clone)]
pub struct IndexField {
    pub name: String,
    pub descending: bool,
}

impl IndexField {
    pub fn asc(name: impl Into<String>) -> Self {
        Self { name: name.into(), descending: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Json,
    Text,
}

impl IndexType {
    fn as_str(self) -> &'static str {
        match self {
            IndexType::Json => "json",
            IndexType::Text => "text",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "text" => IndexType::Text,
            _ => IndexType::Json,
        }
    }
}

/// A previously-declared index's shape, as recorded in the `indexes` table.
pub struct IndexInfo {
    pub name: String,
    pub fields: Vec<String>,
    pub kind: IndexType,
}

fn db_err(e: rusqlite::Error) -> RouchError {
    RouchError::DatabaseError(e.to_string())
}

fn shadow_table(name: &str) -> String {
    format!("idx_{}", name.replace(|c: char| !c.is_alphanumeric() && c != '_', "_"))
}

/// Sanitize a dotted field path into a safe SQL column name, e.g.
/// `address.state` -> `c_address_state`. Prefixed so a field can never
/// collide with the table's own `doc_id`/`rev` columns.
fn column_name(field: &str) -> String {
    format!("c_{}", field.replace(|c: char| !c.is_alphanumeric(), "_"))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS indexes (
    name TEXT PRIMARY KEY,
    fields TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'json',
    last_sequence INTEGER NOT NULL DEFAULT 0
);
"#;

impl IndexManager {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn })
    }

    /// Declare a named index over a set of dotted field paths.
    ///
    /// Rejects `_`-prefixed field names (`_id`/`_rev` are implicit leading
    /// columns, not user fields), descending fields (Mango shadow tables are
    /// ascending-only), and duplicate field names are collapsed to their
    /// first occurrence. Redeclaring an existing name with an identical
    /// definition is a no-op; redeclaring it with a different one is a
    /// `BadRequest`, never a silent overwrite. At most one text index may
    /// exist per store.
    pub fn create_index(&self, name: &str, fields: &[IndexField], kind: IndexType) -> Result<()> {
        if name.is_empty() {
            return Err(RouchError::BadRequest("index name must not be empty".into()));
        }

        let mut names: Vec<String> = Vec::new();
        for f in fields {
            if f.descending {
                return Err(RouchError::BadRequest(format!(
                    "descending index fields are not supported: {}",
                    f.name
                )));
            }
            if f.name.starts_with('_') {
                return Err(RouchError::BadRequest(format!(
                    "index fields may not start with '_': {}",
                    f.name
                )));
            }
            if !names.contains(&f.name) {
                names.push(f.name.clone());
            }
        }

        if kind == IndexType::Json && names.is_empty() {
            return Err(RouchError::BadRequest("a json index needs at least one field".into()));
        }

        if kind == IndexType::Text {
            let text_count: i64 = self
                .conn
                .query_row("SELECT COUNT(*) FROM indexes WHERE kind = 'text'", [], |r| r.get(0))
                .map_err(db_err)?;
            if text_count > 0 && !self.index_exists_with(name, &names, kind)? {
                return Err(RouchError::BadRequest(
                    "only one text index is allowed per store".into(),
                ));
            }
        }

        if let Some(existing) = self.find_index(name)? {
            if existing.fields == names && existing.kind == kind {
                return Ok(());
            }
            return Err(RouchError::BadRequest(format!(
                "index \"{name}\" already exists with a different definition"
            )));
        }

        let table = shadow_table(name);
        let columns: Vec<String> = if kind == IndexType::Text {
            vec!["content".to_string()]
        } else {
            names.iter().map(|n| column_name(n)).collect()
        };
        let col_defs: Vec<String> = columns.iter().map(|c| format!("{c} TEXT")).collect();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (doc_id TEXT PRIMARY KEY, rev TEXT, {cols});",
            table = table,
            cols = col_defs.join(", ")
        );
        self.conn.execute_batch(&create).map_err(db_err)?;

        let index_sql = format!(
            "CREATE INDEX IF NOT EXISTS {table}_fields ON {table} ({cols});",
            table = table,
            cols = columns.join(", ")
        );
        self.conn.execute_batch(&index_sql).map_err(db_err)?;

        self.conn
            .execute(
                "INSERT INTO indexes (name, fields, kind, last_sequence) VALUES (?1, ?2, ?3, 0)",
                params![name, serde_json::to_string(&names).unwrap(), kind.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn index_exists_with(&self, name: &str, fields: &[String], kind: IndexType) -> Result<bool> {
        Ok(self
            .find_index(name)?
            .is_some_and(|i| i.fields == fields && i.kind == kind))
    }

    fn find_index(&self, name: &str) -> Result<Option<IndexInfo>> {
        self.conn
            .query_row(
                "SELECT fields, kind FROM indexes WHERE name = ?1",
                params![name],
                |row| {
                    let fields: String = row.get(0)?;
                    let kind: String = row.get(1)?;
                    Ok((fields, kind))
                },
            )
            .map(|(fields, kind)| {
                Some(IndexInfo {
                    name: name.to_string(),
                    fields: serde_json::from_str(&fields).unwrap_or_default(),
                    kind: IndexType::from_str(&kind),
                })
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let table = shadow_table(name);
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {table};"))
            .map_err(db_err)?;
        self.conn
            .execute("DELETE FROM indexes WHERE name = ?1", params![name])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, fields, kind FROM indexes")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let fields: String = row.get(1)?;
                let kind: String = row.get(2)?;
                Ok((name, fields, kind))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (name, fields, kind) = row.map_err(db_err)?;
            out.push(IndexInfo {
                name,
                fields: serde_json::from_str(&fields).unwrap_or_default(),
                kind: IndexType::from_str(&kind),
            });
        }
        Ok(out)
    }

    pub fn last_sequence(&self, name: &str) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT last_sequence FROM indexes WHERE name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u64)
            .map_err(db_err)
    }

    pub fn set_last_sequence(&self, name: &str, seq: u64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE indexes SET last_sequence = ?2 WHERE name = ?1",
                params![name, seq as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert or refresh a document's row in an index's shadow table.
    pub fn upsert_row(
        &self,
        index_name: &str,
        fields: &[String],
        kind: IndexType,
        doc_id: &str,
        rev: &str,
        doc: &serde_json::Value,
    ) -> Result<()> {
        let table = shadow_table(index_name);
        let (columns, values): (Vec<String>, Vec<String>) = if kind == IndexType::Text {
            (vec!["content".to_string()], vec![text_content(doc)])
        } else {
            (
                fields.iter().map(|f| column_name(f)).collect(),
                fields.iter().map(|f| field_text(doc, f)).collect(),
            )
        };
        let placeholders: Vec<String> = (0..columns.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "INSERT INTO {table} (doc_id, rev, {cols}) VALUES (?1, ?2, {vals})
             ON CONFLICT(doc_id) DO UPDATE SET rev = excluded.rev, {updates}",
            table = table,
            cols = columns.join(", "),
            vals = placeholders.join(", "),
            updates = columns
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&doc_id, &rev];
        for v in &values {
            params_vec.push(v);
        }
        self.conn.execute(&sql, params_vec.as_slice()).map_err(db_err)?;
        Ok(())
    }

    pub fn remove_row(&self, index_name: &str, doc_id: &str) -> Result<()> {
        let table = shadow_table(index_name);
        self.conn
            .execute(&format!("DELETE FROM {table} WHERE doc_id = ?1"), params![doc_id])
            .map_err(db_err)?;
        Ok(())
    }

    /// Doc ids whose indexed column satisfies a simple comparison, for a
    /// `Json`-kind index. `op` is one of `=`, `>`, `>=`, `<`, `<=`.
    pub fn query_field(&self, index_name: &str, field: &str, op: &str, value: &str) -> Result<Vec<String>> {
        let table = shadow_table(index_name);
        let col = column_name(field);
        let sql = format!("SELECT doc_id FROM {table} WHERE {col} {op} ?1");
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![value], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Doc ids whose text-index content contains `needle` (case-insensitive).
    pub fn query_text(&self, index_name: &str, needle: &str) -> Result<Vec<String>> {
        let table = shadow_table(index_name);
        let sql = format!("SELECT doc_id FROM {table} WHERE lower(content) LIKE ?1");
        let pattern = format!("%{}%", needle.to_lowercase());
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }
}

fn field_text(doc: &serde_json::Value, path: &str) -> String {
    let mut current = doc;
    for part in path.split('.') {
        match current.get(part) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_content(doc: &serde_json::Value) -> String {
    let mut out = String::new();
    collect_strings(doc, &mut out);
    out
}

fn collect_strings(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        serde_json::Value::Array(arr) => arr.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Number(n) => {
            out.push_str(&n.to_string());
            out.push(' ');
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_and_list_index() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        let indexes = mgr.list_indexes().unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "by_age");
    }

    #[test]
    fn upsert_and_remove_row() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        mgr.upsert_row("by_age", &["age".to_string()], IndexType::Json, "doc1", "1-a", &json!({"age": 30}))
            .unwrap();
        assert_eq!(mgr.query_field("by_age", "age", "=", "30").unwrap(), vec!["doc1".to_string()]);
        mgr.remove_row("by_age", "doc1").unwrap();
        assert!(mgr.query_field("by_age", "age", "=", "30").unwrap().is_empty());
    }

    #[test]
    fn last_sequence_roundtrip() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        assert_eq!(mgr.last_sequence("by_age").unwrap(), 0);
        mgr.set_last_sequence("by_age", 7).unwrap();
        assert_eq!(mgr.last_sequence("by_age").unwrap(), 7);
    }

    #[test]
    fn drop_index_removes_metadata() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        mgr.drop_index("by_age").unwrap();
        assert!(mgr.list_indexes().unwrap().is_empty());
    }

    #[test]
    fn rejects_underscore_prefixed_fields() {
        let mgr = IndexManager::in_memory().unwrap();
        assert!(mgr.create_index("bad", &[IndexField::asc("_rev")], IndexType::Json).is_err());
    }

    #[test]
    fn rejects_descending_fields() {
        let mgr = IndexManager::in_memory().unwrap();
        let field = IndexField { name: "age".into(), descending: true };
        assert!(mgr.create_index("bad", &[field], IndexType::Json).is_err());
    }

    #[test]
    fn deduplicates_repeated_fields() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("dup", &[IndexField::asc("age"), IndexField::asc("age")], IndexType::Json)
            .unwrap();
        assert_eq!(mgr.list_indexes().unwrap()[0].fields, vec!["age".to_string()]);
    }

    #[test]
    fn redeclaring_same_name_different_fields_fails() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        assert!(mgr.create_index("by_age", &[IndexField::asc("name")], IndexType::Json).is_err());
    }

    #[test]
    fn redeclaring_same_name_same_fields_is_idempotent() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        mgr.create_index("by_age", &[IndexField::asc("age")], IndexType::Json).unwrap();
        assert_eq!(mgr.list_indexes().unwrap().len(), 1);
    }

    #[test]
    fn only_one_text_index_allowed() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("t1", &[], IndexType::Text).unwrap();
        assert!(mgr.create_index("t2", &[], IndexType::Text).is_err());
    }

    #[test]
    fn text_index_query_is_case_insensitive() {
        let mgr = IndexManager::in_memory().unwrap();
        mgr.create_index("full_text", &[], IndexType::Text).unwrap();
        mgr.upsert_row("full_text", &[], IndexType::Text, "doc1", "1-a", &json!({"bio": "Loves RUST"}))
            .unwrap();
        assert_eq!(mgr.query_text("full_text", "rust").unwrap(), vec!["doc1".to_string()]);
    }
}
