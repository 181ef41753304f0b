//! Post-hoc Mango selector matcher.
//!
//! Evaluates a selector document directly against a JSON document, without
//! needing an index. This is always correct and is the fallback path used
//! whenever no shadow-table index covers a selector's fields.

use serde_json::Value;

pub fn matches(selector: &Value, doc: &Value) -> bool {
    match selector {
        Value::Object(map) => map.iter().all(|(key, cond)| match key.as_str() {
            "$and" => cond.as_array().is_some_and(|arr| arr.iter().all(|s| matches(s, doc))),
            "$or" => cond.as_array().is_some_and(|arr| arr.iter().any(|s| matches(s, doc))),
            "$nor" => cond.as_array().is_some_and(|arr| !arr.iter().any(|s| matches(s, doc))),
            "$not" => !matches(cond, doc),
            "$text" => match_text_search(cond, doc),
            _ => match_field(key, cond, doc),
        }),
        _ => false,
    }
}

/// Top-level `{"$text": {"$search": "..."}}`: true if any string (or
/// number) value anywhere in the document contains the search term,
/// case-insensitively. Distinct from the field-level `$text` operator
/// inside `match_condition`, which tests one field's value.
fn match_text_search(cond: &Value, doc: &Value) -> bool {
    match cond.get("$search").and_then(Value::as_str) {
        Some(needle) if !needle.is_empty() => document_contains(doc, &needle.to_lowercase()),
        _ => false,
    }
}

fn document_contains(value: &Value, needle_lower: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle_lower),
        Value::Number(n) => n.to_string().contains(needle_lower),
        Value::Array(arr) => arr.iter().any(|v| document_contains(v, needle_lower)),
        Value::Object(map) => map.values().any(|v| document_contains(v, needle_lower)),
        _ => false,
    }
}

fn match_field(path: &str, cond: &Value, doc: &Value) -> bool {
    let value = field_at(doc, path);
    match_condition(cond, &value)
}

fn field_at(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for part in path.split('.') {
        match current.get(part) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn match_condition(cond: &Value, value: &Value) -> bool {
    match cond {
        Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, expected)| match op.as_str() {
                "$eq" => value == expected,
                "$ne" => value != expected,
                "$gt" => compare(value, expected) == Some(std::cmp::Ordering::Greater),
                "$gte" => matches!(
                    compare(value, expected),
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                ),
                "$lt" => compare(value, expected) == Some(std::cmp::Ordering::Less),
                "$lte" => matches!(
                    compare(value, expected),
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                ),
                "$in" => expected.as_array().is_some_and(|arr| arr.contains(value)),
                "$nin" => expected.as_array().is_some_and(|arr| !arr.contains(value)),
                "$exists" => {
                    let present = !value.is_null();
                    present == expected.as_bool().unwrap_or(true)
                }
                "$mod" => expected
                    .as_array()
                    .and_then(|arr| Some((arr.first()?.as_i64()?, arr.get(1)?.as_i64()?)))
                    .zip(value.as_i64())
                    .is_some_and(|((d, r), v)| d != 0 && v % d == r),
                "$size" => value
                    .as_array()
                    .map(|arr| arr.len() as i64)
                    .zip(expected.as_i64())
                    .is_some_and(|(a, b)| a == b),
                "$type" => type_name(value) == expected.as_str().unwrap_or(""),
                "$regex" => expected
                    .as_str()
                    .and_then(|pat| regex::Regex::new(pat).ok())
                    .zip(value.as_str())
                    .is_some_and(|(re, s)| re.is_match(s)),
                "$all" => expected.as_array().is_some_and(|want| {
                    value
                        .as_array()
                        .map(|have| want.iter().all(|w| have.contains(w)))
                        .unwrap_or(false)
                }),
                "$not" => !match_condition(expected, value),
                "$text" => expected
                    .as_str()
                    .map(|needle| value.as_str().unwrap_or_default().contains(needle))
                    .unwrap_or(false),
                _ => true,
            })
        }
        // implicit $eq
        other => value == other,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn implicit_eq() {
        assert!(matches(&json!({"name": "Bob"}), &json!({"name": "Bob"})));
        assert!(!matches(&json!({"name": "Bob"}), &json!({"name": "Alice"})));
    }

    #[test]
    fn comparison_operators() {
        let doc = json!({"age": 30});
        assert!(matches(&json!({"age": {"$gt": 20}}), &doc));
        assert!(!matches(&json!({"age": {"$lt": 20}}), &doc));
        assert!(matches(&json!({"age": {"$gte": 30, "$lte": 30}}), &doc));
    }

    #[test]
    fn in_nin_exists() {
        let doc = json!({"color": "red", "size": "m"});
        assert!(matches(&json!({"color": {"$in": ["red", "blue"]}}), &doc));
        assert!(matches(&json!({"color": {"$nin": ["blue"]}}), &doc));
        assert!(matches(&json!({"size": {"$exists": true}}), &doc));
        assert!(matches(&json!({"missing": {"$exists": false}}), &doc));
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"x": 1, "y": "a"});
        assert!(matches(&json!({"$or": [{"x": 1}, {"x": 99}]}), &doc));
        assert!(matches(&json!({"$and": [{"y": "a"}, {"x": {"$gt": 0}}]}), &doc));
        assert!(matches(&json!({"$nor": [{"x": 2}]}), &doc));
        assert!(matches(&json!({"x": {"$not": {"$eq": 2}}}), &doc));
    }

    #[test]
    fn nested_field_path() {
        let doc = json!({"address": {"state": "CA"}});
        assert!(matches(&json!({"address.state": "CA"}), &doc));
        assert!(!matches(&json!({"address.state": "NY"}), &doc));
    }

    #[test]
    fn array_operators() {
        let doc = json!({"tags": ["rust", "db", "sync"]});
        assert!(matches(&json!({"tags": {"$all": ["rust", "db"]}}), &doc));
        assert!(matches(&json!({"tags": {"$size": 3}}), &doc));
        assert!(!matches(&json!({"tags": {"$size": 2}}), &doc));
    }

    #[test]
    fn regex_and_type() {
        let doc = json!({"email": "a@example.com"});
        assert!(matches(&json!({"email": {"$regex": ".*@example\\.com$"}}), &doc));
        assert!(matches(&json!({"email": {"$type": "string"}}), &doc));
        assert!(!matches(&json!({"email": {"$type": "number"}}), &doc));
    }

    #[test]
    fn empty_selector_matches_all() {
        assert!(matches(&json!({}), &json!({"anything": true})));
    }

    #[test]
    fn top_level_text_search() {
        let doc = json!({"bio": "Loves distributed systems and Rust"});
        assert!(matches(&json!({"$text": {"$search": "rust"}}), &doc));
        assert!(!matches(&json!({"$text": {"$search": "golang"}}), &doc));
        // doesn't vacuously match when the search term is missing/empty
        assert!(!matches(&json!({"$text": {}}), &doc));
    }
}
