//! In-memory index engine.
//!
//! One `Engine` backs one index endpoint. It implements the operations the
//! connection handlers dispatch: index / patch / delete / get, term and
//! field queries with `_id` ranges, facet counting, schema dumps, and
//! stats. Query planning beyond this surface lives outside the I/O core.

use crate::document::{DocData, Document};
use crate::error::EngineError;
use crate::query::{self, QueryField};
use crate::RESERVED_ID;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a search: total matched count plus the requested page.
#[derive(Debug, Default)]
pub struct SearchResult {
    pub matched: usize,
    pub documents: Vec<Document>,
}

/// One in-memory index.
pub struct Engine {
    docs: DashMap<String, Document>,
    uncommitted: AtomicU64,
    commits: AtomicU64,
    created_at: DateTime<Utc>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            uncommitted: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            created_at: Utc::now(),
        }
    }

    /// Indexes a document, replacing any previous version.
    pub fn index(&self, doc: Document, commit: bool) -> Result<(), EngineError> {
        self.docs.insert(doc.id.clone(), doc);
        self.uncommitted.fetch_add(1, Ordering::Relaxed);
        if commit {
            self.commit();
        }
        Ok(())
    }

    /// Merges body fields into an existing map document.
    pub fn patch(&self, id: &str, patch: &Document, commit: bool) -> Result<(), EngineError> {
        let mut entry = self
            .docs
            .get_mut(id)
            .ok_or_else(|| EngineError::DocumentNotFound(id.to_string()))?;
        let patch_map = match &patch.data {
            DocData::Map(map) => map,
            DocData::Blob(_) => {
                return Err(EngineError::InvalidDocument(
                    "patch body must be a map".into(),
                ))
            }
        };
        match &mut entry.data {
            DocData::Map(map) => {
                for (key, value) in patch_map {
                    map.insert(key.clone(), value.clone());
                }
            }
            DocData::Blob(_) => {
                return Err(EngineError::InvalidDocument(
                    "cannot patch a blob document".into(),
                ))
            }
        }
        drop(entry);
        self.uncommitted.fetch_add(1, Ordering::Relaxed);
        if commit {
            self.commit();
        }
        Ok(())
    }

    /// Removes a document.
    pub fn delete(&self, id: &str, commit: bool) -> Result<(), EngineError> {
        self.docs
            .remove(id)
            .ok_or_else(|| EngineError::DocumentNotFound(id.to_string()))?;
        self.uncommitted.fetch_add(1, Ordering::Relaxed);
        if commit {
            self.commit();
        }
        Ok(())
    }

    /// Fetches a document by id.
    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.get(id).map(|d| d.clone())
    }

    pub fn commit(&self) {
        self.uncommitted.store(0, Ordering::Relaxed);
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Runs a query and returns the sorted, collapsed, paged result set.
    pub fn search(&self, q: &QueryField) -> SearchResult {
        let mut matches: Vec<Document> = self
            .docs
            .iter()
            .filter(|entry| self.matches(entry.value(), q))
            .map(|entry| entry.value().clone())
            .collect();

        sort_documents(&mut matches, &q.sort);

        if let Some(collapse_field) = &q.collapse {
            let mut seen: BTreeMap<String, u32> = BTreeMap::new();
            matches.retain(|doc| {
                let key = field_string(doc, collapse_field).unwrap_or_default();
                let count = seen.entry(key).or_insert(0);
                *count += 1;
                *count <= q.collapse_max.max(1)
            });
        }

        let matched = matches.len();
        let page: Vec<Document> = matches
            .into_iter()
            .skip(q.offset as usize)
            .take(q.limit as usize)
            .collect();

        SearchResult {
            matched,
            documents: page,
        }
    }

    /// Counts term frequencies per facet field over the matching set.
    pub fn facets(&self, q: &QueryField) -> Value {
        let mut out = Map::new();
        for facet in &q.facets {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for entry in self.docs.iter() {
                if !self.matches(entry.value(), q) {
                    continue;
                }
                if let Some(value) = field_string(entry.value(), facet) {
                    *counts.entry(value).or_insert(0) += 1;
                }
            }
            let array: Vec<Value> = counts
                .into_iter()
                .map(|(value, termfreq)| json!({ "value": value, "termfreq": termfreq }))
                .collect();
            out.insert(facet.clone(), Value::Array(array));
        }
        Value::Object(out)
    }

    /// Field names and inferred types across the index.
    pub fn schema(&self) -> Value {
        let mut fields: BTreeMap<String, &'static str> = BTreeMap::new();
        for entry in self.docs.iter() {
            if let DocData::Map(map) = &entry.value().data {
                for (key, value) in map {
                    let ty = match value {
                        Value::String(_) => "string",
                        Value::Number(_) => "number",
                        Value::Bool(_) => "boolean",
                        Value::Array(_) => "array",
                        Value::Object(_) => "object",
                        Value::Null => "null",
                    };
                    fields.entry(key.clone()).or_insert(ty);
                }
            }
        }
        json!({ "fields": fields })
    }

    /// Index statistics.
    pub fn stats(&self) -> Value {
        json!({
            "doc_count": self.docs.len(),
            "uncommitted": self.uncommitted.load(Ordering::Relaxed),
            "commits": self.commits.load(Ordering::Relaxed),
            "created_at": self.created_at.to_rfc3339(),
        })
    }

    fn matches(&self, doc: &Document, q: &QueryField) -> bool {
        if q.query.is_empty() && q.terms.is_empty() && q.partial.is_empty() {
            return true;
        }
        q.query.iter().all(|expr| match_expr(doc, expr))
            && q.terms.iter().all(|term| match_term(doc, term))
            && q.partial.iter().all(|prefix| match_prefix(doc, prefix))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn field_string(doc: &Document, field: &str) -> Option<String> {
    if field == RESERVED_ID {
        return Some(doc.id.clone());
    }
    match &doc.data {
        DocData::Map(map) => map.get(field).map(value_string),
        DocData::Blob(_) => None,
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Matches one query expression: `field:value`, `_id:lo..hi`, or a free
/// term searched across all fields.
fn match_expr(doc: &Document, expr: &str) -> bool {
    if let Some((field, value)) = expr.split_once(':') {
        if field == RESERVED_ID {
            if let Some((lo, hi)) = query::parse_range(value) {
                return id_in_range(&doc.id, lo, hi);
            }
            return doc.id == value;
        }
        match field_string(doc, field) {
            Some(stored) => stored.eq_ignore_ascii_case(value),
            None => false,
        }
    } else {
        match_term(doc, expr)
    }
}

fn match_term(doc: &Document, term: &str) -> bool {
    let needle = term.to_ascii_lowercase();
    if doc.id.to_ascii_lowercase() == needle {
        return true;
    }
    match &doc.data {
        DocData::Map(map) => map
            .values()
            .any(|v| value_string(v).to_ascii_lowercase().contains(&needle)),
        DocData::Blob(_) => false,
    }
}

fn match_prefix(doc: &Document, prefix: &str) -> bool {
    let needle = prefix.to_ascii_lowercase();
    match &doc.data {
        DocData::Map(map) => map
            .values()
            .any(|v| value_string(v).to_ascii_lowercase().starts_with(&needle)),
        DocData::Blob(_) => doc.id.to_ascii_lowercase().starts_with(&needle),
    }
}

/// Numeric comparison when both ids parse as integers, lexicographic
/// otherwise. Empty bounds are open.
fn id_in_range(id: &str, lo: &str, hi: &str) -> bool {
    if let (Ok(id_n), Ok(lo_n), Ok(hi_n)) = (
        id.parse::<i64>(),
        if lo.is_empty() { Ok(i64::MIN) } else { lo.parse() },
        if hi.is_empty() { Ok(i64::MAX) } else { hi.parse() },
    ) {
        return id_n >= lo_n && id_n <= hi_n;
    }
    (lo.is_empty() || id >= lo) && (hi.is_empty() || id <= hi)
}

fn sort_documents(docs: &mut [Document], sort: &[String]) {
    if sort.is_empty() {
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        return;
    }
    docs.sort_by(|a, b| {
        for key in sort {
            let (field, descending) = match key.strip_prefix('-') {
                Some(stripped) => (stripped, true),
                None => (key.as_str(), false),
            };
            let va = field_string(a, field).unwrap_or_default();
            let vb = field_string(b, field).unwrap_or_default();
            let ord = if field == RESERVED_ID {
                match (va.parse::<i64>(), vb.parse::<i64>()) {
                    (Ok(na), Ok(nb)) => na.cmp(&nb),
                    _ => va.cmp(&vb),
                }
            } else {
                va.cmp(&vb)
            };
            let ord = if descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JSON_TYPE;

    fn doc(id: &str, body: &str) -> Document {
        Document::from_body(id, JSON_TYPE, body.as_bytes()).unwrap()
    }

    fn engine_with_docs() -> Engine {
        let engine = Engine::new();
        engine
            .index(doc("1", r#"{"color":"red","size":"small"}"#), false)
            .unwrap();
        engine
            .index(doc("2", r#"{"color":"blue","size":"small"}"#), false)
            .unwrap();
        engine
            .index(doc("3", r#"{"color":"red","size":"large"}"#), false)
            .unwrap();
        engine
    }

    #[test]
    fn test_index_and_get() {
        let engine = engine_with_docs();
        assert_eq!(engine.doc_count(), 3);
        let d = engine.get("2").unwrap();
        assert_eq!(d.as_value()["color"], "blue");
        assert!(engine.get("missing").is_none());
    }

    #[test]
    fn test_field_query() {
        let engine = engine_with_docs();
        let mut q = QueryField::default();
        q.query.push("color:red".into());
        let result = engine.search(&q);
        assert_eq!(result.matched, 2);
        let ids: Vec<&str> = result.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_free_term_query() {
        let engine = engine_with_docs();
        let mut q = QueryField::default();
        q.query.push("LARGE".into());
        let result = engine.search(&q);
        assert_eq!(result.matched, 1);
        assert_eq!(result.documents[0].id, "3");
    }

    #[test]
    fn test_id_range_query() {
        let engine = engine_with_docs();
        let mut q = QueryField::id_range();
        q.query.push("_id:2..3".into());
        let result = engine.search(&q);
        assert_eq!(result.matched, 2);
        assert_eq!(result.documents[0].id, "2");
    }

    #[test]
    fn test_offset_and_limit() {
        let engine = engine_with_docs();
        let mut q = QueryField::default();
        q.offset = 1;
        q.limit = 1;
        let result = engine.search(&q);
        assert_eq!(result.matched, 3);
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.documents[0].id, "2");
    }

    #[test]
    fn test_sort_descending() {
        let engine = engine_with_docs();
        let mut q = QueryField::default();
        q.sort.push("-_id".into());
        let result = engine.search(&q);
        assert_eq!(result.documents[0].id, "3");
    }

    #[test]
    fn test_collapse() {
        let engine = engine_with_docs();
        let mut q = QueryField::default();
        q.collapse = Some("color".into());
        let result = engine.search(&q);
        // One red, one blue survive.
        assert_eq!(result.matched, 2);
    }

    #[test]
    fn test_patch_merges_fields() {
        let engine = engine_with_docs();
        engine
            .patch("1", &doc("1", r#"{"size":"medium","new":true}"#), false)
            .unwrap();
        let d = engine.get("1").unwrap();
        assert_eq!(d.as_value()["size"], "medium");
        assert_eq!(d.as_value()["new"], true);
        assert_eq!(d.as_value()["color"], "red");
    }

    #[test]
    fn test_delete_missing() {
        let engine = engine_with_docs();
        assert!(matches!(
            engine.delete("nope", false),
            Err(EngineError::DocumentNotFound(_))
        ));
        engine.delete("1", true).unwrap();
        assert_eq!(engine.doc_count(), 2);
    }

    #[test]
    fn test_facets() {
        let engine = engine_with_docs();
        let mut q = QueryField::default();
        q.facets.push("color".into());
        let facets = engine.facets(&q);
        let colors = facets["color"].as_array().unwrap();
        assert_eq!(colors.len(), 2);
        let red = colors.iter().find(|f| f["value"] == "red").unwrap();
        assert_eq!(red["termfreq"], 2);
    }

    #[test]
    fn test_schema() {
        let engine = engine_with_docs();
        let schema = engine.schema();
        assert_eq!(schema["fields"]["color"], "string");
    }

    #[test]
    fn test_stats_track_commits() {
        let engine = engine_with_docs();
        assert_eq!(engine.stats()["uncommitted"], 3);
        engine.commit();
        assert_eq!(engine.stats()["uncommitted"], 0);
        assert_eq!(engine.stats()["commits"], 1);
    }
}
