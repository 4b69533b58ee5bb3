//! Query parameters consumed by the routers.

/// Expansion controls for fuzzy and nearest matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimilarField {
    pub enabled: bool,
    pub n_rset: u32,
    pub n_eset: u32,
    pub n_term: u32,
    pub field: Vec<String>,
    pub types: Vec<String>,
}

/// Every parameter the HTTP and binary routers accept for a request.
///
/// Defaults match the lookup semantics: a range id sorts by `_id` with
/// limit 10, a plain id is a unique-document lookup with limit 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryField {
    pub pretty: bool,
    pub offset: u32,
    pub limit: u32,
    pub check_at_least: u32,
    pub spelling: bool,
    pub synonyms: bool,
    pub commit: bool,
    pub unique_doc: bool,
    pub collapse: Option<String>,
    pub collapse_max: u32,
    pub query: Vec<String>,
    pub partial: Vec<String>,
    pub terms: Vec<String>,
    pub sort: Vec<String>,
    pub facets: Vec<String>,
    pub language: Vec<String>,
    pub fuzzy: SimilarField,
    pub nearest: SimilarField,
    // _stats selectors
    pub server: bool,
    pub database: bool,
    pub document: String,
    pub stats: String,
}

impl Default for QueryField {
    fn default() -> Self {
        Self {
            pretty: false,
            offset: 0,
            limit: 10,
            check_at_least: 0,
            spelling: true,
            synonyms: false,
            commit: false,
            unique_doc: false,
            collapse: None,
            collapse_max: 1,
            query: Vec::new(),
            partial: Vec::new(),
            terms: Vec::new(),
            sort: Vec::new(),
            facets: Vec::new(),
            language: Vec::new(),
            fuzzy: SimilarField::default(),
            nearest: SimilarField::default(),
            server: false,
            database: false,
            document: String::new(),
            stats: String::new(),
        }
    }
}

impl QueryField {
    /// Defaults for a unique-document lookup (a plain id path).
    pub fn unique_doc() -> Self {
        Self {
            limit: 1,
            unique_doc: true,
            ..Default::default()
        }
    }

    /// Defaults for a range-id lookup: multi-result, sorted by `_id`.
    pub fn id_range() -> Self {
        Self {
            sort: vec![crate::RESERVED_ID.to_string()],
            ..Default::default()
        }
    }
}

/// Whether an id path segment denotes a range (`lo..hi`) rather than a
/// single document.
pub fn is_range(id: &str) -> bool {
    id.contains("..")
}

/// Splits a range id into its bounds; empty bounds are open.
pub fn parse_range(id: &str) -> Option<(&str, &str)> {
    id.split_once("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_doc_defaults() {
        let q = QueryField::unique_doc();
        assert_eq!(q.limit, 1);
        assert!(q.unique_doc);
        assert_eq!(q.offset, 0);
        assert_eq!(q.check_at_least, 0);
    }

    #[test]
    fn test_range_defaults_sort_by_id() {
        let q = QueryField::id_range();
        assert_eq!(q.sort, vec!["_id".to_string()]);
        assert_eq!(q.limit, 10);
        assert!(!q.unique_doc);
    }

    #[test]
    fn test_is_range() {
        assert!(is_range("1..10"));
        assert!(is_range("a.."));
        assert!(!is_range("doc-1"));
        assert_eq!(parse_range("1..10"), Some(("1", "10")));
        assert_eq!(parse_range("..5"), Some(("", "5")));
        assert_eq!(parse_range("plain"), None);
    }
}
