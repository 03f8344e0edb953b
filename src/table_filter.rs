//! Table Filter (C7): include/exclude lists and regex patterns, plus
//! metadata-based filtering. See spec §4.6.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::change::Change;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableFilterConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// An accept function over table names. Precedence: explicit excludes >
/// exclude patterns > (if include lists are empty: accept) > explicit
/// includes > include patterns > reject.
pub struct TableFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
}

impl TableFilter {
    pub fn new(config: &TableFilterConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            include_patterns: config
                .include_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            exclude_patterns: config
                .exclude_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn accepts(&self, table: &str) -> bool {
        if self.exclude.iter().any(|t| t == table) {
            return false;
        }
        if self.exclude_patterns.iter().any(|re| re.is_match(table)) {
            return false;
        }
        if self.include.is_empty() && self.include_patterns.is_empty() {
            return true;
        }
        if self.include.iter().any(|t| t == table) {
            return true;
        }
        if self.include_patterns.iter().any(|re| re.is_match(table)) {
            return true;
        }
        false
    }

    /// Removes from a Change sequence any element whose `table` is
    /// rejected.
    pub fn filter_changes(&self, changes: Vec<Change>) -> Vec<Change> {
        changes
            .into_iter()
            .filter(|c| self.accepts(&c.table))
            .collect()
    }
}

/// Metadata about a table an embedder can supply to narrow synchronization
/// further (row count, size, recency) beyond name-based inclusion. This is
/// layered in front of [`TableFilter`] as a separate composable predicate
/// so the name-based precedence rules above stay exactly as specified.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableMetadata {
    pub row_count: Option<u64>,
    pub size_bytes: Option<u64>,
    pub last_modified_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableMetadataFilter {
    pub max_row_count: Option<u64>,
    pub max_size_bytes: Option<u64>,
    pub modified_after_ms: Option<i64>,
}

impl TableMetadataFilter {
    pub fn accepts(&self, meta: &TableMetadata) -> bool {
        if let (Some(max), Some(count)) = (self.max_row_count, meta.row_count) {
            if count > max {
                return false;
            }
        }
        if let (Some(max), Some(size)) = (self.max_size_bytes, meta.size_bytes) {
            if size > max {
                return false;
            }
        }
        if let (Some(after), Some(modified)) = (self.modified_after_ms, meta.last_modified_ms) {
            if modified < after {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> TableFilter {
        TableFilter::new(&TableFilterConfig {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            include_patterns: vec![],
            exclude_patterns: vec![],
        })
        .unwrap()
    }

    #[test]
    fn empty_include_accepts_everything_except_excludes() {
        let f = filter(&[], &["logs"]);
        assert!(f.accepts("users"));
        assert!(f.accepts("products"));
        assert!(!f.accepts("logs"));
    }

    #[test]
    fn explicit_exclude_beats_explicit_include() {
        let f = filter(&["users"], &["users"]);
        assert!(!f.accepts("users"), "explicit excludes must win over explicit includes");
    }

    #[test]
    fn non_included_table_is_rejected_when_includes_present() {
        let f = filter(&["users"], &[]);
        assert!(f.accepts("users"));
        assert!(!f.accepts("products"));
    }

    #[test]
    fn exclude_pattern_beats_include_list() {
        let f = TableFilter::new(&TableFilterConfig {
            include: vec!["audit_logs".to_string()],
            exclude: vec![],
            include_patterns: vec![],
            exclude_patterns: vec!["^audit_".to_string()],
        })
        .unwrap();
        assert!(!f.accepts("audit_logs"));
    }

    #[test]
    fn metadata_filter_rejects_oversized_tables() {
        let f = TableMetadataFilter {
            max_row_count: Some(1000),
            ..Default::default()
        };
        assert!(!f.accepts(&TableMetadata {
            row_count: Some(5000),
            ..Default::default()
        }));
        assert!(f.accepts(&TableMetadata {
            row_count: Some(10),
            ..Default::default()
        }));
    }
}
