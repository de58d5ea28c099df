//! Process-wide file metadata index and the associative matcher seam
//!
//! The index maps absolute paths to descriptive metadata strings; writes
//! happen during indexing, reads on every fresh-context resolution. The
//! real ranking service is external; LexicalMatcher is the in-process
//! stand-in that scores descriptions by token overlap.

use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use taskloom_core::{
    AssociativeMatchResult, ContextGenerationInput, MatchContentType, MatchItem,
};

pub struct FileIndex {
    entries: DashMap<PathBuf, String>,
}

impl Default for FileIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or overwrite an entry. Keys must be absolute.
    pub fn insert(
        &self,
        path: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> Result<(), String> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(format!(
                "index keys must be absolute paths, got '{}'",
                path.display()
            ));
        }
        self.entries.insert(path, description.into());
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        self.entries.get(path).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, sorted by path for deterministic iteration.
    pub fn snapshot(&self) -> Vec<(PathBuf, String)> {
        let mut entries: Vec<(PathBuf, String)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Opaque associative-match service: query in, `(path, score)` pairs out.
#[async_trait::async_trait]
pub trait Matcher: Send + Sync {
    async fn find_matches(
        &self,
        input: &ContextGenerationInput,
        index: &FileIndex,
    ) -> AssociativeMatchResult;
}

pub(crate) fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub(crate) fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Token-overlap matcher over index descriptions.
pub struct LexicalMatcher {
    pub max_results: usize,
}

impl Default for LexicalMatcher {
    fn default() -> Self {
        Self { max_results: 20 }
    }
}

#[async_trait::async_trait]
impl Matcher for LexicalMatcher {
    async fn find_matches(
        &self,
        input: &ContextGenerationInput,
        index: &FileIndex,
    ) -> AssociativeMatchResult {
        let mut query_text = input.query.clone();
        if let Some(history) = &input.history {
            query_text.push(' ');
            query_text.push_str(history);
        }
        for value in input.inputs.values() {
            if let Some(s) = value.as_str() {
                query_text.push(' ');
                query_text.push_str(s);
            }
        }
        let query_tokens = tokenize(&query_text);

        let mut scored: Vec<MatchItem> = index
            .snapshot()
            .into_iter()
            .filter_map(|(path, description)| {
                let mut doc = tokenize(&description);
                doc.extend(tokenize(&path.display().to_string()));
                let score = jaccard(&query_tokens, &doc);
                if score > 0.0 {
                    Some(MatchItem {
                        id: path.display().to_string(),
                        content_type: MatchContentType::FilePathOnly,
                        content: None,
                        source_path: Some(path),
                        relevance_score: score,
                    })
                } else {
                    None
                }
            })
            .collect();

        // Score descending, ties broken by path lexical order.
        scored.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        scored.truncate(self.max_results);

        AssociativeMatchResult {
            context_summary: format!("{} file(s) matched '{}'", scored.len(), input.query),
            matches: scored,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_rejects_relative_paths() {
        let index = FileIndex::new();
        assert!(index.insert("relative/path.rs", "desc").is_err());
        assert!(index.insert("/abs/path.rs", "desc").is_ok());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn insert_overwrites() {
        let index = FileIndex::new();
        index.insert("/a.rs", "first").unwrap();
        index.insert("/a.rs", "second").unwrap();
        assert_eq!(index.get(Path::new("/a.rs")).as_deref(), Some("second"));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn matcher_ranks_by_overlap() {
        let index = FileIndex::new();
        index
            .insert("/src/parser.rs", "tokeniser and parser for expressions")
            .unwrap();
        index
            .insert("/src/net.rs", "network sockets and connections")
            .unwrap();

        let matcher = LexicalMatcher::default();
        let result = matcher
            .find_matches(
                &ContextGenerationInput::query("expression parser tokeniser"),
                &index,
            )
            .await;

        assert!(!result.matches.is_empty());
        assert_eq!(
            result.matches[0].source_path.as_deref(),
            Some(Path::new("/src/parser.rs"))
        );
        for window in result.matches.windows(2) {
            assert!(window[0].relevance_score >= window[1].relevance_score);
        }
    }

    #[tokio::test]
    async fn matcher_breaks_ties_lexically() {
        let index = FileIndex::new();
        index.insert("/b.rs", "alpha beta").unwrap();
        index.insert("/a.rs", "alpha beta").unwrap();

        let matcher = LexicalMatcher::default();
        let result = matcher
            .find_matches(&ContextGenerationInput::query("alpha"), &index)
            .await;
        let paths: Vec<_> = result
            .matches
            .iter()
            .map(|m| m.source_path.clone().unwrap())
            .collect();
        assert_eq!(paths, vec![PathBuf::from("/a.rs"), PathBuf::from("/b.rs")]);
    }
}
