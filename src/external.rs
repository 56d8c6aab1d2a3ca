//! External collaborator seams - summarization and similarity search
//!
//! The core calls these through narrow traits; the reference implementations
//! here are deliberately simple stand-ins (a real deployment would back them
//! with a model call and a vector index).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::protocol::Citation;

/// A ranked piece of context returned by the search collaborator
#[derive(Debug, Clone)]
pub struct ContextSnippet {
    pub id: String,
    pub score: f64,
    pub text: String,
}

/// Output of the summarization collaborator for one chunk
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub bullets: Vec<String>,
    pub key_terms: Vec<String>,
    pub citations: Vec<Citation>,
}

/// Similarity search used to build context for summarization
#[async_trait]
pub trait ContextSearch: Send + Sync {
    /// Make a document's chunks available for later lookups
    async fn index(&self, document_id: &str, chunks: &[String]);

    /// Up to `k` snippets ranked by relevance to `query`
    async fn search(&self, query: &str, k: usize) -> Vec<ContextSnippet>;
}

/// Summarization of a chunk given its context snippets
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, chunk_text: &str, context: &[ContextSnippet]) -> Summary;
}

struct IndexedChunk {
    text: String,
    words: HashSet<String>,
}

/// Word-overlap similarity over an in-memory chunk index
#[derive(Default)]
pub struct LexicalSearch {
    index: RwLock<HashMap<String, IndexedChunk>>,
}

impl LexicalSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ContextSearch for LexicalSearch {
    async fn index(&self, document_id: &str, chunks: &[String]) {
        let mut index = self.index.write();
        for (i, chunk) in chunks.iter().enumerate() {
            index.insert(
                format!("{document_id}_chunk_{i}"),
                IndexedChunk {
                    text: chunk.clone(),
                    words: word_set(chunk),
                },
            );
        }
    }

    async fn search(&self, query: &str, k: usize) -> Vec<ContextSnippet> {
        let query_words = word_set(query);
        let index = self.index.read();

        let mut ranked: Vec<ContextSnippet> = index
            .iter()
            .map(|(id, chunk)| {
                let overlap = query_words.intersection(&chunk.words).count();
                let union = query_words.union(&chunk.words).count();
                let score = if union > 0 {
                    overlap as f64 / union as f64
                } else {
                    0.0
                };
                ContextSnippet {
                    id: id.clone(),
                    score,
                    text: chunk.text.clone(),
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(k);
        ranked
    }
}

/// Truncating extractive summarizer
///
/// Bullets are the chunk's first sentence fragments; key terms are the long
/// lowercase-normalized words; citations point back at the context snippets.
pub struct ExtractiveSummarizer {
    max_bullets: usize,
    min_term_len: usize,
}

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_bullets: 6,
            min_term_len: 7,
        }
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, chunk_text: &str, context: &[ContextSnippet]) -> Summary {
        let bullets: Vec<String> = chunk_text
            .split(&['.', '!', '?'][..])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(self.max_bullets)
            .map(str::to_string)
            .collect();

        let mut seen = HashSet::new();
        let key_terms: Vec<String> = chunk_text
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| w.len() >= self.min_term_len && seen.insert(w.clone()))
            .collect();

        let citations = context
            .iter()
            .map(|s| Citation {
                snippet_id: s.id.clone(),
                score: s.score,
            })
            .collect();

        Summary {
            bullets,
            key_terms,
            citations,
        }
    }
}
