//! Sentence-aware document chunking with overlap preservation.
//!
//! Splits raw document text into size-bounded chunks on paragraph
//! boundaries, recursively falling back to sentence and then word splits
//! when a paragraph exceeds the configured budget. Adjacent chunks get an
//! additional interleaved "overlap chunk" carrying the tail of the earlier
//! chunk so retrieval at a chunk boundary does not lose context.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Keyword fragments that mark a chunk as likely containing code.
///
/// Deliberately over-inclusive: prose containing e.g. "the word class size"
/// is flagged too. Downstream consumers treat the flag as a weak hint only.
const CODE_KEYWORDS: [&str; 9] = [
    "def ", "class ", "import ", "from ", "var ", "function ", "int ", "float ", "bool ",
];

/// Tuning knobs for the chunker.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Token budget per chunk; paragraphs above this are split further.
    pub chunk_size: usize,
    /// Number of trailing words copied into each overlap chunk.
    pub overlap_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 900,
            overlap_size: 150,
        }
    }
}

/// A bounded unit of document text, the atom of indexing and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier, a pure function of (path, position).
    pub chunk_id: String,
    /// Identifier shared by every chunk of the same document.
    pub doc_id: String,
    /// Document title, if the caller supplied one.
    pub title: String,
    /// Document path the chunk came from.
    pub path: String,
    /// Chunk body text.
    pub text: String,
    /// Heuristic code-content flag (see [`contains_code`]).
    pub is_code_block: bool,
    /// Body length in characters.
    pub char_count: usize,
    /// Rough token estimate (see [`estimate_tokens`]).
    pub token_estimate: usize,
    /// Nearest level-2/3 heading above the source text, when known.
    pub heading: Option<String>,
    /// Nearest level-1 section above the source text, when known.
    pub section: Option<String>,
    /// Free-form metadata carried through from the parser.
    pub metadata: HashMap<String, String>,
}

/// Splits document text into overlapping, size-bounded chunks.
#[derive(Debug, Clone, Default)]
pub struct DocumentChunker {
    config: ChunkerConfig,
}

impl DocumentChunker {
    /// Builds a chunker with the given configuration.
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunks a whole document body.
    ///
    /// Identical input always yields an identical chunk sequence (same
    /// identifiers, same order), which makes re-ingestion idempotent: the
    /// index overwrites rather than duplicates.
    pub fn chunk(&self, text: &str, path: &str, title: &str) -> Vec<Chunk> {
        self.chunk_with_context(text, path, title, 0, None, None, &HashMap::new())
    }

    /// Chunks one section of a document, carrying heading/section
    /// provenance into every produced chunk.
    ///
    /// `origin` is the section's ordinal within the document and is folded
    /// into chunk identifiers so sections of the same document never
    /// collide. It must be stable across re-ingestions.
    #[allow(clippy::too_many_arguments)]
    pub fn chunk_with_context(
        &self,
        text: &str,
        path: &str,
        title: &str,
        origin: usize,
        heading: Option<&str>,
        section: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Vec<Chunk> {
        let text = strip_frontmatter(text);
        let doc_id = short_hash(path);

        let mut chunks = Vec::new();
        let mut counter = 0usize;
        for (para_idx, paragraph) in text.split("\n\n").enumerate() {
            if paragraph.trim().is_empty() {
                continue;
            }
            for sub in self.split_large_paragraph(paragraph) {
                let body = sub.trim();
                if body.is_empty() {
                    continue;
                }
                chunks.push(Chunk {
                    chunk_id: short_hash(&format!("{path}:{origin}:{para_idx}:{counter}")),
                    doc_id: doc_id.clone(),
                    title: title.to_string(),
                    path: path.to_string(),
                    is_code_block: contains_code(body),
                    char_count: body.chars().count(),
                    token_estimate: estimate_tokens(body),
                    text: body.to_string(),
                    heading: heading.map(str::to_string),
                    section: section.map(str::to_string),
                    metadata: metadata.clone(),
                });
                counter += 1;
            }
        }

        self.apply_sliding_window(chunks)
    }

    /// Splits a paragraph that exceeds the token budget, first by sentence
    /// boundaries, then by words when a single sentence is still too large.
    fn split_large_paragraph(&self, text: &str) -> Vec<String> {
        if estimate_tokens(text) <= self.config.chunk_size {
            return vec![text.to_string()];
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        for sentence in split_sentences(text) {
            if estimate_tokens(&format!("{current} {sentence}")) <= self.config.chunk_size {
                if current.is_empty() {
                    current.push_str(sentence);
                } else {
                    current.push(' ');
                    current.push_str(sentence);
                }
            } else {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                current = sentence.to_string();
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        // A single sentence can still blow the budget; fall back to word
        // packing so every emitted piece respects the bound.
        if chunks
            .iter()
            .any(|chunk| estimate_tokens(chunk) > self.config.chunk_size)
        {
            let mut finals = Vec::new();
            for chunk in chunks {
                if estimate_tokens(&chunk) > self.config.chunk_size {
                    finals.extend(self.split_by_words(&chunk));
                } else {
                    finals.push(chunk);
                }
            }
            return finals;
        }

        chunks
    }

    /// Packs whitespace-delimited words into pieces whose token estimate
    /// stays within the budget.
    fn split_by_words(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_chars = 0usize;

        for word in text.split_whitespace() {
            let word_chars = word.chars().count();
            let next_chars = if current.is_empty() {
                word_chars
            } else {
                current_chars + 1 + word_chars
            };
            let next_estimate = (next_chars / 4).max(current.len() + 1);
            if !current.is_empty() && next_estimate > self.config.chunk_size {
                chunks.push(current.join(" "));
                current.clear();
                current.push(word);
                current_chars = word_chars;
            } else {
                current.push(word);
                current_chars = next_chars;
            }
        }
        if !current.is_empty() {
            chunks.push(current.join(" "));
        }

        chunks
    }

    /// Interleaves overlap chunks behind every non-final chunk.
    ///
    /// The overlap chunk duplicates the trailing `overlap_size` words of
    /// its source so a query landing near a chunk boundary still retrieves
    /// the surrounding context.
    fn apply_sliding_window(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        if chunks.len() <= 1 {
            return chunks;
        }

        let last = chunks.len() - 1;
        let mut result = Vec::with_capacity(chunks.len() * 2);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let overlap = if i < last {
                let words: Vec<&str> = chunk.text.split_whitespace().collect();
                let start = words.len().saturating_sub(self.config.overlap_size);
                let tail = words[start..].join(" ");
                (!tail.is_empty()).then(|| Chunk {
                    chunk_id: format!("{}_overlap_{}", chunk.chunk_id, i),
                    doc_id: chunk.doc_id.clone(),
                    title: chunk.title.clone(),
                    path: chunk.path.clone(),
                    is_code_block: contains_code(&tail),
                    char_count: tail.chars().count(),
                    token_estimate: estimate_tokens(&tail),
                    text: tail,
                    heading: chunk.heading.clone(),
                    section: chunk.section.clone(),
                    metadata: chunk.metadata.clone(),
                })
            } else {
                None
            };
            result.push(chunk);
            if let Some(overlap) = overlap {
                result.push(overlap);
            }
        }
        result
    }
}

/// Estimates the token count of a text.
///
/// `max(char_count / 4, word_count)` is deliberately crude but must stay
/// exactly this formula for parity with existing indexes.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(text.split_whitespace().count())
}

/// Heuristic code detection: backticks or any of a fixed keyword list,
/// case-insensitively. Over-inclusive on prose by design.
pub fn contains_code(text: &str) -> bool {
    if text.contains("```") || text.contains('`') {
        return true;
    }
    let lowered = text.to_lowercase();
    CODE_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

/// Drops a leading `---`-delimited frontmatter block, if present.
pub fn strip_frontmatter(text: &str) -> &str {
    if text.starts_with("---") {
        let parts: Vec<&str> = text.splitn(3, "---").collect();
        if parts.len() == 3 {
            return parts[2];
        }
    }
    text
}

/// Splits on terminal punctuation followed by spaces, keeping the
/// punctuation attached to the preceding sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    static BOUNDARY: OnceLock<Regex> = OnceLock::new();
    let re = BOUNDARY.get_or_init(|| Regex::new(r"[.!?] +").expect("sentence boundary regex"));

    let mut sentences = Vec::new();
    let mut start = 0;
    for m in re.find_iter(text) {
        // Terminal punctuation is a single ASCII byte.
        sentences.push(&text[start..m.start() + 1]);
        start = m.end();
    }
    sentences.push(&text[start..]);
    sentences
}

/// SHA-256 of the input, hex-encoded and truncated to 16 characters.
///
/// Pure function of its input: no counters, no process state, so
/// identifiers survive restarts and re-ingestions unchanged.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> DocumentChunker {
        DocumentChunker::default()
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "First paragraph about robots.\n\nSecond paragraph about sensors.";
        let a = chunker().chunk(text, "/docs/intro.md", "Intro");
        let b = chunker().chunk(text, "/docs/intro.md", "Intro");
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.chunk_id, y.chunk_id);
            assert_eq!(x.text, y.text);
        }
    }

    #[test]
    fn identifiers_depend_on_path() {
        let text = "Same body text.";
        let a = chunker().chunk(text, "/docs/a.md", "");
        let b = chunker().chunk(text, "/docs/b.md", "");
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
        assert_ne!(a[0].doc_id, b[0].doc_id);
    }

    #[test]
    fn token_estimate_formula() {
        for text in [
            "one two three",
            "supercalifragilisticexpialidocious",
            "",
            "a b c d e f g h i j k l m n o p",
        ] {
            assert_eq!(
                estimate_tokens(text),
                (text.chars().count() / 4).max(text.split_whitespace().count()),
            );
        }
    }

    #[test]
    fn size_bound_holds_for_long_prose() {
        let sentence = "The actuator converts electrical energy into precise joint motion. ";
        let paragraph = sentence.repeat(400);
        let chunks = chunker().chunk(&paragraph, "/docs/long.md", "");
        for chunk in chunks.iter().filter(|c| !c.chunk_id.contains("_overlap_")) {
            assert!(
                chunk.token_estimate <= 900,
                "chunk exceeded budget: {}",
                chunk.token_estimate
            );
        }
    }

    #[test]
    fn size_bound_holds_for_single_word_runs() {
        // One giant "sentence" with no terminal punctuation forces the
        // word-packing fallback.
        let pathological = "gearbox ".repeat(8000);
        let chunks = chunker().chunk(&pathological, "/docs/words.md", "");
        assert!(chunks.len() > 1);
        for chunk in chunks.iter().filter(|c| !c.chunk_id.contains("_overlap_")) {
            assert!(chunk.token_estimate <= 900);
        }
    }

    #[test]
    fn overlap_chunk_is_trailing_words_of_predecessor() {
        let config = ChunkerConfig {
            chunk_size: 900,
            overlap_size: 3,
        };
        let text = "alpha beta gamma delta epsilon.\n\nzeta eta theta iota kappa.";
        let chunks = DocumentChunker::new(config).chunk(text, "/docs/pair.md", "");
        // chunk A, overlap(A), chunk B
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].chunk_id.ends_with("_overlap_0"));
        let tail: Vec<&str> = chunks[0].text.split_whitespace().rev().take(3).collect();
        let expected: Vec<&str> = tail.into_iter().rev().collect();
        assert_eq!(chunks[1].text, expected.join(" "));
    }

    #[test]
    fn overlap_chunks_are_interleaved_not_appended() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunker().chunk(text, "/docs/three.md", "");
        assert_eq!(chunks.len(), 5);
        assert!(!chunks[0].chunk_id.contains("_overlap_"));
        assert!(chunks[1].chunk_id.starts_with(&chunks[0].chunk_id));
        assert!(!chunks[2].chunk_id.contains("_overlap_"));
        assert!(chunks[3].chunk_id.starts_with(&chunks[2].chunk_id));
        assert!(!chunks[4].chunk_id.contains("_overlap_"));
    }

    #[test]
    fn frontmatter_is_stripped() {
        let text = "---\nsidebar_position: 1\n---\n\nActual body text here.";
        let chunks = chunker().chunk(text, "/docs/fm.md", "");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Actual body text here.");
    }

    #[test]
    fn dangling_frontmatter_fence_is_kept() {
        let text = "--- not actually frontmatter";
        assert_eq!(strip_frontmatter(text), text);
    }

    #[test]
    fn code_detection_flags_keywords_and_backticks() {
        assert!(contains_code("use def foo(): pass"));
        assert!(contains_code("run `cargo test` locally"));
        assert!(contains_code("```rust\nfn main() {}\n```"));
    }

    #[test]
    fn code_detection_keeps_known_false_positives() {
        // "class " appears in plain prose; the heuristic is intentionally
        // over-inclusive and this behavior is part of the contract.
        assert!(contains_code("the word class size is large"));
        assert!(!contains_code("nothing suspicious here"));
    }

    #[test]
    fn sentence_splitting_keeps_punctuation() {
        let pieces = split_sentences("One. Two! Three? Four");
        assert_eq!(pieces, vec!["One.", "Two!", "Three?", "Four"]);
    }

    #[test]
    fn section_context_flows_into_chunks() {
        let meta = HashMap::from([("file_type".to_string(), "markdown".to_string())]);
        let chunks = chunker().chunk_with_context(
            "Body of the section.",
            "/docs/ctx.md",
            "Ctx",
            2,
            Some("Install"),
            Some("Getting Started"),
            &meta,
        );
        assert_eq!(chunks[0].heading.as_deref(), Some("Install"));
        assert_eq!(chunks[0].section.as_deref(), Some("Getting Started"));
        assert_eq!(chunks[0].metadata["file_type"], "markdown");
    }

    #[test]
    fn distinct_sections_never_collide() {
        let a = chunker().chunk_with_context("Same text.", "/d.md", "", 0, None, None, &HashMap::new());
        let b = chunker().chunk_with_context("Same text.", "/d.md", "", 1, None, None, &HashMap::new());
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
        assert_eq!(a[0].doc_id, b[0].doc_id);
    }
}
