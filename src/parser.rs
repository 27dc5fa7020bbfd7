//! Structural document parsing for markdown, plain-text, and HTML sources.
//!
//! Produces ordered sections tagged with a two-level heading hierarchy:
//! level-1 headings open a new "section", level-2 headings set the
//! "heading", and level-3 headings concatenate onto the current heading.
//! Oversized sections are re-split by greedy sentence packing against a
//! character ceiling, independently of the chunker's token budget.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use scraper::Html;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::RagError;

/// File extensions the parser accepts.
const SUPPORTED_EXTENSIONS: [&str; 4] = ["md", "txt", "html", "htm"];

/// Fragments shorter than this are dropped by the HTML path as
/// non-meaningful content.
const MIN_CONTENT_CHARS: usize = 20;

/// One contiguous content run between heading changes.
#[derive(Debug, Clone)]
pub struct ParsedSection {
    /// Section body text.
    pub content: String,
    /// Path of the source document.
    pub doc_path: String,
    /// Active level-2/3 heading, if any.
    pub heading: Option<String>,
    /// Active level-1 section title, if any.
    pub section: Option<String>,
    /// Parser-provided metadata (file type, line counts, split markers).
    pub metadata: HashMap<String, String>,
}

/// Parses supported documents into heading-tagged sections.
#[derive(Debug, Clone)]
pub struct DocumentParser {
    max_section_chars: usize,
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self {
            max_section_chars: 1000,
        }
    }
}

impl DocumentParser {
    /// Builds a parser with a custom section-size ceiling.
    pub fn new(max_section_chars: usize) -> Self {
        Self { max_section_chars }
    }

    /// Parses a file into ordered sections.
    ///
    /// Unsupported extensions are rejected with [`RagError::Input`] before
    /// any content is read.
    pub fn parse(&self, file_path: &Path) -> Result<Vec<ParsedSection>, RagError> {
        let extension = file_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(RagError::Input(format!(
                "unsupported file format: .{extension} (supported: {})",
                SUPPORTED_EXTENSIONS.join(", ")
            )));
        }

        let content = read_lossy(file_path)?;
        let doc_path = file_path.to_string_lossy().to_string();

        // Plain text shares the markdown path so heading lines in .txt
        // files still produce section/heading provenance.
        let sections = match extension.as_str() {
            "md" | "txt" => self.parse_markdown(&content, &doc_path),
            _ => self.parse_html(&content, &doc_path),
        };
        Ok(self.split_large_sections(sections))
    }

    /// Parses every supported file under `dir`, skipping failures with a
    /// warning. Files are visited in name order for determinism.
    pub fn parse_directory(&self, dir: &Path) -> Vec<ParsedSection> {
        let mut sections = Vec::new();
        for entry in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            match self.parse(entry.path()) {
                Ok(parsed) => sections.extend(parsed),
                Err(err) => warn!(path = %entry.path().display(), error = %err, "skipping file"),
            }
        }
        sections
    }

    /// Parses in-memory markdown (also used for raw-text sections).
    pub fn parse_markdown(&self, content: &str, doc_path: &str) -> Vec<ParsedSection> {
        static HEADING: OnceLock<Regex> = OnceLock::new();
        let heading_re =
            HEADING.get_or_init(|| Regex::new(r"^(#{1,3})\s+(.+)").expect("heading regex"));

        let mut sections = Vec::new();
        let mut current_heading: Option<String> = None;
        let mut current_section: Option<String> = None;
        let mut current_content: Vec<&str> = Vec::new();

        let mut flush = |content: &mut Vec<&str>,
                         heading: &Option<String>,
                         section: &Option<String>,
                         out: &mut Vec<ParsedSection>| {
            if content.iter().all(|line| line.trim().is_empty()) {
                content.clear();
                return;
            }
            let body = content.join("\n").trim().to_string();
            content.clear();
            if body.is_empty() {
                return;
            }
            let metadata = HashMap::from([
                ("file_type".to_string(), "markdown".to_string()),
                (
                    "source_line_count".to_string(),
                    body.lines().count().to_string(),
                ),
            ]);
            out.push(ParsedSection {
                content: body,
                doc_path: doc_path.to_string(),
                heading: heading.clone(),
                section: section.clone(),
                metadata,
            });
        };

        for line in content.lines() {
            if let Some(caps) = heading_re.captures(line) {
                flush(
                    &mut current_content,
                    &current_heading,
                    &current_section,
                    &mut sections,
                );
                let level = caps[1].len();
                let text = caps[2].trim().to_string();
                match level {
                    1 => {
                        current_section = Some(text);
                        current_heading = None;
                    }
                    2 => current_heading = Some(text),
                    _ => {
                        current_heading = Some(join_headings(current_heading.as_deref(), &text));
                    }
                }
                // The heading line opens the next content run.
                current_content.push(line);
            } else {
                current_content.push(line);
            }
        }
        flush(
            &mut current_content,
            &current_heading,
            &current_section,
            &mut sections,
        );

        sections
    }

    fn parse_html(&self, content: &str, doc_path: &str) -> Vec<ParsedSection> {
        let document = Html::parse_document(content);
        let mut sections = Vec::new();
        let mut current_heading: Option<String> = None;
        let mut current_section: Option<String> = None;

        for element in document.root_element().descendent_elements() {
            let tag = element.value().name();
            let text = collect_text(&element);
            match tag {
                "h1" if !text.is_empty() => {
                    current_section = Some(text);
                    current_heading = None;
                }
                "h2" if !text.is_empty() => current_heading = Some(text),
                "h3" if !text.is_empty() => {
                    current_heading = Some(join_headings(current_heading.as_deref(), &text));
                }
                "p" | "li" | "blockquote" | "pre"
                    if text.chars().count() > MIN_CONTENT_CHARS =>
                {
                    let metadata = HashMap::from([
                        ("file_type".to_string(), "html".to_string()),
                        ("html_tag".to_string(), tag.to_string()),
                    ]);
                    sections.push(ParsedSection {
                        content: text,
                        doc_path: doc_path.to_string(),
                        heading: current_heading.clone(),
                        section: current_section.clone(),
                        metadata,
                    });
                }
                _ => {}
            }
        }
        sections
    }

    /// Re-splits any section above the character ceiling by greedily
    /// packing sentences. This bound is independent of the chunker's
    /// token budget; both mechanisms apply on the ingestion path.
    fn split_large_sections(&self, sections: Vec<ParsedSection>) -> Vec<ParsedSection> {
        static TERMINATOR: OnceLock<Regex> = OnceLock::new();
        let terminator_re =
            TERMINATOR.get_or_init(|| Regex::new(r"[.!?]+").expect("terminator regex"));

        let mut result: Vec<ParsedSection> = Vec::new();
        for section in sections {
            if section.content.chars().count() <= self.max_section_chars {
                result.push(section);
                continue;
            }

            let mut parts: Vec<&str> = Vec::new();
            let mut size = 0usize;
            for sentence in terminator_re.split(&section.content) {
                let sentence = sentence.trim();
                if sentence.is_empty() {
                    continue;
                }
                let sentence_chars = sentence.chars().count();
                if size + sentence_chars <= self.max_section_chars {
                    parts.push(sentence);
                    size += sentence_chars;
                } else {
                    if !parts.is_empty() {
                        result.push(split_piece(&section, &parts, result.len()));
                    }
                    parts = vec![sentence];
                    size = sentence_chars;
                }
            }
            if !parts.is_empty() {
                result.push(split_piece(&section, &parts, result.len()));
            }
        }
        result
    }
}

fn split_piece(section: &ParsedSection, parts: &[&str], index: usize) -> ParsedSection {
    let mut metadata = section.metadata.clone();
    metadata.insert("chunk_index".to_string(), index.to_string());
    metadata.insert("is_split_chunk".to_string(), "true".to_string());
    ParsedSection {
        content: format!("{}.", parts.join(". ")),
        doc_path: section.doc_path.clone(),
        heading: section.heading.clone(),
        section: section.section.clone(),
        metadata,
    }
}

/// Concatenates a level-3 heading onto the active level-2 heading.
fn join_headings(current: Option<&str>, next: &str) -> String {
    format!("{} - {}", current.unwrap_or(""), next)
        .trim_matches(|c| c == ' ' || c == '-')
        .to_string()
}

fn collect_text(element: &scraper::ElementRef<'_>) -> String {
    let mut raw = String::new();
    for piece in element.text() {
        raw.push_str(piece);
    }
    raw.trim().to_string()
}

/// Reads a file, tolerating non-UTF-8 bytes via lossy decoding.
fn read_lossy(path: &Path) -> Result<String, RagError> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create temp file");
        file.write_all(body.as_bytes()).expect("write temp file");
        path
    }

    #[test]
    fn rejects_unsupported_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "notes.pdf", "binary-ish");
        let err = DocumentParser::default().parse(&path).unwrap_err();
        assert!(matches!(err, RagError::Input(_)));
        assert!(err.to_string().contains("unsupported file format"));
    }

    #[test]
    fn markdown_heading_hierarchy_is_tracked() {
        let body = "# Getting Started\n\nIntro paragraph for the whole section.\n\n\
                    ## Installation\n\nInstall with the package manager.\n\n\
                    ### From Source\n\nClone the repository and build it.";
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "guide.md", body);
        let sections = DocumentParser::default().parse(&path).unwrap();

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].section.as_deref(), Some("Getting Started"));
        assert_eq!(sections[0].heading, None);
        assert_eq!(sections[1].heading.as_deref(), Some("Installation"));
        assert_eq!(
            sections[2].heading.as_deref(),
            Some("Installation - From Source")
        );
        assert_eq!(sections[2].section.as_deref(), Some("Getting Started"));
    }

    #[test]
    fn level_one_heading_resets_subheading() {
        let body = "# A\n\n## Sub\n\ntext under sub heading here\n\n# B\n\nsecond section body text";
        let sections = DocumentParser::default().parse_markdown(body, "/docs/x.md");
        let last = sections.last().unwrap();
        assert_eq!(last.section.as_deref(), Some("B"));
        assert_eq!(last.heading, None);
    }

    #[test]
    fn orphan_level_three_heading_stands_alone() {
        let sections = DocumentParser::default()
            .parse_markdown("### Lone Detail\n\nBody under the detail heading.", "/x.md");
        assert_eq!(sections[0].heading.as_deref(), Some("Lone Detail"));
    }

    #[test]
    fn oversized_sections_respect_character_ceiling() {
        let sentence = "Sensors report the current joint angle to the controller. ";
        let body = sentence.repeat(60);
        let parser = DocumentParser::new(200);
        let sections = parser.split_large_sections(vec![ParsedSection {
            content: body,
            doc_path: "/docs/big.md".to_string(),
            heading: None,
            section: None,
            metadata: HashMap::new(),
        }]);

        assert!(sections.len() > 1);
        for section in &sections {
            assert!(section.content.chars().count() <= 200 + 1);
            assert_eq!(section.metadata["is_split_chunk"], "true");
        }
    }

    #[test]
    fn html_parsing_tags_headings_and_paragraphs() {
        let body = r#"<html><body>
            <h1>Robotics</h1>
            <p>An introductory paragraph that is long enough to keep.</p>
            <h2>Kinematics</h2>
            <p>Forward kinematics maps joint angles to end-effector pose.</p>
            <p>tiny</p>
        </body></html>"#;
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "page.html", body);
        let sections = DocumentParser::default().parse(&path).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section.as_deref(), Some("Robotics"));
        assert_eq!(sections[0].heading, None);
        assert_eq!(sections[1].heading.as_deref(), Some("Kinematics"));
        assert_eq!(sections[1].metadata["html_tag"], "p");
    }

    #[test]
    fn txt_files_take_the_markdown_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(
            &dir,
            "notes.txt",
            "# Title\n\nBody paragraph under the title.\n\n## Detail\n\nMore body text.",
        );
        let sections = DocumentParser::default().parse(&path).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section.as_deref(), Some("Title"));
        assert_eq!(sections[1].heading.as_deref(), Some("Detail"));
        assert_eq!(sections[1].metadata["file_type"], "markdown");
    }

    #[test]
    fn parse_directory_skips_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        write_temp(&dir, "a.md", "# T\n\nA body paragraph that is long enough.");
        write_temp(&dir, "b.bin", "ignored");
        let sections = DocumentParser::default().parse_directory(dir.path());
        assert_eq!(sections.len(), 1);
    }
}
