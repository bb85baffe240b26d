use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// Source formats the normalizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatTag {
    Pdf,
    Docx,
    Markdown,
    Text,
    Csv,
    Json,
}

impl FormatTag {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "md" | "markdown" | "mdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::Text),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file read from disk, not yet normalized.
///
/// `format` is `None` when the extension is not recognized; the normalizer
/// rejects such documents with `UnsupportedFormat`.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub format: Option<FormatTag>,
    pub bytes: Vec<u8>,
}

impl SourceDocument {
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        let path = path.into();
        let format = FormatTag::from_path(&path);
        Self {
            path,
            format,
            bytes,
        }
    }
}

/// Plain text plus its paragraph and section structure.
///
/// Paragraphs are byte ranges into `text`; sections are byte offsets where a
/// new section (heading, page, top-level record group) starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedText {
    text: String,
    paragraphs: Vec<Range<usize>>,
    sections: Vec<usize>,
}

impl NormalizedText {
    pub fn builder() -> NormalizedTextBuilder {
        NormalizedTextBuilder::default()
    }

    /// Splits `text` into paragraphs on blank lines.
    pub fn from_plain(text: &str) -> Self {
        let mut builder = Self::builder();
        let mut current = String::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                builder.push_paragraph(&current);
                current.clear();
                continue;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line.trim_end());
        }
        builder.push_paragraph(&current);
        builder.finish()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sections(&self) -> &[usize] {
        &self.sections
    }

    pub fn paragraph_ranges(&self) -> &[Range<usize>] {
        &self.paragraphs
    }

    pub fn paragraphs(&self) -> impl Iterator<Item = &str> + '_ {
        self.paragraphs.iter().map(|range| &self.text[range.clone()])
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Default)]
pub struct NormalizedTextBuilder {
    inner: NormalizedText,
    section_pending: bool,
}

impl NormalizedTextBuilder {
    /// Marks the next pushed paragraph as the start of a new section.
    pub fn start_section(&mut self) {
        self.section_pending = true;
    }

    /// Appends a paragraph; whitespace-only input is dropped.
    pub fn push_paragraph(&mut self, paragraph: &str) {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            return;
        }
        if !self.inner.text.is_empty() {
            self.inner.text.push_str("\n\n");
        }
        let start = self.inner.text.len();
        if self.section_pending || self.inner.sections.is_empty() {
            self.inner.sections.push(start);
            self.section_pending = false;
        }
        self.inner.text.push_str(paragraph);
        self.inner.paragraphs.push(start..self.inner.text.len());
    }

    pub fn finish(self) -> NormalizedText {
        self.inner
    }
}

/// Identifies the document a chunk was cut from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub path: PathBuf,
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub document: DocumentRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used as a remote tag suffix.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
    pub deck: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl Flashcard {
    pub fn new(front: impl Into<String>, back: impl Into<String>, deck: impl Into<String>) -> Self {
        Self {
            front: front.into(),
            back: back.into(),
            deck: deck.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// SHA-256 over the trimmed front, back and deck, separated by a unit
    /// separator so field boundaries cannot collide.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = sha2::Sha256::new();
        hasher.update(self.front.trim().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.back.trim().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.deck.trim().as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn retarget(&self, deck: &str) -> Self {
        Self {
            deck: deck.to_owned(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    DuplicateSkipped,
    Failed(String),
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::DuplicateSkipped => "duplicate-skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_deck_and_ignores_outer_whitespace() {
        let a = Flashcard::new("What is Paris?", "The capital of France", "Geo");
        let b = Flashcard::new("  What is Paris?", "The capital of France\n", "Geo");
        let c = a.retarget("History");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn fingerprint_field_boundaries_do_not_collide() {
        let a = Flashcard::new("ab", "c", "d");
        let b = Flashcard::new("a", "bc", "d");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn from_plain_records_paragraph_ranges() {
        let text = NormalizedText::from_plain("First line\nsecond line\n\n\n  \nNext paragraph.\n");
        let paragraphs = text.paragraphs().collect::<Vec<_>>();
        assert_eq!(paragraphs, vec!["First line\nsecond line", "Next paragraph."]);
        assert_eq!(text.sections(), &[0]);
        assert_eq!(text.text(), "First line\nsecond line\n\nNext paragraph.");
    }

    #[test]
    fn builder_marks_sections_on_next_paragraph() {
        let mut builder = NormalizedText::builder();
        builder.push_paragraph("intro");
        builder.start_section();
        builder.push_paragraph("   ");
        builder.push_paragraph("Heading");
        builder.push_paragraph("body");
        let text = builder.finish();

        assert_eq!(text.sections(), &[0, "intro\n\n".len()]);
        assert_eq!(text.paragraphs().count(), 3);
    }

    #[test]
    fn empty_tags_are_omitted_from_json() -> anyhow::Result<()> {
        let card = Flashcard::new("Q", "A", "Deck");
        let json = serde_json::to_string(&card)?;
        assert_eq!(json, r#"{"front":"Q","back":"A","deck":"Deck"}"#);
        let back: Flashcard = serde_json::from_str(&json)?;
        assert_eq!(back, card);
        Ok(())
    }
}
