//! Splits normalized text into budget-bounded chunks.

use crate::formats::{Chunk, DocumentRef, NormalizedText};

/// Rough characters-per-token ratio used to convert a token budget into a
/// character limit.
pub const CHARS_PER_TOKEN: usize = 4;

const PARAGRAPH_SEPARATOR: &str = "\n\n";

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_tokens: usize,
}

impl Chunker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }

    /// Lazily chunks `text`. Calling this again on the same input yields the
    /// same sequence; chunk indices start at `first_index`.
    pub fn chunks<'a>(
        &self,
        text: &'a NormalizedText,
        document: DocumentRef,
        first_index: usize,
    ) -> Chunks<'a> {
        Chunks {
            pieces: Pieces::new(text, self.max_chars()),
            pending: None,
            max_chars: self.max_chars(),
            document,
            next_index: first_index,
        }
    }
}

/// Iterator over the chunks of one document.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    pieces: Pieces<'a>,
    pending: Option<&'a str>,
    max_chars: usize,
    document: DocumentRef,
    next_index: usize,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let mut text = String::new();
        let mut len = 0usize;

        loop {
            let Some(piece) = self.pending.take().or_else(|| self.pieces.next()) else {
                break;
            };
            let piece_len = piece.chars().count();
            let needed = if text.is_empty() {
                piece_len
            } else {
                len + PARAGRAPH_SEPARATOR.len() + piece_len
            };

            if needed > self.max_chars && !text.is_empty() {
                self.pending = Some(piece);
                break;
            }

            if !text.is_empty() {
                text.push_str(PARAGRAPH_SEPARATOR);
            }
            text.push_str(piece);
            len = needed;
        }

        if text.is_empty() {
            return None;
        }

        let chunk = Chunk {
            index: self.next_index,
            text,
            document: self.document.clone(),
        };
        self.next_index += 1;
        Some(chunk)
    }
}

/// Yields paragraphs, or budget-sized fragments of paragraphs that are too
/// long on their own.
#[derive(Debug, Clone)]
struct Pieces<'a> {
    paragraphs: std::vec::IntoIter<&'a str>,
    fragments: std::vec::IntoIter<&'a str>,
    max_chars: usize,
}

impl<'a> Pieces<'a> {
    fn new(text: &'a NormalizedText, max_chars: usize) -> Self {
        Self {
            paragraphs: text.paragraphs().collect::<Vec<_>>().into_iter(),
            fragments: Vec::new().into_iter(),
            max_chars,
        }
    }
}

impl<'a> Iterator for Pieces<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        loop {
            if let Some(fragment) = self.fragments.next() {
                return Some(fragment);
            }
            let paragraph = self.paragraphs.next()?;
            if paragraph.chars().count() <= self.max_chars {
                return Some(paragraph);
            }
            tracing::debug!(
                chars = paragraph.chars().count(),
                max_chars = self.max_chars,
                "paragraph exceeds chunk budget; splitting"
            );
            self.fragments = split_oversized(paragraph, self.max_chars).into_iter();
        }
    }
}

/// Splits one paragraph at sentence boundaries, falling back to hard
/// character cuts for sentences longer than `max_chars`.
fn split_oversized(paragraph: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut start_chars = 0usize;
    let mut last_fit: Option<(usize, usize)> = None;

    for (end, end_chars) in sentence_ends(paragraph) {
        let candidate = end_chars - start_chars;
        if candidate <= max_chars {
            last_fit = Some((end, end_chars));
            continue;
        }

        if let Some((fit, fit_chars)) = last_fit.take() {
            push_trimmed(&mut out, &paragraph[start..fit]);
            start = fit;
            start_chars = fit_chars;
        }

        if end_chars - start_chars <= max_chars {
            last_fit = Some((end, end_chars));
        } else {
            hard_split(&mut out, &paragraph[start..end], max_chars);
            start = end;
            start_chars = end_chars;
        }
    }

    if start < paragraph.len() {
        push_trimmed(&mut out, &paragraph[start..]);
    }
    out
}

/// Byte and char offsets just past each sentence terminator, plus the end of
/// the paragraph.
fn sentence_ends(paragraph: &str) -> Vec<(usize, usize)> {
    let mut ends = Vec::new();
    let mut chars = paragraph.char_indices().enumerate().peekable();
    while let Some((char_idx, (byte_idx, ch))) = chars.next() {
        let terminator = matches!(ch, '.' | '!' | '?' | '。' | '！' | '？');
        let followed_by_space = chars
            .peek()
            .map(|(_, (_, next))| next.is_whitespace())
            .unwrap_or(false);
        if terminator && followed_by_space {
            ends.push((byte_idx + ch.len_utf8(), char_idx + 1));
        }
    }
    let total_chars = paragraph.chars().count();
    if ends.last().map(|(b, _)| *b) != Some(paragraph.len()) {
        ends.push((paragraph.len(), total_chars));
    }
    ends
}

fn hard_split<'a>(out: &mut Vec<&'a str>, text: &'a str, max_chars: usize) {
    let text = text.trim();
    let mut start = 0usize;
    let mut count = 0usize;
    for (byte_idx, _) in text.char_indices() {
        if count == max_chars {
            push_trimmed(out, &text[start..byte_idx]);
            start = byte_idx;
            count = 0;
        }
        count += 1;
    }
    push_trimmed(out, &text[start..]);
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, piece: &'a str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece);
    }
}
