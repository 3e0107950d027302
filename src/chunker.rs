//! Overlapping character windows over document text.
//!
//! Windows hold at most `chunk_size` characters and consecutive windows of a
//! document share `overlap` characters. A window that would cut through text
//! is pulled back to the last paragraph break, sentence end, newline or
//! space found in its final two thirds, but never to `overlap` characters or
//! fewer.

use ragdex_core::{Chunk, Error, Result};

use crate::source::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if overlap >= chunk_size {
            return Err(Error::Config(format!(
                "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    /// Chunks of one document, ordinals from 0. Every chunk carries a copy of
    /// the document metadata.
    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        self.spans(&doc.text)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (text, start, end))| {
                Chunk::new(
                    doc.id.clone(),
                    ordinal as u32,
                    text,
                    start,
                    end,
                    doc.metadata.clone(),
                )
            })
            .collect()
    }

    /// `(text, start, end)` windows; offsets count characters of `text`.
    pub fn spans(&self, text: &str) -> Vec<(String, usize, usize)> {
        let chars: Vec<char> = text.chars().collect();
        let Some(first) = chars.iter().position(|c| !c.is_whitespace()) else {
            return Vec::new();
        };
        let last = chars
            .iter()
            .rposition(|c| !c.is_whitespace())
            .map_or(first, |p| p + 1);

        let mut spans = Vec::new();
        let mut start = first;
        loop {
            let limit = (start + self.chunk_size).min(last);
            let end = if limit < last {
                find_break_point(&chars[start..limit], self.overlap)
                    .map(|offset| start + offset)
                    .unwrap_or(limit)
            } else {
                limit
            };

            let window: String = chars[start..end].iter().collect();
            if !window.trim().is_empty() {
                spans.push((window, start, end));
            }
            if end >= last {
                break;
            }

            // end - start > overlap here, so the next window still advances
            start = end - self.overlap;
        }
        spans
    }
}

/// Offset just past the best break in `window`, searching only its final
/// two thirds and only past `floor`.
fn find_break_point(window: &[char], floor: usize) -> Option<usize> {
    let min = (window.len() / 3).max(floor);
    let after = |pos: usize| (pos > min).then_some(pos);

    // paragraph
    if let Some(pos) = window.windows(2).rposition(|w| w == ['\n', '\n']) {
        if let Some(end) = after(pos + 2) {
            return Some(end);
        }
    }
    // sentence
    if let Some(pos) = window
        .windows(2)
        .rposition(|w| matches!(w[0], '.' | '!' | '?') && w[1].is_whitespace())
    {
        if let Some(end) = after(pos + 2) {
            return Some(end);
        }
    }
    if let Some(pos) = window.iter().rposition(|&c| c == '\n') {
        if let Some(end) = after(pos + 1) {
            return Some(end);
        }
    }
    window
        .iter()
        .rposition(|c| c.is_whitespace())
        .and_then(|pos| after(pos + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragdex_core::{Metadata, MetadataValue};

    fn doc(text: &str) -> Document {
        let mut metadata = Metadata::new();
        metadata.insert("file_name".into(), "a.txt".into());
        Document {
            id: "a.txt".into(),
            text: text.into(),
            metadata,
        }
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(Chunker::new(0, 0), Err(Error::Config(_))));
        assert!(matches!(Chunker::new(10, 10), Err(Error::Config(_))));
        assert!(matches!(Chunker::new(10, 20), Err(Error::Config(_))));
        assert!(Chunker::new(10, 9).is_ok());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunker = Chunker::new(100, 10).unwrap();
        let chunks = chunker.chunk(&doc("  Hello world  "));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world");
        assert_eq!((chunks[0].start, chunks[0].end), (2, 13));
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(
            chunks[0].metadata.get("file_name"),
            Some(&MetadataValue::Text("a.txt".into()))
        );
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let chunker = Chunker::new(100, 10).unwrap();
        assert!(chunker.chunk(&doc("   \n\t ")).is_empty());
        assert!(chunker.chunk(&doc("")).is_empty());
    }

    #[test]
    fn test_windows_overlap_and_respect_size() {
        let text = "This is a test. ".repeat(100);
        let chunker = Chunker::new(200, 50).unwrap();
        let spans = chunker.spans(&text);
        let chars: Vec<char> = text.chars().collect();

        assert!(spans.len() > 1);
        for (window, start, end) in &spans {
            assert!(end - start <= 200);
            let expected: String = chars[*start..*end].iter().collect();
            assert_eq!(window, &expected);
        }
        for pair in spans.windows(2) {
            assert_eq!(pair[1].1, pair[0].2 - 50);
        }
        assert_eq!(spans.last().unwrap().2, text.trim_end().chars().count());
    }

    #[test]
    fn test_large_overlap_is_kept_across_breaks() {
        let text = "Aaaa bbbb cccc. Dddd eeee ffff. Gggg hhhh iiii.\n".repeat(4);
        let chunker = Chunker::new(30, 20).unwrap();
        let spans = chunker.spans(&text);

        assert!(spans.len() > 2);
        for pair in spans.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(next.1 > prev.1, "windows must advance");
            assert_eq!(prev.2 - next.1, 20, "{prev:?} / {next:?}");
            assert!(prev.2 - prev.1 <= 30);
        }
        assert_eq!(spans.last().unwrap().2, text.trim_end().chars().count());
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = format!("{} End here. {}", "word ".repeat(10), "tail ".repeat(10));
        let chunker = Chunker::new(70, 5).unwrap();
        let spans = chunker.spans(&text);
        assert!(spans[0].0.ends_with("End here. "));
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a b c d e f g h i j k l m n o p q r s t.", "second paragraph ".repeat(5));
        let chunker = Chunker::new(60, 0).unwrap();
        let spans = chunker.spans(&text);
        assert!(spans[0].0.ends_with("\n\n"));
        assert!(spans[1].0.starts_with("second"));
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let text = "é".repeat(25);
        let chunker = Chunker::new(10, 2).unwrap();
        let spans = chunker.spans(&text);
        assert!(spans.iter().all(|(w, s, e)| w.chars().count() == e - s && e - s <= 10));
        assert_eq!(spans.last().unwrap().2, 25);
    }

    #[test]
    fn test_chunk_ids_are_stable() {
        let chunker = Chunker::new(20, 5).unwrap();
        let text = "one two three four five six seven eight nine ten";
        let a: Vec<_> = chunker.chunk(&doc(text)).into_iter().map(|c| c.id).collect();
        let b: Vec<_> = chunker.chunk(&doc(text)).into_iter().map(|c| c.id).collect();
        assert_eq!(a, b);
        let mut unique = a.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), a.len());
    }
}
