//! Fixed-size character windows with overlap.

use rayon::prelude::*;

use crate::document::{Chunk, ChunkId, DocId};
use crate::error::{RagError, Result};

/// Text of one page, 1-based.
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// Char-index windows `[start, end)` the chunker slides over `text`.
/// The last window may be shorter.
pub fn windows(char_len: usize, chunk_size: usize, overlap: usize) -> Result<Vec<(usize, usize)>> {
    if overlap == 0 || overlap >= chunk_size {
        return Err(RagError::InvalidChunking { chunk_size, overlap });
    }
    let step = chunk_size - overlap;
    Ok((0..char_len)
        .step_by(step)
        .map(|start| (start, (start + chunk_size).min(char_len)))
        .collect())
}

/// Splits `text` into windows of `chunk_size` characters advancing by
/// `chunk_size - overlap`, trimming each and dropping the empty ones.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    // byte offset of every char, plus the end of the string
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let char_len = offsets.len();
    offsets.push(text.len());

    let chunks = windows(char_len, chunk_size, overlap)?
        .into_iter()
        .filter_map(|(start, end)| {
            let window = text[offsets[start]..offsets[end]].trim();
            (!window.is_empty()).then(|| window.to_string())
        })
        .collect();
    Ok(chunks)
}

/// Chunks every page of one document, tagging each chunk with provenance.
/// Pages are processed in parallel; output keeps page order.
pub fn chunk_pages(
    doc_id: DocId,
    source_file: &str,
    pages: &[Page],
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    let per_page = pages
        .par_iter()
        .map(|page| -> Result<Vec<Chunk>> {
            let texts = chunk_text(&page.text, chunk_size, overlap)?;
            Ok(texts
                .into_iter()
                .enumerate()
                .map(|(ordinal, text)| Chunk {
                    id: ChunkId::derive(doc_id, page.number, ordinal, &text),
                    text,
                    doc_id,
                    source_file: source_file.to_string(),
                    page: page.number,
                })
                .collect())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(per_page.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_trimmed_chunk() {
        let chunks = chunk_text("  Πιστωτική κάρτα Visa  ", 700, 150).unwrap();
        assert_eq!(chunks, vec!["Πιστωτική κάρτα Visa".to_string()]);
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert!(chunk_text("", 10, 2).unwrap().is_empty());
        assert!(chunk_text(" \n\t  ", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn windows_advance_by_size_minus_overlap() {
        let text: String = ('a'..='z').collect();
        let chunks = chunk_text(&text, 10, 4).unwrap();
        assert_eq!(
            chunks,
            vec![
                "abcdefghij".to_string(),
                "ghijklmnop".to_string(),
                "mnopqrstuv".to_string(),
                "stuvwxyz".to_string(),
                "yz".to_string(),
            ]
        );
    }

    #[test]
    fn consecutive_windows_overlap_exactly() {
        let spans = windows(1000, 100, 30).unwrap();
        for pair in spans.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.1 - a.0 == 100 {
                assert_eq!(a.1 - b.0, 30);
            }
        }
        assert_eq!(spans.first(), Some(&(0, 100)));
        assert_eq!(spans.last().map(|w| w.1), Some(1000));
    }

    #[test]
    fn every_chunk_respects_the_size_limit() {
        let text = "Το επιτόκιο της κατάθεσης ορίζεται ετησίως. ".repeat(40);
        for chunk in chunk_text(&text, 120, 25).unwrap() {
            assert!(chunk.chars().count() <= 120);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Στεγαστικό δάνειο με σταθερό επιτόκιο. ".repeat(50);
        assert_eq!(
            chunk_text(&text, 200, 50).unwrap(),
            chunk_text(&text, 200, 50).unwrap()
        );
    }

    #[test]
    fn multibyte_text_splits_on_characters() {
        let text = "αβγδεζηθικ";
        let chunks = chunk_text(text, 4, 1).unwrap();
        assert_eq!(chunks[0], "αβγδ");
        assert_eq!(chunks[1], "δεζη");
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            chunk_text("abc", 10, 0),
            Err(RagError::InvalidChunking { .. })
        ));
        assert!(matches!(
            chunk_text("abc", 10, 10),
            Err(RagError::InvalidChunking { .. })
        ));
    }

    #[test]
    fn pages_keep_order_and_provenance() {
        let pages = vec![
            Page { number: 1, text: "first page".to_string() },
            Page { number: 2, text: "second page".to_string() },
        ];
        let chunks = chunk_pages(DocId::Deposits, "deposits.pdf", &pages, 700, 150).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[1].page, 2);
        assert_eq!(chunks[1].doc_id, DocId::Deposits);
        assert_eq!(chunks[1].source_file, "deposits.pdf");
        assert_ne!(chunks[0].id, chunks[1].id);
    }
}
