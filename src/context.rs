use crate::document::Source;
use crate::search::RetrievalResult;

pub const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

/// Renders each hit as `[doc_id | page N]` followed by its text, in rank order.
pub fn assemble(result: &RetrievalResult) -> String {
    result
        .hits
        .iter()
        .map(|hit| format!("[{} | page {}]\n{}", hit.chunk.doc_id, hit.chunk.page, hit.chunk.text))
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR)
}

pub fn sources(result: &RetrievalResult, snippet_chars: usize) -> Vec<Source> {
    result
        .hits
        .iter()
        .map(|hit| Source::from_chunk(&hit.chunk, snippet_chars))
        .collect()
}
