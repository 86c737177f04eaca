use std::sync::Arc;
use std::time::Instant;

use crate::config::Number;
use crate::document::Chunk;
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::index::{IndexHandle, IndexSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub distance: Number,
}

/// Chunks ranked ascending by distance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn min_distance(&self) -> Option<Number> {
        self.hits
            .iter()
            .map(|hit| hit.distance)
            .fold(None, |min, d| match min {
                Some(m) if m <= d => Some(m),
                _ => Some(d),
            })
    }

    pub fn distances(&self) -> Vec<Number> {
        self.hits.iter().map(|hit| hit.distance).collect()
    }
}

pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    index: IndexHandle,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn Embedder>, index: IndexHandle) -> Self {
        Self { embedder, index }
    }

    pub fn snapshot(&self) -> Result<Arc<IndexSnapshot>> {
        self.index.get()
    }

    pub fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult> {
        let snapshot = self.index.get()?;
        let start = Instant::now();

        tracing::debug!(top_k = k, "embedding query");
        let query_vector = self
            .embedder
            .embed(&[query])
            .map_err(RagError::Embedding)?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Embedding(anyhow::anyhow!("provider returned no embedding")))?;

        let neighbors = snapshot.vectors().search(&query_vector, k)?;

        let hits: Vec<RetrievedChunk> = neighbors
            .into_iter()
            .enumerate()
            .filter_map(|(rank, neighbor)| {
                // out-of-range slots are skipped, not raised
                let chunk = snapshot.chunks().get(neighbor.slot)?;
                tracing::debug!(
                    rank = rank + 1,
                    doc = %chunk.doc_id,
                    file = %chunk.source_file,
                    page = chunk.page,
                    distance = neighbor.distance,
                    preview = %chunk.text.chars().take(300).collect::<String>(),
                    "retrieved chunk"
                );
                Some(RetrievedChunk {
                    chunk: chunk.clone(),
                    distance: neighbor.distance,
                })
            })
            .collect();

        tracing::debug!(
            hits = hits.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "retrieval finished"
        );
        Ok(RetrievalResult { hits })
    }
}
