use std::path::PathBuf;

use thiserror::Error;

use crate::document::DocId;

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("index not found at {path}; run `bankrag build` before serving queries")]
    IndexMissing { path: PathBuf },
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    #[error("source document for {doc_id} not found at {path}")]
    MissingDocument { doc_id: DocId, path: PathBuf },
    #[error("invalid chunking parameters: chunk_size={chunk_size}, overlap={overlap} (need 0 < overlap < chunk_size)")]
    InvalidChunking { chunk_size: usize, overlap: usize },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index was built with embedding model '{built}' but '{configured}' is configured")]
    ModelMismatch { built: String, configured: String },
    #[error("embedding provider failed: {0:#}")]
    Embedding(anyhow::Error),
    #[error("answer generator failed: {0:#}")]
    Generation(anyhow::Error),
    #[error("query text must not be empty")]
    EmptyQuery,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk store error: {0}")]
    Store(#[from] heed::Error),
    #[error("chunk codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
}

impl RagError {
    /// Errors the operator has to fix before traffic can be served.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RagError::IndexMissing { .. }
                | RagError::CorruptIndex(_)
                | RagError::ModelMismatch { .. }
                | RagError::MissingDocument { .. }
        )
    }
}
