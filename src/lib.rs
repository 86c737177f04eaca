//! Retrieval and gating pipeline over a bank's product PDFs: credit cards,
//! deposits and mortgage loans.

pub mod chunker;
pub mod config;
pub mod context;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gate;
pub mod generator;
pub mod guardrails;
pub mod index;
pub mod indexer;
pub mod logging;
pub mod pipeline;
pub mod search;
pub mod server;
pub mod vector_ops;

pub use config::Settings;
pub use document::{Chunk, ChunkId, DocId, Source};
pub use error::{RagError, Result};
pub use pipeline::{Answer, Outcome, RagPipeline, RefusalReason};
