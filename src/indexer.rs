//! Offline build: PDFs to pages, pages to chunks, chunks to vectors, all
//! persisted under the index directory.

use std::fs;
use std::path::Path;
use std::time::Instant;

use lopdf::Document;
use sha2::{Digest, Sha256};

use crate::chunker::{chunk_pages, Page};
use crate::config::Settings;
use crate::database;
use crate::document::{Chunk, DocId};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::index::{ChunkStore, DocumentDigest, IndexManifest, IndexSnapshot, VectorIndex};

/// One product document with its extracted pages.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub doc_id: DocId,
    pub source_file: String,
    pub sha256: String,
    pub pages: Vec<Page>,
}

/// Extracts the text of every page, numbered from 1. A page whose text
/// cannot be extracted is kept with empty text.
pub fn load_pdf_pages(path: &Path) -> Result<Vec<Page>> {
    let document = Document::load(path)?;
    let pages = document
        .get_pages()
        .into_keys()
        .map(|number| {
            let text = document.extract_text(&[number]).unwrap_or_else(|err| {
                tracing::warn!(file = %path.display(), page = number, error = %err, "page text extraction failed");
                String::new()
            });
            Page { number, text }
        })
        .collect();
    Ok(pages)
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Reads the three product PDFs from `data_dir`. Every file is checked
/// before any is parsed.
pub fn load_corpus(data_dir: &Path) -> Result<Vec<SourceDocument>> {
    for doc_id in DocId::ALL {
        let path = data_dir.join(doc_id.file_name());
        if !path.is_file() {
            return Err(RagError::MissingDocument { doc_id, path });
        }
    }

    DocId::ALL
        .iter()
        .map(|&doc_id| {
            let path = data_dir.join(doc_id.file_name());
            let bytes = fs::read(&path)?;
            let pages = load_pdf_pages(&path)?;
            tracing::info!(doc = %doc_id, pages = pages.len(), "document loaded");
            Ok(SourceDocument {
                doc_id,
                source_file: doc_id.file_name().to_string(),
                sha256: sha256_hex(&bytes),
                pages,
            })
        })
        .collect()
}

/// Chunks and embeds `documents` into an in-memory snapshot.
pub fn build_snapshot(
    documents: &[SourceDocument],
    embedder: &dyn Embedder,
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
) -> Result<IndexSnapshot> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut digests = Vec::with_capacity(documents.len());
    for document in documents {
        let doc_chunks = chunk_pages(
            document.doc_id,
            &document.source_file,
            &document.pages,
            chunk_size,
            chunk_overlap,
        )?;
        tracing::info!(doc = %document.doc_id, chunks = doc_chunks.len(), "document chunked");
        chunks.extend(doc_chunks);
        digests.push(DocumentDigest {
            doc_id: document.doc_id,
            source_file: document.source_file.clone(),
            sha256: document.sha256.clone(),
            pages: document.pages.len(),
        });
    }

    let vectors = embed_chunks(&chunks, embedder, batch_size)?;
    let manifest = IndexManifest {
        embedding_model: embedder.model_name().to_string(),
        dimension: vectors.dimension(),
        chunk_count: chunks.len(),
        chunk_size,
        chunk_overlap,
        documents: digests,
    };
    IndexSnapshot::new(manifest, vectors, ChunkStore::new(chunks))
}

fn embed_chunks(chunks: &[Chunk], embedder: &dyn Embedder, batch_size: usize) -> Result<VectorIndex> {
    let batch_size = batch_size.min(embedder.batch_size()).max(1);
    let start = Instant::now();
    let mut index: Option<VectorIndex> = None;

    for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let embeddings = embedder.embed(&texts).map_err(RagError::Embedding)?;
        if embeddings.len() != batch.len() {
            return Err(RagError::Embedding(anyhow::anyhow!(
                "provider returned {} embeddings for {} texts",
                embeddings.len(),
                batch.len()
            )));
        }
        for (chunk, embedding) in batch.iter().zip(embeddings) {
            let index = index.get_or_insert_with(|| VectorIndex::new(embedding.len()));
            index.add(chunk.id, &embedding)?;
        }
        tracing::debug!(batch = batch_no + 1, embedded = index.as_ref().map_or(0, |i| i.len()), "batch embedded");
    }

    let index = match index {
        Some(index) => index,
        None => {
            // empty corpus: embed one sample so the vector file still records a dimension
            let sample = embedder
                .embed(&["dimension sample"])
                .map_err(RagError::Embedding)?
                .into_iter()
                .next()
                .ok_or_else(|| RagError::Embedding(anyhow::anyhow!("provider returned no embedding")))?;
            VectorIndex::new(sample.len())
        }
    };
    if index.dimension() == 0 {
        return Err(RagError::Embedding(anyhow::anyhow!("provider returned empty vectors")));
    }
    tracing::info!(
        vectors = index.len(),
        dimension = index.dimension(),
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "chunks embedded"
    );
    Ok(index)
}

/// Full offline build from `settings.data_dir` into `settings.index_dir`.
pub fn build_index(settings: &Settings, embedder: &dyn Embedder) -> Result<IndexManifest> {
    let documents = load_corpus(&settings.data_dir)?;
    let snapshot = build_snapshot(
        &documents,
        embedder,
        settings.chunk_size,
        settings.chunk_overlap,
        settings.embedding_batch_size,
    )?;
    database::write_index(&settings.index_dir, &snapshot)?;
    Ok(snapshot.manifest().clone())
}
