//! In-memory vector index and chunk store, plus the shared handle the query
//! path reads them through.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Number;
use crate::document::{Chunk, ChunkId, DocId};
use crate::error::{RagError, Result};
use crate::vector_ops::squared_l2_simd;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub slot: usize,
    /// Squared L2.
    pub distance: Number,
}

/// Flat exact-search index. A vector's slot is fixed by insertion order.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    ids: Vec<ChunkId>,
    vectors: Vec<Number>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn build<I>(dimension: usize, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ChunkId, Vec<Number>)>,
    {
        let mut index = Self::new(dimension);
        for (id, vector) in entries {
            index.add(id, &vector)?;
        }
        Ok(index)
    }

    pub fn add(&mut self, id: ChunkId, vector: &[Number]) -> Result<usize> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
        Ok(self.ids.len() - 1)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, slot: usize) -> Option<ChunkId> {
        self.ids.get(slot).copied()
    }

    pub fn ids(&self) -> &[ChunkId] {
        &self.ids
    }

    pub fn vector(&self, slot: usize) -> Option<&[Number]> {
        let start = slot.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    /// At most `k` nearest slots, ascending by distance (ties by slot).
    pub fn search(&self, query: &[Number], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() || self.dimension == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Neighbor> = self
            .vectors
            .par_chunks_exact(self.dimension)
            .enumerate()
            .filter_map(|(slot, vector)| {
                squared_l2_simd(query, vector).map(|distance| Neighbor { slot, distance })
            })
            .collect();

        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.slot.cmp(&b.slot)));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Chunk metadata, positionally aligned with a [`VectorIndex`].
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    pub fn get(&self, slot: usize) -> Option<&Chunk> {
        self.chunks.get(slot)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDigest {
    pub doc_id: DocId,
    pub source_file: String,
    pub sha256: String,
    pub pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub embedding_model: String,
    pub dimension: usize,
    pub chunk_count: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub documents: Vec<DocumentDigest>,
}

/// A vector index and its chunk store, checked to agree slot for slot.
#[derive(Debug)]
pub struct IndexSnapshot {
    manifest: IndexManifest,
    vectors: VectorIndex,
    chunks: ChunkStore,
}

impl IndexSnapshot {
    pub fn new(manifest: IndexManifest, vectors: VectorIndex, chunks: ChunkStore) -> Result<Self> {
        if vectors.len() != chunks.len() {
            return Err(RagError::CorruptIndex(format!(
                "vector index holds {} entries but chunk store holds {}",
                vectors.len(),
                chunks.len()
            )));
        }
        if let Some((slot, _)) = vectors
            .ids()
            .iter()
            .zip(chunks.iter())
            .enumerate()
            .find(|(_, (id, chunk))| **id != chunk.id)
        {
            return Err(RagError::CorruptIndex(format!(
                "slot {} of the vector index does not match the chunk store",
                slot
            )));
        }
        if manifest.dimension != vectors.dimension() || manifest.chunk_count != vectors.len() {
            return Err(RagError::CorruptIndex(format!(
                "manifest describes {} chunks of dimension {}, files hold {} of dimension {}",
                manifest.chunk_count,
                manifest.dimension,
                vectors.len(),
                vectors.dimension()
            )));
        }
        Ok(Self {
            manifest,
            vectors,
            chunks,
        })
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

type Loader = Box<dyn Fn() -> Result<IndexSnapshot> + Send + Sync>;

/// Load-once access to the index. The first caller runs the loader while the
/// rest block on the mutex; every caller then shares the same snapshot. A
/// failed load is not remembered.
pub struct IndexHandle {
    loader: Loader,
    slot: Mutex<Option<Arc<IndexSnapshot>>>,
}

impl IndexHandle {
    pub fn lazy<F>(loader: F) -> Self
    where
        F: Fn() -> Result<IndexSnapshot> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            slot: Mutex::new(None),
        }
    }

    /// Loads from `dir` on first use, requiring `embedding_model` in the manifest.
    pub fn open_lazily(dir: impl Into<PathBuf>, embedding_model: impl Into<String>) -> Self {
        let dir = dir.into();
        let embedding_model = embedding_model.into();
        Self::lazy(move || crate::database::load_index(&dir, &embedding_model))
    }

    pub fn preloaded(snapshot: IndexSnapshot) -> Self {
        Self {
            loader: Box::new(|| {
                Err(RagError::CorruptIndex(
                    "preloaded index handle has no loader".to_string(),
                ))
            }),
            slot: Mutex::new(Some(Arc::new(snapshot))),
        }
    }

    pub fn get(&self) -> Result<Arc<IndexSnapshot>> {
        let mut slot = self.slot.lock();
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new((self.loader)()?);
        tracing::info!(
            chunks = snapshot.len(),
            dimension = snapshot.vectors().dimension(),
            model = %snapshot.manifest().embedding_model,
            "index loaded"
        );
        *slot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn sample_chunk(doc_id: DocId, page: u32, ordinal: usize, text: &str) -> Chunk {
        Chunk {
            id: ChunkId::derive(doc_id, page, ordinal, text),
            text: text.to_string(),
            doc_id,
            source_file: doc_id.file_name().to_string(),
            page,
        }
    }

    pub(crate) fn sample_manifest(dimension: usize, chunk_count: usize) -> IndexManifest {
        IndexManifest {
            embedding_model: "test-model".to_string(),
            dimension,
            chunk_count,
            chunk_size: 700,
            chunk_overlap: 150,
            documents: Vec::new(),
        }
    }

    fn axis(dimension: usize, hot: usize) -> Vec<Number> {
        let mut v = vec![0.0; dimension];
        v[hot] = 1.0;
        v
    }

    fn snapshot_of(vectors: Vec<Vec<Number>>) -> IndexSnapshot {
        let dimension = vectors[0].len();
        let chunks: Vec<Chunk> = (0..vectors.len())
            .map(|i| sample_chunk(DocId::CreditCards, 1, i, &format!("chunk {}", i)))
            .collect();
        let index =
            VectorIndex::build(dimension, chunks.iter().map(|c| c.id).zip(vectors)).unwrap();
        let count = chunks.len();
        IndexSnapshot::new(sample_manifest(dimension, count), index, ChunkStore::new(chunks))
            .unwrap()
    }

    #[test]
    fn search_orders_by_ascending_distance() {
        let snapshot = snapshot_of(vec![
            vec![0.0, 0.0, 10.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 3.0, 0.0],
        ]);
        let hits = snapshot.vectors().search(&[0.0, 0.0, 0.0], 3).unwrap();
        let slots: Vec<usize> = hits.iter().map(|n| n.slot).collect();
        assert_eq!(slots, vec![1, 2, 0]);
        assert_eq!(hits[0].distance, 1.0);
        assert_eq!(hits[1].distance, 9.0);
        assert_eq!(hits[2].distance, 100.0);
    }

    #[test]
    fn search_returns_at_most_what_the_index_holds() {
        let snapshot = snapshot_of(vec![axis(4, 0), axis(4, 1)]);
        let hits = snapshot.vectors().search(&axis(4, 0), 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(snapshot.vectors().search(&axis(4, 0), 0).unwrap().is_empty());
    }

    #[test]
    fn every_vector_finds_itself_first() {
        let vectors: Vec<Vec<Number>> = (0..16).map(|i| axis(16, i)).collect();
        let snapshot = snapshot_of(vectors.clone());
        for (slot, vector) in vectors.iter().enumerate() {
            let hits = snapshot.vectors().search(vector, 1).unwrap();
            assert_eq!(hits[0].slot, slot);
            assert!(hits[0].distance.abs() < 1e-6);
            assert_eq!(snapshot.chunks().get(slot).unwrap().id, snapshot.vectors().id(slot).unwrap());
        }
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let mut index = VectorIndex::new(3);
        let id = ChunkId::derive(DocId::Deposits, 1, 0, "x");
        assert!(matches!(
            index.add(id, &[1.0, 2.0]),
            Err(RagError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn empty_index_searches_to_nothing() {
        let index = VectorIndex::new(8);
        assert!(index.search(&[0.0; 8], 5).unwrap().is_empty());
    }

    #[test]
    fn misaligned_store_is_corrupt() {
        let a = sample_chunk(DocId::Deposits, 1, 0, "a");
        let b = sample_chunk(DocId::Deposits, 1, 1, "b");
        let index = VectorIndex::build(2, vec![(a.id, vec![0.0, 1.0]), (b.id, vec![1.0, 0.0])]).unwrap();

        let swapped = ChunkStore::new(vec![b.clone(), a.clone()]);
        assert!(matches!(
            IndexSnapshot::new(sample_manifest(2, 2), index.clone(), swapped),
            Err(RagError::CorruptIndex(_))
        ));

        let short = ChunkStore::new(vec![a]);
        assert!(matches!(
            IndexSnapshot::new(sample_manifest(2, 2), index, short),
            Err(RagError::CorruptIndex(_))
        ));
    }

    #[test]
    fn concurrent_first_access_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let handle = IndexHandle::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            IndexSnapshot::new(sample_manifest(4, 0), VectorIndex::new(4), ChunkStore::default())
        });

        let snapshots: Vec<Arc<IndexSnapshot>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8).map(|_| scope.spawn(|| handle.get().unwrap())).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(snapshots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(handle.is_loaded());
    }

    #[test]
    fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handle = IndexHandle::lazy(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RagError::IndexMissing { path: PathBuf::from("index") })
            } else {
                IndexSnapshot::new(sample_manifest(4, 0), VectorIndex::new(4), ChunkStore::default())
            }
        });
        assert!(handle.get().is_err());
        assert!(!handle.is_loaded());
        assert!(handle.get().is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
