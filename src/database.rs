use heed::types::{Bytes, Str};
use heed::{Database, EnvOpenOptions};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use crate::config::Number;
use crate::document::{Chunk, ChunkId, CHUNK_ID_LEN};
use crate::error::{RagError, Result};
use crate::index::{ChunkStore, IndexManifest, IndexSnapshot, VectorIndex};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const CHUNKS_DIR: &str = "chunks";
pub const MANIFEST_FILE: &str = "manifest.json";

const MAGIC: &[u8; 8] = b"BRAGVEC1";
const HEADER_SIZE: usize = 16;
const CHUNKS_DB: &str = "chunks";
const LMDB_MAP_SIZE: usize = 1024 * 1024 * 1024; // 1GB

/// LMDB-backed chunk records keyed by hex chunk id.
pub struct ChunkDb {
    env: heed::Env,
    db: Database<Str, Bytes>,
}

impl ChunkDb {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let env = Self::open_env(path)?;
        let mut wtxn = env.write_txn()?;
        let db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some(CHUNKS_DB))?;
        wtxn.commit()?;
        Ok(Self { env, db })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let env = Self::open_env(path)?;
        let wtxn = env.write_txn()?;
        let db: Option<Database<Str, Bytes>> = env.open_database(&wtxn, Some(CHUNKS_DB))?;
        wtxn.commit()?;
        let db = db.ok_or_else(|| {
            RagError::CorruptIndex(format!("chunk store at '{}' has no chunks table", path.display()))
        })?;
        Ok(Self { env, db })
    }

    fn open_env(path: &Path) -> Result<heed::Env> {
        tracing::debug!(path = %path.display(), "opening chunk store");
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(LMDB_MAP_SIZE)
                .max_dbs(1)
                .open(path)?
        };
        Ok(env)
    }

    pub fn put_all(&self, chunks: &[Chunk]) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for chunk in chunks {
            let value = bincode::serialize(chunk)?;
            self.db.put(&mut wtxn, &chunk.id.to_hex(), &value)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &ChunkId) -> Result<Option<Chunk>> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &id.to_hex())? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> Result<usize> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.len(&rtxn)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Looks up every id in order inside one read transaction.
    pub fn resolve(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let rtxn = self.env.read_txn()?;
        ids.iter()
            .map(|id| {
                let bytes = self.db.get(&rtxn, &id.to_hex())?.ok_or_else(|| {
                    RagError::CorruptIndex(format!("chunk {} is missing from the chunk store", id))
                })?;
                let chunk: Chunk = bincode::deserialize(bytes)?;
                if chunk.id != *id {
                    return Err(RagError::CorruptIndex(format!(
                        "chunk stored under {} carries id {}",
                        id, chunk.id
                    )));
                }
                Ok(chunk)
            })
            .collect()
    }
}

fn record_size(dimension: usize) -> usize {
    CHUNK_ID_LEN + dimension * size_of::<Number>()
}

fn checked_record_size(dimension: usize) -> Option<usize> {
    dimension
        .checked_mul(size_of::<Number>())
        .and_then(|bytes| bytes.checked_add(CHUNK_ID_LEN))
}

pub fn serialize_record(id: &ChunkId, vector: &[Number]) -> Vec<u8> {
    let mut record = Vec::with_capacity(record_size(vector.len()));
    record.extend_from_slice(id.as_bytes());
    record.extend(vector.iter().flat_map(|&num| num.to_le_bytes()));
    record
}

pub fn write_vectors(path: &Path, index: &VectorIndex) -> Result<()> {
    let dimension = u32::try_from(index.dimension())
        .map_err(|_| RagError::CorruptIndex("dimension does not fit the file header".to_string()))?;
    let count = u32::try_from(index.len())
        .map_err(|_| RagError::CorruptIndex("too many vectors for the file header".to_string()))?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&dimension.to_le_bytes())?;
    writer.write_all(&count.to_le_bytes())?;
    for slot in 0..index.len() {
        let (id, vector) = match (index.id(slot), index.vector(slot)) {
            (Some(id), Some(vector)) => (id, vector),
            _ => return Err(RagError::CorruptIndex(format!("slot {} has no vector", slot))),
        };
        writer.write_all(&serialize_record(&id, vector))?;
    }
    writer.flush()?;
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn build_offsets(mmap_len: usize, count: usize, record_size: usize) -> Result<Vec<usize>> {
    let expected = count
        .checked_mul(record_size)
        .and_then(|body| body.checked_add(HEADER_SIZE))
        .ok_or_else(|| {
            RagError::CorruptIndex(format!(
                "vector file header promises {} records of {} bytes",
                count, record_size
            ))
        })?;
    if mmap_len != expected {
        return Err(RagError::CorruptIndex(format!(
            "vector file is {} bytes, header promises {}",
            mmap_len, expected
        )));
    }
    Ok((0..count).map(|i| HEADER_SIZE + i * record_size).collect())
}

fn get_vector_from_mmap(mmap: &Mmap, offset: usize, dimension: usize) -> Result<(ChunkId, Vec<Number>)> {
    let end = offset + record_size(dimension);
    if end > mmap.len() {
        return Err(RagError::CorruptIndex(
            "attempted to read beyond the memory map".to_string(),
        ));
    }
    let mut id = [0u8; CHUNK_ID_LEN];
    id.copy_from_slice(&mmap[offset..offset + CHUNK_ID_LEN]);
    let vector = mmap[offset + CHUNK_ID_LEN..end]
        .chunks_exact(size_of::<Number>())
        .map(|b| Number::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((ChunkId::from_bytes(id), vector))
}

pub fn read_vectors(path: &Path) -> Result<VectorIndex> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.len() < HEADER_SIZE || &mmap[..MAGIC.len()] != MAGIC {
        return Err(RagError::CorruptIndex(format!(
            "'{}' is not a vector index file",
            path.display()
        )));
    }
    let dimension = read_u32(&mmap[8..12]) as usize;
    let count = read_u32(&mmap[12..16]) as usize;
    if dimension == 0 {
        return Err(RagError::CorruptIndex("vector file declares dimension 0".to_string()));
    }

    let record_size = checked_record_size(dimension).ok_or_else(|| {
        RagError::CorruptIndex(format!("vector file declares dimension {}", dimension))
    })?;
    let offsets = build_offsets(mmap.len(), count, record_size)?;
    let mut index = VectorIndex::new(dimension);
    for offset in offsets {
        let (id, vector) = get_vector_from_mmap(&mmap, offset, dimension)?;
        index.add(id, &vector)?;
    }
    Ok(index)
}

fn sibling_dir(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "index".into());
    name.push(suffix);
    dir.with_file_name(name)
}

fn staging_dir(dir: &Path) -> PathBuf {
    sibling_dir(dir, ".staging")
}

fn retired_dir(dir: &Path) -> PathBuf {
    sibling_dir(dir, ".old")
}

/// Writes all three artifacts into a staging directory, then swaps it in
/// for `dir`. Nothing is left behind on failure.
pub fn write_index(dir: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    let staging = staging_dir(dir);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    if let Err(err) = write_artifacts(&staging, snapshot) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    if let Err(err) = swap_into_place(&staging, dir) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }
    tracing::info!(path = %dir.display(), chunks = snapshot.len(), "index written");
    Ok(())
}

/// Moves the previous index aside, renames `staging` to `dir`, and only then
/// drops the previous index. A failed rename puts the previous index back.
fn swap_into_place(staging: &Path, dir: &Path) -> Result<()> {
    let retired = retired_dir(dir);
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }
    let had_previous = dir.exists();
    if had_previous {
        fs::rename(dir, &retired)?;
    }
    if let Err(err) = fs::rename(staging, dir) {
        if had_previous {
            if let Err(restore) = fs::rename(&retired, dir) {
                tracing::error!(path = %retired.display(), error = %restore, "previous index could not be restored");
            }
        }
        return Err(err.into());
    }
    if had_previous {
        if let Err(err) = fs::remove_dir_all(&retired) {
            tracing::warn!(path = %retired.display(), error = %err, "previous index not removed");
        }
    }
    Ok(())
}

fn write_artifacts(staging: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    fs::create_dir_all(staging)?;
    write_vectors(&staging.join(VECTORS_FILE), snapshot.vectors())?;
    {
        let chunks: Vec<Chunk> = snapshot.chunks().iter().cloned().collect();
        let db = ChunkDb::create(staging.join(CHUNKS_DIR))?;
        db.put_all(&chunks)?;
    }
    // manifest last: its presence marks a complete index
    let writer = BufWriter::new(File::create(staging.join(MANIFEST_FILE))?);
    serde_json::to_writer_pretty(writer, snapshot.manifest())?;
    Ok(())
}

pub fn read_manifest(dir: &Path) -> Result<IndexManifest> {
    let file = File::open(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Loads and cross-checks the persisted index. Slot order comes from the
/// vector file; each slot's chunk is resolved by id.
pub fn load_index(dir: &Path, embedding_model: &str) -> Result<IndexSnapshot> {
    let required = [dir.join(VECTORS_FILE), dir.join(CHUNKS_DIR), dir.join(MANIFEST_FILE)];
    if let Some(missing) = required.iter().find(|p| !p.exists()) {
        return Err(RagError::IndexMissing { path: missing.clone() });
    }

    let manifest = read_manifest(dir)?;
    if manifest.embedding_model != embedding_model {
        return Err(RagError::ModelMismatch {
            built: manifest.embedding_model,
            configured: embedding_model.to_string(),
        });
    }

    let vectors = read_vectors(&dir.join(VECTORS_FILE))?;
    let db = ChunkDb::open(dir.join(CHUNKS_DIR))?;
    let stored = db.len()?;
    if stored != vectors.len() {
        return Err(RagError::CorruptIndex(format!(
            "vector file holds {} entries but chunk store holds {}",
            vectors.len(),
            stored
        )));
    }
    let chunks = db.resolve(vectors.ids())?;
    IndexSnapshot::new(manifest, vectors, ChunkStore::new(chunks))
}
