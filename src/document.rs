use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Number;

pub type Embedding = Vec<Number>;

/// Product documents the index is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocId {
    CreditCards,
    Deposits,
    MortgageLoans,
}

impl DocId {
    pub const ALL: [DocId; 3] = [DocId::CreditCards, DocId::Deposits, DocId::MortgageLoans];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocId::CreditCards => "credit_cards",
            DocId::Deposits => "deposits",
            DocId::MortgageLoans => "mortgage_loans",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            DocId::CreditCards => "credit_cards.pdf",
            DocId::Deposits => "deposits.pdf",
            DocId::MortgageLoans => "mortgage_loans.pdf",
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const CHUNK_ID_LEN: usize = 16;

/// Content-derived identifier shared by the vector file and the chunk store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChunkId([u8; CHUNK_ID_LEN]);

impl ChunkId {
    pub fn derive(doc_id: DocId, page: u32, ordinal: usize, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(doc_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(page.to_le_bytes());
        hasher.update([0u8]);
        hasher.update((ordinal as u64).to_le_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; CHUNK_ID_LEN];
        bytes.copy_from_slice(&digest[..CHUNK_ID_LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; CHUNK_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != CHUNK_ID_LEN * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; CHUNK_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl From<ChunkId> for String {
    fn from(id: ChunkId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for ChunkId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChunkId::parse_hex(&value).ok_or_else(|| format!("invalid chunk id '{}'", value))
    }
}

/// A window of one page of one product document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    pub doc_id: DocId,
    pub source_file: String,
    /// 1-based.
    pub page: u32,
}

/// Provenance returned alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub doc_id: DocId,
    pub source_file: String,
    pub page: u32,
    pub snippet: String,
}

impl Source {
    pub fn from_chunk(chunk: &Chunk, snippet_chars: usize) -> Self {
        Self {
            doc_id: chunk.doc_id,
            source_file: chunk.source_file.clone(),
            page: chunk.page,
            snippet: chunk.text.chars().take(snippet_chars).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_stable_and_hex_roundtrips() {
        let a = ChunkId::derive(DocId::Deposits, 3, 0, "προθεσμιακή κατάθεση");
        let b = ChunkId::derive(DocId::Deposits, 3, 0, "προθεσμιακή κατάθεση");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 32);
        assert_eq!(ChunkId::parse_hex(&a.to_hex()), Some(a));
    }

    #[test]
    fn chunk_id_depends_on_position() {
        let a = ChunkId::derive(DocId::Deposits, 3, 0, "same text");
        let b = ChunkId::derive(DocId::Deposits, 3, 1, "same text");
        let c = ChunkId::derive(DocId::Deposits, 4, 0, "same text");
        let d = ChunkId::derive(DocId::CreditCards, 3, 0, "same text");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn parse_hex_rejects_garbage() {
        assert!(ChunkId::parse_hex("xyz").is_none());
        assert!(ChunkId::parse_hex(&"zz".repeat(16)).is_none());
    }

    #[test]
    fn snippet_counts_characters_not_bytes() {
        let chunk = Chunk {
            id: ChunkId::derive(DocId::CreditCards, 1, 0, "κάρτα"),
            text: "πιστωτική κάρτα".to_string(),
            doc_id: DocId::CreditCards,
            source_file: "credit_cards.pdf".to_string(),
            page: 1,
        };
        let source = Source::from_chunk(&chunk, 5);
        assert_eq!(source.snippet, "πιστω");
        assert_eq!(source.page, 1);
    }

    #[test]
    fn doc_id_serializes_as_snake_case() {
        let json = serde_json::to_string(&DocId::MortgageLoans).unwrap();
        assert_eq!(json, "\"mortgage_loans\"");
    }
}
