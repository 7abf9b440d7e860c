//! Token-id to text decoding.
//!
//! The model directory ships a `vocab.json` mapping SentencePiece pieces to
//! ids (`{"▁the": 4, ...}`). Word boundaries use the `▁` marker. Blank and
//! end-of-utterance are joint-logit classes, not vocabulary entries, so
//! they never appear in an id sequence handed to the decoder here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{LoquiError, Result};

/// Word-boundary marker used by SentencePiece vocabularies.
const WORD_BOUNDARY: &str = "\u{2581}";

/// Contract for transcript decoders.
pub trait Tokenizer: Send + Sync + 'static {
    /// Decode an id sequence into text.
    ///
    /// # Errors
    /// Returns `Tokenizer` when an id is outside the vocabulary.
    fn decode(&self, ids: &[i32]) -> Result<String>;

    /// Number of vocabulary entries (excludes blank and end-of-utterance).
    fn vocab_size(&self) -> usize;
}

/// Shared read-only tokenizer handle.
pub type TokenizerHandle = Arc<dyn Tokenizer>;

/// Plain id-indexed vocabulary.
pub struct Vocabulary {
    pieces: Vec<String>,
}

impl Vocabulary {
    /// Load from a `vocab.json` piece→id map.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoquiError::ModelNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                LoquiError::Io(e)
            }
        })?;
        let map: HashMap<String, u32> = serde_json::from_str(&raw)
            .map_err(|e| LoquiError::Tokenizer(format!("vocab.json parse: {e}")))?;

        let size = map
            .values()
            .map(|&id| id as usize + 1)
            .max()
            .unwrap_or(0);
        if size == 0 {
            return Err(LoquiError::Tokenizer("vocab.json is empty".into()));
        }

        let mut pieces = vec![String::new(); size];
        for (piece, id) in map {
            pieces[id as usize] = piece;
        }
        let gaps = pieces.iter().filter(|p| p.is_empty()).count();
        if gaps > 0 {
            warn!(gaps, size, "vocab.json has unassigned ids");
        }
        info!(size, path = ?path, "vocabulary loaded");

        Ok(Self { pieces })
    }

    /// Build directly from an ordered piece list (index = id).
    pub fn from_pieces<S: Into<String>>(pieces: Vec<S>) -> Self {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
        }
    }
}

impl Tokenizer for Vocabulary {
    fn decode(&self, ids: &[i32]) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            let piece = usize::try_from(id)
                .ok()
                .and_then(|i| self.pieces.get(i))
                .ok_or_else(|| {
                    LoquiError::Tokenizer(format!(
                        "token id {id} outside vocabulary of {}",
                        self.pieces.len()
                    ))
                })?;
            out.push_str(piece);
        }
        Ok(out.replace(WORD_BOUNDARY, " ").trim().to_string())
    }

    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("size", &self.pieces.len())
            .finish()
    }
}
