//! Deduplication and merge of freshly extracted memories against the
//! candidates already in the store.
//!
//! A candidate is a duplicate of an incoming chunk when the semantic
//! hashes collide, or when embedding cosine reaches the fusion
//! threshold *and* the subject sets overlap. Duplicates are merged into
//! the existing record instead of being inserted.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::chunk::{MemoryChunk, cosine_similarity};

/// Stable content fingerprint: scope, type, sorted subjects, predicate,
/// canonical object. Unlike the semantic hash it ignores the embedding,
/// so it survives re-vectorization.
pub fn content_fingerprint(chunk: &MemoryChunk) -> String {
    let subjects: BTreeSet<&str> = chunk
        .content
        .subjects
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let subject_part = subjects.into_iter().collect::<Vec<_>>().join("|");

    let base = [
        chunk.user_scope.as_str(),
        chunk.memory_type.slug(),
        &subject_part,
        chunk.content.predicate.trim(),
        &chunk.content.object.canonical(),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of one fusion pass.
#[derive(Debug, Default)]
pub struct FusionOutcome {
    /// Genuinely new chunks to insert.
    pub inserted: Vec<MemoryChunk>,
    /// Existing candidates that absorbed a duplicate; write these back.
    pub merged: Vec<MemoryChunk>,
}

pub struct MemoryFusion {
    similarity_threshold: f32,
}

impl MemoryFusion {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold: similarity_threshold as f32,
        }
    }

    fn subjects_overlap(a: &MemoryChunk, b: &MemoryChunk) -> bool {
        let left: BTreeSet<String> = a
            .content
            .subjects
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect();
        b.content
            .subjects
            .iter()
            .any(|s| left.contains(&s.trim().to_lowercase()))
    }

    fn is_duplicate(&self, incoming: &MemoryChunk, candidate: &MemoryChunk) -> bool {
        if let (Some(a), Some(b)) = (&incoming.semantic_hash, &candidate.semantic_hash) {
            if a == b {
                return true;
            }
        }

        if let (Some(a), Some(b)) = (&incoming.embedding, &candidate.embedding) {
            if cosine_similarity(a, b) >= self.similarity_threshold
                && Self::subjects_overlap(incoming, candidate)
            {
                return true;
            }
        }

        false
    }

    /// Fuse `incoming` against `candidates`. Incoming chunks that
    /// duplicate each other collapse into the first occurrence.
    pub fn fuse(
        &self,
        incoming: Vec<MemoryChunk>,
        candidates: Vec<MemoryChunk>,
        now: f64,
    ) -> FusionOutcome {
        let mut outcome = FusionOutcome::default();
        let mut candidates = candidates;

        'next: for chunk in incoming {
            for existing in candidates.iter_mut() {
                if self.is_duplicate(&chunk, existing) {
                    debug!(existing = %existing.id, incoming = %chunk.id, "fused duplicate memory");
                    existing.merge_from(&chunk, now);
                    if !outcome.merged.iter().any(|m| m.id == existing.id) {
                        outcome.merged.push(existing.clone());
                    } else if let Some(slot) =
                        outcome.merged.iter_mut().find(|m| m.id == existing.id)
                    {
                        *slot = existing.clone();
                    }
                    continue 'next;
                }
            }

            for accepted in outcome.inserted.iter_mut() {
                if self.is_duplicate(&chunk, accepted) {
                    accepted.merge_from(&chunk, now);
                    continue 'next;
                }
            }

            outcome.inserted.push(chunk);
        }

        outcome
    }
}
