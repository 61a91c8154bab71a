//! Few-shot reference set and nearest-neighbour "rare event" matching.
//!
//! Every stored embedding is L2-normalised, so cosine similarity is a plain
//! dot product. The set is small (a handful of uploads) and scanned linearly.

use crate::error::{DetectError, Result};
use ndarray::{Array1, ArrayBase, DataMut, Ix1};
use parking_lot::RwLock;
use serde::Serialize;

/// Maximum similarity must be strictly above this to count as a rare event.
pub const SIMILARITY_THRESHOLD: f32 = 0.7;

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize<S>(vector: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.mapv_inplace(|x| x / norm);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Label {
    #[serde(rename = "Rare Event")]
    RareEvent,
    #[serde(rename = "Normal")]
    Normal,
}

impl Label {
    #[must_use]
    pub fn from_similarity(similarity: f32) -> Self {
        if similarity > SIMILARITY_THRESHOLD {
            Self::RareEvent
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEntry {
    pub embedding: Array1<f32>,
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: Label,
    pub similarity: f32,
    pub all_similarities: Vec<f32>,
}

/// Reject an upload whose file and caption counts differ.
pub fn check_upload_counts(files: usize, captions: usize) -> Result<()> {
    if files == captions {
        Ok(())
    } else {
        Err(DetectError::MismatchedUpload { files, captions })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSet {
    entries: Vec<ReferenceEntry>,
}

impl ReferenceSet {
    /// Pair embeddings with captions, keeping upload order.
    pub fn from_parts(embeddings: Vec<Array1<f32>>, captions: Vec<String>) -> Result<Self> {
        check_upload_counts(embeddings.len(), captions.len())?;

        if let Some(first) = embeddings.first() {
            let expected = first.len();
            if let Some(bad) = embeddings.iter().find(|e| e.len() != expected) {
                return Err(DetectError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }

        let entries = embeddings
            .into_iter()
            .zip(captions)
            .map(|(embedding, caption)| ReferenceEntry { embedding, caption })
            .collect();
        Ok(Self { entries })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    /// Similarity of `query` against every entry, in upload order.
    pub fn similarities(&self, query: &Array1<f32>) -> Result<Vec<f32>> {
        self.entries
            .iter()
            .map(|entry| {
                if entry.embedding.len() == query.len() {
                    Ok(entry.embedding.dot(query))
                } else {
                    Err(DetectError::DimensionMismatch {
                        expected: entry.embedding.len(),
                        actual: query.len(),
                    })
                }
            })
            .collect()
    }

    pub fn classify(&self, query: &Array1<f32>) -> Result<Classification> {
        if self.is_empty() {
            return Err(DetectError::NoReferences);
        }

        let all_similarities = self.similarities(query)?;
        let similarity = all_similarities
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);

        Ok(Classification {
            label: Label::from_similarity(similarity),
            similarity,
            all_similarities,
        })
    }
}

/// Process-wide reference set shared by the request handlers.
///
/// Uploads swap the whole set under the write lock; a rejected upload never
/// reaches the store, so the previous set stays in place.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    inner: RwLock<ReferenceSet>,
}

impl ReferenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored set, returning the new entry count.
    pub fn replace(&self, set: ReferenceSet) -> usize {
        let count = set.len();
        *self.inner.write() = set;
        count
    }

    pub fn classify(&self, query: &Array1<f32>) -> Result<Classification> {
        self.inner.read().classify(query)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn captions(&self) -> Vec<String> {
        self.inner
            .read()
            .entries()
            .iter()
            .map(|e| e.caption.clone())
            .collect()
    }
}
