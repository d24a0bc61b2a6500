//! Face descriptors and the per-session reference library.

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Scale `values` to unit L2 magnitude. A zero vector is returned unchanged.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    let magnitude = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude == 0.0 {
        return values.to_vec();
    }
    values.iter().map(|v| v / magnitude).collect()
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// A face embedding, always stored L2-normalized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Validate and normalize a raw embedding from the detector.
    pub fn from_raw(values: &[f32]) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite);
        }
        Ok(Self {
            values: normalize(values),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn magnitude(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn distance(&self, other: &Descriptor) -> f32 {
        euclidean_distance(&self.values, &other.values)
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<f32>::deserialize(deserializer)?;
        Descriptor::from_raw(&values).map_err(serde::de::Error::custom)
    }
}

/// Why a candidate descriptor was not added to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnrollRejection {
    /// Similarity did not exceed the enrollment floor.
    LowSimilarity,
    /// The store is at capacity.
    Full,
    /// Too close to an existing entry; carries the smallest distance found.
    NearDuplicate(f32),
}

/// Reference descriptors accepted for the current session.
///
/// The first entry is the registration seed. Later entries are high
/// confidence matches that differ from every stored entry by at least the
/// enrollment distance, which widens tolerance to pose and lighting drift.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    entries: Vec<Descriptor>,
    capacity: usize,
}

impl DescriptorStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Replace the whole library with a single seed descriptor.
    pub fn seed(&mut self, descriptor: Descriptor) {
        self.entries.clear();
        self.entries.push(descriptor);
    }

    /// Replace the library with previously accepted references. The first
    /// one becomes the seed; entries of a different dimension and entries
    /// beyond capacity are dropped. Returns how many were kept.
    pub fn seed_all(&mut self, descriptors: impl IntoIterator<Item = Descriptor>) -> usize {
        self.entries.clear();
        for descriptor in descriptors {
            if self.is_full() {
                break;
            }
            if self.check_compatible(&descriptor).is_ok() {
                self.entries.push(descriptor);
            }
        }
        self.entries.len()
    }

    /// The registration seed, if any.
    pub fn seed_descriptor(&self) -> Option<&Descriptor> {
        self.entries.first()
    }

    /// Dimension every probe must match.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(Descriptor::dimension)
    }

    /// Check that a probe can be compared against this store.
    pub fn check_compatible(&self, probe: &Descriptor) -> Result<(), DescriptorError> {
        match self.dimension() {
            Some(expected) if expected != probe.dimension() => {
                Err(DescriptorError::DimensionMismatch {
                    expected,
                    got: probe.dimension(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Smallest distance between `probe` and any stored descriptor.
    pub fn best_distance(&self, probe: &Descriptor) -> Option<f32> {
        self.entries
            .iter()
            .map(|entry| entry.distance(probe))
            .min_by(f32::total_cmp)
    }

    /// Add `candidate` if it is a confident match, the store has room, and it
    /// is at least `min_distance` away from every stored descriptor.
    pub fn try_enroll(
        &mut self,
        candidate: &Descriptor,
        similarity: f32,
        min_similarity: f32,
        min_distance: f32,
    ) -> Result<(), EnrollRejection> {
        if similarity <= min_similarity {
            return Err(EnrollRejection::LowSimilarity);
        }
        if self.is_full() {
            return Err(EnrollRejection::Full);
        }
        if let Some(nearest) = self.best_distance(candidate) {
            if nearest < min_distance {
                return Err(EnrollRejection::NearDuplicate(nearest));
            }
        }

        self.entries.push(candidate.clone());
        tracing::debug!(
            entries = self.entries.len(),
            capacity = self.capacity,
            similarity,
            "descriptor enrolled"
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.iter()
    }
}
