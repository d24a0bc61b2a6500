//! One-shot photo comparison.
//!
//! The photo mode shares the descriptor store and similarity curve with the
//! live mode but skips liveness and accumulation: one probe, one decision.

use serde::Serialize;

use crate::descriptor::{Descriptor, DescriptorStore};
use crate::detection::{best_detection, Detection};
use crate::error::DescriptorError;
use crate::similarity::calculate_similarity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhotoComparison {
    /// Smallest distance to any stored reference.
    pub distance: f32,
    /// Similarity rounded to one decimal place.
    pub similarity: f32,
    pub threshold: f32,
    pub matched: bool,
}

/// Compare the most confident face in `detections` against `store`.
///
/// Returns `Ok(None)` when there is no face to compare or the store is empty.
pub fn compare_photo(
    store: &DescriptorStore,
    detections: &[Detection],
    threshold: f32,
) -> Result<Option<PhotoComparison>, DescriptorError> {
    let Some(probe) = best_detection(detections) else {
        return Ok(None);
    };
    let probe = Descriptor::from_raw(&probe.descriptor)?;
    store.check_compatible(&probe)?;

    let Some(distance) = store.best_distance(&probe) else {
        return Ok(None);
    };
    let similarity = (calculate_similarity(distance) * 10.0).round() / 10.0;

    Ok(Some(PhotoComparison {
        distance,
        similarity,
        threshold,
        matched: distance < threshold,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{FaceBox, Point, LANDMARK_COUNT};

    fn detection(descriptor: Vec<f32>, score: Option<f32>) -> Detection {
        Detection {
            landmarks: vec![Point::default(); LANDMARK_COUNT],
            descriptor,
            bounding_box: FaceBox::new(0.0, 0.0, 200.0, 240.0),
            score,
        }
    }

    /// Planar unit vector at chord distance `distance` from [1, 0, 0, 0].
    fn at_distance(distance: f32) -> Vec<f32> {
        let angle = 2.0 * (distance / 2.0).asin();
        vec![angle.cos(), angle.sin(), 0.0, 0.0]
    }

    fn store() -> DescriptorStore {
        let mut store = DescriptorStore::new(5);
        store.seed(Descriptor::from_raw(&[1.0, 0.0, 0.0, 0.0]).unwrap());
        store
    }

    #[test]
    fn test_match_below_threshold() {
        let result = compare_photo(&store(), &[detection(at_distance(0.30), None)], 0.35)
            .unwrap()
            .unwrap();
        assert!(result.matched);
        assert!((result.distance - 0.30).abs() < 1e-4);
        assert!((result.similarity - 78.0).abs() < 1e-3);
    }

    #[test]
    fn test_mismatch_above_threshold() {
        let result = compare_photo(&store(), &[detection(at_distance(0.37), None)], 0.35)
            .unwrap()
            .unwrap();
        assert!(!result.matched);
        // 78 - 0.875 × 23 = 57.875, rounded to one decimal.
        assert!((result.similarity - 57.9).abs() < 1e-3);
    }

    #[test]
    fn test_uses_most_confident_face() {
        let detections = [
            detection(at_distance(0.60), Some(0.5)),
            detection(at_distance(0.10), Some(0.9)),
        ];
        let result = compare_photo(&store(), &detections, 0.35).unwrap().unwrap();
        assert!(result.matched);
    }

    #[test]
    fn test_no_face() {
        assert_eq!(compare_photo(&store(), &[], 0.35).unwrap(), None);
        let empty = DescriptorStore::new(5);
        assert_eq!(
            compare_photo(&empty, &[detection(at_distance(0.1), None)], 0.35).unwrap(),
            None
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = compare_photo(&store(), &[detection(vec![1.0, 0.0], None)], 0.35).unwrap_err();
        assert_eq!(err, DescriptorError::DimensionMismatch { expected: 4, got: 2 });
    }
}
