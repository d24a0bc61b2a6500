//! Types exchanged with the external face detector / descriptor extractor.
//!
//! Detection and descriptor extraction happen outside this crate. The
//! [`FaceAnalyzer`] trait is the seam: it turns an image (or an already
//! analyzed frame) into zero or more [`Detection`]s.

use serde::{Deserialize, Serialize};

use crate::error::AnalyzerError;

/// Number of points in the 68-point facial landmark convention.
pub const LANDMARK_COUNT: usize = 68;

pub const NOSE_TIP: usize = 30;
/// Outer corner of the eye on the image-left side.
pub const LEFT_EYE_OUTER: usize = 36;
/// Outer corner of the eye on the image-right side.
pub const RIGHT_EYE_OUTER: usize = 45;
pub const MOUTH_LEFT_CORNER: usize = 48;
pub const UPPER_LIP_CENTER: usize = 51;
pub const MOUTH_RIGHT_CORNER: usize = 54;
pub const LOWER_LIP_CENTER: usize = 57;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Larger side of the box, in pixels.
    pub fn max_dimension(&self) -> f32 {
        self.width.max(self.height)
    }
}

/// One face found in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// 68 ordered landmark points.
    pub landmarks: Vec<Point>,
    /// Raw (not yet normalized) embedding.
    pub descriptor: Vec<f32>,
    #[serde(rename = "box")]
    pub bounding_box: FaceBox,
    /// Detector confidence, when the detector reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Detection {
    /// The 68-point landmark set, or `None` if the detector returned fewer points.
    pub fn landmark_set(&self) -> Option<&[Point]> {
        (self.landmarks.len() >= LANDMARK_COUNT).then_some(&self.landmarks[..LANDMARK_COUNT])
    }
}

/// Everything a detector reported for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn best(&self) -> Option<&Detection> {
        best_detection(&self.detections)
    }
}

/// Most confident detection; the first one when no scores are reported.
pub fn best_detection(detections: &[Detection]) -> Option<&Detection> {
    detections
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            let sa = a.score.unwrap_or(0.0);
            let sb = b.score.unwrap_or(0.0);
            // Ties go to the earlier detection.
            sa.total_cmp(&sb).then(ib.cmp(ia))
        })
        .map(|(_, detection)| detection)
}

/// External detector + descriptor extractor.
pub trait FaceAnalyzer {
    fn analyze(&mut self, image: &[u8]) -> Result<Vec<Detection>, AnalyzerError>;
}

/// Analyzer for frames that were already run through an external detector
/// and serialized as a [`DetectionBatch`] JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAnalyzer;

impl FaceAnalyzer for JsonAnalyzer {
    fn analyze(&mut self, image: &[u8]) -> Result<Vec<Detection>, AnalyzerError> {
        let batch: DetectionBatch = serde_json::from_slice(image)?;
        Ok(batch.detections)
    }
}
