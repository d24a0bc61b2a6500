//! Verification tuning. Every field has a default, so a TOML file only needs
//! to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Match-distance cutoff for faces whose larger box side exceeds `min_face_size` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub min_face_size: f32,
    pub threshold: f32,
}

/// Face-size dependent distance thresholds. Bands are checked in order, so
/// they must go from the largest face size to the smallest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub bands: Vec<ThresholdBand>,
    /// Used when the face is not larger than any band.
    pub fallback: f32,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            bands: vec![
                ThresholdBand { min_face_size: 200.0, threshold: 0.29 },
                ThresholdBand { min_face_size: 150.0, threshold: 0.33 },
                ThresholdBand { min_face_size: 100.0, threshold: 0.36 },
            ],
            fallback: 0.39,
        }
    }
}

impl ThresholdTable {
    /// Distance threshold for a face whose larger box side is `face_size` pixels.
    pub fn for_face_size(&self, face_size: f32) -> f32 {
        self.bands
            .iter()
            .find(|band| face_size > band.min_face_size)
            .map(|band| band.threshold)
            .unwrap_or(self.fallback)
    }
}

/// Mouth-open + head-turn challenge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// When false, frames go straight to identity comparison.
    pub enabled: bool,
    pub required_mouth_opens: u32,
    pub required_shakes: u32,
    /// Per-step timeout; 0 disables it.
    pub timeout_ms: u64,
    /// Delay between head-turn success and the completion notice.
    pub settle_delay_ms: u64,
    /// Absolute mouth height/width ratio above which the mouth counts as open.
    pub mouth_open_threshold: f32,
    /// Relative open test: ratio above `factor × running-minimum baseline`.
    pub mouth_baseline_factor: f32,
    /// Minimum gap between two counted mouth-open pulses.
    pub mouth_debounce_ms: u64,
    /// Nose/eye ratio above which the head is turned right.
    pub turn_right_ratio: f32,
    /// Nose/eye ratio below which the head is turned left.
    pub turn_left_ratio: f32,
    /// Ratios inside (center_min, center_max) recalibrate the head baseline.
    pub center_min: f32,
    pub center_max: f32,
    /// A turn recorded longer than this after the previous one starts a new sequence.
    pub turn_sequence_gap_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required_mouth_opens: 1,
            required_shakes: 1,
            timeout_ms: 6000,
            settle_delay_ms: 1000,
            mouth_open_threshold: 0.4,
            mouth_baseline_factor: 2.5,
            mouth_debounce_ms: 500,
            turn_right_ratio: 1.5,
            turn_left_ratio: 0.67,
            center_min: 0.85,
            center_max: 1.15,
            turn_sequence_gap_ms: 3000,
        }
    }
}

impl LivenessConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn mouth_debounce(&self) -> Duration {
        Duration::from_millis(self.mouth_debounce_ms)
    }

    pub fn turn_sequence_gap(&self) -> Duration {
        Duration::from_millis(self.turn_sequence_gap_ms)
    }
}

/// Session-wide verification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Fail count at which the session reports failure.
    pub max_fail_count: u32,
    /// Match count at which the session reports success.
    pub required_match_frames: u32,
    /// Capacity of the descriptor store, seed included.
    pub max_descriptors: usize,
    /// Capacity of the similarity smoothing history.
    pub max_similarity_frames: usize,
    /// Similarity a frame must exceed before its descriptor may be enrolled.
    pub enroll_min_similarity: f32,
    /// Minimum distance between a new descriptor and every stored one.
    pub enroll_min_distance: f32,
    /// Matches beating the threshold by more than this count double.
    pub strong_match_margin: f32,
    /// Misses within this distance of the threshold only lose one match point.
    pub near_miss_margin: f32,
    /// Fail count that an empty frame is not allowed to push past.
    pub absence_fail_ceiling: u32,
    /// Distance cutoff for the one-shot photo comparison.
    pub photo_threshold: f32,
    pub thresholds: ThresholdTable,
    pub liveness: LivenessConfig,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_fail_count: 4,
            required_match_frames: 3,
            max_descriptors: 5,
            max_similarity_frames: 12,
            enroll_min_similarity: 90.0,
            enroll_min_distance: 0.18,
            strong_match_margin: 0.08,
            near_miss_margin: 0.05,
            absence_fail_ceiling: 5,
            photo_threshold: 0.35,
            thresholds: ThresholdTable::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

impl VerifyConfig {
    /// Parse a TOML document and validate the result.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_fail_count", self.max_fail_count),
            ("required_match_frames", self.required_match_frames),
            ("liveness.required_mouth_opens", self.liveness.required_mouth_opens),
            ("liveness.required_shakes", self.liveness.required_shakes),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCount { field });
            }
        }
        if self.max_descriptors == 0 {
            return Err(ConfigError::ZeroCount { field: "max_descriptors" });
        }
        if self.max_similarity_frames == 0 {
            return Err(ConfigError::ZeroCount { field: "max_similarity_frames" });
        }

        for (field, value) in [
            ("photo_threshold", self.photo_threshold),
            ("thresholds.fallback", self.thresholds.fallback),
            ("liveness.mouth_open_threshold", self.liveness.mouth_open_threshold),
            ("liveness.mouth_baseline_factor", self.liveness.mouth_baseline_factor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositive { field, value });
            }
        }

        if self.thresholds.bands.is_empty() {
            return Err(ConfigError::EmptyThresholds);
        }
        let descending = self
            .thresholds
            .bands
            .windows(2)
            .all(|pair| pair[0].min_face_size > pair[1].min_face_size);
        if !descending {
            return Err(ConfigError::UnorderedThresholds);
        }

        let left = self.liveness.turn_left_ratio;
        let right = self.liveness.turn_right_ratio;
        if !(left > 0.0 && left < 1.0 && right > 1.0) {
            return Err(ConfigError::TurnThresholds { left, right });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(VerifyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_bands() {
        let table = ThresholdTable::default();
        assert_eq!(table.for_face_size(250.0), 0.29);
        assert_eq!(table.for_face_size(200.0), 0.33);
        assert_eq!(table.for_face_size(151.0), 0.33);
        assert_eq!(table.for_face_size(120.0), 0.36);
        assert_eq!(table.for_face_size(100.0), 0.39);
        assert_eq!(table.for_face_size(40.0), 0.39);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VerifyConfig::from_toml(
            "max_fail_count = 6\n\n[liveness]\nenabled = false\ntimeout_ms = 0\n",
        )
        .unwrap();
        assert_eq!(config.max_fail_count, 6);
        assert_eq!(config.required_match_frames, 3);
        assert!(!config.liveness.enabled);
        assert_eq!(config.liveness.timeout(), None);
        assert_eq!(config.liveness.required_shakes, 1);
        assert_eq!(config.thresholds, ThresholdTable::default());
    }

    #[test]
    fn test_rejects_zero_counts() {
        let config = VerifyConfig {
            required_match_frames: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCount { field: "required_match_frames" })
        );
    }

    #[test]
    fn test_rejects_unordered_bands() {
        let mut config = VerifyConfig::default();
        config.thresholds.bands.reverse();
        assert_eq!(config.validate(), Err(ConfigError::UnorderedThresholds));
    }

    #[test]
    fn test_rejects_inverted_turn_ratios() {
        let mut config = VerifyConfig::default();
        config.liveness.turn_left_ratio = 1.5;
        config.liveness.turn_right_ratio = 0.67;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TurnThresholds { .. })
        ));
    }

    #[test]
    fn test_malformed_toml() {
        let err = VerifyConfig::from_toml("max_fail_count = \"four\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
