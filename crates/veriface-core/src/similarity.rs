//! Distance → similarity mapping and rolling similarity smoothing.
//!
//! The mapping is piecewise, with five regimes split at distances 0.22,
//! 0.30, 0.38 and 0.45. The regimes around the match boundary (≈0.29–0.39)
//! are the steepest, so small distance changes near the decision threshold
//! move the score the most; very small and very large distances saturate.

use std::collections::VecDeque;

/// Below this many samples the filter returns the raw reading.
const MIN_SMOOTHING_SAMPLES: usize = 3;

/// Samples further than this from the median are ignored when averaging.
const OUTLIER_BAND: f32 = 12.0;

/// Map a descriptor distance to a 0–100 similarity score.
///
/// Monotonically non-increasing in `distance`. The curve is not continuous
/// at 0.22 (92.08 from the left, 92 from the right); the step is kept.
pub fn calculate_similarity(distance: f32) -> f32 {
    if distance > 0.45 {
        (25.0 - (distance - 0.45) * 100.0).max(5.0)
    } else if distance > 0.38 {
        (55.0 - (distance - 0.38) * 430.0).max(25.0)
    } else if distance > 0.30 {
        let ratio = (distance - 0.30) / 0.08;
        78.0 - ratio * 23.0
    } else if distance > 0.22 {
        let ratio = (distance - 0.22) / 0.08;
        92.0 - ratio * 14.0
    } else {
        100.0 - distance * 36.0
    }
}

/// Rolling history of similarity readings with outlier-rejecting smoothing.
#[derive(Debug, Clone)]
pub struct SimilarityFilter {
    history: VecDeque<f32>,
    capacity: usize,
}

impl SimilarityFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `raw` and return the smoothed similarity.
    ///
    /// With fewer than three samples the raw value is returned. Otherwise the
    /// samples within 12 points of the median are averaged and blended 50/50
    /// with `raw`.
    pub fn smooth(&mut self, raw: f32) -> f32 {
        self.history.push_back(raw);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        if self.history.len() < MIN_SMOOTHING_SAMPLES {
            return raw;
        }

        let mut sorted: Vec<f32> = self.history.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);
        let median = sorted[sorted.len() / 2];

        let (sum, count) = self
            .history
            .iter()
            .filter(|v| (**v - median).abs() < OUTLIER_BAND)
            .fold((0.0f32, 0usize), |(sum, count), v| (sum + v, count + 1));

        if count == 0 {
            return median;
        }

        let average = sum / count as f32;
        raw * 0.5 + average * 0.5
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Samples oldest first.
    pub fn history(&self) -> impl Iterator<Item = f32> + '_ {
        self.history.iter().copied()
    }
}
