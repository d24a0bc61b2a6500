//! Frame-by-frame match/fail accumulation.
//!
//! A single good frame is not enough to accept a face and a single bad one is
//! not enough to reject it. Each compared face moves `match_count` up or down
//! by one or two depending on how clearly it cleared (or missed) the
//! face-size dependent threshold; `fail_count` tracks consecutive trouble.
//! The first counter to reach its limit decides the session, once.

use serde::{Deserialize, Serialize};

use crate::config::{ThresholdTable, VerifyConfig};

/// Distance cutoff for a face whose larger box side is `face_size` pixels.
/// Larger faces give steadier descriptors, so they get a stricter cutoff.
pub fn dynamic_threshold(table: &ThresholdTable, face_size: f32) -> f32 {
    table.for_face_size(face_size)
}

/// How one comparison moved the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOutcome {
    /// Below threshold by more than the strong margin: +2.
    StrongMatch,
    /// Below threshold: +1.
    Match,
    /// Above threshold but within the near-miss margin: -1.
    NearMiss,
    /// Clearly above threshold: -2.
    Miss,
}

impl ComparisonOutcome {
    pub fn is_match(self) -> bool {
        matches!(self, Self::StrongMatch | Self::Match)
    }
}

/// Terminal decision of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Fail,
}

/// Working state for the faces of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTally {
    /// Highest similarity among the compared faces; 0 if none were compared.
    pub max_similarity: f32,
    /// Whether any face in this frame matched.
    pub has_match: bool,
    /// Faces that reached identity comparison.
    pub compared: usize,
}

impl FrameTally {
    /// Record a face's similarity. Returns true if it is the best seen so far
    /// in this frame.
    pub fn observe_similarity(&mut self, similarity: f32) -> bool {
        if similarity > self.max_similarity {
            self.max_similarity = similarity;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationAccumulator {
    required_match_frames: u32,
    max_fail_count: u32,
    strong_match_margin: f32,
    near_miss_margin: f32,
    absence_fail_ceiling: u32,
    match_count: u32,
    fail_count: u32,
    verdict: Option<Verdict>,
}

impl VerificationAccumulator {
    pub fn new(config: &VerifyConfig) -> Self {
        Self {
            required_match_frames: config.required_match_frames,
            max_fail_count: config.max_fail_count,
            strong_match_margin: config.strong_match_margin,
            near_miss_margin: config.near_miss_margin,
            absence_fail_ceiling: config.absence_fail_ceiling,
            match_count: 0,
            fail_count: 0,
            verdict: None,
        }
    }

    /// Fold one face comparison into the counters.
    ///
    /// After a verdict the counters are frozen and the outcome is only
    /// reported.
    pub fn apply_comparison(
        &mut self,
        tally: &mut FrameTally,
        distance: f32,
        threshold: f32,
    ) -> ComparisonOutcome {
        tally.compared += 1;

        let outcome = if distance < threshold {
            if threshold - distance > self.strong_match_margin {
                ComparisonOutcome::StrongMatch
            } else {
                ComparisonOutcome::Match
            }
        } else if distance < threshold + self.near_miss_margin {
            ComparisonOutcome::NearMiss
        } else {
            ComparisonOutcome::Miss
        };

        if self.is_terminal() {
            return outcome;
        }

        match outcome {
            ComparisonOutcome::StrongMatch | ComparisonOutcome::Match => {
                let step = if outcome == ComparisonOutcome::StrongMatch { 2 } else { 1 };
                self.match_count = (self.match_count + step).min(self.required_match_frames + 1);
                self.fail_count = 0;
                tally.has_match = true;
            }
            ComparisonOutcome::NearMiss | ComparisonOutcome::Miss => {
                let step = if outcome == ComparisonOutcome::NearMiss { 1 } else { 2 };
                self.match_count = self.match_count.saturating_sub(step);
                if !tally.has_match {
                    self.fail_count += 1;
                }
            }
        }

        tracing::debug!(
            distance,
            threshold,
            ?outcome,
            match_count = self.match_count,
            fail_count = self.fail_count,
            "comparison applied"
        );
        outcome
    }

    /// A frame with no face at all.
    ///
    /// Absence is penalized but cannot push `fail_count` past the ceiling on
    /// its own.
    pub fn record_absence(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.fail_count += 1;
        if self.fail_count >= self.absence_fail_ceiling {
            self.fail_count = self.fail_count.saturating_sub(1);
        }
    }

    /// A frame on which the detector itself failed.
    pub fn record_detector_failure(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.fail_count += 1;
    }

    /// Terminal check, run once per processed frame. Returns the verdict the
    /// first time one is reached and `None` ever after.
    pub fn conclude(&mut self) -> Option<Verdict> {
        if self.is_terminal() {
            return None;
        }
        let verdict = if self.match_count >= self.required_match_frames {
            Verdict::Success
        } else if self.fail_count >= self.max_fail_count {
            Verdict::Fail
        } else {
            return None;
        };
        self.verdict = Some(verdict);
        Some(verdict)
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn is_terminal(&self) -> bool {
        self.verdict.is_some()
    }

    pub fn match_count(&self) -> u32 {
        self.match_count
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    pub fn reset(&mut self) {
        self.match_count = 0;
        self.fail_count = 0;
        self.verdict = None;
    }
}
