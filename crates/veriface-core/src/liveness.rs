//! Active liveness challenge: open the mouth, then turn the head.
//!
//! A printed photograph or a still image on a screen cannot change its facial
//! geometry on request. The sequencer asks the subject to perform two actions
//! in order and watches the 68-point landmarks produced by the detection
//! pipeline for them:
//!
//! 1. **Mouth open**: lip gap relative to mouth width rises above a fixed
//!    threshold (or well above the subject's own closed-mouth baseline) and
//!    then falls again. One open→close pulse is one action.
//! 2. **Head turn**: the nose moves off-centre between the outer eye corners
//!    to one side and then to the other within a few seconds.
//!
//! Only when both steps are done does [`LivenessSequencer::process`] return
//! `true`, letting the caller use the frame for identity comparison.
//!
//! # Timing
//!
//! Every call takes an explicit `Instant`. The per-step timeout and the
//! settle delay after the last step are deadlines checked on each frame and
//! on [`LivenessSequencer::poll`]; nothing here sleeps.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images, looping clips that do
//!   not happen to contain both actions in order.
//! - **Does not block:** Live video replay of a cooperating subject,
//!   3D masks with articulated jaws.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::LivenessConfig;
use crate::detection::{
    FaceBox, Point, LANDMARK_COUNT, LEFT_EYE_OUTER, LOWER_LIP_CENTER, MOUTH_LEFT_CORNER,
    MOUTH_RIGHT_CORNER, NOSE_TIP, RIGHT_EYE_OUTER, UPPER_LIP_CENTER,
};

/// Challenge step. Steps only advance in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStep {
    Mouth = 0,
    HeadTurn = 1,
    Done = 2,
}

/// Horizontal head orientation relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Left = -1,
    Neutral = 0,
    Right = 1,
}

/// Notable sequencer transitions, drained by the session after each frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LivenessEvent {
    Started,
    MouthOpened,
    MouthCounted { count: u32, required: u32 },
    HeadTurned { direction: TurnDirection },
    ShakeCounted { count: u32, required: u32 },
    StepChanged { step: LivenessStep },
    Completed,
    TimedOut { step: LivenessStep },
}

/// Lip gap divided by mouth width, or `None` for a degenerate mouth.
pub fn mouth_ratio(landmarks: &[Point]) -> Option<f32> {
    if landmarks.len() < LANDMARK_COUNT {
        return None;
    }
    let height = (landmarks[LOWER_LIP_CENTER].y - landmarks[UPPER_LIP_CENTER].y).abs();
    let width = (landmarks[MOUTH_RIGHT_CORNER].x - landmarks[MOUTH_LEFT_CORNER].x).abs();
    if width == 0.0 {
        return None;
    }
    Some(height / width)
}

/// Nose-to-left-eye over right-eye-to-nose horizontal distance.
///
/// About 1.0 when facing the camera. `None` unless the nose lies strictly
/// between the two outer eye corners.
pub fn head_turn_ratio(landmarks: &[Point]) -> Option<f32> {
    if landmarks.len() < LANDMARK_COUNT {
        return None;
    }
    let nose_x = landmarks[NOSE_TIP].x;
    let left = nose_x - landmarks[LEFT_EYE_OUTER].x;
    let right = landmarks[RIGHT_EYE_OUTER].x - nose_x;
    if left <= 0.0 || right <= 0.0 {
        return None;
    }
    Some(left / right)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouthSignal {
    None,
    /// The mouth just opened.
    Opened,
    /// The mouth closed after being open; one counted action.
    Pulse,
}

/// Edge-triggered mouth-open detector with a running-minimum baseline.
#[derive(Debug, Clone)]
pub struct MouthOpenDetector {
    threshold: f32,
    baseline_factor: f32,
    debounce: std::time::Duration,
    baseline: Option<f32>,
    was_open: bool,
    last_pulse: Option<Instant>,
}

impl MouthOpenDetector {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            threshold: config.mouth_open_threshold,
            baseline_factor: config.mouth_baseline_factor,
            debounce: config.mouth_debounce(),
            baseline: None,
            was_open: false,
            last_pulse: None,
        }
    }

    pub fn observe(&mut self, landmarks: &[Point], now: Instant) -> MouthSignal {
        let Some(ratio) = mouth_ratio(landmarks) else {
            return MouthSignal::None;
        };

        if self.baseline.map_or(true, |b| ratio < b) {
            self.baseline = Some(ratio);
        }

        let is_open = ratio > self.threshold
            || self
                .baseline
                .is_some_and(|b| b > 0.0 && ratio > b * self.baseline_factor);

        match (is_open, self.was_open) {
            (true, false) => {
                self.was_open = true;
                MouthSignal::Opened
            }
            (false, true) => {
                self.was_open = false;
                let debounced = self
                    .last_pulse
                    .map_or(true, |t| now.saturating_duration_since(t) > self.debounce);
                if debounced {
                    self.last_pulse = Some(now);
                    MouthSignal::Pulse
                } else {
                    MouthSignal::None
                }
            }
            _ => MouthSignal::None,
        }
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }

    pub fn is_open(&self) -> bool {
        self.was_open
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.was_open = false;
        self.last_pulse = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    None,
    /// A new turn direction was recorded.
    Turned(TurnDirection),
    /// A turn completed a turn-and-return; the sequence was cleared.
    Shake(TurnDirection),
}

/// Head-turn detector that looks for two adjacent opposite turns.
#[derive(Debug, Clone)]
pub struct HeadTurnDetector {
    right_ratio: f32,
    left_ratio: f32,
    center: (f32, f32),
    sequence_gap: std::time::Duration,
    baseline: Option<f32>,
    direction: TurnDirection,
    sequence: Vec<(TurnDirection, Instant)>,
    last_shake: Option<Instant>,
}

impl HeadTurnDetector {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            right_ratio: config.turn_right_ratio,
            left_ratio: config.turn_left_ratio,
            center: (config.center_min, config.center_max),
            sequence_gap: config.turn_sequence_gap(),
            baseline: None,
            direction: TurnDirection::Neutral,
            sequence: Vec::new(),
            last_shake: None,
        }
    }

    pub fn classify(&self, ratio: f32) -> TurnDirection {
        if ratio > self.right_ratio {
            TurnDirection::Right
        } else if ratio < self.left_ratio {
            TurnDirection::Left
        } else {
            TurnDirection::Neutral
        }
    }

    pub fn observe(&mut self, landmarks: &[Point], face_box: &FaceBox, now: Instant) -> TurnSignal {
        if face_box.width <= 0.0 || face_box.height <= 0.0 {
            return TurnSignal::None;
        }
        let Some(ratio) = head_turn_ratio(landmarks) else {
            return TurnSignal::None;
        };

        if ratio > self.center.0 && ratio < self.center.1 {
            self.baseline = Some(ratio);
        }

        let direction = self.classify(ratio);
        if direction == TurnDirection::Neutral || direction == self.direction {
            return TurnSignal::None;
        }

        if let Some(&(_, last_time)) = self.sequence.last() {
            if now.saturating_duration_since(last_time) > self.sequence_gap {
                tracing::debug!("head-turn sequence went stale, starting over");
                self.sequence.clear();
            }
        }

        let last_direction = self
            .sequence
            .last()
            .map_or(TurnDirection::Neutral, |&(dir, _)| dir);
        if direction == last_direction {
            return TurnSignal::None;
        }

        self.sequence.push((direction, now));
        self.direction = direction;

        let shaken = self.sequence.windows(2).any(|pair| {
            let (a, b) = (pair[0].0, pair[1].0);
            a != b && a != TurnDirection::Neutral && b != TurnDirection::Neutral
        });
        if shaken {
            self.sequence.clear();
            self.last_shake = Some(now);
            TurnSignal::Shake(direction)
        } else {
            TurnSignal::Turned(direction)
        }
    }

    /// Last near-centred ratio, if one has been seen since the last reset.
    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }

    pub fn direction(&self) -> TurnDirection {
        self.direction
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.direction = TurnDirection::Neutral;
        self.sequence.clear();
        self.last_shake = None;
    }
}

/// Mouth → head-turn → done state machine.
#[derive(Debug, Clone)]
pub struct LivenessSequencer {
    config: LivenessConfig,
    active: bool,
    step: LivenessStep,
    mouth: MouthOpenDetector,
    head: HeadTurnDetector,
    mouth_opens: u32,
    shakes: u32,
    deadline: Option<Instant>,
    settle_until: Option<Instant>,
    events: Vec<LivenessEvent>,
}

impl LivenessSequencer {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            mouth: MouthOpenDetector::new(&config),
            head: HeadTurnDetector::new(&config),
            config,
            active: false,
            step: LivenessStep::Mouth,
            mouth_opens: 0,
            shakes: 0,
            deadline: None,
            settle_until: None,
            events: Vec::new(),
        }
    }

    /// Begin the challenge at the mouth step and arm the timeout.
    pub fn start(&mut self, now: Instant) {
        self.restart(now);
        self.active = true;
        tracing::info!("liveness challenge started");
        self.events.push(LivenessEvent::Started);
    }

    /// Feed one face's landmarks. Returns `true` only once the challenge is
    /// done; until then the frame is consumed for liveness progress only.
    pub fn process(&mut self, landmarks: &[Point], face_box: &FaceBox, now: Instant) -> bool {
        self.poll(now);

        if self.step == LivenessStep::Done {
            return true;
        }
        if !self.active {
            return false;
        }

        match self.step {
            LivenessStep::Mouth => match self.mouth.observe(landmarks, now) {
                MouthSignal::Opened => self.events.push(LivenessEvent::MouthOpened),
                MouthSignal::Pulse => {
                    self.mouth_opens += 1;
                    let required = self.config.required_mouth_opens;
                    tracing::debug!(count = self.mouth_opens, required, "mouth open counted");
                    self.events.push(LivenessEvent::MouthCounted {
                        count: self.mouth_opens,
                        required,
                    });
                    if self.mouth_opens >= required {
                        self.advance_to_head_turn(now);
                    }
                }
                MouthSignal::None => {}
            },
            LivenessStep::HeadTurn => match self.head.observe(landmarks, face_box, now) {
                TurnSignal::Turned(direction) => {
                    self.events.push(LivenessEvent::HeadTurned { direction });
                }
                TurnSignal::Shake(direction) => {
                    self.events.push(LivenessEvent::HeadTurned { direction });
                    self.shakes += 1;
                    let required = self.config.required_shakes;
                    tracing::debug!(count = self.shakes, required, "head shake counted");
                    self.events.push(LivenessEvent::ShakeCounted {
                        count: self.shakes,
                        required,
                    });
                    if self.shakes >= required {
                        self.finish(now);
                    }
                }
                TurnSignal::None => {}
            },
            LivenessStep::Done => unreachable!("done is handled above"),
        }

        false
    }

    /// Fire due timers: the settle-delay completion and the step timeout.
    pub fn poll(&mut self, now: Instant) {
        if let Some(until) = self.settle_until {
            if now >= until {
                self.settle_until = None;
                self.active = false;
                tracing::info!("liveness challenge completed");
                self.events.push(LivenessEvent::Completed);
            }
        }

        if !self.active || self.step == LivenessStep::Done {
            return;
        }
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                let step = self.step;
                tracing::warn!(?step, "liveness step timed out, restarting challenge");
                self.restart(now);
                self.events.push(LivenessEvent::TimedOut { step });
            }
        }
    }

    /// Drop any pending timer so it can no longer fire.
    pub fn cancel_pending(&mut self) {
        self.deadline = None;
        self.settle_until = None;
    }

    /// Back to the initial, inactive state.
    pub fn reset(&mut self) {
        self.cancel_pending();
        self.active = false;
        self.step = LivenessStep::Mouth;
        self.mouth_opens = 0;
        self.shakes = 0;
        self.mouth.reset();
        self.head.reset();
        self.events.clear();
    }

    pub fn drain_events(&mut self) -> Vec<LivenessEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn step(&self) -> LivenessStep {
        self.step
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_done(&self) -> bool {
        self.step == LivenessStep::Done
    }

    /// True while the post-challenge settle delay is running.
    pub fn is_transitioning(&self) -> bool {
        self.settle_until.is_some()
    }

    pub fn mouth_opens(&self) -> u32 {
        self.mouth_opens
    }

    pub fn shakes(&self) -> u32 {
        self.shakes
    }

    pub fn mouth_baseline(&self) -> Option<f32> {
        self.mouth.baseline()
    }

    pub fn head_baseline(&self) -> Option<f32> {
        self.head.baseline()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Share of the challenge completed, 0–100.
    pub fn progress_percent(&self) -> f32 {
        match self.step {
            LivenessStep::Mouth => {
                self.mouth_opens as f32 / self.config.required_mouth_opens as f32 * 40.0
            }
            LivenessStep::HeadTurn => {
                40.0 + self.shakes as f32 / self.config.required_shakes as f32 * 40.0
            }
            LivenessStep::Done => 100.0,
        }
    }

    fn restart(&mut self, now: Instant) {
        self.step = LivenessStep::Mouth;
        self.mouth_opens = 0;
        self.shakes = 0;
        self.mouth.reset();
        self.head.reset();
        self.settle_until = None;
        self.arm_timeout(now);
    }

    fn advance_to_head_turn(&mut self, now: Instant) {
        self.step = LivenessStep::HeadTurn;
        self.head.reset();
        self.arm_timeout(now);
        tracing::info!("liveness: mouth step passed");
        self.events.push(LivenessEvent::StepChanged {
            step: LivenessStep::HeadTurn,
        });
    }

    fn finish(&mut self, now: Instant) {
        self.step = LivenessStep::Done;
        self.deadline = None;
        self.settle_until = Some(now + self.config.settle_delay());
        tracing::info!("liveness: head-turn step passed");
        self.events.push(LivenessEvent::StepChanged {
            step: LivenessStep::Done,
        });
    }

    fn arm_timeout(&mut self, now: Instant) {
        self.deadline = self.config.timeout().map(|timeout| now + timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const BOX: FaceBox = FaceBox::new(80.0, 150.0, 160.0, 200.0);

    /// Synthetic 68-point face with the given mouth ratio and head-turn ratio.
    fn face(mouth: f32, turn: f32) -> Vec<Point> {
        let mut points = vec![Point::new(150.0, 200.0); LANDMARK_COUNT];
        points[LEFT_EYE_OUTER] = Point::new(100.0, 180.0);
        points[RIGHT_EYE_OUTER] = Point::new(200.0, 180.0);
        points[NOSE_TIP] = Point::new((100.0 + 200.0 * turn) / (1.0 + turn), 215.0);
        points[MOUTH_LEFT_CORNER] = Point::new(120.0, 255.0);
        points[MOUTH_RIGHT_CORNER] = Point::new(180.0, 255.0);
        points[UPPER_LIP_CENTER] = Point::new(150.0, 250.0);
        points[LOWER_LIP_CENTER] = Point::new(150.0, 250.0 + mouth * 60.0);
        points
    }

    fn clock() -> impl Fn(u64) -> Instant {
        let t0 = Instant::now();
        move |ms| t0 + Duration::from_millis(ms)
    }

    fn sequencer(config: LivenessConfig) -> LivenessSequencer {
        LivenessSequencer::new(config)
    }

    /// Closed → open → closed, starting at `start` ms.
    fn mouth_pulse(seq: &mut LivenessSequencer, at: &impl Fn(u64) -> Instant, start: u64) {
        assert!(!seq.process(&face(0.1, 1.0), &BOX, at(start)));
        assert!(!seq.process(&face(0.6, 1.0), &BOX, at(start + 100)));
        assert!(!seq.process(&face(0.1, 1.0), &BOX, at(start + 300)));
    }

    #[test]
    fn test_ratios() {
        assert!((mouth_ratio(&face(0.5, 1.0)).unwrap() - 0.5).abs() < 1e-5);
        assert!((head_turn_ratio(&face(0.1, 2.0)).unwrap() - 2.0).abs() < 1e-4);
        assert!((head_turn_ratio(&face(0.1, 0.5)).unwrap() - 0.5).abs() < 1e-4);
        assert!(mouth_ratio(&face(0.1, 1.0)[..10]).is_none());
    }

    #[test]
    fn test_zero_width_mouth_is_ignored() {
        let mut points = face(0.8, 1.0);
        points[MOUTH_RIGHT_CORNER].x = points[MOUTH_LEFT_CORNER].x;
        assert!(mouth_ratio(&points).is_none());

        let at = clock();
        let mut detector = MouthOpenDetector::new(&LivenessConfig::default());
        assert_eq!(detector.observe(&points, at(0)), MouthSignal::None);
        assert_eq!(detector.baseline(), None);
    }

    #[test]
    fn test_nose_outside_eyes_is_ignored() {
        let mut points = face(0.1, 1.0);
        points[NOSE_TIP].x = 90.0;
        assert!(head_turn_ratio(&points).is_none());

        let at = clock();
        let mut detector = HeadTurnDetector::new(&LivenessConfig::default());
        assert_eq!(detector.observe(&points, &BOX, at(0)), TurnSignal::None);
    }

    #[test]
    fn test_mouth_pulse_counts_on_close() {
        let at = clock();
        let mut detector = MouthOpenDetector::new(&LivenessConfig::default());
        assert_eq!(detector.observe(&face(0.1, 1.0), at(0)), MouthSignal::None);
        assert_eq!(detector.observe(&face(0.6, 1.0), at(100)), MouthSignal::Opened);
        assert_eq!(detector.observe(&face(0.7, 1.0), at(200)), MouthSignal::None);
        assert_eq!(detector.observe(&face(0.1, 1.0), at(300)), MouthSignal::Pulse);
    }

    #[test]
    fn test_mouth_relative_to_baseline() {
        let at = clock();
        let mut detector = MouthOpenDetector::new(&LivenessConfig::default());
        detector.observe(&face(0.08, 1.0), at(0));
        // 0.25 is below the absolute threshold but above 2.5 × 0.08.
        assert_eq!(detector.observe(&face(0.25, 1.0), at(100)), MouthSignal::Opened);
        assert_eq!(detector.observe(&face(0.09, 1.0), at(200)), MouthSignal::Pulse);
    }

    #[test]
    fn test_mouth_debounce() {
        let at = clock();
        let mut detector = MouthOpenDetector::new(&LivenessConfig::default());
        detector.observe(&face(0.1, 1.0), at(0));
        detector.observe(&face(0.6, 1.0), at(50));
        assert_eq!(detector.observe(&face(0.1, 1.0), at(100)), MouthSignal::Pulse);
        detector.observe(&face(0.6, 1.0), at(200));
        assert_eq!(detector.observe(&face(0.1, 1.0), at(400)), MouthSignal::None);
        detector.observe(&face(0.6, 1.0), at(500));
        assert_eq!(detector.observe(&face(0.1, 1.0), at(700)), MouthSignal::Pulse);
    }

    #[test]
    fn test_noise_never_advances() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));
        for i in 0..200u64 {
            let wobble = 0.10 + (i % 3) as f32 * 0.01;
            let turn = 0.95 + (i % 5) as f32 * 0.03;
            assert!(!seq.process(&face(wobble, turn), &BOX, at(i * 20)));
        }
        assert_eq!(seq.step(), LivenessStep::Mouth);
        assert_eq!(seq.mouth_opens(), 0);
    }

    #[test]
    fn test_mouth_then_head_turn_reaches_done() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));

        mouth_pulse(&mut seq, &at, 0);
        assert_eq!(seq.step(), LivenessStep::HeadTurn);

        assert!(!seq.process(&face(0.1, 1.0), &BOX, at(400)));
        assert!(!seq.process(&face(0.1, 2.0), &BOX, at(600)));
        assert_eq!(seq.step(), LivenessStep::HeadTurn);
        // The completing frame itself is not released for comparison.
        assert!(!seq.process(&face(0.1, 0.5), &BOX, at(900)));
        assert_eq!(seq.step(), LivenessStep::Done);
        assert!(seq.is_transitioning());
        assert_eq!(seq.progress_percent(), 100.0);

        assert!(seq.process(&face(0.1, 1.0), &BOX, at(950)));

        let events = seq.drain_events();
        assert!(events.contains(&LivenessEvent::StepChanged {
            step: LivenessStep::HeadTurn
        }));
        assert!(events.contains(&LivenessEvent::HeadTurned {
            direction: TurnDirection::Right
        }));
        assert!(events.contains(&LivenessEvent::ShakeCounted { count: 1, required: 1 }));
    }

    #[test]
    fn test_done_ignores_further_landmarks() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));
        mouth_pulse(&mut seq, &at, 0);
        seq.process(&face(0.1, 0.5), &BOX, at(400));
        seq.process(&face(0.1, 2.0), &BOX, at(500));
        assert!(seq.is_done());

        for i in 0..10u64 {
            let mouth = if i % 2 == 0 { 0.9 } else { 0.1 };
            assert!(seq.process(&face(mouth, 2.5), &BOX, at(600 + i * 100)));
        }
        assert_eq!(seq.mouth_opens(), 1);
        assert_eq!(seq.shakes(), 1);
    }

    #[test]
    fn test_same_direction_repeated_does_not_count() {
        let at = clock();
        let mut detector = HeadTurnDetector::new(&LivenessConfig::default());
        assert_eq!(
            detector.observe(&face(0.1, 2.0), &BOX, at(0)),
            TurnSignal::Turned(TurnDirection::Right)
        );
        assert_eq!(detector.observe(&face(0.1, 2.2), &BOX, at(100)), TurnSignal::None);
        assert_eq!(detector.observe(&face(0.1, 1.0), &BOX, at(200)), TurnSignal::None);
        assert_eq!(detector.observe(&face(0.1, 2.0), &BOX, at(300)), TurnSignal::None);
        assert_eq!(
            detector.observe(&face(0.1, 0.5), &BOX, at(400)),
            TurnSignal::Shake(TurnDirection::Left)
        );
    }

    #[test]
    fn test_stale_turn_sequence_restarts() {
        let at = clock();
        let mut detector = HeadTurnDetector::new(&LivenessConfig::default());
        detector.observe(&face(0.1, 2.0), &BOX, at(0));
        // More than 3 s later: the right turn is forgotten.
        assert_eq!(
            detector.observe(&face(0.1, 0.5), &BOX, at(3500)),
            TurnSignal::Turned(TurnDirection::Left)
        );
        assert_eq!(
            detector.observe(&face(0.1, 2.0), &BOX, at(3800)),
            TurnSignal::Shake(TurnDirection::Right)
        );
    }

    #[test]
    fn test_head_baseline_only_when_centred() {
        let at = clock();
        let mut detector = HeadTurnDetector::new(&LivenessConfig::default());
        detector.observe(&face(0.1, 1.3), &BOX, at(0));
        assert_eq!(detector.baseline(), None);
        detector.observe(&face(0.1, 1.05), &BOX, at(100));
        assert!((detector.baseline().unwrap() - 1.05).abs() < 1e-4);
    }

    #[test]
    fn test_degenerate_box_is_ignored() {
        let at = clock();
        let mut detector = HeadTurnDetector::new(&LivenessConfig::default());
        let flat = FaceBox::new(0.0, 0.0, 0.0, 100.0);
        assert_eq!(detector.observe(&face(0.1, 2.0), &flat, at(0)), TurnSignal::None);
    }

    #[test]
    fn test_required_repetitions() {
        let at = clock();
        let config = LivenessConfig {
            required_mouth_opens: 2,
            required_shakes: 2,
            ..Default::default()
        };
        let mut seq = sequencer(config);
        seq.start(at(0));

        mouth_pulse(&mut seq, &at, 0);
        assert_eq!(seq.step(), LivenessStep::Mouth);
        assert_eq!(seq.progress_percent(), 20.0);
        mouth_pulse(&mut seq, &at, 1000);
        assert_eq!(seq.step(), LivenessStep::HeadTurn);

        seq.process(&face(0.1, 2.0), &BOX, at(1500));
        seq.process(&face(0.1, 0.5), &BOX, at(1700));
        assert_eq!(seq.shakes(), 1);
        assert_eq!(seq.step(), LivenessStep::HeadTurn);
        seq.process(&face(0.1, 2.0), &BOX, at(1900));
        seq.process(&face(0.1, 0.5), &BOX, at(2100));
        assert_eq!(seq.shakes(), 2);
        assert!(seq.is_done());
    }

    #[test]
    fn test_timeout_restarts_at_mouth() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));
        mouth_pulse(&mut seq, &at, 1000);
        assert_eq!(seq.step(), LivenessStep::HeadTurn);
        seq.process(&face(0.1, 2.0), &BOX, at(1500));
        seq.drain_events();

        // Timer was rearmed at 1300 when the mouth step passed.
        seq.poll(at(7000));
        assert_eq!(seq.step(), LivenessStep::HeadTurn);
        seq.poll(at(7300));
        assert_eq!(seq.step(), LivenessStep::Mouth);
        assert_eq!(seq.mouth_opens(), 0);
        assert!(seq.is_active());
        assert_eq!(
            seq.drain_events(),
            vec![LivenessEvent::TimedOut {
                step: LivenessStep::HeadTurn
            }]
        );

        // The old right turn is gone: the new challenge starts from scratch.
        assert_eq!(seq.head_baseline(), None);
        assert_eq!(seq.deadline(), Some(at(13300)));
    }

    #[test]
    fn test_timeout_disabled() {
        let at = clock();
        let config = LivenessConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        let mut seq = sequencer(config);
        seq.start(at(0));
        seq.poll(at(60_000));
        assert!(seq.drain_events().iter().all(|e| !matches!(e, LivenessEvent::TimedOut { .. })));
        assert_eq!(seq.deadline(), None);
    }

    #[test]
    fn test_done_clears_timeout_and_settles_once() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));
        mouth_pulse(&mut seq, &at, 0);
        seq.process(&face(0.1, 2.0), &BOX, at(400));
        seq.process(&face(0.1, 0.5), &BOX, at(500));
        assert_eq!(seq.deadline(), None);
        seq.drain_events();

        seq.poll(at(1499));
        assert!(seq.drain_events().is_empty());
        seq.poll(at(1500));
        assert_eq!(seq.drain_events(), vec![LivenessEvent::Completed]);
        assert!(!seq.is_transitioning());
        seq.poll(at(30_000));
        assert!(seq.drain_events().is_empty());
        assert!(seq.is_done());
    }

    #[test]
    fn test_cancel_pending_suppresses_completion() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));
        mouth_pulse(&mut seq, &at, 0);
        seq.process(&face(0.1, 2.0), &BOX, at(400));
        seq.process(&face(0.1, 0.5), &BOX, at(500));
        seq.drain_events();

        seq.cancel_pending();
        seq.poll(at(5000));
        assert!(seq.drain_events().is_empty());
    }

    #[test]
    fn test_reset() {
        let at = clock();
        let mut seq = sequencer(LivenessConfig::default());
        seq.start(at(0));
        mouth_pulse(&mut seq, &at, 0);
        seq.reset();
        assert_eq!(seq.step(), LivenessStep::Mouth);
        assert!(!seq.is_active());
        assert_eq!(seq.mouth_opens(), 0);
        assert_eq!(seq.mouth_baseline(), None);
        assert_eq!(seq.deadline(), None);
        assert!(seq.drain_events().is_empty());
        // Inactive sequencer ignores frames.
        mouth_pulse(&mut seq, &at, 1000);
        assert_eq!(seq.mouth_opens(), 0);
    }
}
