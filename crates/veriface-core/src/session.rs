//! A verification session: one registered reference, one stream of frames.
//!
//! The session owns all mutable verification state (descriptor store,
//! similarity history, liveness sequencer, match/fail counters) and reports
//! through an [`EventSink`]. It never blocks: the caller runs the external
//! detector and hands the detections back.
//!
//! Frame processing is not reentrant. [`VerificationSession::begin_frame`]
//! hands out at most one [`FrameTicket`] at a time; a caller that cannot get
//! one should drop the frame rather than queue it. A ticket issued before a
//! reset is stale and its frame is discarded on return.

use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};

use crate::accumulator::{dynamic_threshold, FrameTally, VerificationAccumulator, Verdict};
use crate::config::VerifyConfig;
use crate::descriptor::{Descriptor, DescriptorStore};
use crate::detection::{best_detection, Detection, FaceAnalyzer};
use crate::error::{AnalyzerError, SessionError};
use crate::event::{EventSink, FailReason, Progress, ProgressStep, VerifyEvent, VerifyResult};
use crate::liveness::{LivenessEvent, LivenessSequencer, LivenessStep};
use crate::photo::{compare_photo, PhotoComparison};
use crate::similarity::{calculate_similarity, SimilarityFilter};

/// Permission to process one frame. Consumed by `finish_frame` or
/// `abandon_frame`.
#[derive(Debug)]
#[must_use = "a frame ticket must be returned with finish_frame or abandon_frame"]
pub struct FrameTicket {
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    None,
    Success,
    Fail,
}

impl From<Option<Verdict>> for Terminal {
    fn from(verdict: Option<Verdict>) -> Self {
        match verdict {
            None => Terminal::None,
            Some(Verdict::Success) => Terminal::Success,
            Some(Verdict::Fail) => Terminal::Fail,
        }
    }
}

/// State of the session after one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub match_count: u32,
    pub fail_count: u32,
    /// Smoothed similarity.
    pub similarity: f32,
    pub terminal: Terminal,
    /// The frame was not processed (busy, unregistered, terminal, or stale).
    pub skipped: bool,
    /// Faces the detector reported.
    pub faces: usize,
    /// Faces that passed liveness gating and were compared.
    pub compared: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_step: Option<LivenessStep>,
}

pub struct VerificationSession<S: EventSink = Vec<VerifyEvent>> {
    config: VerifyConfig,
    store: DescriptorStore,
    filter: SimilarityFilter,
    liveness: LivenessSequencer,
    accumulator: VerificationAccumulator,
    similarity: f32,
    in_flight: bool,
    epoch: u64,
    sink: S,
}

impl VerificationSession {
    /// Session that buffers its events; collect them with [`Self::take_events`].
    pub fn new(config: VerifyConfig) -> Self {
        Self::with_sink(config, Vec::new())
    }

    pub fn take_events(&mut self) -> Vec<VerifyEvent> {
        std::mem::take(&mut self.sink)
    }
}

impl<S: EventSink> VerificationSession<S> {
    pub fn with_sink(config: VerifyConfig, sink: S) -> Self {
        Self {
            store: DescriptorStore::new(config.max_descriptors),
            filter: SimilarityFilter::new(config.max_similarity_frames),
            liveness: LivenessSequencer::new(config.liveness.clone()),
            accumulator: VerificationAccumulator::new(&config),
            config,
            similarity: 0.0,
            in_flight: false,
            epoch: 0,
            sink,
        }
    }

    // ---- registration -------------------------------------------------

    /// Make `descriptor` the sole reference, discarding all prior session state.
    pub fn register(&mut self, descriptor: &[f32]) -> Result<(), SessionError> {
        let descriptor = Descriptor::from_raw(descriptor)?;
        self.full_reset();
        let dimension = descriptor.dimension();
        self.store.seed(descriptor);
        tracing::info!(dimension, "reference registered");
        self.emit_progress(
            ProgressStep::Registered,
            json!({ "dimension": dimension, "references": 1 }),
        );
        Ok(())
    }

    /// Register from previously stored references; the first is the seed.
    pub fn register_references(
        &mut self,
        references: impl IntoIterator<Item = Descriptor>,
    ) -> Result<(), SessionError> {
        self.full_reset();
        let kept = self.store.seed_all(references);
        if kept == 0 {
            return Err(SessionError::NotRegistered);
        }
        tracing::info!(references = kept, "stored references registered");
        self.emit_progress(
            ProgressStep::Registered,
            json!({ "dimension": self.store.dimension(), "references": kept }),
        );
        Ok(())
    }

    /// Register the most confident face of an analyzed reference image.
    pub fn register_detections(&mut self, detections: &[Detection]) -> Result<(), SessionError> {
        let Some(face) = best_detection(detections) else {
            tracing::warn!("no face in reference image");
            self.emit_fail(VerifyResult::failure(FailReason::NoFaceInReference));
            return Err(SessionError::NoFaceInReference);
        };
        self.register(&face.descriptor)
    }

    /// Run `analyzer` on a reference image and register the result.
    ///
    /// Load and detection failures are reported through the sink as well as
    /// returned; the session stays usable either way.
    pub fn register_image<A: FaceAnalyzer + ?Sized>(
        &mut self,
        analyzer: &mut A,
        image: &[u8],
    ) -> Result<(), SessionError> {
        self.emit_progress(ProgressStep::Loading, json!({ "bytes": image.len() }));
        let detections = match analyzer.analyze(image) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(error = %e, "reference image could not be analyzed");
                self.emit_fail(VerifyResult::failure(FailReason::ReferenceLoadFailed));
                return Err(SessionError::ReferenceLoad(e));
            }
        };
        self.register_detections(&detections)
    }

    // ---- live frames ----------------------------------------------------

    /// Claim the frame slot. `None` while another frame is in flight, before
    /// registration, and after a terminal result.
    pub fn begin_frame(&mut self) -> Option<FrameTicket> {
        if self.in_flight || self.store.is_empty() || self.accumulator.is_terminal() {
            return None;
        }
        self.in_flight = true;
        Some(FrameTicket { epoch: self.epoch })
    }

    pub fn finish_frame(&mut self, ticket: FrameTicket, detections: &[Detection]) -> FrameReport {
        self.finish_frame_at(ticket, detections, Instant::now())
    }

    pub fn finish_frame_at(
        &mut self,
        ticket: FrameTicket,
        detections: &[Detection],
        now: Instant,
    ) -> FrameReport {
        if !self.redeem(ticket) {
            return self.report(true, detections.len(), 0);
        }

        self.ensure_liveness_started(now);
        self.liveness.poll(now);
        self.forward_liveness_events();

        let mut tally = FrameTally::default();
        let mut unusable = 0usize;
        if detections.is_empty() {
            self.accumulator.record_absence();
            tracing::debug!(fail_count = self.accumulator.fail_count(), "no face in frame");
        }
        for detection in detections {
            if self.config.liveness.enabled {
                // Without a full landmark set the face cannot take part in
                // the challenge, so it is held back.
                let Some(landmarks) = detection.landmark_set() else {
                    continue;
                };
                let released = self.liveness.process(landmarks, &detection.bounding_box, now);
                self.forward_liveness_events();
                if !released {
                    continue;
                }
            }
            if !self.compare(detection, &mut tally) {
                unusable += 1;
            }
        }
        // Descriptor extraction failed for every face that reached comparison.
        if unusable > 0 && tally.compared == 0 {
            self.accumulator.record_detector_failure();
            tracing::debug!(
                unusable,
                fail_count = self.accumulator.fail_count(),
                "no usable descriptor in frame"
            );
        }

        self.similarity = self.filter.smooth(tally.max_similarity);
        if tally.compared > 0 {
            self.emit_progress(
                ProgressStep::Verifying,
                json!({
                    "match_count": self.accumulator.match_count(),
                    "fail_count": self.accumulator.fail_count(),
                    "similarity": self.similarity,
                }),
            );
        }

        self.conclude();
        self.report(false, detections.len(), tally.compared)
    }

    /// Return a ticket whose frame the detector failed on. Counts as a
    /// failed frame.
    pub fn abandon_frame(&mut self, ticket: FrameTicket, error: &AnalyzerError) -> FrameReport {
        self.abandon_frame_at(ticket, error, Instant::now())
    }

    pub fn abandon_frame_at(
        &mut self,
        ticket: FrameTicket,
        error: &AnalyzerError,
        now: Instant,
    ) -> FrameReport {
        if !self.redeem(ticket) {
            return self.report(true, 0, 0);
        }
        tracing::warn!(error = %error, "detector failed on frame");

        self.liveness.poll(now);
        self.forward_liveness_events();
        self.accumulator.record_detector_failure();
        self.conclude();
        self.report(false, 0, 0)
    }

    /// `begin_frame` + `finish_frame`; a refused frame comes back `skipped`.
    pub fn process_frame(&mut self, detections: &[Detection]) -> FrameReport {
        self.process_frame_at(detections, Instant::now())
    }

    pub fn process_frame_at(&mut self, detections: &[Detection], now: Instant) -> FrameReport {
        match self.begin_frame() {
            Some(ticket) => self.finish_frame_at(ticket, detections, now),
            None => self.report(true, detections.len(), 0),
        }
    }

    /// Current state as a `skipped` report, for frames refused by the caller.
    pub fn snapshot(&self) -> FrameReport {
        self.report(true, 0, 0)
    }

    /// Fire due liveness timers without a frame.
    pub fn tick(&mut self, now: Instant) {
        if self.accumulator.is_terminal() {
            return;
        }
        self.liveness.poll(now);
        self.forward_liveness_events();
    }

    // ---- photo mode -----------------------------------------------------

    /// Compare one analyzed photo against the references. Independent of
    /// the live-frame counters; may be repeated.
    pub fn verify_photo(
        &mut self,
        detections: &[Detection],
    ) -> Result<Option<PhotoComparison>, SessionError> {
        if self.store.is_empty() {
            return Err(SessionError::NotRegistered);
        }
        self.emit_progress(ProgressStep::Verifying, json!({ "mode": "photo" }));

        let comparison = match compare_photo(&self.store, detections, self.config.photo_threshold) {
            Ok(comparison) => comparison,
            Err(e) => {
                tracing::warn!(error = %e, "photo descriptor unusable");
                self.emit_fail(VerifyResult::failure(FailReason::ProbeLoadFailed));
                return Err(e.into());
            }
        };
        match comparison {
            None => {
                tracing::info!("photo verification: no face in probe");
                self.emit_fail(VerifyResult::failure(FailReason::NoFaceInProbe).with_similarity(0.0));
            }
            Some(c) if c.matched => {
                tracing::info!(distance = c.distance, similarity = c.similarity, "photo verification passed");
                self.sink.emit(VerifyEvent::Success(VerifyResult::success(c.similarity)));
            }
            Some(c) => {
                tracing::info!(distance = c.distance, similarity = c.similarity, "photo verification failed");
                self.emit_fail(VerifyResult::failure(FailReason::FaceMismatch).with_similarity(c.similarity));
            }
        }
        Ok(comparison)
    }

    /// Run `analyzer` on a probe image and compare it.
    pub fn verify_photo_image<A: FaceAnalyzer + ?Sized>(
        &mut self,
        analyzer: &mut A,
        image: &[u8],
    ) -> Result<Option<PhotoComparison>, SessionError> {
        if self.store.is_empty() {
            return Err(SessionError::NotRegistered);
        }
        match analyzer.analyze(image) {
            Ok(detections) => self.verify_photo(&detections),
            Err(e) => {
                tracing::warn!(error = %e, "probe image could not be analyzed");
                self.emit_fail(VerifyResult::failure(FailReason::ProbeLoadFailed));
                Err(SessionError::ProbeLoad(e))
            }
        }
    }

    // ---- reset ----------------------------------------------------------

    /// Clear counters, history and liveness; keep the references.
    pub fn reset(&mut self) {
        self.accumulator.reset();
        self.filter.clear();
        self.liveness.reset();
        self.similarity = 0.0;
        self.in_flight = false;
        self.epoch = self.epoch.wrapping_add(1);
        tracing::debug!("session reset");
    }

    /// Back to the unregistered state.
    pub fn full_reset(&mut self) {
        self.reset();
        self.store.clear();
    }

    // ---- accessors ------------------------------------------------------

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    pub fn liveness(&self) -> &LivenessSequencer {
        &self.liveness
    }

    pub fn is_registered(&self) -> bool {
        !self.store.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.accumulator.is_terminal()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub fn terminal(&self) -> Terminal {
        self.accumulator.verdict().into()
    }

    pub fn match_count(&self) -> u32 {
        self.accumulator.match_count()
    }

    pub fn fail_count(&self) -> u32 {
        self.accumulator.fail_count()
    }

    /// Smoothed similarity of the last processed frame.
    pub fn similarity(&self) -> f32 {
        self.similarity
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    // ---- internals ------------------------------------------------------

    fn redeem(&mut self, ticket: FrameTicket) -> bool {
        if ticket.epoch != self.epoch {
            tracing::debug!("discarding frame started before a reset");
            return false;
        }
        self.in_flight = false;
        true
    }

    fn ensure_liveness_started(&mut self, now: Instant) {
        if self.config.liveness.enabled
            && !self.liveness.is_active()
            && self.liveness.step() == LivenessStep::Mouth
        {
            self.liveness.start(now);
        }
    }

    /// Compare one released face. `false` when its descriptor is unusable.
    fn compare(&mut self, detection: &Detection, tally: &mut FrameTally) -> bool {
        let probe = match Descriptor::from_raw(&detection.descriptor)
            .and_then(|probe| self.store.check_compatible(&probe).map(|()| probe))
        {
            Ok(probe) => probe,
            Err(e) => {
                tracing::warn!(error = %e, "skipping face with unusable descriptor");
                return false;
            }
        };
        let Some(distance) = self.store.best_distance(&probe) else {
            return false;
        };

        let similarity = calculate_similarity(distance);
        if tally.observe_similarity(similarity) {
            if let Err(reason) = self.store.try_enroll(
                &probe,
                similarity,
                self.config.enroll_min_similarity,
                self.config.enroll_min_distance,
            ) {
                tracing::trace!(?reason, "descriptor not enrolled");
            }
        }

        let threshold =
            dynamic_threshold(&self.config.thresholds, detection.bounding_box.max_dimension());
        self.accumulator.apply_comparison(tally, distance, threshold);
        true
    }

    fn conclude(&mut self) {
        match self.accumulator.conclude() {
            Some(Verdict::Success) => {
                self.liveness.cancel_pending();
                let match_count = self.accumulator.match_count();
                tracing::info!(match_count, similarity = self.similarity, "verification passed");
                self.sink.emit(VerifyEvent::Success(
                    VerifyResult::success(self.similarity).with_match_count(match_count),
                ));
            }
            Some(Verdict::Fail) => {
                self.liveness.cancel_pending();
                let fail_count = self.accumulator.fail_count();
                tracing::warn!(fail_count, similarity = self.similarity, "verification failed");
                self.emit_fail(
                    VerifyResult::failure(FailReason::VerificationFailed)
                        .with_fail_count(fail_count)
                        .with_similarity(self.similarity),
                );
            }
            None => {}
        }
    }

    fn report(&self, skipped: bool, faces: usize, compared: usize) -> FrameReport {
        FrameReport {
            match_count: self.accumulator.match_count(),
            fail_count: self.accumulator.fail_count(),
            similarity: self.similarity,
            terminal: self.terminal(),
            skipped,
            faces,
            compared,
            liveness_step: self.config.liveness.enabled.then(|| self.liveness.step()),
        }
    }

    fn forward_liveness_events(&mut self) {
        for event in self.liveness.drain_events() {
            let progress = self.liveness.progress_percent();
            let (step, data) = match event {
                LivenessEvent::Started => (
                    ProgressStep::LivenessStarted,
                    json!({ "step": LivenessStep::Mouth }),
                ),
                LivenessEvent::MouthOpened => (ProgressStep::MouthOpenDetected, Value::Null),
                LivenessEvent::MouthCounted { count, required } => (
                    ProgressStep::MouthOpenCounted,
                    json!({ "count": count, "required": required, "progress": progress }),
                ),
                LivenessEvent::StepChanged {
                    step: LivenessStep::HeadTurn,
                } => (
                    ProgressStep::HeadTurnStep,
                    json!({ "step": LivenessStep::HeadTurn, "progress": progress }),
                ),
                LivenessEvent::StepChanged { .. } => continue,
                LivenessEvent::HeadTurned { direction } => (
                    ProgressStep::HeadTurnDetected,
                    json!({ "direction": direction }),
                ),
                LivenessEvent::ShakeCounted { count, required } => (
                    ProgressStep::HeadShakeCounted,
                    json!({ "count": count, "required": required, "progress": progress }),
                ),
                LivenessEvent::Completed => (ProgressStep::LivenessCompleted, Value::Null),
                LivenessEvent::TimedOut { step } => {
                    (ProgressStep::LivenessTimedOut, json!({ "step": step }))
                }
            };
            self.emit_progress(step, data);
        }
    }

    fn emit_progress(&mut self, step: ProgressStep, data: Value) {
        self.sink.emit(VerifyEvent::Progress(Progress::new(step, data)));
    }

    fn emit_fail(&mut self, result: VerifyResult) {
        self.sink.emit(VerifyEvent::Fail(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessConfig;
    use crate::detection::{FaceBox, Point, LANDMARK_COUNT};

    fn config_without_liveness() -> VerifyConfig {
        VerifyConfig {
            liveness: LivenessConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn face(descriptor: Vec<f32>, size: f32) -> Detection {
        Detection {
            landmarks: vec![Point::default(); LANDMARK_COUNT],
            descriptor,
            bounding_box: FaceBox::new(0.0, 0.0, size, size),
            score: None,
        }
    }

    fn registered() -> VerificationSession {
        let mut session = VerificationSession::new(config_without_liveness());
        session.register(&[1.0, 0.0, 0.0]).unwrap();
        session.take_events();
        session
    }

    #[test]
    fn test_begin_frame_requires_registration() {
        let mut session = VerificationSession::new(config_without_liveness());
        assert!(session.begin_frame().is_none());
        let report = session.process_frame(&[]);
        assert!(report.skipped);
        assert_eq!(report.fail_count, 0);
    }

    #[test]
    fn test_in_flight_frame_blocks_second() {
        let mut session = registered();
        let ticket = session.begin_frame().unwrap();
        assert!(session.is_busy());
        assert!(session.begin_frame().is_none());
        assert!(session.process_frame(&[]).skipped);

        let report = session.finish_frame(ticket, &[]);
        assert!(!report.skipped);
        assert_eq!(report.fail_count, 1);
        assert!(!session.is_busy());
    }

    #[test]
    fn test_ticket_from_before_reset_is_discarded() {
        let mut session = registered();
        let stale = session.begin_frame().unwrap();
        session.reset();

        let fresh = session.begin_frame().unwrap();
        let report = session.finish_frame(stale, &[]);
        assert!(report.skipped);
        assert_eq!(session.fail_count(), 0);
        assert!(session.is_busy());

        let report = session.finish_frame(fresh, &[]);
        assert!(!report.skipped);
        assert_eq!(report.fail_count, 1);
    }

    #[test]
    fn test_abandon_frame_counts_failure() {
        let mut session = registered();
        for i in 0..4 {
            let ticket = session.begin_frame().unwrap();
            let report = session.abandon_frame(ticket, &AnalyzerError::Backend("timeout".into()));
            assert_eq!(report.fail_count, i + 1);
        }
        assert_eq!(session.terminal(), Terminal::Fail);
        let events = session.take_events();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn test_unusable_descriptor_counts_as_failed_frame() {
        let mut session = registered();
        let report = session.process_frame(&[face(vec![1.0, 0.0], 250.0)]);
        assert_eq!(report.compared, 0);
        assert_eq!(report.match_count, 0);
        assert_eq!(report.fail_count, 1);

        let report = session.process_frame(&[face(vec![f32::NAN, 0.0, 0.0], 250.0)]);
        assert_eq!(report.compared, 0);
        assert_eq!(report.fail_count, 2);
    }

    #[test]
    fn test_unusable_descriptor_beside_a_good_face_is_not_counted() {
        let mut session = registered();
        let report = session.process_frame(&[
            face(vec![f32::NAN, 0.0, 0.0], 250.0),
            face(vec![1.0, 0.0, 0.0], 250.0),
        ]);
        assert_eq!(report.compared, 1);
        assert_eq!(report.fail_count, 0);
        assert_eq!(report.match_count, 2);
    }

    #[test]
    fn test_broken_descriptors_end_in_failure() {
        let mut session = registered();
        let mut last = None;
        for _ in 0..4 {
            last = Some(session.process_frame(&[face(vec![f32::NAN, 0.0, 0.0], 250.0)]));
        }
        assert_eq!(last.map(|r| r.terminal), Some(Terminal::Fail));

        let fails: Vec<_> = session
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                VerifyEvent::Fail(result) => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].reason, Some(FailReason::VerificationFailed));

        // Terminal: further frames are refused.
        assert!(session.process_frame(&[face(vec![1.0, 0.0], 250.0)]).skipped);
    }

    #[test]
    fn test_photo_with_wrong_dimension_reports_failure() {
        let mut session = registered();
        let result = session.verify_photo(&[face(vec![1.0, 0.0], 250.0)]);
        assert!(matches!(result, Err(SessionError::Descriptor(_))));

        let fails: Vec<_> = session
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                VerifyEvent::Fail(result) => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].reason, Some(FailReason::ProbeLoadFailed));
        assert!(!fails[0].success);
    }

    #[test]
    fn test_register_replaces_state() {
        let mut session = registered();
        session.process_frame(&[face(vec![1.0, 0.0, 0.0], 250.0)]);
        assert_eq!(session.match_count(), 2);

        session.register(&[0.0, 0.0, 2.0]).unwrap();
        assert_eq!(session.match_count(), 0);
        assert_eq!(session.store().len(), 1);
        assert_eq!(session.store().seed_descriptor().unwrap().values(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_register_references() {
        let mut session = VerificationSession::new(config_without_liveness());
        let references = vec![
            Descriptor::from_raw(&[1.0, 0.0]).unwrap(),
            Descriptor::from_raw(&[0.0, 1.0]).unwrap(),
        ];
        session.register_references(references).unwrap();
        assert_eq!(session.store().len(), 2);
        assert!(matches!(
            session.register_references(Vec::new()),
            Err(SessionError::NotRegistered)
        ));
        assert!(!session.is_registered());
    }

    #[test]
    fn test_register_rejects_bad_descriptor() {
        let mut session = VerificationSession::new(config_without_liveness());
        assert!(matches!(session.register(&[]), Err(SessionError::Descriptor(_))));
        assert!(!session.is_registered());
    }

    #[test]
    fn test_tick_without_liveness_is_quiet() {
        let mut session = registered();
        session.tick(Instant::now());
        assert!(session.take_events().is_empty());
    }
}
