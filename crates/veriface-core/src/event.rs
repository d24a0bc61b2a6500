//! Typed event surface for verification results and progress.
//!
//! A session reports through an [`EventSink`]. Terminal events (`Success` /
//! `Fail`) are emitted at most once per session; progress events any number
//! of times. Delivery to another process or window is an adapter on top of a
//! sink (the daemon forwards events as D-Bus signals).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a verification, registration, or photo comparison failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Too many unmatched or faceless frames.
    VerificationFailed,
    /// Photo comparison distance at or above the photo threshold.
    FaceMismatch,
    NoFaceInProbe,
    ProbeLoadFailed,
    ReferenceLoadFailed,
    NoFaceInReference,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerificationFailed => "verification_failed",
            Self::FaceMismatch => "face_mismatch",
            Self::NoFaceInProbe => "no_face_in_probe",
            Self::ProbeLoadFailed => "probe_load_failed",
            Self::ReferenceLoadFailed => "reference_load_failed",
            Self::NoFaceInReference => "no_face_in_reference",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::VerificationFailed => "verification failed",
            Self::FaceMismatch => "face does not match the reference",
            Self::NoFaceInProbe => "no face detected in the photo",
            Self::ProbeLoadFailed => "photo could not be loaded",
            Self::ReferenceLoadFailed => "reference photo could not be loaded",
            Self::NoFaceInReference => "no face detected in the reference photo",
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a terminal `Success` or `Fail` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl VerifyResult {
    pub fn success(similarity: f32) -> Self {
        Self {
            success: true,
            message: "verification passed".to_string(),
            reason: None,
            similarity: Some(similarity),
            match_count: None,
            fail_count: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(reason: FailReason) -> Self {
        Self {
            success: false,
            message: reason.message().to_string(),
            reason: Some(reason),
            similarity: None,
            match_count: None,
            fail_count: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_similarity(mut self, similarity: f32) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_match_count(mut self, count: u32) -> Self {
        self.match_count = Some(count);
        self
    }

    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Loading,
    Registered,
    LivenessStarted,
    MouthOpenDetected,
    MouthOpenCounted,
    HeadTurnStep,
    HeadTurnDetected,
    HeadShakeCounted,
    LivenessCompleted,
    LivenessTimedOut,
    Verifying,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub step: ProgressStep,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Progress {
    pub fn new(step: ProgressStep, data: Value) -> Self {
        Self {
            step,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifyEvent {
    Success(VerifyResult),
    Fail(VerifyResult),
    Progress(Progress),
}

impl VerifyEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Fail(_))
    }
}

/// Receiver of session events.
pub trait EventSink {
    fn emit(&mut self, event: VerifyEvent);
}

impl EventSink for Vec<VerifyEvent> {
    fn emit(&mut self, event: VerifyEvent) {
        self.push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: VerifyEvent) {
        (**self).emit(event);
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: VerifyEvent) {}
}

type ResultHandler<'a> = Box<dyn FnMut(&VerifyResult) + 'a>;
type ProgressHandler<'a> = Box<dyn FnMut(&Progress) + 'a>;

/// `on_success` / `on_fail` / `on_progress` closures as a sink.
#[derive(Default)]
pub struct Callbacks<'a> {
    on_success: Option<ResultHandler<'a>>,
    on_fail: Option<ResultHandler<'a>>,
    on_progress: Option<ProgressHandler<'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, handler: impl FnMut(&VerifyResult) + 'a) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl FnMut(&VerifyResult) + 'a) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }

    pub fn on_progress(mut self, handler: impl FnMut(&Progress) + 'a) -> Self {
        self.on_progress = Some(Box::new(handler));
        self
    }
}

impl EventSink for Callbacks<'_> {
    fn emit(&mut self, event: VerifyEvent) {
        match &event {
            VerifyEvent::Success(result) => {
                if let Some(handler) = self.on_success.as_mut() {
                    handler(result);
                }
            }
            VerifyEvent::Fail(result) => {
                if let Some(handler) = self.on_fail.as_mut() {
                    handler(result);
                }
            }
            VerifyEvent::Progress(progress) => {
                if let Some(handler) = self.on_progress.as_mut() {
                    handler(progress);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fail_reason_codes() {
        assert_eq!(
            serde_json::to_value(FailReason::VerificationFailed).unwrap(),
            json!("verification_failed")
        );
        assert_eq!(FailReason::NoFaceInReference.to_string(), "no_face_in_reference");
        for reason in [
            FailReason::VerificationFailed,
            FailReason::FaceMismatch,
            FailReason::NoFaceInProbe,
            FailReason::ProbeLoadFailed,
            FailReason::ReferenceLoadFailed,
            FailReason::NoFaceInReference,
        ] {
            assert_eq!(serde_json::to_value(reason).unwrap(), json!(reason.as_str()));
        }
    }

    #[test]
    fn test_event_json_shape() {
        let event = VerifyEvent::Fail(
            VerifyResult::failure(FailReason::VerificationFailed)
                .with_fail_count(4)
                .with_similarity(31.5),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "fail");
        assert_eq!(value["success"], false);
        assert_eq!(value["reason"], "verification_failed");
        assert_eq!(value["fail_count"], 4);
        assert!(value.get("match_count").is_none());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));

        let progress = VerifyEvent::Progress(Progress::new(
            ProgressStep::MouthOpenCounted,
            json!({"count": 1, "required": 1}),
        ));
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["step"], "mouth_open_counted");
        assert_eq!(value["data"]["count"], 1);
    }

    #[test]
    fn test_callbacks_dispatch() {
        let mut successes = 0;
        let mut failures = Vec::new();
        let mut steps = Vec::new();
        {
            let mut sink = Callbacks::new()
                .on_success(|_| successes += 1)
                .on_fail(|r| failures.push(r.reason))
                .on_progress(|p| steps.push(p.step));
            sink.emit(VerifyEvent::Progress(Progress::new(ProgressStep::Loading, Value::Null)));
            sink.emit(VerifyEvent::Success(VerifyResult::success(88.0)));
            sink.emit(VerifyEvent::Fail(VerifyResult::failure(FailReason::FaceMismatch)));
        }
        assert_eq!(successes, 1);
        assert_eq!(failures, vec![Some(FailReason::FaceMismatch)]);
        assert_eq!(steps, vec![ProgressStep::Loading]);
    }

    #[test]
    fn test_unset_callbacks_are_ignored() {
        let mut sink = Callbacks::new();
        sink.emit(VerifyEvent::Success(VerifyResult::success(90.0)));
    }
}
