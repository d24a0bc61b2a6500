//! Face verification core: similarity scoring, liveness challenge, match
//! accumulation and the session object that ties them together.
//!
//! Face detection and descriptor extraction are external; see
//! [`detection::FaceAnalyzer`].

pub mod accumulator;
pub mod config;
pub mod descriptor;
pub mod detection;
pub mod error;
pub mod event;
pub mod liveness;
pub mod photo;
pub mod session;
pub mod similarity;

pub use accumulator::{dynamic_threshold, ComparisonOutcome, FrameTally, VerificationAccumulator, Verdict};
pub use config::{LivenessConfig, ThresholdBand, ThresholdTable, VerifyConfig};
pub use descriptor::{euclidean_distance, normalize, Descriptor, DescriptorStore, EnrollRejection};
pub use detection::{Detection, DetectionBatch, FaceAnalyzer, FaceBox, JsonAnalyzer, Point};
pub use error::{AnalyzerError, ConfigError, DescriptorError, SessionError};
pub use event::{
    Callbacks, EventSink, FailReason, NullSink, Progress, ProgressStep, VerifyEvent, VerifyResult,
};
pub use liveness::{LivenessEvent, LivenessSequencer, LivenessStep, TurnDirection};
pub use photo::{compare_photo, PhotoComparison};
pub use session::{FrameReport, FrameTicket, Terminal, VerificationSession};
pub use similarity::{calculate_similarity, SimilarityFilter};
