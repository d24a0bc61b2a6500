use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid descriptor value (NaN/Inf)")]
    NonFinite,
}

/// Failure reported by the external face analyzer.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("malformed analyzer payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("analyzer backend failed: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no reference face registered")]
    NotRegistered,
    #[error("no face detected in reference image")]
    NoFaceInReference,
    #[error("reference image could not be analyzed: {0}")]
    ReferenceLoad(#[source] AnalyzerError),
    #[error("probe image could not be analyzed: {0}")]
    ProbeLoad(#[source] AnalyzerError),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },
    #[error("{field} must be positive and finite, got {value}")]
    NonPositive { field: &'static str, value: f32 },
    #[error("threshold table must not be empty")]
    EmptyThresholds,
    #[error("threshold bands must be listed from largest face size to smallest")]
    UnorderedThresholds,
    #[error("head-turn thresholds must satisfy left < 1 < right (left={left}, right={right})")]
    TurnThresholds { left: f32, right: f32 },
    #[error("config parse error: {0}")]
    Parse(String),
}
