use thiserror::Error;

/// Faults the caller must correct and resubmit. Never retried internally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("[{channel}] unknown command field `{field}`")]
    UnknownField { channel: String, field: String },

    #[error("[{channel}] integer field `{field}` cannot take non-finite value {value}")]
    NonFiniteInteger {
        channel: String,
        field: String,
        value: f64,
    },

    #[error("{field}: selector must be 0 or 1 (got {value})")]
    SelectorOutOfRange { field: String, value: i64 },

    #[error("{field}: dial out of range [{lo}, {hi}] (got {value})")]
    DialOutOfRange {
        field: String,
        value: i64,
        lo: i64,
        hi: i64,
    },

    #[error("{field}: slider value {value} outside [{lo}, {hi}]")]
    SliderOutOfRange {
        field: String,
        value: f64,
        lo: f64,
        hi: f64,
    },

    #[error("{field}: invalid range, lo ({lo}) must be below hi ({hi})")]
    InvalidRange { field: String, lo: f64, hi: f64 },

    #[error("{field}: pulse width must be positive")]
    InvalidPulseWidth { field: String },

    #[error("invalid layout: {0}")]
    Layout(String),

    #[error("invalid channel `{channel}`: {reason}")]
    Channel { channel: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Wire codec failures. A well-configured channel never produces these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("value count mismatch: layout has {expected} fields, got {actual}")]
    ValueCount { expected: usize, actual: usize },

    #[error("kind mismatch at slot {slot}")]
    KindMismatch { slot: usize },

    #[error("frame exceeds buffer capacity")]
    Capacity,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}
