use thiserror::Error;

/// Failures raised by the planning and encoding stages. These are
/// surfaced to the caller, never recovered internally.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Every sample of the input series is invalid; there is no valid
    /// boundary to interpolate from.
    #[error("series has no valid samples to interpolate from")]
    EmptySeries,

    /// No open string can produce the requested pitch, even after
    /// relaxing the per-string range constraint.
    #[error("no string can play pitch {pitch:.2}")]
    UnplayablePitch { pitch: f64 },

    /// Commanded bow angle exceeds the mechanical limit. Clamping would
    /// desynchronize the left/right differential pair, so the whole
    /// transform aborts instead.
    #[error("bow angle {angle:.4} rad exceeds limit {limit:.4} rad")]
    AngleLimitExceeded { angle: f64, limit: f64 },

    /// Paired series passed to an API do not have equal lengths.
    #[error("series length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Anything a `perform` call can fail with: a planning error or a link
/// error, unified so callers can use one `?`.
#[derive(Debug, Error)]
pub enum PerformError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Failures on the device link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no device link is connected")]
    NotConnected,

    #[error("short reply from device: {got} bytes, expected {expected}")]
    ShortReply { got: usize, expected: usize },
}
