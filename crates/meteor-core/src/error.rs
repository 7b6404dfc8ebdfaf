//! The top-level error type composing every subsystem's errors.

use crate::scenario::ScenarioError;
use crate::tc::TcError;
use crate::topology::ConfigError;

/// Result type returned by the player and control-server entry points.
pub type Result<T> = std::result::Result<T, MeteorError>;

/// Errors surfaced to `meteor`/`meteord`'s `main`: malformed input, invalid
/// configuration, kernel rejection, a missed scenario deadline, or a
/// restart signal.
#[derive(Debug, thiserror::Error)]
pub enum MeteorError {
    #[error("malformed scenario input: {0}")]
    InputFormat(#[from] ScenarioError),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error("kernel rejected a TC operation: {0}")]
    Kernel(#[from] TcError),

    /// A scheduler deadline was missed. Not fatal on its own (the player
    /// logs and skips the tick); kept as a variant so callers that want to
    /// treat it as fatal (e.g. a future `--strict` mode) can.
    #[error("scenario deadline at {scenario_time}s was missed")]
    DeadlineMissed { scenario_time: f32 },

    /// A restart was requested and propagated past where it could be
    /// handled locally.
    #[error("restart requested")]
    Restart,
}
