//! Error kinds surfaced by the broker core.

use crate::window::WindowId;
use thiserror::Error;

/// Errors returned by broker operations.
///
/// The reader task never propagates errors to callers directly; it
/// transitions the window to `Terminal` and lets subsequent operations
/// report [`BrokerError::Terminal`]. Slow-consumer eviction is not an error
/// value either - it reaches the affected subscriber as a
/// [`SinkEvent::Evicted`](crate::fanout::SinkEvent) control event.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The child process (or the attach command for a multiplexed window)
    /// could not be started: missing executable, bad working directory, or
    /// PTY allocation failure.
    #[error("failed to spawn child process: {0}")]
    Spawn(anyhow::Error),

    /// No window with this ID is registered.
    #[error("window not found: {0}")]
    NotFound(WindowId),

    /// The window has already exited.
    #[error("window has exited: {0}")]
    Terminal(WindowId),

    /// The host's file descriptors closed between check and use.
    #[error("host is closed")]
    Closed,

    /// The external multiplexer window vanished between enumeration and use.
    #[error("external window gone: {0}")]
    Gone(String),

    /// Malformed input: zero dimensions, empty command, unparseable ID.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A synchronous operation exceeded its deadline. The host may still
    /// process the abandoned operation.
    #[error("operation timed out: {0}")]
    Timeout(&'static str),
}
