//! Host abstraction: the byte pipe behind a window.
//!
//! Two variants share one shape. A direct host is a PTY driving the
//! requested child itself; a multiplexed host is a PTY driving the external
//! multiplexer's attach command, with window lifetime owned by the external
//! server. Downstream components accept either.

mod mux;
mod pty;

pub use mux::{MuxServer, MuxWindow};
pub use pty::PtyHost;

use crate::error::BrokerError;
use crate::window::WindowSource;
use std::path::PathBuf;
use std::time::Duration;

/// What to run and how big the initial viewport is.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// Events emitted by a host's reader and wait tasks.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A chunk of raw output, in emission order.
    Output(Vec<u8>),

    /// The child exited. Sent exactly once.
    Exited(ExitInfo),
}

/// How a child ended. `signal` is set when the broker's own kill path
/// terminated it; natural exits carry `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// A window's byte pipe.
pub enum Host {
    Direct(PtyHost),
    Multiplexed {
        pty: PtyHost,
        server: MuxServer,
        session: String,
        index: u32,
    },
}

impl Host {
    pub fn source(&self) -> WindowSource {
        match self {
            Host::Direct(_) => WindowSource::DirectPty,
            Host::Multiplexed { .. } => WindowSource::Multiplexed,
        }
    }

    fn pty(&self) -> &PtyHost {
        match self {
            Host::Direct(pty) => pty,
            Host::Multiplexed { pty, .. } => pty,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.pty().is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty().pid()
    }

    /// Write input bytes. Serialized: one caller's write completes before
    /// another's begins.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, BrokerError> {
        self.pty().write(bytes).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BrokerError> {
        self.pty().resize(cols, rows).await
    }

    /// Terminate the window, returning the signal that ended it (`None` if
    /// it had already exited). For multiplexed windows the local attach PTY
    /// is torn down and the external window killed best-effort.
    pub async fn kill(&self, grace: Duration) -> Result<Option<i32>, BrokerError> {
        match self {
            Host::Direct(pty) => pty.kill(grace).await,
            Host::Multiplexed {
                pty,
                server,
                session,
                index,
            } => {
                let signal = pty.kill(grace).await?;
                if let Err(err) = server.kill_window(session, *index).await {
                    tracing::debug!("kill-window {session}:{index}: {err}");
                }
                Ok(signal)
            }
        }
    }
}
