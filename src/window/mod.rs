//! Window model: IDs, lifecycle states, per-window metadata.

mod registry;

pub use registry::Registry;

use crate::error::BrokerError;
use crate::fanout::{Fanout, SinkEvent};
use crate::host::{ExitInfo, Host};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Where a window's byte pipe comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowSource {
    DirectPty,
    Multiplexed,
}

/// Lifecycle state of a window. `Terminal` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    /// Host alive, no subscribers. Scrollback keeps accumulating.
    Idle,
    /// At least one subscriber is attached.
    Active,
    /// Host released, subscribers drained, entry removable.
    Terminal,
}

/// Stable identifier for a window, unique per process lifetime and never
/// reused.
///
/// Direct windows: `pty-{uuid-v4}`. Multiplexed windows:
/// `mux-{session}:{index}` where `session` matches `[A-Za-z0-9_-]{1,30}`
/// and `index` is the multiplexer-assigned window index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WindowId {
    Pty(Uuid),
    Mux { session: String, index: u32 },
}

impl WindowId {
    pub fn new_pty() -> Self {
        Self::Pty(Uuid::new_v4())
    }

    pub fn source(&self) -> WindowSource {
        match self {
            Self::Pty(_) => WindowSource::DirectPty,
            Self::Mux { .. } => WindowSource::Multiplexed,
        }
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pty(uuid) => write!(f, "pty-{uuid}"),
            Self::Mux { session, index } => write!(f, "mux-{session}:{index}"),
        }
    }
}

fn valid_session_name(session: &str) -> bool {
    !session.is_empty()
        && session.len() <= 30
        && session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// Serialized as the string form so collaborator layers can put IDs on the
// wire without knowing the grammar.
impl Serialize for WindowId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WindowId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for WindowId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("pty-") {
            let uuid = Uuid::parse_str(rest)
                .map_err(|_| BrokerError::Invalid(format!("bad window id '{s}'")))?;
            Ok(Self::Pty(uuid))
        } else if let Some(rest) = s.strip_prefix("mux-") {
            let (session, index) = rest
                .rsplit_once(':')
                .ok_or_else(|| BrokerError::Invalid(format!("window id '{s}' lacks an index")))?;
            if !valid_session_name(session) {
                return Err(BrokerError::Invalid(format!("bad session name in '{s}'")));
            }
            let index = index
                .parse::<u32>()
                .map_err(|_| BrokerError::Invalid(format!("bad window index in '{s}'")))?;
            Ok(Self::Mux {
                session: session.to_string(),
                index,
            })
        } else {
            Err(BrokerError::Invalid(format!("bad window id '{s}'")))
        }
    }
}

struct Meta {
    cols: u16,
    rows: u16,
    state: WindowState,
}

/// One logical terminal owned by the broker.
///
/// The window exclusively owns its host and fanout; subscribers hold only
/// the `(window id, sequence)` pair handed out on attach.
pub struct Window {
    id: WindowId,
    name: String,
    project_path: PathBuf,
    created_at: DateTime<Utc>,
    host: Host,
    fanout: Fanout,
    meta: Mutex<Meta>,
}

impl Window {
    pub(crate) fn new(
        id: WindowId,
        name: String,
        project_path: PathBuf,
        host: Host,
        fanout: Fanout,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            id,
            name,
            project_path,
            created_at: Utc::now(),
            host,
            fanout,
            meta: Mutex::new(Meta {
                cols,
                rows,
                state: WindowState::Idle,
            }),
        }
    }

    pub fn id(&self) -> &WindowId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn state(&self) -> WindowState {
        self.meta.lock().unwrap().state
    }

    pub fn dims(&self) -> (u16, u16) {
        let meta = self.meta.lock().unwrap();
        (meta.cols, meta.rows)
    }

    pub(crate) fn set_dims(&self, cols: u16, rows: u16) {
        let mut meta = self.meta.lock().unwrap();
        meta.cols = cols;
        meta.rows = rows;
    }

    pub(crate) fn host(&self) -> &Host {
        &self.host
    }

    pub(crate) fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    /// Recompute Idle/Active from the subscriber count. Terminal sticks.
    pub(crate) fn refresh_state(&self) {
        let subscribers = self.fanout.subscriber_count();
        let mut meta = self.meta.lock().unwrap();
        if meta.state != WindowState::Terminal {
            meta.state = if subscribers > 0 {
                WindowState::Active
            } else {
                WindowState::Idle
            };
        }
    }

    /// Transition to `Terminal`, delivering `exit` to every subscriber as
    /// its final event and bounding the queue drain with `drain`.
    ///
    /// Returns true if this call performed the transition; later calls are
    /// no-ops.
    pub(crate) fn finish(&self, exit: ExitInfo, drain: Duration) -> bool {
        {
            let mut meta = self.meta.lock().unwrap();
            if meta.state == WindowState::Terminal {
                return false;
            }
            meta.state = WindowState::Terminal;
        }
        let handles = self.fanout.close(SinkEvent::Exited {
            exit_code: exit.exit_code,
            signal: exit.signal,
        });
        if !handles.is_empty() {
            tokio::spawn(async move {
                let deadline = Instant::now() + drain;
                for handle in handles {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if tokio::time::timeout(remaining, handle).await.is_err() {
                        tracing::debug!("subscriber drain exceeded grace period");
                    }
                }
            });
        }
        true
    }

    pub fn summary(&self) -> WindowSummary {
        let meta = self.meta.lock().unwrap();
        WindowSummary {
            id: self.id.to_string(),
            name: self.name.clone(),
            project_path: self.project_path.clone(),
            source: self.host.source(),
            state: meta.state,
            cols: meta.cols,
            rows: meta.rows,
            created_at: self.created_at,
            subscribers: self.fanout.subscriber_count(),
        }
    }
}

/// Snapshot of a window for enumeration and collaborator layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSummary {
    pub id: String,
    pub name: String,
    pub project_path: PathBuf,
    pub source: WindowSource,
    pub state: WindowState,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_id_round_trips() {
        let id = WindowId::new_pty();
        let parsed: WindowId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.source(), WindowSource::DirectPty);
    }

    #[test]
    fn mux_id_round_trips() {
        let id = WindowId::Mux {
            session: "mobile-myapp".to_string(),
            index: 3,
        };
        assert_eq!(id.to_string(), "mux-mobile-myapp:3");
        let parsed: WindowId = "mux-mobile-myapp:3".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.source(), WindowSource::Multiplexed);
    }

    #[test]
    fn mux_id_without_index_is_rejected() {
        assert!("mux-mobile-myapp".parse::<WindowId>().is_err());
    }

    #[test]
    fn mux_id_with_bad_session_is_rejected() {
        assert!("mux-bad$name:1".parse::<WindowId>().is_err());
        assert!("mux-:1".parse::<WindowId>().is_err());
        let long = format!("mux-{}:0", "x".repeat(31));
        assert!(long.parse::<WindowId>().is_err());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!("pty-not-a-uuid".parse::<WindowId>().is_err());
        assert!("something-else".parse::<WindowId>().is_err());
        assert!("".parse::<WindowId>().is_err());
    }

    #[test]
    fn ids_serialize_as_their_string_form() {
        let id = WindowId::Mux {
            session: "mobile-y".to_string(),
            index: 2,
        };
        let encoded = toml::to_string(&std::collections::BTreeMap::from([("id", &id)])).unwrap();
        assert!(encoded.contains("\"mux-mobile-y:2\""));

        let decoded: std::collections::BTreeMap<String, WindowId> =
            toml::from_str(&encoded).unwrap();
        assert_eq!(decoded["id"], id);
    }
}
