//! Attachment coordinator: the public face of the multiplexer core.
//!
//! The [`Broker`] owns the window registry, wires hosts to fanouts, and
//! implements the attach/detach/write/resize/kill protocol. All long-lived
//! byte moving happens in dedicated tasks; the operations here are
//! synchronous request/response with short bounded deadlines.

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::fanout::{Fanout, Sink};
use crate::host::{ExitInfo, Host, HostEvent, HostSpec, MuxServer, MuxWindow, PtyHost};
use crate::window::{Registry, Window, WindowId, WindowSource, WindowState, WindowSummary};
use anyhow::anyhow;
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// Request to create a window.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Project the window belongs to; drives multiplexed session naming.
    pub project_path: PathBuf,
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Command and arguments. Must be non-empty.
    pub cmd: Vec<String>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Initial viewport.
    pub cols: u16,
    pub rows: u16,
    /// Delegate to the external multiplexer when it is enabled.
    pub prefer_multiplexed: bool,
    /// Human-readable window label.
    pub label: Option<String>,
}

impl CreateSpec {
    /// Spec running `cmd` with an 80x24 viewport in the current directory.
    pub fn command<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            project_path: cwd.clone(),
            cwd,
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cols: 80,
            rows: 24,
            prefer_multiplexed: false,
            label: None,
        }
    }

    /// Spec running the user's shell.
    pub fn shell() -> Self {
        Self::command([std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())])
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = path.into();
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn multiplexed(mut self, prefer: bool) -> Self {
        self.prefer_multiplexed = prefer;
        self
    }
}

/// Filters for [`Broker::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project_path: Option<PathBuf>,
    pub source: Option<WindowSource>,
    pub state: Option<WindowState>,
}

/// Lifecycle notifications published by the broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    WindowCreated {
        id: WindowId,
    },
    WindowExited {
        id: WindowId,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// A multiplexed window's external backing vanished.
    WindowGone {
        id: WindowId,
    },
}

/// Handle for one attached subscriber, returned by [`Broker::attach`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubId {
    window: WindowId,
    seq: u64,
}

impl SubId {
    pub fn window(&self) -> &WindowId {
        &self.window
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.window, self.seq)
    }
}

struct Shared {
    cfg: BrokerConfig,
    registry: Registry,
    mux: Option<MuxServer>,
    events: broadcast::Sender<BrokerEvent>,
    shutting_down: AtomicBool,
}

/// Owns the window registry and mediates between hosts and clients.
///
/// Construct one per broker process; tests construct isolated instances.
/// Cloning is cheap and every clone drives the same state.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    /// Construct a broker. The external multiplexer is probed once here;
    /// when it is not runnable every window falls back to a direct PTY.
    pub async fn new(cfg: BrokerConfig) -> Self {
        let mux = if cfg.mux.enabled {
            MuxServer::detect(&cfg.mux.program, &cfg.mux.session_prefix).await
        } else {
            None
        };
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                cfg,
                registry: Registry::new(),
                mux,
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.cfg
    }

    /// Whether windows can be delegated to the external multiplexer.
    pub fn multiplexer_available(&self) -> bool {
        self.shared.mux.is_some()
    }

    /// Lifecycle event feed for collaborator layers.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.shared.events.subscribe()
    }

    /// Create a window and start pumping its output.
    pub async fn create(&self, spec: CreateSpec) -> Result<WindowSummary, BrokerError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(BrokerError::Invalid("broker is shutting down".to_string()));
        }
        if spec.cmd.is_empty() || spec.cmd[0].is_empty() {
            return Err(BrokerError::Invalid("empty command".to_string()));
        }
        if spec.cols < 1 || spec.rows < 1 {
            return Err(BrokerError::Invalid(
                "viewport must be at least 1x1".to_string(),
            ));
        }
        if !spec.cwd.is_dir() {
            return Err(BrokerError::Spawn(anyhow!(
                "working directory '{}' does not exist",
                spec.cwd.display()
            )));
        }

        let (host_tx, host_rx) = mpsc::channel::<HostEvent>(64);

        let (id, host) = match &self.shared.mux {
            Some(server) if spec.prefer_multiplexed => {
                let session = server.session_name(&spec.project_path);
                server
                    .ensure_session(&session, &spec.cwd)
                    .await
                    .map_err(BrokerError::Spawn)?;
                let index = server
                    .create_window(&session, &spec.cwd, spec.label.as_deref(), &spec.env, &spec.cmd)
                    .await
                    .map_err(BrokerError::Spawn)?;
                let attach = HostSpec {
                    cmd: server.attach_cmd(&session, index),
                    cwd: spec.cwd.clone(),
                    env: Vec::new(),
                    cols: spec.cols,
                    rows: spec.rows,
                };
                let pty = PtyHost::spawn(&attach, host_tx)?;
                let id = WindowId::Mux {
                    session: session.clone(),
                    index,
                };
                (
                    id,
                    Host::Multiplexed {
                        pty,
                        server: server.clone(),
                        session,
                        index,
                    },
                )
            }
            _ => {
                let direct = HostSpec {
                    cmd: spec.cmd.clone(),
                    cwd: spec.cwd.clone(),
                    env: spec.env.clone(),
                    cols: spec.cols,
                    rows: spec.rows,
                };
                let pty = PtyHost::spawn(&direct, host_tx)?;
                (WindowId::new_pty(), Host::Direct(pty))
            }
        };

        let name = spec
            .label
            .clone()
            .unwrap_or_else(|| default_name(&spec.cmd));
        let window = Arc::new(Window::new(
            id.clone(),
            name,
            spec.project_path.clone(),
            host,
            self.new_fanout(),
            spec.cols,
            spec.rows,
        ));
        self.shared.registry.insert(Arc::clone(&window));
        let _ = self
            .shared
            .events
            .send(BrokerEvent::WindowCreated { id: id.clone() });
        tracing::info!(window = %id, "created window");

        tokio::spawn(pump(Arc::clone(&self.shared), window.clone(), host_rx));

        Ok(window.summary())
    }

    /// Attach a subscriber. The scrollback snapshot is delivered to the
    /// sink before any live chunk; when an initial viewport is given, the
    /// window is resized first (last resize wins).
    pub async fn attach(
        &self,
        id: &WindowId,
        sink: Sink,
        dims: Option<(u16, u16)>,
    ) -> Result<SubId, BrokerError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(BrokerError::Invalid("broker is shutting down".to_string()));
        }
        if let Some((cols, rows)) = dims {
            if cols < 1 || rows < 1 {
                return Err(BrokerError::Invalid(
                    "viewport must be at least 1x1".to_string(),
                ));
            }
        }
        let window = self.live(id)?;
        if let Some((cols, rows)) = dims {
            match timeout(self.op_timeout(), window.host().resize(cols, rows)).await {
                Ok(Ok(())) => window.set_dims(cols, rows),
                Ok(Err(err)) => tracing::debug!(window = %id, "resize on attach: {err}"),
                Err(_) => tracing::debug!(window = %id, "resize on attach timed out"),
            }
        }
        let seq = window
            .fanout()
            .subscribe(sink)
            .ok_or_else(|| BrokerError::Terminal(id.clone()))?;
        window.refresh_state();
        tracing::debug!(window = %id, subscriber = seq, "attached");
        Ok(SubId {
            window: id.clone(),
            seq,
        })
    }

    /// Detach a subscriber. Idempotent: unknown subscribers and windows
    /// already gone are fine.
    pub fn detach(&self, sub: &SubId) {
        if let Some(window) = self.shared.registry.get(sub.window()) {
            if window.fanout().remove(sub.seq) {
                tracing::debug!(window = %sub.window(), subscriber = sub.seq, "detached");
            }
            window.refresh_state();
        }
    }

    /// Write input bytes to a window's host. Writes are serialized: one
    /// caller's bytes are never interleaved into another's.
    pub async fn write(&self, id: &WindowId, bytes: &[u8]) -> Result<(), BrokerError> {
        let window = self.live(id)?;
        timeout(self.op_timeout(), window.host().write(bytes))
            .await
            .map_err(|_| BrokerError::Timeout("write"))??;
        Ok(())
    }

    /// Resize the window's viewport. The last resize wins.
    pub async fn resize(&self, id: &WindowId, cols: u16, rows: u16) -> Result<(), BrokerError> {
        if cols < 1 || rows < 1 {
            return Err(BrokerError::Invalid(
                "viewport must be at least 1x1".to_string(),
            ));
        }
        let window = self.live(id)?;
        timeout(self.op_timeout(), window.host().resize(cols, rows))
            .await
            .map_err(|_| BrokerError::Timeout("resize"))??;
        window.set_dims(cols, rows);
        Ok(())
    }

    /// Kill a window: SIGTERM, a grace period, then SIGKILL. Idempotent -
    /// killing an unknown or already-terminal window succeeds, because a
    /// window that reached `Terminal` has been removed from the registry
    /// and a retry must not start failing.
    pub async fn kill(&self, id: &WindowId) -> Result<(), BrokerError> {
        let Some(window) = self.shared.registry.get(id) else {
            tracing::debug!(window = %id, "kill on unknown window");
            return Ok(());
        };
        let grace = self.shared.cfg.timing.kill_grace();
        let signal = match timeout(self.op_timeout(), window.host().kill(grace)).await {
            Ok(result) => result?,
            Err(_) => return Err(BrokerError::Timeout("kill")),
        };
        finish_window(
            &self.shared,
            &window,
            ExitInfo {
                exit_code: None,
                signal: signal.or(Some(Signal::SIGTERM as i32)),
            },
            false,
        );
        Ok(())
    }

    /// Summaries of live windows matching `filter`.
    pub fn list(&self, filter: &ListFilter) -> Vec<WindowSummary> {
        self.shared
            .registry
            .list()
            .into_iter()
            .filter(|w| {
                filter
                    .project_path
                    .as_ref()
                    .map_or(true, |p| w.project_path() == p)
                    && filter.source.map_or(true, |s| w.host().source() == s)
                    && filter.state.map_or(true, |s| w.state() == s)
            })
            .map(|w| w.summary())
            .collect()
    }

    /// Summary of one live window.
    pub fn get(&self, id: &WindowId) -> Result<WindowSummary, BrokerError> {
        self.live(id).map(|w| w.summary())
    }

    /// Re-enumerate external windows: drop registry entries whose backing
    /// is gone and adopt live external windows the registry does not know
    /// about (e.g. after a broker restart).
    pub async fn reconcile_external(&self) -> Result<(), BrokerError> {
        let Some(server) = self.shared.mux.clone() else {
            return Ok(());
        };
        let sessions = server.list_sessions().await.map_err(BrokerError::Spawn)?;
        let mut live = HashSet::new();
        let mut discovered = Vec::new();
        for session in &sessions {
            for window in server.list_windows(session).await.unwrap_or_default() {
                live.insert((session.clone(), window.index));
                discovered.push((session.clone(), window));
            }
        }

        for window in self.shared.registry.list() {
            if let WindowId::Mux { session, index } = window.id() {
                if !live.contains(&(session.clone(), *index)) {
                    tracing::info!(window = %window.id(), "external backing gone");
                    finish_window(&self.shared, &window, ExitInfo::default(), true);
                }
            }
        }

        for (session, external) in discovered {
            let id = WindowId::Mux {
                session: session.clone(),
                index: external.index,
            };
            if self.shared.registry.get(&id).is_some() {
                continue;
            }
            if let Err(err) = self.adopt(&server, &session, &external).await {
                tracing::warn!(window = %id, "failed to adopt external window: {err}");
            }
        }
        Ok(())
    }

    /// Register a window discovered in the external server, attaching a
    /// local PTY to it.
    async fn adopt(
        &self,
        server: &MuxServer,
        session: &str,
        external: &MuxWindow,
    ) -> Result<(), BrokerError> {
        if !server.window_exists(session, external.index).await {
            return Err(BrokerError::Gone(format!("{session}:{}", external.index)));
        }
        let (host_tx, host_rx) = mpsc::channel::<HostEvent>(64);
        let attach = HostSpec {
            cmd: server.attach_cmd(session, external.index),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: Vec::new(),
            cols: 80,
            rows: 24,
        };
        let pty = PtyHost::spawn(&attach, host_tx)?;
        let id = WindowId::Mux {
            session: session.to_string(),
            index: external.index,
        };
        let window = Arc::new(Window::new(
            id.clone(),
            external.name.clone(),
            external.path.clone(),
            Host::Multiplexed {
                pty,
                server: server.clone(),
                session: session.to_string(),
                index: external.index,
            },
            self.new_fanout(),
            80,
            24,
        ));
        self.shared.registry.insert(Arc::clone(&window));
        let _ = self
            .shared
            .events
            .send(BrokerEvent::WindowCreated { id: id.clone() });
        tracing::info!(window = %id, "adopted external window");
        tokio::spawn(pump(Arc::clone(&self.shared), window, host_rx));
        Ok(())
    }

    /// Broadcast shutdown: stop accepting new windows and subscribers,
    /// kill every host, drain subscriber queues, clear the registry.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let grace = self.shared.cfg.timing.kill_grace();
        for window in self.shared.registry.drain() {
            if let Err(err) = window.host().kill(grace).await {
                tracing::debug!(window = %window.id(), "kill on shutdown: {err}");
            }
            let exit = ExitInfo {
                exit_code: None,
                signal: Some(Signal::SIGTERM as i32),
            };
            if window.finish(exit, self.shared.cfg.timing.drain()) {
                let _ = self.shared.events.send(BrokerEvent::WindowExited {
                    id: window.id().clone(),
                    exit_code: exit.exit_code,
                    signal: exit.signal,
                });
            }
        }
        tracing::info!("broker shut down");
    }

    fn live(&self, id: &WindowId) -> Result<Arc<Window>, BrokerError> {
        match self.shared.registry.get(id) {
            None => Err(BrokerError::NotFound(id.clone())),
            Some(w) if w.state() == WindowState::Terminal => {
                Err(BrokerError::Terminal(id.clone()))
            }
            Some(w) => Ok(w),
        }
    }

    fn new_fanout(&self) -> Fanout {
        let limits = &self.shared.cfg.limits;
        Fanout::new(limits.scrollback_bytes, limits.queue_chunks, limits.evict_bytes)
    }

    fn op_timeout(&self) -> Duration {
        self.shared.cfg.timing.op_timeout()
    }
}

fn default_name(cmd: &[String]) -> String {
    cmd.first()
        .map(|c| {
            c.rsplit('/')
                .next()
                .unwrap_or(c.as_str())
                .to_string()
        })
        .unwrap_or_else(|| "window".to_string())
}

/// Per-window pump: moves host events into the fanout and finishes the
/// window when the host reports exit or its channel closes.
async fn pump(shared: Arc<Shared>, window: Arc<Window>, mut rx: mpsc::Receiver<HostEvent>) {
    let drain = shared.cfg.timing.drain();
    let mut exit: Option<ExitInfo> = None;
    while let Some(event) = rx.recv().await {
        match event {
            HostEvent::Output(chunk) => deliver(&window, &chunk),
            HostEvent::Exited(info) => {
                exit = Some(info);
                // The reader may still hold buffered output; give it a
                // short grace to flush before the window is finished.
                loop {
                    match timeout(drain, rx.recv()).await {
                        Ok(Some(HostEvent::Output(chunk))) => deliver(&window, &chunk),
                        Ok(Some(HostEvent::Exited(_))) => {}
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    finish_window(&shared, &window, exit.unwrap_or_default(), false);
}

fn deliver(window: &Window, chunk: &[u8]) {
    let evicted = window.fanout().publish(chunk);
    if !evicted.is_empty() {
        for (seq, dropped) in &evicted {
            tracing::warn!(
                window = %window.id(),
                subscriber = seq,
                dropped_bytes = dropped,
                "evicted slow subscriber"
            );
        }
        window.refresh_state();
    }
}

/// Idempotent teardown: transition to Terminal, remove from the registry,
/// publish the lifecycle event.
fn finish_window(shared: &Shared, window: &Window, exit: ExitInfo, gone: bool) {
    let finished = window.finish(exit, shared.cfg.timing.drain());
    shared.registry.remove(window.id());
    if finished {
        let event = if gone {
            BrokerEvent::WindowGone {
                id: window.id().clone(),
            }
        } else {
            BrokerEvent::WindowExited {
                id: window.id().clone(),
                exit_code: exit.exit_code,
                signal: exit.signal,
            }
        };
        let _ = shared.events.send(event);
        tracing::info!(
            window = %window.id(),
            exit_code = ?exit.exit_code,
            signal = ?exit.signal,
            "window finished"
        );
    }
}
