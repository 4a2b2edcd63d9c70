//! Direct PTY host: spawns a child under a pseudo-terminal and owns its
//! file descriptors and process group.

use super::{ExitInfo, HostEvent, HostSpec};
use crate::error::BrokerError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task;

/// A child process running under a PTY the broker owns.
///
/// The child gets the PTY slave as its controlling terminal and runs in its
/// own session, so signals aimed at it never reach the broker. Two blocking
/// tasks service it: a reader that forwards output chunks until the master
/// returns EOF or an error, and a waiter that reports the exit exactly once.
pub struct PtyHost {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: StdMutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    killed_with: Arc<StdMutex<Option<i32>>>,
}

impl PtyHost {
    /// Spawn `spec` under a fresh PTY. Output chunks and the final exit
    /// notification are delivered through `events`.
    pub fn spawn(spec: &HostSpec, events: mpsc::Sender<HostEvent>) -> Result<Self, BrokerError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(BrokerError::Spawn)?;

        let mut cmd = CommandBuilder::new(&spec.cmd[0]);
        cmd.args(&spec.cmd[1..]);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(BrokerError::Spawn)?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        // Reader and writer must be taken before the master goes behind a lock.
        let mut reader = pair.master.try_clone_reader().map_err(BrokerError::Spawn)?;
        let writer = pair.master.take_writer().map_err(BrokerError::Spawn)?;

        let (exit_tx, exit_rx) = watch::channel::<Option<ExitInfo>>(None);
        let killed_with: Arc<StdMutex<Option<i32>>> = Arc::new(StdMutex::new(None));

        // Reader task: ends exactly when the master returns EOF or error.
        let read_events = events.clone();
        task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_events
                            .blocking_send(HostEvent::Output(buf[..n].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!("pty read ended: {err}");
                        break;
                    }
                }
            }
        });

        // Wait task: reports the exit exactly once.
        let wait_killed = Arc::clone(&killed_with);
        task::spawn_blocking(move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo {
                    exit_code: Some(status.exit_code() as i32),
                    signal: *wait_killed.lock().unwrap(),
                },
                Err(err) => {
                    tracing::warn!("wait on child failed: {err}");
                    ExitInfo {
                        exit_code: None,
                        signal: *wait_killed.lock().unwrap(),
                    }
                }
            };
            let _ = exit_tx.send(Some(info));
            let _ = events.blocking_send(HostEvent::Exited(info));
        });

        tracing::info!(
            "spawned '{}' in '{}' (pid {:?}, {}x{})",
            spec.cmd.join(" "),
            spec.cwd.display(),
            pid,
            spec.cols,
            spec.rows
        );

        Ok(Self {
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            killer: StdMutex::new(Some(killer)),
            pid,
            exit_rx,
            killed_with,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Write input bytes to the child's terminal.
    ///
    /// The writer lock is a fair async mutex, so concurrent callers are
    /// serialized FIFO and one write's bytes are never interleaved into
    /// another's.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, BrokerError> {
        if !self.is_alive() {
            return Err(BrokerError::Closed);
        }
        let writer = Arc::clone(&self.writer);
        let data = bytes.to_vec();
        task::spawn_blocking(move || -> std::io::Result<usize> {
            let mut guard = writer.blocking_lock();
            guard.write_all(&data)?;
            guard.flush()?;
            Ok(data.len())
        })
        .await
        .map_err(|_| BrokerError::Closed)?
        .map_err(|_| BrokerError::Closed)
    }

    /// Apply a new viewport size to the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BrokerError> {
        if !self.is_alive() {
            return Err(BrokerError::Closed);
        }
        let master = Arc::clone(&self.master);
        task::spawn_blocking(move || {
            let guard = master.blocking_lock();
            guard.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
        })
        .await
        .map_err(|_| BrokerError::Closed)?
        .map_err(|_| BrokerError::Closed)
    }

    /// Terminate the child: SIGTERM first, SIGKILL once `grace` passes.
    ///
    /// Returns the signal that ended it, or `None` if it had already
    /// exited. Idempotent.
    pub async fn kill(&self, grace: Duration) -> Result<Option<i32>, BrokerError> {
        if !self.is_alive() {
            return Ok(None);
        }
        *self.killed_with.lock().unwrap() = Some(Signal::SIGTERM as i32);
        self.signal(Signal::SIGTERM);

        let mut rx = self.exit_rx.clone();
        let _ = tokio::time::timeout(grace, async {
            while rx.borrow().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if self.is_alive() {
            *self.killed_with.lock().unwrap() = Some(Signal::SIGKILL as i32);
            self.signal(Signal::SIGKILL);
            Ok(Some(Signal::SIGKILL as i32))
        } else {
            Ok(Some(Signal::SIGTERM as i32))
        }
    }

    fn signal(&self, sig: Signal) {
        if let Some(pid) = self.pid {
            match kill(Pid::from_raw(pid as i32), sig) {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => tracing::warn!("failed to signal child {pid}: {err}"),
            }
        } else if sig == Signal::SIGKILL {
            if let Some(mut killer) = self.killer.lock().unwrap().take() {
                let _ = killer.kill();
            }
        }
    }
}

impl Drop for PtyHost {
    fn drop(&mut self) {
        // A window dropped without an explicit kill must not orphan its child.
        if self.is_alive() {
            if let Some(mut killer) = self.killer.lock().unwrap().take() {
                let _ = killer.kill();
            }
        }
    }
}
