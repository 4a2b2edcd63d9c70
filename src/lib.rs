//! termhub - the terminal multiplexer core of a remote development broker
//!
//! Mobile and web clients drive interactive shells running on a developer
//! workstation. This crate owns the hard middle of that system:
//! - Window lifecycle (create, attach, detach, kill) and durable naming
//! - The PTY layer, optionally delegated to an external tmux server so
//!   windows survive broker restarts
//! - Single-writer input discipline per window
//! - Bounded output fanout with per-subscriber backpressure and
//!   slow-consumer eviction
//!
//! # Architecture
//!
//! The [`Broker`] owns a registry of windows. Each window is backed by a
//! [`host`](crate::host): either a direct PTY driving a child process, or a
//! PTY driving `tmux attach-session` against a detached external server.
//! Output flows from a per-window reader task through a [`fanout`] that
//! appends to a bounded scrollback and offers each chunk to every attached
//! subscriber without ever blocking on a slow one.
//!
//! Surrounding concerns - transport, auth, UI, the process wrapper - live
//! in collaborating layers that embed the broker and drive its public API.
//!
//! # Example
//!
//! ```no_run
//! use termhub::{Broker, BrokerConfig, CreateSpec, SinkEvent, WindowId};
//!
//! # async fn demo() -> Result<(), termhub::BrokerError> {
//! let broker = Broker::new(BrokerConfig::default()).await;
//! let window = broker.create(CreateSpec::shell()).await?;
//! let id: WindowId = window.id.parse()?;
//!
//! let sub = broker
//!     .attach(
//!         &id,
//!         Box::new(|event| {
//!             if let SinkEvent::Bytes(chunk) = event {
//!                 std::io::Write::write_all(&mut std::io::stdout(), &chunk)?;
//!             }
//!             Ok(())
//!         }),
//!         Some((120, 40)),
//!     )
//!     .await?;
//!
//! broker.write(&id, b"ls\n").await?;
//! broker.detach(&sub);
//! broker.kill(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod fanout;
pub mod host;
pub mod window;

pub use broker::{Broker, BrokerEvent, CreateSpec, ListFilter, SubId};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use fanout::{Sink, SinkEvent};
pub use window::{WindowId, WindowSource, WindowState, WindowSummary};
