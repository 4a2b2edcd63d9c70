//! Per-window output fanout with bounded subscriber queues.
//!
//! One ingest path per window: the pump appends each host chunk to the
//! scrollback and offers it to every subscriber without blocking. Slow
//! subscribers accumulate dropped bytes and are evicted once they fall too
//! far behind, so a single bad connection can never stall the reader or,
//! through the PTY's small kernel buffer, the child process itself.

mod scrollback;

pub use scrollback::Scrollback;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

/// A chunk or control event delivered to a subscriber's sink.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Raw output bytes, in host-emission order.
    Bytes(Vec<u8>),

    /// The window's process exited; no further bytes follow.
    Exited {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// This subscriber was evicted for falling behind.
    Evicted { dropped_bytes: u64 },
}

/// Delivery function for one subscriber.
///
/// Invoked from a dedicated sender task on the blocking pool, so it may
/// block or sleep. Returning an error removes the subscriber; the window is
/// unaffected.
pub type Sink = Box<dyn FnMut(SinkEvent) -> anyhow::Result<()> + Send + 'static>;

struct SubEntry {
    tx: mpsc::Sender<SinkEvent>,
    dropped: u64,
    failed: Arc<AtomicBool>,
    /// Final event handed to the sink after the queue drains.
    parting: Arc<Mutex<Option<SinkEvent>>>,
    sender: JoinHandle<()>,
}

struct Inner {
    scrollback: Scrollback,
    subscribers: HashMap<u64, SubEntry>,
    next_seq: u64,
    closed: bool,
}

/// Fans host output out to subscribers, each behind a bounded queue.
///
/// A single lock guards the scrollback and the subscriber set, which makes
/// replay-on-attach atomic: a chunk is either in the snapshot a new
/// subscriber replays or offered to it live, never both, never neither.
/// The lock is only ever held for ring appends and `try_send`.
pub struct Fanout {
    inner: Mutex<Inner>,
    queue_chunks: usize,
    evict_bytes: u64,
}

impl Fanout {
    pub fn new(scrollback_bytes: usize, queue_chunks: usize, evict_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                scrollback: Scrollback::new(scrollback_bytes),
                subscribers: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            // A zero-capacity queue cannot hold the replay chunk.
            queue_chunks: queue_chunks.max(1),
            evict_bytes,
        }
    }

    /// Append a chunk to the scrollback and offer it to every subscriber.
    ///
    /// Never blocks: a full queue counts the chunk against the subscriber's
    /// dropped-byte budget instead. Returns `(seq, dropped_bytes)` for each
    /// subscriber evicted by this chunk.
    pub fn publish(&self, chunk: &[u8]) -> Vec<(u64, u64)> {
        let mut evicted = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return evicted;
        }
        inner.scrollback.append(chunk);

        let mut remove = Vec::new();
        for (&seq, entry) in inner.subscribers.iter_mut() {
            if entry.failed.load(Ordering::Relaxed) {
                remove.push((seq, false));
                continue;
            }
            match entry.tx.try_send(SinkEvent::Bytes(chunk.to_vec())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped += chunk.len() as u64;
                    if entry.dropped > self.evict_bytes {
                        remove.push((seq, true));
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    remove.push((seq, false));
                }
            }
        }

        for (seq, evict) in remove {
            if let Some(entry) = inner.subscribers.remove(&seq) {
                if evict {
                    *entry.parting.lock().unwrap() = Some(SinkEvent::Evicted {
                        dropped_bytes: entry.dropped,
                    });
                    evicted.push((seq, entry.dropped));
                }
                // Dropping the entry closes the queue; the sender task
                // drains what is left and delivers the parting event.
            }
        }
        evicted
    }

    /// Register a subscriber and return its sequence number, or `None` once
    /// the fanout is closed.
    ///
    /// The scrollback snapshot is enqueued before any live chunk, so the
    /// subscriber's stream begins with the replay prefix.
    pub fn subscribe(&self, mut sink: Sink) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let (tx, mut rx) = mpsc::channel(self.queue_chunks);
        let snapshot = inner.scrollback.snapshot();
        if !snapshot.is_empty() {
            // Fresh queue with capacity >= 1: cannot fail.
            let _ = tx.try_send(SinkEvent::Bytes(snapshot));
        }

        let failed = Arc::new(AtomicBool::new(false));
        let parting: Arc<Mutex<Option<SinkEvent>>> = Arc::new(Mutex::new(None));
        let sender = {
            let failed = Arc::clone(&failed);
            let parting = Arc::clone(&parting);
            task::spawn_blocking(move || {
                while let Some(event) = rx.blocking_recv() {
                    if let Err(err) = sink(event) {
                        tracing::debug!("subscriber sink failed: {err}");
                        failed.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                if let Some(event) = parting.lock().unwrap().take() {
                    let _ = sink(event);
                }
            })
        };

        inner.subscribers.insert(
            seq,
            SubEntry {
                tx,
                dropped: 0,
                failed,
                parting,
                sender,
            },
        );
        Some(seq)
    }

    /// Remove a subscriber. Idempotent: unknown sequence numbers are fine.
    /// Queued chunks are still drained to the sink before it winds down.
    pub fn remove(&self, seq: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.remove(&seq).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    pub fn scrollback_len(&self) -> usize {
        self.inner.lock().unwrap().scrollback.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Stop accepting chunks and subscribers, handing every remaining
    /// subscriber `parting` as its final event. Returns the sender task
    /// handles so the caller can bound the drain.
    pub fn close(&self, parting: SinkEvent) -> Vec<JoinHandle<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let mut handles = Vec::new();
        for (_, entry) in inner.subscribers.drain() {
            if !entry.failed.load(Ordering::Relaxed) {
                *entry.parting.lock().unwrap() = Some(parting.clone());
            }
            handles.push(entry.sender);
        }
        handles
    }
}
