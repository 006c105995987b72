//! In-memory relay fabric.
//!
//! The relay lets a producer HTTP request hand an opaque blob to a consumer
//! HTTP request arriving at a different time, keyed by
//! `"<recipient>-<session>"`, without the server ever persisting bytes. Each
//! key maps to a bounded FIFO; producer and consumer may arrive in either
//! order.
//!
//! Semantics:
//!
//! - `send` enqueues within a deadline, else reports the blob dropped.
//!   Creating the FIFO spawns a sweeper that removes it if no consumer shows
//!   up in time.
//! - `recv` dequeues one blob and then **deletes the FIFO**, one-shot for
//!   the common single-chunk transfer. A `recv` that times out leaves a
//!   consumer-created FIFO behind as the rendezvous point for the next poll.
//! - `wait` is the server-internal form: caller-controlled deadline, FIFO
//!   removed on completion or timeout.
//!
//! This is a best-effort rendezvous, not a queue: a dropped blob is a
//! per-device failure and the pipelines move on to the next replica.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::config;

/// Tunables, separated from the constants so tests can shrink them. The ack
/// and retrieve deadlines belong to the agent adapter but ride along here
/// because they bound waits on this fabric.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub capacity: usize,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub sweep_after: Duration,
    pub ack_timeout: Duration,
    pub retrieve_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: config::RELAY_CAPACITY,
            send_timeout: config::RELAY_SEND_TIMEOUT,
            recv_timeout: config::RELAY_RECV_TIMEOUT,
            sweep_after: config::RELAY_SWEEP_AFTER,
            ack_timeout: config::ACK_TIMEOUT,
            retrieve_timeout: config::RETRIEVE_TIMEOUT,
        }
    }
}

/// Outcome of a producer enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// The FIFO stayed full past the send deadline, or the consumer vanished.
    Dropped,
}

/// One session's bounded FIFO.
///
/// The generation tag lets a sweeper remove exactly the FIFO it was spawned
/// for; a same-key FIFO created later survives the stale sweeper.
struct Fifo {
    generation: u64,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

/// Process-wide rendezvous fabric. Cheap to clone; constructed once in
/// `main` and threaded through the app state.
#[derive(Clone)]
pub struct Relay {
    channels: Arc<DashMap<String, Fifo>>,
    next_generation: Arc<AtomicU64>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    fn key(recipient: &str, session: &str) -> String {
        format!("{recipient}-{session}")
    }

    fn new_fifo(&self) -> Fifo {
        let (tx, rx) = mpsc::channel(self.config.capacity);
        Fifo {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Look up the FIFO for `key`, creating it if absent.
    ///
    /// Returns the producer handle, the consumer handle, and the generation
    /// if this call created the FIFO. The map shard lock is held only for
    /// the lookup/insert, never across a wait.
    fn lookup_or_create(
        &self,
        key: &str,
    ) -> (mpsc::Sender<Vec<u8>>, Arc<Mutex<mpsc::Receiver<Vec<u8>>>>, Option<u64>) {
        match self.channels.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let fifo = entry.get();
                (fifo.tx.clone(), fifo.rx.clone(), None)
            }
            Entry::Vacant(entry) => {
                let fifo = self.new_fifo();
                let out = (fifo.tx.clone(), fifo.rx.clone(), Some(fifo.generation));
                entry.insert(fifo);
                out
            }
        }
    }

    /// Remove the FIFO after `sweep_after` unless a consumer already did.
    fn spawn_sweeper(&self, key: String, generation: u64) {
        let channels = self.channels.clone();
        let delay = self.config.sweep_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let removed = channels
                .remove_if(&key, |_, fifo| fifo.generation == generation)
                .is_some();
            if removed {
                tracing::debug!(key = key.as_str(), "Swept unconsumed relay session");
            }
        });
    }

    /// Producer side: enqueue `blob` for `recipient`/`session`.
    pub async fn send(&self, recipient: &str, session: &str, blob: Vec<u8>) -> SendOutcome {
        let key = Self::key(recipient, session);
        let (tx, _, created) = self.lookup_or_create(&key);
        if let Some(generation) = created {
            self.spawn_sweeper(key.clone(), generation);
        }

        match tx.send_timeout(blob, self.config.send_timeout).await {
            Ok(()) => SendOutcome::Accepted,
            Err(_) => {
                tracing::warn!(key = key.as_str(), "Relay blob dropped");
                SendOutcome::Dropped
            }
        }
    }

    /// Consumer side: dequeue one blob for `me`/`session`.
    ///
    /// Deletes the FIFO on success; leaves it in place on timeout so a
    /// polling consumer keeps its rendezvous point.
    pub async fn recv(&self, me: &str, session: &str) -> Option<Vec<u8>> {
        let key = Self::key(me, session);
        let (_, rx, _) = self.lookup_or_create(&key);

        let got = {
            let mut rx = rx.lock().await;
            tokio::time::timeout(self.config.recv_timeout, rx.recv())
                .await
                .ok()
                .flatten()
        };

        if got.is_some() {
            self.channels.remove(&key);
        }
        got
    }

    /// Server-internal consumer with a caller-supplied deadline.
    ///
    /// Used when the server itself expects a reply (STORE acks, RETRIEVE
    /// data). The FIFO is removed on completion *or* timeout: a reply that
    /// arrives after the deadline has no one waiting and must not linger.
    pub async fn wait(&self, recipient: &str, session: &str, deadline: Duration) -> Option<Vec<u8>> {
        let key = Self::key(recipient, session);
        let (_, rx, _) = self.lookup_or_create(&key);

        let got = {
            let mut rx = rx.lock().await;
            tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
        };

        self.channels.remove(&key);
        got
    }

    /// Number of live FIFOs (for `/stats`).
    pub fn active_sessions(&self) -> usize {
        self.channels.len()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
