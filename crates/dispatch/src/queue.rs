//! The shared event queue between collectors and workers.
//!
//! Multi-producer/multi-consumer FIFO hand-off. Strict FIFO is guaranteed per
//! producer; the live and backfill collectors are independent streams, so
//! consumers must tolerate duplicates and cross-producer reordering (they
//! rely on change-log bookkeeping to de-duplicate effects).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use campusidm_events::Envelope;

/// The queue was closed (all handles dropped); the envelope could not be
/// delivered to any consumer.
#[derive(Debug, Error)]
#[error("event queue closed")]
pub struct QueueClosed;

/// A bounded push did not complete within its wait.
#[derive(Debug, Error)]
pub enum PushError {
    /// All consumer handles dropped; the envelope has nowhere to go.
    #[error("event queue closed")]
    Closed,

    /// No room within the wait. The envelope is handed back so the producer
    /// can re-check the run state and retry.
    #[error("event queue full")]
    Full(Envelope),
}

enum Tx {
    Bounded(mpsc::Sender<Envelope>),
    Unbounded(mpsc::UnboundedSender<Envelope>),
}

enum Rx {
    Bounded(mpsc::Receiver<Envelope>),
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
}

/// Cloneable handle to the shared queue.
///
/// Unbounded by default, matching the original design; a capacity can be set
/// to get producer backpressure instead (`push` then waits for room).
/// Consumers share one receiver, so an envelope is delivered to exactly one
/// worker.
pub struct EventQueue {
    tx: Tx,
    rx: Arc<Mutex<Rx>>,
}

impl EventQueue {
    pub fn unbounded() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Tx::Unbounded(tx),
            rx: Arc::new(Mutex::new(Rx::Unbounded(rx))),
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Tx::Bounded(tx),
            rx: Arc::new(Mutex::new(Rx::Bounded(rx))),
        }
    }

    /// Build a queue from the configured capacity knob.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(n) => Self::bounded(n),
            None => Self::unbounded(),
        }
    }

    /// Enqueue an envelope. FIFO with respect to this producer.
    ///
    /// On a full bounded queue this waits for room with no bound; producer
    /// loops that must observe shutdown use [`push_timeout`](Self::push_timeout).
    pub async fn push(&self, envelope: Envelope) -> Result<(), QueueClosed> {
        match &self.tx {
            Tx::Bounded(tx) => tx.send(envelope).await.map_err(|_| QueueClosed),
            Tx::Unbounded(tx) => tx.send(envelope).map_err(|_| QueueClosed),
        }
    }

    /// Enqueue with a bounded wait for room.
    ///
    /// A full bounded queue hands the envelope back as [`PushError::Full`]
    /// after `wait`, so the producer can re-check the run state and retry.
    /// An unbounded queue never reports `Full`.
    pub async fn push_timeout(&self, envelope: Envelope, wait: Duration) -> Result<(), PushError> {
        match &self.tx {
            Tx::Bounded(tx) => match tx.send_timeout(envelope, wait).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(envelope)) => Err(PushError::Full(envelope)),
                Err(SendTimeoutError::Closed(_)) => Err(PushError::Closed),
            },
            Tx::Unbounded(tx) => tx.send(envelope).map_err(|_| PushError::Closed),
        }
    }

    /// Wait up to `wait` for the next envelope.
    ///
    /// Returns `None` on timeout, which is when a consumer loop should
    /// re-check the run state. The wait covers acquiring the shared receiver
    /// too, so idle consumers time out concurrently rather than queueing
    /// behind one another for a full wait each.
    pub async fn recv_timeout(&self, wait: Duration) -> Option<Envelope> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            match &mut *rx {
                Rx::Bounded(rx) => rx.recv().await,
                Rx::Unbounded(rx) => rx.recv().await,
            }
        };
        timeout(wait, recv).await.ok().flatten()
    }
}

impl Clone for EventQueue {
    fn clone(&self) -> Self {
        Self {
            tx: match &self.tx {
                Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
                Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
            },
            rx: Arc::clone(&self.rx),
        }
    }
}
