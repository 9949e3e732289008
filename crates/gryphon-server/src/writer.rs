//! Response writing with write-buffer backpressure.
//!
//! Every connection gets one writer task draining an mpsc channel into the
//! framed socket. [`WriteMeter`] counts bytes that have been accepted for
//! writing but not yet flushed; producers stall once the backlog crosses the
//! high-water mark and resume after it drains below the low-water mark, so a
//! slow reader cannot balloon server memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use gryphon_core::message::ResponseMessage;
use gryphon_core::serializer::{MessageSerializer, SerializationError};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("connection closed while writing response")]
    ConnectionClosed,
}

/// Unflushed-byte accounting for one connection.
pub struct WriteMeter {
    pending: AtomicUsize,
    paused: AtomicBool,
    high_water_mark: usize,
    low_water_mark: usize,
    drained: Notify,
}

impl WriteMeter {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            high_water_mark,
            low_water_mark,
            drained: Notify::new(),
        }
    }

    /// Admits `len` bytes, waiting while the backlog sits above the
    /// high-water mark.
    pub async fn reserve(&self, len: usize) {
        loop {
            let wait = self.drained.notified();
            if self.pending.load(Ordering::Acquire) <= self.high_water_mark {
                self.pending.fetch_add(len, Ordering::AcqRel);
                return;
            }
            if !self.paused.swap(true, Ordering::AcqRel) {
                warn!("pausing response writing as writeBufferHighWaterMark exceeded");
            }
            wait.await;
        }
    }

    /// Records `len` bytes as flushed and wakes stalled producers once the
    /// backlog has drained below the low-water mark.
    pub fn complete(&self, len: usize) {
        let before = self.pending.fetch_sub(len, Ordering::AcqRel);
        if before.saturating_sub(len) <= self.low_water_mark {
            if self.paused.swap(false, Ordering::AcqRel) {
                debug!("resuming response writing below writeBufferLowWaterMark");
            }
            self.drained.notify_waiters();
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Shared handle for pushing responses to one connection's writer task.
#[derive(Clone)]
pub struct ResponseWriter {
    serializer: Arc<dyn MessageSerializer>,
    tx: mpsc::Sender<Bytes>,
    meter: Arc<WriteMeter>,
}

impl ResponseWriter {
    pub fn new(
        serializer: Arc<dyn MessageSerializer>,
        tx: mpsc::Sender<Bytes>,
        meter: Arc<WriteMeter>,
    ) -> Self {
        Self {
            serializer,
            tx,
            meter,
        }
    }

    /// Serializes and enqueues one response. Serialization failures surface
    /// to the caller so it can substitute an error response for this request
    /// without touching the connection.
    pub async fn send(&self, msg: &ResponseMessage) -> Result<(), WriteError> {
        let bytes = self.serializer.serialize_response(msg)?;
        self.meter.reserve(bytes.len()).await;
        self.tx
            .send(bytes)
            .await
            .map_err(|_| WriteError::ConnectionClosed)
    }

    /// Sends where nothing useful can be done about a failure, e.g. error
    /// replies racing a disconnect.
    pub async fn send_best_effort(&self, msg: &ResponseMessage) {
        if let Err(err) = self.send(msg).await {
            debug!(error = %err, request_id = %msg.request_id, "failed to deliver response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_admits_below_the_high_water_mark() {
        let meter = WriteMeter::new(100, 50);
        meter.reserve(80).await;
        assert_eq!(meter.pending(), 80);
        // Still admitted: the backlog check happens before the add.
        meter.reserve(80).await;
        assert_eq!(meter.pending(), 160);
    }

    #[tokio::test]
    async fn reserve_stalls_until_the_backlog_drains() {
        let meter = Arc::new(WriteMeter::new(100, 50));
        meter.reserve(150).await;

        let stalled = Arc::clone(&meter);
        let waiter = tokio::spawn(async move { stalled.reserve(10).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Draining to the low-water mark releases the waiter.
        meter.complete(120);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meter.pending(), 40);
    }
}
