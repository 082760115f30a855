//! Transfer token: the external handle for one inbound file.
//!
//! The token carries the acceptance promise (a one-shot fulfilled with a
//! writable sink, or cancelled) and publishes the received-byte counter
//! through a watch channel. The application task awaits the decision; the
//! connection reader never does.

use std::sync::Mutex;

use tokio::sync::{oneshot, watch};

use crate::error::{ProtocolError, Result};
use crate::platform::TransferSink;

enum Decision {
    Accepted(Box<dyn TransferSink>),
    Cancelled,
}

/// Handle representing one inbound file offer.
pub struct FileTransferToken {
    file_name: String,
    total_bytes: u64,
    decision_tx: Mutex<Option<oneshot::Sender<Decision>>>,
    decision_rx: Mutex<Option<oneshot::Receiver<Decision>>>,
    received: watch::Sender<u64>,
}

impl FileTransferToken {
    /// Create a token for a declared file name and size.
    #[must_use]
    pub fn new(file_name: impl Into<String>, total_bytes: u64) -> Self {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (received, _) = watch::channel(0);
        Self {
            file_name: file_name.into(),
            total_bytes,
            decision_tx: Mutex::new(Some(decision_tx)),
            decision_rx: Mutex::new(Some(decision_rx)),
            received,
        }
    }

    /// Declared file name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Declared transfer size in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Accept the transfer, supplying the sink received bytes go to.
    ///
    /// Only the first of `accept`/`cancel` wins; later calls are no-ops.
    pub fn accept(&self, sink: Box<dyn TransferSink>) {
        if let Some(tx) = self.take_sender() {
            let _ = tx.send(Decision::Accepted(sink));
        }
    }

    /// Cancel the transfer. Idempotent and safe from any thread.
    pub fn cancel(&self) {
        if let Some(tx) = self.take_sender() {
            let _ = tx.send(Decision::Cancelled);
        }
    }

    fn take_sender(&self) -> Option<oneshot::Sender<Decision>> {
        self.decision_tx.lock().expect("lock poisoned").take()
    }

    /// Subscribe to received-byte updates.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.received.subscribe()
    }

    /// Bytes received so far.
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        *self.received.borrow()
    }

    pub(crate) fn publish_received(&self, bytes: u64) {
        let _ = self.received.send(bytes);
    }

    /// Await the platform's decision.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Cancelled` if the transfer was cancelled, the
    /// decision was already consumed, or the token was dropped undecided.
    pub(crate) async fn decision(&self) -> Result<Box<dyn TransferSink>> {
        let rx = self
            .decision_rx
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or(ProtocolError::Cancelled)?;

        match rx.await {
            Ok(Decision::Accepted(sink)) => Ok(sink),
            Ok(Decision::Cancelled) | Err(_) => Err(ProtocolError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemorySink;

    #[tokio::test]
    async fn test_accept_yields_sink() {
        let token = FileTransferToken::new("a.bin", 100);
        token.accept(Box::new(MemorySink::new()));

        let mut sink = token.decision().await.unwrap();
        sink.write_at(0, b"ok").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_fails_decision() {
        let token = FileTransferToken::new("a.bin", 100);
        token.cancel();
        assert!(matches!(
            token.decision().await,
            Err(ProtocolError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_first_decision_wins() {
        let token = FileTransferToken::new("a.bin", 100);
        token.cancel();
        token.accept(Box::new(MemorySink::new()));
        assert!(matches!(
            token.decision().await,
            Err(ProtocolError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let token = FileTransferToken::new("a.bin", 100);
        let mut progress = token.progress();

        token.publish_received(40);
        progress.changed().await.unwrap();
        assert_eq!(*progress.borrow(), 40);
        assert_eq!(token.received_bytes(), 40);
    }

    #[tokio::test]
    async fn test_decision_from_another_task() {
        let token = std::sync::Arc::new(FileTransferToken::new("a.bin", 10));
        let decider = token.clone();
        tokio::spawn(async move {
            decider.accept(Box::new(MemorySink::new()));
        });
        assert!(token.decision().await.is_ok());
    }
}
