//! Contracts between the protocol engine and its embedding.
//!
//! The core never talks to a user or a disk directly: URI and file events go
//! to a [`ShareHandler`] supplied by the platform, and received bytes land in
//! a [`TransferSink`] the handler picks when it accepts a transfer. Log lines
//! flow through `tracing`; the embedding installs the subscriber.

use std::sync::Arc;

use async_trait::async_trait;

use crate::app::token::FileTransferToken;

/// Remote peer identity as known to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    /// Display name (shown in user-facing events)
    pub name: String,
    /// Transport address the connection arrived from
    pub address: String,
}

/// Local device identity presented during authentication.
#[derive(Clone)]
pub struct LocalIdentity {
    /// Display name advertised to peers
    pub device_name: String,
    /// Opaque certificate bytes; persistence is the embedding's concern
    pub certificate: Vec<u8>,
}

/// Platform callbacks for user-visible events.
#[async_trait]
pub trait ShareHandler: Send + Sync + 'static {
    /// A peer shared a URI with this device.
    async fn on_received_uri(&self, device_name: &str, uri: &str);

    /// A peer wants to send a file. The handler decides by calling
    /// [`FileTransferToken::accept`] or [`FileTransferToken::cancel`]; the
    /// transfer stays suspended until it does.
    async fn on_file_transfer(&self, token: Arc<FileTransferToken>);
}

/// Positioned-write destination for received file bytes.
#[async_trait]
pub trait TransferSink: Send + 'static {
    /// Write `data` at absolute `position`.
    async fn write_at(&mut self, position: u64, data: &[u8]) -> std::io::Result<()>;
}

/// Growable in-memory sink, mainly for tests and loopback embeddings.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Vec<u8>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the accumulated bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[async_trait]
impl TransferSink for MemorySink {
    async fn write_at(&mut self, position: u64, data: &[u8]) -> std::io::Result<()> {
        let position = position as usize;
        if self.buffer.len() < position + data.len() {
            self.buffer.resize(position + data.len(), 0);
        }
        self.buffer[position..position + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_sequential_writes() {
        let mut sink = MemorySink::new();
        sink.write_at(0, b"abc").await.unwrap();
        sink.write_at(3, b"def").await.unwrap();
        assert_eq!(sink.as_bytes(), b"abcdef");
    }

    #[tokio::test]
    async fn test_memory_sink_sparse_write_zero_fills() {
        let mut sink = MemorySink::new();
        sink.write_at(4, b"xy").await.unwrap();
        assert_eq!(sink.as_bytes(), &[0, 0, 0, 0, b'x', b'y']);
    }

    #[tokio::test]
    async fn test_memory_sink_overwrite() {
        let mut sink = MemorySink::new();
        sink.write_at(0, b"aaaa").await.unwrap();
        sink.write_at(1, b"bb").await.unwrap();
        assert_eq!(sink.as_bytes(), b"abba");
    }
}
