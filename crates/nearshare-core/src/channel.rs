//! Channels multiplex application instances inside one session.
//!
//! A channel refers to its session through a weak handle so that the session
//! can own its channels without a reference cycle; a channel whose session is
//! gone reports `Disposed` on every operation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::header::{AdditionalHeader, CommonHeader, MessageType};
use crate::session::Session;

/// A completed (reassembled, decrypted) application message.
#[derive(Debug)]
pub struct AppMessage {
    /// Header of the completing fragment
    pub header: CommonHeader,
    /// Assembled plaintext payload
    pub payload: Vec<u8>,
}

/// Contract implemented by channel applications.
#[async_trait]
pub trait ChannelApp: Send + Sync + 'static {
    /// Handle one complete inbound message. Runs on a background task; may
    /// suspend on user decisions and sink I/O.
    async fn handle_message(&self, channel: &Arc<Channel>, message: AppMessage) -> Result<()>;

    /// Called when the channel is torn down with the application still
    /// holding pending work (outstanding acceptance promises).
    fn abort(&self) {}
}

/// Factory registry mapping application ids to constructors.
#[derive(Default)]
pub struct AppRegistry {
    factories: HashMap<Uuid, Box<dyn Fn(&str) -> Arc<dyn ChannelApp> + Send + Sync>>,
}

impl AppRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under an application id.
    pub fn register<F>(&mut self, app_id: Uuid, factory: F)
    where
        F: Fn(&str) -> Arc<dyn ChannelApp> + Send + Sync + 'static,
    {
        self.factories.insert(app_id, Box::new(factory));
    }

    /// Instantiate the application registered under `app_id`, if any.
    #[must_use]
    pub fn create(&self, app_id: &Uuid, app_name: &str) -> Option<Arc<dyn ChannelApp>> {
        self.factories.get(app_id).map(|f| f(app_name))
    }
}

/// One multiplexing unit inside a session.
pub struct Channel {
    id: u64,
    session: Weak<Session>,
    app: Arc<dyn ChannelApp>,
    inbox: mpsc::UnboundedSender<AppMessage>,
}

impl Channel {
    /// Construct the channel and start its worker task. The worker drains
    /// the channel's inbox one message at a time, which is what guarantees
    /// per-channel delivery in sequence-number order while the connection
    /// reader keeps draining frames.
    pub(crate) fn new(id: u64, session: &Arc<Session>, app: Arc<dyn ChannelApp>) -> Arc<Self> {
        let (inbox, mut rx) = mpsc::unbounded_channel::<AppMessage>();
        let channel = Arc::new(Self {
            id,
            session: Arc::downgrade(session),
            app,
            inbox,
        });

        let worker = channel.clone();
        let session_weak = Arc::downgrade(session);
        let mut closed = session.closed_signal();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = closed.changed() => break,
                };

                let sequence = message.header.sequence_number;
                let result = worker.app.handle_message(&worker, message).await;

                let Some(session) = session_weak.upgrade() else {
                    break;
                };
                session.finish_reassembly(sequence);

                if let Err(err) = result {
                    match err {
                        ProtocolError::Cancelled => {
                            tracing::info!(channel = worker.id, "transfer cancelled")
                        }
                        err => {
                            tracing::warn!(channel = worker.id, %err, "application error")
                        }
                    }
                    session.dispose();
                    break;
                }
            }
        });

        channel
    }

    /// Queue a completed message for the worker. Never blocks the caller.
    pub(crate) fn deliver(&self, message: AppMessage) -> Result<()> {
        self.inbox
            .send(message)
            .map_err(|_| ProtocolError::Disposed)
    }

    /// Channel id, unique within its session.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The application bound to this channel.
    #[must_use]
    pub fn app(&self) -> &Arc<dyn ChannelApp> {
        &self.app
    }

    /// Upgrade the session handle.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Disposed` once the session is gone.
    pub fn session(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or(ProtocolError::Disposed)
    }

    /// Send an application payload on this channel (encrypted Session frame).
    pub async fn send_message(&self, payload: &[u8]) -> Result<()> {
        let session = self.session()?;
        let mut header = CommonHeader::new(MessageType::Session);
        header.channel_id = self.id;
        session.send_encrypted(header, payload).await
    }

    /// Acknowledge an inbound message that had the should-ack flag set.
    pub async fn send_ack(&self, inbound: &CommonHeader) -> Result<()> {
        let session = self.session()?;
        let mut header = CommonHeader::new(MessageType::Ack);
        header.channel_id = self.id;
        header.request_id = inbound.request_id;
        header
            .additional_headers
            .push(AdditionalHeader::reply_to(inbound.request_id));
        session.send_encrypted(header, &[]).await
    }

    /// Tear down the channel and its session. Near Share sessions are
    /// single-shot: one transfer, then the peer opens a fresh session.
    pub fn close(&self) {
        if let Some(session) = self.session.upgrade() {
            session.dispose();
        }
    }

    pub(crate) fn abort_app(&self) {
        self.app.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullApp;

    #[async_trait]
    impl ChannelApp for NullApp {
        async fn handle_message(&self, _channel: &Arc<Channel>, _message: AppMessage) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_creates_registered_apps() {
        let mut registry = AppRegistry::new();
        let id = Uuid::parse_str("9bf77e14-5a50-4c6b-a9d8-bbb4e3b3cc5e").unwrap();
        registry.register(id, |_| Arc::new(NullApp));

        assert!(registry.create(&id, "NearSharePlatform").is_some());
        assert!(registry.create(&Uuid::nil(), "Unknown").is_none());
    }
}
