//! Process-wide session registry.
//!
//! The host is an explicitly constructed value threaded through the
//! transport acceptor, not ambient state, so tests can run parallel
//! receivers. It owns the local identity, the platform handler, the
//! application-factory registry, and the map from local session id to live
//! session.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::app::nearshare::NearShareApp;
use crate::channel::AppRegistry;
use crate::error::{ProtocolError, Result};
use crate::header::{session_local, session_remote, CommonHeader};
use crate::platform::{LocalIdentity, RemoteDevice, ShareHandler};
use crate::session::Session;
use crate::{INITIAL_SESSION_ID, NEARSHARE_APP_ID};

/// Serialized write half of one transport connection.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Registry of live sessions plus everything they share.
pub struct SessionHost {
    identity: LocalIdentity,
    handler: Arc<dyn ShareHandler>,
    apps: AppRegistry,
    sessions: DashMap<u32, Arc<Session>>,
    next_session_id: AtomicU32,
}

impl SessionHost {
    /// Create a host with the Near Share application registered under its
    /// well-known id.
    #[must_use]
    pub fn new(identity: LocalIdentity, handler: Arc<dyn ShareHandler>) -> Arc<Self> {
        let mut apps = AppRegistry::new();
        let app_id = Uuid::parse_str(NEARSHARE_APP_ID).expect("well-known app id parses");
        apps.register(app_id, |_name| Arc::new(NearShareApp::new()));

        Arc::new(Self {
            identity,
            handler,
            apps,
            sessions: DashMap::new(),
            next_session_id: AtomicU32::new(INITIAL_SESSION_ID),
        })
    }

    pub(crate) fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ShareHandler> {
        &self.handler
    }

    pub(crate) fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Local ids of all live sessions.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<u32> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Resolve the session a frame belongs to, creating one when the frame's
    /// local half is zero (new-session initiator).
    ///
    /// # Errors
    ///
    /// `UnknownSession` when the local id has no registration, `WrongRemote`
    /// when the remote half differs from the registration, `WrongDevice`
    /// when the frame arrived from a different transport address, `Disposed`
    /// when the session was already torn down.
    pub fn get_or_create(
        self: &Arc<Self>,
        device: &RemoteDevice,
        header: &CommonHeader,
        writer: &SharedWriter,
    ) -> Result<Arc<Session>> {
        let local = session_local(header.session_id);
        let remote = session_remote(header.session_id);

        if local == 0 {
            let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            let session = Session::new(self, id, remote, device.clone(), writer.clone());
            self.sessions.insert(id, session.clone());
            tracing::info!(session = id, device = %device.name, "session created");
            return Ok(session);
        }

        let session = self
            .sessions
            .get(&local)
            .map(|entry| entry.value().clone())
            .ok_or(ProtocolError::UnknownSession(local))?;

        if session.remote_id() != remote {
            return Err(ProtocolError::WrongRemote {
                expected: session.remote_id(),
                actual: remote,
            });
        }
        if session.device().address != device.address {
            return Err(ProtocolError::WrongDevice);
        }
        if session.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        Ok(session)
    }

    pub(crate) fn remove_session(&self, local_id: u32) {
        self.sessions.remove(&local_id);
    }

    /// Dispose every live session (shutdown path).
    pub fn dispose_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{pack_session_id, MessageType};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullHandler;

    #[async_trait]
    impl crate::platform::ShareHandler for NullHandler {
        async fn on_received_uri(&self, _device_name: &str, _uri: &str) {}
        async fn on_file_transfer(&self, _token: Arc<crate::app::token::FileTransferToken>) {}
    }

    fn test_host() -> Arc<SessionHost> {
        SessionHost::new(
            LocalIdentity {
                device_name: "receiver".to_string(),
                certificate: vec![1, 2, 3],
            },
            Arc::new(NullHandler),
        )
    }

    fn test_writer() -> SharedWriter {
        Arc::new(Mutex::new(Box::new(tokio::io::sink())))
    }

    fn device(address: &str) -> RemoteDevice {
        RemoteDevice {
            name: "peer".to_string(),
            address: address.to_string(),
        }
    }

    fn header_for(session_id: u64) -> CommonHeader {
        let mut header = CommonHeader::new(MessageType::Connect);
        header.session_id = session_id;
        header
    }

    #[tokio::test]
    async fn test_fresh_ids_are_contiguous_from_initial() {
        let host = test_host();
        let writer = test_writer();
        let dev = device("aa:bb");

        for offset in 0..4u32 {
            let session = host
                .get_or_create(&dev, &header_for(pack_session_id(0, 0x99)), &writer)
                .unwrap();
            assert_eq!(session.local_id(), INITIAL_SESSION_ID + offset);
        }
        assert_eq!(host.session_count(), 4);
    }

    #[tokio::test]
    async fn test_lookup_existing_session() {
        let host = test_host();
        let writer = test_writer();
        let dev = device("aa:bb");

        let created = host
            .get_or_create(&dev, &header_for(pack_session_id(0, 0x99)), &writer)
            .unwrap();
        let found = host
            .get_or_create(
                &dev,
                &header_for(pack_session_id(created.local_id(), 0x99)),
                &writer,
            )
            .unwrap();
        assert_eq!(found.local_id(), created.local_id());
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let host = test_host();
        let err = host
            .get_or_create(
                &device("aa:bb"),
                &header_for(pack_session_id(0x77, 0x99)),
                &test_writer(),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSession(0x77)));
    }

    #[tokio::test]
    async fn test_wrong_remote_rejected() {
        let host = test_host();
        let writer = test_writer();
        let dev = device("aa:bb");

        let session = host
            .get_or_create(&dev, &header_for(pack_session_id(0, 0x99)), &writer)
            .unwrap();
        let err = host
            .get_or_create(
                &dev,
                &header_for(pack_session_id(session.local_id(), 0x42)),
                &writer,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongRemote { .. }));
    }

    #[tokio::test]
    async fn test_wrong_device_rejected() {
        let host = test_host();
        let writer = test_writer();

        let session = host
            .get_or_create(&device("aa:bb"), &header_for(pack_session_id(0, 0x99)), &writer)
            .unwrap();
        let err = host
            .get_or_create(
                &device("cc:dd"),
                &header_for(pack_session_id(session.local_id(), 0x99)),
                &writer,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongDevice));
    }

    #[tokio::test]
    async fn test_disposed_session_removed_from_registry() {
        let host = test_host();
        let writer = test_writer();
        let dev = device("aa:bb");

        let session = host
            .get_or_create(&dev, &header_for(pack_session_id(0, 0x99)), &writer)
            .unwrap();
        session.dispose();
        assert_eq!(host.session_count(), 0);

        let err = host
            .get_or_create(
                &dev,
                &header_for(pack_session_id(session.local_id(), 0x99)),
                &writer,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_host_bit_masked_from_remote() {
        let host = test_host();
        let session = host
            .get_or_create(
                &device("aa:bb"),
                &header_for(pack_session_id(0, 0x8000_0042)),
                &test_writer(),
            )
            .unwrap();
        assert_eq!(session.remote_id(), 0x42);
    }
}
