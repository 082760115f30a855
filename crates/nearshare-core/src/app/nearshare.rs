//! The Near Share file/URI receiver application.
//!
//! A channel-level state machine over ValueSet messages. Every inbound
//! payload starts with a 12-byte opaque correlation prefix that is echoed on
//! every reply; the prefix structure is transparent to this layer. Sessions
//! are single-shot: one URI or one file, then the channel and session are
//! torn down and a conformant peer opens a fresh session for the next
//! transfer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::app::token::FileTransferToken;
use crate::channel::{AppMessage, Channel, ChannelApp};
use crate::error::{ProtocolError, Result};
use crate::platform::TransferSink;
use crate::valueset::{Value, ValueSet};
use crate::wire::Reader;
use crate::{CORRELATION_PREFIX_SIZE, PARTITION_SIZE};

/// `ControlMessage` values
mod control_message {
    pub const START_REQUEST: u32 = 0;
    pub const START_RESPONSE: u32 = 1;
    pub const CANCEL_REQUEST: u32 = 2;
    pub const FETCH_DATA_REQUEST: u32 = 3;
    pub const FETCH_DATA_RESPONSE: u32 = 4;
}

/// `DataKind` values
mod data_kind {
    pub const FILE: u32 = 1;
    pub const URI: u32 = 2;
}

struct ReceiveState {
    token: Arc<FileTransferToken>,
    sink: Box<dyn TransferSink>,
    bytes_to_send: u64,
    transferred: u64,
}

enum AppState {
    Idle,
    Receiving(ReceiveState),
    Finished,
}

/// Near Share receiver application instance (one per channel).
pub struct NearShareApp {
    /// Serializes message handling per channel; per-channel ordering is the
    /// delivery guarantee the reassembler provides.
    state: AsyncMutex<AppState>,
    /// Token of the transfer in flight, reachable without the state lock so
    /// teardown can cancel a pending acceptance.
    current_token: Mutex<Option<Arc<FileTransferToken>>>,
}

impl NearShareApp {
    /// New idle instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AsyncMutex::new(AppState::Idle),
            current_token: Mutex::new(None),
        }
    }

    async fn send_values(
        &self,
        channel: &Arc<Channel>,
        prefix: &[u8],
        values: &ValueSet,
    ) -> Result<()> {
        let mut payload = prefix.to_vec();
        payload.extend_from_slice(&values.to_bytes()?);
        channel.send_message(&payload).await
    }

    async fn send_start_response(&self, channel: &Arc<Channel>, prefix: &[u8]) -> Result<()> {
        let mut values = ValueSet::new();
        values.insert("ControlMessage", Value::U32(control_message::START_RESPONSE));
        self.send_values(channel, prefix, &values).await
    }

    /// Request every partition of `[0, bytes_to_send)` up front. The final
    /// chunk is requested full-sized and truncated on receive.
    async fn send_fetch_requests(
        &self,
        channel: &Arc<Channel>,
        prefix: &[u8],
        bytes_to_send: u64,
    ) -> Result<()> {
        let mut position = 0u64;
        while position < bytes_to_send {
            let mut values = ValueSet::new();
            values.insert("BlobPosition", Value::U64(position));
            values.insert("BlobSize", Value::U32(PARTITION_SIZE as u32));
            values.insert("ContentId", Value::U32(0));
            values.insert(
                "ControlMessage",
                Value::U32(control_message::FETCH_DATA_REQUEST),
            );
            self.send_values(channel, prefix, &values).await?;
            position += PARTITION_SIZE;
        }
        Ok(())
    }

    async fn on_start_request(
        &self,
        state: &mut AppState,
        channel: &Arc<Channel>,
        prefix: &[u8],
        values: &ValueSet,
    ) -> Result<()> {
        if !matches!(state, AppState::Idle) {
            return Err(ProtocolError::violation("duplicate start request"));
        }

        match values.get_u32("DataKind")? {
            data_kind::URI => {
                let uri = values.get_string("Uri")?;
                let session = channel.session()?;
                tracing::info!(device = %session.device().name, uri, "received uri");
                session
                    .handler()
                    .on_received_uri(&session.device().name, uri)
                    .await;

                *state = AppState::Finished;
                self.send_start_response(channel, prefix).await?;
                channel.close();
                Ok(())
            }
            data_kind::FILE => {
                let names = values.get_string_list("FileNames")?;
                if names.len() != 1 {
                    return Err(ProtocolError::not_implemented(
                        "multi-file transfers are not supported",
                    ));
                }
                let bytes_to_send = values.get_u64("BytesToSend")?;
                let file_name = names[0].to_string();
                tracing::info!(file = %file_name, bytes = bytes_to_send, "file offer");

                let token = Arc::new(FileTransferToken::new(file_name, bytes_to_send));
                *self.current_token.lock().expect("lock poisoned") = Some(token.clone());

                let session = channel.session()?;
                session.handler().on_file_transfer(token.clone()).await;

                // Suspends until the platform accepts or cancels. Runs on
                // the application task, never on the connection reader.
                let sink = token.decision().await?;

                if bytes_to_send == 0 {
                    *state = AppState::Finished;
                    self.send_start_response(channel, prefix).await?;
                    channel.close();
                    return Ok(());
                }

                *state = AppState::Receiving(ReceiveState {
                    token,
                    sink,
                    bytes_to_send,
                    transferred: 0,
                });
                self.send_fetch_requests(channel, prefix, bytes_to_send).await
            }
            other => {
                tracing::warn!(kind = other, "unknown data kind");
                Err(ProtocolError::not_implemented("unknown data kind"))
            }
        }
    }

    async fn on_fetch_data_response(
        &self,
        state: &mut AppState,
        channel: &Arc<Channel>,
        prefix: &[u8],
        values: &ValueSet,
    ) -> Result<()> {
        let AppState::Receiving(receive) = state else {
            return Err(ProtocolError::violation("fetch data response without transfer"));
        };

        let position = values.get_u64("BlobPosition")?;
        let blob = values.get_bytes("DataBlob")?;

        if position > receive.bytes_to_send {
            return Err(ProtocolError::violation("blob position out of range"));
        }
        if blob.len() as u64 > PARTITION_SIZE {
            return Err(ProtocolError::violation("blob exceeds partition size"));
        }

        // Truncate so total bytes written never exceed the declared size.
        let span = (receive.bytes_to_send - position).min(blob.len() as u64) as usize;
        receive.sink.write_at(position, &blob[..span]).await?;
        receive.transferred += span as u64;
        receive.token.publish_received(receive.transferred);

        if receive.transferred >= receive.bytes_to_send {
            tracing::info!(bytes = receive.transferred, "file transfer complete");
            *state = AppState::Finished;
            self.send_start_response(channel, prefix).await?;
            channel.close();
        }
        Ok(())
    }
}

impl Default for NearShareApp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelApp for NearShareApp {
    async fn handle_message(&self, channel: &Arc<Channel>, message: AppMessage) -> Result<()> {
        if message.payload.len() < CORRELATION_PREFIX_SIZE {
            return Err(ProtocolError::violation("payload shorter than correlation prefix"));
        }
        let (prefix, rest) = message.payload.split_at(CORRELATION_PREFIX_SIZE);

        // Acks are independent of the application reply.
        if message.header.flags.should_ack() {
            channel.send_ack(&message.header).await?;
        }

        let values = ValueSet::parse(&mut Reader::new(rest))?;
        let Ok(control) = values.get_u32("ControlMessage") else {
            tracing::debug!("payload without control message ignored");
            return Ok(());
        };

        let mut state = self.state.lock().await;
        match control {
            control_message::START_REQUEST => {
                self.on_start_request(&mut state, channel, prefix, &values)
                    .await
            }
            control_message::FETCH_DATA_RESPONSE => {
                self.on_fetch_data_response(&mut state, channel, prefix, &values)
                    .await
            }
            control_message::CANCEL_REQUEST => {
                tracing::info!("peer cancelled transfer");
                Err(ProtocolError::Cancelled)
            }
            other => {
                tracing::debug!(control = other, "ignoring control message");
                Ok(())
            }
        }
    }

    fn abort(&self) {
        if let Some(token) = self.current_token.lock().expect("lock poisoned").take() {
            token.cancel();
        }
    }
}
