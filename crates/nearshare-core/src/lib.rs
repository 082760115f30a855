//! # Near Share Core
//!
//! Receiver-side protocol engine for Microsoft's Connected Devices Platform
//! (CDP) "Near Share": terminates a CDP transport connection and carries it
//! through key agreement, mutual authentication, channel establishment, and
//! the file/URI transfer application.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Session                                   │
//! │   (authenticated, encrypted context with one remote device)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Channels                                  │
//! │   (multiplexed units, each hosting one application instance)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Frames                                    │
//! │   (length-prefixed CommonHeader + AES-CBC/HMAC envelope)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core consumes raw byte streams supplied by an external transport
//! (Bluetooth RFCOMM in the reference deployment) and delegates user-visible
//! events to a [`platform::ShareHandler`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod channel;
pub mod error;
pub mod header;
pub mod host;
pub mod platform;
pub mod reassembly;
pub mod receiver;
pub mod session;
pub mod valueset;
pub mod wire;

pub use app::{FileTransferToken, NearShareApp};
pub use channel::{AppMessage, AppRegistry, Channel, ChannelApp};
pub use error::{ProtocolError, Result};
pub use header::{AdditionalHeader, CommonHeader, MessageFlags, MessageType};
pub use host::SessionHost;
pub use platform::{LocalIdentity, MemorySink, RemoteDevice, ShareHandler, TransferSink};
pub use receiver::serve_connection;
pub use session::Session;
pub use valueset::{Value, ValueSet};

/// First local session id handed out by a fresh host
pub const INITIAL_SESSION_ID: u32 = 0x0e;

/// First channel id allocated inside a session
pub const FIRST_CHANNEL_ID: u64 = 1;

/// Fixed slice size of one FetchData exchange
pub const PARTITION_SIZE: u64 = 102_400;

/// Opaque correlation prefix length on every application payload
pub const CORRELATION_PREFIX_SIZE: usize = 12;

/// HResult carried by an UpgradeFailure reply (E_ABORT)
pub const UPGRADE_FAILURE_HRESULT: u32 = 0x8000_4004;

/// Well-known application id Near Share registers under
pub const NEARSHARE_APP_ID: &str = "9bf77e14-5a50-4c6b-a9d8-bbb4e3b3cc5e";

/// Display name carried in StartChannelRequest for Near Share
pub const NEARSHARE_APP_NAME: &str = "NearSharePlatform";
