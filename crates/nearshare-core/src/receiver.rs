//! Per-connection receive loop.
//!
//! The transport hands the core a duplex byte stream; frames are a 16-bit
//! big-endian length prefix followed by a CommonHeader and body. One reader
//! drains the stream sequentially. Connect and Control messages are handled
//! inline (they are short and synchronous); Session messages are handed to a
//! background task once reassembly completes, so the reader never suspends
//! on application logic.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;

use crate::error::{ProtocolError, Result};
use crate::header::CommonHeader;
use crate::host::{SessionHost, SharedWriter};
use crate::platform::RemoteDevice;
use crate::session::Session;
use crate::wire::Reader;

/// Serve one transport connection until the peer hangs up, the session is
/// torn down, or a fatal protocol error occurs.
///
/// # Errors
///
/// Any protocol or I/O error is returned after disposing the session the
/// frame belonged to; the caller drops the transport.
pub async fn serve_connection<R, W>(
    host: Arc<SessionHost>,
    reader: R,
    writer: W,
    device: RemoteDevice,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
    let mut reader = reader;
    let mut current: Option<Arc<Session>> = None;

    let result = loop {
        let frame = match read_frame(&mut reader, current.as_deref()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };

        match dispatch(&host, &writer, &device, &frame, &mut current).await {
            Ok(()) => {
                if current.as_deref().is_some_and(Session::is_disposed) {
                    break Ok(());
                }
            }
            Err(err) => break Err(err),
        }
    };

    if let Err(err) = &result {
        tracing::warn!(device = %device.address, %err, "connection failed");
        if let Some(session) = &current {
            session.dispose();
        }
    }
    result
}

/// Read one length-prefixed frame. Returns `None` on clean shutdown: the
/// peer closed the stream between frames, or the current session was
/// disposed while the reader was blocked.
async fn read_frame<R>(reader: &mut R, current: Option<&Session>) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];

    let read = async {
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(ProtocolError::Io(err)),
        }
    };

    let got_prefix = match current {
        Some(session) => {
            let mut closed = session.closed_signal();
            if session.is_disposed() {
                return Ok(None);
            }
            tokio::select! {
                r = read => r?,
                _ = closed.changed() => return Ok(None),
            }
        }
        None => read.await?,
    };
    if !got_prefix {
        return Ok(None);
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

async fn dispatch(
    host: &Arc<SessionHost>,
    writer: &SharedWriter,
    device: &RemoteDevice,
    frame: &[u8],
    current: &mut Option<Arc<Session>>,
) -> Result<()> {
    let mut frame_reader = Reader::new(frame);
    let header = CommonHeader::parse(&mut frame_reader)?;
    let body = frame_reader.read_to_end();

    let session = host.get_or_create(device, &header, writer)?;
    *current = Some(session.clone());

    session.handle_message(&header, body).await
}
