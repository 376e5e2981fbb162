use std::io::{ErrorKind, Read};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use super::{Message, ProtocolError};

/// Size of the big-endian length prefix
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted in either direction (10 MiB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Encode a message into a complete frame
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    message.validate()?;

    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        error!("Refusing to encode {} message of {} bytes", message.kind(), payload.len());
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Decode one message from a blocking reader.
///
/// Returns `Ok(None)` when the stream ends before the first header byte.
pub fn decode<R: Read>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    match fill(reader, &mut header)? {
        0 => return Ok(None),
        n if n < HEADER_SIZE => return Err(closed(n, HEADER_SIZE)),
        _ => {}
    }

    let length = payload_length(header)?;
    let mut payload = vec![0u8; length];
    let received = fill(reader, &mut payload)?;
    if received < length {
        return Err(closed(received, length));
    }

    parse_payload(&payload).map(Some)
}

/// Decode one message from an async reader.
///
/// Suspends until the full frame has arrived or the peer closes. Returns
/// `Ok(None)` on a clean close before the first header byte.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match fill_async(reader, &mut header).await? {
        0 => return Ok(None),
        n if n < HEADER_SIZE => return Err(closed(n, HEADER_SIZE)),
        _ => {}
    }

    let length = payload_length(header)?;
    let mut frame = vec![0u8; HEADER_SIZE + length];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    let received = fill_async(reader, &mut frame[HEADER_SIZE..]).await?;
    if received < length {
        return Err(closed(received, length));
    }

    // Whole frame buffered; the blocking decoder cannot stall on it
    decode(&mut frame.as_slice())
}

/// Encode and write one message, flushing the writer
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;

    debug!("Sent {} message ({} bytes)", message.kind(), frame.len());

    Ok(())
}

/// Length announced by a header, rejected before anything is allocated
fn payload_length(header: [u8; HEADER_SIZE]) -> Result<usize, ProtocolError> {
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(length)
}

fn parse_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    Message::from_value(value)
}

fn closed(received: usize, expected: usize) -> ProtocolError {
    ProtocolError::ConnectionClosed { received, expected }
}

/// Read until `buf` is full or EOF, returning the number of bytes read
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

async fn fill_async<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
