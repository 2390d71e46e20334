//! Framing, streaming and compression
//!
//! Wire format:
//! ```text
//! Direct frame:
//!   [4 bytes: body length (u32 BE)]
//!   [body bytes (MessagePack Message)]
//!
//! Streamed payload:
//!   [direct frame carrying Message::StreamHeader { length, format, .. }]
//!   [length raw bytes, written in BLOCK_SIZE blocks]
//! ```
//!
//! The raw bytes of a streamed payload are the MessagePack body of the
//! carried message, zlib-compressed when the header says so.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, Result, disconnected};
use crate::wire::message::{
    Message, RecvCaps, StreamCompression, StreamEncoding, StreamFormat, StreamHeader,
};

/// Encoded bodies of at least this many bytes are eligible for streaming
pub const STREAM_THRESHOLD: usize = 128 * 1024;
/// Streamed blobs are written and forwarded in blocks of this size
pub const BLOCK_SIZE: usize = 64 * 1024;
/// Length of the leading sample used to test compressibility
pub const COMPRESS_TRIAL: usize = 128 * 1024;
/// Compress only if the sample shrinks below this fraction of its size
pub const COMPRESS_MIN_RATIO: f64 = 0.8;
/// zlib level, favouring speed over size
pub const COMPRESSION_LEVEL: u32 = 3;
/// Largest accepted frame body or streamed blob
#[cfg(not(test))]
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;
/// Kept small in unit tests so oversize payloads are cheap to build
#[cfg(test)]
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Serialize a message body
pub fn encode_body(msg: &Message) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Serialize a message into a complete direct frame
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let body = encode_body(msg)?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&frame_prefix(body.len())?);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Deserialize a message body
///
/// Undecodable bodies become [`Message::Unloadable`] so that one bad
/// message does not tear down the connection.
pub fn decode_body(body: &[u8]) -> Message {
    match rmp_serde::from_slice(body) {
        Ok(msg) => msg,
        Err(e) => Message::Unloadable(format!("load error: {e}")),
    }
}

/// Length prefix for a direct frame of `len` body bytes
pub fn frame_prefix(len: usize) -> Result<[u8; 4]> {
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::InvalidProtocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    Ok((len as u32).to_be_bytes())
}

/// Build the header and blob for a streamed payload
///
/// Compression is attempted only when the receiver advertised it, and
/// only kept when a leading sample compresses well.
pub fn prepare_stream(kind: &str, body: Vec<u8>, caps: RecvCaps) -> Result<(StreamHeader, Vec<u8>)> {
    // receivers bound the inflated size too
    check_stream_len(body.len())?;
    let (data, compression) = if caps.contains(RecvCaps::COMPRESSION) {
        compress_if_worthwhile(body)?
    } else {
        (body, StreamCompression::None)
    };
    check_stream_len(data.len())?;
    let header = StreamHeader {
        kind: kind.to_string(),
        length: data.len() as u64,
        format: StreamFormat {
            compression,
            encoding: StreamEncoding::MsgPack,
        },
    };
    Ok((header, data))
}

fn check_stream_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::InvalidProtocol(format!(
            "stream of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    Ok(())
}

fn compress_if_worthwhile(body: Vec<u8>) -> Result<(Vec<u8>, StreamCompression)> {
    let trial_len = body.len().min(COMPRESS_TRIAL);
    let sample = zlib(&body[..trial_len])?;
    if (sample.len() as f64) >= trial_len as f64 * COMPRESS_MIN_RATIO {
        tracing::trace!(trial_len, compressed = sample.len(), "payload not compressible");
        return Ok((body, StreamCompression::None));
    }

    let uncompressed_len = body.len() as u64;
    let data = if trial_len == body.len() {
        // the whole payload was the sample
        sample
    } else {
        zlib(&body)?
    };
    tracing::trace!(uncompressed_len, compressed = data.len(), "payload compressed");
    Ok((data, StreamCompression::Zlib { uncompressed_len }))
}

fn zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(COMPRESSION_LEVEL),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Turn a received blob back into the message it carries
pub fn decode_stream(header: &StreamHeader, data: &[u8]) -> Message {
    match header.format.encoding {
        StreamEncoding::MsgPack => {}
    }
    match header.format.compression {
        StreamCompression::None => decode_body(data),
        StreamCompression::Zlib { uncompressed_len } => {
            if uncompressed_len > MAX_FRAME_LEN as u64 {
                return Message::Unloadable(format!(
                    "announced size {uncompressed_len} exceeds the {MAX_FRAME_LEN} byte limit"
                ));
            }
            // one byte past the announced size is enough to detect an overrun
            let mut body = Vec::with_capacity(uncompressed_len as usize);
            let mut inflated = ZlibDecoder::new(data).take(uncompressed_len + 1);
            if let Err(e) = inflated.read_to_end(&mut body) {
                return Message::Unloadable(format!("decompression failed: {e}"));
            }
            if body.len() as u64 != uncompressed_len {
                return Message::Unloadable(format!(
                    "decompressed {} bytes, header announced {uncompressed_len}",
                    body.len()
                ));
            }
            decode_body(&body)
        }
    }
}

/// Write one direct frame and flush
pub async fn write_message<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode(msg)?;
    write_raw(writer, &frame).await
}

/// Write a message, streaming it when it is large and the receiver allows it
///
/// Returns the stream header if the payload was streamed.
pub async fn write_payload<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    msg: &Message,
    caps: RecvCaps,
) -> Result<Option<StreamHeader>> {
    let body = encode_body(msg)?;
    if body.len() < STREAM_THRESHOLD || !caps.contains(RecvCaps::STREAM) {
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&frame_prefix(body.len())?);
        frame.extend_from_slice(&body);
        write_raw(writer, &frame).await?;
        return Ok(None);
    }

    let (header, data) = prepare_stream(msg.kind(), body, caps)?;
    write_message(writer, &Message::StreamHeader(header.clone())).await?;
    for block in data.chunks(BLOCK_SIZE) {
        write_raw(writer, block).await?;
    }
    Ok(Some(header))
}

/// Write raw bytes and flush
pub async fn write_raw<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await.map_err(disconnected)?;
    writer.flush().await.map_err(disconnected)
}

/// Read one direct frame
///
/// End-of-stream is reported as [`BrokerError::Disconnected`]; an
/// undecodable body is returned as [`Message::Unloadable`].
pub async fn read_message<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(disconnected)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        tracing::warn!(len, "invalid frame length");
        return Err(BrokerError::InvalidProtocol(format!("frame length {len}")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(disconnected)?;
    Ok(decode_body(&body))
}

/// Read one payload message, which may be preceded by a stream header
pub async fn read_payload<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Message> {
    match read_message(reader).await? {
        Message::StreamHeader(header) => {
            let len = usize::try_from(header.length)
                .ok()
                .filter(|len| *len <= MAX_FRAME_LEN)
                .ok_or_else(|| {
                    BrokerError::InvalidProtocol(format!("stream length {}", header.length))
                })?;
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data).await.map_err(disconnected)?;
            Ok(decode_stream(&header, &data))
        }
        msg => Ok(msg),
    }
}
