//! Wire protocol between brokers and clients
//!
//! Messages are MessagePack-encoded and carried in length-prefixed frames.
//! Replies that are large may be streamed as a [`StreamHeader`] followed by
//! a raw blob, optionally zlib-compressed, when the receiver advertised the
//! matching [`RecvCaps`].

pub mod codec;
mod message;

pub use codec::{
    BLOCK_SIZE, COMPRESS_MIN_RATIO, COMPRESS_TRIAL, MAX_FRAME_LEN, STREAM_THRESHOLD, decode_body,
    decode_stream, encode, encode_body,
};
pub use message::{
    AsyncHandle, ExecuteRequest, ExecuteResult, Message, RecvCaps, ServerCommand,
    StreamCompression, StreamEncoding, StreamFormat, StreamHeader,
};
