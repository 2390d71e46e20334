//! Byte-duplex channels with independent send and receive locks
//!
//! A [`Channel`] wraps a reader and a writer, each behind its own async
//! mutex. Whole messages are written while holding the send lock, so
//! messages in one direction are never interleaved. Callers running
//! multi-step exchanges take a [`SendGuard`] or [`RecvGuard`] and keep it
//! for the whole exchange.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_net::TcpStream;
use blocking::Unblock;
use futures_lite::future;
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use smol::channel::{Receiver, Sender};
use smol::lock::{Mutex, MutexGuard};
use smol::process::Child;

use crate::error::{BrokerError, Result};
use crate::wire::codec::{self, BLOCK_SIZE};
use crate::wire::{Message, RecvCaps, StreamHeader};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What to tear down when the channel is closed
enum Transport {
    Tcp(TcpStream),
    Child(std::sync::Mutex<Child>),
    Streams,
}

/// A byte-duplex endpoint
///
/// Guards borrow the channel, so a channel can never be freed while one of
/// its locks is held. [`Channel::close`] shuts the transport down and
/// signals every task blocked on I/O inside a guard, which then fails and
/// releases it. Plain streams such as stdio have nothing to shut down and
/// rely on the signal alone.
pub struct Channel {
    id: ChannelId,
    peer: String,
    reader: Mutex<BufReader<BoxReader>>,
    writer: Mutex<BoxWriter>,
    closed: AtomicBool,
    // never carries a message; closing the sender wakes every waiter
    close_tx: Sender<()>,
    close_rx: Receiver<()>,
    transport: Transport,
}

impl Channel {
    /// Create a channel over an arbitrary reader/writer pair
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Self::with_transport(Box::new(reader), Box::new(writer), peer.into(), Transport::Streams)
    }

    /// Create a channel over a connected TCP stream
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::with_transport(
            Box::new(stream.clone()),
            Box::new(stream.clone()),
            peer,
            Transport::Tcp(stream),
        )
    }

    /// Create a channel over a child process's stdout (receive) and stdin (send)
    ///
    /// The child is killed when the channel is closed.
    pub fn from_child(mut child: Child, description: impl Into<String>) -> Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            BrokerError::InvalidProtocol("child process has no piped stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BrokerError::InvalidProtocol("child process has no piped stdout".to_string())
        })?;
        Ok(Self::with_transport(
            Box::new(stdout),
            Box::new(stdin),
            description.into(),
            Transport::Child(std::sync::Mutex::new(child)),
        ))
    }

    /// Create a channel over this process's own stdin and stdout
    pub fn stdio() -> Self {
        Self::new(
            Unblock::new(std::io::stdin()),
            Unblock::new(std::io::stdout()),
            "stdio",
        )
    }

    fn with_transport(
        reader: BoxReader,
        writer: BoxWriter,
        peer: String,
        transport: Transport,
    ) -> Self {
        let (close_tx, close_rx) = smol::channel::bounded(1);
        Self {
            id: ChannelId::next(),
            peer,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_tx,
            close_rx,
            transport,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Description of the other end, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `io`, failing with `Disconnected` if the channel closes first
    async fn unless_closed<T>(&self, io: impl Future<Output = Result<T>>) -> Result<T> {
        let closed = async {
            let _ = self.close_rx.recv().await;
            Err(BrokerError::Disconnected)
        };
        future::or(io, closed).await
    }

    /// Acquire the send lock
    pub async fn lock_send(&self) -> SendGuard<'_> {
        SendGuard {
            channel: self,
            writer: self.writer.lock().await,
        }
    }

    /// Acquire the receive lock
    pub async fn lock_recv(&self) -> RecvGuard<'_> {
        RecvGuard {
            channel: self,
            reader: self.reader.lock().await,
        }
    }

    /// Send one message as a direct frame
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.lock_send().await.send(msg).await
    }

    /// Send one message, streaming it if large and allowed by `caps`
    pub async fn send_payload(&self, msg: &Message, caps: RecvCaps) -> Result<Option<StreamHeader>> {
        self.lock_send().await.send_payload(msg, caps).await
    }

    /// Receive one message
    pub async fn receive(&self) -> Result<Message> {
        self.lock_recv().await.receive().await
    }

    /// Receive one message, reading the blob if a stream header arrives
    pub async fn receive_payload(&self) -> Result<Message> {
        self.lock_recv().await.receive_payload().await
    }

    /// Relay `len` raw bytes from `src` to `dst`
    ///
    /// Takes the receive lock on `src` before the send lock on `dst`. With
    /// every forward using this order, two forwards running in opposite
    /// directions over the same pair of channels cannot deadlock.
    pub async fn forward(src: &Channel, dst: &Channel, len: u64) -> ForwardReport {
        let mut src = src.lock_recv().await;
        let mut dst = dst.lock_send().await;
        forward_locked(&mut src, &mut dst, len).await
    }

    /// Close the channel and tear down its transport
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(channel = %self.id, peer = %self.peer, "closing channel");
        match &self.transport {
            Transport::Tcp(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            Transport::Child(child) => {
                if let Ok(mut child) = child.lock() {
                    let _ = child.kill();
                }
            }
            Transport::Streams => {}
        }
        self.close_tx.close();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Held send lock of a channel
pub struct SendGuard<'a> {
    channel: &'a Channel,
    writer: MutexGuard<'a, BoxWriter>,
}

impl SendGuard<'_> {
    pub fn channel(&self) -> &Channel {
        self.channel
    }

    fn ensure_open(&self) -> Result<()> {
        if self.channel.is_closed() {
            Err(BrokerError::Disconnected)
        } else {
            Ok(())
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.ensure_open()?;
        let channel = self.channel;
        channel
            .unless_closed(codec::write_message(&mut *self.writer, msg))
            .await
    }

    pub async fn send_payload(&mut self, msg: &Message, caps: RecvCaps) -> Result<Option<StreamHeader>> {
        self.ensure_open()?;
        let channel = self.channel;
        channel
            .unless_closed(codec::write_payload(&mut *self.writer, msg, caps))
            .await
    }

    /// Write raw bytes, used for stream bodies and frame prefixes
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let channel = self.channel;
        channel
            .unless_closed(codec::write_raw(&mut *self.writer, bytes))
            .await
    }
}

/// Held receive lock of a channel
pub struct RecvGuard<'a> {
    channel: &'a Channel,
    reader: MutexGuard<'a, BufReader<BoxReader>>,
}

impl RecvGuard<'_> {
    pub fn channel(&self) -> &Channel {
        self.channel
    }

    pub async fn receive(&mut self) -> Result<Message> {
        let channel = self.channel;
        channel
            .unless_closed(codec::read_message(&mut *self.reader))
            .await
    }

    pub async fn receive_payload(&mut self) -> Result<Message> {
        let channel = self.channel;
        channel
            .unless_closed(codec::read_payload(&mut *self.reader))
            .await
    }

    /// Read up to `buf.len()` raw bytes; zero means end-of-stream
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let channel = self.channel;
        let read = async {
            self.reader
                .read(buf)
                .await
                .map_err(crate::error::disconnected)
        };
        channel.unless_closed(read).await
    }
}

/// Byte counts of a forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardReport {
    /// Bytes written to the destination
    pub forwarded: u64,
    /// Bytes read from the source
    pub drained: u64,
    /// Bytes announced
    pub expected: u64,
}

impl ForwardReport {
    pub fn is_complete(&self) -> bool {
        self.forwarded == self.expected
    }

    /// The source ran dry before the announced length
    pub fn source_lost(&self) -> bool {
        self.drained < self.expected
    }

    /// Writing to the destination failed at some point
    pub fn destination_failed(&self) -> bool {
        self.forwarded < self.drained
    }
}

/// Relay `len` bytes between two held guards
///
/// Once writes to the destination fail, the source is still drained to the
/// announced length so that its framing stays intact for the next reader.
pub async fn forward_locked(src: &mut RecvGuard<'_>, dst: &mut SendGuard<'_>, len: u64) -> ForwardReport {
    let mut report = ForwardReport {
        forwarded: 0,
        drained: 0,
        expected: len,
    };
    let mut buf = vec![0u8; BLOCK_SIZE.min(len as usize)];
    let mut destination_ok = true;

    while report.drained < len {
        let want = BLOCK_SIZE.min((len - report.drained) as usize);
        let read = match src.read_raw(&mut buf[..want]).await {
            Ok(0) | Err(_) => {
                tracing::debug!(
                    source = %src.channel().id(),
                    drained = report.drained,
                    expected = len,
                    "forward source ran dry"
                );
                break;
            }
            Ok(n) => n,
        };
        report.drained += read as u64;

        if destination_ok {
            match dst.write_raw(&buf[..read]).await {
                Ok(()) => report.forwarded += read as u64,
                Err(_) => {
                    tracing::debug!(
                        destination = %dst.channel().id(),
                        forwarded = report.forwarded,
                        "forward destination failed, draining source"
                    );
                    destination_ok = false;
                }
            }
        }
    }
    report
}

/// Two connected channels over a loopback TCP socket
#[cfg(test)]
pub(crate) async fn loopback_pair() -> (Channel, Channel) {
    let listener = async_net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (Channel::from_tcp(client), Channel::from_tcp(server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::wire::ExecuteResult;
    use futures_lite::io::Cursor;

    #[tokio::test]
    async fn test_send_receive_over_tcp() {
        let (a, b) = loopback_pair().await;
        let msg = Message::AuthResult { success: true };
        a.send(&msg).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), msg);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_sends_and_peer_sees_eof() {
        let (a, b) = loopback_pair().await;
        a.close();
        assert!(a.is_closed());
        assert!(matches!(
            a.send(&Message::AuthResult { success: true }).await,
            Err(BrokerError::Disconnected)
        ));
        assert!(matches!(b.receive().await, Err(BrokerError::Disconnected)));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_stream_reader() {
        let listener = async_net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        // the other end stays open and silent
        let (_silent, _) = listener.accept().await.unwrap();

        // a plain stream pair has no transport for close to shut down
        let channel = std::sync::Arc::new(Channel::new(stream.clone(), stream, "pipe"));
        let reader = {
            let channel = channel.clone();
            smol::spawn(async move { channel.receive().await })
        };
        async_io::Timer::after(std::time::Duration::from_millis(20)).await;
        channel.close();
        assert!(matches!(reader.await, Err(BrokerError::Disconnected)));
        assert!(matches!(
            channel.send(&Message::AuthResult { success: true }).await,
            Err(BrokerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_forward_relays_stream_body() {
        let msg = Message::ExecuteResult(ExecuteResult::value(Value::Str("x".repeat(300_000))));
        let mut upstream = Vec::new();
        let header = codec::write_payload(&mut upstream, &msg, RecvCaps::ALL)
            .await
            .unwrap()
            .unwrap();
        // drop the header frame, keep only the blob
        let header_frame = codec::encode(&Message::StreamHeader(header.clone())).unwrap();
        let blob = upstream[header_frame.len()..].to_vec();

        let src = Channel::new(Cursor::new(blob), Vec::new(), "src");
        let (dst_tx, dst_rx) = loopback_pair().await;
        let report = Channel::forward(&src, &dst_tx, header.length).await;
        assert!(report.is_complete());
        assert_eq!(report.forwarded, header.length);

        let mut data = vec![0u8; header.length as usize];
        let mut guard = dst_rx.lock_recv().await;
        let mut read = 0;
        while read < data.len() {
            read += guard.read_raw(&mut data[read..]).await.unwrap();
        }
        assert_eq!(codec::decode_stream(&header, &data), msg);
    }

    #[tokio::test]
    async fn test_forward_reports_short_source() {
        let src = Channel::new(Cursor::new(vec![7u8; 1000]), Vec::new(), "src");
        let dst = Channel::new(Cursor::new(Vec::new()), Vec::new(), "dst");
        let report = Channel::forward(&src, &dst, 5000).await;
        assert!(report.source_lost());
        assert!(!report.is_complete());
        assert_eq!(report.drained, 1000);
        assert!(report.forwarded <= report.expected);
    }

    #[tokio::test]
    async fn test_forward_keeps_draining_after_destination_fails() {
        let (dst_tx, dst_rx) = loopback_pair().await;
        dst_tx.close();
        drop(dst_rx);

        // the source holds the blob followed by the next frame
        let next = Message::AuthResult { success: true };
        let mut data = vec![1u8; 200_000];
        data.extend_from_slice(&codec::encode(&next).unwrap());
        let src = Channel::new(Cursor::new(data), Vec::new(), "src");

        let report = Channel::forward(&src, &dst_tx, 200_000).await;
        assert!(report.destination_failed());
        assert_eq!(report.drained, 200_000);
        assert_eq!(report.forwarded, 0);
        // framing on the source is intact
        assert_eq!(src.receive().await.unwrap(), next);
    }

    #[tokio::test]
    async fn test_symmetric_forwards_do_not_deadlock() {
        let (a_end, a_peer) = loopback_pair().await;
        let (b_end, b_peer) = loopback_pair().await;
        let a_end = std::sync::Arc::new(a_end);
        let b_end = std::sync::Arc::new(b_end);

        // feed 100 kB into each side and drain what arrives on the peers
        let payload = vec![3u8; 100_000];
        for peer in [&a_peer, &b_peer] {
            let mut guard = peer.lock_send().await;
            guard.write_raw(&payload).await.unwrap();
        }

        let drain = |peer: Channel| {
            smol::spawn(async move {
                let mut guard = peer.lock_recv().await;
                let mut buf = vec![0u8; 100_000];
                let mut read = 0;
                while read < buf.len() {
                    read += guard.read_raw(&mut buf[read..]).await.unwrap();
                }
                read
            })
        };
        let a_drain = drain(a_peer);
        let b_drain = drain(b_peer);

        let forward_ab = {
            let (a, b) = (a_end.clone(), b_end.clone());
            smol::spawn(async move { Channel::forward(&a, &b, 100_000).await })
        };
        let forward_ba = {
            let (a, b) = (a_end.clone(), b_end.clone());
            smol::spawn(async move { Channel::forward(&b, &a, 100_000).await })
        };

        assert!(forward_ab.await.is_complete());
        assert!(forward_ba.await.is_complete());
        assert_eq!(a_drain.await, 100_000);
        assert_eq!(b_drain.await, 100_000);
    }
}
