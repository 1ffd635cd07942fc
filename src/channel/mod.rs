//! Buffered byte-message channel
//!
//! Each connection's socket is owned by a single channel task. The task runs
//! the codec pipeline (HTTP decoder/encoder, idle timer, optional TLS) and
//! delivers ordered events to the owning peer. Handles are cheap clones that
//! enqueue commands; pipeline mutations always execute on the channel task
//! because they replace the stream or codec mid-flight.

use crate::http::codec::{CodecSide, HttpDecoder, HttpEncoder};
use crate::http::HttpObject;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

/// Outbound bytes queued above this mark the channel unwritable.
pub const HIGH_WATER_MARK: usize = 64 * 1024;
/// Draining below this makes it writable again.
pub const LOW_WATER_MARK: usize = 32 * 1024;

/// Events delivered to the channel's owner, in order.
#[derive(Debug)]
pub enum ChannelEvent {
    Active,
    Read(HttpObject),
    WritabilityChanged(bool),
    Idle,
    Inactive,
    Exception(Error),
}

/// Which end of a TLS handshake to run when installing the TLS codec.
pub enum TlsRole {
    Client {
        connector: TlsConnector,
        server_name: rustls_pki_types::ServerName<'static>,
    },
    Server {
        acceptor: TlsAcceptor,
    },
}

enum Command {
    Write {
        object: HttpObject,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    SetAutoRead(bool),
    StartTunneling,
    ResumeHttp,
    InstallTls {
        role: TlsRole,
        done: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Handle to a channel task.
#[derive(Clone)]
pub struct BufferedChannel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
    writable: Arc<AtomicBool>,
}

impl BufferedChannel {
    /// Take ownership of `stream` and start the channel task.
    pub fn spawn(
        stream: TcpStream,
        side: CodecSide,
        idle_timeout: Option<Duration>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> BufferedChannel {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let writable = Arc::new(AtomicBool::new(true));

        let task = ChannelTask {
            stream: Stream::Plain(Prebuffered::new(stream)),
            decoder: HttpDecoder::new(side),
            encoder: HttpEncoder::new(),
            events,
            pending: pending.clone(),
            writable: writable.clone(),
            auto_read: true,
            idle_timeout,
            idle_deadline: idle_timeout.map(|t| Instant::now() + t),
            read_buf: BytesMut::with_capacity(16 * 1024),
        };
        tokio::spawn(task.run(cmd_rx));

        BufferedChannel {
            cmd_tx,
            pending,
            writable,
        }
    }

    /// Enqueue an object; the returned receiver completes once it is flushed.
    pub fn write(&self, object: HttpObject) -> oneshot::Receiver<Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.pending
            .fetch_add(object.wire_size(), Ordering::Relaxed);
        let _ = self.cmd_tx.send(Command::Write {
            object,
            done: Some(done_tx),
        });
        done_rx
    }

    /// Enqueue an object without waiting for the flush.
    pub fn send(&self, object: HttpObject) {
        self.pending
            .fetch_add(object.wire_size(), Ordering::Relaxed);
        let _ = self.cmd_tx.send(Command::Write { object, done: None });
    }

    /// Gate inbound delivery. While disabled, bytes back up into the kernel
    /// buffers and backpressure propagates to the peer.
    pub fn set_auto_read(&self, enabled: bool) {
        let _ = self.cmd_tx.send(Command::SetAutoRead(enabled));
    }

    /// Drop the HTTP codecs and idle timer; everything becomes raw bytes.
    pub fn start_tunneling(&self) {
        let _ = self.cmd_tx.send(Command::StartTunneling);
    }

    /// Resume HTTP parsing after a refused CONNECT.
    pub fn resume_http(&self) {
        let _ = self.cmd_tx.send(Command::ResumeHttp);
    }

    /// Wrap the socket in TLS; completes when the handshake does.
    pub fn install_tls(&self, role: TlsRole) -> oneshot::Receiver<Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::InstallTls {
            role,
            done: done_tx,
        });
        done_rx
    }

    /// Flush whatever is queued, then close the socket.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }
}

struct ChannelTask {
    stream: Stream,
    decoder: HttpDecoder,
    encoder: HttpEncoder,
    events: mpsc::UnboundedSender<ChannelEvent>,
    pending: Arc<AtomicUsize>,
    writable: Arc<AtomicBool>,
    auto_read: bool,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    read_buf: BytesMut,
}

impl ChannelTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let _ = self.events.send(ChannelEvent::Active);

        loop {
            let idle_at = self
                .idle_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Write { object, done }) => {
                            let size = object.wire_size();
                            let result = self.write_object(object).await;
                            self.pending.fetch_sub(size, Ordering::Relaxed);
                            self.update_writability();
                            let failed = result.is_err();
                            match done {
                                Some(done) => {
                                    let _ = done.send(result);
                                }
                                None => {
                                    if let Err(e) = result {
                                        let _ = self.events.send(ChannelEvent::Exception(e));
                                    }
                                }
                            }
                            if failed {
                                break;
                            }
                        }
                        Some(Command::SetAutoRead(enabled)) => {
                            trace!("auto-read {}", if enabled { "resumed" } else { "stopped" });
                            self.auto_read = enabled;
                        }
                        Some(Command::StartTunneling) => {
                            debug!("Channel switching to tunneling");
                            self.decoder.set_tunneling();
                            self.idle_timeout = None;
                            self.idle_deadline = None;
                            if self.drain_decoder().is_err() {
                                break;
                            }
                        }
                        Some(Command::ResumeHttp) => {
                            self.decoder.set_http();
                            if self.drain_decoder().is_err() {
                                break;
                            }
                        }
                        Some(Command::InstallTls { role, done }) => {
                            let result = self.install_tls(role).await;
                            let failed = result.is_err();
                            let _ = done.send(result);
                            if failed {
                                break;
                            }
                        }
                        Some(Command::Close) | None => break,
                    }
                }

                read = self.stream.read_buf_into(&mut self.read_buf), if self.auto_read => {
                    match read {
                        Ok(0) => {
                            if let Some(object) = self.decoder.on_eof() {
                                let _ = self.events.send(ChannelEvent::Read(object));
                            }
                            let _ = self.events.send(ChannelEvent::Inactive);
                            return;
                        }
                        Ok(_) => {
                            self.touch_idle();
                            if self.drain_decoder().is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = self.events.send(ChannelEvent::Exception(e.into()));
                            let _ = self.events.send(ChannelEvent::Inactive);
                            return;
                        }
                    }
                }

                _ = tokio::time::sleep_until(idle_at), if self.idle_deadline.is_some() => {
                    debug!("Channel idle");
                    let _ = self.events.send(ChannelEvent::Idle);
                    self.touch_idle();
                }
            }
        }

        let _ = self.stream.shutdown().await;
        let _ = self.events.send(ChannelEvent::Inactive);
    }

    async fn write_object(&mut self, object: HttpObject) -> Result<()> {
        // The response decoder frames HEAD/CONNECT responses by what we sent
        if let HttpObject::Request(request) = &object {
            self.decoder.record_outgoing(request);
        }

        let mut out = BytesMut::new();
        self.encoder.encode(&object, &mut out);
        if !out.is_empty() {
            self.stream.write_all(&out).await?;
        }
        self.stream.flush().await?;
        self.touch_idle();
        Ok(())
    }

    fn drain_decoder(&mut self) -> Result<()> {
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(object)) => {
                    let _ = self.events.send(ChannelEvent::Read(object));
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    // Quiesce until the owner reacts to the exception
                    self.auto_read = false;
                    let _ = self.events.send(ChannelEvent::Exception(e));
                    return Err(Error::malformed("decode failed"));
                }
            }
        }
    }

    async fn install_tls(&mut self, role: TlsRole) -> Result<()> {
        // Bytes already read from the socket belong to the handshake
        let leftover = self.read_buf.split().freeze();
        let base = match std::mem::replace(&mut self.stream, Stream::Detached) {
            Stream::Plain(mut plain) => {
                plain.prepend(leftover);
                plain
            }
            other => {
                self.stream = other;
                return Err(Error::tls("TLS codec already installed"));
            }
        };

        match role {
            TlsRole::Client {
                connector,
                server_name,
            } => {
                let tls = connector
                    .connect(server_name, base)
                    .await
                    .map_err(|e| Error::tls(format!("upstream handshake failed: {}", e)))?;
                self.stream = Stream::ClientTls(Box::new(tls));
            }
            TlsRole::Server { acceptor } => {
                let tls = acceptor
                    .accept(base)
                    .await
                    .map_err(|e| Error::tls(format!("client handshake failed: {}", e)))?;
                self.stream = Stream::ServerTls(Box::new(tls));
            }
        }
        debug!("TLS handshake complete");
        Ok(())
    }

    fn touch_idle(&mut self) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(Instant::now() + timeout);
        }
    }

    fn update_writability(&self) {
        let pending = self.pending.load(Ordering::Relaxed);
        let was_writable = self.writable.load(Ordering::Relaxed);
        if was_writable && pending > HIGH_WATER_MARK {
            self.writable.store(false, Ordering::Relaxed);
            let _ = self.events.send(ChannelEvent::WritabilityChanged(false));
        } else if !was_writable && pending < LOW_WATER_MARK {
            self.writable.store(true, Ordering::Relaxed);
            let _ = self.events.send(ChannelEvent::WritabilityChanged(true));
        }
    }
}

/// Socket in one of its codec states. TLS is installed at most once.
enum Stream {
    Plain(Prebuffered<TcpStream>),
    ClientTls(Box<tokio_rustls::client::TlsStream<Prebuffered<TcpStream>>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<Prebuffered<TcpStream>>>),
    Detached,
}

impl Stream {
    async fn read_buf_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read_buf(buf).await,
            Stream::ClientTls(s) => s.read_buf(buf).await,
            Stream::ServerTls(s) => s.read_buf(buf).await,
            Stream::Detached => Err(io::Error::new(io::ErrorKind::NotConnected, "detached")),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.write_all(data).await,
            Stream::ClientTls(s) => s.write_all(data).await,
            Stream::ServerTls(s) => s.write_all(data).await,
            Stream::Detached => Err(io::Error::new(io::ErrorKind::NotConnected, "detached")),
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush().await,
            Stream::ClientTls(s) => s.flush().await,
            Stream::ServerTls(s) => s.flush().await,
            Stream::Detached => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.shutdown().await,
            Stream::ClientTls(s) => s.shutdown().await,
            Stream::ServerTls(s) => s.shutdown().await,
            Stream::Detached => Ok(()),
        }
    }
}

/// Wraps a stream so bytes consumed before a codec change can be replayed
/// into whatever reads next (e.g. a TLS handshake).
pub struct Prebuffered<S> {
    inner: S,
    buffer: Bytes,
}

impl<S> Prebuffered<S> {
    pub fn new(inner: S) -> Self {
        Prebuffered {
            inner,
            buffer: Bytes::new(),
        }
    }

    pub fn prepend(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        if self.buffer.is_empty() {
            self.buffer = bytes;
        } else {
            let mut combined = BytesMut::with_capacity(self.buffer.len() + bytes.len());
            combined.extend_from_slice(&self.buffer);
            combined.extend_from_slice(&bytes);
            self.buffer = combined.freeze();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(buf.remaining());
            buf.put_slice(&self.buffer[..n]);
            self.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RequestHead, Version};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_write_completes_after_flush() {
        let (client, mut server) = socket_pair().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let channel = BufferedChannel::spawn(client, CodecSide::Requests, None, events_tx);

        let mut req = RequestHead::new("GET", "/", Version::Http11);
        req.headers.set("Host", "example.org");
        channel
            .write(HttpObject::Request(req))
            .await
            .unwrap()
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org"));
    }

    #[tokio::test]
    async fn test_inbound_objects_delivered_in_order() {
        let (client, server) = socket_pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _channel = BufferedChannel::spawn(server, CodecSide::Requests, None, events_tx);

        let mut client = client;
        client
            .write_all(b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Active
        ));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Read(HttpObject::Request(_))
        ));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Read(HttpObject::Chunk(_))
        ));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Read(HttpObject::LastChunk)
        ));
    }

    #[tokio::test]
    async fn test_auto_read_gates_delivery() {
        let (client, server) = socket_pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let channel = BufferedChannel::spawn(server, CodecSide::Requests, None, events_tx);
        channel.set_auto_read(false);

        let mut client = client;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: e\r\n\r\n")
            .await
            .unwrap();

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Active
        ));
        // Nothing is delivered while gated
        let gated =
            tokio::time::timeout(Duration::from_millis(100), events_rx.recv()).await;
        assert!(gated.is_err());

        channel.set_auto_read(true);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Read(HttpObject::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_event_fires() {
        let (_client, server) = socket_pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _channel = BufferedChannel::spawn(
            server,
            CodecSide::Requests,
            Some(Duration::from_millis(50)),
            events_tx,
        );

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Active
        ));
        assert!(matches!(events_rx.recv().await.unwrap(), ChannelEvent::Idle));
    }

    #[tokio::test]
    async fn test_close_emits_inactive() {
        let (_client, server) = socket_pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let channel = BufferedChannel::spawn(server, CodecSide::Requests, None, events_tx);
        channel.close();

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Active
        ));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::Inactive
        ));
    }

    #[tokio::test]
    async fn test_prebuffered_replays_bytes() {
        let (client, server) = socket_pair().await;
        drop(client);
        let mut pre = Prebuffered::new(server);
        pre.prepend(Bytes::from_static(b"hello"));

        let mut buf = [0u8; 5];
        pre.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
