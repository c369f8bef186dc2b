//! Buffered byte channel over a TCP or TLS stream.
//!
//! One [`Channel`] backs each connection leg. It owns the socket, an encoded
//! outbound buffer with high/low watermarks for writability signaling, the
//! HTTP framing decoder, and the idle timer. The owning task drives it with
//! [`Channel::next_event`]; reads, flushes and the timer are all polled from
//! that single future so the channel never needs a lock.

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ProxyError;
use crate::http1::{Decoder, Encoder, Frame, HttpMode};

/// Outbound buffer size above which the channel reports unwritable.
pub const HIGH_WATER_MARK: usize = 64 * 1024;
/// Once unwritable, the buffer must drain below this before the channel
/// reports writable again.
pub const LOW_WATER_MARK: usize = 32 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// What the channel surfaced to its owning task.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A decoded inbound frame.
    Read(Frame),
    /// Crossed a watermark; `true` means writes are cheap again.
    WritabilityChanged(bool),
    /// The idle timer fired.
    Idle,
    /// The peer closed; no more reads will ever be produced.
    Inactive,
}

pub struct Channel {
    io: Box<dyn Io>,
    read_buf: BytesMut,
    out: BytesMut,
    decoder: Decoder,
    encoder: Encoder,
    auto_read: bool,
    writable: bool,
    eof: bool,
    inactive_delivered: bool,
    idle_sleep: Option<Pin<Box<Sleep>>>,
    idle_timeout: Option<Duration>,
    unreported_read_bytes: usize,
}

impl Channel {
    pub fn new(io: impl Io + 'static, mode: HttpMode, idle_timeout: Option<Duration>) -> Channel {
        Channel {
            io: Box::new(io),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            out: BytesMut::new(),
            decoder: Decoder::new(mode),
            encoder: Encoder::new(),
            auto_read: true,
            writable: true,
            eof: false,
            inactive_delivered: false,
            idle_sleep: idle_timeout.map(|t| Box::pin(sleep(t))),
            idle_timeout,
            unreported_read_bytes: 0,
        }
    }

    /// Encode and buffer a frame. Returns the channel's writability after
    /// the enqueue so callers can react to saturation immediately.
    pub fn write(&mut self, frame: &Frame) -> bool {
        self.encoder.encode(frame, &mut self.out);
        if self.writable && self.out.len() > HIGH_WATER_MARK {
            self.writable = false;
        }
        self.touch_idle();
        self.writable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_auto_read(&mut self, on: bool) {
        self.auto_read = on;
    }

    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    /// Raw inbound byte count since the last call; feeds the activity
    /// trackers.
    pub fn take_read_bytes(&mut self) -> usize {
        std::mem::take(&mut self.unreported_read_bytes)
    }

    /// Strip HTTP framing in both directions; everything from here on is
    /// opaque bytes.
    pub fn start_tunneling(&mut self) {
        self.decoder.start_tunneling();
        self.encoder.start_tunneling();
    }

    pub fn is_tunneling(&self) -> bool {
        self.decoder.is_tunneling()
    }

    /// The response to the in-flight request will have no body (HEAD).
    pub fn expect_headless_response(&mut self) {
        self.decoder.expect_headless_response();
    }

    /// Wait for the next channel event. Cancel-safe: dropping the future
    /// between events loses nothing.
    pub async fn next_event(&mut self) -> Result<ChannelEvent, ProxyError> {
        loop {
            if self.auto_read {
                if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                    return Ok(ChannelEvent::Read(frame));
                }
                if self.eof {
                    if let Some(frame) = self.decoder.finish() {
                        return Ok(ChannelEvent::Read(frame));
                    }
                    if !self.inactive_delivered {
                        self.inactive_delivered = true;
                        return Ok(ChannelEvent::Inactive);
                    }
                }
            }
            if let Some(event) = poll_fn(|cx| self.poll_io(cx)).await? {
                return Ok(event);
            }
            // New inbound bytes or EOF; loop to decode.
        }
    }

    /// Drive pending writes, then reads, then the idle timer. `Ok(None)`
    /// means inbound bytes (or EOF) arrived and the caller should decode.
    fn poll_io(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<ChannelEvent>, ProxyError>> {
        while !self.out.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.out) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(ProxyError::PeerReset)),
                Poll::Ready(Ok(n)) => {
                    self.out.advance(n);
                    self.touch_idle();
                    if !self.writable && self.out.len() <= LOW_WATER_MARK {
                        self.writable = true;
                        return Poll::Ready(Ok(Some(ChannelEvent::WritabilityChanged(true))));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                Poll::Pending => break,
            }
        }
        if self.out.is_empty() {
            // Nothing buffered; push what the kernel has.
            let _ = Pin::new(&mut self.io).poll_flush(cx);
        }

        if self.auto_read && !self.eof {
            let mut scratch = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut self.io).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        self.eof = true;
                    } else {
                        self.read_buf.extend_from_slice(filled);
                        self.unreported_read_bytes += filled.len();
                        self.touch_idle();
                    }
                    return Poll::Ready(Ok(None));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                Poll::Pending => {}
            }
        }

        if let Some(idle) = &mut self.idle_sleep {
            if idle.as_mut().poll(cx).is_ready() {
                self.touch_idle();
                return Poll::Ready(Ok(Some(ChannelEvent::Idle)));
            }
        }

        Poll::Pending
    }

    /// Flush the whole outbound buffer. This is the reliable completion
    /// point the close decisions hang off.
    pub async fn flush(&mut self) -> Result<(), ProxyError> {
        poll_fn(|cx| {
            while !self.out.is_empty() {
                match Pin::new(&mut self.io).poll_write(cx, &self.out) {
                    Poll::Ready(Ok(0)) => return Poll::Ready(Err(ProxyError::PeerReset)),
                    Poll::Ready(Ok(n)) => self.out.advance(n),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => return Poll::Pending,
                }
            }
            Pin::new(&mut self.io)
                .poll_flush(cx)
                .map_err(ProxyError::from)
        })
        .await?;
        self.writable = true;
        Ok(())
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> Result<(), ProxyError> {
        self.flush().await?;
        poll_fn(|cx| Pin::new(&mut self.io).poll_shutdown(cx))
            .await
            .map_err(ProxyError::from)
    }

    /// Terminate client TLS in place (MITM leg). Bytes already buffered
    /// ahead of the handshake, such as a ClientHello that rode in behind
    /// the CONNECT head, are replayed into it.
    pub async fn accept_tls(&mut self, acceptor: &TlsAcceptor) -> Result<(), io::Error> {
        let io = self.take_io();
        let tls = acceptor.accept(io).await?;
        self.io = Box::new(tls);
        self.reset_after_tls();
        Ok(())
    }

    /// Originate TLS on the upstream leg.
    pub async fn connect_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<(), io::Error> {
        let io = self.take_io();
        let tls = connector.connect(server_name, io).await?;
        self.io = Box::new(tls);
        self.reset_after_tls();
        Ok(())
    }

    fn take_io(&mut self) -> Box<dyn Io> {
        let inner = std::mem::replace(&mut self.io, Box::new(ClosedIo));
        if self.read_buf.is_empty() {
            inner
        } else {
            Box::new(PrefixedIo {
                prefix: self.read_buf.split(),
                inner,
            })
        }
    }

    fn reset_after_tls(&mut self) {
        self.eof = false;
        self.inactive_delivered = false;
        self.touch_idle();
    }

    fn touch_idle(&mut self) {
        if let (Some(idle), Some(timeout)) = (&mut self.idle_sleep, self.idle_timeout) {
            idle.as_mut().reset(Instant::now() + timeout);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("out_bytes", &self.out.len())
            .field("auto_read", &self.auto_read)
            .field("writable", &self.writable)
            .field("eof", &self.eof)
            .finish()
    }
}

/// Placeholder io installed while a TLS handshake owns the real stream.
struct ClosedIo;

impl AsyncRead for ClosedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ClosedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Serves buffered bytes before falling through to the real stream. Used to
/// hand a TLS handshake the bytes that arrived before the codec switch.
struct PrefixedIo {
    prefix: BytesMut,
    inner: Box<dyn Io>,
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
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
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn decodes_request_frames() {
        let (near, mut far) = duplex(4096);
        let mut channel = Channel::new(near, HttpMode::Request, None);
        far.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        let event = channel.next_event().await.unwrap();
        match event {
            ChannelEvent::Read(Frame::Request { head, last }) => {
                assert_eq!(head.method, "GET");
                assert!(last);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(channel.take_read_bytes(), 27);
    }

    #[tokio::test]
    async fn write_crosses_high_water_mark() {
        let (near, _far) = duplex(16);
        let mut channel = Channel::new(near, HttpMode::Request, None);
        let big = Bytes::from(vec![0u8; HIGH_WATER_MARK + 1]);
        let writable = channel.write(&Frame::Raw(big));
        assert!(!writable);
        assert!(!channel.is_writable());
    }

    #[tokio::test]
    async fn drain_restores_writability() {
        let (near, mut far) = duplex(1024 * 1024);
        let mut channel = Channel::new(near, HttpMode::Request, None);
        assert!(!channel.write(&Frame::Raw(Bytes::from(vec![1u8; HIGH_WATER_MARK + 1]))));
        // Peer consumes; the flush inside next_event drains below low water.
        let reader = tokio::spawn(async move {
            let mut sink = Vec::new();
            far.read_to_end(&mut sink).await.unwrap();
        });
        let event = channel.next_event().await.unwrap();
        assert!(matches!(event, ChannelEvent::WritabilityChanged(true)));
        drop(channel);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn auto_read_gates_inbound() {
        let (near, mut far) = duplex(4096);
        let mut channel = Channel::new(near, HttpMode::Request, None);
        channel.set_auto_read(false);
        far.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        tokio::select! {
            _ = channel.next_event() => panic!("read while auto-read disabled"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        channel.set_auto_read(true);
        let event = channel.next_event().await.unwrap();
        assert!(matches!(event, ChannelEvent::Read(Frame::Request { .. })));
    }

    #[tokio::test]
    async fn idle_timer_fires() {
        let (near, _far) = duplex(64);
        let mut channel = Channel::new(near, HttpMode::Request, Some(Duration::from_millis(20)));
        let event = channel.next_event().await.unwrap();
        assert!(matches!(event, ChannelEvent::Idle));
    }

    #[tokio::test]
    async fn eof_yields_inactive_once() {
        let (near, far) = duplex(64);
        let mut channel = Channel::new(near, HttpMode::Request, None);
        drop(far);
        assert!(matches!(
            channel.next_event().await.unwrap(),
            ChannelEvent::Inactive
        ));
    }

    #[tokio::test]
    async fn tunneling_passes_raw_bytes() {
        let (near, mut far) = duplex(4096);
        let mut channel = Channel::new(near, HttpMode::Request, None);
        channel.start_tunneling();
        far.write_all(b"\x16\x03\x01junk").await.unwrap();
        match channel.next_event().await.unwrap() {
            ChannelEvent::Read(Frame::Raw(data)) => assert_eq!(&data[..], b"\x16\x03\x01junk"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
