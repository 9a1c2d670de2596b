use std::io;
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Stream wrapper that can hand bytes back to the reader. Used to replay a
/// parsed ClientHello into the TLS acceptor and to carry residual bytes into
/// a tunnel after a downgrade.
#[derive(Debug)]
pub struct ReplayStream<S> {
    stream: S,
    buffer: Bytes,
}

impl<S> ReplayStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Bytes::new(),
        }
    }

    /// Queue bytes to be served before anything further from the stream.
    pub fn unread(&mut self, bytes: Bytes) {
        if self.buffer.is_empty() {
            self.buffer = bytes;
        } else {
            let mut joined = Vec::with_capacity(bytes.len() + self.buffer.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.buffer);
            self.buffer = Bytes::from(joined);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let to_copy = self.buffer.len().min(dst.remaining());
            dst.put_slice(&self.buffer[..to_copy]);
            let this = self.get_mut();
            this.buffer = this.buffer.slice(to_copy..);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.stream).poll_read(cx, dst)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// The concrete stream behind one endpoint. Once TLS is established all I/O
/// traverses the TLS stream; the plain socket remains the close handle.
#[derive(Debug)]
pub enum Transport {
    Plain(ReplayStream<TcpStream>),
    /// Client-facing side after the downstream handshake.
    ClientTls(Box<tokio_rustls::server::TlsStream<ReplayStream<TcpStream>>>),
    /// Upstream side after the proxy's own handshake.
    UpstreamTls(Box<tokio_rustls::client::TlsStream<ReplayStream<TcpStream>>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, dst),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, dst),
            Transport::UpstreamTls(s) => Pin::new(s.as_mut()).poll_read(cx, dst),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::UpstreamTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::UpstreamTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::UpstreamTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
