use std::{io, net::SocketAddr, sync::Mutex, time::Duration};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rustls::pki_types::{CertificateDer, ServerName};
use snowflake::SnowflakeIdGenerator;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::trace;

use crate::{
    buffer::find,
    error::{ErrorState, ProxyError},
    stream::{ReplayStream, Transport},
};

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    #[default]
    Regular,
    Tunnel,
    NoTimeout,
}

/// Deadline durations for the two timed I/O modes.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub regular: Duration,
    pub tunnel: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            regular: Duration::from_secs(120),
            tunnel: Duration::from_secs(30),
        }
    }
}

fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "operation timed out")
}

async fn with_deadline<T>(
    mode: IoMode,
    timeouts: Timeouts,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, ErrorState> {
    let duration = match mode {
        IoMode::Regular => timeouts.regular,
        IoMode::Tunnel => timeouts.tunnel,
        IoMode::NoTimeout => {
            return fut.await.map_err(ErrorState::from);
        }
    };
    match timeout(duration, fut).await {
        Ok(res) => res.map_err(ErrorState::from),
        Err(_) => Err(ErrorState::from(timeout_error())),
    }
}

/// One TCP or TLS stream plus its staging buffers and timeout discipline.
#[derive(Debug)]
pub struct Endpoint {
    transport: Transport,
    pub input: BytesMut,
    pub output: BytesMut,
    mode: IoMode,
    timeouts: Timeouts,
    secured: bool,
    alpn: Option<String>,
    sni: Option<String>,
    peer_cert: Option<CertificateDer<'static>>,
    peer_chain: Vec<CertificateDer<'static>>,
}

impl Endpoint {
    pub fn from_tcp(stream: TcpStream, timeouts: Timeouts) -> Self {
        Endpoint {
            transport: Transport::Plain(ReplayStream::new(stream)),
            input: BytesMut::new(),
            output: BytesMut::new(),
            mode: IoMode::Regular,
            timeouts,
            secured: false,
            alpn: None,
            sni: None,
            peer_cert: None,
            peer_chain: Vec::new(),
        }
    }

    pub async fn connect(host: &str, port: u16, timeouts: Timeouts) -> Result<Self, ErrorState> {
        let stream = with_deadline(
            IoMode::Regular,
            timeouts,
            TcpStream::connect((host, port)),
        )
        .await?;
        Ok(Endpoint::from_tcp(stream, timeouts))
    }

    pub fn set_mode(&mut self, mode: IoMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn secured(&self) -> bool {
        self.secured
    }

    pub fn alpn(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    pub fn peer_cert(&self) -> Option<&CertificateDer<'static>> {
        self.peer_cert.as_ref()
    }

    pub fn peer_chain(&self) -> &[CertificateDer<'static>] {
        &self.peer_chain
    }

    /// Read once into the input buffer. Ok(0) means the peer closed.
    pub async fn read_some(&mut self) -> Result<usize, ErrorState> {
        self.input.reserve(DEFAULT_BUFFER_SIZE);
        let mode = self.mode;
        let timeouts = self.timeouts;
        with_deadline(mode, timeouts, self.transport.read_buf(&mut self.input)).await
    }

    /// Read until `delim` is present in the input buffer; returns the index
    /// one past the delimiter. An end-of-stream before the delimiter
    /// surfaces as UnexpectedEof with whatever was buffered left in place.
    pub async fn read_until(&mut self, delim: &[u8]) -> Result<usize, ErrorState> {
        let mut search_from = 0usize;
        loop {
            if let Some(pos) = find(&self.input[search_from..], delim) {
                return Ok(search_from + pos + delim.len());
            }
            search_from = self.input.len().saturating_sub(delim.len().saturating_sub(1));
            let read = self.read_some().await?;
            if read == 0 {
                return Err(ErrorState::from(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before delimiter",
                )));
            }
        }
    }

    /// Non-blocking poll of the stream; zero bytes available is success.
    pub fn read_available(&mut self) -> Result<usize, ErrorState> {
        use std::pin::Pin;
        use std::task::{Context, Poll};

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut scratch = [0u8; DEFAULT_BUFFER_SIZE];
        let mut buf = tokio::io::ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.transport).poll_read(&mut cx, &mut buf) {
            Poll::Pending => Ok(0),
            Poll::Ready(Err(err)) => Err(ErrorState::from(err)),
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                self.input.extend_from_slice(filled);
                Ok(filled.len())
            }
        }
    }

    /// Drain the output buffer under the mode's deadline.
    pub async fn write_all(&mut self) -> Result<(), ErrorState> {
        let mode = self.mode;
        let timeouts = self.timeouts;
        let transport = &mut self.transport;
        let output = &mut self.output;
        with_deadline(mode, timeouts, async move {
            while !output.is_empty() {
                transport.write_buf(output).await?;
            }
            transport.flush().await
        })
        .await
    }

    /// Drain the output buffer without arming a deadline. Required when a
    /// concurrent read on the same flow already owns the timer.
    pub async fn write_untimed(&mut self) -> Result<(), ErrorState> {
        while !self.output.is_empty() {
            self.transport.write_buf(&mut self.output).await?;
        }
        self.transport.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(err) = self.transport.shutdown().await {
            trace!("shutdown error: {err}");
        }
    }

    /// Perform the downstream (client-facing) handshake, consuming the plain
    /// endpoint. Any bytes still in the input buffer are replayed into the
    /// acceptor first. On failure the connection is unusable and dropped.
    pub async fn accept_tls(mut self, acceptor: &TlsAcceptor) -> Result<Self, ErrorState> {
        let Transport::Plain(mut stream) = self.transport else {
            return Err(ErrorState::from(ProxyError::InvalidOperation));
        };
        if !self.input.is_empty() {
            stream.unread(self.input.split().freeze());
        }

        let tls = with_deadline(IoMode::Regular, self.timeouts, acceptor.accept(stream)).await?;
        let (_, conn) = tls.get_ref();
        let alpn = conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).to_string());
        let sni = conn.server_name().map(String::from);
        Ok(Endpoint {
            transport: Transport::ClientTls(Box::new(tls)),
            input: BytesMut::new(),
            output: self.output,
            mode: self.mode,
            timeouts: self.timeouts,
            secured: true,
            alpn,
            sni,
            peer_cert: None,
            peer_chain: Vec::new(),
        })
    }

    /// Perform the upstream handshake, consuming the plain endpoint, and
    /// capture the peer certificate data for leaf forgery.
    pub async fn connect_tls(
        mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<Self, ErrorState> {
        let Transport::Plain(mut stream) = self.transport else {
            return Err(ErrorState::from(ProxyError::InvalidOperation));
        };
        if !self.input.is_empty() {
            stream.unread(self.input.split().freeze());
        }

        let tls = with_deadline(
            IoMode::Regular,
            self.timeouts,
            connector.connect(server_name, stream),
        )
        .await?;
        let (_, conn) = tls.get_ref();
        let alpn = conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).to_string());
        let chain: Vec<CertificateDer<'static>> = conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
            .unwrap_or_default();
        Ok(Endpoint {
            transport: Transport::UpstreamTls(Box::new(tls)),
            input: BytesMut::new(),
            output: self.output,
            mode: self.mode,
            timeouts: self.timeouts,
            secured: true,
            alpn,
            sni: None,
            peer_cert: chain.first().cloned(),
            peer_chain: chain,
        })
    }

    /// Split into independently driven halves for the pump phases.
    pub fn into_split(self) -> (ReadEnd, WriteEnd) {
        let (read, write) = tokio::io::split(self.transport);
        (
            ReadEnd {
                io: read,
                input: self.input,
                mode: self.mode,
                timeouts: self.timeouts,
            },
            WriteEnd {
                io: write,
                output: self.output,
            },
        )
    }
}

/// Read half of a split endpoint, keeping the staged input bytes.
pub struct ReadEnd {
    io: ReadHalf<Transport>,
    pub input: BytesMut,
    mode: IoMode,
    timeouts: Timeouts,
}

impl ReadEnd {
    pub fn set_mode(&mut self, mode: IoMode) {
        self.mode = mode;
    }

    pub async fn read_some(&mut self) -> Result<usize, ErrorState> {
        self.input.reserve(DEFAULT_BUFFER_SIZE);
        let mode = self.mode;
        let timeouts = self.timeouts;
        with_deadline(mode, timeouts, self.io.read_buf(&mut self.input)).await
    }
}

/// Write half of a split endpoint, keeping the staged output bytes.
pub struct WriteEnd {
    io: WriteHalf<Transport>,
    pub output: BytesMut,
}

impl WriteEnd {
    /// Untimed drain; the paired read owns the deadline in pump phases.
    pub async fn write_untimed(&mut self) -> Result<(), ErrorState> {
        while !self.output.is_empty() {
            self.io.write_buf(&mut self.output).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(err) = self.io.shutdown().await {
            trace!("shutdown error: {err}");
        }
    }
}

static ID_GENERATOR: Lazy<Mutex<SnowflakeIdGenerator>> =
    Lazy::new(|| Mutex::new(SnowflakeIdGenerator::new(1, 1)));

pub fn next_flow_id() -> i64 {
    match ID_GENERATOR.lock() {
        Ok(mut generator) => generator.generate(),
        Err(poisoned) => poisoned.into_inner().generate(),
    }
}

/// The pair of endpoints carrying one client's session through the proxy.
/// Endpoints are taken out of their slots by the phases that split them;
/// the flow record itself (id, target, overrides, error state) survives for
/// the whole session.
#[derive(Debug)]
pub struct ConnectionFlow {
    pub id: i64,
    pub client_addr: SocketAddr,
    pub accepted_at: DateTime<Utc>,
    client: Option<Endpoint>,
    server: Option<Endpoint>,
    pub target_host: String,
    pub target_port: u16,
    pub intercept_tls: bool,
    pub intercept_ws: bool,
    pub error: ErrorState,
}

impl ConnectionFlow {
    pub fn new(client_addr: SocketAddr, client: Endpoint) -> Self {
        ConnectionFlow {
            id: next_flow_id(),
            client_addr,
            accepted_at: Utc::now(),
            client: Some(client),
            server: None,
            target_host: String::new(),
            target_port: 0,
            intercept_tls: false,
            intercept_ws: false,
            error: ErrorState::default(),
        }
    }

    /// Flow record with no endpoints attached, for dispatch-level tests.
    #[cfg(test)]
    pub(crate) fn new_detached() -> Self {
        ConnectionFlow {
            id: next_flow_id(),
            client_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            accepted_at: Utc::now(),
            client: None,
            server: None,
            target_host: String::new(),
            target_port: 0,
            intercept_tls: false,
            intercept_ws: false,
            error: ErrorState::default(),
        }
    }

    pub fn has_target(&self) -> bool {
        !self.target_host.is_empty()
    }

    pub fn set_target(&mut self, host: impl Into<String>, port: u16) {
        self.target_host = host.into();
        self.target_port = port;
    }

    pub fn client_mut(&mut self) -> Result<&mut Endpoint, ErrorState> {
        self.client
            .as_mut()
            .ok_or_else(|| ErrorState::from(ProxyError::InvalidOperation))
    }

    pub fn client_ref(&self) -> Option<&Endpoint> {
        self.client.as_ref()
    }

    pub fn server_mut(&mut self) -> Result<&mut Endpoint, ErrorState> {
        self.server
            .as_mut()
            .ok_or_else(|| ErrorState::from(ProxyError::ServerNotConnected))
    }

    pub fn server_ref(&self) -> Option<&Endpoint> {
        self.server.as_ref()
    }

    pub fn server_connected(&self) -> bool {
        self.server.is_some()
    }

    pub fn set_client(&mut self, endpoint: Endpoint) {
        self.client = Some(endpoint);
    }

    pub fn set_server(&mut self, endpoint: Endpoint) {
        self.server = Some(endpoint);
    }

    pub fn take_client(&mut self) -> Result<Endpoint, ErrorState> {
        self.client
            .take()
            .ok_or_else(|| ErrorState::from(ProxyError::InvalidOperation))
    }

    pub fn take_server(&mut self) -> Result<Endpoint, ErrorState> {
        self.server
            .take()
            .ok_or_else(|| ErrorState::from(ProxyError::ServerNotConnected))
    }

    pub async fn disconnect(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.shutdown().await;
        }
        if let Some(server) = self.server.as_mut() {
            server.shutdown().await;
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_ids_are_unique_and_stable() {
        let a = next_flow_id();
        let b = next_flow_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn read_until_finds_split_delimiter() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r").await.unwrap();
            sock.flush().await.unwrap();
            tokio::task::yield_now().await;
            sock.write_all(b"\nrest").await.unwrap();
            sock.flush().await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut endpoint = Endpoint::from_tcp(stream, Timeouts::default());
        let end = endpoint.read_until(b"\r\n").await.unwrap();
        assert_eq!(&endpoint.input[..end], b"HTTP/1.1 200 OK\r\n");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn timed_read_reports_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _guard = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut endpoint = Endpoint::from_tcp(
            stream,
            Timeouts {
                regular: Duration::from_millis(50),
                tunnel: Duration::from_millis(50),
            },
        );
        let err = endpoint.read_some().await.unwrap_err();
        assert!(err.is_timeout());
    }
}
