use tracing::trace;

use crate::{
    connection::{ConnectionFlow, Endpoint, IoMode, ReadEnd, WriteEnd},
    intercept::TunnelEvent,
    service::{ServerContext, Transition},
};

/// One direction of an opaque relay: flush whatever is staged, write, then
/// read from the source. Writes are untimed because the read owns the
/// deadline; a finished loop half-closes its destination so the opposite
/// loop unblocks.
pub struct TunnelLoop {
    source: ReadEnd,
    destination: WriteEnd,
}

impl TunnelLoop {
    pub fn new(source: ReadEnd, destination: WriteEnd) -> Self {
        TunnelLoop {
            source,
            destination,
        }
    }

    pub async fn run(mut self) {
        self.source.set_mode(IoMode::Tunnel);
        loop {
            // Residual bytes first, in case something arrived before the
            // tunnel was established.
            let staged = self.source.input.split();
            self.destination.output.extend_from_slice(&staged);
            if self.destination.write_untimed().await.is_err() {
                break;
            }
            match self.source.read_some().await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.destination.shutdown().await;
    }
}

/// Opaque TCP relay between the two endpoints of a flow.
pub struct TunnelService<'a> {
    flow: &'a mut ConnectionFlow,
    cxt: &'a ServerContext,
}

impl<'a> TunnelService<'a> {
    pub fn new(flow: &'a mut ConnectionFlow, cxt: &'a ServerContext) -> Self {
        TunnelService { flow, cxt }
    }

    pub async fn run(self) -> Transition {
        // A downgrade can reach the tunnel before any upstream connection
        // exists.
        if !self.flow.server_connected() {
            let host = self.flow.target_host.clone();
            let port = self.flow.target_port;
            match Endpoint::connect(&host, port, self.cxt.options.timeouts()).await {
                Ok(endpoint) => self.flow.set_server(endpoint),
                Err(err) => {
                    self.flow.error = err;
                    return Transition::Stop;
                }
            }
        }

        self.cxt.interceptors.run_tunnel(TunnelEvent::Start, self.flow);

        let client = match self.flow.take_client() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.flow.error = err;
                return Transition::Stop;
            }
        };
        let server = match self.flow.take_server() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.flow.error = err;
                return Transition::Stop;
            }
        };

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        trace!("flow {}: tunnelling", self.flow.id);
        let upstream = TunnelLoop::new(client_read, server_write);
        let downstream = TunnelLoop::new(server_read, client_write);
        tokio::join!(upstream.run(), downstream.run());

        self.cxt.interceptors.run_tunnel(TunnelEvent::Stop, self.flow);
        Transition::Stop
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Timeouts;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn tunnel_loops_relay_both_directions() {
        let client_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_side.local_addr().unwrap();
        let server_addr = server_side.local_addr().unwrap();

        // The "client" sends a blob and expects an echo prefix back.
        let client_task = tokio::spawn(async move {
            let mut sock = TcpStream::connect(client_addr).await.unwrap();
            sock.write_all(b"hello through tunnel").await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            buf.to_vec()
        });
        // The "origin" echoes a prefix then closes.
        let origin_task = tokio::spawn(async move {
            let (mut sock, _) = server_side.accept().await.unwrap();
            let mut buf = [0u8; 20];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"olleh").await.unwrap();
            buf.to_vec()
        });

        let (client_conn, _) = client_side.accept().await.unwrap();
        let server_conn = TcpStream::connect(server_addr).await.unwrap();

        let client = Endpoint::from_tcp(client_conn, Timeouts::default());
        let server = Endpoint::from_tcp(server_conn, Timeouts::default());
        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        let a = TunnelLoop::new(client_read, server_write);
        let b = TunnelLoop::new(server_read, client_write);
        tokio::join!(a.run(), b.run());

        assert_eq!(origin_task.await.unwrap(), b"hello through tunnel");
        assert_eq!(client_task.await.unwrap(), b"olleh");
    }
}
