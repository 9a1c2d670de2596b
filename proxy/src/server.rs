use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use tokio::{
    net::{TcpListener, TcpSocket},
    sync::Semaphore,
    task::JoinHandle,
};
use tracing::{debug, error, info, trace};
use wiretap_shared::{load_or_generate_ca, tls::{self, TlsConfig}};

use crate::{
    config::Options,
    connection::{ConnectionFlow, Endpoint},
    error::{ErrorState, ProxyError},
    intercept::InterceptorRegistry,
    service::{ServerContext, ServiceHandler},
    tls::store::{ServerStore, StoreProperties},
};

const DUAL_STACK_SEND_BUFFER: u32 = 64 * 1024;

/// A running proxy server. Dropping the handle aborts the acceptor; flows
/// already in flight run to completion on the runtime.
#[derive(Debug)]
pub struct ProxyServer {
    local_addr: SocketAddr,
    cxt: Arc<ServerContext>,
    acceptor: JoinHandle<()>,
}

impl ProxyServer {
    /// Validate options, open the certificate store, bind the listener, and
    /// start accepting flows.
    pub async fn start(
        options: Options,
        interceptors: InterceptorRegistry,
    ) -> Result<ProxyServer, ErrorState> {
        options.validate()?;

        let store_dir = options
            .ssl_certificate_dir
            .clone()
            .unwrap_or_else(default_store_dir);

        let props = match &options.ssl_certificate_properties {
            Some(path) => StoreProperties::from_file(path)?,
            None => {
                let default_path = store_dir.join("certificate.properties");
                if default_path.exists() {
                    StoreProperties::from_file(&default_path)?
                } else {
                    StoreProperties::default()
                }
            }
        };

        let ca = load_or_generate_ca(&store_dir, &props.issuer).map_err(|err| {
            ErrorState::with_message(ProxyError::SslServerStoreCreationError, err.to_string())
        })?;

        let upstream_roots = match &options.upstream_trusted_ca_file {
            Some(path) => Arc::new(tls::roots_from_pem_file(path).map_err(|err| {
                ErrorState::with_message(
                    ProxyError::InvalidTrustedCertificatesFile,
                    err.to_string(),
                )
            })?),
            None => ca.roots(),
        };

        let store = Arc::new(ServerStore::open(
            ca,
            store_dir.join("leaves"),
            props,
            options.strong_serial_numbers,
        )?);

        let listener = bind_listener(&options)?;
        let local_addr = listener.local_addr().map_err(ErrorState::from)?;

        let cxt = Arc::new(ServerContext {
            own_port: local_addr.port(),
            options,
            interceptors,
            store,
            tls_config: TlsConfig::default(),
            upstream_roots,
        });

        let acceptor = tokio::spawn(accept_loop(listener, cxt.clone()));
        info!("wiretap listening on {local_addr}");

        Ok(ProxyServer {
            local_addr,
            cxt,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.cxt
    }

    pub fn stop(&self) {
        self.acceptor.abort();
    }

    /// Wait for the acceptor to end. Returns an error when it ended for any
    /// reason other than an explicit stop.
    pub async fn join(&mut self) -> Result<(), ErrorState> {
        match (&mut self.acceptor).await {
            Ok(()) => Err(ErrorState::with_message(
                ProxyError::AcceptorError,
                "acceptor terminated unexpectedly",
            )),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(ErrorState::with_message(
                ProxyError::AcceptorError,
                err.to_string(),
            )),
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wiretap")
}

fn bind_listener(options: &Options) -> Result<TcpListener, ErrorState> {
    let (socket, addr) = if options.ipv6 {
        let socket = TcpSocket::new_v6().map_err(|err| ipv6_error(err))?;
        socket
            .set_send_buffer_size(DUAL_STACK_SEND_BUFFER)
            .map_err(ipv6_error)?;
        let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, options.port).into();
        (socket, addr)
    } else {
        let socket = TcpSocket::new_v4().map_err(ErrorState::from)?;
        let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, options.port).into();
        (socket, addr)
    };

    socket.set_reuseaddr(true).map_err(ErrorState::from)?;
    socket.bind(addr).map_err(ErrorState::from)?;
    socket
        .listen(options.connection_limit)
        .map_err(ErrorState::from)
}

fn ipv6_error(err: std::io::Error) -> ErrorState {
    let mut state = ErrorState::from(err);
    state.set_proxy_error(ProxyError::Ipv6Error);
    state
}

/// Accept flows, park them FIFO behind the service limit, and hand each to
/// its own service handler task.
async fn accept_loop(listener: TcpListener, cxt: Arc<ServerContext>) {
    let limit = Arc::new(Semaphore::new(cxt.options.connection_service_limit));
    let timeouts = cxt.options.timeouts();

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let endpoint = Endpoint::from_tcp(stream, timeouts);
                let flow = ConnectionFlow::new(peer, endpoint);
                trace!("flow {}: accepted from {peer}", flow.id);

                let limit = limit.clone();
                let cxt = cxt.clone();
                tokio::spawn(async move {
                    // Fair FIFO: accepted flows start as running ones finish.
                    let Ok(_permit) = limit.acquire_owned().await else {
                        return;
                    };
                    ServiceHandler::new(cxt).run(flow).await;
                });
            }
            Err(err) => {
                // Transient accept failures are logged and survived;
                // anything else ends the acceptor.
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::Interrupted
                ) {
                    debug!("accept error: {err}");
                    continue;
                }
                error!("acceptor failed: {err}");
                return;
            }
        }
    }
}
