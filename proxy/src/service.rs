use std::sync::Arc;

use rustls::RootCertStore;
use tracing::{debug, trace};
use wiretap_shared::{WiretapCA, tls::TlsConfig};

use crate::{
    config::Options,
    connection::ConnectionFlow,
    http1::{exchange::HttpExchange, service::HttpService},
    intercept::InterceptorRegistry,
    tls::{service::TlsService, store::ServerStore},
    tunnel::TunnelService,
    ws::service::WebSocketService,
};

/// Everything a phase-service needs besides the flow itself.
#[derive(Debug)]
pub struct ServerContext {
    pub options: Options,
    pub interceptors: InterceptorRegistry,
    pub store: Arc<ServerStore>,
    pub tls_config: TlsConfig,
    pub upstream_roots: Arc<RootCertStore>,
    pub own_port: u16,
}

impl ServerContext {
    pub fn ca(&self) -> &WiretapCA {
        self.store.ca()
    }
}

/// Next phase for a flow. Exactly one phase-service is active at any time;
/// a service finishes by naming its successor.
#[derive(Debug)]
pub enum Transition {
    /// A fresh HTTP exchange on the same flow.
    Http,
    Tls,
    Tunnel,
    /// Upgrade accepted; the handshake exchange seeds the pipeline.
    WebSocket(Box<HttpExchange>),
    Stop,
}

/// Drives one flow through its phase-services until it stops.
pub struct ServiceHandler {
    cxt: Arc<ServerContext>,
}

impl ServiceHandler {
    pub fn new(cxt: Arc<ServerContext>) -> Self {
        ServiceHandler { cxt }
    }

    pub async fn run(&self, mut flow: ConnectionFlow) {
        let id = flow.id;
        trace!("flow {id}: started");

        let mut next = Transition::Http;
        loop {
            next = match next {
                Transition::Http => HttpService::new(&mut flow, &self.cxt).run().await,
                Transition::Tls => TlsService::new(&mut flow, &self.cxt).run().await,
                Transition::Tunnel => TunnelService::new(&mut flow, &self.cxt).run().await,
                Transition::WebSocket(handshake) => {
                    WebSocketService::new(&mut flow, &self.cxt, *handshake)
                        .run()
                        .await
                }
                Transition::Stop => break,
            };
        }

        if flow.error.has_error() {
            debug!("flow {id}: stopped with error: {}", flow.error);
        }
        flow.disconnect().await;
        let elapsed = chrono::Utc::now() - flow.accepted_at;
        trace!("flow {id}: finished after {}ms", elapsed.num_milliseconds());
    }
}
