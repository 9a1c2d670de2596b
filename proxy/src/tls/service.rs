use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};
use wiretap_shared::alpn::{self, AlpnProtocol};

use crate::{
    connection::{ConnectionFlow, Endpoint},
    error::{ErrorState, ProxyError},
    intercept::{CertificateEvent, TlsEvent},
    service::{ServerContext, Transition},
    tls::{
        client_hello::{ClientHelloReader, ClientHelloRecord},
        store::{CertificateIdentity, ForgedCertificate},
    },
};

const DEFAULT_ALPN: &str = "http/1.1";

/// Established the intercepted TLS bridge: parses the raw ClientHello,
/// handshakes upstream, forges a matching leaf, handshakes downstream, and
/// dispatches to the protocol the client actually negotiated.
pub struct TlsService<'a> {
    flow: &'a mut ConnectionFlow,
    cxt: &'a ServerContext,
    reader: ClientHelloReader,
    hello: Option<ClientHelloRecord>,
}

impl<'a> TlsService<'a> {
    pub fn new(flow: &'a mut ConnectionFlow, cxt: &'a ServerContext) -> Self {
        TlsService {
            flow,
            cxt,
            reader: ClientHelloReader::new(),
            hello: None,
        }
    }

    pub async fn run(mut self) -> Transition {
        // 1. Gather the opening record. Anything that is not a ClientHello
        // may still be intended for the server, so downgrade to a tunnel.
        match self.read_client_hello().await {
            Ok(Some(record)) => self.hello = Some(record),
            Ok(None) => return Transition::Tunnel,
            Err(err) => {
                self.flow.error = err;
                return Transition::Stop;
            }
        }

        // 2./3./4. Upstream connect and handshake. Failures are remembered
        // and reported over the client-side TLS as an HTTP 502 later.
        self.establish_tls_with_server().await;

        // 5./6./7. Forge a leaf and handshake with the client.
        match self.establish_tls_with_client().await {
            Ok(transition) => transition,
            Err(err) => {
                self.flow.error = err;
                self.cxt.interceptors.run_tls(TlsEvent::Error, self.flow);
                Transition::Stop
            }
        }
    }

    async fn read_client_hello(&mut self) -> Result<Option<ClientHelloRecord>, ErrorState> {
        loop {
            let client = self.flow.client_mut()?;
            match self.reader.read(&client.input) {
                Err(_) => {
                    trace!("flow {}: not a ClientHello, downgrading", self.flow.id);
                    return Ok(None);
                }
                Ok(0) => break,
                Ok(_needed) => {
                    let read = client.read_some().await?;
                    if read == 0 {
                        return Err(ErrorState::from(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream closed during ClientHello",
                        )));
                    }
                }
            }
        }

        let client = self.flow.client_mut()?;
        let total = self.reader.record_length().unwrap_or(client.input.len());
        match ClientHelloRecord::from_raw_data(&client.input[..total]) {
            Ok(record) => Ok(Some(record)),
            Err(_) => Ok(None),
        }
    }

    /// Connect and handshake upstream. On failure the error state is set
    /// and the client handshake still proceeds so the error can be
    /// delivered over TLS.
    async fn establish_tls_with_server(&mut self) {
        let host = self.flow.target_host.clone();
        let port = self.flow.target_port;

        let endpoint = match Endpoint::connect(&host, port, self.cxt.options.timeouts()).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                if let Some(os) = err.os_error() {
                    self.flow
                        .error
                        .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
                }
                self.flow.error.set_proxy_error(ProxyError::UpstreamConnectError);
                self.flow
                    .error
                    .set_message(format!("Could not connect to {host}:{port}"));
                self.cxt.interceptors.run_tls(TlsEvent::Error, self.flow);
                return;
            }
        };

        let connector = match self.upstream_connector() {
            Ok(connector) => connector,
            Err(err) => {
                self.flow.error = err;
                self.cxt.interceptors.run_tls(TlsEvent::Error, self.flow);
                return;
            }
        };

        let server_name = match ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(_) => {
                self.flow.error.set_proxy_error(ProxyError::InvalidTargetHost);
                self.cxt.interceptors.run_tls(TlsEvent::Error, self.flow);
                return;
            }
        };

        match endpoint.connect_tls(&connector, server_name).await {
            Ok(secured) => {
                trace!(
                    "flow {}: upstream TLS established, alpn {:?}",
                    self.flow.id,
                    secured.alpn()
                );
                self.flow.set_server(secured);
            }
            Err(err) => {
                if let Some(os) = err.os_error() {
                    self.flow
                        .error
                        .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
                }
                self.flow
                    .error
                    .set_proxy_error(ProxyError::UpstreamHandshakeFailed);
                self.flow
                    .error
                    .set_message(format!("Could not establish TLS with {host}:{port}"));
                self.cxt.interceptors.run_tls(TlsEvent::Error, self.flow);
            }
        }
    }

    fn upstream_connector(&self) -> Result<TlsConnector, ErrorState> {
        let options = &self.cxt.options;
        let Some(hello) = self.hello.as_ref() else {
            return Err(ErrorState::with_message(
                ProxyError::TlsServiceError,
                "ClientHello must be parsed before the upstream handshake",
            ));
        };

        // Offer upstream only what the intercepted path can relay.
        let alpn_protocols = if let Some(client_alpn) =
            self.flow.client_ref().filter(|c| c.secured()).and_then(|c| c.alpn())
        {
            vec![client_alpn.as_bytes().to_vec()]
        } else if hello.has_alpn_extension() && !options.ssl_negotiate_alpn {
            alpn::filter_offered(&hello.alpn)
        } else {
            alpn::alp_h1()
        };

        let mirror = if options.ssl_negotiate_ciphers {
            None
        } else {
            Some(hello.cipher_suites.clone())
        };

        let config = self
            .cxt
            .tls_config
            .upstream_client_config(
                options.ssl_server_method,
                options.ssl_verify,
                self.cxt.upstream_roots.clone(),
                alpn_protocols,
                mirror.as_deref(),
            )
            .map_err(|err| {
                ErrorState::with_message(ProxyError::SslContextError, err.to_string())
            })?;

        Ok(TlsConnector::from(Arc::new(config)))
    }

    async fn establish_tls_with_client(&mut self) -> Result<Transition, ErrorState> {
        let forged = self.certificate_for_client()?;

        let chain = self.chain_to_present(&forged);
        let alpn_protocols = self.downstream_alpn();

        let config = self
            .cxt
            .tls_config
            .interception_server_config(
                self.cxt.options.ssl_client_method,
                chain,
                forged.clone_key(),
                alpn_protocols,
            )
            .map_err(|err| {
                ErrorState::with_message(ProxyError::SslContextError, err.to_string())
            })?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let client = self.flow.take_client()?;
        match client.accept_tls(&acceptor).await {
            Ok(secured) => {
                debug!(
                    "flow {}: downstream TLS established, alpn {:?}, sni {:?}",
                    self.flow.id,
                    secured.alpn(),
                    secured.sni()
                );
                self.flow.set_client(secured);
            }
            Err(err) => {
                // The client will not continue after its handshake failed.
                let mut state = err;
                state.set_proxy_error(ProxyError::DownstreamHandshakeFailed);
                return Err(state);
            }
        }

        self.cxt.interceptors.run_tls(TlsEvent::Established, self.flow);

        let client_alpn = AlpnProtocol::from_bytes_opt(
            self.flow
                .client_ref()
                .and_then(|c| c.alpn())
                .map(str::as_bytes),
        );
        if client_alpn.is_http1_compatible() {
            // Any deferred upstream error is reported by the HTTP phase.
            Ok(Transition::Http)
        } else if !self.flow.error.has_error() {
            Ok(Transition::Tunnel)
        } else {
            Ok(Transition::Stop)
        }
    }

    /// Leaf identity: ClientHello SNI ∪ upstream-certificate SANs ∪ CN.
    fn certificate_for_client(&mut self) -> Result<Arc<ForgedCertificate>, ErrorState> {
        let mut identity = CertificateIdentity::default();

        if self.flow.server_connected() {
            identity.common_name = Some(self.flow.target_host.clone());
            let upstream_cert = self
                .flow
                .server_ref()
                .filter(|s| s.secured())
                .and_then(|s| s.peer_cert().cloned());
            if let Some(cert) = upstream_cert {
                identity.absorb_upstream_cert(&cert);
                // The observed host stays the common name.
                identity.common_name = Some(self.flow.target_host.clone());
            }
        }

        if let Some(hello) = self.hello.as_ref() {
            for name in hello.sni_hostnames() {
                identity.sans.insert(name);
            }
        }
        if identity.common_name.is_none() {
            identity.common_name = identity.sans.iter().next().cloned();
        }
        if let Some(cn) = identity.common_name.clone() {
            identity.sans.insert(cn);
        }

        self.cxt
            .interceptors
            .run_certificate(CertificateEvent::Search, self.flow, &mut identity);

        if let Some(existing) = self.cxt.store.get(&identity) {
            return Ok(existing);
        }

        self.cxt
            .interceptors
            .run_certificate(CertificateEvent::Create, self.flow, &mut identity);

        self.cxt.store.create(&identity)
    }

    fn chain_to_present(&self, forged: &ForgedCertificate) -> Vec<CertificateDer<'static>> {
        if self.cxt.options.ssl_supply_server_chain
            && let Some(server) = self.flow.server_ref().filter(|s| s.secured())
        {
            let mut chain = vec![forged.cert.clone()];
            chain.extend(server.peer_chain().iter().skip(1).cloned());
            if chain.len() > 1 {
                return chain;
            }
        }
        forged.chain.clone()
    }

    /// Server-side preference order: the upstream's negotiated protocol,
    /// then the default, then whatever the client offered.
    fn downstream_alpn(&self) -> Vec<Vec<u8>> {
        let mut protocols: Vec<Vec<u8>> = Vec::new();
        if let Some(upstream_alpn) = self
            .flow
            .server_ref()
            .filter(|s| s.secured())
            .and_then(|s| s.alpn())
        {
            protocols.push(upstream_alpn.as_bytes().to_vec());
        }
        if !protocols.iter().any(|p| p == DEFAULT_ALPN.as_bytes()) {
            protocols.push(DEFAULT_ALPN.as_bytes().to_vec());
        }
        if let Some(hello) = self.hello.as_ref() {
            for offered in &hello.alpn {
                let raw = offered.as_bytes().to_vec();
                if !protocols.contains(&raw) {
                    protocols.push(raw);
                }
            }
        }
        protocols
    }
}
