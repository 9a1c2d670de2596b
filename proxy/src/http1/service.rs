use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    connection::{ConnectionFlow, Endpoint},
    error::{ErrorState, ProxyError},
    http1::{
        exchange::HttpExchange,
        message::{CRLF_CRLF, HttpResponse, Status, Version},
        parser::{HttpParser, MessageMode},
        url::TargetForm,
    },
    intercept::HttpEvent,
    service::{ServerContext, Transition},
    ws::handshake,
};

pub const PROXY_NAME: &str = "wiretap";
pub const FULL_SERVER_NAME: &str = concat!("wiretap/", env!("CARGO_PKG_VERSION"));

/// Outcome of one step of the request loop: either the phase to move to, or
/// an error page to render before stopping.
enum ServeError {
    Page(Status, String),
    Stop,
}

type ServeResult<T> = Result<T, ServeError>;

fn client_error(state: &ErrorState) -> ServeError {
    if state.is_timeout() {
        ServeError::Page(Status::REQUEST_TIMEOUT, state.message_or_proxy())
    } else {
        ServeError::Page(Status::BAD_REQUEST, state.message_or_proxy())
    }
}

fn upstream_connect_error(state: &ErrorState) -> ServeError {
    if state.is_timeout() {
        ServeError::Page(Status::GATEWAY_TIMEOUT, state.message_or_proxy())
    } else {
        ServeError::Page(Status::BAD_GATEWAY, state.message_or_proxy())
    }
}

fn upstream_io_error(state: &ErrorState) -> ServeError {
    if state.is_timeout() {
        ServeError::Page(Status::GATEWAY_TIMEOUT, state.message_or_proxy())
    } else {
        ServeError::Page(Status::INTERNAL_SERVER_ERROR, state.message_or_proxy())
    }
}

/// One request-response exchange over an established client connection.
/// Keep-alive loops by transitioning to a fresh instance of this service.
pub struct HttpService<'a> {
    flow: &'a mut ConnectionFlow,
    cxt: &'a ServerContext,
    exchange: HttpExchange,
    parser: HttpParser,
}

impl<'a> HttpService<'a> {
    pub fn new(flow: &'a mut ConnectionFlow, cxt: &'a ServerContext) -> Self {
        let parser = HttpParser::new(cxt.options.body_size_limit);
        HttpService {
            flow,
            cxt,
            exchange: HttpExchange::default(),
            parser,
        }
    }

    pub async fn run(mut self) -> Transition {
        // Errors deferred by an earlier phase are reported over HTTP now
        // that a channel to the client exists.
        if self.flow.error.has_proxy_error() {
            let message = self.flow.error.message_or_proxy();
            return self
                .render_error_page(Status::BAD_GATEWAY, &message)
                .await;
        }

        match self.serve().await {
            Ok(transition) => transition,
            Err(ServeError::Page(status, message)) => {
                self.render_error_page(status, &message).await
            }
            Err(ServeError::Stop) => Transition::Stop,
        }
    }

    async fn serve(&mut self) -> ServeResult<Transition> {
        self.read_request_head().await?;
        self.read_body(MessageMode::Request).await?;
        self.handle_request().await
    }

    async fn read_request_head(&mut self) -> ServeResult<()> {
        let client = self.flow.client_mut().map_err(|_| ServeError::Stop)?;
        if let Err(err) = client.read_until(CRLF_CRLF).await {
            // A clean close between keep-alive requests is not an error.
            if err.is_eof() && client.input.is_empty() {
                return Err(ServeError::Stop);
            }
            let page = client_error(&err);
            if let Some(os) = err.os_error() {
                self.flow.error.set_os_error(std::io::Error::new(os.kind(), os.to_string()));
            }
            return Err(page);
        }

        let parser = &mut self.parser;
        let exchange = &mut self.exchange;
        let client = self.flow.client_mut().map_err(|_| ServeError::Stop)?;
        let parse = parser
            .read_request_line(&mut client.input, exchange)
            .and_then(|()| {
                let mut headers = crate::http1::message::Headers::new();
                parser.read_headers(&mut client.input, &mut headers)?;
                exchange.request_mut().headers = headers;
                Ok(())
            });
        if let Err(err) = parse {
            self.flow.error.set_proxy_error(err);
            return Err(ServeError::Page(Status::BAD_REQUEST, err.to_string()));
        }
        Ok(())
    }

    /// Resumable body read against whichever endpoint `mode` names.
    async fn read_body(&mut self, mode: MessageMode) -> ServeResult<()> {
        let mut eof = false;
        loop {
            let endpoint = match mode {
                MessageMode::Request => self.flow.client_mut(),
                MessageMode::Response => self.flow.server_mut(),
            }
            .map_err(|_| ServeError::Stop)?;

            match self
                .parser
                .read_body(&mut endpoint.input, &mut self.exchange, mode, eof)
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if eof {
                        self.flow.error.set_proxy_error(ProxyError::MalformedResponseBody);
                        return Err(ServeError::Page(
                            Status::INTERNAL_SERVER_ERROR,
                            ProxyError::MalformedResponseBody.to_string(),
                        ));
                    }
                    match endpoint.read_some().await {
                        Ok(0) => eof = true,
                        Ok(_) => {}
                        Err(err) => {
                            let page = match mode {
                                MessageMode::Request => client_error(&err),
                                MessageMode::Response => upstream_io_error(&err),
                            };
                            if let Some(os) = err.os_error() {
                                self.flow
                                    .error
                                    .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
                            }
                            return Err(page);
                        }
                    }
                }
                Err(err) => {
                    self.flow.error.set_proxy_error(err);
                    let status = match mode {
                        MessageMode::Request => Status::BAD_REQUEST,
                        MessageMode::Response => Status::INTERNAL_SERVER_ERROR,
                    };
                    return Err(ServeError::Page(status, err.to_string()));
                }
            }
        }
    }

    async fn handle_request(&mut self) -> ServeResult<Transition> {
        self.validate_target()?;

        self.cxt
            .interceptors
            .run_http(HttpEvent::AnyRequest, self.flow, &mut self.exchange);

        self.exchange
            .request_mut()
            .headers
            .add("Via", format!("1.1 {PROXY_NAME}"));

        if self.exchange.request().url.form == TargetForm::Authority {
            return self.handle_connect().await;
        }

        if self
            .exchange
            .request()
            .headers
            .has_value("Expect", "100-continue", true)
        {
            self.send_continue().await?;
            self.exchange.request_mut().headers.remove("Expect");
            self.read_body(MessageMode::Request).await?;
        }

        self.cxt
            .interceptors
            .run_http(HttpEvent::Request, self.flow, &mut self.exchange);

        if !self.exchange.has_response() {
            if handshake::is_request_handshake(self.exchange.request()) {
                self.cxt.interceptors.run_http(
                    HttpEvent::WebSocketHandshake,
                    self.flow,
                    &mut self.exchange,
                );
            }
            self.connect_upstream().await?;
            self.forward_request().await?;
            self.read_response_head().await?;
            self.read_body(MessageMode::Response).await?;
        }

        self.forward_response().await?;
        self.handle_response()
    }

    /// Normalise the request target so it can be forwarded: synthesise the
    /// Host header, default scheme and port from the upstream state.
    fn validate_target(&mut self) -> ServeResult<()> {
        let server_secured = self
            .flow
            .server_ref()
            .map(|s| s.secured())
            .unwrap_or(false);
        let request = self.exchange.request_mut();
        let mut url = request.url.clone();

        match url.form {
            TargetForm::Absolute => {
                if !request.headers.has("Host") {
                    request
                        .headers
                        .set("Host", url.netloc.to_host_string());
                }
                // Forward in origin form; the upstream may not expect an
                // absolute target.
                url.form = TargetForm::Origin;
            }
            TargetForm::Origin if !url.netloc.has_hostname() => {
                let Some(host) = request.headers.get("Host") else {
                    self.flow.error.set_proxy_error(ProxyError::InvalidTargetHost);
                    return Err(ServeError::Page(
                        Status::BAD_REQUEST,
                        "No host given.".to_string(),
                    ));
                };
                url.netloc = crate::http1::url::Url::parse_netloc(host).map_err(|err| {
                    ServeError::Page(Status::BAD_REQUEST, err.to_string())
                })?;
            }
            _ => {}
        }

        if url.form != TargetForm::Authority && url.scheme.is_empty() {
            url.scheme = if server_secured { "https" } else { "http" }.to_string();
        }
        if !url.netloc.has_port() {
            url.netloc.port = Some(if url.scheme == "https" || server_secured {
                443
            } else {
                80
            });
        }

        request.url = url;
        Ok(())
    }

    async fn handle_connect(&mut self) -> ServeResult<Transition> {
        self.cxt
            .interceptors
            .run_http(HttpEvent::Connect, self.flow, &mut self.exchange);

        let (host, port) = {
            let url = &self.exchange.request().url;
            (url.host().to_string(), url.port_or(443))
        };
        self.flow.set_target(host, port);

        // An interceptor may have set a response; otherwise answer 200.
        if !self.exchange.has_response() {
            self.exchange.set_response(HttpResponse {
                version: Version::Http1_1,
                status: Status::OK,
                ..HttpResponse::default()
            });
        }

        self.write_response_to_client().await.map_err(|err| {
            debug!("could not send CONNECT response: {err}");
            ServeError::Stop
        })?;

        let status = self
            .exchange
            .response()
            .map(|res| res.status)
            .unwrap_or(Status::INTERNAL_SERVER_ERROR);

        if status.is_2xx() {
            if self.exchange.mask_connect() {
                return Ok(Transition::Http);
            }
            let options = &self.cxt.options;
            if options.ssl_passthrough_strict
                || (options.ssl_passthrough && !self.flow.intercept_tls)
            {
                return Ok(Transition::Tunnel);
            }
            // TLS may still be the wrong guess; the TLS phase downgrades to
            // a tunnel when the bytes are not a ClientHello.
            return Ok(Transition::Tls);
        }
        if status.is_3xx() {
            return Ok(Transition::Http);
        }
        Err(ServeError::Stop)
    }

    async fn send_continue(&mut self) -> ServeResult<()> {
        let response = HttpResponse {
            version: Version::Http1_1,
            status: Status::CONTINUE,
            ..HttpResponse::default()
        };
        let client = self.flow.client_mut().map_err(|_| ServeError::Stop)?;
        response.write_to(&mut client.output);
        client.write_all().await.map_err(|_| ServeError::Stop)
    }

    async fn connect_upstream(&mut self) -> ServeResult<()> {
        let (host, port) = {
            let url = &self.exchange.request().url;
            (url.host().to_string(), url.port_or(80))
        };

        if self.is_self_connect(&host, port) {
            self.flow.error.set_proxy_error(ProxyError::SelfConnect);
            return Err(ServeError::Page(
                Status::BAD_REQUEST,
                "Refusing to connect to the proxy itself.".to_string(),
            ));
        }

        let already_connected = self.flow.server_connected()
            && self.flow.target_host == host
            && self.flow.target_port == port;
        if already_connected {
            return Ok(());
        }

        trace!("flow {}: connecting upstream {host}:{port}", self.flow.id);
        match Endpoint::connect(&host, port, self.cxt.options.timeouts()).await {
            Ok(endpoint) => {
                self.flow.set_server(endpoint);
                self.flow.set_target(host, port);
                Ok(())
            }
            Err(err) => {
                let page = upstream_connect_error(&err);
                if let Some(os) = err.os_error() {
                    self.flow
                        .error
                        .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
                }
                Err(page)
            }
        }
    }

    fn is_self_connect(&self, host: &str, port: u16) -> bool {
        port == self.cxt.own_port
            && matches!(host, "localhost" | "127.0.0.1" | "::1")
    }

    async fn forward_request(&mut self) -> ServeResult<()> {
        let server = self.flow.server_mut().map_err(|_| {
            ServeError::Page(
                Status::BAD_GATEWAY,
                ProxyError::ServerNotConnected.to_string(),
            )
        })?;
        self.exchange.request().write_to(&mut server.output);
        server.write_all().await.map_err(|err| {
            if err.is_timeout() {
                ServeError::Page(Status::GATEWAY_TIMEOUT, err.message_or_proxy())
            } else {
                ServeError::Page(Status::INTERNAL_SERVER_ERROR, err.message_or_proxy())
            }
        })
    }

    async fn read_response_head(&mut self) -> ServeResult<()> {
        let server = self.flow.server_mut().map_err(|_| ServeError::Stop)?;
        if let Err(err) = server.read_until(CRLF_CRLF).await {
            let page = upstream_io_error(&err);
            if let Some(os) = err.os_error() {
                self.flow
                    .error
                    .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
            }
            return Err(page);
        }

        let parser = &mut self.parser;
        let exchange = &mut self.exchange;
        let server = self.flow.server_mut().map_err(|_| ServeError::Stop)?;
        let parse = parser
            .read_response_line(&mut server.input, exchange)
            .and_then(|()| {
                let mut headers = crate::http1::message::Headers::new();
                parser.read_headers(&mut server.input, &mut headers)?;
                exchange.response_mut()?.headers = headers;
                Ok(())
            });
        if let Err(err) = parse {
            self.flow.error.set_proxy_error(err);
            return Err(ServeError::Page(
                Status::INTERNAL_SERVER_ERROR,
                err.to_string(),
            ));
        }
        Ok(())
    }

    async fn forward_response(&mut self) -> ServeResult<()> {
        self.cxt
            .interceptors
            .run_http(HttpEvent::Response, self.flow, &mut self.exchange);
        self.write_response_to_client().await.map_err(|err| {
            if let Some(os) = err.os_error() {
                self.flow
                    .error
                    .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
            }
            ServeError::Stop
        })
    }

    async fn write_response_to_client(&mut self) -> Result<(), ErrorState> {
        let response = self.exchange.response().map_err(ErrorState::from)?.clone();
        let client = self.flow.client_mut()?;
        response.write_to(&mut client.output);
        client.write_all().await
    }

    fn handle_response(&mut self) -> ServeResult<Transition> {
        let request = self.exchange.request();
        let response = self.exchange.response().map_err(|err| {
            ServeError::Page(Status::INTERNAL_SERVER_ERROR, err.to_string())
        })?;

        if request.should_close_connection() || response.should_close_connection() {
            return Ok(Transition::Stop);
        }

        if response.status == Status::SWITCHING_PROTOCOLS {
            let options = &self.cxt.options;
            let upgrade_ok = handshake::is_request_handshake(request)
                && handshake::is_response_handshake(response);
            if !options.ws_passthrough_strict
                && (!options.ws_passthrough || self.flow.intercept_ws)
                && upgrade_ok
            {
                let exchange = std::mem::take(&mut self.exchange);
                return Ok(Transition::WebSocket(Box::new(exchange)));
            }
            return Ok(Transition::Tunnel);
        }

        Ok(Transition::Http)
    }

    #[cfg(test)]
    pub(crate) fn validate_target_for_test(&mut self) -> Result<(), Status> {
        self.validate_target().map_err(|err| match err {
            ServeError::Page(status, _) => status,
            ServeError::Stop => Status::INTERNAL_SERVER_ERROR,
        })
    }

    #[cfg(test)]
    pub(crate) fn exchange_mut(&mut self) -> &mut HttpExchange {
        &mut self.exchange
    }

    /// Synthetic HTML error page, then stop. The error interceptor runs
    /// after the write attempt, right before teardown.
    async fn render_error_page(mut self, status: Status, message: &str) -> Transition {
        let reason = status.reason();
        let content = format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1><p>{message}</p></body></html>",
            code = status.0,
        );

        let response = self.exchange.make_response();
        response.version = Version::Http1_1;
        response.status = status;
        response.headers = crate::http1::message::Headers::new();
        response.body = Bytes::from(content);
        response.headers.add("Server", FULL_SERVER_NAME);
        response.headers.add("Connection", "close");
        response.headers.add("Content-Type", "text/html");
        response.set_content_length();

        if let Err(err) = self.write_response_to_client().await {
            trace!("error page write failed: {err}");
        }
        self.cxt
            .interceptors
            .run_http(HttpEvent::Error, self.flow, &mut self.exchange);
        Transition::Stop
    }
}
