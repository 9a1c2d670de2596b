use std::io;

/// Structured failure codes for everything the proxy itself can get wrong.
/// Socket-level errors are carried alongside these, never recategorised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    // Server plumbing.
    InvalidOption,
    Ipv6Error,
    InvalidOperation,
    AcceptorError,
    ParserError,
    ServerNotConnected,
    IoError,
    SelfConnect,

    // HTTP.
    InvalidMethod,
    InvalidStatus,
    InvalidVersion,
    InvalidTargetHost,
    InvalidTargetPort,
    InvalidRequestLine,
    InvalidHeader,
    HeaderNotFound,
    InvalidBodySize,
    BodySizeTooLarge,
    InvalidChunkedBody,
    NoResponse,
    InvalidResponseLine,
    MalformedResponseBody,

    // TLS.
    InvalidClientHello,
    ReadAccessViolation,
    TlsServiceError,
    InvalidSslMethod,
    InvalidCipherSuite,
    InvalidTrustedCertificatesFile,
    InvalidCipherSuiteList,
    InvalidAlpnProtosList,
    SslContextError,
    SslServerStoreCreationError,
    CertificateCreationError,
    CertificateIssuerNotFound,
    CertificateSubjectNotFound,
    CertificateNameEntryError,
    AlpnNotFound,
    UpstreamHandshakeFailed,
    DownstreamHandshakeFailed,
    UpstreamConnectError,

    // WebSocket.
    InvalidOpcode,
    ExtensionParamNotFound,
    InvalidExtensionString,
    InvalidFrame,
    UnexpectedOpcode,
    SerializationError,
    ZlibError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Proxy,
    Http,
    Tls,
    WebSocket,
}

impl ProxyError {
    pub fn category(&self) -> ErrorCategory {
        use ProxyError::*;
        match self {
            InvalidOption | Ipv6Error | InvalidOperation | AcceptorError | ParserError
            | ServerNotConnected | IoError | SelfConnect => ErrorCategory::Proxy,
            InvalidMethod | InvalidStatus | InvalidVersion | InvalidTargetHost
            | InvalidTargetPort | InvalidRequestLine | InvalidHeader | HeaderNotFound
            | InvalidBodySize | BodySizeTooLarge | InvalidChunkedBody | NoResponse
            | InvalidResponseLine | MalformedResponseBody => ErrorCategory::Http,
            InvalidClientHello | ReadAccessViolation | TlsServiceError | InvalidSslMethod
            | InvalidCipherSuite | InvalidTrustedCertificatesFile | InvalidCipherSuiteList
            | InvalidAlpnProtosList | SslContextError | SslServerStoreCreationError
            | CertificateCreationError | CertificateIssuerNotFound
            | CertificateSubjectNotFound | CertificateNameEntryError | AlpnNotFound
            | UpstreamHandshakeFailed | DownstreamHandshakeFailed | UpstreamConnectError => {
                ErrorCategory::Tls
            }
            InvalidOpcode | ExtensionParamNotFound | InvalidExtensionString | InvalidFrame
            | UnexpectedOpcode | SerializationError | ZlibError => ErrorCategory::WebSocket,
        }
    }
}

impl std::error::Error for ProxyError {}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Deferred error record for one connection flow. A failure discovered
/// before TLS with the client is established can still be delivered later
/// as an HTTP 502 once a channel to the client exists.
#[derive(Debug, Default)]
pub struct ErrorState {
    proxy: Option<ProxyError>,
    os: Option<io::Error>,
    message: Option<String>,
}

impl ErrorState {
    pub fn has_error(&self) -> bool {
        self.proxy.is_some() || self.os.is_some()
    }

    pub fn has_proxy_error(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn proxy_error(&self) -> Option<ProxyError> {
        self.proxy
    }

    pub fn os_error(&self) -> Option<&io::Error> {
        self.os.as_ref()
    }

    pub fn set_proxy_error(&mut self, error: ProxyError) {
        self.proxy = Some(error);
    }

    pub fn set_os_error(&mut self, error: io::Error) {
        self.os = Some(error);
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn is_timeout(&self) -> bool {
        self.os
            .as_ref()
            .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
    }

    pub fn is_eof(&self) -> bool {
        self.os
            .as_ref()
            .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// The explicit message if one was recorded, otherwise the best
    /// available rendering of whichever error is present.
    pub fn message_or_proxy(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        if let Some(proxy) = &self.proxy {
            return proxy.to_string();
        }
        if let Some(os) = &self.os {
            return os.to_string();
        }
        "unknown error".to_string()
    }

    pub fn clear(&mut self) {
        self.proxy = None;
        self.os = None;
        self.message = None;
    }
}

impl std::fmt::Display for ErrorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message_or_proxy())
    }
}

impl From<io::Error> for ErrorState {
    fn from(value: io::Error) -> Self {
        ErrorState {
            proxy: None,
            os: Some(value),
            message: None,
        }
    }
}

impl From<ProxyError> for ErrorState {
    fn from(value: ProxyError) -> Self {
        ErrorState {
            proxy: Some(value),
            os: None,
            message: None,
        }
    }
}

impl ErrorState {
    pub fn with_message(proxy: ProxyError, message: impl Into<String>) -> Self {
        ErrorState {
            proxy: Some(proxy),
            os: None,
            message: Some(message.into()),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(ProxyError::SelfConnect.category(), ErrorCategory::Proxy);
        assert_eq!(ProxyError::NoResponse.category(), ErrorCategory::Http);
        assert_eq!(ProxyError::InvalidClientHello.category(), ErrorCategory::Tls);
        assert_eq!(
            ProxyError::InvalidOpcode.category(),
            ErrorCategory::WebSocket
        );
    }

    #[test]
    fn message_preference() {
        let mut state = ErrorState::default();
        assert_eq!(state.message_or_proxy(), "unknown error");

        state.set_proxy_error(ProxyError::UpstreamConnectError);
        assert_eq!(state.message_or_proxy(), "UpstreamConnectError");

        state.set_message("could not connect to example.test:443");
        assert_eq!(
            state.message_or_proxy(),
            "could not connect to example.test:443"
        );
    }

    #[test]
    fn timeout_detection() {
        let mut state = ErrorState::default();
        state.set_os_error(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(state.is_timeout());
        assert!(state.has_error());
        assert!(!state.has_proxy_error());
    }
}
