use std::{path::PathBuf, time::Duration};

use wiretap_shared::tls::SslMethod;

use crate::{
    connection::Timeouts,
    error::{ErrorState, ProxyError},
};

pub const MIN_BODY_SIZE_LIMIT: usize = 4096;

/// Recognised server options and their defaults. The front-end maps its
/// argument surface onto this struct; everything here is validated once at
/// startup.
#[derive(Debug, Clone)]
pub struct Options {
    pub port: u16,
    pub ipv6: bool,
    pub threads: usize,
    /// OS listen backlog.
    pub connection_limit: u32,
    /// Concurrently serviced flows; accepted flows beyond this wait FIFO.
    pub connection_service_limit: usize,
    pub timeout: Duration,
    pub tunnel_timeout: Duration,
    pub body_size_limit: usize,

    pub ssl_passthrough_strict: bool,
    pub ssl_passthrough: bool,
    /// Method for the client-facing side of the proxy.
    pub ssl_client_method: SslMethod,
    /// Method for the upstream side of the proxy.
    pub ssl_server_method: SslMethod,
    pub ssl_verify: bool,
    pub ssl_negotiate_ciphers: bool,
    pub ssl_negotiate_alpn: bool,
    pub ssl_supply_server_chain: bool,
    pub ssl_certificate_properties: Option<PathBuf>,
    pub ssl_certificate_dir: Option<PathBuf>,
    pub ssl_dhparam_file: Option<PathBuf>,
    pub upstream_trusted_ca_file: Option<PathBuf>,
    pub strong_serial_numbers: bool,

    pub ws_passthrough_strict: bool,
    pub ws_passthrough: bool,
    pub ws_intercept_default: bool,
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
        .max(2)
}

impl Default for Options {
    fn default() -> Self {
        Options {
            port: 3000,
            ipv6: false,
            threads: default_threads(),
            connection_limit: 1024,
            connection_service_limit: 512,
            timeout: Duration::from_secs(120),
            tunnel_timeout: Duration::from_secs(30),
            body_size_limit: 50_000_000,
            ssl_passthrough_strict: false,
            ssl_passthrough: false,
            ssl_client_method: SslMethod::Sslv23,
            ssl_server_method: SslMethod::Sslv23,
            ssl_verify: true,
            ssl_negotiate_ciphers: false,
            ssl_negotiate_alpn: false,
            ssl_supply_server_chain: false,
            ssl_certificate_properties: None,
            ssl_certificate_dir: None,
            ssl_dhparam_file: None,
            upstream_trusted_ca_file: None,
            strong_serial_numbers: false,
            ws_passthrough_strict: false,
            ws_passthrough: false,
            ws_intercept_default: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), ErrorState> {
        if self.body_size_limit <= MIN_BODY_SIZE_LIMIT {
            return Err(ErrorState::with_message(
                ProxyError::InvalidOption,
                format!(
                    "body-size-limit must exceed {MIN_BODY_SIZE_LIMIT}, got {}",
                    self.body_size_limit
                ),
            ));
        }
        if self.threads == 0 {
            return Err(ErrorState::with_message(
                ProxyError::InvalidOption,
                "threads must be at least 1",
            ));
        }
        if self.connection_service_limit == 0 {
            return Err(ErrorState::with_message(
                ProxyError::InvalidOption,
                "connection-service-limit must be at least 1",
            ));
        }
        if self.timeout.is_zero() || self.tunnel_timeout.is_zero() {
            return Err(ErrorState::with_message(
                ProxyError::InvalidOption,
                "timeout durations must be non-zero",
            ));
        }
        if let Some(path) = &self.ssl_dhparam_file
            && !path.exists()
        {
            return Err(ErrorState::with_message(
                ProxyError::InvalidOption,
                format!("ssl-dhparam-file does not exist: {}", path.display()),
            ));
        }
        if let Some(path) = &self.upstream_trusted_ca_file
            && !path.exists()
        {
            return Err(ErrorState::with_message(
                ProxyError::InvalidTrustedCertificatesFile,
                format!(
                    "upstream-trusted-ca-file does not exist: {}",
                    path.display()
                ),
            ));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            regular: self.timeout,
            tunnel: self.tunnel_timeout,
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn small_body_limit_is_rejected() {
        let options = Options {
            body_size_limit: 4096,
            ..Options::default()
        };
        let err = options.validate().unwrap_err();
        assert_eq!(err.proxy_error(), Some(ProxyError::InvalidOption));
    }

    #[test]
    fn thread_default_has_floor() {
        assert!(default_threads() >= 2);
    }
}
