use std::{path::Path, sync::Arc};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
    version::{TLS12, TLS13},
};
use tracing::{trace, warn};

use crate::crypto::init_crypto;

/// Protocol-version selection for one side of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMethod {
    /// Negotiate any supported version (TLS 1.2 or 1.3).
    #[default]
    Sslv23,
    Tlsv1_2,
    Tlsv1_3,
}

impl SslMethod {
    /// Recognises the configuration spellings; versions below TLS 1.2 are
    /// not supported by rustls and are reported back to the caller.
    pub fn parse(value: &str) -> Result<SslMethod, String> {
        match value {
            "sslv23" => Ok(SslMethod::Sslv23),
            "tlsv1.2" => Ok(SslMethod::Tlsv1_2),
            "tlsv1.3" => Ok(SslMethod::Tlsv1_3),
            other => Err(other.to_string()),
        }
    }

    pub fn versions(&self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        const SSLV23: &[&rustls::SupportedProtocolVersion] = &[&TLS13, &TLS12];
        const TLSV1_2: &[&rustls::SupportedProtocolVersion] = &[&TLS12];
        const TLSV1_3: &[&rustls::SupportedProtocolVersion] = &[&TLS13];
        match self {
            SslMethod::Sslv23 => SSLV23,
            SslMethod::Tlsv1_2 => TLSV1_2,
            SslMethod::Tlsv1_3 => TLSV1_3,
        }
    }
}

#[derive(Debug)]
pub enum TlsSetupError {
    Rustls(rustls::Error),
    InvalidTrustedCertificatesFile(std::io::Error),
    Pem(rustls::pki_types::pem::Error),
}

impl std::error::Error for TlsSetupError {}

impl std::fmt::Display for TlsSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<rustls::Error> for TlsSetupError {
    fn from(value: rustls::Error) -> Self {
        TlsSetupError::Rustls(value)
    }
}

impl From<rustls::pki_types::pem::Error> for TlsSetupError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        TlsSetupError::Pem(value)
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    crypto_provider: Arc<CryptoProvider>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        init_crypto();
        let provider = rustls::crypto::ring::default_provider();
        TlsConfig::from_provider(provider)
    }
}

impl TlsConfig {
    pub fn from_provider(provider: CryptoProvider) -> Self {
        Self {
            crypto_provider: Arc::new(provider),
        }
    }

    pub fn crypto_provider(&self) -> Arc<CryptoProvider> {
        self.crypto_provider.clone()
    }

    /// Client-side config for the upstream handshake. When `mirror_ciphers`
    /// carries the client's offered suite ids, the provider is narrowed to
    /// the intersection so the upstream settles on a suite the client named.
    pub fn upstream_client_config(
        &self,
        method: SslMethod,
        verify: bool,
        roots: Arc<RootCertStore>,
        alpn_protocols: Vec<Vec<u8>>,
        mirror_ciphers: Option<&[u16]>,
    ) -> Result<ClientConfig, TlsSetupError> {
        let provider = self.provider_for_ciphers(mirror_ciphers);

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(method.versions())?;

        let mut config = if verify {
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(
                    self.crypto_provider.clone(),
                )))
                .with_no_client_auth()
        };

        config.enable_sni = true;
        config.alpn_protocols = alpn_protocols;
        Ok(config)
    }

    /// Server-side config presented to the intercepted client. Verification
    /// is never requested from the client.
    pub fn interception_server_config(
        &self,
        method: SslMethod,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<ServerConfig, TlsSetupError> {
        let mut config = ServerConfig::builder_with_provider(self.crypto_provider.clone())
            .with_protocol_versions(method.versions())?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        config.alpn_protocols = alpn_protocols;
        Ok(config)
    }

    fn provider_for_ciphers(&self, mirror_ciphers: Option<&[u16]>) -> Arc<CryptoProvider> {
        let Some(ids) = mirror_ciphers else {
            return self.crypto_provider.clone();
        };

        let suites: Vec<SupportedCipherSuite> = self
            .crypto_provider
            .cipher_suites
            .iter()
            .filter(|cs| ids.contains(&u16::from(cs.suite())))
            .copied()
            .collect();

        if suites.is_empty() {
            warn!("No overlap with client cipher suites, using provider defaults");
            return self.crypto_provider.clone();
        }

        Arc::new(CryptoProvider {
            cipher_suites: suites,
            kx_groups: self.crypto_provider.kx_groups.clone(),
            signature_verification_algorithms: self
                .crypto_provider
                .signature_verification_algorithms,
            secure_random: self.crypto_provider.secure_random,
            key_provider: self.crypto_provider.key_provider,
        })
    }
}

/// Read a trusted-CA bundle for upstream verification.
pub fn roots_from_pem_file(path: &Path) -> Result<RootCertStore, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(path)? {
        roots.add(cert?)?;
    }
    Ok(roots)
}

/// Upstream verifier used when `ssl-verify` is off. Signatures are still
/// checked so the captured certificate data is coherent.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        trace!("Accepting server certificate for: {:?}", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_method_parsing() {
        assert_eq!(SslMethod::parse("sslv23").unwrap(), SslMethod::Sslv23);
        assert_eq!(SslMethod::parse("tlsv1.2").unwrap(), SslMethod::Tlsv1_2);
        assert_eq!(SslMethod::parse("tlsv1.3").unwrap(), SslMethod::Tlsv1_3);
        assert!(SslMethod::parse("tlsv1.1").is_err());
        assert!(SslMethod::parse("dtls").is_err());
    }

    #[test]
    fn cipher_mirroring_narrows_provider() {
        let config = TlsConfig::default();
        let all = config.crypto_provider();
        let first = u16::from(all.cipher_suites[0].suite());

        let narrowed = config.provider_for_ciphers(Some(&[first]));
        assert_eq!(narrowed.cipher_suites.len(), 1);
        assert_eq!(u16::from(narrowed.cipher_suites[0].suite()), first);
    }

    #[test]
    fn empty_cipher_overlap_falls_back_to_defaults() {
        let config = TlsConfig::default();
        let narrowed = config.provider_for_ciphers(Some(&[0x0000]));
        assert_eq!(
            narrowed.cipher_suites.len(),
            config.crypto_provider().cipher_suites.len()
        );
    }
}
