#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod alpn;
pub mod crypto;
pub mod tls;

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, SerialNumber,
};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, pem::PemObject},
};
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace, warn};

use crate::crypto::init_crypto;

static CA_BUNDLE_FILE: &str = "wiretap-ca.pem";
static CA_CERT_FILE: &str = "wiretap-ca-cert.pem";

/// Subject and validity defaults applied to the issuer and to every leaf it
/// signs, normally sourced from the certificate-store properties file.
#[derive(Debug, Clone)]
pub struct IssuerProperties {
    pub common_name: String,
    pub organization: String,
    pub country: String,
    pub validity_days: i64,
}

impl Default for IssuerProperties {
    fn default() -> Self {
        Self {
            common_name: "wiretap".to_string(),
            organization: "wiretap".to_string(),
            country: "US".to_string(),
            validity_days: 365,
        }
    }
}

/// Parameters for one forged leaf certificate.
#[derive(Debug, Clone)]
pub struct LeafSpec {
    pub common_name: String,
    pub subject_alt_names: Vec<String>,
    pub organization: Option<String>,
    pub country: Option<String>,
    pub serial: u64,
    pub validity_days: i64,
}

#[derive(Debug, Clone)]
pub struct WiretapCA {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    issuer: Issuer<'static, KeyPair>,
    roots: Arc<RootCertStore>,
    ca_der: Vec<u8>,
    ca_pem: String,
}

impl WiretapCA {
    pub fn roots(&self) -> Arc<RootCertStore> {
        self.inner.roots.clone()
    }

    pub fn ca_der(&self) -> &[u8] {
        &self.inner.ca_der
    }

    pub fn ca_pem(&self) -> &str {
        &self.inner.ca_pem
    }

    /// Sign one leaf. Every subject alternative name is added as a DNS SAN;
    /// callers are expected to have folded the common name into the SAN set.
    pub fn sign_leaf(&self, spec: &LeafSpec) -> Result<(Certificate, KeyPair), rcgen::Error> {
        let mut params = CertificateParams::new(spec.subject_alt_names.clone())?;

        params
            .distinguished_name
            .push(DnType::CommonName, &spec.common_name);
        if let Some(org) = &spec.organization {
            params.distinguished_name.push(DnType::OrganizationName, org);
        }
        if let Some(country) = &spec.country {
            params.distinguished_name.push(DnType::CountryName, country);
        }
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(spec.serial));
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(spec.validity_days));

        let key_pair = KeyPair::generate()?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;

        Ok((leaf, key_pair))
    }
}

fn load_native_certs(extra: Option<CertificateDer<'static>>) -> RootCertStore {
    let mut roots = rustls::RootCertStore::empty();

    let cert_result = rustls_native_certs::load_native_certs();

    for err in cert_result.errors.iter() {
        warn!("Load cert error {err}");
    }

    for cert in cert_result.certs {
        if let Err(e) = roots.add(cert) {
            warn!("failed to parse trust anchor: {}", e);
        }
    }

    if let Some(extra) = extra
        && let Err(err) = roots.add(extra)
    {
        warn!("Error adding extra cert {err}");
    }
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    roots
}

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    RustLS(rustls::Error),
    RustLSPem(rustls::pki_types::pem::Error),
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<rustls::Error> for CaError {
    fn from(value: rustls::Error) -> Self {
        CaError::RustLS(value)
    }
}

impl From<rustls::pki_types::pem::Error> for CaError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        CaError::RustLSPem(value)
    }
}

/// Load the issuer key and certificate from `dir`, generating and persisting
/// them on first use. The PEM bundle doubles as the browser-importable root.
pub fn load_or_generate_ca(dir: &Path, props: &IssuerProperties) -> Result<WiretapCA, CaError> {
    init_crypto();
    fs::create_dir_all(dir)?;

    let bundle_path = dir.join(CA_BUNDLE_FILE);
    let cert_path = dir.join(CA_CERT_FILE);

    let (issuer, ca_cert, ca_pem) = if bundle_path.exists() && cert_path.exists() {
        trace!("wiretap root CA already exists at {}", dir.display());

        let pem = std::fs::read_to_string(&bundle_path)?;
        let key_pair = rcgen::KeyPair::from_pem(pem.as_str())?;

        let ca_cert_pem = std::fs::read_to_string(&cert_path)?;
        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, key_pair)?;

        let ca_der = CertificateDer::from_pem_file(&bundle_path)?;

        (issuer, ca_der, ca_cert_pem)
    } else {
        generate(props, &bundle_path, &cert_path)?
    };

    let ca_der = ca_cert.to_vec();
    let roots = load_native_certs(Some(ca_cert));

    Ok(WiretapCA {
        inner: Arc::new(Inner {
            issuer,
            roots: Arc::new(roots),
            ca_der,
            ca_pem,
        }),
    })
}

fn generate(
    props: &IssuerProperties,
    bundle_path: &PathBuf,
    cert_path: &PathBuf,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String), CaError> {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(DnType::CountryName, &props.country);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, &props.common_name);
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, &props.organization);

    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

    ca_params.not_before = OffsetDateTime::now_utc();
    ca_params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365 * 10));

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let ca_cert = ca_params.self_signed(&key_pair)?;

    let cert_pem = ca_cert.pem();
    let key_pem = key_pair.serialize_pem();

    let bundle = format!("{}\n{}", key_pem.trim_end(), cert_pem.trim_end());
    fs::write(bundle_path, bundle)?;
    fs::write(cert_path, &cert_pem)?;

    debug!("wiretap root CA generated:");
    debug!("Bundle path {}", bundle_path.display());
    debug!("Cert path {}", cert_path.display());
    debug!("Import the cert PEM into your browser/system as a trusted root CA.");

    let issuer = Issuer::new(ca_params, key_pair);
    Ok((issuer, ca_cert.der().clone(), cert_pem))
}
