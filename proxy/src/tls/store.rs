use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, warn};
use wiretap_shared::{IssuerProperties, LeafSpec, WiretapCA};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{ErrorState, ProxyError};

const SERIAL_FILE: &str = "serial";

/// Cache key for forged leaves: the set of names a certificate must cover.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateIdentity {
    pub common_name: Option<String>,
    pub sans: BTreeSet<String>,
    pub organization: Option<String>,
    pub country: Option<String>,
}

impl CertificateIdentity {
    /// Canonical form; identities with equal canonical form share a leaf.
    pub fn canonical_key(&self) -> String {
        let mut key = String::new();
        key.push_str("cn=");
        key.push_str(self.common_name.as_deref().unwrap_or(""));
        for san in &self.sans {
            key.push_str(";san=");
            key.push_str(san);
        }
        if let Some(org) = &self.organization {
            key.push_str(";o=");
            key.push_str(org);
        }
        if let Some(country) = &self.country {
            key.push_str(";c=");
            key.push_str(country);
        }
        key
    }

    /// Fold the upstream certificate's SANs and subject CN into the
    /// identity, as observed after the upstream handshake.
    pub fn absorb_upstream_cert(&mut self, cert_der: &CertificateDer<'_>) {
        let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
            warn!("Could not parse upstream certificate");
            return;
        };

        if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
            for name in &san_ext.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    self.sans.insert(dns.to_string());
                }
            }
        }

        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            self.sans.insert(cn.to_string());
            if self.common_name.is_none() {
                self.common_name = Some(cn.to_string());
            }
        }

        if self.organization.is_none()
            && let Some(org) = cert
                .subject()
                .iter_organization()
                .next()
                .and_then(|o| o.as_str().ok())
        {
            self.organization = Some(org.to_string());
        }
    }
}

/// A minted leaf plus everything needed to serve it.
#[derive(Debug)]
pub struct ForgedCertificate {
    pub cert: CertificateDer<'static>,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub chain_file: PathBuf,
}

impl ForgedCertificate {
    pub fn clone_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

/// Default subject values applied when an identity leaves them unset, read
/// from the store's properties file.
#[derive(Debug, Clone, Default)]
pub struct StoreProperties {
    pub issuer: IssuerProperties,
}

impl StoreProperties {
    /// `key=value` lines; `#` starts a comment. Unknown keys are ignored.
    pub fn from_file(path: &Path) -> Result<Self, ErrorState> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ErrorState::with_message(
                ProxyError::SslServerStoreCreationError,
                format!("could not read {}: {err}", path.display()),
            )
        })?;
        let mut props = StoreProperties::default();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "common-name" => props.issuer.common_name = value.to_string(),
                "organization" => props.issuer.organization = value.to_string(),
                "country" => props.issuer.country = value.to_string(),
                "validity-days" => {
                    props.issuer.validity_days = value.parse().map_err(|_| {
                        ErrorState::with_message(
                            ProxyError::SslServerStoreCreationError,
                            format!("invalid validity-days value: {value}"),
                        )
                    })?;
                }
                _ => {}
            }
        }
        Ok(props)
    }
}

/// Process-wide issuer-signed leaf factory. Lookups run concurrently over
/// the in-memory cache; minting is serialised so one identity is never
/// issued twice.
#[derive(Debug)]
pub struct ServerStore {
    ca: WiretapCA,
    dir: PathBuf,
    props: StoreProperties,
    cache: DashMap<String, Arc<ForgedCertificate>>,
    mint_lock: Mutex<()>,
    serial: AtomicU64,
    strong_serials: bool,
}

impl ServerStore {
    pub fn open(
        ca: WiretapCA,
        dir: PathBuf,
        props: StoreProperties,
        strong_serials: bool,
    ) -> Result<Self, ErrorState> {
        fs::create_dir_all(&dir).map_err(|err| {
            ErrorState::with_message(
                ProxyError::SslServerStoreCreationError,
                format!("could not create {}: {err}", dir.display()),
            )
        })?;

        let serial_path = dir.join(SERIAL_FILE);
        let serial = match fs::read_to_string(&serial_path) {
            Ok(raw) => raw.trim().parse::<u64>().unwrap_or(0),
            Err(_) => 0,
        };

        Ok(ServerStore {
            ca,
            dir,
            props,
            cache: DashMap::new(),
            mint_lock: Mutex::new(()),
            serial: AtomicU64::new(serial),
            strong_serials,
        })
    }

    pub fn ca(&self) -> &WiretapCA {
        &self.ca
    }

    pub fn get(&self, identity: &CertificateIdentity) -> Option<Arc<ForgedCertificate>> {
        self.cache
            .get(&identity.canonical_key())
            .map(|entry| entry.value().clone())
    }

    /// Mint a leaf for the identity, or return the cached one if another
    /// flow won the race. One mint runs at a time.
    pub fn create(
        &self,
        identity: &CertificateIdentity,
    ) -> Result<Arc<ForgedCertificate>, ErrorState> {
        let _guard = self.mint_lock.lock().map_err(|_| {
            ErrorState::with_message(ProxyError::CertificateCreationError, "mint lock poisoned")
        })?;

        let key = identity.canonical_key();
        if let Some(existing) = self.cache.get(&key) {
            return Ok(existing.value().clone());
        }

        let serial = self.next_serial()?;
        let common_name = identity
            .common_name
            .clone()
            .or_else(|| identity.sans.iter().next().cloned())
            .ok_or_else(|| {
                ErrorState::with_message(
                    ProxyError::CertificateSubjectNotFound,
                    "identity has no common name or subject alternative names",
                )
            })?;

        let mut sans: BTreeSet<String> = identity.sans.clone();
        sans.insert(common_name.clone());

        let spec = LeafSpec {
            common_name: common_name.clone(),
            subject_alt_names: sans.into_iter().collect(),
            organization: identity
                .organization
                .clone()
                .or_else(|| Some(self.props.issuer.organization.clone())),
            country: identity
                .country
                .clone()
                .or_else(|| Some(self.props.issuer.country.clone())),
            serial,
            validity_days: self.props.issuer.validity_days,
        };

        let (leaf, key_pair) = self.ca.sign_leaf(&spec).map_err(|err| {
            ErrorState::with_message(
                ProxyError::CertificateCreationError,
                format!("signing leaf for {common_name}: {err}"),
            )
        })?;

        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|err| {
            ErrorState::with_message(
                ProxyError::CertificateCreationError,
                format!("serializing leaf key: {err}"),
            )
        })?;

        let chain_file = self.dir.join(Self::chain_file_name(&common_name, serial));
        if let Err(err) = fs::write(&chain_file, format!("{}{}", leaf.pem(), self.ca.ca_pem())) {
            warn!("Could not persist forged chain {}: {err}", chain_file.display());
        }

        let forged = Arc::new(ForgedCertificate {
            cert: leaf.der().clone(),
            chain: vec![
                leaf.der().clone(),
                CertificateDer::from(self.ca.ca_der().to_vec()),
            ],
            key: key_der,
            chain_file,
        });

        debug!("Minted leaf #{serial} for {common_name}");
        self.cache.insert(key, forged.clone());
        Ok(forged)
    }

    fn next_serial(&self) -> Result<u64, ErrorState> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        if self.strong_serials {
            let path = self.dir.join(SERIAL_FILE);
            fs::write(&path, serial.to_string()).map_err(|err| {
                ErrorState::with_message(
                    ProxyError::CertificateCreationError,
                    format!("could not checkpoint serial counter: {err}"),
                )
            })?;
        }
        Ok(serial)
    }

    fn chain_file_name(common_name: &str, serial: u64) -> String {
        let sanitized: String = common_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{sanitized}-{serial}.pem")
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_shared::load_or_generate_ca;

    fn test_store(strong: bool) -> (tempfile::TempDir, ServerStore) {
        let dir = tempfile::tempdir().unwrap();
        let ca = load_or_generate_ca(dir.path(), &IssuerProperties::default()).unwrap();
        let store = ServerStore::open(
            ca,
            dir.path().join("certs"),
            StoreProperties::default(),
            strong,
        )
        .unwrap();
        (dir, store)
    }

    fn identity(names: &[&str]) -> CertificateIdentity {
        CertificateIdentity {
            common_name: names.first().map(|s| s.to_string()),
            sans: names.iter().map(|s| s.to_string()).collect(),
            organization: None,
            country: None,
        }
    }

    #[test]
    fn canonical_key_is_order_insensitive() {
        let mut a = CertificateIdentity::default();
        a.sans.insert("b.test".to_string());
        a.sans.insert("a.test".to_string());

        let mut b = CertificateIdentity::default();
        b.sans.insert("a.test".to_string());
        b.sans.insert("b.test".to_string());

        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn equal_identities_share_a_certificate() {
        let (_dir, store) = test_store(false);
        let id = identity(&["example.test", "www.example.test"]);

        assert!(store.get(&id).is_none());
        let first = store.create(&id).unwrap();
        let cached = store.get(&id).unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        // A second create returns the cached leaf instead of reminting.
        let second = store.create(&id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn serials_are_unique_across_mints() {
        let (_dir, store) = test_store(false);
        let a = store.create(&identity(&["a.test"])).unwrap();
        let b = store.create(&identity(&["b.test"])).unwrap();

        let (_, cert_a) = x509_parser::parse_x509_certificate(&a.cert).unwrap();
        let (_, cert_b) = x509_parser::parse_x509_certificate(&b.cert).unwrap();
        assert_ne!(cert_a.serial, cert_b.serial);
    }

    #[test]
    fn strong_serials_checkpoint_to_disk() {
        let (dir, store) = test_store(true);
        store.create(&identity(&["a.test"])).unwrap();
        store.create(&identity(&["b.test"])).unwrap();

        let raw = fs::read_to_string(dir.path().join("certs").join(SERIAL_FILE)).unwrap();
        assert_eq!(raw.trim(), "2");
    }

    #[test]
    fn concurrent_mint_issues_once() {
        let (_dir, store) = test_store(false);
        let store = Arc::new(store);
        let id = identity(&["raced.test"]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let id = id.clone();
            handles.push(std::thread::spawn(move || store.create(&id).unwrap()));
        }
        let minted: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &minted[1..] {
            assert!(Arc::ptr_eq(&minted[0], other));
        }
    }

    #[test]
    fn chain_file_is_persisted() {
        let (_dir, store) = test_store(false);
        let forged = store.create(&identity(&["persisted.test"])).unwrap();
        assert!(forged.chain_file.exists());
        let pem = fs::read_to_string(&forged.chain_file).unwrap();
        assert!(pem.matches("BEGIN CERTIFICATE").count() >= 2);
    }

    #[test]
    fn properties_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certificate.properties");
        fs::write(
            &path,
            "# defaults\ncommon-name = forged\norganization=acme\ncountry=DE\nvalidity-days=90\n",
        )
        .unwrap();

        let props = StoreProperties::from_file(&path).unwrap();
        assert_eq!(props.issuer.common_name, "forged");
        assert_eq!(props.issuer.organization, "acme");
        assert_eq!(props.issuer.country, "DE");
        assert_eq!(props.issuer.validity_days, 90);
    }
}
