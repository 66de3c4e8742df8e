//! Mesh certificate authority
//!
//! The gateway owns a self-signed ECDSA P-256 root, one server leaf for its
//! control endpoint, and a map of client leaves keyed by Common Name. Node
//! identities (CN = node id) and join-request identities (CN = request id)
//! are both client leaves issued from the same root.
//!
//! The CA is a plain value stored on the gateway's node row. Mutations are
//! persisted by whoever owns that row, inside the same transaction as the
//! change that caused them.

use crate::{Error, Result};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

const ROOT_COMMON_NAME: &str = "meshgate root CA";
const ORGANIZATION: &str = "meshgate";
const SERVER_VALIDITY_DAYS: i64 = 3650;

/// Client identity handed to a node: the root plus one client leaf and its key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientBundle {
    pub root_cert_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBundle")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl ClientBundle {
    /// rustls client config presenting this identity and trusting only the root
    pub fn client_tls_config(&self) -> Result<ClientConfig> {
        let roots = root_store(&self.root_cert_pem)?;
        let chain = vec![cert_der(&self.cert_pem)?];
        let key = key_der(&self.key_pem)?;

        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)?;
        Ok(config)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuedClient {
    cert_pem: String,
    key_pem: String,
    not_after: i64,
}

/// Root key pair, server leaf and issued client leaves
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthority {
    root_cert_pem: String,
    root_key_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
    server_names: Vec<String>,
    clients: BTreeMap<String, IssuedClient>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("server_names", &self.server_names)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CertificateAuthority {
    /// Create a new root and a server leaf covering `server_names`.
    ///
    /// Names that parse as IP addresses become IP SANs.
    pub fn generate(server_names: &[String], root_validity_days: u32) -> Result<Self> {
        if server_names.is_empty() {
            return Err(Error::Pki("at least one server name is required".into()));
        }

        let root_key = KeyPair::generate()?;
        let root_cert = root_params(i64::from(root_validity_days)).self_signed(&root_key)?;

        let server_key = KeyPair::generate()?;
        let mut params = leaf_params(server_names[0].as_str(), SERVER_VALIDITY_DAYS);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = server_names
            .iter()
            .map(|name| -> std::result::Result<SanType, rcgen::Error> {
                match name.parse::<IpAddr>() {
                    Ok(ip) => Ok(SanType::IpAddress(ip)),
                    Err(_) => Ok(SanType::DnsName(name.clone().try_into()?)),
                }
            })
            .collect::<std::result::Result<Vec<_>, rcgen::Error>>()?;
        let server_cert = params.signed_by(&server_key, &root_cert, &root_key)?;

        info!(server_names = ?server_names, "Generated mesh certificate authority");

        Ok(Self {
            root_cert_pem: root_cert.pem(),
            root_key_pem: root_key.serialize_pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            server_names: server_names.to_vec(),
            clients: BTreeMap::new(),
        })
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    /// Issue a client-auth leaf for `common_name`, replacing any previous one.
    pub fn add_client(&mut self, common_name: &str, validity_days: u32) -> Result<ClientBundle> {
        let (issuer, issuer_key) = self.issuer()?;

        let key = KeyPair::generate()?;
        let validity = i64::from(validity_days);
        let mut params = leaf_params(common_name, validity);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &issuer, &issuer_key)?;

        let issued = IssuedClient {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            not_after: (Utc::now() + Duration::days(validity)).timestamp(),
        };
        if self.clients.insert(common_name.to_string(), issued).is_some() {
            debug!(common_name, "Replaced existing client certificate");
        }

        self.public_bundle_for(common_name)
    }

    /// Forget the client leaf for `common_name`. Returns whether one existed.
    pub fn remove_client(&mut self, common_name: &str) -> bool {
        self.clients.remove(common_name).is_some()
    }

    pub fn has_client(&self, common_name: &str) -> bool {
        self.clients.contains_key(common_name)
    }

    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Bundle for an issued client: the root certificate only, never its key.
    pub fn public_bundle_for(&self, common_name: &str) -> Result<ClientBundle> {
        let issued = self
            .clients
            .get(common_name)
            .ok_or_else(|| Error::not_found("client certificate", common_name))?;
        Ok(ClientBundle {
            root_cert_pem: self.root_cert_pem.clone(),
            cert_pem: issued.cert_pem.clone(),
            key_pem: issued.key_pem.clone(),
        })
    }

    /// rustls server config that requires a client certificate chaining to the root
    pub fn server_tls_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = provider();
        let roots = Arc::new(root_store(&self.root_cert_pem)?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let chain = vec![cert_der(&self.server_cert_pem)?];
        let key = key_der(&self.server_key_pem)?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    /// Rebuild a signing certificate for the stored root key. The subject is
    /// fixed, so leaves issued from it chain to the original root.
    fn issuer(&self) -> Result<(Certificate, KeyPair)> {
        let key = KeyPair::from_pem(&self.root_key_pem)?;
        let cert = root_params(SERVER_VALIDITY_DAYS).self_signed(&key)?;
        Ok((cert, key))
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_params(validity_days: i64) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    set_validity(&mut params, validity_days);
    params
}

fn leaf_params(common_name: &str, validity_days: i64) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());
    set_validity(&mut params, validity_days);
    params
}

fn set_validity(params: &mut CertificateParams, validity_days: i64) {
    let today = Utc::now().date_naive();
    let ymd = |date: NaiveDate| {
        rcgen::date_time_ymd(date.year(), date.month() as u8, date.day() as u8)
    };
    params.not_before = ymd(today - Duration::days(1));
    params.not_after = ymd(today + Duration::days(validity_days));
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn cert_der(pem_str: &str) -> Result<CertificateDer<'static>> {
    let parsed = pem::parse(pem_str).map_err(|e| Error::Pki(format!("bad certificate PEM: {}", e)))?;
    Ok(CertificateDer::from(parsed.into_contents()))
}

fn key_der(pem_str: &str) -> Result<PrivateKeyDer<'static>> {
    let parsed = pem::parse(pem_str).map_err(|e| Error::Pki(format!("bad key PEM: {}", e)))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(parsed.into_contents())))
}

fn root_store(root_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.add(cert_der(root_pem)?)?;
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    fn der(pem_str: &str) -> Vec<u8> {
        ::pem::parse(pem_str).unwrap().into_contents()
    }

    fn common_name(cert: &X509Certificate<'_>) -> String {
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::generate(&["gw.example.net".into(), "203.0.113.7".into()], 3650)
            .unwrap()
    }

    #[test]
    fn test_generate_root_and_server_leaf() {
        let ca = test_ca();

        let root_der = der(ca.root_cert_pem());
        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        assert!(root.is_ca());
        assert_eq!(common_name(&root), ROOT_COMMON_NAME);

        let server_der = der(&ca.server_cert_pem);
        let (_, server) = X509Certificate::from_der(&server_der).unwrap();
        server.verify_signature(Some(root.public_key())).unwrap();

        let eku = server.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);
        assert!(!eku.client_auth);

        let san = server.subject_alternative_name().unwrap().unwrap().value;
        let names: Vec<String> = san
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(dns) => dns.to_string(),
                GeneralName::IPAddress(ip) => format!("{:?}", ip),
                other => format!("{:?}", other),
            })
            .collect();
        assert!(names.contains(&"gw.example.net".to_string()));
        assert!(names.contains(&format!("{:?}", &[203u8, 0, 113, 7][..])));
    }

    #[test]
    fn test_generate_requires_a_name() {
        assert!(matches!(
            CertificateAuthority::generate(&[], 30),
            Err(Error::Pki(_))
        ));
    }

    #[test]
    fn test_client_lifecycle() {
        let mut ca = test_ca();

        // A fresh CA has issued nothing
        assert!(matches!(
            ca.public_bundle_for("node-a"),
            Err(Error::NotFound { .. })
        ));

        let bundle = ca.add_client("node-a", 30).unwrap();
        assert!(ca.has_client("node-a"));
        assert_eq!(bundle.root_cert_pem, ca.root_cert_pem());
        assert!(!bundle.root_cert_pem.contains("PRIVATE KEY"));
        assert_eq!(ca.public_bundle_for("node-a").unwrap(), bundle);

        // Re-adding overwrites with a new leaf
        let again = ca.add_client("node-a", 30).unwrap();
        assert_ne!(again.cert_pem, bundle.cert_pem);
        assert_eq!(ca.client_names().count(), 1);

        // Removal is idempotent
        assert!(ca.remove_client("node-a"));
        assert!(!ca.remove_client("node-a"));
        assert!(!ca.has_client("node-a"));
    }

    #[test]
    fn test_client_leaf_chains_to_root() {
        let mut ca = test_ca();
        let bundle = ca.add_client("6f1c1f5e-node", 3650).unwrap();

        let root_der = der(ca.root_cert_pem());
        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        let leaf_der = der(&bundle.cert_pem);
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();

        leaf.verify_signature(Some(root.public_key())).unwrap();
        assert_eq!(leaf.issuer(), root.subject());
        assert_eq!(common_name(&leaf), "6f1c1f5e-node");
        assert!(!leaf.is_ca());

        let eku = leaf.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.client_auth);
        assert!(!eku.server_auth);
    }

    #[test]
    fn test_ca_survives_serialization() {
        let mut ca = test_ca();
        ca.add_client("before", 30).unwrap();

        let json = serde_json::to_string(&ca).unwrap();
        let mut restored: CertificateAuthority = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, ca);

        // Leaves issued after a reload still chain to the original root
        let bundle = restored.add_client("after", 30).unwrap();
        let root_der = der(ca.root_cert_pem());
        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        let leaf_der = der(&bundle.cert_pem);
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        leaf.verify_signature(Some(root.public_key())).unwrap();
    }

    #[test]
    fn test_tls_configs_build() {
        let mut ca = test_ca();
        let bundle = ca.add_client("node-b", 30).unwrap();

        let server = ca.server_tls_config().unwrap();
        assert!(server.alpn_protocols.contains(&b"http/1.1".to_vec()));
        bundle.client_tls_config().unwrap();
    }

    #[test]
    fn test_debug_redacts_keys() {
        let mut ca = test_ca();
        let bundle = ca.add_client("node-c", 30).unwrap();
        assert!(!format!("{:?}", bundle).contains("PRIVATE KEY"));
        assert!(!format!("{:?}", ca).contains("PRIVATE KEY"));
    }
}
