//! Shared TLS plumbing for the stream transports
//!
//! All links carry TLS 1.3. Server certificates come from PEM files named in
//! the listener config; mutual TLS is enabled by the presence of a client CA.
//! Dialling agents verify against a configured CA bundle or the webpki roots.

use crate::config::{ListenerConfig, PeerTlsConfig};
use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

/// Load a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parsing key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn root_store_from(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).with_context(|| format!("adding CA from {}", path.display()))?;
    }
    Ok(roots)
}

/// Build the rustls server config for a listener. A configured
/// `tls_client_ca` turns on mutual TLS.
pub fn server_config(listener: &ListenerConfig) -> Result<ServerConfig> {
    let cert_path = listener
        .tls_cert
        .as_ref()
        .ok_or_else(|| anyhow!("listener {} has no tls_cert", listener.bind))?;
    let key_path = listener
        .tls_key
        .as_ref()
        .ok_or_else(|| anyhow!("listener {} has no tls_key", listener.bind))?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = match &listener.tls_client_ca {
        Some(ca_path) => {
            let roots = root_store_from(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| anyhow!("building client verifier: {}", e))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    };
    Ok(config)
}

/// Build the rustls client config for dialling one peer.
pub fn client_config(tls: &PeerTlsConfig) -> Result<ClientConfig> {
    let builder = if tls.insecure_skip_verify {
        log::warn!("[tls] certificate verification disabled for this peer");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
    } else {
        let roots = match &tls.ca {
            Some(ca_path) => root_store_from(ca_path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            builder.with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(anyhow!("client_cert and client_key must be set together")),
    };
    Ok(config)
}

/// The name used for SNI and certificate verification: the configured
/// override, or the host part of the dial address.
pub fn server_name(tls: &PeerTlsConfig, host: &str) -> Result<ServerName<'static>> {
    let name = tls.server_name.as_deref().unwrap_or(host);
    ServerName::try_from(name.to_string()).map_err(|e| anyhow!("invalid server name '{}': {}", name, e))
}

/// Certificate verifier that accepts anything. Lab use only, gated behind
/// the `insecure_skip_verify` peer option.
#[derive(Debug)]
struct NoVerify {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl NoVerify {
    fn new() -> Self {
        Self { provider: Arc::new(rustls::crypto::ring::default_provider()) }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn write_self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_server_config_from_pem() {
        let dir = std::env::temp_dir().join(format!("overmesh-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let (cert_path, key_path) = write_self_signed(&dir);

        let listener = ListenerConfig {
            transport: TransportKind::Ws,
            bind: "127.0.0.1:0".parse().unwrap(),
            tls_cert: Some(cert_path),
            tls_key: Some(key_path),
            tls_client_ca: None,
            path: "/mesh".into(),
            plaintext: false,
        };
        assert!(server_config(&listener).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_client_config_default_roots() {
        let tls = PeerTlsConfig::default();
        assert!(client_config(&tls).is_ok());
        assert!(server_name(&tls, "relay.example.com").is_ok());
    }

    #[test]
    fn test_client_cert_without_key_rejected() {
        let tls = PeerTlsConfig {
            client_cert: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(client_config(&tls).is_err());
    }
}
