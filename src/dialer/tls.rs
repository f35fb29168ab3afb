//! Shared rustls configuration builders for dialers and listeners.

use std::{fs::File, io::BufReader, sync::Arc};

use n0_error::{Result, StackResultExt, StdResultExt};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};

/// Client config trusting the webpki root set, with the given ALPN list.
pub(crate) fn client_config(alpn: &[&[u8]], insecure: bool) -> Arc<ClientConfig> {
    let mut config = if insecure {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(webpki_roots())
            .with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Client config with a private root CA and a client certificate (mTLS).
pub(crate) fn client_mtls_config(
    alpn: &[&[u8]],
    ca_file: &str,
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_file)? {
        roots.add(cert).std_context("invalid CA certificate")?;
    }
    let certs = read_certs(cert_file)?;
    let key = read_key(key_file)?;
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .std_context("invalid client certificate")?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Server config from PEM key/cert files with the given ALPN list.
///
/// An empty `certfile` falls back to `keyfile`, which then must carry both
/// the certificate chain and the key.
pub fn server_config(
    keyfile: &str,
    certfile: &str,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>> {
    let certfile = if certfile.is_empty() { keyfile } else { certfile };
    let certs = read_certs(certfile)?;
    let key = read_key(keyfile)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .std_context("invalid server certificate")?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

pub(crate) fn webpki_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).std_context("invalid TLS server name")
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).std_context(format!("failed to open {path}"))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .std_context(format!("invalid certificates in {path}"))
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).std_context(format!("failed to open {path}"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .std_context(format!("invalid private key in {path}"))?
        .context(format!("no private key found in {path}"))
}

/// Verifier that accepts any server certificate. Used only when a dialer
/// URL opts in with `insecure=true`.
#[derive(Debug)]
struct NoVerify(Arc<rustls::crypto::CryptoProvider>);

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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
