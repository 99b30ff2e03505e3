//! TLS bootstrap (§6 `[FULL]`): load a configured cert/key pair, or generate
//! and persist a self-signed one, exactly as the donor crate's `tls.rs` does
//! for its own HTTP boundary.

use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

const STATE_DIR: &str = "/var/lib/relay-sfu";

/// Build a `rustls::ServerConfig` from either configured cert/key paths or a
/// generated (and persisted, so restarts don't re-roll it) self-signed pair.
pub fn build_tls_config(cert_path: Option<&str>, key_path: Option<&str>) -> Result<ServerConfig> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_certs_from_files(cert, key)?,
        _ => load_or_generate_self_signed()?,
    };

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")
}

fn load_or_generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem_path = format!("{STATE_DIR}/server-cert.pem");
    let key_pem_path = format!("{STATE_DIR}/server-key.pem");

    if std::path::Path::new(&cert_pem_path).exists() && std::path::Path::new(&key_pem_path).exists()
    {
        match load_certs_from_files(&cert_pem_path, &key_pem_path) {
            Ok(pair) => {
                tracing::info!("Loaded existing self-signed cert from {cert_pem_path}");
                return Ok(pair);
            }
            Err(err) => {
                tracing::warn!("Existing self-signed cert invalid, regenerating: {err}");
            }
        }
    }

    std::fs::create_dir_all(STATE_DIR).context("Failed to create TLS state directory")?;
    let (certs, priv_key) = generate_self_signed()?;

    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", certs[0].to_vec()));
    std::fs::write(&cert_pem_path, cert_pem.as_bytes()).context("Failed to write self-signed cert")?;

    let key_bytes = match &priv_key {
        PrivateKeyDer::Pkcs8(k) => k.secret_pkcs8_der(),
        _ => unreachable!("we always generate PKCS8"),
    };
    let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key_bytes.to_vec()));
    {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_pem_path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(key_pem.as_bytes())
            })
            .context("Failed to write self-signed key")?;
    }

    tracing::info!("Generated self-signed cert: {cert_pem_path} + {key_pem_path}");
    Ok((certs, priv_key))
}

fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    tracing::info!("Loaded TLS cert from {cert_path}");
    Ok((certs, key))
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    tracing::info!("Generating self-signed TLS certificate for localhost");

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("Failed to create certificate params")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::LOCALHOST,
        )));
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V6(
            std::net::Ipv6Addr::LOCALHOST,
        )));

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}
