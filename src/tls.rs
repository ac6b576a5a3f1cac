//! TLS support for the WSS listener and WSS data channels
//!
//! Loads one certificate chain and private key with rustls.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::conn::BoxedIo;

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Load private key from a PEM file
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Build an acceptor from a certificate chain and key
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept TLS on the stream if an acceptor is configured
pub async fn accept_tls(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> anyhow::Result<BoxedIo> {
    match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            Ok(Box::new(tls_stream))
        }
        None => Ok(Box::new(stream)),
    }
}
