//! Certificate loading for the gRPC listeners and clients.
//!
//! A cert dir holds `ca.crt`, `node.crt` and `node.key` in PEM form. Both
//! listeners (raft transport and time/admin) share one identity; peers
//! verify each other against the CA.

use std::path::Path;

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::error::{KronosError, Result};

const CA_CERT_FILE: &str = "ca.crt";
const NODE_CERT_FILE: &str = "node.crt";
const NODE_KEY_FILE: &str = "node.key";

async fn read_pem(cert_dir: &Path, name: &str) -> Result<String> {
    let path = cert_dir.join(name);
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        KronosError::Config(format!("failed to read {}: {}", path.display(), e))
    })
}

pub async fn server_tls_config(cert_dir: &Path) -> Result<ServerTlsConfig> {
    let cert = read_pem(cert_dir, NODE_CERT_FILE).await?;
    let key = read_pem(cert_dir, NODE_KEY_FILE).await?;
    let ca = read_pem(cert_dir, CA_CERT_FILE).await?;

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

pub async fn client_tls_config(cert_dir: &Path) -> Result<ClientTlsConfig> {
    let cert = read_pem(cert_dir, NODE_CERT_FILE).await?;
    let key = read_pem(cert_dir, NODE_KEY_FILE).await?;
    let ca = read_pem(cert_dir, CA_CERT_FILE).await?;

    Ok(ClientTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .ca_certificate(Certificate::from_pem(ca)))
}

/// Client TLS for the configured transport security; `None` means plaintext.
pub async fn client_tls_for(
    insecure: bool,
    cert_dir: Option<&Path>,
) -> Result<Option<ClientTlsConfig>> {
    if insecure {
        return Ok(None);
    }
    let cert_dir = cert_dir.ok_or_else(|| {
        KronosError::Config("TLS requested but no --cert-dir given".to_string())
    })?;
    Ok(Some(client_tls_config(cert_dir).await?))
}
