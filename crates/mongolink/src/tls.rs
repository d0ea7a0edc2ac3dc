//! TLS client setup for server connections

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use mongolink_common::{NetworkError, Result, TlsConfig};

/// Build a connector trusting the webpki roots plus any configured CA bundle
pub fn build_connector(config: &TlsConfig) -> Result<TlsConnector> {
    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_file {
        let certs = load_certs(Path::new(path))?;
        debug!(path = %path, count = certs.len(), "loaded CA certificates");
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| NetworkError::TlsError(format!("invalid CA certificate in {path}: {e}")))?;
        }
    }

    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client)))
}

/// Name to verify the server certificate against
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| NetworkError::TlsError(format!("invalid server name: {host}")).into())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        NetworkError::TlsError(format!("failed to open CA file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| NetworkError::TlsError(format!("failed to parse CA file: {e}")))?;
    if certs.is_empty() {
        return Err(NetworkError::TlsError(format!(
            "no certificates found in {}",
            path.display()
        ))
        .into());
    }
    Ok(certs)
}
