//! TLS client configuration.

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{MfluxError, Result};

/// Client configuration trusting the bundled webpki root certificates.
pub fn default_client_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| MfluxError::Tls(format!("client config error: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Connector built from [`default_client_config`].
pub fn default_connector() -> Result<TlsConnector> {
    Ok(TlsConnector::from(default_client_config()?))
}
