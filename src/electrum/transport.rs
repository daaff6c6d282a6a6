use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{ElectrumConfig, Transport};
use crate::error::WalletError;

/// Byte stream to the node, plain or TLS
pub trait NodeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NodeStream for T {}

/// Open a connection to the configured node
pub async fn open(config: &ElectrumConfig) -> Result<Box<dyn NodeStream>, WalletError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| WalletError::Network(format!("connect {}: {}", config.endpoint(), e)))?;
    tcp.set_nodelay(true).ok();

    match config.transport {
        Transport::Tcp => Ok(Box::new(tcp)),
        Transport::Tls => {
            let connector = TlsConnector::from(Arc::new(tls_config()?));
            let server_name = ServerName::try_from(config.host.clone())
                .map_err(|e| WalletError::Network(format!("invalid server name: {}", e)))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| WalletError::Network(format!("TLS handshake with {}: {}", config.endpoint(), e)))?;
            Ok(Box::new(tls))
        }
    }
}

fn tls_config() -> Result<ClientConfig, WalletError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| WalletError::Internal(format!("TLS setup: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}
