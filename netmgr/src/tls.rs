//! TLS context plumbing shared by the TLS-DNS listen and connect paths.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::result::{NetError, NetResult};

enum ContextInner {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

/// A caller-configured TLS context: server certificate/key for listeners,
/// trust anchors and server name for clients.
pub struct TlsContext {
    inner: ContextInner,
}

impl TlsContext {
    /// A server context from a certificate chain and private key.
    pub fn server(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> NetResult<Arc<TlsContext>> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| {
                tracing::error!(error = %e, "invalid server certificate or key");
                NetError::Tls
            })?;
        Ok(Arc::new(TlsContext {
            inner: ContextInner::Server(Arc::new(config)),
        }))
    }

    /// A client context trusting `roots`, expecting to speak to
    /// `server_name`.
    pub fn client(roots: RootCertStore, server_name: &str) -> NetResult<Arc<TlsContext>> {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            tracing::error!(error = %e, server_name, "invalid TLS server name");
            NetError::Tls
        })?;
        Ok(Arc::new(TlsContext {
            inner: ContextInner::Client {
                config: Arc::new(config),
                server_name,
            },
        }))
    }

    pub(crate) fn is_server(&self) -> bool {
        matches!(self.inner, ContextInner::Server(_))
    }

    /// Instantiate a TLS engine in accept state.
    pub(crate) fn accept_engine(&self) -> NetResult<rustls::Connection> {
        match &self.inner {
            ContextInner::Server(config) => {
                let conn = ServerConnection::new(config.clone()).map_err(|e| {
                    tracing::error!(error = %e, "TLS accept setup failed");
                    NetError::Tls
                })?;
                Ok(rustls::Connection::Server(conn))
            }
            ContextInner::Client { .. } => Err(NetError::Unexpected),
        }
    }

    /// Instantiate a TLS engine in connect state.
    pub(crate) fn connect_engine(&self) -> NetResult<rustls::Connection> {
        match &self.inner {
            ContextInner::Client {
                config,
                server_name,
            } => {
                let conn =
                    ClientConnection::new(config.clone(), server_name.clone()).map_err(|e| {
                        tracing::error!(error = %e, "TLS connect setup failed");
                        NetError::Tls
                    })?;
                Ok(rustls::Connection::Client(conn))
            }
            ContextInner::Server(_) => Err(NetError::Unexpected),
        }
    }
}
