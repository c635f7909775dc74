use std::{fmt, sync::Arc, time::SystemTime};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};

use crate::Error;

/// TLS settings for relay links. A connection uses the client side when it dials out and the
/// server side when it was accepted on a TLS-enabled listener.
#[derive(Clone)]
pub struct TlsOptions {
    pub client: Arc<rustls::ClientConfig>,
    pub server: Option<Arc<rustls::ServerConfig>>,
    /// The name presented for SNI and checked against server certificates.
    pub server_name: String,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("server_name", &self.server_name)
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl TlsOptions {
    pub fn new(client: Arc<rustls::ClientConfig>, server_name: impl Into<String>) -> Self {
        Self { client, server: None, server_name: server_name.into() }
    }

    pub fn with_server(mut self, server: Arc<rustls::ServerConfig>) -> Self {
        self.server = Some(server);
        self
    }

    /// Options for a link whose peers authenticate each other above TLS: a throwaway
    /// self-signed server certificate, and a client that accepts any certificate.
    pub fn self_signed() -> Result<Self, Error> {
        let (cert, key) = self_signed_certificate()?;
        let server = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;

        Ok(Self::new(Arc::new(unsafe_client_config()), "localhost").with_server(Arc::new(server)))
    }

    pub(crate) fn server_name(&self) -> Result<ServerName, Error> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| Error::InvalidServerName(self.server_name.clone()))
    }
}

/// A server certificate verifier that automatically passes all checks.
#[derive(Debug)]
pub(crate) struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Returns a client configuration that skips all server verification and doesn't do any
/// client authentication.
pub fn unsafe_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth()
}

/// Generates a self-signed certificate for `localhost`.
pub fn self_signed_certificate() -> Result<(Certificate, PrivateKey), Error> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let key = PrivateKey(cert.serialize_private_key_der());
    Ok((Certificate(cert.serialize_der()?), key))
}
