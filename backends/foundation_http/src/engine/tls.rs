//! Reusable client TLS configuration backed by rustls.

use std::path::PathBuf;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::errors::ConfigError;
use crate::synca::{Dependents, RunOnDrop, ShutdownSignal, ShutdownWait};

use super::EngineHold;

/// Which trust anchors verify the server.
#[derive(Debug, Clone)]
pub enum RootCertificates {
    /// The Mozilla root program bundled through `webpki-roots`.
    WebPki,
    /// PEM encoded certificates held in memory.
    Pem(Vec<u8>),
    /// PEM encoded certificates read from disk when the context is built.
    PemFile(PathBuf),
}

/// Options a [`TlsContext`] is built from.
#[derive(Clone)]
pub struct TlsContextOptions {
    roots: RootCertificates,
    verify_peer: bool,
    client_identity: Option<(Vec<u8>, Zeroizing<Vec<u8>>)>,
    alpn: Vec<Vec<u8>>,
}

impl std::fmt::Debug for TlsContextOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContextOptions")
            .field("roots", &self.roots)
            .field("verify_peer", &self.verify_peer)
            .field("client_identity", &self.client_identity.is_some())
            .field("alpn", &self.alpn)
            .finish()
    }
}

impl Default for TlsContextOptions {
    fn default() -> Self {
        Self::default_client()
    }
}

impl TlsContextOptions {
    /// Verifies peers against the bundled web PKI roots and offers
    /// `http/1.1` over ALPN.
    #[must_use]
    pub fn default_client() -> Self {
        Self {
            roots: RootCertificates::WebPki,
            verify_peer: true,
            client_identity: None,
            alpn: vec![b"http/1.1".to_vec()],
        }
    }

    #[must_use]
    pub fn with_roots(mut self, roots: RootCertificates) -> Self {
        self.roots = roots;
        self
    }

    #[must_use]
    pub fn with_ca_pem(self, pem: impl Into<Vec<u8>>) -> Self {
        self.with_roots(RootCertificates::Pem(pem.into()))
    }

    #[must_use]
    pub fn with_ca_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_roots(RootCertificates::PemFile(path.into()))
    }

    /// Presents a client certificate chain and key (both PEM) for mutual TLS.
    #[must_use]
    pub fn with_client_identity(
        mut self,
        certificate_chain: impl Into<Vec<u8>>,
        private_key: Zeroizing<Vec<u8>>,
    ) -> Self {
        self.client_identity = Some((certificate_chain.into(), private_key));
        self
    }

    /// Turns certificate verification off. Only for test environments.
    #[must_use]
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    #[must_use]
    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }
}

struct TlsInner {
    #[cfg(feature = "ssl-rustls")]
    config: Arc<rustls::ClientConfig>,
    verify_peer: bool,
    dependents: Dependents,
    shutdown: ShutdownSignal,
}

impl TlsInner {
    fn close(&self) {
        self.dependents.close(|| {
            self.shutdown.signal();
        });
    }

    fn release(&self) {
        self.dependents.release(|| {
            self.shutdown.signal();
        });
    }
}

impl Drop for TlsInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared, immutable TLS client configuration.
///
/// Connection managers hold the context while they run; closing it only
/// refuses new managers, and shutdown completes after the last one let go.
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<TlsInner>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("verify_peer", &self.inner.verify_peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TlsContext {
    /// # Errors
    ///
    /// [`ConfigError::Tls`] when certificates or keys cannot be parsed, or
    /// when no TLS backend was compiled in.
    pub fn new(options: TlsContextOptions) -> Result<Self, ConfigError> {
        let verify_peer = options.verify_peer;

        #[cfg(feature = "ssl-rustls")]
        let config = backend::client_config(options)?;

        #[cfg(not(feature = "ssl-rustls"))]
        {
            let _ = options;
            return Err(ConfigError::Tls(
                "no TLS backend compiled in; enable the ssl-rustls feature".into(),
            ));
        }

        #[cfg(feature = "ssl-rustls")]
        Ok(Self {
            inner: Arc::new(TlsInner {
                config,
                verify_peer,
                dependents: Dependents::new(),
                shutdown: ShutdownSignal::new("tls context"),
            }),
        })
    }

    #[cfg(feature = "ssl-rustls")]
    pub(crate) fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.inner.config.clone()
    }

    #[must_use]
    pub fn verifies_peer(&self) -> bool {
        self.inner.verify_peer
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.dependents.is_closing()
    }

    /// True once closed and no manager holds the context any more; new
    /// handshakes are refused from then on.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.dependents.is_torn_down()
    }

    /// Refuses new dependents. Connections already negotiated are
    /// unaffected.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Keeps the context usable until the hold is dropped; `None` once
    /// closed.
    pub(crate) fn hold(&self) -> Option<EngineHold> {
        if !self.inner.dependents.acquire(|| {
            self.inner.shutdown.signal();
        }) {
            return None;
        }
        let inner = self.inner.clone();
        Some(RunOnDrop::new(
            Box::new(move || inner.release()) as Box<dyn FnOnce() + Send>
        ))
    }

    #[must_use]
    pub fn wait_for_shutdown(&self) -> ShutdownWait {
        self.inner.shutdown.listen()
    }
}

#[cfg(feature = "ssl-rustls")]
mod backend {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

    use super::{RootCertificates, TlsContextOptions};
    use crate::errors::ConfigError;

    fn tls_error(err: impl std::fmt::Display) -> ConfigError {
        ConfigError::Tls(err.to_string())
    }

    fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut &pem[..]).collect();
        let certs = certs.map_err(tls_error)?;
        if certs.is_empty() {
            return Err(ConfigError::Tls("no certificates found in PEM input".into()));
        }
        Ok(certs)
    }

    fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ConfigError> {
        rustls_pemfile::private_key(&mut &pem[..])
            .map_err(tls_error)?
            .ok_or_else(|| ConfigError::Tls("no private key found in PEM input".into()))
    }

    fn root_store(roots: &RootCertificates) -> Result<RootCertStore, ConfigError> {
        let pem = match roots {
            RootCertificates::WebPki => {
                return Ok(RootCertStore::from_iter(
                    webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
                ));
            }
            RootCertificates::Pem(pem) => pem.clone(),
            RootCertificates::PemFile(path) => std::fs::read(path)?,
        };

        let mut store = RootCertStore::empty();
        for cert in parse_certificates(&pem)? {
            store.add(cert).map_err(tls_error)?;
        }
        Ok(store)
    }

    pub(super) fn client_config(
        options: TlsContextOptions,
    ) -> Result<Arc<ClientConfig>, ConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?;

        let builder = if options.verify_peer {
            builder.with_root_certificates(root_store(&options.roots)?)
        } else {
            warn!("TLS peer verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServer(provider)))
        };

        let mut config = match &options.client_identity {
            Some((chain, key)) => builder
                .with_client_auth_cert(parse_certificates(chain)?, parse_private_key(key)?)
                .map_err(tls_error)?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = options.alpn;

        Ok(Arc::new(config))
    }

    /// Verifier used when peer verification is switched off. Handshake
    /// signatures are still checked so the session keys are sound.
    #[derive(Debug)]
    struct AcceptAnyServer(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyServer {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
