//! Named TLS server contexts with SNI-based selection.
//!
//! Certificates are selected by the server name the client asked for in
//! its TLS hello, falling back to the `default` context, which every store
//! must provide.

use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;
use tokio_rustls::{
    rustls::{
        crypto::aws_lc_rs::sign::any_supported_type,
        pki_types::{CertificateDer, PrivateKeyDer},
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
        ServerConfig,
    },
    TlsAcceptor,
};

use crate::error::TlsError;

/// The context name used when the client sent no SNI, or named a context
/// the store does not hold.
pub const DEFAULT_CONTEXT: &str = "default";

/// A certificate/key pair on disk, as configured for one server name.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

struct SniStore {
    contexts: HashMap<String, Arc<CertifiedKey>>,
}

impl fmt::Debug for SniStore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SniStore")
            .field("contexts", &self.contexts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for SniStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.contexts.get(name))
            .or_else(|| self.contexts.get(DEFAULT_CONTEXT))
            .cloned()
    }
}

/// All named contexts of one server, plus the `rustls` configuration that
/// performs SNI lookups against them.
pub struct TlsContextStore {
    store: Arc<SniStore>,
    config: Arc<ServerConfig>,
}

impl fmt::Debug for TlsContextStore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TlsContextStore")
            .field("store", &self.store)
            .finish()
    }
}

impl TlsContextStore {
    /// Load every configured context. The `default` entry is required.
    pub fn from_contexts(contexts: &HashMap<String, TlsContext>) -> Result<Self, TlsError> {
        if !contexts.contains_key(DEFAULT_CONTEXT) {
            return Err(TlsError::MissingDefaultContext);
        }

        let mut loaded = HashMap::with_capacity(contexts.len());
        for (name, context) in contexts {
            loaded.insert(name.clone(), Arc::new(Self::load_context(context)?));
        }

        let store = Arc::new(SniStore { contexts: loaded });

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(&store) as Arc<dyn ResolvesServerCert>);

        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    /// Look up a context by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.store.contexts.get(name).cloned()
    }

    /// An acceptor performing the server side of a handshake with this
    /// store's contexts. Used both by STARTTLS and by `secure` listeners.
    #[must_use]
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }

    fn load_context(context: &TlsContext) -> Result<CertifiedKey, TlsError> {
        let certs = Self::load_certs(&context.certificate)?;
        let key = Self::load_key(&context.key)?;
        let signing = any_supported_type(&key)?;

        Ok(CertifiedKey::new(certs, signing))
    }

    /// Read the certificate chain from a PEM file. An openable file with
    /// no certificates in it is an error, not an empty chain.
    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let certificate_load = |source| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source,
        };

        let file = File::open(path).map_err(certificate_load)?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<_, _>>()
            .map_err(certificate_load)?;

        if certs.is_empty() {
            return Err(certificate_load(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "file contains no certificates",
            )));
        }

        Ok(certs)
    }

    /// Read the first private key from a PEM file, whatever its encoding.
    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
        let key_load = |reason: String| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason,
        };

        let file = File::open(path).map_err(|err| key_load(err.to_string()))?;

        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|err| key_load(err.to_string()))?
            .ok_or_else(|| key_load("file contains no private key".to_string()))
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::{TlsContext, TlsContextStore};
    use crate::error::TlsError;

    #[test]
    fn default_context_is_required() {
        let mut contexts = HashMap::new();
        contexts.insert(
            "mail.example".to_string(),
            TlsContext {
                certificate: "/nonexistent/cert.pem".into(),
                key: "/nonexistent/key.pem".into(),
            },
        );

        assert!(matches!(
            TlsContextStore::from_contexts(&contexts),
            Err(TlsError::MissingDefaultContext)
        ));
    }

    #[test]
    fn missing_certificate_is_reported_with_path() {
        let mut contexts = HashMap::new();
        contexts.insert(
            "default".to_string(),
            TlsContext {
                certificate: "/nonexistent/cert.pem".into(),
                key: "/nonexistent/key.pem".into(),
            },
        );

        match TlsContextStore::from_contexts(&contexts) {
            Err(TlsError::CertificateLoad { path, .. }) => {
                assert_eq!(path, "/nonexistent/cert.pem");
            }
            other => panic!("Expected CertificateLoad error, got {other:?}"),
        }
    }
}
