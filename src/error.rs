//! Error types shared across the connection engine.

use std::io;

use thiserror::Error;

/// Errors that can occur while a client session is being served.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol error occurred during the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// TLS negotiation failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The client idled past the configured socket timeout.
    #[error("Session timed out after {0} ms")]
    Timeout(u64),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,
}

impl SessionError {
    /// Returns `true` if the error is a client-side issue rather than a
    /// server fault.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }

    /// A reset from the peer carries no information worth reporting.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Connection(err) if err.kind() == io::ErrorKind::ConnectionReset)
    }
}

/// Errors that can occur in the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    /// TLS context store could not be built.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Errors raised while loading certificates or negotiating TLS.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to load certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("No `default` TLS context configured")]
    MissingDefaultContext,

    #[error("Invalid TLS configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),

    #[error("Stream is not in a state that can be upgraded")]
    NotUpgradable,
}

/// An error returned by an application hook, carrying an optional SMTP
/// reply code that overrides the default for the failing operation and a
/// message used verbatim as the response text.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ReplyError {
    code: Option<u16>,
    message: String,
}

impl ReplyError {
    #[must_use]
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Attach an explicit reply code, e.g. 451 for a greylisting refusal.
    #[must_use]
    pub fn with_code<M: Into<String>>(code: u16, message: M) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}
