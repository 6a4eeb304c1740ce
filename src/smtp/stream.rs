use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{ProtocolVersion, ServerConnection, SupportedCipherSuite},
    server::TlsStream,
    TlsAcceptor,
};

use crate::error::TlsError;

#[derive(Debug)]
pub struct TlsInfo {
    version: Option<ProtocolVersion>,
    cipher: Option<SupportedCipherSuite>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version(),
            cipher: conn.negotiated_cipher_suite(),
        }
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version
            .and_then(|version| version.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.cipher
            .and_then(|cipher| cipher.suite().as_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

/// The transport a connection speaks over: the plain accepted stream, or
/// the same stream wrapped by a completed TLS handshake.
///
/// `Closed` is the placeholder installed while the plain stream is being
/// consumed by an in-flight STARTTLS upgrade, and after teardown.
pub enum SmtpStream<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: Stream },
    Tls { stream: Box<TlsStream<Stream>> },
    Closed,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> SmtpStream<Stream> {
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Write one response line, appending the CRLF terminator.
    pub(crate) async fn send(&mut self, response: &str) -> io::Result<usize> {
        let line = format!("{response}\r\n");

        match self {
            Self::Plain { stream } => stream.write_all(line.as_bytes()).await?,
            Self::Tls { stream } => stream.write_all(line.as_bytes()).await?,
            Self::Closed => return Err(io::ErrorKind::NotConnected.into()),
        }

        Ok(line.len())
    }

    pub(crate) async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain { stream } => stream.read(buf).await,
            Self::Tls { stream } => stream.read(buf).await,
            Self::Closed => Ok(0),
        }
    }

    /// Perform the server side of a TLS handshake over the plain stream,
    /// returning the wrapped transport.
    ///
    /// The caller installs the result in place of the stream it took this
    /// value from, so the peer identity is carried over unchanged.
    pub(crate) async fn upgrade(self, acceptor: TlsAcceptor) -> Result<(Self, TlsInfo), TlsError> {
        match self {
            Self::Plain { stream } => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1);

                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                    },
                    info,
                ))
            }
            Self::Tls { .. } | Self::Closed => Err(TlsError::NotUpgradable),
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        match self {
            Self::Plain { stream } => {
                let _ = stream.shutdown().await;
            }
            Self::Tls { stream } => {
                let _ = stream.shutdown().await;
            }
            Self::Closed => {}
        }
    }
}
