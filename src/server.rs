use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures_util::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};

use crate::{
    config::Config,
    dns::ReverseResolver,
    error::{ServerError, TlsError},
    hooks::Hooks,
    internal,
    smtp::{Connection, ConnectionConfig, SmtpStream},
    tls::TlsContextStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Decrements the live-connection count when a session task finishes,
/// however it finishes.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The accept loop: owns the configuration, the hooks, the TLS context
/// store, and the live-connection registry shared by every session.
pub struct Server<H: Hooks> {
    config: Arc<Config>,
    hooks: Arc<H>,
    tls: Option<Arc<TlsContextStore>>,
    resolver: Arc<ReverseResolver>,
    active: Arc<AtomicUsize>,
}

impl<H: Hooks> Server<H> {
    pub fn new(config: Config, hooks: H) -> Result<Self, ServerError> {
        let tls = if config.tls.is_empty() {
            None
        } else {
            Some(Arc::new(TlsContextStore::from_contexts(&config.tls)?))
        };

        if config.secure && tls.is_none() {
            return Err(ServerError::Tls(TlsError::MissingDefaultContext));
        }

        Ok(Self {
            config: Arc::new(config),
            hooks: Arc::new(hooks),
            tls,
            resolver: Arc::new(ReverseResolver::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Accept and serve connections until a shutdown signal arrives, then
    /// wait for in-flight sessions to finish.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ServerError> {
        let listener =
            TcpListener::bind(self.config.listen)
                .await
                .map_err(|source| ServerError::BindFailed {
                    address: self.config.listen.to_string(),
                    source,
                })?;

        internal!(level = INFO, "Serving SMTP on {}", self.config.listen);

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(level = INFO, "Received shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    sessions.push(self.spawn_session(stream, peer, shutdown.resubscribe()));
                }
            }
        }

        Ok(())
    }

    fn spawn_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: broadcast::Receiver<Signal>,
    ) -> JoinHandle<()> {
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = ActiveGuard(Arc::clone(&self.active));

        let settings = ConnectionConfig {
            config: Arc::clone(&self.config),
            hooks: Arc::clone(&self.hooks),
            tls: self.tls.clone(),
            resolver: Some(Arc::clone(&self.resolver)),
            over_capacity: self.config.max_clients.is_some_and(|max| count > max),
        };

        let secure = self.config.secure;
        let tls = self.tls.clone();

        tokio::spawn(async move {
            let _guard = guard;

            let stream = if secure {
                let Some(tls) = tls.as_ref() else {
                    internal!(level = ERROR, "Secure listener has no TLS contexts");
                    return;
                };

                match tls.acceptor().accept(stream).await {
                    Ok(stream) => SmtpStream::Tls {
                        stream: Box::new(stream),
                    },
                    Err(err) => {
                        internal!(level = ERROR, "TLS accept from {} failed: {}", peer, err);
                        return;
                    }
                }
            } else {
                SmtpStream::Plain { stream }
            };

            let connection = Connection::new(stream, peer.ip().to_string(), settings);
            let id = connection.id().to_string();

            if let Err(err) = connection.run(shutdown).await {
                internal!(level = ERROR, "[{}] Session error: {}", id, err);
            }
        })
    }
}
