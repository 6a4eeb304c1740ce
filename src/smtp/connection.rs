use std::{collections::HashMap, io, net::IpAddr, sync::Arc, time::Duration};

use rand::{distr::Alphanumeric, Rng};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
    time::sleep,
};

use crate::{
    config::Config,
    dns::{address_literal, ReverseResolver},
    error::SessionError,
    hooks::Hooks,
    incoming, internal, outgoing,
    server::Signal,
    tls::TlsContextStore,
};

use super::{
    auth::{self, Continuation},
    command::{is_http_request, parse_address_command, parse_xclient_args, Verb},
    parser::{BodyStream, LineParser, DATA_PIPE_CAPACITY},
    session::{AuthUser, Credentials, Session},
    status::Status,
    stream::SmtpStream,
};

/// Threshold for the unrecognized- and unauthenticated-command counters.
const MAX_BAD_COMMANDS: u32 = 10;

/// Clients speaking before this much of the connection has elapsed are
/// treated as spam cannons and dropped before the banner.
const GRACE_PERIOD: Duration = Duration::from_millis(100);

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum Flow {
    Continue,
    Close,
}

/// Everything a [`Connection`] needs besides its transport.
pub struct ConnectionConfig<H: Hooks> {
    pub config: Arc<Config>,
    pub hooks: Arc<H>,
    pub tls: Option<Arc<TlsContextStore>>,
    pub resolver: Option<Arc<ReverseResolver>>,
    /// Set when the server was already at `max_clients` when this
    /// transport was accepted; the connection answers 421 and closes
    /// before reading any input.
    pub over_capacity: bool,
}

/// One accepted transport, driven from greeting to close.
///
/// The connection is cooperatively single-threaded: the parser does not
/// yield the next command line until the previous handler (including its
/// hook callouts) has completed, which serializes parsing, dispatch, and
/// response writing.
pub struct Connection<Stream, H>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    H: Hooks,
{
    id: String,
    config: Arc<Config>,
    hooks: Arc<H>,
    tls: Option<Arc<TlsContextStore>>,
    resolver: Option<Arc<ReverseResolver>>,
    stream: SmtpStream<Stream>,
    parser: LineParser,
    session: Session,
    remote_address: String,
    client_hostname: String,
    host_name_appears_as: Option<String>,
    secure: bool,
    ready: bool,
    closing: bool,
    unrecognized: u32,
    unauthenticated: u32,
    /// XCLIENT keys a trusted frontend has asserted; the presence of ADDR
    /// makes the extension one-shot.
    xclient: HashMap<String, String>,
    transaction_counter: u64,
    /// One-shot SASL continuation, consumed by the next client line.
    continuation: Option<Continuation>,
    over_capacity: bool,
}

impl<Stream, H> Connection<Stream, H>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    H: Hooks,
{
    pub fn new(
        stream: SmtpStream<Stream>,
        remote_address: String,
        settings: ConnectionConfig<H>,
    ) -> Self {
        let id = connection_id();
        let client_hostname = address_literal(&remote_address);
        let secure = stream.is_tls();

        let session = Session::create(
            id.clone(),
            remote_address.clone(),
            client_hostname.clone(),
            None,
            None,
            1,
        );

        Self {
            id,
            config: settings.config,
            hooks: settings.hooks,
            tls: settings.tls,
            resolver: settings.resolver,
            stream,
            parser: LineParser::new(),
            session,
            remote_address,
            client_hostname,
            host_name_appears_as: None,
            secure,
            ready: false,
            closing: false,
            unrecognized: 0,
            unauthenticated: 0,
            xclient: HashMap::new(),
            transaction_counter: 0,
            continuation: None,
            over_capacity: settings.over_capacity,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serve the connection until the peer quits, errs, idles out, or the
    /// server shuts down.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("[{}] Connection from {}", self.id, self.remote_address);

        let result = self.serve(&mut shutdown).await;

        self.close().await;

        match result {
            // A reset peer already got everything it was owed.
            Err(err) if err.is_reset() => Ok(()),
            other => other,
        }
    }

    async fn serve(&mut self, shutdown: &mut broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        if self.over_capacity {
            let text = format!(
                "{} Too many connected clients, try again later",
                self.config.name
            );
            self.reply(Status::Unavailable, &text).await?;
            return Ok(());
        }

        if self.config.use_proxy {
            if self.read_proxy_header().await? == Flow::Close {
                return Ok(());
            }
        } else {
            self.resolve_client_hostname().await;

            tokio::select! {
                biased;
                read = self.parser.fill(&mut self.stream) => {
                    if read? > 0 {
                        let text = format!("{} You talk too soon", self.config.name);
                        self.reply(Status::Unavailable, &text).await?;
                    }
                    return Ok(());
                }
                () = sleep(GRACE_PERIOD) => {}
            }
        }

        if let Err(err) = self.hooks.on_connect(&self.session).await {
            self.reply_code(err.code().unwrap_or(554), err.message()).await?;
            return Ok(());
        }

        self.ready = true;
        self.send_banner().await?;

        self.command_loop(shutdown).await
    }

    async fn command_loop(
        &mut self,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let idle = self.config.socket_timeout();

        loop {
            let line = tokio::select! {
                () = wait_for_shutdown(shutdown) => {
                    let text = format!(
                        "{} Service not available, closing transmission channel",
                        self.config.name
                    );
                    self.reply(Status::Unavailable, &text).await?;
                    return Ok(());
                }
                line = self.parser.next_line(&mut self.stream, idle) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    self.reply(Status::ActionAborted, "Timeout - closing connection")
                        .await?;
                    return Err(SessionError::Timeout(self.config.socket_timeout_ms));
                }
                Err(err) => return Err(err.into()),
            };

            if self.dispatch(line).await? == Flow::Close {
                return Ok(());
            }
        }
    }

    /// Route one command line through the pre-dispatch policy checks and
    /// into its handler.
    async fn dispatch(&mut self, line: Vec<u8>) -> Result<Flow, SessionError> {
        debug_assert!(self.ready, "no handler may run before the greeting");

        let line = String::from_utf8_lossy(&line).into_owned();
        incoming!("[{}] C: {}", self.id, line);

        if is_http_request(&line) {
            self.reply(Status::Failed, "HTTP requests not allowed").await?;
            return Ok(Flow::Close);
        }

        // A parked SASL continuation consumes the line before any verb
        // parsing happens.
        if let Some(continuation) = self.continuation.take() {
            return self.handle_auth_continuation(continuation, line.trim()).await;
        }

        let verb = line.split_ascii_whitespace().next().and_then(Verb::from_token);

        let verb = match verb {
            Some(verb) if !self.config.is_disabled(verb) => verb,
            _ => return self.handle_unrecognized().await,
        };

        if self.config.supports_auth() && verb != Verb::Auth && self.session.user.is_none() {
            // The counter gates disconnection only; dispatch continues and
            // the auth gate below is what actually refuses the command.
            self.unauthenticated += 1;
            if self.unauthenticated >= MAX_BAD_COMMANDS {
                self.reply(Status::Failed, "Error: too many unauthenticated commands")
                    .await?;
                return Ok(Flow::Close);
            }
        }

        if matches!(verb, Verb::Mail | Verb::Rcpt | Verb::Data | Verb::Auth)
            && self.host_name_appears_as.is_none()
        {
            self.reply(Status::InvalidCommandSequence, "Error: send HELO/EHLO first")
                .await?;
            return Ok(Flow::Continue);
        }

        if matches!(verb, Verb::Mail | Verb::Rcpt | Verb::Data)
            && self.config.supports_auth()
            && self.session.user.is_none()
        {
            self.reply(Status::AuthRequired, "Error: authentication Required")
                .await?;
            return Ok(Flow::Continue);
        }

        match verb {
            Verb::Ehlo => self.handler_ehlo(&line).await,
            Verb::Helo => self.handler_helo(&line).await,
            Verb::Mail => self.handler_mail(&line).await,
            Verb::Rcpt => self.handler_rcpt(&line).await,
            Verb::Data => self.handler_data().await,
            Verb::Rset => self.handler_rset().await,
            Verb::Noop => self.handler_noop().await,
            Verb::Help => self.handler_help().await,
            Verb::Vrfy => self.handler_vrfy().await,
            Verb::Quit => self.handler_quit().await,
            Verb::Auth => self.handler_auth(&line).await,
            Verb::StartTls => self.handler_starttls().await,
            Verb::XClient => self.handler_xclient(&line).await,
            Verb::Wiz => self.handler_wiz().await,
            Verb::Shell => self.handler_shell().await,
            Verb::Kill => self.handler_kill().await,
        }
    }

    async fn handle_unrecognized(&mut self) -> Result<Flow, SessionError> {
        self.unrecognized += 1;

        if self.unrecognized >= MAX_BAD_COMMANDS {
            self.reply(Status::Failed, "Error: too many unrecognized commands")
                .await?;
            return Ok(Flow::Close);
        }

        self.reply(Status::CommandUnrecognized, "Error: command not recognized")
            .await?;
        Ok(Flow::Continue)
    }

    async fn handler_ehlo(&mut self, line: &str) -> Result<Flow, SessionError> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        if tokens.len() != 2 {
            self.reply(Status::SyntaxError, "Error: syntax: EHLO hostname")
                .await?;
            return Ok(Flow::Continue);
        }

        self.host_name_appears_as = Some(tokens[1].to_ascii_lowercase());
        self.reset_session();

        let mut features = vec![
            format!("OK: Nice to meet you {}", self.client_hostname),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            "SMTPUTF8".to_string(),
        ];

        if self.config.supports_auth() {
            let methods = self
                .config
                .auth_methods
                .iter()
                .map(|method| method.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(" ");
            features.push(format!("AUTH {methods}"));
        }

        if self.starttls_offered() {
            features.push("STARTTLS".to_string());
        }

        if let Some(size) = self.config.size {
            features.push(format!("SIZE {size}"));
        }

        if self.config.use_xclient
            && !self.config.is_disabled(Verb::XClient)
            && !self.xclient.contains_key("ADDR")
        {
            features.push("XCLIENT NAME ADDR PORT PROTO HELO LOGIN".to_string());
        }

        self.reply_lines(Status::Ok, &features).await?;
        Ok(Flow::Continue)
    }

    async fn handler_helo(&mut self, line: &str) -> Result<Flow, SessionError> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        if tokens.len() != 2 {
            self.reply(Status::SyntaxError, "Error: syntax: HELO hostname")
                .await?;
            return Ok(Flow::Continue);
        }

        self.host_name_appears_as = Some(tokens[1].to_ascii_lowercase());
        self.reset_session();

        let text = format!("OK: Nice to meet you {}", self.client_hostname);
        self.reply(Status::Ok, &text).await?;
        Ok(Flow::Continue)
    }

    async fn handler_mail(&mut self, line: &str) -> Result<Flow, SessionError> {
        let Some(record) = parse_address_command(line, "mail from") else {
            self.reply(Status::SyntaxError, "Error: bad sender address syntax")
                .await?;
            return Ok(Flow::Continue);
        };

        if self.session.envelope.mail_from().is_some() {
            self.reply(Status::InvalidCommandSequence, "Error: nested MAIL command")
                .await?;
            return Ok(Flow::Continue);
        }

        let declared = record.args.get("SIZE").and_then(|size| size.parse::<u64>().ok());
        if let (Some(max), Some(declared)) = (self.config.size, declared) {
            if declared > max {
                self.reply(
                    Status::ExceededStorage,
                    "Error: message exceeds fixed maximum message size",
                )
                .await?;
                return Ok(Flow::Continue);
            }
        }

        if let Err(err) = self.hooks.on_mail_from(&record, &self.session).await {
            self.reply_code(err.code().unwrap_or(550), err.message()).await?;
            return Ok(Flow::Continue);
        }

        *self.session.envelope.mail_from_mut() = Some(record);
        self.reply(Status::Ok, "Accepted").await?;
        Ok(Flow::Continue)
    }

    async fn handler_rcpt(&mut self, line: &str) -> Result<Flow, SessionError> {
        let record = parse_address_command(line, "rcpt to");

        let Some(record) = record.filter(|record| !record.address.is_empty()) else {
            self.reply(Status::SyntaxError, "Error: bad recipient address syntax")
                .await?;
            return Ok(Flow::Continue);
        };

        if self.session.envelope.mail_from().is_none() {
            self.reply(Status::InvalidCommandSequence, "Error: need MAIL command")
                .await?;
            return Ok(Flow::Continue);
        }

        if let Err(err) = self.hooks.on_rcpt_to(&record, &self.session).await {
            self.reply_code(err.code().unwrap_or(550), err.message()).await?;
            return Ok(Flow::Continue);
        }

        self.session.envelope.push_rcpt(record);
        self.reply(Status::Ok, "Accepted").await?;
        Ok(Flow::Continue)
    }

    async fn handler_data(&mut self) -> Result<Flow, SessionError> {
        if self.session.envelope.rcpt_to().is_empty() {
            self.reply(Status::InvalidCommandSequence, "Error: need RCPT command")
                .await?;
            return Ok(Flow::Continue);
        }

        self.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let (writer, reader) = tokio::io::duplex(DATA_PIPE_CAPACITY);
        let idle = self.config.socket_timeout();
        let hooks = Arc::clone(&self.hooks);
        let parser = &mut self.parser;
        let stream = &mut self.stream;
        let session = &self.session;

        // The final reply must wait for both the hook to return and the
        // payload to reach end-of-stream, so both run under one join.
        let (summary, verdict) = tokio::join!(
            parser.read_data(stream, writer, idle),
            hooks.on_data(BodyStream::new(reader), session),
        );

        let summary = match summary {
            Ok(summary) => summary,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                self.reply(Status::ActionAborted, "Timeout - closing connection")
                    .await?;
                return Ok(Flow::Close);
            }
            Err(err) => return Err(err.into()),
        };

        internal!("[{}] Received {} bytes of message data", self.id, summary.bytes);

        let oversized = self.config.size.is_some_and(|max| summary.bytes > max);

        match verdict {
            _ if oversized => {
                self.reply(
                    Status::ExceededStorage,
                    "Error: message exceeds fixed maximum message size",
                )
                .await?;
            }
            Err(err) => {
                self.reply_code(err.code().unwrap_or(554), err.message()).await?;
            }
            Ok(message) => {
                let text = message.unwrap_or_else(|| "OK: message queued".to_string());
                self.reply(Status::Ok, &text).await?;
            }
        }

        self.transaction_counter += 1;
        self.unrecognized = 0;
        self.reset_session();

        Ok(Flow::Continue)
    }

    async fn handler_rset(&mut self) -> Result<Flow, SessionError> {
        self.reset_session();
        self.reply(Status::Ok, "Flushed").await?;
        Ok(Flow::Continue)
    }

    async fn handler_noop(&mut self) -> Result<Flow, SessionError> {
        self.reply(Status::Ok, "OK").await?;
        Ok(Flow::Continue)
    }

    async fn handler_help(&mut self) -> Result<Flow, SessionError> {
        self.reply(
            Status::HelpMessage,
            "See https://tools.ietf.org/html/rfc5321 for details",
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handler_vrfy(&mut self) -> Result<Flow, SessionError> {
        self.reply(
            Status::CannotVerify,
            "Try to send something. No promises though",
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handler_quit(&mut self) -> Result<Flow, SessionError> {
        self.reply(Status::GoodBye, "Bye").await?;
        Ok(Flow::Close)
    }

    async fn handler_starttls(&mut self) -> Result<Flow, SessionError> {
        if self.secure {
            self.reply(Status::Failed, "Error: TLS already active").await?;
            return Ok(Flow::Continue);
        }

        let Some(tls) = self.tls.clone() else {
            self.reply(Status::TlsUnavailable, "TLS not available").await?;
            return Ok(Flow::Continue);
        };

        self.reply(Status::ServiceReady, "Ready to start TLS").await?;

        // Anything the client pipelined behind STARTTLS arrived in
        // plaintext and must not be interpreted.
        self.parser.clear();

        let stream = std::mem::replace(&mut self.stream, SmtpStream::Closed);
        match stream.upgrade(tls.acceptor()).await {
            Ok((stream, info)) => {
                self.stream = stream;
                self.secure = true;
                internal!(
                    "[{}] Connection upgraded to TLS ({} {})",
                    self.id,
                    info.proto(),
                    info.cipher()
                );
                Ok(Flow::Continue)
            }
            Err(err) => {
                internal!(level = ERROR, "[{}] TLS handshake failed: {err}", self.id);
                Ok(Flow::Close)
            }
        }
    }

    async fn handler_auth(&mut self, line: &str) -> Result<Flow, SessionError> {
        let mut tokens = line.split_ascii_whitespace();
        let _verb = tokens.next();

        let Some(mechanism) = tokens.next() else {
            self.reply(Status::SyntaxError, "Error: syntax: AUTH mechanism")
                .await?;
            return Ok(Flow::Continue);
        };
        let mechanism = mechanism.to_ascii_uppercase();

        if self.starttls_offered() {
            self.reply(
                Status::EncryptionRequired,
                "Error: Must issue a STARTTLS command first",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        if self.session.user.is_some() {
            self.reply(
                Status::InvalidCommandSequence,
                "Error: No identity changes permitted",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        if !self.config.supports_auth_method(&mechanism) {
            self.reply(Status::NotImplemented, "Error: Unrecognized authentication type")
                .await?;
            return Ok(Flow::Continue);
        }

        match mechanism.as_str() {
            "PLAIN" => match tokens.next() {
                Some(initial) => self.finish_plain(initial.to_string()).await,
                None => {
                    self.reply(Status::AuthChallenge, "").await?;
                    self.continuation = Some(Continuation::Plain);
                    Ok(Flow::Continue)
                }
            },
            "LOGIN" => {
                self.reply(Status::AuthChallenge, auth::LOGIN_USERNAME_CHALLENGE)
                    .await?;
                self.continuation = Some(Continuation::LoginUser);
                Ok(Flow::Continue)
            }
            _ => {
                // Configured but without an implementation to drive it.
                self.reply(Status::NotImplemented, "Error: Unrecognized authentication type")
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_auth_continuation(
        &mut self,
        continuation: Continuation,
        payload: &str,
    ) -> Result<Flow, SessionError> {
        if payload == auth::ABORT {
            self.reply(Status::SyntaxError, "Error: authentication aborted")
                .await?;
            return Ok(Flow::Continue);
        }

        match continuation {
            Continuation::Plain => self.finish_plain(payload.to_string()).await,
            Continuation::LoginUser => match auth::decode_utf8(payload) {
                Ok(username) => {
                    self.reply(Status::AuthChallenge, auth::LOGIN_PASSWORD_CHALLENGE)
                        .await?;
                    self.continuation = Some(Continuation::LoginPass { username });
                    Ok(Flow::Continue)
                }
                Err(err) => {
                    self.reply(Status::SyntaxError, &err.to_string()).await?;
                    Ok(Flow::Continue)
                }
            },
            Continuation::LoginPass { username } => match auth::decode_utf8(payload) {
                Ok(password) => self.finish_auth(username, password, "LOGIN").await,
                Err(err) => {
                    self.reply(Status::SyntaxError, &err.to_string()).await?;
                    Ok(Flow::Continue)
                }
            },
        }
    }

    async fn finish_plain(&mut self, payload: String) -> Result<Flow, SessionError> {
        match auth::decode_plain(&payload) {
            Ok((username, password)) => self.finish_auth(username, password, "PLAIN").await,
            Err(err) => {
                self.reply(Status::SyntaxError, &err.to_string()).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn finish_auth(
        &mut self,
        username: String,
        password: String,
        mechanism: &str,
    ) -> Result<Flow, SessionError> {
        let credentials = Credentials {
            username,
            password,
            mechanism: mechanism.to_string(),
        };

        match self.hooks.on_auth(credentials, &self.session).await {
            Ok(user) => {
                internal!(
                    "[{}] {} authenticated via {}",
                    self.id,
                    user.username,
                    mechanism
                );
                self.session.user = Some(user);
                self.reply(Status::AuthSuccessful, "Authentication successful")
                    .await?;
            }
            Err(err) => {
                self.reply_code(err.code().unwrap_or(535), err.message()).await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handler_xclient(&mut self, line: &str) -> Result<Flow, SessionError> {
        if !self.config.use_xclient || self.xclient.contains_key("ADDR") {
            self.reply(Status::Error, "Error: XCLIENT not allowed").await?;
            return Ok(Flow::Continue);
        }

        if self.session.envelope.mail_from().is_some() {
            self.reply(
                Status::InvalidCommandSequence,
                "Error: MAIL transaction in progress",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let args = line
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest)
            .unwrap_or_default();

        // Validate every key before applying any effect, so a bad token
        // rejects the whole command rather than a prefix of it.
        let pairs = match parse_xclient_args(args) {
            Ok(pairs) if !pairs.is_empty() => pairs,
            Ok(_) => {
                self.reply(Status::SyntaxError, "Error: bad command parameter syntax")
                    .await?;
                return Ok(Flow::Continue);
            }
            Err(reason) => {
                self.reply(Status::SyntaxError, &format!("Error: {reason}")).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut addr_changed = false;
        let mut name_seen = false;

        for (key, value) in &pairs {
            match key.as_str() {
                "LOGIN" => match value {
                    Some(login) if !login.is_empty() => {
                        self.session.user = Some(AuthUser::new(login.clone(), ""));
                    }
                    // LOGIN with an empty or unavailable value deauthenticates.
                    _ => self.session.user = None,
                },
                "ADDR" => {
                    if let Some(addr) = value {
                        self.remote_address = addr.to_ascii_lowercase();
                        // Identity changed underneath the dialogue; the
                        // client has to introduce itself again.
                        self.host_name_appears_as = None;
                        addr_changed = true;
                    }
                }
                "NAME" => {
                    name_seen = true;
                    match value {
                        Some(name) if !name.is_empty() => {
                            self.client_hostname = name.clone();
                        }
                        _ => self.client_hostname = address_literal(&self.remote_address),
                    }
                }
                // PORT, PROTO, and HELO are recorded but have no direct
                // effect on the dialogue.
                _ => {}
            }

            self.xclient
                .insert(key.clone(), value.clone().unwrap_or_default());
        }

        if addr_changed && !name_seen {
            self.client_hostname = address_literal(&self.remote_address);
        }

        self.session.remote_address = self.remote_address.clone();
        self.session.client_hostname = self.client_hostname.clone();

        internal!(
            "[{}] XCLIENT applied; client is now {} ({})",
            self.id,
            self.client_hostname,
            self.remote_address
        );

        self.send_banner().await?;
        Ok(Flow::Continue)
    }

    // Parody stubs kept for bug-for-bug compatibility with historical
    // sendmail behavior. Not security-relevant.

    async fn handler_wiz(&mut self) -> Result<Flow, SessionError> {
        self.session.is_wizard = true;
        self.reply(Status::Ok, "Please pass, oh mighty wizard").await?;
        Ok(Flow::Continue)
    }

    async fn handler_shell(&mut self) -> Result<Flow, SessionError> {
        internal!(level = INFO, "[{}] SHELL attempt from {}", self.id, self.remote_address);
        self.reply(
            Status::CommandUnrecognized,
            "Error: Mere mortals musn't mutter that mantra",
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handler_kill(&mut self) -> Result<Flow, SessionError> {
        self.reply(Status::CommandUnrecognized, "Error: Can't kill Mom").await?;
        Ok(Flow::Continue)
    }

    /// Expect and apply a PROXY protocol v1 header as the first line.
    async fn read_proxy_header(&mut self) -> Result<Flow, SessionError> {
        let idle = self.config.socket_timeout();

        let Some(line) = self.parser.next_line(&mut self.stream, idle).await? else {
            return Ok(Flow::Close);
        };

        let line = String::from_utf8_lossy(&line).into_owned();
        incoming!("[{}] C: {}", self.id, line);

        let mut tokens = line.split_ascii_whitespace();
        let proxied = tokens
            .next()
            .is_some_and(|verb| verb.eq_ignore_ascii_case("PROXY"));

        if !proxied {
            self.reply(Status::CommandUnrecognized, "Invalid PROXY header")
                .await?;
            return Ok(Flow::Close);
        }

        if let Some(address) = tokens.next() {
            self.remote_address = address.to_ascii_lowercase();
            self.session.remote_address = self.remote_address.clone();
        }

        self.resolve_client_hostname().await;

        internal!(
            "[{}] PROXY header accepted; client is {} ({})",
            self.id,
            self.client_hostname,
            self.remote_address
        );

        Ok(Flow::Continue)
    }

    async fn resolve_client_hostname(&mut self) {
        self.client_hostname = match (self.resolver.as_ref(), self.remote_address.parse::<IpAddr>())
        {
            (Some(resolver), Ok(ip)) => resolver
                .reverse(ip)
                .await
                .unwrap_or_else(|| address_literal(&self.remote_address)),
            _ => address_literal(&self.remote_address),
        };

        self.session.client_hostname = self.client_hostname.clone();
    }

    /// STARTTLS is offered when it would be advertised to this client
    /// right now: contexts configured, not hidden, not disabled, and the
    /// transport not already secured.
    fn starttls_offered(&self) -> bool {
        !self.secure
            && self.tls.is_some()
            && !self.config.hide_starttls
            && !self.config.is_disabled(Verb::StartTls)
    }

    async fn send_banner(&mut self) -> Result<(), SessionError> {
        let mut text = format!("{} ESMTP", self.config.name);
        if let Some(extra) = self.config.banner.as_deref() {
            text.push(' ');
            text.push_str(extra);
        }

        self.reply(Status::ServiceReady, &text).await
    }

    /// Replace the session, preserving the connection-scoped user.
    fn reset_session(&mut self) {
        let user = self.session.user.take();

        self.session = Session::create(
            self.id.clone(),
            self.remote_address.clone(),
            self.client_hostname.clone(),
            self.host_name_appears_as.clone(),
            user,
            self.transaction_counter + 1,
        );
    }

    async fn reply(&mut self, status: Status, text: &str) -> Result<(), SessionError> {
        self.reply_code(u16::from(status), text).await
    }

    async fn reply_code(&mut self, code: u16, text: &str) -> Result<(), SessionError> {
        let line = if text.is_empty() {
            code.to_string()
        } else {
            format!("{code} {text}")
        };

        outgoing!("[{}] S: {}", self.id, line);
        self.stream.send(&line).await?;
        Ok(())
    }

    /// Write a multi-line reply: `<code>-<text>` for every line but the
    /// last, `<code> <text>` for the last.
    async fn reply_lines(&mut self, status: Status, lines: &[String]) -> Result<(), SessionError> {
        for (idx, text) in lines.iter().enumerate() {
            let separator = if idx + 1 == lines.len() { ' ' } else { '-' };
            let line = format!("{status}{separator}{text}");

            outgoing!("[{}] S: {}", self.id, line);
            self.stream.send(&line).await?;
        }

        Ok(())
    }

    /// Two-phase teardown; safe to call more than once.
    async fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        self.stream.shutdown().await;
        self.stream = SmtpStream::Closed;

        internal!("[{}] Connection closed", self.id);
    }
}

fn connection_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Resolves only when a shutdown was actually signalled. A closed channel
/// means the owner went away without asking sessions to stop, so it parks
/// forever instead of resolving.
async fn wait_for_shutdown(shutdown: &mut broadcast::Receiver<Signal>) {
    loop {
        match shutdown.recv().await {
            Ok(Signal::Shutdown) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}
