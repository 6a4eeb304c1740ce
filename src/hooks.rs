//! Application decision hooks.
//!
//! The engine calls out to these between protocol steps; the application
//! gates connections and envelope addresses, consumes message payloads,
//! and verifies credentials. A hook refuses by returning a [`ReplyError`],
//! whose optional code overrides the default reply code for that step
//! (554 for `on_connect` and `on_data`, 550 for the envelope hooks, 535
//! for `on_auth`) and whose message is sent verbatim.

use async_trait::async_trait;

use crate::{
    error::ReplyError,
    smtp::{
        command::AddressRecord,
        parser::BodyStream,
        session::{AuthUser, Credentials, Session},
    },
};

pub type HookResult<T> = Result<T, ReplyError>;

#[async_trait]
pub trait Hooks: Send + Sync + 'static {
    /// Gate an accepted connection before the greeting banner is sent.
    async fn on_connect(&self, _session: &Session) -> HookResult<()> {
        Ok(())
    }

    /// Gate the envelope sender.
    async fn on_mail_from(&self, _address: &AddressRecord, _session: &Session) -> HookResult<()> {
        Ok(())
    }

    /// Gate an envelope recipient.
    async fn on_rcpt_to(&self, _address: &AddressRecord, _session: &Session) -> HookResult<()> {
        Ok(())
    }

    /// Consume the message payload.
    ///
    /// `body` yields the dot-unstuffed message and ends when the client
    /// has sent the terminator. The final reply is not written until both
    /// this hook has returned and the body stream has ended, so the hook
    /// may read incrementally. Returning `Ok(Some(text))` overrides the
    /// default `OK: message queued` reply text.
    async fn on_data(&self, body: BodyStream, _session: &Session) -> HookResult<Option<String>> {
        let mut body = body;
        let mut devnull = tokio::io::sink();

        tokio::io::copy(&mut body, &mut devnull)
            .await
            .map_err(|err| ReplyError::new(format!("Error: failed to read message: {err}")))?;

        Ok(None)
    }

    /// Verify credentials collected by a SASL exchange.
    async fn on_auth(&self, _credentials: Credentials, _session: &Session) -> HookResult<AuthUser> {
        Err(ReplyError::new("Error: Invalid username or password"))
    }
}

/// Hooks that accept every connection, sender, recipient, and message,
/// and refuse every authentication attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl Hooks for AcceptAll {}
