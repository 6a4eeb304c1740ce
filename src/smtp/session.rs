use super::command::AddressRecord;

/// An authenticated identity, produced by a SASL mechanism through the
/// `on_auth` hook (or injected by a trusted frontend via XCLIENT LOGIN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
    /// The mechanism that produced this identity, e.g. `PLAIN`. Empty when
    /// the identity was asserted by XCLIENT.
    pub mechanism: String,
}

impl AuthUser {
    #[must_use]
    pub fn new<U: Into<String>, M: Into<String>>(username: U, mechanism: M) -> Self {
        Self {
            username: username.into(),
            mechanism: mechanism.into(),
        }
    }
}

/// Credentials collected by a SASL exchange, handed to the `on_auth` hook
/// for verification.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub mechanism: String,
}

/// The per-transaction envelope: the reverse-path and the ordered list of
/// forward-paths accumulated so far.
#[derive(Default, Debug, Clone)]
pub struct Envelope {
    mail_from: Option<AddressRecord>,
    rcpt_to: Vec<AddressRecord>,
}

impl Envelope {
    /// Returns a reference to the [`Envelope`] sender for this message
    #[inline]
    #[must_use]
    pub const fn mail_from(&self) -> Option<&AddressRecord> {
        self.mail_from.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] sender for this message
    #[inline]
    pub fn mail_from_mut(&mut self) -> &mut Option<AddressRecord> {
        &mut self.mail_from
    }

    /// Returns the [`Envelope`] recipients accepted so far, in order
    #[inline]
    #[must_use]
    pub fn rcpt_to(&self) -> &[AddressRecord] {
        &self.rcpt_to
    }

    /// Record an accepted recipient.
    ///
    /// A recipient whose address differs from an existing entry only in
    /// case replaces that entry in place, keeping its position; anything
    /// else is appended.
    pub fn push_rcpt(&mut self, record: AddressRecord) {
        if let Some(existing) = self
            .rcpt_to
            .iter_mut()
            .find(|existing| existing.address.eq_ignore_ascii_case(&record.address))
        {
            *existing = record;
        } else {
            self.rcpt_to.push(record);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mail_from.is_none() && self.rcpt_to.is_empty()
    }
}

/// Per-transaction session state, replaced (never mutated in place) on
/// EHLO, HELO, RSET, and after a completed DATA.
///
/// The authenticated `user` is connection-scoped, not transaction-scoped:
/// it survives every session replacement within one connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// The owning connection's log-correlation tag.
    pub id: String,
    pub remote_address: String,
    pub client_hostname: String,
    /// Lowercased argument of the most recent HELO/EHLO, as snapshot at
    /// session creation.
    pub host_name_appears_as: Option<String>,
    pub user: Option<AuthUser>,
    pub envelope: Envelope,
    /// One-based ordinal of the transaction this session will carry.
    pub transaction: u64,
    pub is_wizard: bool,
}

impl Session {
    #[must_use]
    pub fn create(
        id: String,
        remote_address: String,
        client_hostname: String,
        host_name_appears_as: Option<String>,
        user: Option<AuthUser>,
        transaction: u64,
    ) -> Self {
        Self {
            id,
            remote_address,
            client_hostname,
            host_name_appears_as,
            user,
            envelope: Envelope::default(),
            transaction,
            is_wizard: false,
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::Envelope;
    use crate::smtp::command::AddressRecord;

    fn record(address: &str, args: &[(&str, &str)]) -> AddressRecord {
        AddressRecord {
            address: address.to_string(),
            args: args
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn recipients_keep_order() {
        let mut envelope = Envelope::default();
        envelope.push_rcpt(record("a@x.example", &[]));
        envelope.push_rcpt(record("b@x.example", &[]));
        envelope.push_rcpt(record("c@x.example", &[]));

        let addresses: Vec<&str> = envelope
            .rcpt_to()
            .iter()
            .map(|r| r.address.as_str())
            .collect();
        assert_eq!(addresses, vec!["a@x.example", "b@x.example", "c@x.example"]);
    }

    #[test]
    fn duplicate_recipient_replaces_in_place() {
        let mut envelope = Envelope::default();
        envelope.push_rcpt(record("A@x.example", &[("FOO", "1")]));
        envelope.push_rcpt(record("b@x.example", &[]));
        envelope.push_rcpt(record("a@x.example", &[("FOO", "2")]));

        assert_eq!(envelope.rcpt_to().len(), 2);

        let first = &envelope.rcpt_to()[0];
        assert_eq!(first.address, "a@x.example");
        assert_eq!(first.args.get("FOO").map(String::as_str), Some("2"));
    }
}
