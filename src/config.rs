//! Server configuration, deserialized from TOML.

use std::{collections::HashMap, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;

use crate::{smtp::command::Verb, tls::TlsContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server hostname used in greeting banners. Defaults to the OS
    /// hostname.
    pub name: String,

    /// Optional string appended to the ESMTP greeting banner.
    pub banner: Option<String>,

    /// Maximum message size in bytes, announced via the SIZE extension
    /// and enforced in MAIL (declared size) and DATA (actual size).
    pub size: Option<u64>,

    /// SASL mechanisms offered in EHLO. Empty disables AUTH entirely.
    pub auth_methods: Vec<String>,

    /// Verbs hidden from clients; they answer as unrecognized commands.
    pub disabled_commands: Vec<String>,

    /// Do not advertise STARTTLS, and do not gate AUTH on it.
    pub hide_starttls: bool,

    /// Enable the XCLIENT extension for trusted frontends.
    pub use_xclient: bool,

    /// Expect a PROXY protocol v1 header before the greeting.
    pub use_proxy: bool,

    /// Cap on simultaneously served connections.
    pub max_clients: Option<usize>,

    /// Idle timeout in milliseconds.
    pub socket_timeout_ms: u64,

    /// Serve TLS from the first byte instead of offering STARTTLS.
    pub secure: bool,

    /// Address the listener binds to.
    pub listen: SocketAddr,

    /// Named TLS contexts; `default` is required whenever this table is
    /// non-empty.
    pub tls: HashMap<String, TlsContext>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            banner: None,
            size: None,
            auth_methods: Vec::new(),
            disabled_commands: Vec::new(),
            hide_starttls: false,
            use_xclient: false,
            use_proxy: false,
            max_clients: None,
            socket_timeout_ms: 60_000,
            secure: false,
            listen: ([0, 0, 0, 0], 2525).into(),
            tls: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    #[must_use]
    pub fn is_disabled(&self, verb: Verb) -> bool {
        self.disabled_commands
            .iter()
            .any(|disabled| disabled.eq_ignore_ascii_case(verb.as_str()))
    }

    /// AUTH is supported once at least one mechanism is configured and the
    /// verb itself has not been disabled.
    #[must_use]
    pub fn supports_auth(&self) -> bool {
        !self.auth_methods.is_empty() && !self.is_disabled(Verb::Auth)
    }

    #[must_use]
    pub fn supports_auth_method(&self, mechanism: &str) -> bool {
        self.auth_methods
            .iter()
            .any(|method| method.eq_ignore_ascii_case(mechanism))
    }
}

fn default_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::Config;
    use crate::smtp::command::Verb;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert!(!config.name.is_empty());
        assert_eq!(config.socket_timeout_ms, 60_000);
        assert!(!config.supports_auth());
        assert!(!config.is_disabled(Verb::StartTls));
    }

    #[test]
    fn from_toml() {
        let config: Config = toml::from_str(
            r#"
            name = "mx.example"
            banner = "no spam please"
            size = 1048576
            auth_methods = ["PLAIN", "LOGIN"]
            disabled_commands = ["vrfy"]
            use_xclient = true
            max_clients = 50
            listen = "127.0.0.1:2525"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.name, "mx.example");
        assert_eq!(config.size, Some(1_048_576));
        assert!(config.supports_auth());
        assert!(config.supports_auth_method("plain"));
        assert!(!config.supports_auth_method("CRAM-MD5"));
        assert!(config.is_disabled(Verb::Vrfy));
        assert_eq!(config.max_clients, Some(50));
    }
}
