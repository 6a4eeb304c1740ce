//! Reverse DNS resolution for connecting clients.
//!
//! Resolution failure is never fatal: a client without a PTR record is
//! identified as `[<ip>]` instead.

use std::net::IpAddr;

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use crate::internal;

pub struct ReverseResolver {
    inner: TokioAsyncResolver,
}

impl Default for ReverseResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseResolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Resolve the PTR name for `ip`, or `None` when the lookup fails or
    /// yields nothing.
    pub async fn reverse(&self, ip: IpAddr) -> Option<String> {
        match self.inner.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|ptr| ptr.to_string().trim_end_matches('.').to_string()),
            Err(err) => {
                internal!(level = DEBUG, "Reverse lookup for {ip} failed: {err}");
                None
            }
        }
    }
}

/// The `[<ip>]` form used wherever a client has no resolvable name.
#[must_use]
pub fn address_literal(address: &str) -> String {
    format!("[{address}]")
}

#[cfg(test)]
mod test {
    use super::address_literal;

    #[test]
    fn literal_form() {
        assert_eq!(address_literal("192.0.2.1"), "[192.0.2.1]");
        assert_eq!(address_literal("2001:db8::1"), "[2001:db8::1]");
    }
}
