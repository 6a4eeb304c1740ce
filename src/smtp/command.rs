use core::fmt::{self, Display, Formatter};
use std::collections::HashMap;

/// A command verb the dispatcher knows how to route.
///
/// The verb is the first whitespace-separated token of the command line,
/// compared case-insensitively. Anything else is handled through the
/// unrecognized-command path.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Verb {
    Ehlo,
    Helo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Help,
    Vrfy,
    Quit,
    Auth,
    StartTls,
    XClient,
    Wiz,
    Shell,
    Kill,
}

impl Verb {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "EHLO" => Some(Self::Ehlo),
            "HELO" => Some(Self::Helo),
            "MAIL" => Some(Self::Mail),
            "RCPT" => Some(Self::Rcpt),
            "DATA" => Some(Self::Data),
            "RSET" => Some(Self::Rset),
            "NOOP" => Some(Self::Noop),
            "HELP" => Some(Self::Help),
            "VRFY" => Some(Self::Vrfy),
            "QUIT" => Some(Self::Quit),
            "AUTH" => Some(Self::Auth),
            "STARTTLS" => Some(Self::StartTls),
            "XCLIENT" => Some(Self::XClient),
            "WIZ" => Some(Self::Wiz),
            "SHELL" => Some(Self::Shell),
            "KILL" => Some(Self::Kill),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ehlo => "EHLO",
            Self::Helo => "HELO",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Help => "HELP",
            Self::Vrfy => "VRFY",
            Self::Quit => "QUIT",
            Self::Auth => "AUTH",
            Self::StartTls => "STARTTLS",
            Self::XClient => "XCLIENT",
            Self::Wiz => "WIZ",
            Self::Shell => "SHELL",
            Self::Kill => "KILL",
        }
    }
}

impl Display for Verb {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// A parsed envelope address along with its ESMTP parameters.
///
/// `address` may be empty (the null reverse-path `<>`); the domain part has
/// been decoded from punycode to Unicode. `args` maps the uppercased
/// parameter key to its value, with the sentinel `"true"` standing in for a
/// parameter that carried no `=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: String,
    pub args: HashMap<String, String>,
}

/// Parse a `MAIL FROM:<…> key=value …` or `RCPT TO:<…> key=value …` line.
///
/// `expected` is the verb pair the line must open with, e.g. `"mail from"`.
/// Returns `None` on any syntax failure; the caller answers 501.
#[must_use]
pub fn parse_address_command(line: &str, expected: &str) -> Option<AddressRecord> {
    let (left, rest) = line.split_once(':')?;

    if left.trim().to_ascii_uppercase() != expected.to_ascii_uppercase() {
        return None;
    }

    let mut tokens = rest.split_ascii_whitespace();
    let path = tokens.next()?;

    if !path.starts_with('<') || !path.ends_with('>') || path.len() < 2 {
        return None;
    }

    let mailbox = &path[1..path.len() - 1];
    if mailbox.contains('<') || mailbox.contains('>') {
        return None;
    }

    let address = if mailbox.is_empty() {
        // The null reverse-path is valid for MAIL FROM; RCPT rejects it
        // at the handler level.
        String::new()
    } else {
        if mailbox.matches('@').count() != 1 {
            return None;
        }

        let (local, domain) = mailbox.split_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }

        format!("{local}@{}", domain_to_unicode(domain))
    };

    let mut args = HashMap::new();
    for param in tokens {
        match param.split_once('=') {
            Some((key, value)) => {
                args.insert(key.to_ascii_uppercase(), value.to_string());
            }
            None => {
                args.insert(param.to_ascii_uppercase(), "true".to_string());
            }
        }
    }

    Some(AddressRecord { address, args })
}

/// Decode a punycode (`xn--…`) domain to its Unicode form, keeping the
/// input untouched when it does not decode cleanly.
#[must_use]
pub fn domain_to_unicode(domain: &str) -> String {
    let (unicode, result) = idna::domain_to_unicode(domain);

    if result.is_ok() {
        unicode
    } else {
        domain.to_string()
    }
}

const HTTP_VERBS: [&str; 8] = [
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT",
];

/// Recognize an HTTP request line (`GET / HTTP/1.0` and friends) sent to
/// the SMTP port, matched case-insensitively.
#[must_use]
pub fn is_http_request(line: &str) -> bool {
    let mut tokens = line.split_ascii_whitespace();

    let (Some(verb), Some(path), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return false;
    };

    if !HTTP_VERBS.contains(&verb.to_ascii_uppercase().as_str()) || !path.starts_with('/') {
        return false;
    }

    // The version must be literally `HTTP/<digit>.<digit>`; anything
    // longer is not an HTTP request line and dispatches normally.
    let version = version.to_ascii_uppercase();
    match version.strip_prefix("HTTP/").map(str::as_bytes) {
        Some([major, b'.', minor]) => major.is_ascii_digit() && minor.is_ascii_digit(),
        _ => false,
    }
}

pub const XCLIENT_KEYS: [&str; 6] = ["NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN"];

/// Parse the `KEY=VALUE` tokens following an XCLIENT verb.
///
/// All keys are validated before any effect is applied by the handler, so
/// a bad token rejects the whole command instead of a prefix of it.
/// `[UNAVAILABLE]` and `[TEMPUNAVAIL]` values are treated as absent.
pub fn parse_xclient_args(args: &str) -> Result<Vec<(String, Option<String>)>, String> {
    let mut pairs = Vec::new();

    for token in args.split_ascii_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(format!("Invalid XCLIENT parameter {token}"));
        };

        let key = key.to_ascii_uppercase();
        if !XCLIENT_KEYS.contains(&key.as_str()) {
            return Err(format!("Unknown XCLIENT parameter {key}"));
        }

        let value = match value.to_ascii_uppercase().as_str() {
            "[UNAVAILABLE]" | "[TEMPUNAVAIL]" => None,
            _ => Some(value.to_string()),
        };

        pairs.push((key, value));
    }

    Ok(pairs)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{is_http_request, parse_address_command, parse_xclient_args, Verb};

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> + '_ {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    #[test]
    fn verb_lookup() {
        for comm in string_casing("starttls") {
            assert_eq!(Verb::from_token(&comm), Some(Verb::StartTls));
        }

        assert_eq!(Verb::from_token("MAIL"), Some(Verb::Mail));
        assert_eq!(Verb::from_token("WIZ"), Some(Verb::Wiz));
        assert_eq!(Verb::from_token("EXPN"), None);
    }

    #[test]
    fn mail_from_with_parameters() {
        let record = parse_address_command("MAIL FROM:<a@b.example> SIZE=123", "mail from")
            .expect("should parse");

        assert_eq!(record.address, "a@b.example");
        assert_eq!(record.args.get("SIZE").map(String::as_str), Some("123"));
    }

    #[test]
    fn mail_from_casing_and_spacing() {
        for comm in string_casing("mail from") {
            let record = parse_address_command(&format!("{comm}: <a@b.example>"), "mail from");
            assert!(record.is_some(), "'{comm}' should be accepted");
        }

        assert!(parse_address_command("MAIL FROM:<a@b.example>", "rcpt to").is_none());
    }

    #[test]
    fn null_reverse_path() {
        let record = parse_address_command("MAIL FROM:<>", "mail from").expect("should parse");
        assert_eq!(record.address, "");
        assert!(record.args.is_empty());
    }

    #[test]
    fn malformed_paths() {
        assert!(parse_address_command("MAIL FROM:a@b.example", "mail from").is_none());
        assert!(parse_address_command("MAIL FROM:<a@>", "mail from").is_none());
        assert!(parse_address_command("MAIL FROM:<@b.example>", "mail from").is_none());
        assert!(parse_address_command("MAIL FROM:<a@b@c>", "mail from").is_none());
        assert!(parse_address_command("MAIL FROM:<a<b@c.example>", "mail from").is_none());
        assert!(parse_address_command("MAIL FROM", "mail from").is_none());
    }

    #[test]
    fn valueless_parameter_sentinel() {
        let record = parse_address_command("MAIL FROM:<a@b.example> BODY=8BITMIME SMTPUTF8", "mail from")
            .expect("should parse");

        assert_eq!(record.args.get("BODY").map(String::as_str), Some("8BITMIME"));
        assert_eq!(record.args.get("SMTPUTF8").map(String::as_str), Some("true"));
    }

    #[test]
    fn punycode_domain_decodes() {
        let record = parse_address_command("RCPT TO:<post@xn--mnchen-3ya.example>", "rcpt to")
            .expect("should parse");

        assert_eq!(record.address, "post@münchen.example");
    }

    #[test]
    fn http_request_lines() {
        assert!(is_http_request("GET / HTTP/1.0"));
        assert!(is_http_request("post /cgi-bin/form http/1.1"));
        assert!(is_http_request("CONNECT /tunnel HTTP/2.0"));

        assert!(!is_http_request("GET / HTTP/1"));
        assert!(!is_http_request("GET HTTP/1.0"));
        assert!(!is_http_request("HELO example.com"));
        assert!(!is_http_request("GETTY / HTTP/1.0"));

        // Exactly one digit on either side of the dot.
        assert!(!is_http_request("GET / HTTP/10.0"));
        assert!(!is_http_request("GET / HTTP/1.23"));
        assert!(!is_http_request("GET / HTTP/."));
    }

    #[test]
    fn xclient_pairs() {
        let pairs = parse_xclient_args("ADDR=10.0.0.1 NAME=host.example LOGIN=[UNAVAILABLE]")
            .expect("should parse");

        assert_eq!(
            pairs,
            vec![
                ("ADDR".to_string(), Some("10.0.0.1".to_string())),
                ("NAME".to_string(), Some("host.example".to_string())),
                ("LOGIN".to_string(), None),
            ]
        );

        assert!(parse_xclient_args("BOGUS=1").is_err());
        assert!(parse_xclient_args("ADDR").is_err());
    }
}
