//! Request-URI decomposition for routing.

/// The routable pieces of a SIP URI: user, host, and port (default 5060).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
}

pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Decomposes a Request-URI or contact address into a [`Target`].
///
/// Accepts name-addr forms (`"Bob" <sip:bob@host>`), strips the `sip:` and
/// `sips:` schemes, URI parameters (`;transport=udp`) and URI headers
/// (`?subject=x`), and handles bracketed IPv6 literals.
pub fn parse_target(uri: &str) -> Option<Target> {
    let mut uri = uri.trim();
    if uri.is_empty() {
        return None;
    }

    if let Some(open) = uri.find('<') {
        if let Some(close) = uri[open..].find('>') {
            uri = &uri[open + 1..open + close];
        }
    }
    if let Some(close) = uri.find('>') {
        uri = &uri[..close];
    }

    let lower = uri.to_ascii_lowercase();
    if lower.starts_with("sip:") {
        uri = &uri[4..];
    } else if lower.starts_with("sips:") {
        uri = &uri[5..];
    }

    let uri = uri.split('?').next().unwrap_or_default();
    let uri = uri.split(';').next().unwrap_or_default().trim();
    if uri.is_empty() {
        return None;
    }

    let (user, host_port) = match uri.rfind('@') {
        Some(at) => (uri[..at].trim(), uri[at + 1..].trim()),
        None => ("", uri),
    };
    if host_port.is_empty() {
        return None;
    }

    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by :port.
        let close = rest.find(']')?;
        let host = rest[..close].trim();
        let tail = rest[close + 1..].trim();
        let port = match tail.strip_prefix(':') {
            Some(port) => port.trim().parse().ok()?,
            None if tail.is_empty() => DEFAULT_SIP_PORT,
            None => return None,
        };
        (host.to_owned(), port)
    } else {
        match host_port.rfind(':') {
            // A second colon means an unbracketed IPv6 literal without port.
            Some(colon) if !host_port[colon + 1..].contains(':') => {
                let port = host_port[colon + 1..].trim().parse().ok()?;
                (host_port[..colon].trim().to_owned(), port)
            }
            _ => (host_port.to_owned(), DEFAULT_SIP_PORT),
        }
    };

    let host = host.trim_matches(|c| c == '[' || c == ']').trim().to_owned();
    if host.is_empty() {
        return None;
    }
    Some(Target {
        user: user.to_owned(),
        host,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_uri() {
        let target = parse_target("sip:bob@example.com").unwrap();
        assert_eq!(target.user, "bob");
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, DEFAULT_SIP_PORT);
    }

    #[test]
    fn parses_port_params_and_headers() {
        let target = parse_target("sip:bob@example.com:5080;transport=udp?subject=hi").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 5080);

        let target = parse_target("sips:carol@10.1.2.3;lr").unwrap();
        assert_eq!(target.user, "carol");
        assert_eq!(target.host, "10.1.2.3");
    }

    #[test]
    fn parses_name_addr_form() {
        let target = parse_target("\"Bob\" <sip:bob@h1.example.com:5061>;q=0.5").unwrap();
        assert_eq!(target.user, "bob");
        assert_eq!(target.host, "h1.example.com");
        assert_eq!(target.port, 5061);
    }

    #[test]
    fn parses_ipv6_literals() {
        let target = parse_target("sip:bob@[2001:db8::1]:5070").unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, 5070);

        let target = parse_target("sip:bob@[2001:db8::1]").unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, DEFAULT_SIP_PORT);
    }

    #[test]
    fn parses_hostonly_uri() {
        let target = parse_target("sip:example.com").unwrap();
        assert_eq!(target.user, "");
        assert_eq!(target.host, "example.com");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_target("").is_none());
        assert!(parse_target("sip:").is_none());
        assert!(parse_target("sip:bob@").is_none());
        assert!(parse_target("sip:bob@[2001:db8::1").is_none());
        assert!(parse_target("sip:bob@host:notaport").is_none());
    }
}
