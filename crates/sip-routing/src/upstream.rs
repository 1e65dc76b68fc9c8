// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Upstream target selection.
//!
//! A request leaving upstream is routed in order: a live registrar binding
//! for locally managed domains, the directory's default contact, plain
//! host:port resolution, and finally the configured static upstream.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use sip_msg::{contact_address, SipMessage};
use sip_registrar::{registrar_key, DirectoryUser, Registrar, Registration};
use tracing::debug;

use crate::uri::parse_target;

/// Live-binding lookup. Satisfied by [`Registrar`]; tests substitute stubs.
pub trait BindingSource: Send + Sync {
    fn bindings_for(&self, username: &str, domain: &str) -> Vec<Registration>;
}

impl BindingSource for Registrar {
    fn bindings_for(&self, username: &str, domain: &str) -> Vec<Registration> {
        Registrar::bindings_for(self, username, domain)
    }
}

impl<T: BindingSource + ?Sized> BindingSource for std::sync::Arc<T> {
    fn bindings_for(&self, username: &str, domain: &str) -> Vec<Registration> {
        (**self).bindings_for(username, domain)
    }
}

/// Resolves the UDP destination for upstream-bound messages.
pub struct UpstreamResolver<B: BindingSource> {
    managed_domains: HashSet<String>,
    directory: HashMap<String, DirectoryUser>,
    bindings: B,
    default_upstream: Option<SocketAddr>,
}

impl<B: BindingSource> UpstreamResolver<B> {
    /// Builds a resolver from the warm-up directory snapshot. The managed
    /// domain set is derived from the users' domains.
    pub fn new(users: &[DirectoryUser], bindings: B, default_upstream: Option<SocketAddr>) -> Self {
        let mut managed_domains = HashSet::new();
        let mut directory = HashMap::with_capacity(users.len());
        for user in users {
            let domain = user.domain.trim().to_ascii_lowercase();
            if !domain.is_empty() {
                managed_domains.insert(domain);
            }
            directory.insert(
                registrar_key(user.username.as_str(), user.domain.as_str()),
                user.clone(),
            );
        }
        Self {
            managed_domains,
            directory,
            bindings,
            default_upstream,
        }
    }

    /// Resolves the destination for one upstream-bound message, or `None`
    /// when no route exists (the caller logs and drops).
    pub async fn resolve(&self, msg: &SipMessage) -> Option<SocketAddr> {
        let request = match msg.as_request() {
            Some(request) => request,
            None => return self.default_upstream,
        };

        let target = match parse_target(request.start.uri.as_str()) {
            Some(target) => target,
            None => return self.default_upstream,
        };
        let host = target.host.to_ascii_lowercase();

        if self.managed_domains.contains(&host) {
            if let Some(addr) = self.resolve_registrar_target(&target.user, &host).await {
                return Some(addr);
            }
            if let Some(addr) = self.resolve_directory_target(&target.user, &host).await {
                return Some(addr);
            }
        }

        if let Some(addr) = resolve_host_port(&target.host, target.port).await {
            return Some(addr);
        }

        self.default_upstream
    }

    async fn resolve_registrar_target(&self, user: &str, domain: &str) -> Option<SocketAddr> {
        if user.is_empty() || domain.is_empty() {
            return None;
        }
        for binding in self.bindings.bindings_for(user, domain) {
            let contact = contact_address(&binding.contact);
            let contact = if contact.is_empty() {
                binding.contact.as_str()
            } else {
                &contact
            };
            if let Some(target) = parse_target(contact) {
                if let Some(addr) = resolve_host_port(&target.host, target.port).await {
                    return Some(addr);
                }
            }
        }
        None
    }

    async fn resolve_directory_target(&self, user: &str, domain: &str) -> Option<SocketAddr> {
        if user.is_empty() || domain.is_empty() {
            return None;
        }
        let entry = self.directory.get(&registrar_key(user, domain))?;
        if entry.contact_uri.is_empty() {
            return None;
        }
        let target = parse_target(&entry.contact_uri)?;
        resolve_host_port(&target.host, target.port).await
    }
}

/// Resolves `host:port` to a socket address, consulting DNS for names.
async fn resolve_host_port(host: &str, port: u16) -> Option<SocketAddr> {
    if host.is_empty() {
        return None;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(err) => {
            debug!(host, port, error = %err, "DNS resolution failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_msg::{Headers, Method, Request, RequestLine, Response, StatusLine};
    use smol_str::SmolStr;
    use std::time::Instant;

    struct StubBindings(Vec<(String, Vec<Registration>)>);

    impl BindingSource for StubBindings {
        fn bindings_for(&self, username: &str, domain: &str) -> Vec<Registration> {
            let key = registrar_key(username, domain);
            self.0
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, regs)| regs.clone())
                .unwrap_or_default()
        }
    }

    fn users() -> Vec<DirectoryUser> {
        vec![
            DirectoryUser {
                username: SmolStr::new("alice"),
                domain: SmolStr::new("example.com"),
                password_hash: String::new(),
                contact_uri: String::new(),
            },
            DirectoryUser {
                username: SmolStr::new("bob"),
                domain: SmolStr::new("example.com"),
                password_hash: String::new(),
                contact_uri: "sip:bob@127.0.0.1:6000".to_owned(),
            },
        ]
    }

    fn invite(uri: &str) -> SipMessage {
        Request::new(
            RequestLine::new(Method::Invite, uri),
            Headers::new(),
            Bytes::new(),
        )
        .into()
    }

    fn resolver(default: Option<SocketAddr>) -> UpstreamResolver<StubBindings> {
        let bindings = StubBindings(vec![(
            "alice@example.com".to_owned(),
            vec![Registration {
                contact: "<sip:alice@127.0.0.1:5070>;expires=60".to_owned(),
                expires: Instant::now() + std::time::Duration::from_secs(60),
            }],
        )]);
        UpstreamResolver::new(&users(), bindings, default)
    }

    #[tokio::test]
    async fn registrar_binding_wins_for_managed_domain() {
        let resolver = resolver(None);
        let addr = resolver
            .resolve(&invite("sip:alice@example.com"))
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:5070".parse().unwrap());
    }

    #[tokio::test]
    async fn directory_contact_is_second_choice() {
        let resolver = resolver(None);
        let addr = resolver
            .resolve(&invite("sip:bob@example.com"))
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:6000".parse().unwrap());
    }

    #[tokio::test]
    async fn literal_host_resolves_directly() {
        let resolver = resolver(None);
        let addr = resolver
            .resolve(&invite("sip:carol@127.0.0.1:5080"))
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:5080".parse().unwrap());
    }

    #[tokio::test]
    async fn default_upstream_is_last_resort() {
        let default: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let resolver = resolver(Some(default));
        // Unknown user in a managed domain with an unresolvable host part.
        let addr = resolver.resolve(&invite("sip:")).await;
        assert_eq!(addr, Some(default));
    }

    #[tokio::test]
    async fn responses_use_default_upstream() {
        let default: SocketAddr = "127.0.0.1:9998".parse().unwrap();
        let resolver = resolver(Some(default));
        let response: SipMessage =
            Response::new(StatusLine::new(200, ""), Headers::new(), Bytes::new()).into();
        assert_eq!(resolver.resolve(&response).await, Some(default));
    }

    #[tokio::test]
    async fn no_route_yields_none() {
        let resolver = resolver(None);
        assert_eq!(resolver.resolve(&invite("sip:")).await, None);
    }
}
