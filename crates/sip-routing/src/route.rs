//! Downstream route memory.
//!
//! Responses bypass target resolution: the transport side remembers where
//! each downstream transaction came from, keyed by `METHOD|branch`, and
//! replies are sent back there. Entries expire after a TTL that is extended
//! on every lookup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sip_msg::{cseq_method, top_via_branch, SipMessage};
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct RouteEntry {
    addr: SocketAddr,
    expires: Instant,
}

/// TTL map from transaction key to downstream peer address.
pub struct RouteMemory {
    routes: RwLock<HashMap<SmolStr, RouteEntry>>,
    ttl: Duration,
}

impl RouteMemory {
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self {
            routes: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn remember(&self, key: SmolStr, addr: SocketAddr) {
        if key.is_empty() {
            return;
        }
        let mut routes = self.routes.write();
        routes.insert(
            key,
            RouteEntry {
                addr,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    /// Looks up the peer for a transaction key, extending its TTL on hit.
    pub fn lookup(&self, key: &str) -> Option<SocketAddr> {
        let now = Instant::now();
        let mut routes = self.routes.write();
        let entry = routes.get_mut(key)?;
        if now > entry.expires {
            routes.remove(key);
            return None;
        }
        entry.expires = now + self.ttl;
        Some(entry.addr)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    fn cleanup(&self, now: Instant) {
        self.routes.write().retain(|_, entry| now <= entry.expires);
    }

    /// Periodically drops expired routes until shutdown.
    pub async fn run_cleanup(&self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => self.cleanup(Instant::now()),
            }
        }
    }
}

/// Transaction key for route memory: `METHOD|branch` with the method taken
/// from the request line or, for responses, from CSeq.
pub fn route_key(msg: &SipMessage) -> Option<SmolStr> {
    let branch = top_via_branch(msg)?;
    let method = match msg {
        SipMessage::Request(req) => SmolStr::new(req.start.method.as_str()),
        SipMessage::Response(res) => cseq_method(&res.headers)?,
    };
    Some(SmolStr::new(format!("{}|{}", method, branch)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_msg::{Headers, Method, Request, RequestLine, Response, StatusLine};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn remember_and_lookup() {
        let memory = RouteMemory::new(Duration::from_secs(10));
        memory.remember(SmolStr::new("INVITE|z9hG4bKa"), addr(1000));
        assert_eq!(memory.lookup("INVITE|z9hG4bKa"), Some(addr(1000)));
        assert_eq!(memory.lookup("INVITE|z9hG4bKother"), None);
    }

    #[test]
    fn entries_expire_and_cleanup_drops_them() {
        let memory = RouteMemory::new(Duration::from_millis(5));
        memory.remember(SmolStr::new("OPTIONS|z9hG4bKb"), addr(1001));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(memory.lookup("OPTIONS|z9hG4bKb"), None);

        memory.remember(SmolStr::new("OPTIONS|z9hG4bKc"), addr(1002));
        std::thread::sleep(Duration::from_millis(10));
        memory.cleanup(Instant::now());
        assert!(memory.is_empty());
    }

    #[test]
    fn route_key_for_request_and_response() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client;branch=z9hG4bKkey");
        headers.push("CSeq", "10 INVITE");
        let req = Request::new(
            RequestLine::new(Method::Invite, "sip:bob@example.com"),
            headers.clone(),
            Bytes::new(),
        );
        assert_eq!(
            route_key(&SipMessage::from(req)).unwrap().as_str(),
            "INVITE|z9hG4bKkey"
        );

        let res = Response::new(StatusLine::new(180, ""), headers, Bytes::new());
        assert_eq!(
            route_key(&SipMessage::from(res)).unwrap().as_str(),
            "INVITE|z9hG4bKkey"
        );
    }
}
