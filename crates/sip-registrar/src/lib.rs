// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Local REGISTER termination.
//!
//! The registrar authenticates REGISTER requests with HTTP Digest (MD5)
//! against the user directory and keeps an in-memory binding table keyed by
//! address-of-record. Bindings are rebuilt from re-REGISTERs after a restart;
//! only identities and credentials are durable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use sip_msg::{
    copy_headers, expand_contact_values, header_param, replace_header_param, Headers, Request,
    Response, StatusLine,
};
use smol_str::SmolStr;
use tracing::{debug, warn};

pub mod digest;

use digest::{parse_digest_authorization, verify_digest};

/// A user directory entry as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    pub username: SmolStr,
    pub domain: SmolStr,
    /// Either a 32-hex HA1 digest or a plaintext password.
    pub password_hash: String,
    /// Default contact used by routing when the user has no live binding.
    pub contact_uri: String,
}

/// Read access to the user directory. `Ok(None)` means the user does not
/// exist; `Err` is a backend failure and maps to a 500 on REGISTER.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn lookup(&self, username: &str, domain: &str) -> Result<Option<DirectoryUser>>;
    async fn all_users(&self) -> Result<Vec<DirectoryUser>>;
}

/// In-memory directory used by tests and small deployments.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: Vec<DirectoryUser>,
}

impl MemoryDirectory {
    pub fn new(users: Vec<DirectoryUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn lookup(&self, username: &str, domain: &str) -> Result<Option<DirectoryUser>> {
        Ok(self
            .users
            .iter()
            .find(|u| {
                u.username.eq_ignore_ascii_case(username) && u.domain.eq_ignore_ascii_case(domain)
            })
            .cloned())
    }

    async fn all_users(&self) -> Result<Vec<DirectoryUser>> {
        Ok(self.users.clone())
    }
}

/// An active contact binding.
#[derive(Debug, Clone)]
struct ContactBinding {
    contact: String,
    expires: Instant,
}

/// Snapshot of a binding handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub contact: String,
    pub expires: Instant,
}

type ClockFn = dyn Fn() -> Instant + Send + Sync;
type NonceFn = dyn Fn() -> String + Send + Sync;

/// Maintains client bindings registered via REGISTER.
pub struct Registrar {
    store: Arc<dyn DirectoryStore>,
    clock: Box<ClockFn>,
    nonce: Box<NonceFn>,
    bindings: Mutex<HashMap<String, Vec<ContactBinding>>>,
}

const DEFAULT_EXPIRES_SECS: u64 = 3600;

impl Registrar {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            store,
            clock: Box::new(Instant::now),
            nonce: Box::new(new_nonce),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the clock. Mainly intended for tests.
    pub fn with_clock(mut self, clock: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Overrides the nonce generator. Mainly intended for tests.
    pub fn with_nonce(mut self, nonce: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.nonce = Box::new(nonce);
        self
    }

    /// Processes a REGISTER request and produces the response to send
    /// downstream. Once a registrar is configured it always terminates
    /// REGISTER locally.
    pub async fn handle_register(&self, req: &Request) -> Response {
        let to = req
            .headers
            .get("To")
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default();
        let (username, domain) = match parse_address_of_record(&to) {
            Some(parts) => parts,
            None => {
                debug!(to = %to, "REGISTER with unparsable address of record");
                return registrar_response(req, 400, "Bad Request");
            }
        };

        let user = match self.store.lookup(&username, &domain).await {
            Ok(Some(user)) => user,
            Ok(None) => return registrar_response(req, 404, "Not Found"),
            Err(err) => {
                warn!(error = %err, user = %username, domain = %domain, "directory lookup failed");
                return registrar_response(req, 500, "Server Internal Error");
            }
        };

        let auth = req
            .headers
            .get("Authorization")
            .and_then(|value| parse_digest_authorization(value.as_str()));
        let params = match auth {
            Some(params) => params,
            None => {
                let mut resp = registrar_response(req, 401, "Unauthorized");
                let challenge = format!(
                    "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
                    domain,
                    (self.nonce)()
                );
                resp.headers.set("WWW-Authenticate", challenge);
                ensure_to_tag(&mut resp);
                return resp;
            }
        };

        let realm = params
            .get("realm")
            .map(String::as_str)
            .filter(|realm| !realm.is_empty())
            .unwrap_or(&domain)
            .to_owned();
        let username_matches = params
            .get("username")
            .is_some_and(|u| u.eq_ignore_ascii_case(user.username.as_str()));
        if !username_matches || !realm.eq_ignore_ascii_case(user.domain.as_str()) {
            let mut resp = registrar_response(req, 403, "Forbidden");
            ensure_to_tag(&mut resp);
            return resp;
        }

        if let Err(err) = verify_digest(&params, req, &user, &realm) {
            debug!(error = %err, user = %username, "digest verification failed");
            let mut resp = registrar_response(req, 403, "Forbidden");
            ensure_to_tag(&mut resp);
            return resp;
        }

        let key = registrar_key(user.username.as_str(), user.domain.as_str());
        let bindings = match self.apply_registration(&key, req) {
            Ok(bindings) => bindings,
            Err((status, reason)) => {
                let mut resp = registrar_response(req, status, reason);
                ensure_to_tag(&mut resp);
                return resp;
            }
        };

        let mut resp = registrar_response(req, 200, "OK");
        if !bindings.is_empty() {
            let now = (self.clock)();
            let contacts: Vec<SmolStr> = bindings
                .iter()
                .map(|binding| {
                    let remaining = binding.expires.saturating_duration_since(now).as_secs();
                    SmolStr::new(normalize_contact(&binding.contact, remaining))
                })
                .collect();
            resp.headers.set_all("Contact", contacts);
        }
        ensure_to_tag(&mut resp);
        resp
    }

    /// Applies the Contact values of a REGISTER under one critical section.
    fn apply_registration(
        &self,
        key: &str,
        req: &Request,
    ) -> std::result::Result<Vec<ContactBinding>, (u16, &'static str)> {
        let now = (self.clock)();
        let mut table = self.bindings.lock();

        let mut active: Vec<ContactBinding> = table
            .get(key)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| b.expires > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let contacts = expand_contact_values(req.headers.get_all("Contact"));
        let default_expires = parse_expires(
            req.headers
                .get("Expires")
                .map(|v| v.as_str())
                .unwrap_or(""),
        );

        if contacts.is_empty() {
            table.insert(key.to_owned(), active.clone());
            return Ok(active);
        }

        if contacts.len() == 1 && contacts[0].trim() == "*" {
            if default_expires != Some(0) {
                return Err((400, "Invalid wildcard contact"));
            }
            table.remove(key);
            return Ok(Vec::new());
        }

        for raw in contacts {
            let address = sip_msg::contact_address(&raw);
            if address.is_empty() {
                return Err((400, "Invalid Contact header"));
            }
            let expires = header_param(&raw, "expires")
                .and_then(|v| parse_expires(&v))
                .or(default_expires)
                .unwrap_or(DEFAULT_EXPIRES_SECS);
            let key_of_new = contact_key(&raw);
            active.retain(|b| !contact_key(&b.contact).eq_ignore_ascii_case(&key_of_new));
            if expires == 0 {
                continue;
            }
            active.push(ContactBinding {
                contact: normalize_contact(&raw, expires),
                expires: now + Duration::from_secs(expires),
            });
        }

        table.insert(key.to_owned(), active.clone());
        Ok(active)
    }

    /// Returns active bindings for the user, purging expired entries under
    /// the lock.
    pub fn bindings_for(&self, username: &str, domain: &str) -> Vec<Registration> {
        let key = registrar_key(username, domain);
        let now = (self.clock)();
        let mut table = self.bindings.lock();
        let Some(existing) = table.get_mut(&key) else {
            return Vec::new();
        };
        existing.retain(|b| b.expires > now);
        if existing.is_empty() {
            table.remove(&key);
            return Vec::new();
        }
        existing
            .iter()
            .map(|b| Registration {
                contact: b.contact.clone(),
                expires: b.expires,
            })
            .collect()
    }
}

/// Lowercased `user@domain` table key.
pub fn registrar_key(username: &str, domain: &str) -> String {
    format!(
        "{}@{}",
        username.trim().to_ascii_lowercase(),
        domain.trim().to_ascii_lowercase()
    )
}

fn registrar_response(req: &Request, status: u16, reason: &str) -> Response {
    let mut resp = Response::new(StatusLine::new(status, reason), Headers::new(), Bytes::new());
    copy_headers(
        &mut resp.headers,
        &req.headers,
        &["Via", "From", "To", "Call-ID", "CSeq"],
    );
    resp.ensure_content_length();
    resp
}

/// Attaches a freshly generated tag to the To header unless one is present.
fn ensure_to_tag(resp: &mut Response) {
    let to = match resp.headers.get("To") {
        Some(to) => to.as_str().to_owned(),
        None => return,
    };
    if to.to_ascii_lowercase().contains(";tag=") {
        return;
    }
    resp.headers
        .set("To", replace_header_param(&to, "tag", &new_tag()));
}

/// Extracts `(user, domain)` from a To header value.
pub fn parse_address_of_record(to: &str) -> Option<(String, String)> {
    let mut to = to.trim();
    if to.is_empty() {
        return None;
    }
    if let Some(open) = to.find('<') {
        if let Some(close) = to[open..].find('>') {
            to = &to[open + 1..open + close];
        }
    }
    if let Some(close) = to.find('>') {
        to = &to[..close];
    }
    let mut to = to.trim();
    let lower = to.to_ascii_lowercase();
    if lower.starts_with("sip:") {
        to = &to[4..];
    } else if lower.starts_with("sips:") {
        to = &to[5..];
    }
    let to = to.split(';').next().unwrap_or_default();
    let (user, domain) = to.split_once('@')?;
    let user = user.trim();
    let domain = domain.trim();
    if user.is_empty() || domain.is_empty() {
        return None;
    }
    Some((user.to_owned(), domain.to_owned()))
}

/// Parses an Expires value: `None` for absent or unparsable input, negative
/// values clamp to zero.
fn parse_expires(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<i64>() {
        Ok(value) if value < 0 => Some(0),
        Ok(value) => Some(value as u64),
        Err(_) => None,
    }
}

fn contact_key(value: &str) -> String {
    sip_msg::contact_address(value).to_ascii_lowercase()
}

/// Rebuilds a contact value with any existing `expires=` parameter removed
/// and the given one appended.
fn normalize_contact(value: &str, expires: u64) -> String {
    let mut segments = value.split(';');
    let base = segments.next().unwrap_or_default().trim().to_owned();
    let mut params: Vec<String> = Vec::new();
    for segment in segments {
        let trimmed = segment.trim();
        if trimmed.is_empty() || trimmed.to_ascii_lowercase().starts_with("expires=") {
            continue;
        }
        params.push(trimmed.to_owned());
    }
    params.push(format!("expires={}", expires));
    let mut out = base;
    for param in params {
        out.push(';');
        out.push_str(&param);
    }
    out
}

fn new_nonce() -> String {
    let mut buf = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn new_tag() -> String {
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
