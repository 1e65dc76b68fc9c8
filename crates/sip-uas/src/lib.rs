// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A small stateful UAS with RFC 4028 session timers.
//!
//! Answers INVITE, BYE, UPDATE, and OPTIONS, tracking one dialog per
//! Call-ID + tag pair and refreshing its session interval from
//! `Session-Expires`. Used as the answering peer in interop and proxy tests;
//! it is not part of the proxy pipeline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use sip_msg::{
    copy_headers, header_param, replace_header_param, Headers, Method, Request, Response,
    StatusLine,
};

const DEFAULT_SESSION_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CONTACT: &str = "<sip:server@localhost>";
const ALLOW: &str = "INVITE, ACK, BYE, UPDATE, OPTIONS";

type ClockFn = dyn Fn() -> Instant + Send + Sync;

/// Snapshot of one active dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogState {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub session_interval: Duration,
    pub refresher: String,
    pub last_updated: Instant,
}

impl DialogState {
    /// The point in time when the dialog expires, if timers are active.
    pub fn expiration(&self) -> Option<Instant> {
        if self.session_interval.is_zero() {
            return None;
        }
        Some(self.last_updated + self.session_interval)
    }
}

#[derive(Debug, Clone)]
struct Dialog {
    call_id: String,
    local_tag: String,
    remote_tag: String,
    session_interval: Duration,
    refresher: String,
    last_updated: Instant,
}

impl Dialog {
    fn snapshot(&self) -> DialogState {
        DialogState {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone(),
            session_interval: self.session_interval,
            refresher: self.refresher.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Stateful UAS with session-timer support.
pub struct UserAgentServer {
    dialogs: Mutex<HashMap<String, Dialog>>,
    default_session_interval: Duration,
    contact: String,
    clock: Box<ClockFn>,
}

impl UserAgentServer {
    pub fn new() -> Self {
        Self {
            dialogs: Mutex::new(HashMap::new()),
            default_session_interval: DEFAULT_SESSION_INTERVAL,
            contact: DEFAULT_CONTACT.to_owned(),
            clock: Box::new(Instant::now),
        }
    }

    /// Overrides the default session interval applied when a request does
    /// not carry `Session-Expires`.
    pub fn with_default_session_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.default_session_interval = interval;
        }
        self
    }

    /// Overrides the Contact header placed on responses.
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = contact.into();
        self
    }

    /// Overrides the clock. Mainly intended for tests.
    pub fn with_clock(mut self, clock: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Processes one request, returning the responses to send. ACK produces
    /// nothing.
    pub fn handle_request(&self, req: &Request) -> Vec<Response> {
        match req.start.method {
            Method::Invite => self.handle_invite(req),
            Method::Ack => Vec::new(),
            Method::Bye => self.handle_bye(req),
            Method::Update => self.handle_update(req),
            Method::Options => vec![self.build_response(req, 200, "OK")],
            _ => vec![self.build_response(req, 501, "Not Implemented")],
        }
    }

    fn handle_invite(&self, req: &Request) -> Vec<Response> {
        let call_id = match trimmed_header(&req.headers, "Call-ID") {
            Some(call_id) => call_id,
            None => return vec![self.build_response(req, 400, "Missing Call-ID")],
        };
        let from_tag = req
            .headers
            .get("From")
            .and_then(|from| header_param(from, "tag"));
        let from_tag = match from_tag {
            Some(tag) => tag,
            None => return vec![self.build_response(req, 400, "Missing From tag")],
        };
        let to = req
            .headers
            .get("To")
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default();
        let to_tag = header_param(&to, "tag");

        let (interval, refresher) = match parse_session_expires(
            req.headers
                .get("Session-Expires")
                .map(|v| v.as_str())
                .unwrap_or(""),
        ) {
            Ok(parsed) => parsed,
            Err(()) => return vec![self.build_response(req, 400, "Bad Session-Expires")],
        };

        let now = (self.clock)();
        let mut dialogs = self.dialogs.lock();

        let to_tag = to_tag.unwrap_or_else(new_tag);
        let key = dialog_key(&call_id, &from_tag, &to_tag);
        let dialog = dialogs.entry(key).or_insert_with(|| Dialog {
            call_id,
            local_tag: to_tag,
            remote_tag: from_tag,
            session_interval: self.default_session_interval,
            refresher: "uas".to_owned(),
            last_updated: now,
        });

        let interval = match interval {
            Some(interval) => interval,
            None => {
                let min_se = parse_min_se(
                    req.headers
                        .get("Min-SE")
                        .map(|v| v.as_str())
                        .unwrap_or(""),
                );
                match min_se {
                    Some(min_se) if min_se > self.default_session_interval => min_se,
                    _ => dialog.session_interval,
                }
            }
        };
        if !interval.is_zero() {
            dialog.session_interval = interval;
        }
        if let Some(refresher) = refresher {
            dialog.refresher = refresher;
        }
        dialog.last_updated = now;

        let mut resp = self.build_response(req, 200, "OK");
        resp.headers
            .set("To", ensure_tag_present(&to, &dialog.local_tag));
        resp.headers.set("Contact", self.contact.clone());
        resp.headers.set("Allow", ALLOW);
        resp.headers.set("Supported", "timer");
        resp.headers.set("Require", "timer");
        resp.headers.set(
            "Session-Expires",
            format_session_expires(dialog.session_interval, &dialog.refresher),
        );
        vec![resp]
    }

    fn handle_bye(&self, req: &Request) -> Vec<Response> {
        let call_id = match trimmed_header(&req.headers, "Call-ID") {
            Some(call_id) => call_id,
            None => return vec![self.build_response(req, 400, "Missing Call-ID")],
        };
        let from_tag = tag_of(&req.headers, "From");
        let to_tag = tag_of(&req.headers, "To");

        let removed = {
            let mut dialogs = self.dialogs.lock();
            let key = dialog_key(&call_id, &from_tag, &to_tag);
            dialogs.remove(&key).or_else(|| {
                let swapped = dialog_key(&call_id, &to_tag, &from_tag);
                dialogs.remove(&swapped)
            })
        };

        match removed {
            Some(dialog) => {
                let mut resp = self.build_response(req, 200, "OK");
                let to = req
                    .headers
                    .get("To")
                    .map(|v| v.as_str().to_owned())
                    .unwrap_or_default();
                resp.headers
                    .set("To", ensure_tag_present(&to, &dialog.local_tag));
                resp.headers.set("Contact", self.contact.clone());
                resp.headers.set("Allow", ALLOW);
                vec![resp]
            }
            None => vec![self.build_response(req, 481, "Call/Transaction Does Not Exist")],
        }
    }

    fn handle_update(&self, req: &Request) -> Vec<Response> {
        let call_id = match trimmed_header(&req.headers, "Call-ID") {
            Some(call_id) => call_id,
            None => return vec![self.build_response(req, 400, "Missing Call-ID")],
        };
        let from_tag = tag_of(&req.headers, "From");
        let to_tag = tag_of(&req.headers, "To");

        let (interval, refresher) = match parse_session_expires(
            req.headers
                .get("Session-Expires")
                .map(|v| v.as_str())
                .unwrap_or(""),
        ) {
            Ok(parsed) => parsed,
            Err(()) => return vec![self.build_response(req, 400, "Bad Session-Expires")],
        };

        let now = (self.clock)();
        let mut dialogs = self.dialogs.lock();
        // The refresh may come from either side, so try both tag orders.
        let key = dialog_key(&call_id, &from_tag, &to_tag);
        let swapped = dialog_key(&call_id, &to_tag, &from_tag);
        let key = if dialogs.contains_key(&key) {
            key
        } else if dialogs.contains_key(&swapped) {
            swapped
        } else {
            return vec![self.build_response(req, 481, "Call/Transaction Does Not Exist")];
        };
        let Some(dialog) = dialogs.get_mut(&key) else {
            return vec![self.build_response(req, 481, "Call/Transaction Does Not Exist")];
        };

        if let Some(interval) = interval {
            if !interval.is_zero() {
                dialog.session_interval = interval;
            }
        }
        if let Some(refresher) = refresher {
            dialog.refresher = refresher;
        }
        dialog.last_updated = now;

        let to = req
            .headers
            .get("To")
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default();
        let local_tag = dialog.local_tag.clone();
        let session = format_session_expires(dialog.session_interval, &dialog.refresher);
        drop(dialogs);

        let mut resp = self.build_response(req, 200, "OK");
        resp.headers.set("To", ensure_tag_present(&to, &local_tag));
        resp.headers.set("Contact", self.contact.clone());
        resp.headers.set("Allow", ALLOW);
        resp.headers.set("Supported", "timer");
        resp.headers.set("Require", "timer");
        resp.headers.set("Session-Expires", session);
        vec![resp]
    }

    fn build_response(&self, req: &Request, status: u16, reason: &str) -> Response {
        let mut resp = Response::new(StatusLine::new(status, reason), Headers::new(), Bytes::new());
        copy_headers(
            &mut resp.headers,
            &req.headers,
            &["Via", "From", "To", "Call-ID", "CSeq"],
        );
        resp.ensure_content_length();
        resp
    }

    /// Snapshot of every active dialog, sorted for stable output.
    pub fn active_dialogs(&self) -> Vec<DialogState> {
        let dialogs = self.dialogs.lock();
        let mut states: Vec<DialogState> = dialogs.values().map(Dialog::snapshot).collect();
        states.sort_by(|a, b| {
            (&a.call_id, &a.local_tag, &a.remote_tag).cmp(&(
                &b.call_id,
                &b.local_tag,
                &b.remote_tag,
            ))
        });
        states
    }

    /// Removes dialogs whose session interval has elapsed and returns them.
    pub fn expire_sessions(&self, now: Instant) -> Vec<DialogState> {
        let mut dialogs = self.dialogs.lock();
        let mut expired = Vec::new();
        dialogs.retain(|_, dialog| {
            if dialog.session_interval.is_zero() {
                return true;
            }
            if now > dialog.last_updated + dialog.session_interval {
                expired.push(dialog.snapshot());
                false
            } else {
                true
            }
        });
        expired
    }
}

impl Default for UserAgentServer {
    fn default() -> Self {
        Self::new()
    }
}

fn trimmed_header(headers: &Headers, name: &str) -> Option<String> {
    let value = headers.get(name)?.trim().to_owned();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn tag_of(headers: &Headers, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| header_param(value, "tag"))
        .unwrap_or_default()
}

/// Dialog key: Call-ID plus the sorted non-empty tags.
fn dialog_key(call_id: &str, tag_a: &str, tag_b: &str) -> String {
    let mut tags: Vec<&str> = [tag_a, tag_b]
        .into_iter()
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.sort_unstable();
    format!("{}|{}", call_id, tags.join("|"))
}

fn ensure_tag_present(value: &str, tag: &str) -> String {
    if tag.is_empty() || header_param(value, "tag").is_some() {
        return value.to_owned();
    }
    replace_header_param(value, "tag", tag)
}

/// Parses `Session-Expires: <secs>[;refresher=uac|uas]`. An empty value is
/// `Ok((None, None))`; malformed values are an error.
fn parse_session_expires(value: &str) -> Result<(Option<Duration>, Option<String>), ()> {
    let value = value.trim();
    if value.is_empty() {
        return Ok((None, None));
    }
    let mut parts = value.split(';');
    let seconds: i64 = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| ())?;
    if seconds < 0 {
        return Err(());
    }
    let mut refresher = None;
    for part in parts {
        if let Some((name, value)) = part.trim().split_once('=') {
            if name.trim().eq_ignore_ascii_case("refresher") {
                refresher = Some(value.trim().trim_matches('"').to_ascii_lowercase());
            }
        }
    }
    Ok((Some(Duration::from_secs(seconds as u64)), refresher))
}

fn parse_min_se(value: &str) -> Option<Duration> {
    let seconds: u64 = value.trim().parse().ok()?;
    if seconds == 0 {
        return None;
    }
    Some(Duration::from_secs(seconds))
}

fn format_session_expires(interval: Duration, refresher: &str) -> String {
    if refresher.is_empty() {
        interval.as_secs().to_string()
    } else {
        format!("{};refresher={}", interval.as_secs(), refresher)
    }
}

fn new_tag() -> String {
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
