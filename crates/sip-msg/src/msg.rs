// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::headers::Headers;
use crate::method::Method;

/// First line of a SIP request: `Method SP Request-URI SP SIP/2.0`.
///
/// The Request-URI is carried verbatim; the proxy rewrites it wholesale and
/// only the routing layer ever decomposes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SmolStr,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<SmolStr>) -> Self {
        Self {
            method,
            uri: uri.into(),
        }
    }
}

/// First line of a SIP response: `SIP/2.0 SP Status-Code SP Reason-Phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line, substituting the well-known reason phrase when
    /// an empty one is supplied.
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() {
            SmolStr::new(default_reason(code))
        } else {
            reason
        };
        Self { code, reason }
    }
}

/// Reason phrases for the status codes the proxy emits itself.
pub fn default_reason(code: u16) -> String {
    match code {
        100 => "Trying".to_owned(),
        180 => "Ringing".to_owned(),
        200 => "OK".to_owned(),
        400 => "Bad Request".to_owned(),
        401 => "Unauthorized".to_owned(),
        403 => "Forbidden".to_owned(),
        404 => "Not Found".to_owned(),
        405 => "Method Not Allowed".to_owned(),
        408 => "Request Timeout".to_owned(),
        481 => "Call/Transaction Does Not Exist".to_owned(),
        486 => "Busy Here".to_owned(),
        487 => "Request Terminated".to_owned(),
        500 => "Server Internal Error".to_owned(),
        501 => "Not Implemented".to_owned(),
        503 => "Service Unavailable".to_owned(),
        _ => format!("Status {}", code),
    }
}

/// A SIP request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Updates the Content-Length header to match the body.
    pub fn ensure_content_length(&mut self) {
        let len = self.body.len();
        self.headers.set("Content-Length", len.to_string());
    }
}

/// A SIP response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Builds a bare response with the given status and default reason.
    pub fn with_status(code: u16) -> Self {
        Self::new(StatusLine::new(code, ""), Headers::new(), Bytes::new())
    }

    /// Updates the Content-Length header to match the body.
    pub fn ensure_content_length(&mut self) {
        let len = self.body.len();
        self.headers.set("Content-Length", len.to_string());
    }

    pub fn is_provisional(&self) -> bool {
        self.start.code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    pub fn into_request(self) -> Option<Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    /// Returns the headers regardless of message type.
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(res) => &res.headers,
        }
    }

    /// Returns mutable headers regardless of message type.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Request(req) => &mut req.headers,
            Self::Response(res) => &mut res.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => &req.body,
            Self::Response(res) => &res.body,
        }
    }

    pub fn ensure_content_length(&mut self) {
        match self {
            Self::Request(req) => req.ensure_content_length(),
            Self::Response(res) => res.ensure_content_length(),
        }
    }

    /// One-line summary for log output.
    pub fn summary(&self) -> String {
        match self {
            Self::Request(req) => format!("{} {}", req.start.method, req.start.uri),
            Self::Response(res) => format!("{} {}", res.start.code, res.start.reason),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        Self::Response(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_fills_default_reason() {
        let line = StatusLine::new(486, "");
        assert_eq!(line.reason.as_str(), "Busy Here");
        let line = StatusLine::new(613, "");
        assert_eq!(line.reason.as_str(), "Status 613");
        let line = StatusLine::new(200, "Fine");
        assert_eq!(line.reason.as_str(), "Fine");
    }

    #[test]
    fn ensure_content_length_tracks_body() {
        let mut req = Request::new(
            RequestLine::new(Method::Invite, "sip:bob@example.com"),
            Headers::new(),
            Bytes::from_static(b"v=0"),
        );
        req.ensure_content_length();
        assert_eq!(req.headers.get("Content-Length").unwrap().as_str(), "3");

        req.body = Bytes::new();
        req.ensure_content_length();
        assert_eq!(req.headers.get("Content-Length").unwrap().as_str(), "0");
    }

    #[test]
    fn message_summary() {
        let req = Request::new(
            RequestLine::new(Method::Options, "sip:example.com"),
            Headers::new(),
            Bytes::new(),
        );
        assert_eq!(SipMessage::from(req).summary(), "OPTIONS sip:example.com");
        let res = Response::with_status(404);
        assert_eq!(SipMessage::from(res).summary(), "404 Not Found");
    }
}
