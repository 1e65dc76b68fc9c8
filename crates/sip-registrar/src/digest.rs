//! HTTP Digest (MD5) helpers for REGISTER authentication.

use std::collections::HashMap;

use anyhow::{bail, Result};
use sip_msg::Request;

use crate::DirectoryUser;

/// Parses a `Digest ...` Authorization header into its parameters. Values
/// are unquoted; keys are lowercased. Returns `None` when the header is
/// absent, empty, or not a Digest credential.
pub fn parse_digest_authorization(header: &str) -> Option<HashMap<String, String>> {
    let header = header.trim();
    if header.len() < 7 || !header[..7].eq_ignore_ascii_case("digest ") {
        return None;
    }
    let mut values = HashMap::new();
    for segment in split_auth_params(&header[7..]) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = match segment.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        values.insert(
            key.trim().to_ascii_lowercase(),
            value.trim().trim_matches('"').to_owned(),
        );
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Splits comma-separated auth parameters without breaking quoted strings.
fn split_auth_params(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                buf.push(ch);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    if !buf.is_empty() {
        parts.push(buf);
    }
    parts
}

/// Normalises a stored credential into the HA1 digest. A 32-character hex
/// value is taken verbatim (lowercased); anything else is treated as a
/// plaintext password and hashed as `user:realm:password`.
pub fn compute_ha1(username: &str, realm: &str, stored: &str) -> String {
    let stored = stored.trim();
    if stored.is_empty() {
        return String::new();
    }
    if stored.len() == 32 && is_hex(stored) {
        return stored.to_ascii_lowercase();
    }
    hash_password(username, realm, stored)
}

/// HA1 for a plaintext password.
pub fn hash_password(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{}:{}:{}", username, realm, password))
}

pub fn md5_hex(input: &str) -> String {
    hex::encode(md5::compute(input.as_bytes()).0)
}

fn is_hex(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Constant-time case-insensitive comparison of two hex digests.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies the digest response against the stored credential.
pub fn verify_digest(
    params: &HashMap<String, String>,
    req: &Request,
    user: &DirectoryUser,
    realm: &str,
) -> Result<()> {
    if let Some(algorithm) = params.get("algorithm") {
        if !algorithm.eq_ignore_ascii_case("md5") {
            bail!("unsupported algorithm {}", algorithm);
        }
    }
    let nonce = params.get("nonce").map(String::as_str).unwrap_or("");
    let response = params.get("response").map(String::as_str).unwrap_or("");
    if nonce.is_empty() || response.is_empty() {
        bail!("missing nonce or response");
    }
    let uri = params
        .get("uri")
        .map(String::as_str)
        .filter(|uri| !uri.is_empty())
        .unwrap_or(req.start.uri.as_str());

    let ha1 = compute_ha1(&user.username, realm, &user.password_hash);
    if ha1.is_empty() {
        bail!("missing credentials");
    }
    let ha2 = md5_hex(&format!("{}:{}", req.start.method.as_str(), uri));

    let qop = params
        .get("qop")
        .map(|q| q.to_ascii_lowercase())
        .unwrap_or_default();
    let expected = match qop.as_str() {
        "" => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
        "auth" => {
            let nc = params.get("nc").map(String::as_str).unwrap_or("");
            let cnonce = params.get("cnonce").map(String::as_str).unwrap_or("");
            if nc.is_empty() || cnonce.is_empty() {
                bail!("missing nonce counters");
            }
            md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, nc, cnonce, qop, ha2
            ))
        }
        other => bail!("unsupported qop {}", other),
    };

    if !constant_time_eq(&expected, response) {
        bail!("digest mismatch");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_parameters() {
        let header = concat!(
            "Digest username=\"alice\", realm=\"example.com\", ",
            "nonce=\"abc\", uri=\"sip:example.com\", response=\"d00d\", ",
            "qop=auth, nc=00000001, cnonce=\"xyz, with comma\""
        );
        let params = parse_digest_authorization(header).expect("params");
        assert_eq!(params["username"], "alice");
        assert_eq!(params["realm"], "example.com");
        assert_eq!(params["cnonce"], "xyz, with comma");
        assert_eq!(params["nc"], "00000001");
    }

    #[test]
    fn rejects_non_digest_schemes() {
        assert!(parse_digest_authorization("Basic YWxhZGRpbg==").is_none());
        assert!(parse_digest_authorization("").is_none());
    }

    #[test]
    fn ha1_hex_passthrough() {
        let stored = "5F4DCC3B5AA765D61D8327DEB882CF99";
        assert_eq!(
            compute_ha1("alice", "example.com", stored),
            stored.to_ascii_lowercase()
        );
        assert_eq!(
            compute_ha1("alice", "example.com", "secret"),
            md5_hex("alice:example.com:secret")
        );
        assert_eq!(compute_ha1("alice", "example.com", "  "), "");
    }

    #[test]
    fn constant_time_eq_ignores_case_only() {
        assert!(constant_time_eq("ABCDEF", "abcdef"));
        assert!(!constant_time_eq("abcdef", "abcdee"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
