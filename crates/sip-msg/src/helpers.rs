//! Header-level helpers shared across the proxy layers.

use smol_str::SmolStr;

use crate::headers::Headers;
use crate::msg::SipMessage;

/// Extracts the `branch` parameter from a Via header value.
pub fn via_branch(value: &str) -> Option<&str> {
    value.split(';').skip(1).find_map(|segment| {
        let (name, value) = segment.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("branch") {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

/// Returns the branch of the topmost Via header, if any.
pub fn top_via_branch(msg: &SipMessage) -> Option<SmolStr> {
    let via = msg.headers().get_all("Via").next()?;
    via_branch(via.as_str()).map(SmolStr::new)
}

/// Returns the uppercased method token of the CSeq header.
pub fn cseq_method(headers: &Headers) -> Option<SmolStr> {
    let cseq = headers.get("CSeq")?;
    let method = cseq.split_whitespace().nth(1)?;
    Some(SmolStr::new(method.to_ascii_uppercase()))
}

/// Returns the sequence number of the CSeq header.
pub fn cseq_number(headers: &Headers) -> Option<u32> {
    let cseq = headers.get("CSeq")?;
    cseq.split_whitespace().next()?.parse().ok()
}

/// Renders a CSeq value; non-positive numbers are clamped to 1.
pub fn format_cseq(number: u32, method: &str) -> String {
    let number = number.max(1);
    format!("{} {}", number, method.to_ascii_uppercase())
}

/// Copies the named headers (all values) from `src` to `dst`.
pub fn copy_headers(dst: &mut Headers, src: &Headers, names: &[&str]) {
    for name in names {
        let values: Vec<SmolStr> = src.get_all(name).cloned().collect();
        if values.is_empty() {
            continue;
        }
        dst.set_all(SmolStr::new(*name), values);
    }
}

/// Extracts a `;name=value` parameter from a header value, trimming quotes.
pub fn header_param(value: &str, param: &str) -> Option<String> {
    for segment in value.split(';').skip(1) {
        let segment = segment.trim();
        let (name, value) = match segment.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        if name.trim().eq_ignore_ascii_case(param) {
            return Some(value.trim().trim_matches('"').to_owned());
        }
    }
    None
}

/// Replaces a parameter on a header value, appending it when absent.
pub fn replace_header_param(value: &str, param: &str, new_value: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut found = false;
    for (i, segment) in value.split(';').enumerate() {
        let trimmed = segment.trim();
        if trimmed.is_empty() {
            continue;
        }
        if i > 0 {
            if let Some((name, _)) = trimmed.split_once('=') {
                if name.trim().eq_ignore_ascii_case(param) {
                    segments.push(format!("{}={}", param, new_value));
                    found = true;
                    continue;
                }
            }
        }
        segments.push(trimmed.to_owned());
    }
    if !found {
        segments.push(format!("{}={}", param, new_value));
    }
    segments.join(";")
}

/// Decrements Max-Forwards in place, never below zero. A missing or
/// unparsable header is left untouched.
pub fn decrement_max_forwards(headers: &mut Headers) {
    let raw = match headers.get("Max-Forwards") {
        Some(value) => value.trim().to_owned(),
        None => return,
    };
    let value: i64 = match raw.parse() {
        Ok(value) => value,
        Err(_) => return,
    };
    let next = if value > 0 { value - 1 } else { value.max(0) };
    headers.set("Max-Forwards", next.to_string());
}

/// Splits a Contact header into its comma-separated members, respecting
/// quoted strings and angle brackets.
pub fn split_contact_list(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut depth = 0usize;
    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                buf.push(ch);
            }
            '<' => {
                if !in_quotes {
                    depth += 1;
                }
                buf.push(ch);
            }
            '>' => {
                if !in_quotes && depth > 0 {
                    depth -= 1;
                }
                buf.push(ch);
            }
            ',' if !in_quotes && depth == 0 => {
                parts.push(std::mem::take(&mut buf));
            }
            _ => buf.push(ch),
        }
    }
    if !buf.is_empty() {
        parts.push(buf);
    }
    parts
        .into_iter()
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Collects every Contact member across all Contact header values.
pub fn expand_contact_values<'a>(values: impl Iterator<Item = &'a SmolStr>) -> Vec<String> {
    values
        .flat_map(|value| split_contact_list(value.as_str()))
        .collect()
}

/// Strips parameters from a contact member, keeping only the address part.
pub fn contact_address(value: &str) -> String {
    value
        .trim()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use crate::msg::{Request, RequestLine};
    use bytes::Bytes;

    #[test]
    fn extracts_branch_from_via() {
        assert_eq!(
            via_branch("SIP/2.0/UDP host;branch=z9hG4bKabc;received=1"),
            Some("z9hG4bKabc")
        );
        assert_eq!(
            via_branch("SIP/2.0/UDP host;BRANCH=\"z9hG4bKq\""),
            Some("z9hG4bKq")
        );
        assert_eq!(via_branch("SIP/2.0/UDP host"), None);
    }

    #[test]
    fn top_via_branch_uses_first_via() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP a;branch=z9hG4bKone");
        headers.push("Via", "SIP/2.0/UDP b;branch=z9hG4bKtwo");
        let req = Request::new(
            RequestLine::new(Method::Invite, "sip:x@y"),
            headers,
            Bytes::new(),
        );
        assert_eq!(
            top_via_branch(&SipMessage::from(req)).unwrap().as_str(),
            "z9hG4bKone"
        );
    }

    #[test]
    fn cseq_accessors() {
        let mut headers = Headers::new();
        headers.push("CSeq", "314159 INVITE");
        assert_eq!(cseq_method(&headers).unwrap().as_str(), "INVITE");
        assert_eq!(cseq_number(&headers), Some(314159));
        assert_eq!(format_cseq(0, "cancel"), "1 CANCEL");
        assert_eq!(format_cseq(7, "Bye"), "7 BYE");
    }

    #[test]
    fn header_param_roundtrip() {
        let to = "<sip:alice@example.com>;tag=abc123";
        assert_eq!(header_param(to, "tag").as_deref(), Some("abc123"));
        assert_eq!(header_param(to, "expires"), None);
        let replaced = replace_header_param(to, "tag", "xyz");
        assert_eq!(replaced, "<sip:alice@example.com>;tag=xyz");
        let appended = replace_header_param("<sip:alice@example.com>", "tag", "t1");
        assert_eq!(appended, "<sip:alice@example.com>;tag=t1");
    }

    #[test]
    fn max_forwards_decrement() {
        let mut headers = Headers::new();
        headers.push("Max-Forwards", "70");
        decrement_max_forwards(&mut headers);
        assert_eq!(headers.get("Max-Forwards").unwrap().as_str(), "69");

        let mut zero = Headers::new();
        zero.push("Max-Forwards", "0");
        decrement_max_forwards(&mut zero);
        assert_eq!(zero.get("Max-Forwards").unwrap().as_str(), "0");

        let mut missing = Headers::new();
        decrement_max_forwards(&mut missing);
        assert!(missing.get("Max-Forwards").is_none());
    }

    #[test]
    fn contact_list_splitting_respects_quoting() {
        let value = "\"Bob, Jr.\" <sip:bob@h1>;q=0.9, <sip:bob@h2>";
        let parts = split_contact_list(value);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "\"Bob, Jr.\" <sip:bob@h1>;q=0.9");
        assert_eq!(parts[1], "<sip:bob@h2>");
        assert_eq!(contact_address(&parts[0]), "\"Bob, Jr.\" <sip:bob@h1>");
    }

    #[test]
    fn copy_headers_copies_all_values() {
        let mut src = Headers::new();
        src.push("Via", "one");
        src.push("Via", "two");
        src.push("From", "alice");
        let mut dst = Headers::new();
        copy_headers(&mut dst, &src, &["Via", "Call-ID"]);
        let vias: Vec<&str> = dst.get_all("Via").map(|v| v.as_str()).collect();
        assert_eq!(vias, vec!["one", "two"]);
        assert!(dst.get("Call-ID").is_none());
    }
}
