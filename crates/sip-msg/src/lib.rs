// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message model and wire codec.
//!
//! Messages carry a case-insensitive, order-preserving header table and a
//! [`bytes::Bytes`] body. The codec is datagram-oriented: one UDP payload in,
//! one message out, with Content-Length normalised on the way back out.

pub mod headers;
pub mod helpers;
pub mod method;
pub mod msg;
pub mod parse;

pub use headers::{Header, Headers};
pub use helpers::{
    contact_address, copy_headers, cseq_method, cseq_number, decrement_max_forwards,
    expand_contact_values, format_cseq, header_param, replace_header_param, split_contact_list,
    top_via_branch, via_branch,
};
pub use method::Method;
pub use msg::{default_reason, Request, RequestLine, Response, SipMessage, StatusLine};
pub use parse::{parse_message, serialize_message, MessageError, MAX_DATAGRAM_SIZE};
