#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use sip_msg::{parse_message, serialize_message};

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = parse_message(&Bytes::copy_from_slice(data)) {
        // Serialization must be parseable again and preserve the start line.
        let wire = serialize_message(&msg);
        let reparsed = parse_message(&wire).expect("serialized message must parse");
        assert_eq!(msg.is_request(), reparsed.is_request());
    }
});
