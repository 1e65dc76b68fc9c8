#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use sip_msg::parse_message;

fuzz_target!(|data: &[u8]| {
    let _ = parse_message(&Bytes::copy_from_slice(data));
});
