//! Property tests over the header helpers.

use proptest::prelude::*;
use sip_msg::{decrement_max_forwards, header_param, replace_header_param, via_branch, Headers};

proptest! {
    /// Max-Forwards decrements by one and never drops below zero.
    #[test]
    fn max_forwards_never_goes_negative(initial in 0u32..=255) {
        let mut headers = Headers::new();
        headers.push("Max-Forwards", initial.to_string());
        decrement_max_forwards(&mut headers);
        let value: i64 = headers
            .get("Max-Forwards")
            .unwrap()
            .parse()
            .unwrap();
        prop_assert_eq!(value, i64::from(initial.saturating_sub(1)));
        prop_assert!(value >= 0);
    }

    /// The branch written into a Via is the branch read back out.
    #[test]
    fn via_branch_round_trips(suffix in "[a-zA-Z0-9]{1,24}") {
        let branch = format!("z9hG4bK{}", suffix);
        let via = format!("SIP/2.0/UDP proxy.local;branch={}", branch);
        prop_assert_eq!(via_branch(&via), Some(branch.as_str()));
    }

    /// Setting then reading a header parameter is the identity.
    #[test]
    fn header_param_round_trips(value in "[a-zA-Z0-9]{1,16}") {
        let replaced = replace_header_param("<sip:alice@example.com>", "tag", &value);
        prop_assert_eq!(header_param(&replaced, "tag"), Some(value));
    }
}
