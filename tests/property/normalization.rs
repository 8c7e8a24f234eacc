//! Property-based tests for id normalization and token claim decoding.
//!
//! 1. A user id decodes to the same value whether the wire carries it as a
//!    JSON number or a numeric string.
//! 2. Arbitrary input never panics the claim decoder.
//! 3. Claims produced by the unsigned encoder decode back unchanged.

use casedesk_proto::auth::{Claims, TokenType, decode_claims, encode_unsigned};
use casedesk_proto::ids::{MessageId, UserId};
use casedesk_proto::user::Role;
use proptest::prelude::*;

fn arb_role() -> impl Strategy<Value = Option<Role>> {
    prop_oneof![
        Just(None),
        Just(Some(Role::Admin)),
        Just(Some(Role::Investigator)),
        Just(Some(Role::Victim)),
    ]
}

proptest! {
    #[test]
    fn user_id_number_and_string_agree(raw in any::<u64>()) {
        let as_number: UserId = serde_json::from_str(&raw.to_string()).unwrap();
        let as_string: UserId = serde_json::from_str(&format!("\"{raw}\"")).unwrap();
        prop_assert_eq!(as_number, as_string);
        prop_assert_eq!(as_number.get(), raw);
    }

    #[test]
    fn message_id_parse_matches_deserialize(raw in any::<u64>()) {
        let parsed: MessageId = raw.to_string().parse().unwrap();
        let decoded: MessageId = serde_json::from_str(&raw.to_string()).unwrap();
        prop_assert_eq!(parsed, decoded);
    }

    #[test]
    fn decode_never_panics(input in ".{0,256}") {
        let _ = decode_claims(&input);
    }

    #[test]
    fn claims_survive_unsigned_encoding(
        user in any::<u64>(),
        exp in any::<i64>(),
        role in arb_role(),
        refresh in any::<bool>(),
    ) {
        let claims = Claims {
            user_id: UserId::new(user),
            role,
            exp,
            token_type: Some(if refresh { TokenType::Refresh } else { TokenType::Access }),
            jti: None,
        };
        let token = encode_unsigned(&claims).unwrap();
        prop_assert_eq!(decode_claims(&token).unwrap(), claims);
    }
}
