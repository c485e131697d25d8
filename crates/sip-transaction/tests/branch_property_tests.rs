// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use proptest::prelude::*;
use sip_core::{Method, MAGIC_COOKIE};
use sip_testkit::{response_to, RequestBuilder};
use sip_transaction::{branch_from_via, generate_branch_id, TransactionKey};

proptest! {
    /// Generated branch IDs always carry the magic cookie.
    #[test]
    fn generated_branch_has_magic_cookie(_iteration in 0..100) {
        let branch = generate_branch_id();
        prop_assert!(branch.starts_with(MAGIC_COOKIE), "Branch: {}", branch);
        prop_assert!(branch.len() > MAGIC_COOKIE.len(), "Branch too short: {}", branch);
    }

    #[test]
    fn generated_branches_are_unique(_iteration in 0..50) {
        prop_assert_ne!(generate_branch_id(), generate_branch_id());
    }

    /// Branch extraction ignores the other Via parameters and their order.
    #[test]
    fn branch_with_multiple_params(
        host in "[a-z]{3,10}",
        branch_suffix in "[a-zA-Z0-9]{8}",
        rport in 1024u16..65535,
        branch_first in any::<bool>(),
    ) {
        let branch = format!("z9hG4bK{}", branch_suffix);
        let via = if branch_first {
            format!("SIP/2.0/UDP {};branch={};rport={}", host, branch, rport)
        } else {
            format!("SIP/2.0/UDP {};rport={};branch={}", host, rport, branch)
        };
        prop_assert_eq!(branch_from_via(&via), Some(branch.as_str()));
    }

    /// A response always resolves to the key of the client transaction that
    /// sent its request.
    #[test]
    fn response_matches_client_key(
        suffix in "[a-zA-Z0-9]{4,16}",
        host in "[a-z]{3,10}\\.example\\.com",
        code in 100u16..700,
    ) {
        let request = RequestBuilder::new(Method::Options)
            .branch(&format!("z9hG4bK{suffix}"))
            .sent_by(&host)
            .build();
        let response = response_to(&request, code, "Reason");
        prop_assert_eq!(
            TransactionKey::client(&request),
            TransactionKey::client_for_response(&response)
        );
    }

    /// Sent-by comparison is case-insensitive; the branch is not.
    #[test]
    fn server_key_sent_by_case(host in "[a-z]{3,10}", suffix in "[a-z0-9]{6}") {
        let branch = format!("z9hG4bK{suffix}");
        let lower = RequestBuilder::new(Method::Invite).branch(&branch).sent_by(&host).build();
        let upper = RequestBuilder::new(Method::Invite)
            .branch(&branch)
            .sent_by(&host.to_ascii_uppercase())
            .build();
        prop_assert_eq!(TransactionKey::server(&lower), TransactionKey::server(&upper));

        let other = RequestBuilder::new(Method::Invite)
            .branch(&branch.to_ascii_uppercase())
            .sent_by(&host)
            .build();
        prop_assert_ne!(TransactionKey::server(&lower), TransactionKey::server(&other));
    }
}
