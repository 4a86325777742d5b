// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opaque token generation.
//!
//! Aliases identify tasks (32 chars) and webhook endpoints (16 chars) from
//! the outside; runner tokens authenticate agents. All are random
//! alphanumeric strings with no embedded meaning.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a task alias.
pub const TASK_ALIAS_LEN: usize = 32;

/// Length of a webhook integration alias.
pub const INTEGRATION_ALIAS_LEN: usize = 16;

/// Length of a runner authentication token.
pub const RUNNER_TOKEN_LEN: usize = 32;

/// Generate a random alphanumeric token of `len` characters.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_requested_length() {
        assert_eq!(random_token(TASK_ALIAS_LEN).len(), 32);
        assert_eq!(random_token(INTEGRATION_ALIAS_LEN).len(), 16);
        assert_eq!(random_token(0).len(), 0);
    }

    #[test]
    fn tokens_are_alphanumeric() {
        let token = random_token(64);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tokens_do_not_repeat() {
        assert_ne!(random_token(32), random_token(32));
    }
}
