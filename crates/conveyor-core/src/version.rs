// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build version derivation for build templates.
//!
//! A build template carries a `start_version` such as `v1-rc`. Each new build
//! task derives its version from the previous task's version: the numeric
//! body is incremented while prefix and suffix are preserved, and the result
//! never regresses below the start version's body.

use regex::Regex;
use std::sync::LazyLock;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*[^\d])?(\d+)([^\d].*)?$").expect("version pattern"));

/// Derive the next build version from the template's start version and the
/// most recent task's version.
///
/// `start` is decomposed into prefix, numeric body and suffix. When `current`
/// carries the same prefix and suffix, its numeric body is incremented (but
/// never below the start body); otherwise `start` is returned verbatim.
/// A `start` without a digit block is returned unchanged.
pub fn next_build_version(start: &str, current: &str) -> String {
    let Some(caps) = VERSION_RE.captures(start) else {
        return start.to_string();
    };

    let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let suffix = caps.get(3).map(|m| m.as_str()).unwrap_or("");

    if !current.starts_with(prefix)
        || !current.ends_with(suffix)
        || current.len() < prefix.len() + suffix.len()
    {
        return start.to_string();
    }

    let middle = &current[prefix.len()..current.len() - suffix.len()];
    let Ok(curr) = middle.parse::<i64>() else {
        return start.to_string();
    };
    let Ok(start_body) = body.parse::<i64>() else {
        return start.to_string();
    };

    let next = if start_body > curr { start_body } else { curr + 1 };

    format!("{prefix}{next}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_numeric_start_is_returned_unchanged() {
        assert_eq!(next_build_version("release", "whatever"), "release");
        assert_eq!(next_build_version("", "3"), "");
    }

    #[test]
    fn increments_matching_version() {
        assert_eq!(next_build_version("v1-rc", "v4-rc"), "v5-rc");
        assert_eq!(next_build_version("1.0", "1.41"), "1.42");
        assert_eq!(next_build_version("7", "7"), "8");
    }

    #[test]
    fn never_regresses_below_start_body() {
        assert_eq!(next_build_version("v1-rc", "v0-rc"), "v1-rc");
        assert_eq!(next_build_version("build-100", "build-7"), "build-100");
    }

    #[test]
    fn mismatched_prefix_or_suffix_restarts() {
        assert_eq!(next_build_version("v1-rc", "r4-rc"), "v1-rc");
        assert_eq!(next_build_version("v1-rc", "v4-beta"), "v1-rc");
        assert_eq!(next_build_version("v1-rc", "x"), "v1-rc");
    }

    #[test]
    fn plain_numeric_current_with_suffix_only() {
        assert_eq!(next_build_version("1-rc", "5-rc"), "6-rc");
    }

    #[test]
    fn current_shorter_than_affixes() {
        // "v" both starts with "" and ends with "-rc" cannot hold; guard path.
        assert_eq!(next_build_version("v10-rc", "-rc"), "v10-rc");
    }
}
