// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent version comparison.
//!
//! Versions are compared segment by segment after zero-padding every numeric
//! run to [`SEGMENT_WIDTH`] digits, then comparing the padded strings
//! lexicographically. A missing segment is absent rather than zero, so
//! `3.0` sorts before `3.0.0` and the two are not equal.

use std::cmp::Ordering;

/// Digits every numeric run is padded to before comparison.
pub const SEGMENT_WIDTH: usize = 10;

/// Whether `text` looks like an agent version: two to four dot-separated
/// numeric segments (`2.10`, `1.2.3`, `1.2.3.4`) of at most
/// [`SEGMENT_WIDTH`] digits each.
pub fn is_version(text: &str) -> bool {
    let segments: Vec<&str> = text.trim().split('.').collect();
    (2..=4).contains(&segments.len())
        && segments.iter().all(|s| {
            (1..=SEGMENT_WIDTH).contains(&s.len()) && s.chars().all(|c| c.is_ascii_digit())
        })
}

/// Sort key with every numeric run zero-padded.
pub fn padded(version: &str) -> String {
    let mut out = String::with_capacity(version.len() * 2);
    let mut digits = String::new();
    for ch in version.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            flush_digits(&mut digits, &mut out);
            out.push(ch);
        }
    }
    flush_digits(&mut digits, &mut out);
    out
}

fn flush_digits(digits: &mut String, out: &mut String) {
    if digits.is_empty() {
        return;
    }
    let trimmed = digits.trim_start_matches('0');
    let significant = if trimmed.is_empty() { "0" } else { trimmed };
    for _ in significant.len()..SEGMENT_WIDTH {
        out.push('0');
    }
    out.push_str(significant);
    digits.clear();
}

/// Compare two version strings under the padded policy.
pub fn compare(a: &str, b: &str) -> Ordering {
    padded(a).cmp(&padded(b))
}

/// Result of asking a server for its agent version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledVersion {
    /// No recognisable version was reported.
    Missing,
    /// A version string that passed [`is_version`].
    Found(String),
}

impl InstalledVersion {
    /// Interpret raw command output.
    pub fn parse(output: &str) -> Self {
        let text = output.trim();
        if is_version(text) {
            InstalledVersion::Found(text.to_string())
        } else {
            InstalledVersion::Missing
        }
    }

    /// True when the installed agent is at least `required`.
    pub fn satisfies(&self, required: &str) -> bool {
        match self {
            InstalledVersion::Missing => false,
            InstalledVersion::Found(v) => compare(v, required) != Ordering::Less,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_not_lexical() {
        assert_eq!(compare("2.9", "2.10"), Ordering::Less);
        assert_eq!(compare("2.10", "2.9"), Ordering::Greater);
        assert_eq!(compare("10.0", "9.99"), Ordering::Greater);
    }

    #[test]
    fn test_longer_version_with_same_prefix_is_greater() {
        assert_eq!(compare("1.2", "1.2.1"), Ordering::Less);
    }

    #[test]
    fn test_missing_segment_is_not_zero() {
        assert_ne!(compare("3.0.0", "3.0"), Ordering::Equal);
        assert_eq!(compare("3.0", "3.0.0"), Ordering::Less);
    }

    #[test]
    fn test_leading_zeros_are_ignored() {
        assert_eq!(compare("1.02", "1.2"), Ordering::Equal);
    }

    #[test]
    fn test_padded_key() {
        assert_eq!(padded("2.10"), "0000000002.0000000010");
    }

    #[test]
    fn test_is_version() {
        assert!(is_version("0.4"));
        assert!(is_version("0.4.2"));
        assert!(is_version("1.2.3.4"));
        assert!(is_version(" 1.2.3\n"));
        assert!(!is_version("NONE"));
        assert!(!is_version("7"));
        assert!(!is_version("1.2.3.4.5"));
        assert!(!is_version("1.2-beta"));
        assert!(is_version("1.9999999999"));
        assert!(!is_version("1.99999999999"));
    }

    #[test]
    fn test_overlong_segment_is_not_installed_version() {
        assert_eq!(
            InstalledVersion::parse("0.12345678901"),
            InstalledVersion::Missing
        );
        assert!(!InstalledVersion::parse("0.12345678901").satisfies("0.4.2"));
    }

    #[test]
    fn test_installed_version_satisfies() {
        assert!(!InstalledVersion::parse("NONE").satisfies("0.4.2"));
        assert!(!InstalledVersion::parse("bash: flotilla: command not found\nNONE").satisfies("0.1"));
        assert!(InstalledVersion::parse("0.4.2\n").satisfies("0.4.2"));
        assert!(InstalledVersion::parse("0.10.0").satisfies("0.4.2"));
        assert!(!InstalledVersion::parse("0.4.1").satisfies("0.4.2"));
    }
}
