//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Blake3 hex digest of a virtualenv spec's raw text.
    SpecHash
);

/// Whether `s` is a complete 40-character lowercase-or-uppercase hex commit hash.
pub fn is_full_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether `s` looks like an abbreviated commit hash (7 to 39 hex characters).
///
/// Abbreviations are ambiguous against the remote and are never accepted as pins.
pub fn is_short_commit_hash(s: &str) -> bool {
    (7..40).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether `s` is an exact package instance id.
///
/// Two encodings exist: the legacy 40-hex sha1 form, and the 44-character
/// unpadded base64url encoding of a sha256 digest followed by the algorithm
/// byte (which always ends in `C`).
pub fn is_instance_id(s: &str) -> bool {
    if is_full_commit_hash(s) {
        return true;
    }
    s.len() == 44
        && s.ends_with('C')
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_hash_display_and_as_ref() {
        let c = SpecHash::new("abc123");
        assert_eq!(c.to_string(), "abc123");
        assert_eq!(c.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&c), "abc123");
    }

    #[test]
    fn spec_hash_serde_is_transparent() {
        let c = SpecHash::new("deadbeef");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: SpecHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn full_hash_detection() {
        assert!(is_full_commit_hash(&"a".repeat(40)));
        assert!(is_full_commit_hash("0123456789abcdefABCDEF0123456789abcdef01"));
        assert!(!is_full_commit_hash(&"a".repeat(39)));
        assert!(!is_full_commit_hash(&"g".repeat(40)));
        assert!(!is_full_commit_hash("refs/heads/main"));
    }

    #[test]
    fn short_hash_detection() {
        assert!(is_short_commit_hash("deadbee"));
        assert!(is_short_commit_hash(&"f".repeat(39)));
        assert!(!is_short_commit_hash("abc"));
        assert!(!is_short_commit_hash(&"f".repeat(40)));
        assert!(!is_short_commit_hash("main"));
    }

    #[test]
    fn instance_id_detection() {
        assert!(is_instance_id(&"1".repeat(40)));
        let b64 = format!("{}C", "A".repeat(43));
        assert!(is_instance_id(&b64));
        assert!(!is_instance_id(&format!("{}D", "A".repeat(43))));
        assert!(!is_instance_id("version:2@1.2.3"));
        assert!(!is_instance_id("latest"));
    }
}
