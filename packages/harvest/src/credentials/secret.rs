//! Secret strings for API tokens.
//!
//! Uses the `secrecy` crate to prevent accidental logging of sensitive values.

use secrecy::{ExposeSecret, SecretBox};
use sha2::{Digest, Sha256};
use std::fmt;

/// A secret string that won't be logged or displayed.
///
/// Uses `secrecy::SecretBox` to ensure API keys and other credentials
/// are never accidentally exposed in logs, debug output, or error messages.
pub struct SecretString(SecretBox<str>);

impl SecretString {
    /// Create a new secret string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(Box::from(value.into().as_str())))
    }

    /// Expose the secret value for use.
    ///
    /// Only call this when actually using the secret (e.g., in an API request).
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for SecretString {}

/// Short, stable, non-reversible identifier for a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_not_in_debug() {
        let secret = SecretString::new("AIzaSy-super-secret-key");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("AIzaSy-super"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_secret_not_in_display() {
        let secret = SecretString::new("AIzaSy-super-secret-key");
        let display = format!("{}", secret);
        assert!(!display.contains("AIzaSy-super"));
        assert!(display.contains("[REDACTED]"));
    }

    #[test]
    fn test_expose_works() {
        let secret = SecretString::new("AIzaSy-super-secret-key");
        assert_eq!(secret.expose(), "AIzaSy-super-secret-key");
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = fingerprint("AIzaSy-one");
        assert_eq!(a.len(), 8);
        assert_eq!(a, fingerprint("AIzaSy-one"));
        assert_ne!(a, fingerprint("AIzaSy-two"));
        assert!(!a.contains("AIza"));
    }

    #[test]
    fn test_equality_compares_values() {
        assert_eq!(SecretString::new("k1"), SecretString::from("k1"));
        assert_ne!(SecretString::new("k1"), SecretString::new("k2"));
    }
}
