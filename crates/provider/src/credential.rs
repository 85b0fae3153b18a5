//! API key credential

use std::fmt;
use std::sync::Arc;

use common::Secret;

/// An upstream API key plus a non-secret label for logs and health output.
///
/// Cheap to clone. Identity is the key value: two credentials with the same
/// key compare equal whatever their labels.
#[derive(Clone)]
pub struct Credential {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    key: Secret<String>,
}

impl Credential {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                key: Secret::new(key.into()),
            }),
        }
    }

    /// Label such as `key-1`. Safe to log.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Raw key for the outbound request header.
    pub fn expose(&self) -> &str {
        self.inner.key.expose()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.inner.label)
            .field("key", &self.inner.key)
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_shows_label_only() {
        let credential = Credential::new("key-1", "AIzaSy-secret");
        assert_eq!(credential.to_string(), "key-1");
        let debug = format!("{credential:?}");
        assert!(debug.contains("key-1"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("AIzaSy"), "got: {debug}");
    }

    #[test]
    fn identity_is_the_key_value() {
        let a = Credential::new("key-1", "same");
        let b = Credential::new("key-2", "same");
        let c = Credential::new("key-1", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.expose(), "same");
    }
}
