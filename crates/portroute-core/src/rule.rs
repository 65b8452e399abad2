//! Routing rule data model.
//!
//! A [`RouteRule`] maps one entry port to one destination `host:port`.
//! Identity is the triple `(enter_port, destination_host, destination_port)`
//! captured by [`RuleKey`] — `name` and `description` are metadata and never
//! participate in identity. The registry and repository key on [`RuleKey`]
//! explicitly rather than on whole-rule equality.

use crate::error::{RouteError, RouteResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A configured forwarding rule.
///
/// Immutable once constructed: changing an identity-bearing field of a
/// running rule means removing it and adding a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Human-readable label. Mutable metadata, not part of identity.
    pub name: String,
    /// Local TCP port to accept connections on (1–65535).
    pub enter_port: u16,
    /// Destination hostname or IP address.
    pub destination_host: String,
    /// Destination TCP port (1–65535).
    pub destination_port: u16,
    /// Free-text description.
    pub description: String,
}

impl RouteRule {
    pub fn new(
        name: impl Into<String>,
        enter_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            enter_port,
            destination_host: destination_host.into(),
            destination_port,
            description: description.into(),
        }
    }

    /// The identity triple for this rule.
    pub fn key(&self) -> RuleKey {
        RuleKey {
            enter_port: self.enter_port,
            destination_host: self.destination_host.clone(),
            destination_port: self.destination_port,
        }
    }

    /// Destination rendered as `host:port`, ready for a connect call.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.destination_host, self.destination_port)
    }

    /// Reject rules that can never forward traffic.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidRule`] when either port is 0, or the
    /// name or destination host is empty.
    pub fn validate(&self) -> RouteResult<()> {
        if self.name.trim().is_empty() {
            return Err(RouteError::InvalidRule("name must not be empty".into()));
        }
        if self.enter_port == 0 {
            return Err(RouteError::InvalidRule("enter port must be 1-65535".into()));
        }
        if self.destination_host.trim().is_empty() {
            return Err(RouteError::InvalidRule(
                "destination host must not be empty".into(),
            ));
        }
        if self.destination_port == 0 {
            return Err(RouteError::InvalidRule(
                "destination port must be 1-65535".into(),
            ));
        }
        Ok(())
    }
}

/// The identity triple `(enter_port, destination_host, destination_port)`.
///
/// Two rules with the same key are the same rule regardless of `name` or
/// `description`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    pub enter_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}:{}",
            self.enter_port, self.destination_host, self.destination_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_metadata() {
        let a = RouteRule::new("web", 8080, "10.0.0.1", 80, "frontend");
        let b = RouteRule::new("web-renamed", 8080, "10.0.0.1", 80, "other text");
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_differs_on_triple() {
        let a = RouteRule::new("web", 8080, "10.0.0.1", 80, "");
        let b = RouteRule::new("web", 8081, "10.0.0.1", 80, "");
        let c = RouteRule::new("web", 8080, "10.0.0.2", 80, "");
        let d = RouteRule::new("web", 8080, "10.0.0.1", 81, "");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_ne!(a.key(), d.key());
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        assert!(RouteRule::new("", 8080, "host", 80, "").validate().is_err());
        assert!(RouteRule::new("r", 0, "host", 80, "").validate().is_err());
        assert!(RouteRule::new("r", 8080, "", 80, "").validate().is_err());
        assert!(RouteRule::new("r", 8080, "host", 0, "").validate().is_err());
        assert!(RouteRule::new("r", 8080, "host", 80, "").validate().is_ok());
    }

    #[test]
    fn test_destination_rendering() {
        let rule = RouteRule::new("r", 8080, "localhost", 9000, "");
        assert_eq!(rule.destination(), "localhost:9000");
        assert_eq!(rule.key().to_string(), "8080->localhost:9000");
    }
}
