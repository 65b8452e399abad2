//! portroute-core: Shared library for the portroute TCP reverse proxy.
//!
//! Provides the routing rule data model, the identity key used by the
//! registry and repository, and the error taxonomy shared across the
//! server layers.

pub mod error;
pub mod rule;

// Re-export commonly used items at crate root.
pub use error::{RouteError, RouteResult};
pub use rule::{RouteRule, RuleKey};
