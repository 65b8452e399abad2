use crate::rule::RuleKey;
use thiserror::Error;

/// Errors produced by the proxy core and its persistence layer.
///
/// Containment rules:
///
/// - [`RouteError::Connect`] is local to a single relay; it closes that
///   inbound connection and nothing else.
/// - [`RouteError::Bind`] is local to a single rule's activation; other
///   rules keep running.
/// - [`RouteError::DuplicateRule`] and [`RouteError::NotFound`] leave the
///   registry unchanged.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Entry port could not be bound (already in use, permission denied).
    #[error("cannot bind entry port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Outbound destination unreachable, refused, or timed out.
    #[error("cannot connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    /// A route with the same identity triple is already installed.
    #[error("duplicate rule: a route for {0} already exists")]
    DuplicateRule(RuleKey),

    /// No installed route matches the given identity or name.
    #[error("no route found for {0}")]
    NotFound(String),

    /// The registry has been shut down and accepts no new routes.
    #[error("registry is shut down")]
    Closed,

    /// Rule failed validation (port 0, empty host, empty name).
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Rule store failure (CSV parse, record shape).
    #[error("repository error: {0}")]
    Repository(String),

    /// Server configuration failure (file parse, bad listen address).
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RouteResult<T> = Result<T, RouteError>;
