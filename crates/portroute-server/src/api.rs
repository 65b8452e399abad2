//! HTTP control API — add, delete, and list routing rules at runtime.
//!
//! The wire contract follows the original plain-text protocol:
//!
//! - `POST /add` — body `name,enterPort,destinationHost,destinationPort,description`
//! - `DELETE /delete` — body is the rule name
//! - `GET /list/json` — stored rules as a JSON array
//! - `GET /list/csv` — stored rules as CSV with the repository header
//! - `GET /healthcheck` — liveness probe
//!
//! Persistence is written through in lockstep: the registry call happens
//! first, and the repository is only updated after it succeeded. A
//! repository failure after a successful `add` rolls the registry back, so
//! the two never diverge.

use crate::registry::RouteRegistry;
use crate::repository::CsvRuleRepository;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use portroute_core::{RouteError, RouteResult, RouteRule};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<RouteRegistry>,
    pub repository: Arc<CsvRuleRepository>,
}

/// Build the control API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/add", post(add_rule))
        .route("/delete", delete(delete_rule))
        .route("/list/json", get(list_json))
        .route("/list/csv", get(list_csv))
        .route("/healthcheck", get(healthcheck))
        .with_state(state)
}

/// Bind `addr` and serve the control API until the task is dropped.
pub async fn serve(addr: SocketAddr, state: ApiState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "control API listening");
    axum::serve(listener, router(state)).await
}

async fn healthcheck() -> &'static str {
    "ok"
}

async fn add_rule(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let rule = match parse_rule_body(&body) {
        Ok(rule) => rule,
        Err(e) => {
            debug!(error = %e, "rejected malformed add request");
            return (StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    if let Err(e) = state.registry.add(rule.clone()).await {
        warn!(rule = %rule.key(), error = %e, "add failed");
        return (error_status(&e), e.to_string());
    }

    // Write through to the durable store only after the route is live.
    if let Err(e) = state.repository.create(&rule) {
        warn!(rule = %rule.key(), error = %e, "persisting rule failed, rolling back");
        let _ = state.registry.remove(&rule.key()).await;
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    info!(rule = %rule.key(), name = %rule.name, "routing rule added");
    (StatusCode::OK, "Routing rule added successfully".to_string())
}

async fn delete_rule(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let name = body.trim();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "rule name required".to_string());
    }

    let Some(rule) = state.repository.find_by_name(name) else {
        return (StatusCode::NOT_FOUND, format!("no route found for {name}"));
    };

    // A registry miss is tolerated: the rule may never have activated (for
    // example its port was taken at startup). The stored record still goes.
    match state.registry.remove(&rule.key()).await {
        Ok(()) => {}
        Err(RouteError::NotFound(_)) => {
            debug!(rule = %rule.key(), "rule was stored but not running");
        }
        Err(e) => {
            warn!(rule = %rule.key(), error = %e, "remove failed");
            return (error_status(&e), e.to_string());
        }
    }

    if let Err(e) = state.repository.delete(name) {
        warn!(name, error = %e, "deleting stored rule failed");
        return (error_status(&e), e.to_string());
    }

    info!(rule = %rule.key(), name, "routing rule deleted");
    (StatusCode::OK, "Routing rule deleted successfully".to_string())
}

async fn list_json(State(state): State<ApiState>) -> Json<Vec<RouteRule>> {
    Json(state.repository.list_all())
}

async fn list_csv(State(state): State<ApiState>) -> impl IntoResponse {
    match state.repository.render_csv() {
        Ok(csv_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv")],
            csv_text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Parse the plain-text add body: five comma-separated fields, ports decimal.
fn parse_rule_body(body: &str) -> RouteResult<RouteRule> {
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() != 5 {
        return Err(RouteError::InvalidRule(format!(
            "expected 5 comma-separated fields, got {}",
            parts.len()
        )));
    }

    let enter_port: u16 = parts[1]
        .trim()
        .parse()
        .map_err(|_| RouteError::InvalidRule(format!("bad enter port: {}", parts[1].trim())))?;
    let destination_port: u16 = parts[3]
        .trim()
        .parse()
        .map_err(|_| RouteError::InvalidRule(format!("bad destination port: {}", parts[3].trim())))?;

    let rule = RouteRule::new(
        parts[0].trim(),
        enter_port,
        parts[2].trim(),
        destination_port,
        parts[4].trim(),
    );
    rule.validate()?;
    Ok(rule)
}

fn error_status(error: &RouteError) -> StatusCode {
    match error {
        RouteError::DuplicateRule(_) => StatusCode::CONFLICT,
        RouteError::NotFound(_) => StatusCode::NOT_FOUND,
        RouteError::InvalidRule(_) => StatusCode::BAD_REQUEST,
        RouteError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        RouteError::Bind { .. }
        | RouteError::Connect { .. }
        | RouteError::Repository(_)
        | RouteError::Config(_)
        | RouteError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
