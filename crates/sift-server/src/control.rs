//! Control API for the Sift filtering engine.
//!
//! # Endpoints
//!
//! | Method | Path | Body / Query |
//! |--------|------|--------------|
//! | GET  | `/control/safebrowsing/status` | |
//! | POST | `/control/safebrowsing/enable`, `/disable` | |
//! | GET  | `/control/parental/status` | |
//! | POST | `/control/parental/enable` | optional `sensitivity=3\|10\|13\|17\|EARLY_CHILDHOOD\|YOUNG\|TEEN\|MATURE` |
//! | POST | `/control/parental/disable` | |
//! | GET  | `/control/safesearch/status` | |
//! | POST | `/control/safesearch/enable`, `/disable` | |
//! | GET  | `/control/blocked_services/services` | |
//! | GET  | `/control/blocked_services/list` | |
//! | POST | `/control/blocked_services/set` | JSON array of names |
//! | GET  | `/control/rewrite/list` | |
//! | POST | `/control/rewrite/add`, `/delete` | `{"domain": .., "answer": ..}` |
//! | GET  | `/control/filtering/check_host` | `?name=..&qtype=A` |
//! | GET  | `/control/filtering/stats` | |
//!
//! Every mutating endpoint runs the engine's config-modified hook.

use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hickory_proto::rr::RecordType;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use sift_config::{RewriteEntry, PARENTAL_SENSITIVITIES};
use sift_filter::services::catalog;
use sift_filter::{DnsFilter, FilterResult, FilterStats};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::{Result, ServerError};

// ============================================================================
// Response Types
// ============================================================================

/// `{"enabled": bool}` status body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledStatus {
    /// Whether the feature is on.
    pub enabled: bool,
}

/// Parental status; `sensitivity` is only present while enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentalStatus {
    /// Whether parental control is on.
    pub enabled: bool,
    /// Configured sensitivity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<u8>,
}

/// Error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error message.
    pub error: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(Self {
                error: message.into(),
            }),
        )
            .into_response()
    }
}

/// Query of the check-host diagnostic.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckHostQuery {
    /// Host to check.
    pub name: String,
    /// Query type, `A` by default.
    #[serde(default = "default_qtype")]
    pub qtype: String,
}

fn default_qtype() -> String {
    "A".to_string()
}

/// Parses a parental sensitivity value or its alias.
pub fn parse_sensitivity(value: &str) -> Option<u8> {
    match value.trim() {
        "EARLY_CHILDHOOD" => Some(3),
        "YOUNG" => Some(10),
        "TEEN" => Some(13),
        "MATURE" => Some(17),
        number => number
            .parse::<u8>()
            .ok()
            .filter(|n| PARENTAL_SENSITIVITIES.contains(n)),
    }
}

/// Extracts `sensitivity` from a form-style body (`key=value`, one pair per
/// line or `&`-separated).
fn sensitivity_param(body: &str) -> Option<String> {
    let body = body.trim().replace(['\r', '\n'], "&");
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "sensitivity")
        .map(|(_, value)| value.into_owned())
}

// ============================================================================
// Control Server
// ============================================================================

/// HTTP server exposing the control API.
pub struct ControlServer {
    filter: Arc<DnsFilter>,
}

impl ControlServer {
    /// Creates a control server for `filter`.
    pub fn new(filter: Arc<DnsFilter>) -> Self {
        Self { filter }
    }

    /// Binds `address` and serves until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn run(
        &self,
        address: SocketAddr,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind { address, source })?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        info!(address = %listener.local_addr()?, "Control server listening");

        let router = self.router();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Control server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = router.clone();

                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = TowerToHyperService::new(router);

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "Control connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting control connection");
                    }
                }
            }
        }
    }

    /// Builds the router with all API endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            // Safe browsing
            .route("/control/safebrowsing/status", get(safebrowsing_status))
            .route("/control/safebrowsing/enable", post(safebrowsing_enable))
            .route("/control/safebrowsing/disable", post(safebrowsing_disable))
            // Parental control
            .route("/control/parental/status", get(parental_status))
            .route("/control/parental/enable", post(parental_enable))
            .route("/control/parental/disable", post(parental_disable))
            // Safe search
            .route("/control/safesearch/status", get(safesearch_status))
            .route("/control/safesearch/enable", post(safesearch_enable))
            .route("/control/safesearch/disable", post(safesearch_disable))
            // Blocked services
            .route("/control/blocked_services/services", get(services_catalog))
            .route("/control/blocked_services/list", get(blocked_services_list))
            .route("/control/blocked_services/set", post(blocked_services_set))
            // Rewrites
            .route("/control/rewrite/list", get(rewrite_list))
            .route("/control/rewrite/add", post(rewrite_add))
            .route("/control/rewrite/delete", post(rewrite_delete))
            // Diagnostics
            .route("/control/filtering/check_host", get(check_host))
            .route("/control/filtering/stats", get(filter_stats))
            .with_state(Arc::clone(&self.filter))
    }
}

type FilterState = State<Arc<DnsFilter>>;

// ============================================================================
// Handlers
// ============================================================================

async fn safebrowsing_status(State(filter): FilterState) -> Json<EnabledStatus> {
    Json(EnabledStatus {
        enabled: filter.config().safebrowsing_enabled,
    })
}

async fn safebrowsing_enable(State(filter): FilterState) -> StatusCode {
    filter.set_safebrowsing_enabled(true);
    StatusCode::OK
}

async fn safebrowsing_disable(State(filter): FilterState) -> StatusCode {
    filter.set_safebrowsing_enabled(false);
    StatusCode::OK
}

async fn parental_status(State(filter): FilterState) -> Json<ParentalStatus> {
    let config = filter.config();
    Json(ParentalStatus {
        enabled: config.parental_enabled,
        sensitivity: config
            .parental_enabled
            .then_some(config.parental_sensitivity),
    })
}

/// POST /control/parental/enable
///
/// An empty body keeps the configured sensitivity.
async fn parental_enable(State(filter): FilterState, body: String) -> Response {
    if body.trim().is_empty() {
        filter.set_parental(true, None);
        return StatusCode::OK.into_response();
    }

    let Some(value) = sensitivity_param(&body) else {
        return ApiError::bad_request("sensitivity parameter was not specified");
    };
    let Some(sensitivity) = parse_sensitivity(&value) else {
        return ApiError::bad_request(format!(
            "sensitivity must be one of 3, 10, 13, 17, EARLY_CHILDHOOD, YOUNG, TEEN or MATURE, got '{value}'"
        ));
    };

    filter.set_parental(true, Some(sensitivity));
    info!(sensitivity, "Parental control enabled");
    StatusCode::OK.into_response()
}

async fn parental_disable(State(filter): FilterState) -> StatusCode {
    filter.set_parental(false, None);
    StatusCode::OK
}

async fn safesearch_status(State(filter): FilterState) -> Json<EnabledStatus> {
    Json(EnabledStatus {
        enabled: filter.config().safesearch_enabled,
    })
}

async fn safesearch_enable(State(filter): FilterState) -> StatusCode {
    filter.set_safesearch_enabled(true);
    StatusCode::OK
}

async fn safesearch_disable(State(filter): FilterState) -> StatusCode {
    filter.set_safesearch_enabled(false);
    StatusCode::OK
}

async fn services_catalog() -> Json<Vec<&'static str>> {
    Json(catalog().names())
}

async fn blocked_services_list(State(filter): FilterState) -> Json<Vec<String>> {
    Json(filter.blocked_services())
}

/// POST /control/blocked_services/set
async fn blocked_services_set(State(filter): FilterState, body: String) -> Response {
    let names: Vec<String> = match serde_json::from_str(&body) {
        Ok(names) => names,
        Err(e) => return ApiError::bad_request(format!("JSON parse error: {e}")),
    };
    info!(count = names.len(), "Updated blocked services");
    filter.set_blocked_services(names);
    StatusCode::OK.into_response()
}

async fn rewrite_list(State(filter): FilterState) -> Json<Vec<RewriteEntry>> {
    Json(filter.rewrites())
}

fn parse_rewrite(body: &str) -> std::result::Result<RewriteEntry, Response> {
    let entry: RewriteEntry = serde_json::from_str(body)
        .map_err(|e| ApiError::bad_request(format!("JSON parse error: {e}")))?;
    entry
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(entry)
}

async fn rewrite_add(State(filter): FilterState, body: String) -> Response {
    match parse_rewrite(&body) {
        Ok(entry) => {
            filter.add_rewrite(entry);
            StatusCode::OK.into_response()
        }
        Err(response) => response,
    }
}

/// POST /control/rewrite/delete
///
/// Removes entries equal to the body in both fields; deleting a missing
/// entry is not an error.
async fn rewrite_delete(State(filter): FilterState, body: String) -> Response {
    match parse_rewrite(&body) {
        Ok(entry) => {
            if !filter.delete_rewrite(&entry) {
                debug!(domain = %entry.domain, answer = %entry.answer, "No such rewrite");
            }
            StatusCode::OK.into_response()
        }
        Err(response) => response,
    }
}

/// GET /control/filtering/check_host
async fn check_host(
    State(filter): FilterState,
    Query(query): Query<CheckHostQuery>,
) -> std::result::Result<Json<FilterResult>, Response> {
    let qtype = RecordType::from_str(&query.qtype.to_ascii_uppercase())
        .map_err(|_| ApiError::bad_request(format!("Unknown query type: {}", query.qtype)))?;
    let settings = filter.settings();
    Ok(Json(filter.check_host(&query.name, qtype, &settings).await))
}

async fn filter_stats(State(filter): FilterState) -> Json<FilterStats> {
    Json(filter.stats())
}

// ============================================================================
// Tests
// ============================================================================
