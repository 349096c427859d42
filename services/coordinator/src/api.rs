use crate::config::ApiConfig;
use crate::error::IngestError;
use crate::fingerprint::Fingerprint;
use crate::ingest::{
    BatchUploadResponse, ConfirmSummary, IngestCoordinator, MatchStatus, MatchedPhoto,
    SelfieAccepted,
};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IngestCoordinator>,
    pub db_pool: PgPool,
}

/// Batch credential request
#[derive(Debug, Deserialize)]
pub struct BatchUploadRequest {
    /// Client-computed fingerprints of the images it intends to upload
    pub fingerprints: Vec<String>,
}

/// Batch confirmation request
#[derive(Debug, Deserialize)]
pub struct ConfirmUploadRequest {
    /// Fingerprints the client asserts were successfully uploaded
    pub fingerprints: Vec<String>,
}

/// Match poll response
#[derive(Debug, Serialize)]
pub struct MatchPollResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<MatchedPhoto>>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(e: IngestError) -> ApiError {
    let (status, code) = match &e {
        IngestError::DuplicateContent => (StatusCode::CONFLICT, "DUPLICATE_CONTENT"),
        IngestError::InvalidImage(_) => (StatusCode::BAD_REQUEST, "INVALID_IMAGE"),
        IngestError::Ledger(_)
        | IngestError::Metadata(_)
        | IngestError::ObjectStore(_)
        | IngestError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE"),
    };

    if status == StatusCode::SERVICE_UNAVAILABLE {
        error!(error = %e, "Request failed on a backing store");
    }

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/uploads/batch", post(batch_upload_urls))
        .route("/api/v1/uploads/confirm", post(confirm_uploads))
        .route("/api/v1/selfies", post(submit_selfie))
        .route("/api/v1/selfies/:selfie_id/matches", get(selfie_matches))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "coordinator-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Issue write credentials for the new fingerprints in a batch.
///
/// Malformed fingerprints become per-item failures; they never fail the batch.
#[instrument(skip(state, request), fields(batch_size = request.fingerprints.len()))]
async fn batch_upload_urls(
    State(state): State<AppState>,
    Json(request): Json<BatchUploadRequest>,
) -> Result<Json<BatchUploadResponse>, ApiError> {
    let (fingerprints, parse_failures) = parse_fingerprints(&request.fingerprints);

    let mut response = state
        .coordinator
        .issue_upload_credentials(fingerprints)
        .await
        .map_err(error_response)?;

    response.failures.extend(parse_failures);

    Ok(Json(response))
}

/// Finalize client-reported uploads
#[instrument(skip(state, request), fields(batch_size = request.fingerprints.len()))]
async fn confirm_uploads(
    State(state): State<AppState>,
    Json(request): Json<ConfirmUploadRequest>,
) -> Result<Json<ConfirmSummary>, ApiError> {
    let (fingerprints, parse_failures) = parse_fingerprints(&request.fingerprints);

    let mut summary = state
        .coordinator
        .confirm_event_uploads(fingerprints)
        .await
        .map_err(error_response)?;

    summary.failures.extend(parse_failures);

    Ok(Json(summary))
}

/// Synchronous selfie intake: raw image bytes in, selfie id and owner token
/// out, or a 409 when the same bytes are already known or in flight.
#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn submit_selfie(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SelfieAccepted>), ApiError> {
    let accepted = state
        .coordinator
        .ingest_selfie(body)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(accepted)))
}

/// Poll the match status of a previously submitted selfie
#[instrument(skip(state))]
async fn selfie_matches(
    State(state): State<AppState>,
    Path(selfie_id): Path<String>,
) -> Result<Json<MatchPollResponse>, ApiError> {
    let fingerprint: Fingerprint = selfie_id.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "malformed selfie id".to_string(),
                code: "INVALID_FINGERPRINT".to_string(),
            }),
        )
    })?;

    let status = state
        .coordinator
        .poll_matches(&fingerprint)
        .await
        .map_err(error_response)?;

    match status {
        MatchStatus::NotFound => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "selfie not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
        MatchStatus::Pending => Ok(Json(MatchPollResponse {
            status: "pending",
            matches: None,
        })),
        MatchStatus::Failed => Ok(Json(MatchPollResponse {
            status: "failed",
            matches: None,
        })),
        MatchStatus::Completed(matches) => Ok(Json(MatchPollResponse {
            status: "completed",
            matches: Some(matches),
        })),
    }
}

/// Split raw fingerprint strings into parsed values and per-item failures.
fn parse_fingerprints(
    raw: &[String],
) -> (Vec<Fingerprint>, Vec<(String, String)>) {
    let mut parsed = Vec::with_capacity(raw.len());
    let mut failures = Vec::new();

    for s in raw {
        match s.parse::<Fingerprint>() {
            Ok(fp) => parsed.push(fp),
            Err(e) => failures.push((s.clone(), e.to_string())),
        }
    }

    (parsed, failures)
}

/// Start the coordinator API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting coordinator API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;

    #[test]
    fn test_error_mapping() {
        let (status, Json(body)) = error_response(IngestError::DuplicateContent);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "DUPLICATE_CONTENT");

        let (status, Json(body)) =
            error_response(IngestError::InvalidImage("empty".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "INVALID_IMAGE");

        let (status, Json(body)) = error_response(IngestError::Ledger(
            LedgerError::Unavailable(sqlx::Error::PoolTimedOut),
        ));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.code, "UPSTREAM_UNAVAILABLE");
    }

    #[test]
    fn test_parse_fingerprints_separates_failures() {
        let good = Fingerprint::digest(b"good").unwrap().encode();
        let raw = vec![good.clone(), "garbage".to_string()];

        let (parsed, failures) = parse_fingerprints(&raw);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].encode(), good);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "garbage");
    }
}
