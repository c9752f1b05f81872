//! HTTP surface exposed to the hosting process (spec.md §6): webhook intake, a liveness probe,
//! and an authenticated manual-trigger surface over the Backfill Engine.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::AppState;
use crate::backfill::Engine;
use crate::db::models::entity::EntityKind;
use crate::entities::Upserter;
use crate::errors::{Error, Result};

/// The account this install syncs. Multi-tenant installs are out of scope (spec.md §2, Non-goals).
const DEFAULT_ACCOUNT_ID: &str = "default";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stripe-webhooks/{endpoint_uuid}", post(receive_webhook))
        .route("/sync", post(trigger_sync))
        .route("/sync/single/{entity_id}", post(trigger_single_sync))
        .route("/cron/daily", post(cron_daily))
        .route("/cron/weekly", post(cron_weekly))
        .route("/cron/monthly", post(cron_monthly))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn receive_webhook(State(state): State<AppState>, Path(endpoint_uuid): Path<Uuid>, headers: HeaderMap, body: Bytes) -> Result<impl IntoResponse> {
    let signature = headers.get("stripe-signature").and_then(|v| v.to_str().ok()).unwrap_or("");
    state.router.process(&body, signature, endpoint_uuid).await?;
    Ok(Json(serde_json::json!({ "received": true })))
}

/// Checks the `Authorization: Bearer <api_key>` header against `config.api_key`. A `None`
/// configured key means the authenticated surface is unprotected — matching the CLI's
/// `--validate`-only posture in local/dev use, never recommended for a public deployment.
fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = &state.config.api_key else { return Ok(()) };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(Error::BadRequest { message: "missing or invalid bearer token".to_string() })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    created: Option<i64>,
    object: Option<String>,
    backfill_related_entities: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    accepted: bool,
    object: String,
}

/// `POST /sync`: manual backfill trigger over one kind or all kinds (spec.md §6).
async fn trigger_sync(State(state): State<AppState>, headers: HeaderMap, Json(request): Json<SyncRequest>) -> Result<impl IntoResponse> {
    require_api_key(&state, &headers)?;
    let object = request.object.unwrap_or_else(|| "all".to_string());
    let engine = state.backfill_engine(request.backfill_related_entities);
    engine
        .process_until_done(DEFAULT_ACCOUNT_ID, &object, request.created, state.config.sync.max_concurrent_objects)
        .await?;
    Ok(Json(SyncResponse { accepted: true, object }))
}

/// `POST /sync/single/:entityId`: sync of a single entity kind, named by `entity_id` as the CLI's
/// `backfill <entityName>` subcommand does (spec.md §6, an Open Question resolved in DESIGN.md).
async fn trigger_single_sync(State(state): State<AppState>, headers: HeaderMap, Path(entity_id): Path<String>) -> Result<impl IntoResponse> {
    require_api_key(&state, &headers)?;
    EntityKind::from_str(&entity_id).map_err(|e| Error::BadRequest { message: e.to_string() })?;
    let engine = state.backfill_engine(None);
    engine.process_until_done(DEFAULT_ACCOUNT_ID, &entity_id, None, state.config.sync.max_concurrent_objects).await?;
    Ok(Json(SyncResponse { accepted: true, object: entity_id }))
}

async fn cron_daily(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    run_cron(&state, &headers, Duration::days(1)).await
}

async fn cron_weekly(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    run_cron(&state, &headers, Duration::weeks(1)).await
}

async fn cron_monthly(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    run_cron(&state, &headers, Duration::days(30)).await
}

async fn run_cron(state: &AppState, headers: &HeaderMap, window: Duration) -> Result<impl IntoResponse> {
    require_api_key(state, headers)?;
    let created_gte = (Utc::now() - window).timestamp();
    let engine = state.backfill_engine(None);
    engine
        .process_until_done(DEFAULT_ACCOUNT_ID, "all", Some(created_gte), state.config.sync.max_concurrent_objects)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

impl AppState {
    /// Builds a fresh [`Engine`] for one request, optionally overriding `backfillRelatedEntities`
    /// per-request as `POST /sync` allows (spec.md §6).
    fn backfill_engine(&self, backfill_related_entities_override: Option<bool>) -> Engine {
        let mut sync_config = self.config.sync.clone();
        if let Some(override_value) = backfill_related_entities_override {
            sync_config.backfill_related_entities = override_value;
        }
        let upserter = Upserter::new(self.pool.clone(), self.source_api.clone(), sync_config);
        Engine::new(self.pool.clone(), self.source_api.clone(), upserter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        headers
    }

    #[test]
    fn single_sync_rejects_unknown_entity_kind() {
        assert!(EntityKind::from_str("not_a_kind").is_err());
    }

    #[test]
    fn bearer_header_parses_expected_token() {
        let headers = headers_with_bearer("shh");
        let provided = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        assert_eq!(provided, Some("shh"));
    }
}
