//! Invalidation gateway handlers.
//!
//! Stateless, authenticated transport over the purge path. Database triggers
//! (or any trusted write path) POST the tags they touched; the gateway
//! authenticates with a constant-time secret comparison, validates, and
//! purges tag by tag, reporting per-tag outcomes. Delivery is at-least-once,
//! so purging an already-purged tag must succeed.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use metrics::counter;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::GatewayError;
use crate::cache::{CacheStats, CacheTag, ResponseCache};
use crate::config::GatewaySettings;

pub const INVALIDATION_SECRET_HEADER: &str = "x-cache-invalidation-secret";
pub const REVALIDATION_SECRET_HEADER: &str = "x-revalidation-secret";

const METRIC_PURGE_REQUESTS: &str = "aula_gateway_purge_requests_total";
const METRIC_TAGS_PURGED: &str = "aula_gateway_tags_purged_total";
const METRIC_TAGS_FAILED: &str = "aula_gateway_tags_failed_total";
const METRIC_UNCONFIGURED: &str = "aula_gateway_unconfigured_total";

/// A purge attempt that may be retried by the sender.
#[derive(Debug, Clone, Error)]
#[error("transient store error: {0}")]
pub struct TransientStoreError(pub String);

/// What the gateway purges against. The response cache is the production
/// target; tests substitute flaky targets to exercise per-tag failure.
pub trait PurgeTarget: Send + Sync {
    fn purge_tag(&self, tag: &CacheTag) -> Result<usize, TransientStoreError>;
    fn stats(&self) -> CacheStats;
}

impl PurgeTarget for ResponseCache {
    fn purge_tag(&self, tag: &CacheTag) -> Result<usize, TransientStoreError> {
        Ok(ResponseCache::purge_tag(self, tag))
    }

    fn stats(&self) -> CacheStats {
        ResponseCache::stats(self)
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub settings: GatewaySettings,
    pub target: Arc<dyn PurgeTarget>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevalidateRequest {
    pub tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagResult {
    pub tag: String,
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub success: bool,
    pub invalidated: usize,
    pub failed: usize,
    pub results: Vec<TagResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub entries: usize,
    pub tags: usize,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/internal/cache/invalidate", post(invalidate))
        .route("/internal/cache/revalidate", post(revalidate))
        .route("/internal/cache/stats", get(stats))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn invalidate(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Json<InvalidateRequest>, JsonRejection>,
) -> Result<Json<InvalidateResponse>, GatewayError> {
    authorize(
        &headers,
        INVALIDATION_SECRET_HEADER,
        state.settings.invalidation_secret.as_deref(),
    )?;
    let Json(request) = body.map_err(|rejection| GatewayError::Validation(rejection.body_text()))?;
    if request.tags.is_empty() {
        return Err(GatewayError::Validation("tags must not be empty".into()));
    }

    let tags = parse_tags(&request.tags)?;
    Ok(Json(purge_all(state.target.as_ref(), &tags)))
}

async fn revalidate(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Json<RevalidateRequest>, JsonRejection>,
) -> Result<Json<InvalidateResponse>, GatewayError> {
    authorize(
        &headers,
        REVALIDATION_SECRET_HEADER,
        state.settings.revalidation_secret.as_deref(),
    )?;
    let Json(request) = body.map_err(|rejection| GatewayError::Validation(rejection.body_text()))?;

    let tags = parse_tags(std::slice::from_ref(&request.tag))?;
    Ok(Json(purge_all(state.target.as_ref(), &tags)))
}

async fn stats(State(state): State<GatewayState>) -> Json<StatsResponse> {
    let stats = state.target.stats();
    Json(StatsResponse {
        entries: stats.entries,
        tags: stats.tags,
    })
}

async fn healthz() -> &'static str {
    "ok"
}

fn authorize(
    headers: &HeaderMap,
    header: &'static str,
    configured: Option<&str>,
) -> Result<(), GatewayError> {
    let Some(expected) = configured else {
        error!(header, "gateway secret not configured; rejecting cache request");
        counter!(METRIC_UNCONFIGURED).increment(1);
        return Err(GatewayError::Configuration);
    };

    let presented = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .ok_or(GatewayError::Authentication)?;
    if presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 0 {
        return Err(GatewayError::Authentication);
    }
    Ok(())
}

fn parse_tags(raw: &[String]) -> Result<Vec<CacheTag>, GatewayError> {
    raw.iter()
        .map(|tag| {
            CacheTag::parse(tag)
                .map_err(|err| GatewayError::Validation(format!("tag `{tag}`: {err}")))
        })
        .collect()
}

/// Purge every tag, continuing past per-tag failures so one flaky purge
/// cannot leave the rest of the batch stale.
fn purge_all(target: &dyn PurgeTarget, tags: &[CacheTag]) -> InvalidateResponse {
    counter!(METRIC_PURGE_REQUESTS).increment(1);
    let purge_id = Uuid::new_v4();

    let mut invalidated = 0usize;
    let mut failed = 0usize;
    let mut results = Vec::with_capacity(tags.len());
    for tag in tags {
        match target.purge_tag(tag) {
            Ok(removed) => {
                invalidated += removed;
                results.push(TagResult {
                    tag: tag.as_str().to_string(),
                    success: true,
                });
            }
            Err(err) => {
                warn!(purge_id = %purge_id, tag = %tag, error = %err, "tag purge failed");
                failed += 1;
                results.push(TagResult {
                    tag: tag.as_str().to_string(),
                    success: false,
                });
            }
        }
    }

    counter!(METRIC_TAGS_PURGED).increment(invalidated as u64);
    counter!(METRIC_TAGS_FAILED).increment(failed as u64);
    info!(
        purge_id = %purge_id,
        requested = tags.len(),
        invalidated,
        failed,
        "cache purge processed"
    );

    InvalidateResponse {
        success: failed == 0,
        invalidated,
        failed,
        results,
    }
}
