//! `POST /sync/trigger` (SPEC_FULL.md §6): binds the Syncer's vault-change/
//! corruption promotion rule to an HTTP request. `project_id` is accepted
//! for interface compatibility with the out-of-core multi-project HTTP
//! surface but this binding serves exactly one vault per process.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::state::AppState;
use crate::syncer::SyncResult;

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub force_reindex: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerBody {
    #[serde(default)]
    pub include_paths: Option<Vec<String>>,
}

pub async fn trigger_sync(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
    body: Option<Json<TriggerBody>>,
) -> AppResult<Json<SyncResult>> {
    let _ = query.project_id; // single-vault binding; kept for interface parity
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let mut syncer = state.syncer.lock().await;
    let result = syncer
        .trigger(body.include_paths.as_deref(), query.force_reindex)
        .await?;
    drop(syncer);

    // §4.8: the sparse index is rebuilt from the registry-backed corpus
    // once a sync completes, not maintained incrementally.
    state.hybrid.rebuild_bm25();

    Ok(Json(result))
}
