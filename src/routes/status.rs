//! `GET /status` (SPEC_FULL.md §6): reports the active collection's name,
//! row count, persistence path, and embedder model.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DbStatus {
    pub name: String,
    pub count: usize,
    pub persist_path: String,
    pub embedder: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub db: DbStatus,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let count = state.store.corpus_snapshot().len();
    let persist_path = std::path::PathBuf::from(&state.config.data_dir)
        .join("collections")
        .join(&state.collection_name)
        .to_string_lossy()
        .to_string();

    Json(StatusResponse {
        status: "ok",
        db: DbStatus {
            name: state.collection_name.clone(),
            count,
            persist_path,
            embedder: state.config.embedder.model_name().to_string(),
        },
    })
}
