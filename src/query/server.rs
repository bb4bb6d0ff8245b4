use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::QueryConfig;
use crate::core::StoreRef;
use crate::error::{BackupError, IndexError, QueryError};
use crate::index::{DriftReport, IndexTracker, StoreStatus};
use crate::query::fts::FTS_LANGUAGE;
use crate::query::params::SearchParameters;
use crate::query::registry::QueryRegistry;
use crate::query::result::{LimitReason, ResultSet};
use crate::storage::{BackupCoordinator, BackupOutcome};

#[derive(Deserialize)]
pub struct SearchParams {
    pub lang: Option<String>,
    pub q: String,
    pub store: String,
    pub skip: Option<usize>,
    pub max: Option<usize>,
}

#[derive(Serialize)]
pub struct SearchRow {
    pub node: Option<String>,
    pub name: Option<String>,
    pub score: f32,
    pub values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub language: String,
    pub total: usize,
    pub start: usize,
    pub limit_reason: LimitReason,
    pub query_time_ms: Option<u128>,
    pub rows: Vec<SearchRow>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub indexed_count: u64,
    pub pending_tasks: usize,
    pub stores: Vec<StoreStatus>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        let code = match &e {
            QueryError::UnknownLanguage(_) | QueryError::Parse { .. } => StatusCode::BAD_REQUEST,
            QueryError::StoreNotIndexed { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(code, e.to_string())
    }
}

impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        let code = match &e {
            IndexError::NotCreated(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(code, e.to_string())
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        let code = match &e {
            BackupError::Target { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(code, e.to_string())
    }
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Clone)]
struct AppState {
    registry: Arc<QueryRegistry>,
    tracker: Arc<IndexTracker>,
    backup: Option<(Arc<BackupCoordinator>, PathBuf)>,
    query: QueryConfig,
}

pub struct QueryServer {
    state: AppState,
}

impl QueryServer {
    pub fn new(registry: Arc<QueryRegistry>, tracker: Arc<IndexTracker>) -> Self {
        Self {
            state: AppState {
                registry,
                tracker,
                backup: None,
                query: QueryConfig::default(),
            },
        }
    }

    /// 启用 `POST /backup`，备份到固定目录
    pub fn with_backup(mut self, coordinator: Arc<BackupCoordinator>, target: PathBuf) -> Self {
        self.state.backup = Some((coordinator, target));
        self
    }

    /// 默认 limit 与权限检查预算
    pub fn with_query_config(mut self, query: QueryConfig) -> Self {
        self.state.query = query;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/search", get(search_handler))
            .route("/languages", get(languages_handler))
            .route("/status", get(status_handler))
            .route("/stores/:store/verify", get(verify_handler))
            .route("/backup", post(backup_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP Query Server listening on port {}", port);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn search_handler(
    Query(params): Query<SearchParams>,
    State(state): State<AppState>,
) -> Result<Json<SearchResponse>, ApiError> {
    let language = params.lang.unwrap_or_else(|| FTS_LANGUAGE.to_string());
    let mut sp = SearchParameters::new(&language, &params.q, StoreRef::new(params.store));
    sp.skip_count = params.skip.unwrap_or(0);
    sp.max_items = params.max;
    state.query.apply(&mut sp);

    let registry = state.registry.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<SearchResponse, ApiError> {
        let rs = registry.execute(&language, &sp)?;
        let set: &dyn ResultSet = rs.as_ref();
        let mut rows = Vec::with_capacity(set.len());
        for row in set.cursor() {
            let row = row.map_err(QueryError::from)?;
            rows.push(SearchRow {
                node: row.node_ref().map(|n| n.to_string()),
                name: row.qualified_name().map(|q| q.local.clone()),
                score: row.score(),
                values: row
                    .values()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }
        let response = SearchResponse {
            language,
            total: set.total(),
            start: set.start(),
            limit_reason: set.limit_reason(),
            query_time_ms: set.query_time().map(|d| d.as_millis()),
            rows,
        };
        set.close();
        Ok(response)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(response))
}

async fn languages_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut names: Vec<String> = state.registry.languages().keys().cloned().collect();
    names.sort();
    Json(names)
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        indexed_count: state.tracker.indexed_doc_count(),
        pending_tasks: state.tracker.pending_tasks(),
        stores: state.tracker.status(),
    })
}

async fn verify_handler(
    Path(store): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DriftReport>, ApiError> {
    let tracker = state.tracker.clone();
    let report = tokio::task::spawn_blocking(move || tracker.verify(&StoreRef::new(store)))
        .await
        .map_err(join_error)??;
    Ok(Json(report))
}

async fn backup_handler(State(state): State<AppState>) -> Result<Json<BackupOutcome>, ApiError> {
    let Some((coordinator, target)) = state.backup.clone() else {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            "no backup target configured".to_string(),
        ));
    };
    let outcome = tokio::task::spawn_blocking(move || coordinator.backup(&target))
        .await
        .map_err(join_error)??;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_store_maps_to_not_found() {
        let missing = ApiError::from(QueryError::StoreNotIndexed {
            language: FTS_LANGUAGE.to_string(),
            store: StoreRef::new("nope"),
        });
        assert_eq!(missing.0, StatusCode::NOT_FOUND);
        assert!(missing.1.contains("nope"));

        let failed = ApiError::from(QueryError::execution(FTS_LANGUAGE, "permission check timed out"));
        assert_eq!(failed.0, StatusCode::INTERNAL_SERVER_ERROR);

        let bad = ApiError::from(QueryError::UnknownLanguage("xpath".into()));
        assert_eq!(bad.0, StatusCode::BAD_REQUEST);
    }
}
