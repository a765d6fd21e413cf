use std::io::Cursor;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tablevault_core::model::{
    ActivityFilter, ActivityStatus, ActivityType, NewActivityLogEntry, RetentionPolicyUpdate,
};
use tablevault_core::{BackupType, RollbackType, TriggerType};
use tablevault_engine::{
    CreateBackupRequest, CreateRollbackRequest, Engine, EngineError, Scheduler,
};
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
    pub rollback_gate: Arc<Mutex<Option<DateTime<Utc>>>>,
    pub csrf_token: Option<String>,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/backups", get(list_backups).post(create_backup))
        .route("/api/v1/backups/{id}", get(backup_detail))
        .route("/api/v1/backups/{id}/download", get(download_backup))
        .route("/api/v1/backups/{id}/rollback", post(rollback_backup))
        .route("/api/v1/backups/{id}/verify", post(verify_backup))
        .route("/api/v1/backups/{id}/verify/quick", get(quick_verify_backup))
        .route("/api/v1/backups/{id}/labels", post(add_label))
        .route("/api/v1/backups/{id}/labels/{label}", delete(remove_label))
        .route("/api/v1/activity", get(list_activity))
        .route("/api/v1/activity/stats", get(activity_stats))
        .route("/api/v1/activity/export.csv", get(export_activity))
        .route("/api/v1/retention", get(get_retention).put(update_retention))
        .route("/api/v1/retention/preview", post(preview_retention))
        .route("/api/v1/retention/apply", post(apply_retention))
        .route("/api/v1/schedule", get(schedule_status).put(update_schedule))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Typed refusals become client errors; everything else is a 500.
fn engine_status(err: anyhow::Error) -> StatusCode {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::BackupNotFound(_)) => StatusCode::NOT_FOUND,
        Some(_) => StatusCode::BAD_REQUEST,
        None => {
            error!(error = format!("{err:#}"), "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

// --- Backups ---

async fn list_backups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let backups = state.engine.list_backups().await.map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "backups": backups })))
}

#[derive(Debug, Deserialize)]
struct CreateBackupBody {
    name: String,
    description: Option<String>,
    backup_type: Option<BackupType>,
    created_by: Option<String>,
    tables: Option<Vec<String>>,
}

async fn create_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateBackupBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    require_api_auth(&state, &headers)?;
    let backup = state
        .engine
        .create_backup(CreateBackupRequest {
            name: body.name,
            description: body.description,
            backup_type: body.backup_type.unwrap_or(BackupType::Full),
            trigger_type: TriggerType::Manual,
            created_by: body.created_by.unwrap_or_else(|| "api".to_owned()),
            tables: body.tables,
        })
        .await
        .map_err(engine_status)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(backup))))
}

async fn backup_detail(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let backup = state
        .engine
        .get_backup(id)
        .await
        .map_err(engine_status)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let items = state
        .engine
        .list_backup_items(id)
        .await
        .map_err(engine_status)?;
    let labels = state
        .engine
        .list_backup_labels(id)
        .await
        .map_err(engine_status)?;
    let rollbacks = state
        .engine
        .list_rollbacks(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({
        "backup": backup,
        "items": items,
        "labels": labels,
        "rollbacks": rollbacks,
    })))
}

async fn download_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let bundle = state
        .engine
        .build_download_bundle(id)
        .await
        .map_err(engine_status)?;
    let document =
        serde_json::to_vec_pretty(&bundle.document).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // Build tar archive
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);
        let mut hdr = tar::Header::new_gnu();
        hdr.set_size(document.len() as u64);
        hdr.set_mode(0o644);
        hdr.set_cksum();
        builder
            .append_data(&mut hdr, &bundle.filename, Cursor::new(document))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        builder
            .finish()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }

    // Compress with zstd
    let compressed =
        zstd::encode_all(Cursor::new(&tar_data), 3).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let backup_name = bundle.document["backup"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_owned();
    state
        .engine
        .log_activity(
            NewActivityLogEntry::new(
                ActivityType::BackupDownloaded,
                "api",
                ActivityStatus::Success,
            )
            .with_backup(id, backup_name)
            .with_provenance(None, user_agent(&headers)),
        )
        .await;

    let mut response = compressed.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/zstd"
            .parse()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename={}.tar.zst", bundle.filename)
            .parse()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    Ok(response)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RollbackBody {
    rollback_type: Option<RollbackType>,
    initiated_by: Option<String>,
    tables: Option<Vec<String>>,
    notes: Option<String>,
}

async fn rollback_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    if let Some(expected_csrf) = &state.csrf_token {
        let provided = headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected_csrf {
            return Err(StatusCode::FORBIDDEN);
        }
    }
    let mut gate = state.rollback_gate.lock().await;
    if let Some(last) = *gate {
        if (Utc::now() - last).num_seconds() < 10 {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    // An empty body is a plain full rollback.
    let body: RollbackBody = if body.is_empty() {
        RollbackBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let outcome = state
        .engine
        .create_rollback(CreateRollbackRequest {
            backup_id: id,
            rollback_type: body.rollback_type.unwrap_or(RollbackType::Full),
            initiated_by: body.initiated_by.unwrap_or_else(|| "api".to_owned()),
            tables: body.tables,
            notes: body.notes,
        })
        .await
        .map_err(engine_status)?;
    *gate = Some(Utc::now());
    Ok(Json(serde_json::json!(outcome)))
}

async fn verify_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let report = state
        .engine
        .verify_backup_integrity(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(report)))
}

async fn quick_verify_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let report = state
        .engine
        .quick_integrity_check(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(report)))
}

// --- Labels ---

#[derive(Debug, Deserialize)]
struct LabelBody {
    label: String,
}

async fn add_label(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LabelBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    if body.label.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state
        .engine
        .add_backup_label(id, body.label.trim(), "api")
        .await
        .map_err(engine_status)?;
    let labels = state
        .engine
        .list_backup_labels(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "labels": labels })))
}

async fn remove_label(
    Path((id, label)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    state
        .engine
        .remove_backup_label(id, &label, "api")
        .await
        .map_err(engine_status)?;
    let labels = state
        .engine
        .list_backup_labels(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "labels": labels })))
}

// --- Activity ---

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ActivityQuery {
    activity_type: Option<String>,
    backup_id: Option<Uuid>,
    actor: Option<String>,
    status: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    offset: Option<i64>,
    limit: Option<i64>,
}

impl ActivityQuery {
    fn into_filter(self) -> Result<ActivityFilter, StatusCode> {
        let activity_type = match self.activity_type.as_deref() {
            Some(raw) => Some(ActivityType::parse(raw).ok_or(StatusCode::BAD_REQUEST)?),
            None => None,
        };
        Ok(ActivityFilter {
            activity_type,
            backup_id: self.backup_id,
            actor: self.actor,
            status: self.status.as_deref().map(ActivityStatus::parse),
            from: self.from,
            to: self.to,
            offset: self.offset.unwrap_or(0).max(0),
            limit: self.limit.unwrap_or(0),
        })
    }
}

async fn list_activity(
    Query(query): Query<ActivityQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let filter = query.into_filter()?;
    let page = state
        .engine
        .get_activity_logs(filter)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(page)))
}

async fn activity_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let stats = state
        .engine
        .get_activity_stats()
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(stats)))
}

async fn export_activity(
    Query(query): Query<ActivityQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    require_api_auth(&state, &headers)?;
    let filter = query.into_filter()?;
    let csv = state
        .engine
        .export_activity_csv(filter)
        .await
        .map_err(engine_status)?;

    let mut response = csv.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        "text/csv; charset=utf-8"
            .parse()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        "attachment; filename=activity_export.csv"
            .parse()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    Ok(response)
}

// --- Retention ---

async fn get_retention(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let policy = state
        .engine
        .retention_policy()
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(policy)))
}

async fn update_retention(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<RetentionPolicyUpdate>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    if let Some(days) = update.retention_days {
        if days < 1 {
            return Err(StatusCode::BAD_REQUEST);
        }
    }
    let policy = state
        .engine
        .update_retention_policy(update, "api")
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(policy)))
}

async fn preview_retention(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let outcome = state
        .engine
        .preview_retention_policy()
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(outcome)))
}

async fn apply_retention(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let outcome = state
        .engine
        .apply_retention_policy()
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!(outcome)))
}

// --- Schedule ---

async fn schedule_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let status = state.scheduler.status().await.map_err(engine_status)?;
    Ok(Json(serde_json::json!(status)))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ScheduleBody {
    enabled: Option<bool>,
    cron: Option<String>,
    backup_type: Option<BackupType>,
}

async fn update_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    state
        .engine
        .update_schedule(body.enabled, body.cron, body.backup_type, "api")
        .await
        .map_err(engine_status)?;
    let status = state.scheduler.status().await.map_err(engine_status)?;
    Ok(Json(serde_json::json!(status)))
}
