use std::collections::BTreeMap;

use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
};
use herald_agent::LaunchRequest;
use herald_job::{JobId, JobKind, JobSummary, TerminationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Principal;
use crate::error_payload::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    kind: String,
    #[serde(default)]
    args: BTreeMap<String, Value>,
    #[serde(default)]
    secret_refs: Vec<Value>,
    #[serde(default)]
    working_files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct StopJobRequest {
    job_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopJobResponse {
    terminated: bool,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    jobs: Vec<JobSummary>,
}

/// Form fields arrive as strings, numbers or booleans; all become argv text.
fn scalar_text(field: &str, v: Value) -> Result<Option<String>, ApiError> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Array(_) | Value::Object(_) => Err(ApiError::bad_request(format!(
            "{field} must be a string, number or boolean"
        ))),
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rej| ApiError::bad_request(rej.body_text()))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Json<ListJobsResponse> {
    let mut jobs = state.registry().list_by_owner(&principal.owner).await;
    jobs.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.job_id.as_str().cmp(b.job_id.as_str()))
    });
    Json(ListJobsResponse { jobs })
}

pub async fn show(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSummary>, ApiError> {
    state
        .registry()
        .lookup(&JobId(job_id), &principal.owner)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job not found or already finished"))
}

pub async fn start(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<StartJobRequest>, JsonRejection>,
) -> Result<Json<StartJobResponse>, ApiError> {
    let req = body(payload)?;

    let kind: JobKind = req
        .kind
        .parse()
        .map_err(|e: herald_job::UnknownJobKind| ApiError::bad_request(e.to_string()))?;

    let mut args = BTreeMap::new();
    for (key, v) in req.args {
        if let Some(text) = scalar_text(&key, v)? {
            args.insert(key, text);
        }
    }

    let mut refs = Vec::with_capacity(req.secret_refs.len());
    for v in req.secret_refs {
        if let Some(text) = scalar_text("secret_refs", v)? {
            refs.push(text);
        }
    }

    let secrets = state
        .credentials
        .resolve(&principal.owner, &refs)
        .await
        .map_err(|err| {
            tracing::error!(owner = %principal.owner, error = %err, "credential lookup failed");
            ApiError::internal("credential lookup failed")
        })?;
    if secrets.is_empty() {
        return Err(ApiError::bad_request("no valid tokens"));
    }

    let job_id = state
        .launcher
        .launch(LaunchRequest {
            owner: principal.owner,
            kind,
            args,
            secrets,
            working_files: req.working_files,
        })
        .await?;

    Ok(Json(StartJobResponse { job_id }))
}

pub async fn stop(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<StopJobRequest>, JsonRejection>,
) -> Result<Json<StopJobResponse>, ApiError> {
    let req = body(payload)?;
    let job_id = req.job_id.trim();
    if job_id.is_empty() {
        return Err(ApiError::bad_request("job_id is required"));
    }
    let job_id = JobId(job_id.to_string());

    match state.registry().terminate(&job_id, &principal.owner).await {
        TerminationResult::Terminated => Ok(Json(StopJobResponse { terminated: true })),
        TerminationResult::NotFound => Err(ApiError::not_found(
            "job not found or already finished",
        )),
        // Same answer as a missing job; other owners learn nothing about the id.
        TerminationResult::Forbidden => {
            tracing::warn!(%job_id, requester = %principal.owner, "stop denied for foreign job");
            Err(ApiError::not_found("job not found or already finished"))
        }
    }
}
