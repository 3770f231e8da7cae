//! Axum route handlers implementing the HTTP API.

use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::models::*;
use crate::dispatcher::EventName;
use crate::error::{Error, Result};
use crate::registry::ModelRegistration;
use crate::task::{Task, TaskId, TaskStatus};
use crate::AppState;

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<TaskSubmitRequest>,
) -> Result<(StatusCode, Json<TaskSubmitResponse>)> {
    let on_complete_url = req.on_complete_url.clone();
    let on_error_url = req.on_error_url.clone();
    let submission = req.into_submission(state.config.retry_times, state.config.task_timeout)?;
    let id = state.engine.execute(submission).await?;

    if let Some(url) = on_complete_url {
        state.dispatcher.register_task_webhook(EventName::OnComplete, url);
    }
    if let Some(url) = on_error_url {
        state.dispatcher.register_task_webhook(EventName::OnError, url);
    }

    let task = state.scheduler.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskSubmitResponse {
            task_id: id.to_string(),
            status: format!("{:?}", task.state).to_uppercase(),
            created_at: task.created_at,
        }),
    ))
}

pub async fn list_tasks(State(state): State<AppState>, Query(query): Query<TaskListQuery>) -> Result<Json<Vec<TaskSummary>>> {
    let tasks: Vec<Task> = match query.status {
        None => state.scheduler.list_all(),
        Some(status) => {
            let status = parse_status(&status)?;
            state.scheduler.list_by_state(status)
        }
    };
    Ok(Json(tasks.into_iter().map(TaskSummary::from).collect()))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskDetail>> {
    let id = parse_task_id(&id)?;
    let task = state.scheduler.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
    Ok(Json(TaskDetail::from(task)))
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    let id = parse_task_id(&id)?;
    let cancelled = state.scheduler.cancel(id).await?;
    if cancelled {
        Ok(StatusCode::OK)
    } else {
        Err(Error::IllegalArgument(format!("task '{id}' is not cancellable")))
    }
}

pub async fn wait_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TaskWaitQuery>,
) -> Result<Json<TaskDetail>> {
    let id = parse_task_id(&id)?;
    let task = state.engine.wait(id, Duration::from_secs(query.timeout)).await?;
    Ok(Json(TaskDetail::from(task)))
}

pub async fn batch_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskBatchQuery>,
    Json(reqs): Json<Vec<TaskSubmitRequest>>,
) -> Result<Json<TaskBatchResponse>> {
    let mut submissions = Vec::with_capacity(reqs.len());
    for req in reqs {
        submissions.push(req.into_submission(state.config.retry_times, state.config.task_timeout)?);
    }

    let results = state.engine.execute_batch(submissions, query.concurrency).await;
    let mut task_ids = Vec::with_capacity(results.len());
    for result in results {
        task_ids.push(result?.to_string());
    }
    Ok(Json(TaskBatchResponse { task_ids }))
}

pub async fn register_model(
    State(state): State<AppState>,
    Json(req): Json<ModelRegisterRequest>,
) -> Result<Json<ModelRegisterResponse>> {
    let name = req.name.clone();
    state.registry.register(ModelRegistration {
        name: req.name,
        provider: req.provider,
        credentials: req.api_key,
        base_url: req.base_url,
        max_tokens: req.max_tokens,
        default_temperature: req.temperature,
        weight: req.weight,
        cost_per_token: req.cost_per_token,
    });
    Ok(Json(ModelRegisterResponse { name }))
}

pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelSummary>> {
    let models = state
        .registry
        .list()
        .into_iter()
        .map(|m| ModelSummary {
            name: m.name,
            provider: m.provider,
            available: m.available,
            weight: m.weight,
            avg_response_time: m.avg_response_time,
            success_rate: m.success_rate,
        })
        .collect();
    Json(models)
}

pub async fn register_webhook(State(state): State<AppState>, Json(req): Json<WebhookRegisterRequest>) -> Result<StatusCode> {
    let event = EventName::from_str(&req.event)?;
    state.dispatcher.register_webhook(
        event,
        crate::dispatcher::WebhookRegistration {
            url: req.url,
            headers: req.headers,
            retry_count: 3,
            timeout: Duration::from_secs(10),
        },
    );
    Ok(StatusCode::OK)
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let tasks = state.scheduler.list_all();
    let mut resp = StatusResponse {
        pending: 0,
        running: 0,
        completed: 0,
        failed: 0,
        cancelled: 0,
        max_concurrent: state.config.max_concurrent_tasks,
    };
    for task in tasks {
        match task.state {
            TaskStatus::Pending => resp.pending += 1,
            TaskStatus::Running => resp.running += 1,
            TaskStatus::Completed => resp.completed += 1,
            TaskStatus::Failed => resp.failed += 1,
            TaskStatus::Cancelled => resp.cancelled += 1,
        }
    }
    Json(resp)
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    TaskId::from_str(raw).map_err(|_| Error::NotFound(raw.to_string()))
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    match raw.to_uppercase().as_str() {
        "PENDING" => Ok(TaskStatus::Pending),
        "RUNNING" => Ok(TaskStatus::Running),
        "COMPLETED" => Ok(TaskStatus::Completed),
        "FAILED" => Ok(TaskStatus::Failed),
        "CANCELLED" => Ok(TaskStatus::Cancelled),
        other => Err(Error::IllegalArgument(format!("unknown status filter '{other}'"))),
    }
}
