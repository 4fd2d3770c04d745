//! The thin HTTP surface consumed by the tournament orchestrator.
//!
//! Two JSON endpoints: `POST /build` compiles a submission, `POST /run_match`
//! adjudicates a game between two built submissions. Work is admitted through
//! a weighted semaphore sized to twice the CPU count; a build takes one
//! permit, a match two (one per player process). The judge core is
//! synchronous and runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use sandbox_runner::SandboxRunner;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::error;

use crate::builder::{BuildErrorKind, SubmissionBuilder};
use crate::cancel::{CancelToken, Cause};
use crate::judge::Judge;
use crate::session::SandboxPlayerFactory;

pub const BUILD_TIMEOUT: Duration = Duration::from_secs(100 * 60);
pub const PLAYER_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const GLOBAL_TIMEOUT: Duration = Duration::from_secs(7 * 60);

struct AppInner {
    builder: SubmissionBuilder,
    runner: SandboxRunner,
    jobs: Arc<Semaphore>,
}

/// Shared server state behind the router.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

impl AppState {
    pub fn new(builder: SubmissionBuilder, runner: SandboxRunner) -> AppState {
        let permits = num_cpus::get() * 2;
        AppState {
            inner: Arc::new(AppInner {
                builder,
                runner,
                jobs: Arc::new(Semaphore::new(permits)),
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/build", post(handle_build))
        .route("/run_match", post(handle_match))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct BuildParams {
    repo: String,
    r#ref: String,
}

#[derive(Debug, Deserialize)]
struct MatchParams {
    master_image_id: String,
    slave_image_id: String,
}

fn bad_format(rejection: JsonRejection) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "error": "bad_format",
            "details": rejection.body_text(),
        })),
    )
        .into_response()
}

fn internal_error(what: &str) -> Response {
    error!("{what}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "unknown", "details": what })),
    )
        .into_response()
}

async fn handle_build(
    State(state): State<AppState>,
    payload: Result<Json<BuildParams>, JsonRejection>,
) -> Response {
    let Json(params) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_format(rejection),
    };

    let Ok(_permit) = state.inner.jobs.clone().acquire_owned().await else {
        return internal_error("job queue closed");
    };

    let inner = state.inner.clone();
    let result = tokio::task::spawn_blocking(move || {
        let token = CancelToken::new();
        token.deadline(BUILD_TIMEOUT, Cause::BuildTimeout);
        let result = inner.builder.build(&token, &params.repo, &params.r#ref);
        token.cancel(Cause::Closed);
        result
    })
    .await;

    let result = match result {
        Ok(result) => result,
        Err(_) => return internal_error("build task died"),
    };

    match result {
        Ok(output) => (
            StatusCode::OK,
            Json(json!({ "image_id": output.image_id, "logs": output.logs })),
        )
            .into_response(),
        Err(failure) => {
            let (status, code) = match failure.kind {
                BuildErrorKind::BadRepo => (StatusCode::BAD_REQUEST, "bad_repo"),
                BuildErrorKind::Timeout => (StatusCode::REQUEST_TIMEOUT, "timeout"),
                BuildErrorKind::Unknown => (StatusCode::BAD_REQUEST, "unknown"),
            };
            (
                status,
                Json(json!({
                    "error": code,
                    "details": format!("{:#}", failure.error),
                    "logs": failure.logs,
                })),
            )
                .into_response()
        }
    }
}

async fn handle_match(
    State(state): State<AppState>,
    payload: Result<Json<MatchParams>, JsonRejection>,
) -> Response {
    let Json(params) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_format(rejection),
    };

    let master_bin = state.inner.builder.resolve(&params.master_image_id);
    let slave_bin = state.inner.builder.resolve(&params.slave_image_id);
    let (master_bin, slave_bin) = match (master_bin, slave_bin) {
        (Some(master), Some(slave)) => (master, slave),
        (master, _) => {
            let id = if master.is_none() {
                &params.master_image_id
            } else {
                &params.slave_image_id
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "unknown",
                    "details": format!("unknown image id: {id}"),
                })),
            )
                .into_response();
        }
    };

    // One permit per player process.
    let Ok(_permits) = state.inner.jobs.clone().acquire_many_owned(2).await else {
        return internal_error("job queue closed");
    };

    let inner = state.inner.clone();
    let verdict = tokio::task::spawn_blocking(move || {
        let judge = Judge {
            player_timeout: PLAYER_TIMEOUT,
            global_timeout: GLOBAL_TIMEOUT,
        };
        let master = SandboxPlayerFactory::new(inner.runner.clone(), master_bin);
        let slave = SandboxPlayerFactory::new(inner.runner.clone(), slave_bin);
        judge.judge(&CancelToken::new(), &master, &slave)
    })
    .await;

    match verdict {
        Ok(verdict) => (StatusCode::OK, Json(verdict)).into_response(),
        Err(_) => internal_error("match task died"),
    }
}
