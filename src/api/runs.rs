use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use uuid::Uuid;

use crate::app::AppState;

#[derive(Debug, Serialize)]
struct TriggerRunResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<Uuid>,
}

/// 手動でパイプラインを 1 回起動する。実行中であれば 409 を返す。
pub(crate) async fn trigger_run(State(state): State<AppState>) -> impl IntoResponse {
    state.telemetry().record_manual_run_invocation();

    match state.scheduler().try_spawn() {
        Some((run_id, _handle)) => (
            StatusCode::ACCEPTED,
            Json(TriggerRunResponse {
                status: "accepted",
                run_id: Some(run_id),
            }),
        )
            .into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(TriggerRunResponse {
                status: "already_running",
                run_id: None,
            }),
        )
            .into_response(),
    }
}
