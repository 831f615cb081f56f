use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::ApiResult;
use crate::api::{state::AppState, types::*};
use crate::daemon::{DataAppend, Inference, RunView};
use crate::persistence::Run;
use crate::training::StartOptions;

/// GET /api/runs
pub async fn list_runs(State(state): State<AppState>) -> ApiResult<Json<Vec<RunView>>> {
    Ok(Json(state.daemon.list_runs().await?))
}

/// GET /api/runs/:id
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunView>> {
    Ok(Json(state.daemon.run_status(&id).await?))
}

/// POST /api/runs/:id/resume
pub async fn resume_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TrainResponse>)> {
    let run = state.daemon.resume_run(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(train_response(&run))))
}

/// POST /api/pods/:name/train
pub async fn train_pod(
    State(state): State<AppState>,
    Path(name): Path<String>,
    req: Option<Json<TrainRequest>>,
) -> ApiResult<(StatusCode, Json<TrainResponse>)> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let options = StartOptions {
        resume_paused: req.resume_paused,
        ..Default::default()
    };
    let run = state.daemon.train_pod(&name, options).await?;
    Ok((StatusCode::ACCEPTED, Json(train_response(&run))))
}

/// POST /api/pods/:name/stop
pub async fn stop_pod(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let run_id = state.daemon.stop_run(&name)?;
    Ok(Json(StopResponse {
        run_id,
        stopping: true,
    }))
}

/// POST /api/pods/:name/export
pub async fn export_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ExportRequest>,
) -> ApiResult<Json<ExportResponse>> {
    let path = state.daemon.export_model(&name, &req.dest).await?;
    Ok(Json(ExportResponse { path }))
}

/// POST /api/pods/:name/import
pub async fn import_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.daemon.import_model(&name, &req.source).await?))
}

/// GET /api/pods/:name/inference
pub async fn get_inference(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Inference>> {
    Ok(Json(state.daemon.infer(&name).await?))
}

/// POST /api/pods/:name/data
pub async fn add_data(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<AddDataRequest>,
) -> ApiResult<Json<DataAppend>> {
    Ok(Json(state.daemon.add_data(&name, req.rows).await?))
}

fn train_response(run: &Run) -> TrainResponse {
    TrainResponse {
        run_id: run.id.clone(),
        pod: run.pod_name.clone(),
        status: run.status,
        progress: run.progress,
    }
}
