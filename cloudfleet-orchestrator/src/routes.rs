use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use cloudfleet_common::bus::{CommandEnvelope, FleetCommand};
use serde_json::json;
use std::sync::Arc;

use crate::engine::EngineContext;
use crate::error::FleetError;
use crate::logger;
use crate::provisioner::DemandOptions;

pub fn router(engine: Arc<EngineContext>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(status))
        .route("/admin/commands", post(command))
        .with_state(engine)
}

async fn root() -> &'static str {
    "cloudfleet orchestrator"
}

async fn status(State(engine): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(engine.status())
}

fn error_status(e: &FleetError) -> StatusCode {
    match e {
        FleetError::UnknownCloud(_) | FleetError::UnknownTemplate { .. } | FleetError::UnknownWorker(_) => {
            StatusCode::NOT_FOUND
        }
        e if e.is_fatal() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_body(envelope: &CommandEnvelope, e: &FleetError) -> serde_json::Value {
    json!({
        "correlation_id": envelope.correlation_id,
        "type": envelope.command.command_type().as_str(),
        "error": e.code(),
        "message": e.to_string(),
    })
}

async fn command(State(engine): State<Arc<EngineContext>>, Json(command): Json<FleetCommand>) -> Response {
    let envelope = CommandEnvelope::new(command, Utc::now());
    tracing::info!(
        "📩 [admin] {} correlation_id={}",
        envelope.command.command_type().as_str(),
        envelope.correlation_id
    );
    logger::log_event(
        "ADMIN_COMMAND",
        "received",
        None,
        json!({"correlation_id": envelope.correlation_id, "type": envelope.command.command_type().as_str()}),
    );

    match &envelope.command {
        FleetCommand::Provision {
            cloud,
            template,
            count,
            force_new,
        } => {
            let options = DemandOptions { force_new: *force_new };
            let outcome = engine.provision(cloud, template, *count, &options).await;
            let workers: Vec<&str> = outcome.workers.iter().map(|w| w.name.as_str()).collect();
            let status = match &outcome.error {
                Some(e) if outcome.workers.is_empty() => error_status(e),
                _ => StatusCode::OK,
            };
            let body = json!({
                "correlation_id": envelope.correlation_id,
                "type": envelope.command.command_type().as_str(),
                "workers": workers,
                "declined": outcome.declined,
                "error": outcome.error.as_ref().map(|e| e.code()),
                "message": outcome.error.as_ref().map(|e| e.to_string()),
            });
            (status, Json(body)).into_response()
        }
        FleetCommand::Terminate { worker } => match engine.terminate_worker(worker).await {
            Ok(()) => (
                StatusCode::OK,
                Json(json!({
                    "correlation_id": envelope.correlation_id,
                    "type": envelope.command.command_type().as_str(),
                    "worker": worker,
                })),
            )
                .into_response(),
            Err(e) => (error_status(&e), Json(error_body(&envelope, &e))).into_response(),
        },
        FleetCommand::Reconcile { cloud } => {
            let reports = match cloud {
                None => engine.run_orphan_sweep().await,
                Some(name) => match engine.cloud(name) {
                    Ok(handle) => vec![(name.clone(), engine.reconciler.sweep_cloud(handle, Utc::now()).await)],
                    Err(e) => return (error_status(&e), Json(error_body(&envelope, &e))).into_response(),
                },
            };
            let clouds: Vec<serde_json::Value> = reports
                .into_iter()
                .map(|(cloud, result)| match result {
                    Ok(report) => json!({"cloud": cloud, "report": report}),
                    Err(e) => json!({"cloud": cloud, "error": e.code(), "message": e.to_string()}),
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "correlation_id": envelope.correlation_id,
                    "type": envelope.command.command_type().as_str(),
                    "clouds": clouds,
                })),
            )
                .into_response()
        }
    }
}
