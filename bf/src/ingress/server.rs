//! HTTP surface of the webhook ingress

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::broker::Broker;
use crate::state::StateManager;
use crate::workflow::RunScheduler;

use super::service::{IngressResult, IngressService};

/// Shared handler state
pub struct HttpState {
    pub service: Arc<IngressService>,
    pub state: StateManager,
    pub broker: Arc<Broker>,
    pub slots: Arc<RunScheduler>,
}

/// Build the ingress router
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/webhook/board", get(webhook_probe).post(webhook_receive))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(state: Arc<HttpState>, bind: &str) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "Webhook ingress listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// GET probe: echo the challenge query parameter, or report readiness
async fn webhook_probe(Query(params): Query<HashMap<String, String>>) -> Response {
    if let Some(challenge) = params.get("challenge") {
        debug!(challenge, "Challenge probe");
        return (StatusCode::OK, Json(json!({ "challenge": challenge }))).into_response();
    }
    (
        StatusCode::OK,
        Json(json!({ "message": "Webhook endpoint active", "status": "ready" })),
    )
        .into_response()
}

/// POST: the webhook delivery itself
async fn webhook_receive(
    State(http): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Invalid JSON body: {}", e) })),
            )
                .into_response();
        }
    };

    let header_map: Value = json!(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect::<HashMap<String, String>>()
    );
    let signature = headers
        .get("x-board-signature")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let result = http.service.process(raw, header_map, signature).await;
    render(result)
}

fn render(result: IngressResult) -> Response {
    match result {
        IngressResult::Challenge { challenge } => {
            (StatusCode::OK, Json(json!({ "challenge": challenge }))).into_response()
        }
        IngressResult::Accepted { queue_id } => (
            StatusCode::OK,
            Json(json!({ "status": "accepted", "queue_id": queue_id })),
        )
            .into_response(),
        IngressResult::Queued {
            queue_id,
            position,
            running_workflow_id,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "queued",
                "queue_info": {
                    "queue_id": queue_id,
                    "position": position,
                    "running_workflow_id": running_workflow_id,
                }
            })),
        )
            .into_response(),
        IngressResult::Reactivated { task_id, run_id } => (
            StatusCode::OK,
            Json(json!({ "status": "reactivated", "task_id": task_id, "run_id": run_id })),
        )
            .into_response(),
        IngressResult::Ignored { reason } => (
            StatusCode::OK,
            Json(json!({ "status": "ignored", "reason": reason })),
        )
            .into_response(),
        IngressResult::Malformed { detail } => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": detail }))).into_response()
        }
        IngressResult::Failure { detail } => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": detail }))).into_response()
        }
    }
}

/// Liveness summary: store, broker, worker slots
async fn health(State(http): State<Arc<HttpState>>) -> Response {
    let store_ok = http.state.list_queue_entries(None, None).await.is_ok();
    let depths = http.broker.depths().await;

    let status = if store_ok { "healthy" } else { "unhealthy" };
    let code = if store_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        code,
        Json(json!({
            "status": status,
            "store": if store_ok { "up" } else { "down" },
            "queues": depths.depths,
            "running_runs": http.slots.running_count(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_accepted() {
        let response = render(IngressResult::Accepted {
            queue_id: "queue_1".into(),
        });
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_render_queued_is_202() {
        let response = render(IngressResult::Queued {
            queue_id: "queue_2".into(),
            position: 1,
            running_workflow_id: Some("queue_1".into()),
        });
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn test_render_errors() {
        let response = render(IngressResult::Malformed { detail: "bad".into() });
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = render(IngressResult::Failure { detail: "db down".into() });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
