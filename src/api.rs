//! REST endpoints for rule management and manual processing.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::error::{RuleError, ValidationErrors};
use crate::rules::draft::RuleDraft;
use crate::rules::model::ForwardingRule;
use crate::rules::store::RuleStore;
use crate::worker::queue::ForwardQueue;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RuleStore>,
    pub queue: ForwardQueue,
}

/// Build the Axum router with rule management and processing routes.
pub fn forwarder_routes(store: Arc<dyn RuleStore>, queue: ForwardQueue) -> Router {
    let state = AppState { store, queue };

    Router::new()
        .route("/health", get(health))
        .route("/rules", get(list_rules).post(create_rule))
        .route(
            "/rules/{rule_name}",
            get(get_rule).put(replace_rule).delete(delete_rule),
        )
        .route("/rules/{rule_name}/status", put(set_status))
        .route("/rules/source/{source_channel_id}", get(rules_for_source))
        .route("/process", post(process))
        .with_state(state)
}

/// List projection of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSummary {
    pub rule_name: String,
    pub is_enabled: bool,
    pub source_channel_id: i64,
    pub target_channel_ids: Vec<i64>,
}

impl From<&ForwardingRule> for RuleSummary {
    fn from(rule: &ForwardingRule) -> Self {
        Self {
            rule_name: rule.name().to_string(),
            is_enabled: rule.is_enabled(),
            source_channel_id: rule.source_channel_id(),
            target_channel_ids: rule.target_channel_ids().to_vec(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub is_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub source_channel_id: i64,
    pub message_id: i64,
}

type ApiResponse = (StatusCode, Json<Value>);

fn validation_response(errors: &ValidationErrors) -> ApiResponse {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "errors": messages })),
    )
}

fn error_response(e: RuleError) -> ApiResponse {
    match &e {
        RuleError::Validation(errors) => validation_response(errors),
        RuleError::DuplicateName(_) => (StatusCode::CONFLICT, Json(json!({"error": e.to_string()}))),
        RuleError::NotFound(_) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
        RuleError::NameMismatch { .. } => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))),
        RuleError::Database(_) => {
            error!(error = %e, "Rule store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Rule store unavailable"})),
            )
        }
    }
}

fn rule_json(rule: &ForwardingRule) -> Json<Value> {
    Json(json!(RuleDraft::from(rule)))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "channel-forwarder"
    }))
}

// ── Rules ───────────────────────────────────────────────────────────────

async fn list_rules(State(state): State<AppState>) -> ApiResponse {
    match state.store.list_rules().await {
        Ok(rules) => {
            let summaries: Vec<RuleSummary> = rules.iter().map(RuleSummary::from).collect();
            (StatusCode::OK, Json(json!(summaries)))
        }
        Err(e) => error_response(e),
    }
}

async fn get_rule(State(state): State<AppState>, Path(rule_name): Path<String>) -> ApiResponse {
    match state.store.get_rule(&rule_name).await {
        Ok(Some(rule)) => (StatusCode::OK, rule_json(&rule)),
        Ok(None) => error_response(RuleError::NotFound(rule_name)),
        Err(e) => error_response(e),
    }
}

async fn rules_for_source(
    State(state): State<AppState>,
    Path(source_channel_id): Path<i64>,
) -> ApiResponse {
    match state.store.rules_for_source(source_channel_id).await {
        Ok(rules) => {
            let drafts: Vec<RuleDraft> = rules.iter().map(RuleDraft::from).collect();
            (StatusCode::OK, Json(json!(drafts)))
        }
        Err(e) => error_response(e),
    }
}

async fn create_rule(State(state): State<AppState>, Json(draft): Json<RuleDraft>) -> ApiResponse {
    let rule = match draft.into_rule() {
        Ok(rule) => rule,
        Err(errors) => {
            warn!(%errors, "Rejected rule creation");
            return validation_response(&errors);
        }
    };

    match state.store.create_rule(&rule).await {
        Ok(()) => {
            info!(rule = %rule.name(), source = rule.source_channel_id(), "Rule created");
            (StatusCode::CREATED, rule_json(&rule))
        }
        Err(e) => error_response(e),
    }
}

async fn replace_rule(
    State(state): State<AppState>,
    Path(rule_name): Path<String>,
    Json(draft): Json<RuleDraft>,
) -> ApiResponse {
    if draft.rule_name != rule_name {
        return error_response(RuleError::NameMismatch {
            path: rule_name,
            body: draft.rule_name,
        });
    }
    let rule = match draft.into_rule() {
        Ok(rule) => rule,
        Err(errors) => {
            warn!(rule = %rule_name, %errors, "Rejected rule update");
            return validation_response(&errors);
        }
    };

    match state.store.replace_rule(&rule).await {
        Ok(()) => {
            info!(rule = %rule.name(), "Rule replaced");
            (StatusCode::OK, rule_json(&rule))
        }
        Err(e) => error_response(e),
    }
}

async fn delete_rule(State(state): State<AppState>, Path(rule_name): Path<String>) -> ApiResponse {
    match state.store.delete_rule(&rule_name).await {
        Ok(()) => {
            info!(rule = %rule_name, "Rule deleted");
            (StatusCode::OK, Json(json!({"status": "deleted"})))
        }
        Err(e) => error_response(e),
    }
}

async fn set_status(
    State(state): State<AppState>,
    Path(rule_name): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResponse {
    match state.store.set_enabled(&rule_name, req.is_enabled).await {
        Ok(rule) => {
            info!(rule = %rule_name, is_enabled = req.is_enabled, "Rule status changed");
            (StatusCode::OK, rule_json(&rule))
        }
        Err(e) => error_response(e),
    }
}

// ── Processing ──────────────────────────────────────────────────────────

async fn process(State(state): State<AppState>, Json(req): Json<ProcessRequest>) -> ApiResponse {
    match state.queue.enqueue(req.source_channel_id, req.message_id).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(json!({"jobId": job_id}))),
        Err(e) => {
            error!(
                source_channel_id = req.source_channel_id,
                message_id = req.message_id,
                error = %e,
                "Could not enqueue forwarding job"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::rules::store::InMemoryRuleStore;

    fn app() -> (Router, tokio::sync::mpsc::Receiver<crate::worker::queue::ForwardJob>) {
        let (queue, rx) = ForwardQueue::new(4);
        (forwarder_routes(Arc::new(InMemoryRuleStore::new()), queue), rx)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _rx) = app();
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn create_reports_every_violation() {
        let (app, _rx) = app();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/rules",
                json!({
                    "ruleName": "",
                    "sourceChannelId": 1,
                    "targetChannelIds": [],
                    "filterOptions": {"minMessageLength": 10, "maxMessageLength": 5}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let errors = body_json(resp).await["errors"].as_array().unwrap().len();
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn process_returns_job_id() {
        let (app, mut rx) = app();
        let resp = app
            .oneshot(json_request("POST", "/process", json!({"sourceChannelId": -1, "messageId": 9})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();
        let job = rx.recv().await.unwrap();
        assert_eq!(job.id.to_string(), job_id);
        assert_eq!(job.message_id, 9);
    }

    #[tokio::test]
    async fn process_with_closed_queue_is_server_error() {
        let (app, rx) = app();
        drop(rx);
        let resp = app
            .oneshot(json_request("POST", "/process", json!({"sourceChannelId": -1, "messageId": 9})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
