//! HTTP control plane over the rules registry.

// Handlers have to be async for axum even when the registry work is not.
#![allow(clippy::unused_async)]

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use rules::{Action, RegistryError, RuleSpec, RulesRegistry, StoreError};
use std::sync::Arc;
use uuid::Uuid;

pub fn router(registry: Arc<RulesRegistry>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/rules", post(create_rule).get(list_rules))
        .route("/rules/{uuid}", get(get_rule).delete(delete_rule))
        .route("/rules/{uuid}/enable", patch(enable_rule))
        .route("/rules/{uuid}/disable", patch(disable_rule))
        .route("/rules/switch/{enable_uuid}/{disable_uuid}", patch(switch_rules))
        .route("/rules/{uuid}/update-action", patch(update_action))
        .with_state(registry)
}

async fn status() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Json(serde_json::json!({ "ready": true })),
    )
}

async fn create_rule(
    State(registry): State<Arc<RulesRegistry>>,
    payload: Result<Json<RuleSpec>, JsonRejection>,
) -> Response {
    let Json(spec) = match payload {
        Ok(json) => json,
        Err(rejection) => return bad_request(rejection),
    };

    match registry.add(spec) {
        Ok(uuid) => Json(serde_json::json!({ "uuid": uuid })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_rules(State(registry): State<Arc<RulesRegistry>>) -> Response {
    Json(registry.list()).into_response()
}

async fn get_rule(
    State(registry): State<Arc<RulesRegistry>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    match registry.get(uuid) {
        Some(rule) => Json(rule).into_response(),
        None => error_response(RegistryError::NotFound),
    }
}

async fn enable_rule(
    State(registry): State<Arc<RulesRegistry>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    outcome(registry.enable(uuid))
}

async fn disable_rule(
    State(registry): State<Arc<RulesRegistry>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    outcome(registry.disable(uuid))
}

async fn switch_rules(
    State(registry): State<Arc<RulesRegistry>>,
    Path((enable_uuid, disable_uuid)): Path<(Uuid, Uuid)>,
) -> Response {
    outcome(registry.switch(enable_uuid, disable_uuid))
}

async fn delete_rule(
    State(registry): State<Arc<RulesRegistry>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    outcome(registry.delete(uuid))
}

async fn update_action(
    State(registry): State<Arc<RulesRegistry>>,
    Path(uuid): Path<Uuid>,
    payload: Result<Json<Action>, JsonRejection>,
) -> Response {
    let Json(action) = match payload {
        Ok(json) => json,
        Err(rejection) => return bad_request(rejection),
    };

    outcome(registry.update_action(uuid, action))
}

fn outcome(result: Result<(), RegistryError>) -> Response {
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// Any body the rule schema cannot make sense of is a 400, including
/// well-formed JSON of the wrong shape.
fn bad_request(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "message": rejection.body_text() })),
    )
        .into_response()
}

fn error_response(error: RegistryError) -> Response {
    let status = match &error {
        RegistryError::NotFound | RegistryError::Store(StoreError::NotFound) => {
            StatusCode::NOT_FOUND
        }
        RegistryError::Duplicate | RegistryError::Store(StoreError::Duplicate) => {
            StatusCode::CONFLICT
        }
        RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
        RegistryError::Store(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(serde_json::json!({ "message": error.to_string() })),
    )
        .into_response()
}
