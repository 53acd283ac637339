//! JSON over HTTP interface of the service.
//!
//! Every route except `/health` requires the `x-owner-id` header set by the gateway.
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::CHEMFLOW_VERSION;
use crate::server::bootstrap::ServerContext;

pub mod budgets;
pub mod cost;
pub mod error;
pub mod owner;
pub mod simulations;

pub fn create_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/simulations",
            get(simulations::list).post(simulations::submit),
        )
        .route(
            "/simulations/{id}",
            get(simulations::get).delete(simulations::delete),
        )
        .route("/simulations/{id}/cancel", post(simulations::cancel))
        .route("/cost/estimate", post(cost::estimate))
        .route("/cost/compare", get(cost::compare))
        .route("/budgets", get(budgets::list).post(budgets::create))
        .route(
            "/budgets/{id}",
            get(budgets::get).put(budgets::update).delete(budgets::delete),
        )
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<ServerContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": CHEMFLOW_VERSION,
        "benchmarks": ctx.service.catalog().len(),
    }))
}
