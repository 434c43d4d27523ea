//! HTTP API.
//!
//! JSON endpoints over the stores and the ingress transaction:
//! - `POST /sms/send`: charge and enqueue a message
//! - `GET /sms/history`: per-recipient delivery rows for a customer
//! - `POST /balance/add`: top up a balance
//! - `GET /balance`: balance and transaction history

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::app::App;
use crate::ingress::{self, IngressError};
use crate::model::Sms;

/// Shared state for axum handlers.
type AppState = Arc<App>;

type ApiResult<T> = Result<T, (StatusCode, &'static str)>;

/// Start the HTTP server on the configured address.
pub async fn serve(
    app: AppState,
    listen_addr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = router(app);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "http api listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/sms/send", post(send_sms))
        .route("/sms/history", get(sms_history))
        .route("/balance", get(balance))
        .route("/balance/add", post(add_balance))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

// ============================================================================
// Handlers
// ============================================================================

async fn send_sms(
    State(app): State<AppState>,
    payload: Result<Json<Sms>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(sms) = payload.map_err(|e| {
        error!(error = %e, "invalid sms request body");
        (StatusCode::BAD_REQUEST, "invalid input")
    })?;

    match ingress::enqueue(&app, sms).await {
        Ok(sms_identifier) => Ok(Json(json!({
            "status": "processing",
            "sms_identifier": sms_identifier,
        }))),
        Err(IngressError::NoRecipients) => {
            error!("sms request with zero recipients");
            Err((StatusCode::BAD_REQUEST, "zero recipients"))
        }
        Err(IngressError::InsufficientBalance) => {
            Err((StatusCode::PAYMENT_REQUIRED, "insufficient balance"))
        }
        Err(e) => {
            error!(error = %e, "failed to enqueue sms");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    user_id: Option<String>,
    status: Option<String>,
    sms_identifier: Option<String>,
}

async fn sms_history(
    State(app): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    let user_id = parse_user_id(params.user_id.as_deref())?;

    let history = app
        .delivery
        .history(
            user_id,
            params.status.as_deref(),
            params.sms_identifier.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(user_id = user_id, error = %e, "failed to load sms history");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })?;

    Ok(Json(json!({ "history": history })))
}

#[derive(Debug, Deserialize)]
struct BalanceParams {
    user_id: Option<String>,
}

async fn balance(
    State(app): State<AppState>,
    Query(params): Query<BalanceParams>,
) -> ApiResult<Json<Value>> {
    let user_id = parse_user_id(params.user_id.as_deref())?;

    let balance = app.ledger.balance(user_id).await.map_err(|e| {
        error!(user_id = user_id, error = %e, "failed to load balance");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })?;

    let transactions = app.ledger.transactions(user_id).await.map_err(|e| {
        error!(user_id = user_id, error = %e, "failed to load transactions");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })?;

    Ok(Json(json!({
        "balance": balance,
        "transactions": transactions,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddBalanceRequest {
    user_id: i64,
    balance: u64,
    description: String,
}

async fn add_balance(
    State(app): State<AppState>,
    payload: Result<Json<AddBalanceRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload.map_err(|e| {
        error!(error = %e, "invalid add balance request body");
        (StatusCode::BAD_REQUEST, "invalid input")
    })?;

    app.ledger
        .deposit(request.user_id, request.balance, &request.description)
        .await
        .map_err(|e| {
            error!(user_id = request.user_id, error = %e, "failed to add balance");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })?;

    Ok(Json(json!("done")))
}

fn parse_user_id(raw: Option<&str>) -> Result<i64, (StatusCode, &'static str)> {
    raw.ok_or((StatusCode::BAD_REQUEST, "user_id is required"))?
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "user_id must be an integer"))
}
