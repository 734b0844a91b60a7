use crate::handlers::common::ok_json;
use crate::{
    errors::{ApiError, ServiceError},
    services::payments::PaymentInitiation,
    session::AuthenticatedCustomer,
    AppState,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for payment endpoints (the webhook is mounted separately)
pub fn payment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/process", get(payment_summary).post(payment_process))
        .route("/success", get(payment_success))
        .route("/canceled", get(payment_canceled))
}

/// The order placed in this session; the payment pages act on it
async fn session_order_id(customer: &AuthenticatedCustomer) -> Result<Uuid, ApiError> {
    customer
        .session
        .order_id()
        .await?
        .ok_or_else(|| {
            ApiError::from(ServiceError::NotFound(
                "No order awaiting payment".to_string(),
            ))
        })
}

/// Amount due for the session's order
async fn payment_summary(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
) -> Result<impl IntoResponse, ApiError> {
    let order_id = session_order_id(&customer).await?;
    let summary = state
        .services
        .payments
        .payment_summary(customer.customer_id, order_id)
        .await?;

    Ok(ok_json(summary))
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub order_id: Uuid,
    pub message: String,
}

/// Open the hosted payment page: 303 to the provider, 502 with a retry message otherwise
async fn payment_process(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
) -> Result<Response, ApiError> {
    let order_id = session_order_id(&customer).await?;
    let outcome = state
        .services
        .payments
        .initiate(customer.customer_id, order_id)
        .await?;

    Ok(match outcome {
        PaymentInitiation::Redirect { authorization_url } => {
            Redirect::to(&authorization_url).into_response()
        }
        PaymentInitiation::Retry { message } => (
            StatusCode::BAD_GATEWAY,
            Json(RetryResponse { order_id, message }),
        )
            .into_response(),
    })
}

#[derive(Debug, Deserialize)]
pub struct PaymentCallbackParams {
    #[serde(default)]
    pub reference: String,
}

/// Redirect callback from the provider; verifies the reference server-to-server
async fn payment_success(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
    Query(params): Query<PaymentCallbackParams>,
) -> Result<impl IntoResponse, ApiError> {
    let order_id = session_order_id(&customer).await?;
    let confirmation = state
        .services
        .payments
        .confirm(customer.customer_id, order_id, &params.reference)
        .await?;

    Ok(ok_json(confirmation))
}

/// The shopper abandoned the hosted payment page
async fn payment_canceled() -> impl IntoResponse {
    ok_json(serde_json::json!({
        "status": "canceled",
        "message": "Payment was canceled. Your order is kept and can be paid later."
    }))
}
