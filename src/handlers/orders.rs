use crate::handlers::common::{created_json, ok_json, Page, PageQuery};
use crate::{
    entities::order::ShippingStatus, errors::ApiError, session::AuthenticatedCustomer, AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn order_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/create", get(order_summary).post(place_order))
        .route("/history", get(order_history))
        .route("/:order_id", get(order_detail))
        .route("/:order_id/shipping-status", put(update_shipping_status))
}

/// Pre-checkout summary of the cart that would be ordered
async fn order_summary(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .services
        .orders
        .order_summary(customer.customer_id, &customer.session)
        .await?;

    Ok(ok_json(summary))
}

/// Place an order from the cart
async fn place_order(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .place_order(customer.customer_id, &customer.session)
        .await?;

    Ok(created_json(order))
}

/// The customer's orders, newest first
async fn order_history(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
    Query(params): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .services
        .orders
        .order_history(customer.customer_id, params.page, params.per_page)
        .await?;

    Ok(ok_json(Page::new(
        history.orders,
        history.page,
        history.per_page,
        history.total,
    )))
}

/// A single order owned by the caller
async fn order_detail(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .order_detail(customer.customer_id, order_id)
        .await?;

    Ok(ok_json(order))
}

/// Move one of the caller's orders through fulfilment
async fn update_shipping_status(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdateShippingStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .update_shipping_status(customer.customer_id, order_id, payload.status)
        .await?;

    Ok(ok_json(order))
}

#[derive(Debug, Deserialize)]
pub struct UpdateShippingStatusRequest {
    pub status: ShippingStatus,
}
