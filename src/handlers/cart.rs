use crate::handlers::common::{ok_json, validate_payload};
use crate::{
    entities::product,
    errors::ApiError,
    services::cart::{CartOwner, CartSummary},
    session::Shopper,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Suggestions shown with the cart
const CART_RECOMMENDATIONS: usize = 4;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(cart_detail))
        .route("/add/:product_id", post(add_to_cart))
        .route("/remove/:product_id", delete(remove_from_cart))
}

#[derive(Debug, Serialize)]
pub struct CartDetailResponse {
    #[serde(flatten)]
    pub cart: CartSummary,
    pub recommended_products: Vec<product::Model>,
}

/// Cart lines, totals with the session coupon, and co-purchase suggestions
async fn cart_detail(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
) -> Result<impl IntoResponse, ApiError> {
    let summary = cart_summary(&state, &shopper).await?;
    let product_ids: Vec<Uuid> = summary.items.iter().map(|line| line.product.id).collect();

    let recommended_products = state
        .services
        .recommender
        .suggest_products_for(&product_ids, CART_RECOMMENDATIONS)
        .await?;

    Ok(ok_json(CartDetailResponse {
        cart: summary,
        recommended_products,
    }))
}

/// Add a product, or set its quantity when `override` is true
async fn add_to_cart(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<AddToCartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_payload(&payload)?;

    let owner = CartOwner::for_shopper(&shopper).await?;
    state
        .services
        .cart
        .add(&owner, product_id, payload.quantity, payload.override_quantity)
        .await?;

    Ok(ok_json(cart_summary(&state, &shopper).await?))
}

/// Remove a product; removing one that is not in the cart succeeds
async fn remove_from_cart(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = CartOwner::for_shopper(&shopper).await?;
    state.services.cart.remove(&owner, product_id).await?;

    Ok(ok_json(cart_summary(&state, &shopper).await?))
}

async fn cart_summary(state: &AppState, shopper: &Shopper) -> Result<CartSummary, ApiError> {
    let services = &state.services;
    let coupon = services.coupons.session_coupon(&shopper.session).await?;
    let owner = CartOwner::for_shopper(shopper).await?;
    let (_, summary) = services.cart.summary(&owner, coupon.as_ref()).await?;
    Ok(summary)
}

// Request DTOs

#[derive(Debug, Deserialize, Validate)]
pub struct AddToCartRequest {
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
    #[serde(default, rename = "override")]
    pub override_quantity: bool,
}

fn default_quantity() -> i32 {
    1
}
