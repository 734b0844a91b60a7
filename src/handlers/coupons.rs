use crate::handlers::common::{ok_json, validate_payload};
use crate::{errors::ApiError, session::AuthenticatedCustomer, AppState};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for coupon endpoints
pub fn coupon_routes() -> Router<Arc<AppState>> {
    Router::new().route("/apply", post(apply_coupon))
}

/// Apply a coupon code to the current checkout
async fn apply_coupon(
    State(state): State<Arc<AppState>>,
    customer: AuthenticatedCustomer,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_payload(&payload)?;

    let coupon = state
        .services
        .coupons
        .apply(
            customer.customer_id,
            &customer.session,
            &payload.code,
            Utc::now(),
        )
        .await?;

    Ok(ok_json(AppliedCouponResponse {
        coupon_id: coupon.id,
        code: coupon.code,
        discount: coupon.discount,
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct AppliedCouponResponse {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount: i32,
}
