use crate::{
    entities::{coupon, coupon_usage},
    errors::ServiceError,
    session::CheckoutSession,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::{Expr, Func},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const INVALID_COUPON_MESSAGE: &str = "Invalid or expired coupon.";
pub const COUPON_ALREADY_USED_MESSAGE: &str = "You have already used this coupon.";

/// Input for creating a coupon
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewCoupon {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    #[validate(range(min = 0, max = 100))]
    pub discount: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Resolves coupon codes against their window, the active flag and
/// the customer's redemption history.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Case-insensitive exact match on the code
    async fn find_by_code<C: ConnectionTrait>(
        conn: &C,
        code: &str,
    ) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(coupon::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col(coupon::Column::Code)))
                    .eq(code.trim().to_lowercase()),
            )
            .one(conn)
            .await?)
    }

    /// Applies `code` for the customer and stores the coupon in the session.
    ///
    /// # Errors
    ///
    /// * `ServiceError::ValidationError` with "Invalid or expired coupon." when no
    ///   active coupon with that code covers `now`
    /// * `ServiceError::ValidationError` with "You have already used this coupon."
    ///   when a usage exists; any coupon already in the session is dropped
    #[instrument(skip(self, session))]
    pub async fn apply(
        &self,
        customer_id: Uuid,
        session: &CheckoutSession,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<coupon::Model, ServiceError> {
        let coupon = Self::find_by_code(&*self.db, code)
            .await?
            .filter(|c| c.is_redeemable_at(now))
            .ok_or_else(|| ServiceError::ValidationError(INVALID_COUPON_MESSAGE.to_string()))?;

        if Self::has_been_used(&*self.db, customer_id, coupon.id).await? {
            session.clear_coupon().await?;
            warn!(coupon_id = %coupon.id, customer_id = %customer_id, "coupon reuse rejected");
            return Err(ServiceError::ValidationError(
                COUPON_ALREADY_USED_MESSAGE.to_string(),
            ));
        }

        session.set_coupon_id(coupon.id).await?;

        info!(coupon_id = %coupon.id, customer_id = %customer_id, "coupon applied");
        Ok(coupon)
    }

    /// Whether the customer has already redeemed the coupon
    pub async fn has_been_used<C: ConnectionTrait>(
        conn: &C,
        customer_id: Uuid,
        coupon_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let count = coupon_usage::Entity::find()
            .filter(coupon_usage::Column::CustomerId.eq(customer_id))
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .count(conn)
            .await?;
        Ok(count > 0)
    }

    /// Records a redemption unless one already exists for the pair.
    /// Returns whether a row was written.
    pub async fn record_usage<C: ConnectionTrait>(
        conn: &C,
        customer_id: Uuid,
        coupon_id: Uuid,
    ) -> Result<bool, ServiceError> {
        if Self::has_been_used(conn, customer_id, coupon_id).await? {
            return Ok(false);
        }

        coupon_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            coupon_id: Set(coupon_id),
            used_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;
        Ok(true)
    }

    /// The coupon referenced by the session, if it still exists.
    pub async fn session_coupon(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<coupon::Model>, ServiceError> {
        match session.coupon_id().await? {
            Some(id) => Ok(coupon::Entity::find_by_id(id).one(&*self.db).await?),
            None => Ok(None),
        }
    }

    /// Creates a coupon; codes are unique regardless of case.
    #[instrument(skip(self))]
    pub async fn create_coupon(&self, input: NewCoupon) -> Result<coupon::Model, ServiceError> {
        input.validate()?;
        if input.valid_from > input.valid_to {
            return Err(ServiceError::ValidationError(
                "valid_from must not be after valid_to".to_string(),
            ));
        }
        if Self::find_by_code(&*self.db, &input.code).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Coupon code {} already exists",
                input.code
            )));
        }

        let coupon = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.trim().to_string()),
            valid_from: Set(input.valid_from),
            valid_to: Set(input.valid_to),
            discount: Set(input.discount),
            active: Set(input.active),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await?;

        info!(coupon_id = %coupon.id, code = %coupon.code, "coupon created");
        Ok(coupon)
    }
}
