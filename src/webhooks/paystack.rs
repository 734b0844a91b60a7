use crate::{
    entities::{order, order::ShippingStatus, order_item},
    errors::ServiceError,
    message_queue::{Message, MessageQueue, PaymentCompleted, PAYMENT_COMPLETED_TOPIC},
    services::{coupons::CouponService, recommender::Recommender},
};
use axum::http::StatusCode;
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const CHARGE_SUCCESS_EVENT: &str = "charge.success";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<sea_orm::DbErr> for WebhookError {
    fn from(err: sea_orm::DbErr) -> Self {
        WebhookError::Service(ServiceError::DatabaseError(err))
    }
}

impl WebhookError {
    /// Every failure is non-2xx so the provider redelivers.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature | Self::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UnsupportedEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::Service(e) => e.status_code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The order moved from unpaid to paid during this delivery
    Paid { order_id: Uuid },
    /// Replay of an already applied payment; nothing changed
    AlreadyPaid { order_id: Uuid },
    /// A charge event that did not succeed; acknowledged without changes
    NotSuccessful { order_id: Uuid },
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: String,
    data: ChargeData,
}

#[derive(Debug, Deserialize)]
struct ChargeData {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    gateway_response: Option<String>,
    metadata: Value,
}

impl ChargeData {
    fn is_successful(&self) -> bool {
        self.status.as_deref() == Some("success")
            && self.gateway_response.as_deref() == Some("Successful")
    }

    /// `metadata` arrives either as an object or as the JSON string we sent.
    fn order_id(&self) -> Result<Uuid, WebhookError> {
        let metadata = match &self.metadata {
            Value::String(encoded) => serde_json::from_str(encoded)
                .map_err(|e| WebhookError::MalformedPayload(format!("metadata: {}", e)))?,
            other => other.clone(),
        };
        let raw = metadata
            .get("order_id")
            .and_then(Value::as_str)
            .ok_or_else(|| WebhookError::MalformedPayload("metadata.order_id missing".into()))?;
        Uuid::parse_str(raw)
            .map_err(|_| WebhookError::MalformedPayload(format!("bad order id {}", raw)))
    }
}

/// Authenticates provider webhooks and applies the one-way unpaid → paid transition.
#[derive(Clone)]
pub struct PaystackWebhookReconciler {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    recommender: Recommender,
    secret: String,
}

impl PaystackWebhookReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn MessageQueue>,
        recommender: Recommender,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            db,
            queue,
            recommender,
            secret: secret.into(),
        }
    }

    /// Runs the gates in order: signature present, signature valid, payload
    /// well-formed, event supported. Only then is the order touched.
    #[instrument(skip(self, signature, body), fields(body_len = body.len()))]
    pub async fn reconcile(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<ReconcileOutcome, WebhookError> {
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        if !super::verify_signature(&self.secret, body, signature) {
            warn!("webhook signature verification failed");
            return Err(WebhookError::InvalidSignature);
        }

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        let order_id = payload.data.order_id()?;

        if payload.event != CHARGE_SUCCESS_EVENT {
            info!(event = %payload.event, order_id = %order_id, "ignoring webhook event");
            return Err(WebhookError::UnsupportedEvent(payload.event));
        }
        if !payload.data.is_successful() {
            info!(
                order_id = %order_id,
                status = ?payload.data.status,
                gateway_response = ?payload.data.gateway_response,
                "charge not successful"
            );
            return Ok(ReconcileOutcome::NotSuccessful { order_id });
        }

        self.mark_paid(order_id).await
    }

    async fn mark_paid(&self, order_id: Uuid) -> Result<ReconcileOutcome, WebhookError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or(WebhookError::OrderNotFound(order_id))?;
        if order.paid {
            txn.commit().await?;
            info!(order_id = %order_id, "payment already applied");
            return Ok(ReconcileOutcome::AlreadyPaid { order_id });
        }

        // conditional on paid = false so concurrent deliveries cannot both win
        let result = order::Entity::update_many()
            .set(order::ActiveModel {
                paid: Set(true),
                shipping_status: Set(Some(
                    order.shipping_status.unwrap_or(ShippingStatus::Pending),
                )),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Paid.eq(false))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            txn.commit().await?;
            info!(order_id = %order_id, "payment applied by a concurrent delivery");
            return Ok(ReconcileOutcome::AlreadyPaid { order_id });
        }

        if let Some(coupon_id) = order.coupon_id {
            CouponService::record_usage(&txn, order.customer_id, coupon_id).await?;
        }
        let product_ids: Vec<Uuid> = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|item| item.product_id)
            .collect();

        txn.commit().await?;
        info!(order_id = %order_id, "order marked paid");

        self.after_payment(order_id, &product_ids).await;
        Ok(ReconcileOutcome::Paid { order_id })
    }

    /// Follow-up work for a fresh payment. Failures are logged; the payment stands.
    async fn after_payment(&self, order_id: Uuid, product_ids: &[Uuid]) {
        let published = match Message::from_payload(
            PAYMENT_COMPLETED_TOPIC,
            &PaymentCompleted { order_id },
        ) {
            Ok(message) => self.queue.publish(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            error!(order_id = %order_id, error = %e, "failed to enqueue payment notification; the worker sweep will send it");
        }

        if let Err(e) = self.recommender.products_bought(product_ids).await {
            error!(order_id = %order_id, error = %e, "failed to record co-purchases");
        }
    }
}
