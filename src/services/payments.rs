use crate::{
    entities::{customer, order},
    errors::ServiceError,
    services::{
        orders::{OrderService, OrderView},
        payment_gateway::{
            InitializeOutcome, InitializeTransaction, PaymentGateway, PaymentMetadata,
        },
    },
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const RETRY_MESSAGE: &str = "We could not reach the payment provider. Please try again.";

/// What the shopper is about to pay
#[derive(Clone, Debug, Serialize)]
pub struct PaymentSummary {
    pub order: OrderView,
    /// Payable total in minor units
    pub amount: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentInitiation {
    Redirect { authorization_url: String },
    Retry { message: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentConfirmation {
    /// Provider reports success; the reference is stored on the order
    Verified { order: order::Model },
    /// Provider did not confirm; nothing changed
    Unverified { status: String },
}

/// Starts hosted-payment sessions and checks redirect callbacks.
///
/// Confirmation here is advisory: it records the provider reference but
/// never marks an order paid. Only the webhook does that.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    orders: OrderService,
    gateway: Arc<dyn PaymentGateway>,
    public_base_url: String,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: OrderService,
        gateway: Arc<dyn PaymentGateway>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            orders,
            gateway,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.public_base_url, path)
    }

    #[instrument(skip(self))]
    pub async fn payment_summary(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<PaymentSummary, ServiceError> {
        let order = self.orders.order_detail(customer_id, order_id).await?;
        let amount = order.totals.payable_minor_units()?;
        Ok(PaymentSummary { order, amount })
    }

    /// Opens a provider session for the order's payable total.
    ///
    /// Provider refusals and transport failures both come back as
    /// `PaymentInitiation::Retry`; nothing is persisted either way.
    #[instrument(skip(self))]
    pub async fn initiate(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<PaymentInitiation, ServiceError> {
        let order = self.orders.order_detail(customer_id, order_id).await?;
        if order.order.paid {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already paid",
                order_id
            )));
        }

        let customer = customer::Entity::find_by_id(customer_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", customer_id))
            })?;

        let request = InitializeTransaction {
            email: customer.email,
            amount: order.totals.payable_minor_units()?,
            client_reference_id: order_id.to_string(),
            callback_url: self.public_url("/payments/success"),
            metadata: PaymentMetadata {
                order_id,
                cancel_action: self.public_url("/payments/canceled"),
            },
        };

        match self.gateway.initialize(&request).await {
            Ok(InitializeOutcome::Redirect {
                authorization_url,
                reference,
            }) => {
                info!(order_id = %order_id, reference = ?reference, amount = request.amount, "payment session opened");
                Ok(PaymentInitiation::Redirect { authorization_url })
            }
            Ok(InitializeOutcome::Declined { message }) => {
                warn!(order_id = %order_id, provider_message = %message, "payment session declined");
                Ok(PaymentInitiation::Retry {
                    message: RETRY_MESSAGE.to_string(),
                })
            }
            Err(ServiceError::ExternalServiceError(e)) => {
                warn!(order_id = %order_id, error = %e, "payment provider failure");
                Ok(PaymentInitiation::Retry {
                    message: RETRY_MESSAGE.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Verifies the reference from the redirect callback with the provider.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
        reference: &str,
    ) -> Result<PaymentConfirmation, ServiceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ServiceError::ValidationError(
                "reference is required".to_string(),
            ));
        }

        let view = self.orders.order_detail(customer_id, order_id).await?;
        let verified = self.gateway.verify(reference).await?;
        if !verified.is_successful() {
            info!(order_id = %order_id, status = %verified.status, "payment not confirmed by provider");
            return Ok(PaymentConfirmation::Unverified {
                status: verified.status,
            });
        }

        let mut active: order::ActiveModel = view.order.into();
        active.payment_ref = Set(Some(reference.to_string()));
        active.updated_at = Set(Utc::now());
        let order = active.update(&*self.db).await?;

        info!(order_id = %order_id, reference = %reference, "payment reference recorded");
        Ok(PaymentConfirmation::Verified { order })
    }
}
