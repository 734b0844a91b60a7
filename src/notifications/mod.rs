//! Background delivery of "order paid" notifications.
//!
//! The webhook reconciler publishes a `PaymentCompleted` message once per
//! paid order; the worker here renders the customer notification. Messages
//! can be lost between commit and publish, so the worker also sweeps the
//! orders table for paid orders whose `notified_at` is still empty. Claiming
//! that column makes each order notify once however it is reached. Mail
//! transport is not wired in, so a rendered notification is logged.

use crate::{
    entities::{customer, order, order_item},
    errors::ServiceError,
    message_queue::{MessageQueue, PaymentCompleted, PAYMENT_COMPLETED_TOPIC},
    services::pricing::Totals,
};
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderPaidNotification {
    pub order_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Builds the notification for a paid order from its stored rows.
pub async fn render_order_paid(
    db: &DatabaseConnection,
    order_id: Uuid,
) -> Result<OrderPaidNotification, ServiceError> {
    let (order, customer) = order::Entity::find_by_id(order_id)
        .find_also_related(customer::Entity)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    let customer = customer.ok_or_else(|| {
        ServiceError::NotFound(format!("Customer {} not found", order.customer_id))
    })?;

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(db)
        .await?;
    let totals = Totals::from_lines(items.iter().map(|i| (i.price, i.quantity)), order.discount);
    let units: i32 = items.iter().map(|i| i.quantity).sum();

    Ok(OrderPaidNotification {
        order_id,
        recipient: customer.email,
        subject: format!("Order nr. {}", order_id),
        body: format!(
            "Dear {}, your payment for order {} was received. Items: {}. Amount paid: {}.",
            customer.full_name, order_id, units, totals.payable_total
        ),
    })
}

/// Paid orders picked up by one sweep
const SWEEP_BATCH: u64 = 50;

/// Marks the order notified unless another delivery already did.
/// Unpaid orders are never claimed.
async fn claim(db: &DatabaseConnection, order_id: Uuid) -> Result<bool, ServiceError> {
    let result = order::Entity::update_many()
        .set(order::ActiveModel {
            notified_at: Set(Some(Utc::now())),
            ..Default::default()
        })
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Paid.eq(true))
        .filter(order::Column::NotifiedAt.is_null())
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Drains the payment-completed topic and sweeps for missed notifications
#[derive(Clone)]
pub struct NotificationWorker {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl NotificationWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn MessageQueue>,
        poll_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            poll_interval,
            sweep_interval,
        }
    }

    /// Renders and claims the order's notification. `None` when it was
    /// already sent or the order is not paid.
    async fn deliver(&self, order_id: Uuid) -> Result<Option<OrderPaidNotification>, ServiceError> {
        let notification = render_order_paid(&self.db, order_id).await?;
        if !claim(&self.db, order_id).await? {
            debug!(order_id = %order_id, "notification already sent or order unpaid");
            return Ok(None);
        }
        info!(
            order_id = %notification.order_id,
            recipient = %notification.recipient,
            subject = %notification.subject,
            "order paid notification rendered"
        );
        Ok(Some(notification))
    }

    /// Notifies paid orders the queue never delivered. Returns how many were sent.
    pub async fn sweep_unnotified(&self) -> Result<usize, ServiceError> {
        let pending = order::Entity::find()
            .filter(order::Column::Paid.eq(true))
            .filter(order::Column::NotifiedAt.is_null())
            .order_by_asc(order::Column::UpdatedAt)
            .limit(SWEEP_BATCH)
            .all(&*self.db)
            .await?;

        let mut sent = 0;
        for order in pending {
            match self.deliver(order.id).await {
                Ok(Some(_)) => sent += 1,
                Ok(None) => {}
                Err(e) => warn!(order_id = %order.id, error = %e, "swept notification failed"),
            }
        }
        if sent > 0 {
            info!(sent, "sent notifications missed by the queue");
        }
        Ok(sent)
    }

    /// Handles one message, if any is waiting. Failed messages are nacked for
    /// redelivery; duplicates are acked without a second notification.
    pub async fn process_next(&self) -> Result<Option<OrderPaidNotification>, ServiceError> {
        let Some(message) = self
            .queue
            .subscribe(PAYMENT_COMPLETED_TOPIC)
            .await
            .map_err(|e| ServiceError::QueueError(e.to_string()))?
        else {
            return Ok(None);
        };

        let delivered = match message.decode::<PaymentCompleted>() {
            Ok(payload) => self.deliver(payload.order_id).await,
            Err(e) => Err(ServiceError::SerializationError(e.to_string())),
        };

        match delivered {
            Ok(notification) => {
                self.queue
                    .ack(&message.id)
                    .await
                    .map_err(|e| ServiceError::QueueError(e.to_string()))?;
                Ok(notification)
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "notification failed, requeueing");
                self.queue
                    .nack(&message.id)
                    .await
                    .map_err(|e| ServiceError::QueueError(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Polls the queue and sweeps periodically, starting with a sweep,
    /// until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("notification worker started");
            let mut sweep = tokio::time::interval(self.sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.process_next().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "notification processing error"),
                }
                tokio::select! {
                    _ = sweep.tick() => {
                        if let Err(e) = self.sweep_unnotified().await {
                            error!(error = %e, "notification sweep failed");
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("notification worker stopped");
        })
    }
}
