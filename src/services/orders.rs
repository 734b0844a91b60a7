use crate::{
    entities::{customer, order, order::ShippingStatus, order_item, product},
    errors::ServiceError,
    services::{
        cart::{CartOwner, CartService, CartSummary},
        coupons::CouponService,
        pricing::Totals,
    },
    session::CheckoutSession,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// An order with its line items and the totals derived from them
#[derive(Clone, Debug, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub totals: Totals,
}

impl OrderView {
    /// Totals come only from the order's own rows, never the live catalog.
    pub fn new(order: order::Model, items: Vec<order_item::Model>) -> Self {
        let totals = Totals::from_lines(
            items.iter().map(|item| (item.price, item.quantity)),
            order.discount,
        );
        Self {
            order,
            items,
            totals,
        }
    }
}

/// Pre-checkout view of what would be ordered
#[derive(Clone, Debug, Serialize)]
pub struct OrderSummary {
    pub customer: customer::Model,
    pub cart: CartSummary,
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderHistory {
    pub orders: Vec<OrderView>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}

/// Turns the live cart into an immutable order snapshot and serves order reads.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    cart: CartService,
    coupons: CouponService,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, cart: CartService, coupons: CouponService) -> Self {
        Self { db, cart, coupons }
    }

    async fn find_customer(&self, customer_id: Uuid) -> Result<customer::Model, ServiceError> {
        customer::Entity::find_by_id(customer_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", customer_id))
            })
    }

    /// What placing the order now would produce.
    #[instrument(skip(self, session))]
    pub async fn order_summary(
        &self,
        customer_id: Uuid,
        session: &CheckoutSession,
    ) -> Result<OrderSummary, ServiceError> {
        let customer = self.find_customer(customer_id).await?;
        let coupon = self.coupons.session_coupon(session).await?;
        let (_, cart) = self
            .cart
            .summary(&CartOwner::Customer(customer_id), coupon.as_ref())
            .await?;
        Ok(OrderSummary { customer, cart })
    }

    /// Places an order from the customer's cart.
    ///
    /// The order row and one item per cart line are written in a single
    /// transaction, using the prices captured in the cart. Once committed the
    /// cart is cleared, the coupon leaves the session and the new order id is
    /// stored there for the payment step. Failures of those follow-up steps
    /// are logged; the placed order is still returned.
    ///
    /// # Errors
    ///
    /// * `ServiceError::InvalidOperation` - the cart is empty
    /// * `ServiceError::NotFound` - the customer or a carted product no longer exists
    ///
    /// Nothing is written when an error is returned.
    #[instrument(skip(self, session))]
    pub async fn place_order(
        &self,
        customer_id: Uuid,
        session: &CheckoutSession,
    ) -> Result<OrderView, ServiceError> {
        let owner = CartOwner::Customer(customer_id);
        let cart = self.cart.load(&owner).await?;
        if cart.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot place an order with an empty cart".to_string(),
            ));
        }

        self.find_customer(customer_id).await?;
        let coupon = self.coupons.session_coupon(session).await?;

        let txn = self.db.begin().await?;

        let product_ids = cart.product_ids();
        let existing: HashSet<Uuid> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids.clone()))
            .all(&txn)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        if let Some(missing) = product_ids.iter().find(|id| !existing.contains(id)) {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                missing
            )));
        }

        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            paid: Set(false),
            shipping_status: Set(None),
            coupon_id: Set(coupon.as_ref().map(|c| c.id)),
            discount: Set(coupon.as_ref().map(|c| c.discount).unwrap_or(0)),
            payment_ref: Set(None),
            notified_at: Set(None),
            placed_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::new();
        for entry in cart.entries() {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(entry.product_id),
                quantity: Set(entry.quantity),
                price: Set(entry.unit_price),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        txn.commit().await?;

        if let Err(e) = self.cart.clear(&owner).await {
            warn!(order_id = %order.id, error = %e, "order placed but the cart was not cleared");
        }
        if let Err(e) = session.start_payment(order.id).await {
            warn!(order_id = %order.id, error = %e, "order placed but the session was not updated");
        }

        let view = OrderView::new(order, items);
        info!(
            order_id = %view.order.id,
            items = view.items.len(),
            payable = %view.totals.payable_total,
            "order placed"
        );
        Ok(view)
    }

    async fn items_for(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }

    /// Loads an order with its items regardless of owner
    pub async fn load(&self, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = self.items_for(order.id).await?;
        Ok(OrderView::new(order, items))
    }

    /// Loads an order owned by `customer_id`; other customers' orders read as missing.
    #[instrument(skip(self))]
    pub async fn order_detail(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderView, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = self.items_for(order.id).await?;
        Ok(OrderView::new(order, items))
    }

    /// The customer's orders, newest first. `page` starts at 1.
    #[instrument(skip(self))]
    pub async fn order_history(
        &self,
        customer_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderHistory, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);

        let paginator = order::Entity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::PlacedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
        if !order_ids.is_empty() {
            for item in order_item::Entity::find()
                .filter(order_item::Column::OrderId.is_in(order_ids))
                .all(&*self.db)
                .await?
            {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let orders = orders
            .into_iter()
            .map(|order| {
                let items = items_by_order.remove(&order.id).unwrap_or_default();
                OrderView::new(order, items)
            })
            .collect();

        Ok(OrderHistory {
            orders,
            page,
            per_page,
            total,
        })
    }

    /// Sets the shipping status of one of the customer's orders. Does not touch `paid`.
    ///
    /// # Errors
    ///
    /// * `ServiceError::NotFound` - no such order, or it belongs to another customer
    /// * `ServiceError::InvalidOperation` - shipped or delivered on an unpaid order
    #[instrument(skip(self))]
    pub async fn update_shipping_status(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
        status: ShippingStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order.paid && status.requires_payment() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is not paid and cannot be marked {:?}",
                order_id, status
            )));
        }

        let mut active: order::ActiveModel = order.into();
        active.shipping_status = Set(Some(status));
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        info!(order_id = %order_id, status = ?status, "shipping status updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheBackend, CacheError, InMemoryCache},
        db::{establish_connection_with_config, run_migrations, DbConfig},
        session::CacheSessionStore,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tower_sessions::Session;

    /// Cache whose deletes always fail
    #[derive(Default)]
    struct StickyCache(InMemoryCache);

    #[async_trait]
    impl CacheBackend for StickyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
            self.0.set(key, value, ttl).await
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::OperationFailed("delete refused".into()))
        }
        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.0.exists(key).await
        }
        async fn incr_score(&self, key: &str, member: &str, delta: f64) -> Result<(), CacheError> {
            self.0.incr_score(key, member, delta).await
        }
        async fn union_by_score(&self, keys: &[String]) -> Result<Vec<String>, CacheError> {
            self.0.union_by_score(keys).await
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    struct Fixture {
        service: OrderService,
        db: Arc<DatabaseConnection>,
        customer_id: Uuid,
        product_id: Uuid,
    }

    async fn fixture(cache: Arc<dyn CacheBackend>) -> Fixture {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);

        let customer_id = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set("ada@example.com".into()),
            full_name: Set("Ada Obi".into()),
            created_at: Set(Utc::now()),
        }
        .insert(&*db)
        .await
        .unwrap()
        .id;
        let product_id = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Linen shirt".into()),
            price: Set(dec!(25.00)),
            in_stock: Set(10),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&*db)
        .await
        .unwrap()
        .id;

        let cart = CartService::new(db.clone(), cache, Duration::from_secs(60));
        let service = OrderService::new(db.clone(), cart, CouponService::new(db.clone()));
        Fixture {
            service,
            db,
            customer_id,
            product_id,
        }
    }

    fn checkout_session() -> CheckoutSession {
        let store = CacheSessionStore::new(Arc::new(InMemoryCache::new()));
        CheckoutSession::new(Session::new(None, Arc::new(store), None))
    }

    async fn placed_order(f: &Fixture) -> OrderView {
        let owner = CartOwner::Customer(f.customer_id);
        f.service.cart.add(&owner, f.product_id, 2, false).await.unwrap();
        f.service
            .place_order(f.customer_id, &checkout_session())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cart_cleanup_failure_still_returns_the_order() {
        let f = fixture(Arc::new(StickyCache::default())).await;
        let owner = CartOwner::Customer(f.customer_id);
        f.service.cart.add(&owner, f.product_id, 2, false).await.unwrap();
        let session = checkout_session();

        let view = f
            .service
            .place_order(f.customer_id, &session)
            .await
            .unwrap();

        assert_eq!(view.totals.payable_total, dec!(50.00));
        assert!(order::Entity::find_by_id(view.order.id)
            .one(&*f.db)
            .await
            .unwrap()
            .is_some());
        assert_eq!(session.order_id().await.unwrap(), Some(view.order.id));
    }

    #[tokio::test]
    async fn shipping_status_is_scoped_to_the_owner() {
        let f = fixture(Arc::new(InMemoryCache::new())).await;
        let view = placed_order(&f).await;

        assert_matches!(
            f.service
                .update_shipping_status(Uuid::new_v4(), view.order.id, ShippingStatus::Canceled)
                .await,
            Err(ServiceError::NotFound(_))
        );
        let stored = f.service.load(view.order.id).await.unwrap();
        assert_eq!(stored.order.shipping_status, None);
    }

    #[tokio::test]
    async fn unpaid_orders_can_only_be_canceled() {
        let f = fixture(Arc::new(InMemoryCache::new())).await;
        let view = placed_order(&f).await;

        for status in [ShippingStatus::Shipped, ShippingStatus::Delivered] {
            assert_matches!(
                f.service
                    .update_shipping_status(f.customer_id, view.order.id, status)
                    .await,
                Err(ServiceError::InvalidOperation(_))
            );
        }

        let canceled = f
            .service
            .update_shipping_status(f.customer_id, view.order.id, ShippingStatus::Canceled)
            .await
            .unwrap();
        assert_eq!(canceled.shipping_status, Some(ShippingStatus::Canceled));
        assert!(!canceled.paid);
    }
}
