use crate::{
    cache::CacheBackend,
    entities::{coupon, product},
    errors::ServiceError,
    services::pricing::Totals,
    session::Shopper,
};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tower_sessions::session::Id;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Largest quantity accepted by a single add
pub const MAX_QUANTITY_PER_ADD: i32 = 99;

/// Whose cart is addressed; decides the cache key and its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CartOwner {
    Customer(Uuid),
    Guest(Id),
}

impl CartOwner {
    pub fn cache_key(&self) -> String {
        match self {
            CartOwner::Customer(id) => format!("cart_{}", id),
            CartOwner::Guest(session_id) => format!("cart_guest_{}", session_id),
        }
    }

    /// A guest's cart is keyed by a session id, so a first visit stores the session.
    pub async fn for_shopper(shopper: &Shopper) -> Result<Self, ServiceError> {
        match shopper.customer_id {
            Some(id) => Ok(CartOwner::Customer(id)),
            None => Ok(CartOwner::Guest(shopper.session.persistent_id().await?)),
        }
    }
}

/// One stored cart line; the price is captured on first add.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartEntry {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl CartEntry {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// The cart mapping as persisted in the cache
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cart {
    entries: BTreeMap<Uuid, CartEntry>,
}

impl Cart {
    /// Sets (`override_quantity`) or increments the quantity of `product`.
    pub fn add(
        &mut self,
        product: &product::Model,
        quantity: i32,
        override_quantity: bool,
    ) -> Result<(), ServiceError> {
        if !(1..=MAX_QUANTITY_PER_ADD).contains(&quantity) {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be between 1 and {}",
                MAX_QUANTITY_PER_ADD
            )));
        }

        let entry = self.entries.entry(product.id).or_insert_with(|| CartEntry {
            product_id: product.id,
            quantity: 0,
            unit_price: product.price,
        });
        if override_quantity {
            entry.quantity = quantity;
        } else {
            entry.quantity = entry.quantity.saturating_add(quantity);
        }
        Ok(())
    }

    /// Returns false when the product was not in the cart.
    pub fn remove(&mut self, product_id: &Uuid) -> bool {
        self.entries.remove(product_id).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CartEntry> {
        self.entries.values()
    }

    pub fn get(&self, product_id: &Uuid) -> Option<&CartEntry> {
        self.entries.get(product_id)
    }

    pub fn product_ids(&self) -> Vec<Uuid> {
        self.entries.keys().copied().collect()
    }

    /// Sum of quantities, not of distinct products
    pub fn len(&self) -> i64 {
        self.entries.values().map(|e| i64::from(e.quantity)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_price(&self) -> Decimal {
        self.entries.values().map(CartEntry::line_total).sum()
    }

    pub fn totals(&self, coupon: Option<&coupon::Model>) -> Totals {
        Totals::from_lines(
            self.entries.values().map(|e| (e.unit_price, e.quantity)),
            coupon.map(|c| c.discount).unwrap_or(0),
        )
    }
}

/// A cart entry joined with its live product row
#[derive(Clone, Debug, Serialize)]
pub struct CartLine {
    pub product: product::Model,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Cart contents plus pricing, as shown to the shopper
#[derive(Clone, Debug, Serialize)]
pub struct CartSummary {
    pub items: Vec<CartLine>,
    pub item_count: i64,
    pub coupon_code: Option<String>,
    #[serde(flatten)]
    pub totals: Totals,
}

/// Cache-backed cart storage.
///
/// Every mutation re-serializes and stores the whole mapping under the
/// owner's key; there are no partial updates. Guest carts expire with the
/// session, customer carts are kept until checkout.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    guest_ttl: Duration,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        guest_ttl: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            guest_ttl,
        }
    }

    fn ttl_for(&self, owner: &CartOwner) -> Option<Duration> {
        match owner {
            CartOwner::Customer(_) => None,
            CartOwner::Guest(_) => Some(self.guest_ttl),
        }
    }

    /// Loads the owner's cart. A cache miss stores and returns an empty cart.
    #[instrument(skip(self))]
    pub async fn load(&self, owner: &CartOwner) -> Result<Cart, ServiceError> {
        let key = owner.cache_key();
        match self.cache.get(&key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => {
                debug!(key = %key, "cart miss, starting empty cart");
                let cart = Cart::default();
                self.save(owner, &cart).await?;
                Ok(cart)
            }
        }
    }

    async fn save(&self, owner: &CartOwner, cart: &Cart) -> Result<(), ServiceError> {
        let raw = serde_json::to_string(cart)?;
        self.cache
            .set(&owner.cache_key(), &raw, self.ttl_for(owner))
            .await?;
        Ok(())
    }

    /// Adds a product to the cart or changes its quantity.
    ///
    /// # Errors
    ///
    /// * `ServiceError::NotFound` - the product does not exist
    /// * `ServiceError::ValidationError` - quantity outside `1..=99`; the cart is untouched
    #[instrument(skip(self))]
    pub async fn add(
        &self,
        owner: &CartOwner,
        product_id: Uuid,
        quantity: i32,
        override_quantity: bool,
    ) -> Result<Cart, ServiceError> {
        let product = product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let mut cart = self.load(owner).await?;
        cart.add(&product, quantity, override_quantity)?;
        self.save(owner, &cart).await?;

        info!(product_id = %product_id, quantity, override_quantity, "cart updated");
        Ok(cart)
    }

    /// Removes a product; removing an absent product writes nothing.
    #[instrument(skip(self))]
    pub async fn remove(&self, owner: &CartOwner, product_id: Uuid) -> Result<Cart, ServiceError> {
        let mut cart = self.load(owner).await?;
        if cart.remove(&product_id) {
            self.save(owner, &cart).await?;
            info!(product_id = %product_id, "removed from cart");
        }
        Ok(cart)
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, owner: &CartOwner) -> Result<(), ServiceError> {
        self.cache.delete(&owner.cache_key()).await?;
        Ok(())
    }

    /// Joins the entries with their product rows, in cart order.
    /// Entries whose product has since disappeared are skipped.
    pub async fn lines(&self, cart: &Cart) -> Result<Vec<CartLine>, ServiceError> {
        if cart.is_empty() {
            return Ok(Vec::new());
        }

        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(cart.product_ids()))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        Ok(cart
            .entries()
            .filter_map(|entry| {
                products.get(&entry.product_id).map(|product| CartLine {
                    product: product.clone(),
                    quantity: entry.quantity,
                    unit_price: entry.unit_price,
                    line_total: entry.line_total(),
                })
            })
            .collect())
    }

    /// Cart contents with totals for the given (already resolved) coupon.
    pub async fn summary(
        &self,
        owner: &CartOwner,
        coupon: Option<&coupon::Model>,
    ) -> Result<(Cart, CartSummary), ServiceError> {
        let cart = self.load(owner).await?;
        let summary = CartSummary {
            items: self.lines(&cart).await?,
            item_count: cart.len(),
            coupon_code: coupon.map(|c| c.code.clone()),
            totals: cart.totals(coupon),
        };
        Ok((cart, summary))
    }
}
