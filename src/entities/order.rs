use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable purchase snapshot; only `paid`, `shipping_status`,
/// `payment_ref` and `notified_at` change after placement.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub customer_id: Uuid,
    pub paid: bool,
    #[sea_orm(nullable)]
    pub shipping_status: Option<ShippingStatus>,
    #[sea_orm(nullable)]
    pub coupon_id: Option<Uuid>,
    /// Discount percentage snapshotted from the coupon at placement
    pub discount: i32,
    #[sea_orm(nullable)]
    pub payment_ref: Option<String>,
    /// Set once the order-paid notification has been claimed for sending
    #[sea_orm(nullable)]
    pub notified_at: Option<DateTime<Utc>>,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
    #[sea_orm(
        belongs_to = "super::coupon::Entity",
        from = "Column::CouponId",
        to = "super::coupon::Column::Id"
    )]
    Coupon,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl Related<super::coupon::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Coupon.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Fulfilment progress, stored as a single character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(1))")]
#[serde(rename_all = "lowercase")]
pub enum ShippingStatus {
    #[sea_orm(string_value = "P")]
    Pending,
    #[sea_orm(string_value = "S")]
    Shipped,
    #[sea_orm(string_value = "D")]
    Delivered,
    #[sea_orm(string_value = "C")]
    Canceled,
}

impl ShippingStatus {
    /// Statuses that only make sense once the order is paid
    pub fn requires_payment(self) -> bool {
        matches!(self, ShippingStatus::Shipped | ShippingStatus::Delivered)
    }
}
