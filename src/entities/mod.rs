pub mod coupon;
pub mod coupon_usage;
pub mod customer;
pub mod order;
pub mod order_item;
pub mod product;
