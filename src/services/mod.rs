// Storefront money flow: cart → coupon → order snapshot → payment
pub mod cart;
pub mod coupons;
pub mod orders;
pub mod payment_gateway;
pub mod payments;
pub mod pricing;
pub mod recommender;
