pub mod cart;
pub mod common;
pub mod coupons;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    cache::CacheBackend,
    config::AppConfig,
    db::DbPool,
    message_queue::MessageQueue,
    services::{
        cart::CartService, coupons::CouponService, orders::OrderService,
        payment_gateway::PaymentGateway, payments::PaymentService, recommender::Recommender,
    },
    webhooks::PaystackWebhookReconciler,
};
use std::sync::Arc;

/// Services shared by the HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub recommender: Arc<Recommender>,
    pub webhooks: Arc<PaystackWebhookReconciler>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        cache: Arc<dyn CacheBackend>,
        message_queue: Arc<dyn MessageQueue>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AppConfig,
    ) -> Self {
        let cart = CartService::new(db_pool.clone(), cache.clone(), config.session_ttl());
        let coupons = CouponService::new(db_pool.clone());
        let orders = OrderService::new(db_pool.clone(), cart.clone(), coupons.clone());
        let payments = PaymentService::new(
            db_pool.clone(),
            orders.clone(),
            gateway,
            config.public_base_url.clone(),
        );
        let recommender = Recommender::new(db_pool.clone(), cache);
        let webhooks = PaystackWebhookReconciler::new(
            db_pool,
            message_queue,
            recommender.clone(),
            config.paystack_secret_key.clone(),
        );

        Self {
            cart: Arc::new(cart),
            coupons: Arc::new(coupons),
            orders: Arc::new(orders),
            payments: Arc::new(payments),
            recommender: Arc::new(recommender),
            webhooks: Arc::new(webhooks),
        }
    }
}
