#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use axum::{
    body::{to_bytes, Body},
    http::{
        header::{COOKIE, SET_COOKIE},
        Method, Request, StatusCode,
    },
    response::Response,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use clothing_store_api::{
    build_router,
    cache::{CacheBackend, InMemoryCache},
    config::AppConfig,
    db::{establish_connection_from_app_config, run_migrations},
    entities::{coupon, coupon_usage, customer, order, product},
    message_queue::{InMemoryMessageQueue, MessageQueue, PAYMENT_COMPLETED_TOPIC},
    services::payment_gateway::{PaymentGateway, PaystackGateway},
    webhooks::sign_payload,
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

pub const PAYSTACK_SECRET: &str = "sk_test_webhook_secret";
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";
pub const SESSION_COOKIE: &str = "sessionid";

/// Test harness: the full router over in-memory SQLite, cache and queue,
/// with the payment provider replaced by a wiremock server.
///
/// Shoppers are named by a label; each label keeps the session cookie the
/// server last issued to it, like a browser would.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub queue: Arc<InMemoryMessageQueue>,
    pub paystack: MockServer,
    cookies: Mutex<HashMap<String, String>>,
}

impl TestApp {
    pub async fn new() -> Self {
        let paystack = MockServer::start().await;

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            PAYSTACK_SECRET.to_string(),
            "test".to_string(),
        );
        // a single connection keeps every query on the same in-memory database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.cache_backend = "in-memory".to_string();
        cfg.cors_allow_any_origin = true;
        cfg.paystack_base_url = paystack.uri();
        cfg.public_base_url = "http://shop.test".to_string();

        let db = establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to connect to sqlite");
        run_migrations(&db).await.expect("failed to run migrations");

        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let gateway: Arc<dyn PaymentGateway> = Arc::new(
            PaystackGateway::new(
                &cfg.paystack_base_url,
                &cfg.paystack_secret_key,
                cfg.payment_timeout(),
            )
            .expect("gateway"),
        );

        let state = Arc::new(AppState::new(
            cfg,
            Arc::new(db),
            cache,
            queue.clone() as Arc<dyn MessageQueue>,
            gateway,
        ));
        let router = build_router(state.clone());

        Self {
            router,
            state,
            queue,
            paystack,
            cookies: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// Send a request with optional customer and session headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request")
    }

    /// The session cookie value currently held by `shopper`
    pub fn session_cookie(&self, shopper: &str) -> Option<String> {
        self.cookies.lock().expect("cookie jar").get(shopper).cloned()
    }

    /// Sends the shopper's cookie, then keeps whatever cookie the response sets.
    async fn with_jar(
        &self,
        shopper: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let cookie = self
            .session_cookie(shopper)
            .map(|value| format!("{}={}", SESSION_COOKIE, value));
        let mut all: Vec<(&str, &str)> = headers.to_vec();
        if let Some(cookie) = cookie.as_deref() {
            all.push((COOKIE.as_str(), cookie));
        }

        let response = self.request(method, uri, body, &all).await;
        for set_cookie in response.headers().get_all(SET_COOKIE) {
            let Some(raw) = set_cookie.to_str().ok() else {
                continue;
            };
            let Some(rest) = raw.strip_prefix(&format!("{}=", SESSION_COOKIE)) else {
                continue;
            };
            let value = rest.split(';').next().unwrap_or_default().to_string();
            let mut jar = self.cookies.lock().expect("cookie jar");
            if value.is_empty() || raw.contains("Max-Age=0") {
                jar.remove(shopper);
            } else {
                jar.insert(shopper.to_string(), value);
            }
        }
        response
    }

    /// Request as a signed-in customer browsing as `shopper`.
    pub async fn as_customer(
        &self,
        customer_id: Uuid,
        shopper: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        let customer = customer_id.to_string();
        self.with_jar(shopper, method, uri, body, &[("x-customer-id", customer.as_str())])
            .await
    }

    /// Request as the anonymous shopper `shopper`.
    pub async fn as_guest(
        &self,
        shopper: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        self.with_jar(shopper, method, uri, body, &[]).await
    }

    /// Deliver a raw webhook body; `signature` of `None` omits the header.
    pub async fn deliver_webhook(&self, body: &[u8], signature: Option<&str>) -> StatusCode {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(body.to_vec())).expect("build request"))
            .await
            .expect("router error during webhook delivery")
            .status()
    }

    /// Deliver a correctly signed webhook.
    pub async fn deliver_signed_webhook(&self, payload: &Value) -> StatusCode {
        let body = serde_json::to_vec(payload).expect("serialize webhook");
        let signature = sign_payload(PAYSTACK_SECRET, &body);
        self.deliver_webhook(&body, Some(&signature)).await
    }

    pub async fn seed_customer(&self, email: &str) -> customer::Model {
        customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email.to_string()),
            full_name: Set("Ada Obi".to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert customer")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            in_stock: Set(25),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert product")
    }

    pub async fn seed_coupon_window(
        &self,
        code: &str,
        discount: i32,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        active: bool,
    ) -> coupon::Model {
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            valid_from: Set(valid_from),
            valid_to: Set(valid_to),
            discount: Set(discount),
            active: Set(active),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert coupon")
    }

    /// An active coupon valid from yesterday until next week.
    pub async fn seed_coupon(&self, code: &str, discount: i32) -> coupon::Model {
        let now = Utc::now();
        self.seed_coupon_window(code, discount, now - Duration::days(1), now + Duration::days(7), true)
            .await
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(self.db())
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn coupon_usage_count(&self) -> u64 {
        coupon_usage::Entity::find()
            .count(self.db())
            .await
            .expect("count coupon usages")
    }

    pub async fn pending_notifications(&self) -> usize {
        self.queue.len(PAYMENT_COMPLETED_TOPIC).await
    }

    /// Adds products to the customer's cart and places the order; returns its id.
    pub async fn place_order_with(
        &self,
        customer_id: Uuid,
        shopper: &str,
        lines: &[(Uuid, i32)],
    ) -> Uuid {
        for (product_id, quantity) in lines {
            let response = self
                .as_customer(
                    customer_id,
                    shopper,
                    Method::POST,
                    &format!("/api/v1/cart/add/{}", product_id),
                    Some(json!({ "quantity": quantity })),
                )
                .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = self
            .as_customer(customer_id, shopper, Method::POST, "/api/v1/orders/create", None)
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        Uuid::parse_str(body["id"].as_str().expect("order id")).expect("uuid")
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response is json")
}

/// Decimals travel as JSON strings; compare by value, not by scale.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}

/// A provider `charge.success` event for the order.
pub fn charge_success(order_id: Uuid) -> Value {
    json!({
        "event": "charge.success",
        "data": {
            "status": "success",
            "gateway_response": "Successful",
            "reference": format!("ref-{}", order_id.simple()),
            "amount": 9000,
            "metadata": { "order_id": order_id.to_string() }
        }
    })
}
