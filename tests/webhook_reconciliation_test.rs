mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use clothing_store_api::{
    entities::order::ShippingStatus, message_queue::MessageQueue,
    notifications::NotificationWorker, webhooks::sign_payload,
};
use common::{charge_success, read_json, TestApp, PAYSTACK_SECRET};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

async fn order_with_coupon(app: &TestApp) -> (Uuid, Uuid) {
    let customer = app.seed_customer("ada@example.com").await;
    let jacket = app.seed_product("Denim jacket", dec!(50.00)).await;
    let scarf = app.seed_product("Silk scarf", dec!(12.00)).await;
    app.seed_coupon("SUMMER10", 10).await;
    app.as_customer(
        customer.id,
        "s-hook",
        Method::POST,
        "/api/v1/coupons/apply",
        Some(json!({ "code": "SUMMER10" })),
    )
    .await;
    let order_id = app
        .place_order_with(customer.id, "s-hook", &[(jacket.id, 2), (scarf.id, 1)])
        .await;
    (customer.id, order_id)
}

#[tokio::test]
async fn signed_charge_success_marks_the_order_paid() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;

    assert_eq!(
        app.deliver_signed_webhook(&charge_success(order_id)).await,
        StatusCode::OK
    );

    let order = app.order(order_id).await;
    assert!(order.paid);
    assert_eq!(order.shipping_status, Some(ShippingStatus::Pending));
    assert_eq!(app.coupon_usage_count().await, 1);
    assert_eq!(app.pending_notifications().await, 1);
}

#[tokio::test]
async fn replayed_delivery_is_a_no_op() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let payload = charge_success(order_id);

    for _ in 0..3 {
        assert_eq!(app.deliver_signed_webhook(&payload).await, StatusCode::OK);
    }

    assert!(app.order(order_id).await.paid);
    assert_eq!(app.coupon_usage_count().await, 1);
    assert_eq!(app.pending_notifications().await, 1);
}

#[tokio::test]
async fn concurrent_deliveries_apply_once() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let payload = charge_success(order_id);

    let (a, b) = tokio::join!(
        app.deliver_signed_webhook(&payload),
        app.deliver_signed_webhook(&payload)
    );
    assert_eq!(a, StatusCode::OK);
    assert_eq!(b, StatusCode::OK);
    assert_eq!(app.coupon_usage_count().await, 1);
    assert_eq!(app.pending_notifications().await, 1);
}

#[tokio::test]
async fn bad_or_missing_signature_never_changes_the_order() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let body = serde_json::to_vec(&charge_success(order_id)).unwrap();

    assert_eq!(
        app.deliver_webhook(&body, None).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        app.deliver_webhook(&body, Some("deadbeef")).await,
        StatusCode::BAD_REQUEST
    );
    let wrong_key = sign_payload("sk_someone_else", &body);
    assert_eq!(
        app.deliver_webhook(&body, Some(&wrong_key)).await,
        StatusCode::BAD_REQUEST
    );

    // signature over different bytes than delivered
    let mut tampered = body.clone();
    tampered.push(b' ');
    let signature = sign_payload(PAYSTACK_SECRET, &body);
    assert_eq!(
        app.deliver_webhook(&tampered, Some(&signature)).await,
        StatusCode::BAD_REQUEST
    );

    assert!(!app.order(order_id).await.paid);
    assert_eq!(app.coupon_usage_count().await, 0);
    assert_eq!(app.pending_notifications().await, 0);
}

#[tokio::test]
async fn signature_comparison_is_case_sensitive() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let body = serde_json::to_vec(&charge_success(order_id)).unwrap();
    let signature = sign_payload(PAYSTACK_SECRET, &body).to_uppercase();

    assert_eq!(
        app.deliver_webhook(&body, Some(&signature)).await,
        StatusCode::BAD_REQUEST
    );
    assert!(!app.order(order_id).await.paid);
}

#[tokio::test]
async fn metadata_sent_as_a_json_string_is_understood() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let mut payload = charge_success(order_id);
    payload["data"]["metadata"] =
        json!(json!({ "order_id": order_id.to_string(), "cancel_action": "x" }).to_string());

    assert_eq!(app.deliver_signed_webhook(&payload).await, StatusCode::OK);
    assert!(app.order(order_id).await.paid);
}

#[tokio::test]
async fn unsupported_events_are_refused_without_changes() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let mut payload = charge_success(order_id);
    payload["event"] = json!("transfer.success");

    assert_eq!(
        app.deliver_signed_webhook(&payload).await,
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert!(!app.order(order_id).await.paid);
}

#[tokio::test]
async fn unsuccessful_charge_is_acknowledged_without_changes() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    let mut payload = charge_success(order_id);
    payload["data"]["status"] = json!("failed");
    payload["data"]["gateway_response"] = json!("Declined");

    assert_eq!(app.deliver_signed_webhook(&payload).await, StatusCode::OK);
    let order = app.order(order_id).await;
    assert!(!order.paid);
    assert_eq!(order.shipping_status, None);
    assert_eq!(app.coupon_usage_count().await, 0);
}

#[tokio::test]
async fn malformed_payloads_and_unknown_orders_are_rejected() {
    let app = TestApp::new().await;

    let body = b"not json".to_vec();
    let signature = sign_payload(PAYSTACK_SECRET, &body);
    assert_eq!(
        app.deliver_webhook(&body, Some(&signature)).await,
        StatusCode::BAD_REQUEST
    );

    let mut no_order = charge_success(Uuid::new_v4());
    no_order["data"]["metadata"] = json!({});
    assert_eq!(
        app.deliver_signed_webhook(&no_order).await,
        StatusCode::BAD_REQUEST
    );

    assert_eq!(
        app.deliver_signed_webhook(&charge_success(Uuid::new_v4())).await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn webhook_does_not_issue_a_session() {
    let app = TestApp::new().await;
    let body = b"{}".to_vec();
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            None,
            &[("x-paystack-signature", sign_payload(PAYSTACK_SECRET, &body).as_str())],
        )
        .await;
    assert!(response.headers().get("set-cookie").is_none());
}

#[tokio::test]
async fn payment_feeds_recommendations() {
    let app = TestApp::new().await;
    let (customer_id, order_id) = order_with_coupon(&app).await;
    app.deliver_signed_webhook(&charge_success(order_id)).await;

    let items = read_json(
        app.as_customer(
            customer_id,
            "s-hook",
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
        )
        .await,
    )
    .await["items"]
        .clone();
    let first: Uuid = items[0]["product_id"].as_str().unwrap().parse().unwrap();
    let second: Uuid = items[1]["product_id"].as_str().unwrap().parse().unwrap();

    app.as_guest(
        "s-browse",
        Method::POST,
        &format!("/api/v1/cart/add/{}", first),
        Some(json!({ "quantity": 1 })),
    )
    .await;
    let cart = read_json(app.as_guest("s-browse", Method::GET, "/api/v1/cart", None).await).await;
    let suggested: Vec<&str> = cart["recommended_products"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(suggested, vec![second.to_string()]);
}

#[tokio::test]
async fn notification_worker_renders_the_paid_order() {
    let app = TestApp::new().await;
    let (_, order_id) = order_with_coupon(&app).await;
    app.deliver_signed_webhook(&charge_success(order_id)).await;

    let worker = NotificationWorker::new(
        app.state.db.clone(),
        app.queue.clone() as std::sync::Arc<dyn MessageQueue>,
        Duration::from_millis(10),
        Duration::from_secs(60),
    );
    assert!(app.order(order_id).await.notified_at.is_none());
    let notification = worker
        .process_next()
        .await
        .unwrap()
        .expect("one pending notification");

    assert_eq!(notification.order_id, order_id);
    assert_eq!(notification.recipient, "ada@example.com");
    assert_eq!(notification.subject, format!("Order nr. {}", order_id));
    // 2 x 50.00 + 12.00 less 10%
    assert!(notification.body.contains("100.80"), "{}", notification.body);
    assert!(worker.process_next().await.unwrap().is_none());
    assert_eq!(app.pending_notifications().await, 0);
    assert!(app.order(order_id).await.notified_at.is_some());
    assert_eq!(worker.sweep_unnotified().await.unwrap(), 0);
}
