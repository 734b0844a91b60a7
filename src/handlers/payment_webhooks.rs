use crate::{webhooks::ReconcileOutcome, AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use std::sync::Arc;
use tracing::{info, warn};

// POST /api/v1/payments/webhook
//
// Answers with a bare status: 200 when handled (including replays), 4xx/5xx
// otherwise so the provider redelivers.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(state.config.webhook_signature_header.as_str())
        .and_then(|v| v.to_str().ok());

    match state.services.webhooks.reconcile(signature, &body).await {
        Ok(outcome) => {
            match outcome {
                ReconcileOutcome::Paid { order_id } => info!(order_id = %order_id, "webhook applied payment"),
                ReconcileOutcome::AlreadyPaid { order_id } => info!(order_id = %order_id, "webhook replay ignored"),
                ReconcileOutcome::NotSuccessful { order_id } => info!(order_id = %order_id, "webhook charge not successful"),
            }
            StatusCode::OK
        }
        Err(e) => {
            let status = e.status_code();
            warn!(status = %status, error = %e, "webhook rejected");
            status
        }
    }
}
