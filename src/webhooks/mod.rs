//! Inbound provider callbacks.

pub mod paystack;

use hmac::{Hmac, Mac};
use sha2::Sha512;

pub use paystack::{PaystackWebhookReconciler, ReconcileOutcome, WebhookError};

type HmacSha512 = Hmac<Sha512>;

fn keyed_mac(secret: &str) -> HmacSha512 {
    <HmacSha512 as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Lowercase hex HMAC-SHA512 of `payload` keyed by `secret`
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a lowercase hex signature against the payload in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if !signature
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = keyed_mac(secret);
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
