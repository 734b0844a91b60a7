//! Shopper sessions: the identity a request acts for and the checkout state
//! (`coupon_id`, `order_id`) carried between requests.

mod store;

pub use store::CacheSessionStore;

use crate::errors::{ApiError, ServiceError};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use chrono::{DateTime, Utc};
use tower_sessions::{
    cookie::SameSite,
    session::Id,
    Expiry, Session, SessionManagerLayer,
};
use uuid::Uuid;

/// Header set by the upstream authentication layer
pub const CUSTOMER_HEADER: &str = "x-customer-id";
/// Cookie carrying the shopper's session id
pub const SESSION_COOKIE: &str = "sessionid";

const COUPON_ID: &str = "coupon_id";
const ORDER_ID: &str = "order_id";
const STARTED_AT: &str = "started_at";

/// Cookie-backed sessions stored in the shared cache, expiring after
/// `ttl_secs` without a visit.
pub fn session_layer(
    store: CacheSessionStore,
    ttl_secs: u64,
    secure: bool,
) -> SessionManagerLayer<CacheSessionStore> {
    let ttl = time::Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
    SessionManagerLayer::new(store)
        .with_name(SESSION_COOKIE)
        .with_http_only(true)
        .with_same_site(SameSite::Lax)
        .with_secure(secure)
        .with_expiry(Expiry::OnInactivity(ttl))
}

/// Typed access to the checkout keys of a session
#[derive(Clone, Debug)]
pub struct CheckoutSession(Session);

impl CheckoutSession {
    pub fn new(session: Session) -> Self {
        Self(session)
    }

    pub async fn coupon_id(&self) -> Result<Option<Uuid>, ServiceError> {
        Ok(self.0.get(COUPON_ID).await?)
    }

    pub async fn set_coupon_id(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        Ok(self.0.insert(COUPON_ID, coupon_id).await?)
    }

    pub async fn clear_coupon(&self) -> Result<(), ServiceError> {
        self.0.remove::<Uuid>(COUPON_ID).await?;
        Ok(())
    }

    /// The order placed in this session and awaiting payment
    pub async fn order_id(&self) -> Result<Option<Uuid>, ServiceError> {
        Ok(self.0.get(ORDER_ID).await?)
    }

    /// Swaps the applied coupon for the freshly placed order.
    pub async fn start_payment(&self, order_id: Uuid) -> Result<(), ServiceError> {
        self.clear_coupon().await?;
        self.0.insert(ORDER_ID, order_id).await?;
        Ok(())
    }

    /// Id of the stored session. A first-time visitor's session is written
    /// now so the id exists before the response sets the cookie. Reading
    /// first drops ids the store does not know.
    pub async fn persistent_id(&self) -> Result<Id, ServiceError> {
        if self.0.get::<DateTime<Utc>>(STARTED_AT).await?.is_none() {
            self.0.insert(STARTED_AT, Utc::now()).await?;
        }
        if self.0.id().is_none() {
            self.0.save().await?;
        }
        self.0
            .id()
            .ok_or_else(|| ServiceError::InternalError("session saved without an id".to_string()))
    }
}

/// Who a request acts for: the session, plus the customer when authenticated
#[derive(Clone, Debug)]
pub struct Shopper {
    pub session: CheckoutSession,
    pub customer_id: Option<Uuid>,
}

/// Authenticated customer; rejects the request with 401 otherwise
#[derive(Clone, Debug)]
pub struct AuthenticatedCustomer {
    pub customer_id: Uuid,
    pub session: CheckoutSession,
}

fn customer_from_parts(parts: &Parts) -> Result<Option<Uuid>, ApiError> {
    match parts.headers.get(CUSTOMER_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Some)
            .ok_or(ApiError::Unauthorized),
    }
}

async fn session_from_parts<S>(parts: &mut Parts, state: &S) -> Result<CheckoutSession, ApiError>
where
    S: Send + Sync,
{
    Session::from_request_parts(parts, state)
        .await
        .map(CheckoutSession::new)
        .map_err(|(_, reason)| ApiError::from(ServiceError::InternalError(reason.to_string())))
}

#[async_trait]
impl<S> FromRequestParts<S> for Shopper
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let customer_id = customer_from_parts(parts)?;
        Ok(Shopper {
            session: session_from_parts(parts, state).await?,
            customer_id,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedCustomer
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let customer_id = customer_from_parts(parts)?.ok_or(ApiError::Unauthorized)?;
        Ok(AuthenticatedCustomer {
            customer_id,
            session: session_from_parts(parts, state).await?,
        })
    }
}

impl From<&AuthenticatedCustomer> for Shopper {
    fn from(customer: &AuthenticatedCustomer) -> Self {
        Shopper {
            session: customer.session.clone(),
            customer_id: Some(customer.customer_id),
        }
    }
}
