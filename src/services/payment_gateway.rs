use crate::errors::ServiceError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};
use url::Url;
use uuid::Uuid;

/// Opaque data echoed back by the provider in webhooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub order_id: Uuid,
    pub cancel_action: String,
}

/// Request to open a hosted payment page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeTransaction {
    pub email: String,
    /// Amount in minor units
    pub amount: i64,
    pub client_reference_id: String,
    pub callback_url: String,
    pub metadata: PaymentMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// Send the shopper to the hosted payment page
    Redirect {
        authorization_url: String,
        reference: Option<String>,
    },
    /// Provider answered but refused to open a session
    Declined { message: String },
}

/// Provider's view of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub reference: String,
    pub status: String,
    pub amount: Option<i64>,
}

impl VerifiedTransaction {
    pub fn is_successful(&self) -> bool {
        self.status == "success"
    }
}

/// Hosted-payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(&self, request: &InitializeTransaction)
        -> Result<InitializeOutcome, ServiceError>;

    async fn verify(&self, reference: &str) -> Result<VerifiedTransaction, ServiceError>;
}

#[derive(Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    amount: i64,
    client_reference_id: &'a str,
    callback_url: &'a str,
    /// The provider expects metadata as an encoded JSON string
    metadata: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct InitializeData {
    authorization_url: Option<String>,
    reference: Option<String>,
}

#[derive(Deserialize)]
struct VerifyData {
    status: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
}

/// Paystack REST client
#[derive(Clone)]
pub struct PaystackGateway {
    client: reqwest::Client,
    base_url: Url,
}

impl PaystackGateway {
    pub fn new(base_url: &str, secret_key: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            ServiceError::InternalError(format!("invalid payment provider url: {}", e))
        })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", secret_key)).map_err(|_| {
            ServiceError::InternalError("payment provider key is not a valid header".to_string())
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ServiceError::InternalError("payment provider url cannot be a base".to_string())
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn read_envelope<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<Envelope<T>, ServiceError> {
        let status = response.status();
        response.json::<Envelope<T>>().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!(
                "unreadable payment provider response ({}): {}",
                status, e
            ))
        })
    }
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    warn!(error = %e, "payment provider unreachable");
    ServiceError::ExternalServiceError(format!("payment provider request failed: {}", e))
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    #[instrument(skip(self, request), fields(order_id = %request.metadata.order_id, amount = request.amount))]
    async fn initialize(
        &self,
        request: &InitializeTransaction,
    ) -> Result<InitializeOutcome, ServiceError> {
        let body = InitializeBody {
            email: &request.email,
            amount: request.amount,
            client_reference_id: &request.client_reference_id,
            callback_url: &request.callback_url,
            metadata: serde_json::to_string(&request.metadata)?,
        };

        let response = self
            .client
            .post(self.endpoint(&["transaction", "initialize"])?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: Envelope<InitializeData> = Self::read_envelope(response).await?;

        let declined = |message: Option<String>| InitializeOutcome::Declined {
            message: message.unwrap_or_else(|| "payment could not be initialized".to_string()),
        };
        if !envelope.status {
            return Ok(declined(envelope.message));
        }
        match envelope.data {
            Some(InitializeData {
                authorization_url: Some(authorization_url),
                reference,
            }) => Ok(InitializeOutcome::Redirect {
                authorization_url,
                reference,
            }),
            _ => Ok(declined(envelope.message)),
        }
    }

    #[instrument(skip(self))]
    async fn verify(&self, reference: &str) -> Result<VerifiedTransaction, ServiceError> {
        let response = self
            .client
            .get(self.endpoint(&["transaction", "verify", reference])?)
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: Envelope<VerifyData> = Self::read_envelope(response).await?;

        let data = envelope.data.ok_or_else(|| {
            ServiceError::ExternalServiceError(
                envelope
                    .message
                    .unwrap_or_else(|| "verification returned no data".to_string()),
            )
        })?;
        Ok(VerifiedTransaction {
            reference: data.reference.unwrap_or_else(|| reference.to_string()),
            status: data.status,
            amount: data.amount,
        })
    }
}
