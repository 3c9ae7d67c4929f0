//! Credit ledger HTTP client implementation.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;

use credit_ledger_core::{Amount, DeductOutcome, GrantOutcome, PlanId, UserId};

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, BalanceResponse, ChargeOutcome, OpRequest, OpResponse, TransactionEntry,
    TransactionsResponse,
};

/// Credit ledger API client.
///
/// Authenticates with the service API key and names the calling service in
/// `x-service-name`.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    client: Client,
    base_url: Url,
    api_key: String,
    service_name: String,
}

impl LedgerClient {
    /// Create a new ledger client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the ledger service (e.g., `"http://credit-ledger:8080"`)
    /// * `api_key` - Service API key for authentication
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if the base URL is not usable.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a new ledger client with custom options.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if the base URL is not usable or
    /// the HTTP client cannot be built.
    pub fn with_options(
        base_url: &str,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Configuration(format!("invalid base URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Configuration(format!(
                "base URL cannot carry a path: {base_url}"
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            service_name: options.service_name,
        })
    }

    /// Get a user's balance. Unknown users have a balance of 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<i64, ClientError> {
        let url = self.endpoint(&["v1", "ledger", user_id.as_str(), "balance"])?;

        let response = self.authorized(self.client.get(url)).send().await?;

        let body: BalanceResponse = Self::handle_response(response).await?;
        Ok(body.balance)
    }

    /// List a user's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionEntry>, ClientError> {
        let url = self.endpoint(&["v1", "ledger", user_id.as_str(), "transactions"])?;

        let response = self
            .authorized(self.client.get(url))
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await?;

        let body: TransactionsResponse = Self::handle_response(response).await?;
        Ok(body.transactions)
    }

    /// Deduct credits before billable work.
    ///
    /// An insufficient balance is returned as [`DeductOutcome::Insufficient`]
    /// with the available and required amounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns any other
    /// error. After [`ClientError::Unavailable`] the deduction may or may not
    /// have happened.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<DeductOutcome, ClientError> {
        let request = OpRequest::Deduct {
            user_id,
            amount,
            reason,
        };

        match self.op(&request).await {
            Ok(response) => Ok(DeductOutcome::Applied {
                balance: response.balance,
            }),
            Err(OpError::Insufficient {
                available,
                required,
            }) => Ok(DeductOutcome::Insufficient {
                available,
                required,
            }),
            Err(OpError::Client(e)) => Err(e),
        }
    }

    /// Add credits. Each call adds again.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn add(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<i64, ClientError> {
        let request = OpRequest::Add {
            user_id,
            amount,
            reason,
        };
        Ok(self.op(&request).await?.balance)
    }

    /// Return credits after failed billable work.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn refund(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<i64, ClientError> {
        let request = OpRequest::Refund {
            user_id,
            amount,
            reason,
        };
        Ok(self.op(&request).await?.balance)
    }

    /// Apply the periodic plan grant if one is due.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error
    /// (including `404` for an unknown plan).
    pub async fn grant_if_due(
        &self,
        user_id: &UserId,
        plan_id: &PlanId,
    ) -> Result<GrantOutcome, ClientError> {
        let request = OpRequest::Grant { user_id, plan_id };
        let response = self.op(&request).await?;

        Ok(GrantOutcome {
            granted: response.granted.unwrap_or(false),
            balance: response.balance,
        })
    }

    /// Deduct `amount`, run `work`, and refund if the work fails.
    ///
    /// The work only runs once the deduction has been applied. A refund that
    /// cannot be delivered is logged with the amount for reconciliation and
    /// reported as `refunded: false`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the deduction itself fails.
    pub async fn charge<T, E, F, Fut>(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
        work: F,
    ) -> Result<ChargeOutcome<T, E>, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let balance = match self.deduct(user_id, amount, reason).await? {
            DeductOutcome::Applied { balance } => balance,
            DeductOutcome::Insufficient {
                available,
                required,
            } => {
                return Ok(ChargeOutcome::Insufficient {
                    available,
                    required,
                })
            }
        };

        match work().await {
            Ok(output) => Ok(ChargeOutcome::Completed { output, balance }),
            Err(error) => {
                tracing::warn!(
                    user_id = %user_id,
                    amount = amount.get(),
                    reason,
                    error = %error,
                    "Billable work failed, refunding"
                );

                let refund_reason = format!("refund: {reason}");
                let refunded = match self.refund(user_id, amount, &refund_reason).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(
                            user_id = %user_id,
                            amount = amount.get(),
                            reason,
                            error = %e,
                            "Refund failed; credits need manual reconciliation"
                        );
                        false
                    }
                };

                Ok(ChargeOutcome::Failed { error, refunded })
            }
        }
    }

    async fn op(&self, request: &OpRequest<'_>) -> Result<OpResponse, OpError> {
        let url = self.endpoint(&["v1", "ledger", "ops"])?;

        let response = self
            .authorized(self.client.post(url))
            .json(request)
            .send()
            .await
            .map_err(ClientError::from)?;

        if response.status() == StatusCode::PAYMENT_REQUIRED {
            let body: ApiErrorResponse = Self::read_json(response).await?;
            return Err(OpError::Insufficient {
                available: body.error.detail_i64("available").unwrap_or(0),
                required: body.error.detail_i64("required").unwrap_or(0),
            });
        }

        Ok(Self::handle_response(response).await?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
    }

    /// Build an endpoint URL; each segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Configuration("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Self::read_json(response).await;
        }

        // Try to parse error response
        let error_body: Result<ApiErrorResponse, _> = Self::read_json(response).await;

        match error_body {
            Ok(api_error) => {
                let code = api_error.error.code;
                let message = api_error.error.message;

                if code == "store_unavailable" {
                    return Err(ClientError::Unavailable(message));
                }

                Err(ClientError::Api {
                    code,
                    message,
                    status: status.as_u16(),
                })
            }
            Err(_) if status == StatusCode::SERVICE_UNAVAILABLE => {
                Err(ClientError::Unavailable(format!("HTTP {status}")))
            }
            Err(_) => Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            }),
        }
    }
}

/// Result of a ledger operation before the insufficient case is folded into
/// an outcome.
enum OpError {
    Insufficient { available: i64, required: i64 },
    Client(ClientError),
}

impl From<ClientError> for OpError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

impl From<OpError> for ClientError {
    fn from(e: OpError) -> Self {
        match e {
            OpError::Client(e) => e,
            OpError::Insufficient {
                available,
                required,
            } => Self::Api {
                code: "insufficient_credits".to_string(),
                message: format!("insufficient credits: available={available}, required={required}"),
                status: StatusCode::PAYMENT_REQUIRED.as_u16(),
            },
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 10).
    pub timeout_seconds: u64,
    /// Service name to include in requests.
    pub service_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            service_name: "unknown".to_string(),
        }
    }
}

impl ClientOptions {
    /// Create options with a service name.
    #[must_use]
    pub fn with_service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_segments() {
        let client = LedgerClient::new("http://localhost:8080", "test-api-key").unwrap();
        let url = client.endpoint(&["v1", "ledger", "ops"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/v1/ledger/ops");
    }

    #[test]
    fn endpoint_handles_trailing_slash_and_prefix() {
        let client = LedgerClient::new("http://gateway/ledger/", "test-api-key").unwrap();
        let url = client.endpoint(&["v1", "ledger", "ops"]).unwrap();
        assert_eq!(url.as_str(), "http://gateway/ledger/v1/ledger/ops");
    }

    #[test]
    fn endpoint_encodes_user_ids() {
        let client = LedgerClient::new("http://localhost:8080", "test-api-key").unwrap();
        let url = client
            .endpoint(&["v1", "ledger", "user/1?x", "balance"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/v1/ledger/user%2F1%3Fx/balance"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            LedgerClient::new("not a url", "key"),
            Err(ClientError::Configuration(_))
        ));
        assert!(matches!(
            LedgerClient::new("mailto:ops@example.com", "key"),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn client_options() {
        let options = ClientOptions::with_service_name("video-gen");
        let client = LedgerClient::with_options("http://localhost:8080", "key", options).unwrap();
        assert_eq!(client.service_name, "video-gen");
    }
}
