//! Client for the payment partner's REST API.
//!
//! Every response arrives wrapped as `{status, data, message}`. Transport
//! errors, timeouts and 5xx answers are retried once; a `FAILURE` envelope is
//! a definitive answer and is not.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use shared::{TicketError, TicketResult};

const ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub partner_id: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Success,
    Failure,
}

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub status: EnvelopeStatus,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantApplicationForm {
    pub legal_name: String,
    pub organization_number: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantApplication {
    pub application_id: String,
    pub web_kyb_url: Option<String>,
    pub application_status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatusReport {
    pub application_id: String,
    pub application_status: String,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub store_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoreRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedStore {
    pub store_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTerminal {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPrice {
    pub regular: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxLine {
    pub tax_rate_percent: i64,
    pub amount: i64,
}

/// Amounts are integer minor units.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub name: String,
    pub quantity: i32,
    pub quantity_unit: String,
    pub unit_price: UnitPrice,
    pub total: i64,
    pub tax_lines: Vec<TaxLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFunctions {
    pub cancel_previous_pending_order: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(rename = "terminal$id")]
    pub terminal_id: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub order_lines: Vec<OrderLine>,
    pub control_functions: ControlFunctions,
}

impl CreateOrderRequest {
    pub fn purchase(terminal_id: String, order_lines: Vec<OrderLine>) -> Self {
        Self {
            terminal_id,
            order_type: "purchase".to_string(),
            order_lines,
            control_functions: ControlFunctions {
                cancel_previous_pending_order: true,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: String,
    pub payment_page_link: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOrder {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ReceiptEmail<'a> {
    email: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidOutcome {
    Voided,
    /// The gateway refused with `CANNOT_VOID`; callers treat this as success.
    CannotVoid,
}

/// Optional merchant and store headers for a call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope<'a> {
    pub merchant_id: Option<&'a str>,
    pub store_id: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub fn merchant(merchant_id: &'a str) -> Self {
        Self { merchant_id: Some(merchant_id), store_id: None }
    }

    pub fn store(merchant_id: &'a str, store_id: &'a str) -> Self {
        Self { merchant_id: Some(merchant_id), store_id: Some(store_id) }
    }
}

enum Attempt {
    Retry(String),
    Final(TicketError),
}

#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> TicketResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TicketError::GatewayFailure(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub async fn create_merchant(&self, form: &MerchantApplicationForm) -> TicketResult<MerchantApplication> {
        let path = format!("/partners/{}/merchants", self.config.partner_id);
        self.call(Method::POST, &path, Scope::default(), Some(form)).await
    }

    pub async fn application_status(&self, application_id: &str) -> TicketResult<ApplicationStatusReport> {
        let path = format!("/partners/{}/merchants/{}/status", self.config.partner_id, application_id);
        self.call::<(), _>(Method::GET, &path, Scope::default(), None).await
    }

    pub async fn create_store(&self, merchant_id: &str, request: &CreateStoreRequest) -> TicketResult<CreatedStore> {
        let path = format!("/partners/{}/merchants/{}/stores", self.config.partner_id, merchant_id);
        self.call(Method::POST, &path, Scope::merchant(merchant_id), Some(request)).await
    }

    pub async fn create_online_terminal(
        &self,
        merchant_id: &str,
        store_id: &str,
        request: &CreateTerminalRequest,
    ) -> TicketResult<CreatedTerminal> {
        let path = format!("/merchants/{}/stores/{}/online-terminals", merchant_id, store_id);
        self.call(Method::POST, &path, Scope::store(merchant_id, store_id), Some(request)).await
    }

    pub async fn create_order(
        &self,
        merchant_id: &str,
        store_id: &str,
        request: &CreateOrderRequest,
    ) -> TicketResult<CreatedOrder> {
        let path = format!("/merchants/{}/orders", merchant_id);
        self.call(Method::POST, &path, Scope::store(merchant_id, store_id), Some(request)).await
    }

    pub async fn order_status(&self, merchant_id: &str, store_id: &str, order_id: &str) -> TicketResult<GatewayOrder> {
        let path = format!("/merchants/{}/orders/{}", merchant_id, order_id);
        self.call::<(), _>(Method::GET, &path, Scope::store(merchant_id, store_id), None).await
    }

    pub async fn void_payment(&self, merchant_id: &str, payment_id: &str) -> TicketResult<VoidOutcome> {
        let path = format!("/payments/{}/void", payment_id);
        match self
            .call::<(), serde_json::Value>(Method::POST, &path, Scope::merchant(merchant_id), None)
            .await
        {
            Ok(_) => Ok(VoidOutcome::Voided),
            // Kept as the gateway integration has always behaved: a refusal counts as done.
            Err(TicketError::GatewayFailure(message)) if message.contains("CANNOT_VOID") => {
                warn!(payment_id, "gateway answered CANNOT_VOID, treating void as done");
                Ok(VoidOutcome::CannotVoid)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn email_receipt(&self, merchant_id: &str, order_id: &str, email: &str) -> TicketResult<()> {
        let path = format!("/receipts/{}/email", order_id);
        self.call::<_, serde_json::Value>(Method::PUT, &path, Scope::merchant(merchant_id), Some(&ReceiptEmail { email }))
            .await
            .map(|_| ())
    }

    async fn call<B, T>(&self, method: Method, path: &str, scope: Scope<'_>, body: Option<&B>) -> TicketResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut last = String::new();
        for attempt in 1..=ATTEMPTS {
            match self.send_once(method.clone(), path, scope, body).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Final(e)) => return Err(e),
                Err(Attempt::Retry(reason)) => {
                    warn!(path, attempt, "gateway call failed: {}", reason);
                    last = reason;
                }
            }
        }
        Err(TicketError::GatewayFailure(last))
    }

    async fn send_once<B, T>(&self, method: Method, path: &str, scope: Scope<'_>, body: Option<&B>) -> Result<T, Attempt>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        debug!(%method, %url, "calling payment gateway");

        let mut request = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json")
            .header("API-KEY", &self.config.api_key)
            .header("API-SECRET", &self.config.api_secret);
        if let Some(merchant_id) = scope.merchant_id {
            request = request.header("MERCHANT-ID", merchant_id);
        }
        if let Some(store_id) = scope.store_id {
            request = request.header("STORE-ID", store_id);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| Attempt::Retry(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(Attempt::Retry(format!("{}: {}", status, text)));
        }

        let text = response.text().await.map_err(|e| Attempt::Retry(e.to_string()))?;
        let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|e| {
            Attempt::Final(TicketError::GatewayFailure(format!(
                "{} returned unreadable body ({}): {}",
                status, e, text
            )))
        })?;

        unwrap_envelope(envelope, status).map_err(Attempt::Final)
    }
}

fn unwrap_envelope<T: DeserializeOwned>(envelope: Envelope<T>, status: StatusCode) -> TicketResult<T> {
    match envelope.status {
        EnvelopeStatus::Success => match envelope.data {
            Some(data) => Ok(data),
            // Calls with nothing to return still need a value for `T`.
            None => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                TicketError::GatewayFailure(format!("{} success envelope without data", status))
            }),
        },
        EnvelopeStatus::Failure => Err(TicketError::GatewayFailure(
            envelope.message.unwrap_or_else(|| format!("{} without message", status)),
        )),
    }
}
