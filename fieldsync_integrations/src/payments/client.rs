//! REST client for the card payments processor (Stripe-compatible API).

use async_trait::async_trait;
use fieldsync_core::billing::{PaymentIntent, PaymentsGateway};
use fieldsync_core::config::PaymentsConfig;
use fieldsync_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

const SERVICE: &str = "payments";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Clone)]
pub struct PaymentsClient {
    client: Client,
    api_base: String,
    secret_key: String,
}

impl PaymentsClient {
    pub fn new(cfg: &PaymentsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            secret_key: cfg.secret_key.clone(),
        })
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        let mut req = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .form(form);
        if let Some(key) = idempotency_key {
            req = req.header(IDEMPOTENCY_HEADER, key);
        }
        let resp = req
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error.message.or(e.error.kind))
                .unwrap_or(body);
            return Err(Error::upstream(SERVICE, status.as_u16(), message));
        }
        resp.json::<T>().await.map_err(Error::backend_reqwest)
    }
}

#[async_trait]
impl PaymentsGateway for PaymentsClient {
    #[instrument(level = "info", skip(self, email))]
    async fn create_customer(
        &self,
        name: &str,
        email: Option<&str>,
        client_external_id: &str,
    ) -> Result<String> {
        let mut form = vec![
            ("name", name.to_string()),
            ("metadata[client_external_id]", client_external_id.to_string()),
        ];
        if let Some(email) = email {
            form.push(("email", email.to_string()));
        }
        let created: CustomerResponse = self.post_form("/v1/customers", &form, None).await?;
        Ok(created.id)
    }

    #[instrument(level = "info", skip(self))]
    async fn create_payment_intent(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
        invoice_external_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent> {
        let form = [
            ("amount", amount_cents.to_string()),
            ("currency", currency.to_string()),
            ("customer", customer_id.to_string()),
            ("metadata[invoice_external_id]", invoice_external_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];
        let intent: IntentResponse = self
            .post_form("/v1/payment_intents", &form, Some(idempotency_key))
            .await?;
        Ok(PaymentIntent {
            id: intent.id,
            client_secret: intent.client_secret,
            status: intent.status,
            amount_cents: intent.amount,
            currency: intent.currency,
        })
    }
}
