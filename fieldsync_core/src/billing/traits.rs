use async_trait::async_trait;

use crate::Result;
use crate::billing::models::PaymentIntent;

/// Card payments processor.
#[async_trait]
pub trait PaymentsGateway: Send + Sync {
    /// Creates a customer and returns the processor's customer id.
    async fn create_customer(
        &self,
        name: &str,
        email: Option<&str>,
        client_external_id: &str,
    ) -> Result<String>;

    /// Requests sharing an `idempotency_key` resolve to the same intent.
    async fn create_payment_intent(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
        invoice_external_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent>;
}
