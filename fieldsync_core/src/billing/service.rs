use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::billing::models::{
    BillingCustomer, InvoicePayment, Payment, PaymentEvent, PaymentStatus,
};
use crate::billing::traits::PaymentsGateway;
use crate::entities::{ClientRecord, InvoiceRecord};
use crate::models::{EntityKind, ListQuery};
use crate::store::Store;
use crate::{Error, Result};

/// Pending intents older than this no longer hold back the invoice balance.
pub const PENDING_HOLD_HOURS: i64 = 24;

/// Collects payment for synced invoices through the payments processor.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentsGateway>,
    currency: String,
}

impl BillingService {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn PaymentsGateway>, currency: impl Into<String>) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into().to_ascii_lowercase(),
        }
    }

    /// Processor customer for a synced CRM client, created on first use.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn ensure_customer(&self, client_external_id: &str) -> Result<BillingCustomer> {
        if let Some(existing) = self.store.get_billing_customer(client_external_id).await? {
            return Ok(existing);
        }

        let client: ClientRecord = self
            .store
            .get_entity(EntityKind::Client, client_external_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("client {client_external_id}")))?
            .decode()?;

        let processor_customer_id = self
            .gateway
            .create_customer(&client_display_name(&client), client.email.as_deref(), client_external_id)
            .await?;

        let customer = BillingCustomer {
            client_external_id: client_external_id.to_string(),
            processor_customer_id,
            email: client.email,
            created_at: Utc::now(),
        };
        self.store.upsert_billing_customer(&customer).await?;
        tracing::info!(processor_customer_id = %customer.processor_customer_id, "created billing customer");
        Ok(customer)
    }

    /// Starts a card payment for what is still owed on the invoice, or for
    /// `amount_cents` when a partial payment is requested.
    ///
    /// What is owed is the synced balance minus payments the CRM cannot know
    /// about yet: intents still pending and payments that succeeded after the
    /// invoice last changed upstream.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_invoice_payment(
        &self,
        invoice_external_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<InvoicePayment> {
        let entity = self
            .store
            .get_entity(EntityKind::Invoice, invoice_external_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("invoice {invoice_external_id}")))?;
        let invoice_changed_at = entity.remote_updated_at.unwrap_or(entity.synced_at);
        let invoice: InvoiceRecord = entity.decode()?;

        if invoice.is_paid() || invoice.balance_cents <= 0 {
            return Err(Error::Conflict(format!(
                "invoice {invoice_external_id} has no outstanding balance"
            )));
        }

        let existing = self.store.list_invoice_payments(invoice_external_id).await?;
        let now = Utc::now();
        let committed: i64 = existing
            .iter()
            .filter(|p| match p.status {
                PaymentStatus::Pending => now - p.created_at < Duration::hours(PENDING_HOLD_HOURS),
                PaymentStatus::Succeeded => p.updated_at > invoice_changed_at,
                PaymentStatus::Failed | PaymentStatus::Canceled => false,
            })
            .map(|p| p.amount_cents)
            .sum();
        let owed = invoice.balance_cents - committed;
        if owed <= 0 {
            return Err(Error::Conflict(format!(
                "invoice {invoice_external_id} is already covered by open or settled payments"
            )));
        }

        let amount = match amount_cents {
            None => owed,
            Some(a) if a > 0 && a <= owed => a,
            Some(a) => {
                return Err(Error::InvalidInput(format!(
                    "amount {a} must be between 1 and the amount still owed {owed}"
                )));
            }
        };
        let client_external_id = invoice.client_external_id.clone().ok_or_else(|| {
            Error::InvalidInput(format!("invoice {invoice_external_id} has no client"))
        })?;

        let customer = self.ensure_customer(&client_external_id).await?;
        let intent = self
            .gateway
            .create_payment_intent(
                &customer.processor_customer_id,
                amount,
                &self.currency,
                invoice_external_id,
                &format!("invoice-{invoice_external_id}-attempt-{}", existing.len() + 1),
            )
            .await?;

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            invoice_external_id: invoice_external_id.to_string(),
            client_external_id,
            processor_payment_id: intent.id,
            amount_cents: intent.amount_cents,
            currency: intent.currency,
            status: PaymentStatus::parse_str(&intent.status)
                .filter(PaymentStatus::is_terminal)
                .unwrap_or(PaymentStatus::Pending),
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_payment(&payment).await?;

        Ok(InvoicePayment {
            payment,
            client_secret: intent.client_secret,
        })
    }

    /// Applies a processor notification. Returns the payment as stored
    /// afterwards, or `None` when the event does not concern a known payment.
    ///
    /// Events may arrive out of order; a succeeded payment is never moved to
    /// another status.
    #[tracing::instrument(level = "info", skip_all, fields(event_id = %event.event_id, event_type = %event.event_type))]
    pub async fn apply_event(&self, event: &PaymentEvent) -> Result<Option<Payment>> {
        let Some(status) = event.status().filter(PaymentStatus::is_terminal) else {
            tracing::debug!("ignoring payments event");
            return Ok(None);
        };
        let Some(processor_payment_id) = event.processor_payment_id.as_deref() else {
            return Ok(None);
        };

        let updated = self
            .store
            .update_payment_status_by_processor_id(
                processor_payment_id,
                status,
                event.failure_message.as_deref(),
            )
            .await?;
        match &updated {
            Some(p) if p.status != status => tracing::info!(
                payment_id = %p.payment_id,
                status = p.status.as_str(),
                ignored = status.as_str(),
                "payment already settled; status kept"
            ),
            Some(p) => tracing::info!(payment_id = %p.payment_id, status = p.status.as_str(), "payment status updated"),
            None => tracing::warn!(processor_payment_id, "payments event for unknown payment"),
        }
        Ok(updated)
    }

    pub async fn list_payments(
        &self,
        invoice_external_id: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<Payment>> {
        self.store.list_payments(invoice_external_id, query).await
    }
}

fn client_display_name(client: &ClientRecord) -> String {
    if !client.name.trim().is_empty() {
        return client.name.trim().to_string();
    }
    if let Some(company) = client.company_name.as_deref().filter(|c| !c.trim().is_empty()) {
        return company.trim().to_string();
    }
    let full = [client.first_name.as_deref(), client.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if full.trim().is_empty() {
        client.external_id.clone()
    } else {
        full
    }
}
