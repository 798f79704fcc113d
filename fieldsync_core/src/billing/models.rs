use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mapping from a CRM client to its customer record at the payments processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCustomer {
    pub client_external_id: String,
    pub processor_customer_id: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub invoice_external_id: String,
    pub client_external_id: String,
    pub processor_payment_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment intent as created at the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    /// Handed to the browser to confirm the payment; never stored.
    pub client_secret: Option<String>,
    pub status: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Payment lifecycle notification from the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub event_id: String,
    pub event_type: String,
    pub processor_payment_id: Option<String>,
    pub failure_message: Option<String>,
}

impl PaymentEvent {
    /// Payment status implied by the event type, if it is a payment event at all.
    pub fn status(&self) -> Option<PaymentStatus> {
        match self.event_type.as_str() {
            "payment_intent.succeeded" => Some(PaymentStatus::Succeeded),
            "payment_intent.payment_failed" => Some(PaymentStatus::Failed),
            "payment_intent.canceled" => Some(PaymentStatus::Canceled),
            "payment_intent.created" | "payment_intent.processing" => Some(PaymentStatus::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePayment {
    pub payment: Payment,
    pub client_secret: Option<String>,
}
