pub mod models;
pub mod service;
pub mod traits;

pub use models::{
    BillingCustomer, InvoicePayment, Payment, PaymentEvent, PaymentIntent, PaymentStatus,
};
pub use service::BillingService;
pub use traits::PaymentsGateway;
