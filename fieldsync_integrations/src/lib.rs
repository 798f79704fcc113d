//! HTTP clients for the systems fieldsync talks to: the external CRM and the
//! card payments processor.

pub mod crm;
pub mod payments;

pub use crm::{CrmClient, CrmOAuthClient};
pub use payments::PaymentsClient;
