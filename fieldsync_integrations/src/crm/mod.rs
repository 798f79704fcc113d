//! External CRM: GraphQL reads, OAuth token endpoint and webhook intake.

pub mod client;
pub mod mapping;
pub mod oauth;
pub mod queries;
pub mod webhook;

pub use client::CrmClient;
pub use oauth::CrmOAuthClient;
pub use webhook::{SIGNATURE_HEADER, parse_webhook, verify_signature};
