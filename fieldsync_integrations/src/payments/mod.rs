pub mod client;
pub mod webhook;

pub use client::PaymentsClient;
pub use webhook::{DEFAULT_TOLERANCE_SECS, SIGNATURE_HEADER, parse_event, verify_signature};
