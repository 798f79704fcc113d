pub mod models;
pub mod service;
pub mod traits;

pub use models::{
    BackfillReport, EntityPage, FetchedEntity, ReceiptStatus, WebhookAction, WebhookEvent,
    WebhookOutcome, WebhookReceipt, WebhookTopic,
};
pub use service::SyncService;
pub use traits::CrmSource;
