//! fieldsync core library: domain models, store, token lifecycle and the sync pipeline.

pub mod billing;
pub mod config;
pub mod entities;
pub mod error;
pub mod inventory;
pub mod kpis;
pub mod models;
pub mod secrets;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod tokens;

pub use billing::{BillingService, PaymentsGateway};
pub use config::{AppConfig, CrmConfig, DatabaseConfig, PaymentsConfig, PostgresConfig, TokenConfig};
pub use entities::{
    ClientRecord, EntityRecord, InvoiceRecord, JobRecord, QuoteRecord, TimesheetRecord,
    VisitRecord,
};
pub use error::{Error, Result};
pub use inventory::InventoryService;
pub use kpis::{KpiService, TeamKpis};
pub use models::{AccountId, CrmAccount, EntityKind, ListQuery, SyncedEntity, UserId, UserRecord};
pub use secrets::TokenCipher;
pub use store::{PostgresStore, SqliteStore, Store};
pub use sync::{CrmSource, SyncService};
pub use tokens::{OAuthProvider, TokenManager};
