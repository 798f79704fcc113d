use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;
use crate::billing::models::{BillingCustomer, Payment, PaymentStatus};
use crate::inventory::models::{InventoryItem, InventoryMovement};
use crate::models::{AccountId, CrmAccount, EntityKind, ListQuery, SyncedEntity, UserId, UserRecord};
use crate::sync::models::{ReceiptStatus, WebhookReceipt};
use crate::tokens::models::StoredToken;

/// Local relational store: users, CRM connection state, mirrored CRM entities,
/// and the custom inventory / billing modules.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_user(&self, user: &UserRecord) -> Result<()>;
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    async fn list_users(&self, query: ListQuery) -> Result<Vec<UserRecord>>;

    async fn upsert_account(&self, account: &CrmAccount) -> Result<()>;
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<CrmAccount>>;

    /// Stores `token` as the only token for its account and its user.
    ///
    /// Any token held by another user for the same account is removed in the
    /// same transaction. Returns the users whose tokens were displaced.
    async fn replace_account_token(&self, token: &StoredToken) -> Result<Vec<UserId>>;
    async fn get_token_for_user(&self, user_id: UserId) -> Result<Option<StoredToken>>;
    async fn get_token_for_account(&self, account_id: &AccountId) -> Result<Option<StoredToken>>;
    /// Overwrites the token pair of an existing row (after a refresh).
    async fn update_token(&self, token: &StoredToken) -> Result<()>;
    async fn delete_tokens_for_user(&self, user_id: UserId) -> Result<u64>;
    /// Deletes `token` only while the stored row still holds the same
    /// refresh token. Returns false when the row was replaced or refreshed
    /// in the meantime.
    async fn delete_token_if_current(&self, token: &StoredToken) -> Result<bool>;

    async fn upsert_entity(&self, entity: &SyncedEntity) -> Result<()>;
    async fn get_entity(&self, kind: EntityKind, external_id: &str) -> Result<Option<SyncedEntity>>;
    async fn list_entities(&self, kind: EntityKind, query: ListQuery) -> Result<Vec<SyncedEntity>>;
    /// Entities whose `occurred_at` falls in `[from, to)`.
    async fn list_entities_between(
        &self,
        kind: EntityKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SyncedEntity>>;
    async fn delete_entity(&self, kind: EntityKind, external_id: &str) -> Result<bool>;
    async fn count_entities(&self, kind: EntityKind) -> Result<u64>;

    /// Returns `false` when a receipt with the same dedupe key already exists.
    async fn record_webhook_receipt(&self, receipt: &WebhookReceipt) -> Result<bool>;
    async fn finish_webhook_receipt(
        &self,
        dedupe_key: &str,
        status: ReceiptStatus,
        error: Option<&str>,
    ) -> Result<()>;
    async fn get_webhook_receipt(&self, dedupe_key: &str) -> Result<Option<WebhookReceipt>>;

    async fn insert_inventory_item(&self, item: &InventoryItem) -> Result<()>;
    async fn update_inventory_item(&self, item: &InventoryItem) -> Result<()>;
    async fn get_inventory_item(&self, item_id: Uuid) -> Result<Option<InventoryItem>>;
    async fn list_inventory_items(&self, include_archived: bool) -> Result<Vec<InventoryItem>>;
    /// Applies the movement and records it atomically.
    ///
    /// Fails with `Conflict` if the resulting quantity would be negative and
    /// with `NotFound` if the item does not exist.
    async fn apply_inventory_movement(&self, movement: &InventoryMovement) -> Result<InventoryItem>;
    async fn list_inventory_movements(
        &self,
        item_id: Uuid,
        query: ListQuery,
    ) -> Result<Vec<InventoryMovement>>;

    async fn upsert_billing_customer(&self, customer: &BillingCustomer) -> Result<()>;
    async fn get_billing_customer(&self, client_external_id: &str)
    -> Result<Option<BillingCustomer>>;
    /// `Conflict` when the processor payment id is already recorded.
    async fn insert_payment(&self, payment: &Payment) -> Result<()>;
    /// Returns the payment as stored afterwards, or `None` if unknown.
    /// A `succeeded` payment keeps its status.
    async fn update_payment_status_by_processor_id(
        &self,
        processor_payment_id: &str,
        status: PaymentStatus,
        failure_message: Option<&str>,
    ) -> Result<Option<Payment>>;
    async fn list_payments(
        &self,
        invoice_external_id: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<Payment>>;
    /// Every payment recorded against the invoice, oldest first.
    async fn list_invoice_payments(&self, invoice_external_id: &str) -> Result<Vec<Payment>>;
}
