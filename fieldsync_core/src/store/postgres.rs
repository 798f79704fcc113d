use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{BillingCustomer, Payment, PaymentStatus};
use crate::config::PostgresConfig;
use crate::inventory::models::{InventoryItem, InventoryMovement, MovementReason};
use crate::models::{AccountId, CrmAccount, EntityKind, ListQuery, SyncedEntity, UserId, UserRecord};
use crate::store::traits::Store;
use crate::sync::models::{ReceiptStatus, WebhookReceipt};
use crate::tokens::models::StoredToken;
use crate::{Error, Result};

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await
            .map_err(|e| Error::backend("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply schema migrations.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("apply migrations", e))?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("postgres", e)
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| Error::backend(format!("column {name}"), e))
}

fn user_from_row(r: &PgRow) -> Result<UserRecord> {
    Ok(UserRecord {
        user_id: UserId(col(r, "user_id")?),
        email: col(r, "email")?,
        name: col(r, "name")?,
        created_at: col(r, "created_at")?,
    })
}

fn account_from_row(r: &PgRow) -> Result<CrmAccount> {
    Ok(CrmAccount {
        account_id: AccountId(col(r, "account_id")?),
        name: col(r, "name")?,
        connected_user_id: col::<Option<Uuid>>(r, "connected_user_id")?.map(UserId),
        updated_at: col(r, "updated_at")?,
    })
}

fn token_from_row(r: &PgRow) -> Result<StoredToken> {
    Ok(StoredToken {
        user_id: UserId(col(r, "user_id")?),
        account_id: AccountId(col(r, "account_id")?),
        access_ciphertext: col(r, "access_ciphertext")?,
        refresh_ciphertext: col(r, "refresh_ciphertext")?,
        expires_at: col(r, "expires_at")?,
        created_at: col(r, "created_at")?,
        updated_at: col(r, "updated_at")?,
    })
}

fn entity_from_row(r: &PgRow) -> Result<SyncedEntity> {
    let kind_str: String = col(r, "kind")?;
    let kind = EntityKind::parse_str(&kind_str)
        .ok_or_else(|| Error::BackendMessage(format!("invalid entity kind in db: {kind_str}")))?;
    Ok(SyncedEntity {
        kind,
        external_id: col(r, "external_id")?,
        account_id: AccountId(col(r, "account_id")?),
        data: col(r, "data")?,
        occurred_at: col(r, "occurred_at")?,
        remote_updated_at: col(r, "remote_updated_at")?,
        synced_at: col(r, "synced_at")?,
    })
}

fn receipt_from_row(r: &PgRow) -> Result<WebhookReceipt> {
    let status_str: String = col(r, "status")?;
    Ok(WebhookReceipt {
        dedupe_key: col(r, "dedupe_key")?,
        topic: col(r, "topic")?,
        account_id: AccountId(col(r, "account_id")?),
        item_id: col(r, "item_id")?,
        occurred_at: col(r, "occurred_at")?,
        received_at: col(r, "received_at")?,
        status: ReceiptStatus::parse_str(&status_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid receipt status in db: {status_str}"))
        })?,
        error: col(r, "error")?,
    })
}

fn item_from_row(r: &PgRow) -> Result<InventoryItem> {
    Ok(InventoryItem {
        item_id: col(r, "item_id")?,
        sku: col(r, "sku")?,
        name: col(r, "name")?,
        unit: col(r, "unit")?,
        quantity: col(r, "quantity")?,
        reorder_level: col(r, "reorder_level")?,
        unit_cost_cents: col(r, "unit_cost_cents")?,
        archived: col(r, "archived")?,
        created_at: col(r, "created_at")?,
        updated_at: col(r, "updated_at")?,
    })
}

fn movement_from_row(r: &PgRow) -> Result<InventoryMovement> {
    let reason_str: String = col(r, "reason")?;
    Ok(InventoryMovement {
        movement_id: col(r, "movement_id")?,
        item_id: col(r, "item_id")?,
        delta: col(r, "delta")?,
        reason: MovementReason::parse_str(&reason_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid movement reason in db: {reason_str}"))
        })?,
        job_external_id: col(r, "job_external_id")?,
        note: col(r, "note")?,
        created_at: col(r, "created_at")?,
    })
}

fn customer_from_row(r: &PgRow) -> Result<BillingCustomer> {
    Ok(BillingCustomer {
        client_external_id: col(r, "client_external_id")?,
        processor_customer_id: col(r, "processor_customer_id")?,
        email: col(r, "email")?,
        created_at: col(r, "created_at")?,
    })
}

fn payment_from_row(r: &PgRow) -> Result<Payment> {
    let status_str: String = col(r, "status")?;
    Ok(Payment {
        payment_id: col(r, "payment_id")?,
        invoice_external_id: col(r, "invoice_external_id")?,
        client_external_id: col(r, "client_external_id")?,
        processor_payment_id: col(r, "processor_payment_id")?,
        amount_cents: col(r, "amount_cents")?,
        currency: col(r, "currency")?,
        status: PaymentStatus::parse_str(&status_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid payment status in db: {status_str}"))
        })?,
        failure_message: col(r, "failure_message")?,
        created_at: col(r, "created_at")?,
        updated_at: col(r, "updated_at")?,
    })
}

const TOKEN_COLUMNS: &str =
    "user_id, account_id, access_ciphertext, refresh_ciphertext, expires_at, created_at, updated_at";
const ENTITY_COLUMNS: &str =
    "kind, external_id, account_id, data, occurred_at, remote_updated_at, synced_at";
const ITEM_COLUMNS: &str = "item_id, sku, name, unit, quantity, reorder_level, unit_cost_cents, archived, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "payment_id, invoice_external_id, client_external_id, processor_payment_id, amount_cents, currency, status, failure_message, created_at, updated_at";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())
}

#[async_trait]
impl Store for PostgresStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, email, name, created_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id) DO UPDATE SET email = EXCLUDED.email, name = EXCLUDED.name",
        )
        .bind(user.user_id.0)
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("user email already registered: {}", user.email))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT user_id, email, name, created_at FROM users WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_users(&self, query: ListQuery) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, email, name, created_at FROM users
             ORDER BY created_at, user_id LIMIT $1 OFFSET $2",
        )
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_account(&self, account: &CrmAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO crm_accounts (account_id, name, connected_user_id, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (account_id) DO UPDATE SET
               name = EXCLUDED.name,
               connected_user_id = EXCLUDED.connected_user_id,
               updated_at = EXCLUDED.updated_at",
        )
        .bind(account.account_id.as_str())
        .bind(&account.name)
        .bind(account.connected_user_id.map(|u| u.0))
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<CrmAccount>> {
        let row = sqlx::query(
            "SELECT account_id, name, connected_user_id, updated_at FROM crm_accounts WHERE account_id = $1",
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn replace_account_token(&self, token: &StoredToken) -> Result<Vec<UserId>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let displaced: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM crm_tokens WHERE account_id = $1 AND user_id <> $2 RETURNING user_id",
        )
        .bind(token.account_id.as_str())
        .bind(token.user_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM crm_tokens WHERE user_id = $1")
            .bind(token.user_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(&format!(
            "INSERT INTO crm_tokens ({TOKEN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(token.user_id.0)
        .bind(token.account_id.as_str())
        .bind(&token.access_ciphertext)
        .bind(&token.refresh_ciphertext)
        .bind(token.expires_at)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE crm_accounts SET connected_user_id = NULL
             WHERE connected_user_id = $1 AND account_id <> $2",
        )
        .bind(token.user_id.0)
        .bind(token.account_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(displaced.into_iter().map(UserId).collect())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_token_for_user(&self, user_id: UserId) -> Result<Option<StoredToken>> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM crm_tokens WHERE user_id = $1"
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(token_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_token_for_account(&self, account_id: &AccountId) -> Result<Option<StoredToken>> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM crm_tokens WHERE account_id = $1"
        ))
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(token_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_token(&self, token: &StoredToken) -> Result<()> {
        let res = sqlx::query(
            "UPDATE crm_tokens SET access_ciphertext = $3, refresh_ciphertext = $4, expires_at = $5, updated_at = $6
             WHERE user_id = $1 AND account_id = $2",
        )
        .bind(token.user_id.0)
        .bind(token.account_id.as_str())
        .bind(&token.access_ciphertext)
        .bind(&token.refresh_ciphertext)
        .bind(token.expires_at)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "token for user {} on account {}",
                token.user_id, token.account_id
            )));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete_token_if_current(&self, token: &StoredToken) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query(
            "DELETE FROM crm_tokens WHERE user_id = $1 AND account_id = $2 AND refresh_ciphertext = $3",
        )
        .bind(token.user_id.0)
        .bind(token.account_id.as_str())
        .bind(&token.refresh_ciphertext)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }
        sqlx::query(
            "UPDATE crm_accounts SET connected_user_id = NULL WHERE account_id = $1 AND connected_user_id = $2",
        )
        .bind(token.account_id.as_str())
        .bind(token.user_id.0)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn delete_tokens_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query("DELETE FROM crm_tokens WHERE user_id = $1")
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE crm_accounts SET connected_user_id = NULL WHERE connected_user_id = $1")
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(res.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_entity(&self, entity: &SyncedEntity) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO crm_entities ({ENTITY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (kind, external_id) DO UPDATE SET
               account_id = EXCLUDED.account_id,
               data = EXCLUDED.data,
               occurred_at = EXCLUDED.occurred_at,
               remote_updated_at = EXCLUDED.remote_updated_at,
               synced_at = EXCLUDED.synced_at"
        ))
        .bind(entity.kind.as_str())
        .bind(&entity.external_id)
        .bind(entity.account_id.as_str())
        .bind(&entity.data)
        .bind(entity.occurred_at)
        .bind(entity.remote_updated_at)
        .bind(entity.synced_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_entity(&self, kind: EntityKind, external_id: &str) -> Result<Option<SyncedEntity>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM crm_entities WHERE kind = $1 AND external_id = $2"
        ))
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(entity_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_entities(&self, kind: EntityKind, query: ListQuery) -> Result<Vec<SyncedEntity>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM crm_entities WHERE kind = $1
             ORDER BY occurred_at DESC NULLS LAST, external_id
             LIMIT $2 OFFSET $3"
        ))
        .bind(kind.as_str())
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entity_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_entities_between(
        &self,
        kind: EntityKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SyncedEntity>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM crm_entities
             WHERE kind = $1 AND occurred_at >= $2 AND occurred_at < $3
             ORDER BY occurred_at, external_id"
        ))
        .bind(kind.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entity_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete_entity(&self, kind: EntityKind, external_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM crm_entities WHERE kind = $1 AND external_id = $2")
            .bind(kind.as_str())
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn count_entities(&self, kind: EntityKind) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crm_entities WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn record_webhook_receipt(&self, receipt: &WebhookReceipt) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO webhook_receipts (dedupe_key, topic, account_id, item_id, occurred_at, received_at, status, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (dedupe_key) DO NOTHING",
        )
        .bind(&receipt.dedupe_key)
        .bind(&receipt.topic)
        .bind(receipt.account_id.as_str())
        .bind(&receipt.item_id)
        .bind(receipt.occurred_at)
        .bind(receipt.received_at)
        .bind(receipt.status.as_str())
        .bind(&receipt.error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn finish_webhook_receipt(
        &self,
        dedupe_key: &str,
        status: ReceiptStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE webhook_receipts SET status = $2, error = $3 WHERE dedupe_key = $1")
            .bind(dedupe_key)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_webhook_receipt(&self, dedupe_key: &str) -> Result<Option<WebhookReceipt>> {
        let row = sqlx::query(
            "SELECT dedupe_key, topic, account_id, item_id, occurred_at, received_at, status, error
             FROM webhook_receipts WHERE dedupe_key = $1",
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(receipt_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_inventory_item(&self, item: &InventoryItem) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO inventory_items ({ITEM_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(item.item_id)
        .bind(&item.sku)
        .bind(&item.name)
        .bind(&item.unit)
        .bind(item.quantity)
        .bind(item.reorder_level)
        .bind(item.unit_cost_cents)
        .bind(item.archived)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("sku already exists: {}", item.sku))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_inventory_item(&self, item: &InventoryItem) -> Result<()> {
        let res = sqlx::query(
            "UPDATE inventory_items SET name = $2, unit = $3, reorder_level = $4, unit_cost_cents = $5, archived = $6, updated_at = $7
             WHERE item_id = $1",
        )
        .bind(item.item_id)
        .bind(&item.name)
        .bind(&item.unit)
        .bind(item.reorder_level)
        .bind(item.unit_cost_cents)
        .bind(item.archived)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("inventory item {}", item.item_id)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_inventory_item(&self, item_id: Uuid) -> Result<Option<InventoryItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items WHERE item_id = $1"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(item_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_inventory_items(&self, include_archived: bool) -> Result<Vec<InventoryItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items
             WHERE ($1 OR NOT archived)
             ORDER BY name, sku"
        ))
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(item_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn apply_inventory_movement(&self, movement: &InventoryMovement) -> Result<InventoryItem> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(&format!(
            "UPDATE inventory_items SET quantity = quantity + $2, updated_at = $3
             WHERE item_id = $1 AND quantity + $2 >= 0
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(movement.item_id)
        .bind(movement.delta)
        .bind(movement.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT quantity FROM inventory_items WHERE item_id = $1")
                    .bind(movement.item_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            return Err(match current {
                None => Error::NotFound(format!("inventory item {}", movement.item_id)),
                Some(q) => Error::Conflict(format!(
                    "insufficient stock: have {q}, change {}",
                    movement.delta
                )),
            });
        };
        let item = item_from_row(&row)?;

        sqlx::query(
            "INSERT INTO inventory_movements (movement_id, item_id, delta, reason, job_external_id, note, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(movement.movement_id)
        .bind(movement.item_id)
        .bind(movement.delta)
        .bind(movement.reason.as_str())
        .bind(&movement.job_external_id)
        .bind(&movement.note)
        .bind(movement.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_inventory_movements(
        &self,
        item_id: Uuid,
        query: ListQuery,
    ) -> Result<Vec<InventoryMovement>> {
        let rows = sqlx::query(
            "SELECT movement_id, item_id, delta, reason, job_external_id, note, created_at
             FROM inventory_movements WHERE item_id = $1
             ORDER BY created_at DESC, movement_id
             LIMIT $2 OFFSET $3",
        )
        .bind(item_id)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(movement_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_billing_customer(&self, customer: &BillingCustomer) -> Result<()> {
        sqlx::query(
            "INSERT INTO billing_customers (client_external_id, processor_customer_id, email, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (client_external_id) DO UPDATE SET
               processor_customer_id = EXCLUDED.processor_customer_id,
               email = EXCLUDED.email",
        )
        .bind(&customer.client_external_id)
        .bind(&customer.processor_customer_id)
        .bind(&customer.email)
        .bind(customer.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_billing_customer(
        &self,
        client_external_id: &str,
    ) -> Result<Option<BillingCustomer>> {
        let row = sqlx::query(
            "SELECT client_external_id, processor_customer_id, email, created_at
             FROM billing_customers WHERE client_external_id = $1",
        )
        .bind(client_external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(customer_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(payment.payment_id)
        .bind(&payment.invoice_external_id)
        .bind(&payment.client_external_id)
        .bind(&payment.processor_payment_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.failure_message)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!(
                    "processor payment already recorded: {}",
                    payment.processor_payment_id
                ))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_payment_status_by_processor_id(
        &self,
        processor_payment_id: &str,
        status: PaymentStatus,
        failure_message: Option<&str>,
    ) -> Result<Option<Payment>> {
        sqlx::query(
            "UPDATE payments SET status = $2, failure_message = $3, updated_at = $4
             WHERE processor_payment_id = $1 AND status <> 'succeeded'",
        )
        .bind(processor_payment_id)
        .bind(status.as_str())
        .bind(failure_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE processor_payment_id = $1"
        ))
        .bind(processor_payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(payment_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_payments(
        &self,
        invoice_external_id: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE ($1::TEXT IS NULL OR invoice_external_id = $1)
             ORDER BY created_at DESC, payment_id
             LIMIT $2 OFFSET $3"
        ))
        .bind(invoice_external_id)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(payment_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_invoice_payments(&self, invoice_external_id: &str) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE invoice_external_id = $1
             ORDER BY created_at, payment_id"
        ))
        .bind(invoice_external_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(payment_from_row).collect()
    }
}
