//! SQLite-backed `Store` implementation.
//!
//! Single WAL-mode file. Used for local development, single-node installs and
//! tests. Timestamps are stored as fixed-width RFC 3339 strings so that range
//! filters can compare them as text.
//!
//! ```ignore
//! let store = SqliteStore::new("/path/to/fieldsync.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::billing::models::{BillingCustomer, Payment, PaymentStatus};
use crate::inventory::models::{InventoryItem, InventoryMovement, MovementReason};
use crate::models::{AccountId, CrmAccount, EntityKind, ListQuery, SyncedEntity, UserId, UserRecord};
use crate::store::traits::Store;
use crate::sync::models::{ReceiptStatus, WebhookReceipt};
use crate::tokens::models::StoredToken;
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create (or open) a store at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist and applies
    /// the schema.
    #[tracing::instrument(level = "debug", skip(path))]
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_store", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_store_migration", e))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_accounts (
    account_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    connected_user_id TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_tokens (
    user_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL UNIQUE,
    access_ciphertext BLOB NOT NULL,
    refresh_ciphertext BLOB NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_entities (
    kind TEXT NOT NULL,
    external_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    data TEXT NOT NULL,
    occurred_at TEXT,
    remote_updated_at TEXT,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (kind, external_id)
);

CREATE INDEX IF NOT EXISTS crm_entities_occurred_idx ON crm_entities(kind, occurred_at);

CREATE TABLE IF NOT EXISTS webhook_receipts (
    dedupe_key TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    account_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    received_at TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT
);

CREATE TABLE IF NOT EXISTS inventory_items (
    item_id TEXT PRIMARY KEY,
    sku TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    unit TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    reorder_level INTEGER NOT NULL,
    unit_cost_cents INTEGER NOT NULL,
    archived INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inventory_movements (
    movement_id TEXT PRIMARY KEY,
    item_id TEXT NOT NULL REFERENCES inventory_items(item_id),
    delta INTEGER NOT NULL,
    reason TEXT NOT NULL,
    job_external_id TEXT,
    note TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS inventory_movements_item_idx ON inventory_movements(item_id, created_at);

CREATE TABLE IF NOT EXISTS billing_customers (
    client_external_id TEXT PRIMARY KEY,
    processor_customer_id TEXT NOT NULL,
    email TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
    payment_id TEXT PRIMARY KEY,
    invoice_external_id TEXT NOT NULL,
    client_external_id TEXT NOT NULL,
    processor_payment_id TEXT NOT NULL UNIQUE,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS payments_invoice_idx ON payments(invoice_external_id);
"#;

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("sqlite", e)
}

fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::backend(format!("parse timestamp '{s}'"), e))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_dt).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::backend(format!("parse uuid '{s}'"), e))
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| Error::backend(format!("column {name}"), e))
}

fn row_to_user(r: &SqliteRow) -> Result<UserRecord> {
    Ok(UserRecord {
        user_id: UserId(parse_uuid(&col::<String>(r, "user_id")?)?),
        email: col(r, "email")?,
        name: col(r, "name")?,
        created_at: parse_dt(&col::<String>(r, "created_at")?)?,
    })
}

fn row_to_account(r: &SqliteRow) -> Result<CrmAccount> {
    let connected: Option<String> = col(r, "connected_user_id")?;
    Ok(CrmAccount {
        account_id: AccountId(col(r, "account_id")?),
        name: col(r, "name")?,
        connected_user_id: connected
            .as_deref()
            .map(parse_uuid)
            .transpose()?
            .map(UserId),
        updated_at: parse_dt(&col::<String>(r, "updated_at")?)?,
    })
}

fn row_to_token(r: &SqliteRow) -> Result<StoredToken> {
    Ok(StoredToken {
        user_id: UserId(parse_uuid(&col::<String>(r, "user_id")?)?),
        account_id: AccountId(col(r, "account_id")?),
        access_ciphertext: col(r, "access_ciphertext")?,
        refresh_ciphertext: col(r, "refresh_ciphertext")?,
        expires_at: parse_dt(&col::<String>(r, "expires_at")?)?,
        created_at: parse_dt(&col::<String>(r, "created_at")?)?,
        updated_at: parse_dt(&col::<String>(r, "updated_at")?)?,
    })
}

fn row_to_entity(r: &SqliteRow) -> Result<SyncedEntity> {
    let kind_str: String = col(r, "kind")?;
    let kind = EntityKind::parse_str(&kind_str)
        .ok_or_else(|| Error::BackendMessage(format!("invalid entity kind in db: {kind_str}")))?;
    let data_str: String = col(r, "data")?;
    Ok(SyncedEntity {
        kind,
        external_id: col(r, "external_id")?,
        account_id: AccountId(col(r, "account_id")?),
        data: serde_json::from_str(&data_str).map_err(|e| Error::backend("entity data", e))?,
        occurred_at: parse_dt_opt(col(r, "occurred_at")?)?,
        remote_updated_at: parse_dt_opt(col(r, "remote_updated_at")?)?,
        synced_at: parse_dt(&col::<String>(r, "synced_at")?)?,
    })
}

fn row_to_receipt(r: &SqliteRow) -> Result<WebhookReceipt> {
    let status_str: String = col(r, "status")?;
    Ok(WebhookReceipt {
        dedupe_key: col(r, "dedupe_key")?,
        topic: col(r, "topic")?,
        account_id: AccountId(col(r, "account_id")?),
        item_id: col(r, "item_id")?,
        occurred_at: parse_dt(&col::<String>(r, "occurred_at")?)?,
        received_at: parse_dt(&col::<String>(r, "received_at")?)?,
        status: ReceiptStatus::parse_str(&status_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid receipt status in db: {status_str}"))
        })?,
        error: col(r, "error")?,
    })
}

fn row_to_item(r: &SqliteRow) -> Result<InventoryItem> {
    Ok(InventoryItem {
        item_id: parse_uuid(&col::<String>(r, "item_id")?)?,
        sku: col(r, "sku")?,
        name: col(r, "name")?,
        unit: col(r, "unit")?,
        quantity: col(r, "quantity")?,
        reorder_level: col(r, "reorder_level")?,
        unit_cost_cents: col(r, "unit_cost_cents")?,
        archived: col::<i64>(r, "archived")? != 0,
        created_at: parse_dt(&col::<String>(r, "created_at")?)?,
        updated_at: parse_dt(&col::<String>(r, "updated_at")?)?,
    })
}

fn row_to_movement(r: &SqliteRow) -> Result<InventoryMovement> {
    let reason_str: String = col(r, "reason")?;
    Ok(InventoryMovement {
        movement_id: parse_uuid(&col::<String>(r, "movement_id")?)?,
        item_id: parse_uuid(&col::<String>(r, "item_id")?)?,
        delta: col(r, "delta")?,
        reason: MovementReason::parse_str(&reason_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid movement reason in db: {reason_str}"))
        })?,
        job_external_id: col(r, "job_external_id")?,
        note: col(r, "note")?,
        created_at: parse_dt(&col::<String>(r, "created_at")?)?,
    })
}

fn row_to_customer(r: &SqliteRow) -> Result<BillingCustomer> {
    Ok(BillingCustomer {
        client_external_id: col(r, "client_external_id")?,
        processor_customer_id: col(r, "processor_customer_id")?,
        email: col(r, "email")?,
        created_at: parse_dt(&col::<String>(r, "created_at")?)?,
    })
}

fn row_to_payment(r: &SqliteRow) -> Result<Payment> {
    let status_str: String = col(r, "status")?;
    Ok(Payment {
        payment_id: parse_uuid(&col::<String>(r, "payment_id")?)?,
        invoice_external_id: col(r, "invoice_external_id")?,
        client_external_id: col(r, "client_external_id")?,
        processor_payment_id: col(r, "processor_payment_id")?,
        amount_cents: col(r, "amount_cents")?,
        currency: col(r, "currency")?,
        status: PaymentStatus::parse_str(&status_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid payment status in db: {status_str}"))
        })?,
        failure_message: col(r, "failure_message")?,
        created_at: parse_dt(&col::<String>(r, "created_at")?)?,
        updated_at: parse_dt(&col::<String>(r, "updated_at")?)?,
    })
}

const ITEM_COLUMNS: &str = "item_id, sku, name, unit, quantity, reorder_level, unit_cost_cents, archived, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "payment_id, invoice_external_id, client_external_id, processor_payment_id, amount_cents, currency, status, failure_message, created_at, updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET email = excluded.email, name = excluded.name",
        )
        .bind(user.user_id.to_string())
        .bind(&user.email)
        .bind(&user.name)
        .bind(fmt_dt(&user.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(d) if d.is_unique_violation() => {
                Error::Conflict(format!("user email already registered: {}", user.email))
            }
            _ => db_err(e),
        })?;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT user_id, email, name, created_at FROM users WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn list_users(&self, query: ListQuery) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, email, name, created_at FROM users
             ORDER BY created_at, user_id
             LIMIT ?1 OFFSET ?2",
        )
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_user).collect()
    }

    async fn upsert_account(&self, account: &CrmAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO crm_accounts (account_id, name, connected_user_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id) DO UPDATE SET
               name = excluded.name,
               connected_user_id = excluded.connected_user_id,
               updated_at = excluded.updated_at",
        )
        .bind(account.account_id.as_str())
        .bind(&account.name)
        .bind(account.connected_user_id.map(|u| u.to_string()))
        .bind(fmt_dt(&account.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<CrmAccount>> {
        let row = sqlx::query(
            "SELECT account_id, name, connected_user_id, updated_at FROM crm_accounts WHERE account_id = ?1",
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn replace_account_token(&self, token: &StoredToken) -> Result<Vec<UserId>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let displaced_rows = sqlx::query(
            "SELECT user_id FROM crm_tokens WHERE account_id = ?1 AND user_id != ?2",
        )
        .bind(token.account_id.as_str())
        .bind(token.user_id.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let mut displaced = Vec::with_capacity(displaced_rows.len());
        for r in &displaced_rows {
            displaced.push(UserId(parse_uuid(&col::<String>(r, "user_id")?)?));
        }

        sqlx::query("DELETE FROM crm_tokens WHERE account_id = ?1 OR user_id = ?2")
            .bind(token.account_id.as_str())
            .bind(token.user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO crm_tokens (user_id, account_id, access_ciphertext, refresh_ciphertext, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(token.user_id.to_string())
        .bind(token.account_id.as_str())
        .bind(&token.access_ciphertext)
        .bind(&token.refresh_ciphertext)
        .bind(fmt_dt(&token.expires_at))
        .bind(fmt_dt(&token.created_at))
        .bind(fmt_dt(&token.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // A user holds one connection; any other account they were attached to is released.
        sqlx::query(
            "UPDATE crm_accounts SET connected_user_id = NULL
             WHERE connected_user_id = ?1 AND account_id != ?2",
        )
        .bind(token.user_id.to_string())
        .bind(token.account_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(displaced)
    }

    async fn get_token_for_user(&self, user_id: UserId) -> Result<Option<StoredToken>> {
        let row = sqlx::query(
            "SELECT user_id, account_id, access_ciphertext, refresh_ciphertext, expires_at, created_at, updated_at
             FROM crm_tokens WHERE user_id = ?1",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn get_token_for_account(&self, account_id: &AccountId) -> Result<Option<StoredToken>> {
        let row = sqlx::query(
            "SELECT user_id, account_id, access_ciphertext, refresh_ciphertext, expires_at, created_at, updated_at
             FROM crm_tokens WHERE account_id = ?1",
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn update_token(&self, token: &StoredToken) -> Result<()> {
        let res = sqlx::query(
            "UPDATE crm_tokens SET access_ciphertext = ?3, refresh_ciphertext = ?4, expires_at = ?5, updated_at = ?6
             WHERE user_id = ?1 AND account_id = ?2",
        )
        .bind(token.user_id.to_string())
        .bind(token.account_id.as_str())
        .bind(&token.access_ciphertext)
        .bind(&token.refresh_ciphertext)
        .bind(fmt_dt(&token.expires_at))
        .bind(fmt_dt(&token.updated_at))
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

    async fn delete_token_if_current(&self, token: &StoredToken) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query(
            "DELETE FROM crm_tokens WHERE user_id = ?1 AND account_id = ?2 AND refresh_ciphertext = ?3",
        )
        .bind(token.user_id.to_string())
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
            "UPDATE crm_accounts SET connected_user_id = NULL WHERE account_id = ?1 AND connected_user_id = ?2",
        )
        .bind(token.account_id.as_str())
        .bind(token.user_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn delete_tokens_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query("DELETE FROM crm_tokens WHERE user_id = ?1")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE crm_accounts SET connected_user_id = NULL WHERE connected_user_id = ?1")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(res.rows_affected())
    }

    async fn upsert_entity(&self, entity: &SyncedEntity) -> Result<()> {
        sqlx::query(
            "INSERT INTO crm_entities (kind, external_id, account_id, data, occurred_at, remote_updated_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(kind, external_id) DO UPDATE SET
               account_id = excluded.account_id,
               data = excluded.data,
               occurred_at = excluded.occurred_at,
               remote_updated_at = excluded.remote_updated_at,
               synced_at = excluded.synced_at",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.external_id)
        .bind(entity.account_id.as_str())
        .bind(serde_json::to_string(&entity.data).map_err(|e| Error::backend("entity data", e))?)
        .bind(entity.occurred_at.as_ref().map(fmt_dt))
        .bind(entity.remote_updated_at.as_ref().map(fmt_dt))
        .bind(fmt_dt(&entity.synced_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_entity(&self, kind: EntityKind, external_id: &str) -> Result<Option<SyncedEntity>> {
        let row = sqlx::query(
            "SELECT kind, external_id, account_id, data, occurred_at, remote_updated_at, synced_at
             FROM crm_entities WHERE kind = ?1 AND external_id = ?2",
        )
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn list_entities(&self, kind: EntityKind, query: ListQuery) -> Result<Vec<SyncedEntity>> {
        let rows = sqlx::query(
            "SELECT kind, external_id, account_id, data, occurred_at, remote_updated_at, synced_at
             FROM crm_entities WHERE kind = ?1
             ORDER BY occurred_at DESC, external_id
             LIMIT ?2 OFFSET ?3",
        )
        .bind(kind.as_str())
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_entity).collect()
    }

    async fn list_entities_between(
        &self,
        kind: EntityKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SyncedEntity>> {
        let rows = sqlx::query(
            "SELECT kind, external_id, account_id, data, occurred_at, remote_updated_at, synced_at
             FROM crm_entities
             WHERE kind = ?1 AND occurred_at >= ?2 AND occurred_at < ?3
             ORDER BY occurred_at, external_id",
        )
        .bind(kind.as_str())
        .bind(fmt_dt(&from))
        .bind(fmt_dt(&to))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_entity).collect()
    }

    async fn delete_entity(&self, kind: EntityKind, external_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM crm_entities WHERE kind = ?1 AND external_id = ?2")
            .bind(kind.as_str())
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn count_entities(&self, kind: EntityKind) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crm_entities WHERE kind = ?1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n.max(0) as u64)
    }

    async fn record_webhook_receipt(&self, receipt: &WebhookReceipt) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO webhook_receipts (dedupe_key, topic, account_id, item_id, occurred_at, received_at, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(dedupe_key) DO NOTHING",
        )
        .bind(&receipt.dedupe_key)
        .bind(&receipt.topic)
        .bind(receipt.account_id.as_str())
        .bind(&receipt.item_id)
        .bind(fmt_dt(&receipt.occurred_at))
        .bind(fmt_dt(&receipt.received_at))
        .bind(receipt.status.as_str())
        .bind(&receipt.error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn finish_webhook_receipt(
        &self,
        dedupe_key: &str,
        status: ReceiptStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE webhook_receipts SET status = ?2, error = ?3 WHERE dedupe_key = ?1")
            .bind(dedupe_key)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_webhook_receipt(&self, dedupe_key: &str) -> Result<Option<WebhookReceipt>> {
        let row = sqlx::query(
            "SELECT dedupe_key, topic, account_id, item_id, occurred_at, received_at, status, error
             FROM webhook_receipts WHERE dedupe_key = ?1",
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_receipt).transpose()
    }

    async fn insert_inventory_item(&self, item: &InventoryItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO inventory_items (item_id, sku, name, unit, quantity, reorder_level, unit_cost_cents, archived, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(item.item_id.to_string())
        .bind(&item.sku)
        .bind(&item.name)
        .bind(&item.unit)
        .bind(item.quantity)
        .bind(item.reorder_level)
        .bind(item.unit_cost_cents)
        .bind(item.archived as i64)
        .bind(fmt_dt(&item.created_at))
        .bind(fmt_dt(&item.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(d) if d.is_unique_violation() => {
                Error::Conflict(format!("sku already exists: {}", item.sku))
            }
            _ => db_err(e),
        })?;
        Ok(())
    }

    async fn update_inventory_item(&self, item: &InventoryItem) -> Result<()> {
        let res = sqlx::query(
            "UPDATE inventory_items SET name = ?2, unit = ?3, reorder_level = ?4, unit_cost_cents = ?5, archived = ?6, updated_at = ?7
             WHERE item_id = ?1",
        )
        .bind(item.item_id.to_string())
        .bind(&item.name)
        .bind(&item.unit)
        .bind(item.reorder_level)
        .bind(item.unit_cost_cents)
        .bind(item.archived as i64)
        .bind(fmt_dt(&item.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("inventory item {}", item.item_id)));
        }
        Ok(())
    }

    async fn get_inventory_item(&self, item_id: Uuid) -> Result<Option<InventoryItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items WHERE item_id = ?1"
        ))
        .bind(item_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn list_inventory_items(&self, include_archived: bool) -> Result<Vec<InventoryItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items
             WHERE (?1 = 1 OR archived = 0)
             ORDER BY name, sku"
        ))
        .bind(include_archived as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn apply_inventory_movement(&self, movement: &InventoryMovement) -> Result<InventoryItem> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let item_id = movement.item_id.to_string();

        let res = sqlx::query(
            "UPDATE inventory_items SET quantity = quantity + ?2, updated_at = ?3
             WHERE item_id = ?1 AND quantity + ?2 >= 0",
        )
        .bind(&item_id)
        .bind(movement.delta)
        .bind(fmt_dt(&movement.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT quantity FROM inventory_items WHERE item_id = ?1")
                    .bind(&item_id)
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
        }

        sqlx::query(
            "INSERT INTO inventory_movements (movement_id, item_id, delta, reason, job_external_id, note, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(movement.movement_id.to_string())
        .bind(&item_id)
        .bind(movement.delta)
        .bind(movement.reason.as_str())
        .bind(&movement.job_external_id)
        .bind(&movement.note)
        .bind(fmt_dt(&movement.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items WHERE item_id = ?1"
        ))
        .bind(&item_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let item = row_to_item(&row)?;

        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    async fn list_inventory_movements(
        &self,
        item_id: Uuid,
        query: ListQuery,
    ) -> Result<Vec<InventoryMovement>> {
        let rows = sqlx::query(
            "SELECT movement_id, item_id, delta, reason, job_external_id, note, created_at
             FROM inventory_movements WHERE item_id = ?1
             ORDER BY created_at DESC, movement_id
             LIMIT ?2 OFFSET ?3",
        )
        .bind(item_id.to_string())
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_movement).collect()
    }

    async fn upsert_billing_customer(&self, customer: &BillingCustomer) -> Result<()> {
        sqlx::query(
            "INSERT INTO billing_customers (client_external_id, processor_customer_id, email, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client_external_id) DO UPDATE SET
               processor_customer_id = excluded.processor_customer_id,
               email = excluded.email",
        )
        .bind(&customer.client_external_id)
        .bind(&customer.processor_customer_id)
        .bind(&customer.email)
        .bind(fmt_dt(&customer.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_billing_customer(
        &self,
        client_external_id: &str,
    ) -> Result<Option<BillingCustomer>> {
        let row = sqlx::query(
            "SELECT client_external_id, processor_customer_id, email, created_at
             FROM billing_customers WHERE client_external_id = ?1",
        )
        .bind(client_external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_customer).transpose()
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ))
        .bind(payment.payment_id.to_string())
        .bind(&payment.invoice_external_id)
        .bind(&payment.client_external_id)
        .bind(&payment.processor_payment_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.failure_message)
        .bind(fmt_dt(&payment.created_at))
        .bind(fmt_dt(&payment.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(d) if d.is_unique_violation() => Error::Conflict(format!(
                "processor payment already recorded: {}",
                payment.processor_payment_id
            )),
            _ => db_err(e),
        })?;
        Ok(())
    }

    async fn update_payment_status_by_processor_id(
        &self,
        processor_payment_id: &str,
        status: PaymentStatus,
        failure_message: Option<&str>,
    ) -> Result<Option<Payment>> {
        sqlx::query(
            "UPDATE payments SET status = ?2, failure_message = ?3, updated_at = ?4
             WHERE processor_payment_id = ?1 AND status <> 'succeeded'",
        )
        .bind(processor_payment_id)
        .bind(status.as_str())
        .bind(failure_message)
        .bind(fmt_dt(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE processor_payment_id = ?1"
        ))
        .bind(processor_payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn list_payments(
        &self,
        invoice_external_id: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE (?1 IS NULL OR invoice_external_id = ?1)
             ORDER BY created_at DESC, payment_id
             LIMIT ?2 OFFSET ?3"
        ))
        .bind(invoice_external_id)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_payment).collect()
    }

    async fn list_invoice_payments(&self, invoice_external_id: &str) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE invoice_external_id = ?1
             ORDER BY created_at, payment_id"
        ))
        .bind(invoice_external_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_payment).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    fn token(user: UserId, account: &str) -> StoredToken {
        let now = Utc::now();
        StoredToken {
            user_id: user,
            account_id: AccountId(account.to_string()),
            access_ciphertext: vec![1, 2, 3],
            refresh_ciphertext: vec![4, 5, 6],
            expires_at: now + Duration::hours(1),
            created_at: now,
            updated_at: now,
        }
    }

    fn item(sku: &str, quantity: i64) -> InventoryItem {
        let now = Utc::now();
        InventoryItem {
            item_id: Uuid::new_v4(),
            sku: sku.to_string(),
            name: format!("item {sku}"),
            unit: "bottle".to_string(),
            quantity,
            reorder_level: 2,
            unit_cost_cents: 499,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn second_connector_displaces_first_for_same_account() {
        let (store, _dir) = store().await;
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());

        assert!(store.replace_account_token(&token(alice, "acc-1")).await.unwrap().is_empty());
        let displaced = store.replace_account_token(&token(bob, "acc-1")).await.unwrap();
        assert_eq!(displaced, vec![alice]);

        assert!(store.get_token_for_user(alice).await.unwrap().is_none());
        let held = store
            .get_token_for_account(&AccountId("acc-1".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.user_id, bob);
    }

    #[tokio::test]
    async fn reconnecting_user_keeps_a_single_token() {
        let (store, _dir) = store().await;
        let alice = UserId(Uuid::new_v4());
        store.replace_account_token(&token(alice, "acc-1")).await.unwrap();
        store.replace_account_token(&token(alice, "acc-2")).await.unwrap();

        assert!(
            store
                .get_token_for_account(&AccountId("acc-1".into()))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store.get_token_for_user(alice).await.unwrap().unwrap().account_id,
            AccountId("acc-2".into())
        );
        assert_eq!(store.delete_tokens_for_user(alice).await.unwrap(), 1);
        assert_eq!(store.delete_tokens_for_user(alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conditional_token_delete_skips_a_refreshed_row() {
        let (store, _dir) = store().await;
        let alice = UserId(Uuid::new_v4());
        let original = token(alice, "acc-1");
        store.replace_account_token(&original).await.unwrap();

        let refreshed = StoredToken {
            refresh_ciphertext: vec![9, 9, 9],
            ..original.clone()
        };
        store.update_token(&refreshed).await.unwrap();
        assert!(!store.delete_token_if_current(&original).await.unwrap());
        assert!(store.get_token_for_user(alice).await.unwrap().is_some());

        assert!(store.delete_token_if_current(&refreshed).await.unwrap());
        assert!(store.get_token_for_user(alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entity_upsert_replaces_by_external_id() {
        let (store, _dir) = store().await;
        let at = Utc::now();
        let mut e = SyncedEntity {
            kind: EntityKind::Job,
            external_id: "job-1".into(),
            account_id: AccountId("acc".into()),
            data: serde_json::json!({"title": "Deep clean"}),
            occurred_at: Some(at),
            remote_updated_at: None,
            synced_at: at,
        };
        store.upsert_entity(&e).await.unwrap();
        e.data = serde_json::json!({"title": "Move-out clean"});
        store.upsert_entity(&e).await.unwrap();

        assert_eq!(store.count_entities(EntityKind::Job).await.unwrap(), 1);
        let got = store.get_entity(EntityKind::Job, "job-1").await.unwrap().unwrap();
        assert_eq!(got.data["title"], "Move-out clean");
        assert!(store.get_entity(EntityKind::Quote, "job-1").await.unwrap().is_none());

        let in_range = store
            .list_entities_between(EntityKind::Job, at - Duration::minutes(1), at + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        let after = store
            .list_entities_between(EntityKind::Job, at + Duration::seconds(1), at + Duration::hours(1))
            .await
            .unwrap();
        assert!(after.is_empty());

        assert!(store.delete_entity(EntityKind::Job, "job-1").await.unwrap());
        assert!(!store.delete_entity(EntityKind::Job, "job-1").await.unwrap());
    }

    #[tokio::test]
    async fn webhook_receipts_dedupe() {
        let (store, _dir) = store().await;
        let receipt = WebhookReceipt {
            dedupe_key: "CLIENT_UPDATE:c-1:1".into(),
            topic: "CLIENT_UPDATE".into(),
            account_id: AccountId("acc".into()),
            item_id: "c-1".into(),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            status: ReceiptStatus::Pending,
            error: None,
        };
        assert!(store.record_webhook_receipt(&receipt).await.unwrap());
        assert!(!store.record_webhook_receipt(&receipt).await.unwrap());

        store
            .finish_webhook_receipt(&receipt.dedupe_key, ReceiptStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let got = store.get_webhook_receipt(&receipt.dedupe_key).await.unwrap().unwrap();
        assert_eq!(got.status, ReceiptStatus::Failed);
        assert_eq!(got.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn inventory_movement_cannot_go_negative() {
        let (store, _dir) = store().await;
        let it = item("GLASS-1", 3);
        store.insert_inventory_item(&it).await.unwrap();
        assert!(matches!(
            store.insert_inventory_item(&item("GLASS-1", 1)).await,
            Err(Error::Conflict(_))
        ));

        let mv = |delta| InventoryMovement {
            movement_id: Uuid::new_v4(),
            item_id: it.item_id,
            delta,
            reason: MovementReason::JobUsage,
            job_external_id: Some("job-9".into()),
            note: None,
            created_at: Utc::now(),
        };

        let after = store.apply_inventory_movement(&mv(-2)).await.unwrap();
        assert_eq!(after.quantity, 1);
        assert!(matches!(
            store.apply_inventory_movement(&mv(-5)).await,
            Err(Error::Conflict(_))
        ));

        let moves = store
            .list_inventory_movements(it.item_id, ListQuery::default())
            .await
            .unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].delta, -2);

        let missing = InventoryMovement {
            item_id: Uuid::new_v4(),
            ..mv(1)
        };
        assert!(matches!(
            store.apply_inventory_movement(&missing).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn payment_status_updates_by_processor_id() {
        let (store, _dir) = store().await;
        let now = Utc::now();
        let p = Payment {
            payment_id: Uuid::new_v4(),
            invoice_external_id: "inv-1".into(),
            client_external_id: "c-1".into(),
            processor_payment_id: "pi_123".into(),
            amount_cents: 12_500,
            currency: "usd".into(),
            status: PaymentStatus::Pending,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_payment(&p).await.unwrap();

        let updated = store
            .update_payment_status_by_processor_id("pi_123", PaymentStatus::Succeeded, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, PaymentStatus::Succeeded);
        let late = store
            .update_payment_status_by_processor_id("pi_123", PaymentStatus::Failed, Some("declined"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(late.status, PaymentStatus::Succeeded);
        assert!(late.failure_message.is_none());
        assert!(matches!(store.insert_payment(&p).await, Err(Error::Conflict(_))));
        assert!(
            store
                .update_payment_status_by_processor_id("pi_missing", PaymentStatus::Failed, None)
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(store.list_payments(Some("inv-1"), ListQuery::default()).await.unwrap().len(), 1);
        assert!(store.list_payments(Some("inv-2"), ListQuery::default()).await.unwrap().is_empty());
        assert_eq!(store.list_payments(None, ListQuery::default()).await.unwrap().len(), 1);
    }
}
