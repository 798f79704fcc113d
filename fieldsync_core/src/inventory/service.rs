use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::inventory::models::{
    InventoryItem, InventoryItemPatch, InventoryMovement, MovementReason, NewInventoryItem,
};
use crate::models::{EntityKind, ListQuery};
use crate::store::Store;
use crate::{Error, Result};

/// Supplies and equipment stock, adjusted through an append-only movement log.
#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn Store>,
}

impl InventoryService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "info", skip_all, fields(sku = %new.sku))]
    pub async fn create_item(&self, new: NewInventoryItem) -> Result<InventoryItem> {
        let sku = new.sku.trim().to_string();
        let name = new.name.trim().to_string();
        if sku.is_empty() {
            return Err(Error::InvalidInput("sku is required".to_string()));
        }
        if name.is_empty() {
            return Err(Error::InvalidInput("name is required".to_string()));
        }
        if new.quantity < 0 {
            return Err(Error::InvalidInput("quantity must be >= 0".to_string()));
        }
        validate_levels(Some(new.reorder_level), Some(new.unit_cost_cents))?;

        let now = Utc::now();
        let item = InventoryItem {
            item_id: Uuid::new_v4(),
            sku,
            name,
            unit: non_empty_or(new.unit, "each"),
            quantity: new.quantity,
            reorder_level: new.reorder_level,
            unit_cost_cents: new.unit_cost_cents,
            archived: false,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_inventory_item(&item).await?;
        Ok(item)
    }

    #[tracing::instrument(level = "info", skip(self, patch))]
    pub async fn update_item(&self, item_id: Uuid, patch: InventoryItemPatch) -> Result<InventoryItem> {
        validate_levels(patch.reorder_level, patch.unit_cost_cents)?;
        let mut item = self.get_item(item_id).await?;

        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::InvalidInput("name must not be empty".to_string()));
            }
            item.name = name;
        }
        if let Some(unit) = patch.unit {
            item.unit = non_empty_or(unit, &item.unit);
        }
        if let Some(level) = patch.reorder_level {
            item.reorder_level = level;
        }
        if let Some(cost) = patch.unit_cost_cents {
            item.unit_cost_cents = cost;
        }
        if let Some(archived) = patch.archived {
            item.archived = archived;
        }
        item.updated_at = Utc::now();

        self.store.update_inventory_item(&item).await?;
        Ok(item)
    }

    pub async fn get_item(&self, item_id: Uuid) -> Result<InventoryItem> {
        self.store
            .get_inventory_item(item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("inventory item {item_id}")))
    }

    pub async fn list_items(&self, include_archived: bool) -> Result<Vec<InventoryItem>> {
        self.store.list_inventory_items(include_archived).await
    }

    /// Soft delete; history stays queryable.
    pub async fn archive_item(&self, item_id: Uuid) -> Result<InventoryItem> {
        self.update_item(
            item_id,
            InventoryItemPatch {
                archived: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    #[tracing::instrument(level = "info", skip(self, note))]
    pub async fn adjust(
        &self,
        item_id: Uuid,
        delta: i64,
        reason: MovementReason,
        job_external_id: Option<String>,
        note: Option<String>,
    ) -> Result<InventoryItem> {
        if delta == 0 {
            return Err(Error::InvalidInput("delta must not be zero".to_string()));
        }
        let movement = InventoryMovement {
            movement_id: Uuid::new_v4(),
            item_id,
            delta,
            reason,
            job_external_id: job_external_id.filter(|j| !j.trim().is_empty()),
            note: note.filter(|n| !n.trim().is_empty()),
            created_at: Utc::now(),
        };
        let item = self.store.apply_inventory_movement(&movement).await?;
        if item.is_low_stock() {
            tracing::info!(sku = %item.sku, quantity = item.quantity, "inventory item at or below reorder level");
        }
        Ok(item)
    }

    /// Consumes `quantity` units on a job that has been synced from the CRM.
    pub async fn record_usage(
        &self,
        item_id: Uuid,
        quantity: i64,
        job_external_id: &str,
        note: Option<String>,
    ) -> Result<InventoryItem> {
        if quantity <= 0 {
            return Err(Error::InvalidInput("quantity must be positive".to_string()));
        }
        if self
            .store
            .get_entity(EntityKind::Job, job_external_id)
            .await?
            .is_none()
        {
            return Err(Error::NotFound(format!("job {job_external_id}")));
        }
        self.adjust(
            item_id,
            -quantity,
            MovementReason::JobUsage,
            Some(job_external_id.to_string()),
            note,
        )
        .await
    }

    pub async fn low_stock(&self) -> Result<Vec<InventoryItem>> {
        let items = self.store.list_inventory_items(false).await?;
        Ok(items.into_iter().filter(InventoryItem::is_low_stock).collect())
    }

    pub async fn movements(&self, item_id: Uuid, query: ListQuery) -> Result<Vec<InventoryMovement>> {
        self.get_item(item_id).await?;
        self.store.list_inventory_movements(item_id, query).await
    }
}

fn validate_levels(reorder_level: Option<i64>, unit_cost_cents: Option<i64>) -> Result<()> {
    if reorder_level.is_some_and(|l| l < 0) {
        return Err(Error::InvalidInput("reorder_level must be >= 0".to_string()));
    }
    if unit_cost_cents.is_some_and(|c| c < 0) {
        return Err(Error::InvalidInput("unit_cost_cents must be >= 0".to_string()));
    }
    Ok(())
}

fn non_empty_or(value: String, fallback: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        fallback.to_string()
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, SyncedEntity};
    use crate::store::SqliteStore;

    async fn setup() -> (InventoryService, Arc<SqliteStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("inv.db")).await.unwrap());
        (InventoryService::new(store.clone()), store, dir)
    }

    fn new_item(sku: &str, qty: i64, reorder: i64) -> NewInventoryItem {
        NewInventoryItem {
            sku: sku.to_string(),
            name: "Microfiber cloth".to_string(),
            unit: "pack".to_string(),
            quantity: qty,
            reorder_level: reorder,
            unit_cost_cents: 899,
        }
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (svc, _store, _dir) = setup().await;
        let mut bad = new_item("  ", 1, 0);
        assert!(matches!(svc.create_item(bad.clone()).await, Err(Error::InvalidInput(_))));
        bad.sku = "CLOTH".into();
        bad.reorder_level = -1;
        assert!(matches!(svc.create_item(bad).await, Err(Error::InvalidInput(_))));

        let item = svc.create_item(new_item(" CLOTH ", 10, 3)).await.unwrap();
        assert_eq!(item.sku, "CLOTH");
        assert!(matches!(
            svc.create_item(new_item("CLOTH", 1, 0)).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn usage_requires_synced_job_and_stock() {
        let (svc, store, _dir) = setup().await;
        let item = svc.create_item(new_item("SPRAY", 5, 2)).await.unwrap();

        assert!(matches!(
            svc.record_usage(item.item_id, 1, "job-1", None).await,
            Err(Error::NotFound(_))
        ));

        store
            .upsert_entity(&SyncedEntity {
                kind: EntityKind::Job,
                external_id: "job-1".into(),
                account_id: AccountId("acc".into()),
                data: serde_json::json!({}),
                occurred_at: None,
                remote_updated_at: None,
                synced_at: Utc::now(),
            })
            .await
            .unwrap();

        let after = svc.record_usage(item.item_id, 3, "job-1", None).await.unwrap();
        assert_eq!(after.quantity, 2);
        assert!(after.is_low_stock());
        assert_eq!(svc.low_stock().await.unwrap().len(), 1);

        assert!(matches!(
            svc.record_usage(item.item_id, 3, "job-1", None).await,
            Err(Error::Conflict(_))
        ));

        let moves = svc.movements(item.item_id, ListQuery::default()).await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].reason, MovementReason::JobUsage);
        assert_eq!(moves[0].job_external_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn archived_items_drop_out_of_default_listing() {
        let (svc, _store, _dir) = setup().await;
        let item = svc.create_item(new_item("MOP", 0, 1)).await.unwrap();
        assert_eq!(svc.low_stock().await.unwrap().len(), 1);

        svc.archive_item(item.item_id).await.unwrap();
        assert!(svc.list_items(false).await.unwrap().is_empty());
        assert_eq!(svc.list_items(true).await.unwrap().len(), 1);
        assert!(svc.low_stock().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_adjustment_is_rejected() {
        let (svc, _store, _dir) = setup().await;
        let item = svc.create_item(new_item("BUCKET", 2, 0)).await.unwrap();
        assert!(matches!(
            svc.adjust(item.item_id, 0, MovementReason::Adjustment, None, None).await,
            Err(Error::InvalidInput(_))
        ));
        let restocked = svc
            .adjust(item.item_id, 10, MovementReason::Restock, None, Some("supplier order".into()))
            .await
            .unwrap();
        assert_eq!(restocked.quantity, 12);
    }
}
