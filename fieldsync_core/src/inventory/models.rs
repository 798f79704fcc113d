use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock-keeping unit for cleaning supplies and equipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_id: Uuid,
    pub sku: String,
    pub name: String,
    pub unit: String,
    pub quantity: i64,
    pub reorder_level: i64,
    pub unit_cost_cents: i64,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn is_low_stock(&self) -> bool {
        !self.archived && self.quantity <= self.reorder_level
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewInventoryItem {
    pub sku: String,
    pub name: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub reorder_level: i64,
    #[serde(default)]
    pub unit_cost_cents: i64,
}

fn default_unit() -> String {
    "each".to_string()
}

/// Partial update; quantity changes go through movements instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InventoryItemPatch {
    pub name: Option<String>,
    pub unit: Option<String>,
    pub reorder_level: Option<i64>,
    pub unit_cost_cents: Option<i64>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    Restock,
    JobUsage,
    Adjustment,
    Damaged,
}

impl MovementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementReason::Restock => "restock",
            MovementReason::JobUsage => "job_usage",
            MovementReason::Adjustment => "adjustment",
            MovementReason::Damaged => "damaged",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "restock" => Some(Self::Restock),
            "job_usage" => Some(Self::JobUsage),
            "adjustment" => Some(Self::Adjustment),
            "damaged" => Some(Self::Damaged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub movement_id: Uuid,
    pub item_id: Uuid,
    pub delta: i64,
    pub reason: MovementReason,
    pub job_external_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}
