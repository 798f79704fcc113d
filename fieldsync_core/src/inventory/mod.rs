pub mod models;
pub mod service;

pub use models::{
    InventoryItem, InventoryItemPatch, InventoryMovement, MovementReason, NewInventoryItem,
};
pub use service::InventoryService;
