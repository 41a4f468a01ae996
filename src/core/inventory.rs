//! Eligible machine counts per Instance Type

use crate::core::model::InstanceType;
use crate::core::store::dao;
use crate::error::Result;
use rusqlite::Connection;

/// Source of machine capacity for admission
pub trait Inventory: Send + Sync {
    /// Machines currently able to run the Instance Type
    fn eligible_machines(&self, conn: &Connection, instance_type: &InstanceType) -> Result<i64>;
}

/// Counts machines associated with the Instance Type in the `machines` table
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlInventory;

impl Inventory for SqlInventory {
    fn eligible_machines(&self, conn: &Connection, instance_type: &InstanceType) -> Result<i64> {
        Ok(dao::count_machines(conn, instance_type.id)?)
    }
}
