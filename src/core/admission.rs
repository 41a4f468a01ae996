//! Admission Checker
//!
//! The reserved total is recomputed from constraint rows on every check; there
//! is no running counter to drift. [`AdmissionChecker::admit`] refuses to run
//! unless the caller's transaction holds the Instance Type lock, since two
//! unlocked checks can both see free capacity and both commit.

use crate::core::inventory::Inventory;
use crate::core::lock::instance_type_key;
use crate::core::model::InstanceType;
use crate::core::store::{dao, StoreTx};
use crate::error::{AllocError, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub instance_type_id: Uuid,
    /// Units asked for
    pub requested: i64,
    /// Units already reserved by existing constraints
    pub reserved: i64,
    /// Machines able to run the type
    pub eligible: i64,
    pub allowed: bool,
}

impl Admission {
    fn evaluate(instance_type_id: Uuid, requested: i64, reserved: i64, eligible: i64) -> Self {
        Admission {
            instance_type_id,
            requested,
            reserved,
            eligible,
            allowed: reserved.saturating_add(requested) <= eligible,
        }
    }

    /// Unreserved machines, never negative
    pub fn available(&self) -> i64 {
        (self.eligible - self.reserved).max(0)
    }
}

#[derive(Clone)]
pub struct AdmissionChecker {
    inventory: Arc<dyn Inventory>,
}

impl AdmissionChecker {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        AdmissionChecker { inventory }
    }

    /// Admit `requested` more units of the Instance Type
    ///
    /// The transaction must already hold the Instance Type's advisory lock.
    pub fn admit(&self, tx: &StoreTx, instance_type: &InstanceType, requested: i64) -> Result<Admission> {
        if !tx.holds_lock(&instance_type_key(instance_type.id)) {
            return Err(AllocError::Internal(format!(
                "admission check for Instance Type {} without holding its lock",
                instance_type.id
            )));
        }
        let admission = self.snapshot(tx.conn(), instance_type, requested)?;
        debug!(
            instance_type_id = %instance_type.id,
            requested,
            reserved = admission.reserved,
            eligible = admission.eligible,
            allowed = admission.allowed,
            "admission checked"
        );
        Ok(admission)
    }

    /// Unlocked view of the same computation, for diagnostics
    pub fn snapshot(&self, conn: &Connection, instance_type: &InstanceType, requested: i64) -> Result<Admission> {
        let reserved = dao::reserved_total(conn, instance_type.id)?;
        let eligible = self.inventory.eligible_machines(conn, instance_type)?;
        Ok(Admission::evaluate(instance_type.id, requested, reserved, eligible))
    }

    /// Whether reservations still fit after `machines_removed` machines leave the type
    ///
    /// `allowed` is false when the remaining machines cannot cover the reserved total.
    pub fn check_capacity_after_removal(
        &self,
        conn: &Connection,
        instance_type: &InstanceType,
        machines_removed: i64,
    ) -> Result<Admission> {
        let reserved = dao::reserved_total(conn, instance_type.id)?;
        let eligible = self.inventory.eligible_machines(conn, instance_type)?;
        let remaining = (eligible - machines_removed).max(0);
        Ok(Admission::evaluate(instance_type.id, 0, reserved, remaining))
    }
}

impl std::fmt::Debug for AdmissionChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionChecker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_boundary() {
        let id = Uuid::new_v4();
        assert!(Admission::evaluate(id, 10, 0, 10).allowed);
        assert!(!Admission::evaluate(id, 1, 10, 10).allowed);
        assert!(Admission::evaluate(id, 0, 10, 10).allowed);
        assert!(!Admission::evaluate(id, 3, 8, 10).allowed);
    }

    #[test]
    fn test_available_never_negative() {
        let a = Admission::evaluate(Uuid::new_v4(), 0, 12, 10);
        assert_eq!(a.available(), 0);
        assert!(!a.allowed);
    }
}
