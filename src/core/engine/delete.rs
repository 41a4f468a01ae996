use super::{AllocationEngine, RequestContext};
use crate::core::ipam;
use crate::core::lock::{instance_type_key, ip_block_key, tenant_site_key};
use crate::core::model::{Allocation, AllocationConstraint, IpBlock, ResourceType};
use crate::core::notifier::{Delivery, DELETE_TENANT};
use crate::core::store::{dao, StoreTx};
use crate::error::{AllocError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a successful delete did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deletion {
    pub allocation: Allocation,
    /// Derived IP Blocks removed with the allocation
    pub released_blocks: Vec<Uuid>,
    /// The tenant had no allocation left on the site
    pub tenant_site_removed: bool,
    #[serde(skip)]
    pub teardown: Option<Delivery>,
}

impl AllocationEngine {
    /// Delete an allocation, its constraints and derived IP Blocks
    ///
    /// Refused with a conflict while instances or subnets still depend on it.
    /// Nothing is deleted unless everything is.
    pub fn delete_allocation(&self, ctx: &RequestContext, provider_id: Uuid, id: Uuid) -> Result<Deletion> {
        let existing = dao::get_allocation(&self.read()?, id)?
            .ok_or_else(|| AllocError::not_found("Allocation", id))?;
        if existing.provider_id != provider_id {
            return Err(AllocError::Validation(format!(
                "Allocation {} does not belong to provider {}",
                id, provider_id
            )));
        }

        let mut tx = self.begin(ctx)?;
        tx.acquire_lock(&tenant_site_key(provider_id, existing.site_id, existing.tenant_id))?;

        let allocation = dao::get_allocation(tx.conn(), id)?
            .ok_or_else(|| AllocError::not_found("Allocation", id))?;
        let constraints = dao::constraints_for(tx.conn(), id)?;

        let derived = self.check_dependents(&mut tx, &allocation, &constraints)?;

        let mut released_blocks = Vec::with_capacity(derived.len());
        for (constraint, block) in &derived {
            tx.check_deadline()?;
            self.release_derived_block(&mut tx, constraint, block)?;
            released_blocks.push(block.id);
        }

        dao::delete_constraints_for(tx.conn(), id)?;
        dao::delete_status_details(tx.conn(), id)?;
        dao::delete_allocation(tx.conn(), id)?;

        let mut tenant_site_removed = false;
        let mut teardown = None;
        if dao::count_allocations(tx.conn(), allocation.tenant_id, allocation.site_id)? == 0 {
            tenant_site_removed = dao::delete_tenant_site(tx.conn(), allocation.tenant_id, allocation.site_id)? > 0;
            debug!(tenant_id = %allocation.tenant_id, site_id = %allocation.site_id, "tenant site association removed");

            if let Some(tenant) = dao::get_tenant(tx.conn(), allocation.tenant_id)? {
                teardown = Some(self.notify(
                    &tx,
                    DELETE_TENANT,
                    &tenant,
                    allocation.site_id,
                    self.config.notifier.teardown_failure,
                )?);
            }
        }

        tx.commit()?;
        info!(
            allocation_id = %id,
            tenant_id = %allocation.tenant_id,
            site_id = %allocation.site_id,
            released_blocks = released_blocks.len(),
            tenant_site_removed,
            "allocation deleted"
        );

        Ok(Deletion {
            allocation,
            released_blocks,
            tenant_site_removed,
            teardown,
        })
    }

    /// Reject the delete while instances or subnets reference the allocation
    ///
    /// Returns the derived block of every IP Block constraint.
    fn check_dependents(
        &self,
        tx: &mut StoreTx,
        allocation: &Allocation,
        constraints: &[AllocationConstraint],
    ) -> Result<Vec<(AllocationConstraint, IpBlock)>> {
        let mut derived = Vec::new();
        for c in constraints {
            match c.resource_type {
                ResourceType::InstanceType => {
                    tx.acquire_lock(&instance_type_key(c.resource_type_id))?;
                    let instances = dao::count_instances(
                        tx.conn(),
                        allocation.id,
                        c.id,
                        allocation.tenant_id,
                        allocation.provider_id,
                        c.resource_type_id,
                    )?;
                    if instances > 0 {
                        warn!(allocation_id = %allocation.id, constraint_id = %c.id, instances, "allocation has running instances");
                        return Err(AllocError::conflict_with(
                            format!(
                                "Allocation Constraint {} is used by {} Instance(s), delete them first",
                                c.id, instances
                            ),
                            c.id,
                        ));
                    }
                }
                ResourceType::IpBlock => {
                    let Some(derived_id) = c.derived_resource_id else {
                        continue;
                    };
                    let Some(block) = dao::get_ip_block(tx.conn(), derived_id)? else {
                        warn!(allocation_id = %allocation.id, ip_block_id = %derived_id, "derived IP Block already gone");
                        continue;
                    };
                    let subnets = dao::count_subnets(
                        tx.conn(),
                        allocation.tenant_id,
                        block.id,
                        block.protocol_version,
                    )?;
                    if subnets > 0 {
                        warn!(allocation_id = %allocation.id, ip_block_id = %block.id, subnets, "derived IP Block has subnets");
                        return Err(AllocError::conflict_with(
                            format!(
                                "IP Block {} is used by {} Subnet(s), delete them first",
                                block.id, subnets
                            ),
                            block.id,
                        ));
                    }
                    derived.push((c.clone(), block));
                }
            }
        }
        Ok(derived)
    }

    /// Delete the derived block row and return its prefix to the parent
    fn release_derived_block(
        &self,
        tx: &mut StoreTx,
        constraint: &AllocationConstraint,
        block: &IpBlock,
    ) -> Result<()> {
        dao::delete_status_details(tx.conn(), block.id)?;
        dao::delete_ip_block(tx.conn(), block.id)?;

        tx.acquire_lock(&ip_block_key(constraint.resource_type_id))?;
        match dao::get_ip_block(tx.conn(), constraint.resource_type_id)? {
            Some(parent) => {
                ipam::release_for_block(self.prefixes.as_ref(), tx.conn(), &parent, block.prefix)?;
                debug!(ip_block_id = %block.id, cidr = %block.prefix, parent_id = %parent.id, "derived IP Block released");
            }
            None => {
                warn!(ip_block_id = %block.id, parent_id = %constraint.resource_type_id, "parent IP Block missing, nothing to release");
            }
        }
        Ok(())
    }
}
