use super::create::{name_taken, prefix_length};
use super::{is_unique_violation, AllocationEngine, RequestContext};
use crate::core::ipam;
use crate::core::lock::{derived_block_key, instance_type_key, ip_block_key, tenant_site_key};
use crate::core::model::{Allocation, AllocationConstraint, ConstraintType, ResourceType};
use crate::core::store::{dao, StoreTx};
use crate::core::validation::{
    check_constraint_value, UpdateAllocationRequest, UpdateConstraintRequest,
};
use crate::error::{AllocError, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl AllocationEngine {
    /// Rename an allocation or change its description
    ///
    /// A new name must be free for the tenant on the site and is carried over
    /// to the derived IP Blocks of the allocation.
    pub fn update_allocation(
        &self,
        ctx: &RequestContext,
        provider_id: Uuid,
        req: &UpdateAllocationRequest,
    ) -> Result<Allocation> {
        req.check()?;

        let conn = self.read()?;
        let existing = dao::get_allocation(&conn, req.allocation_id)?
            .ok_or_else(|| AllocError::not_found("Allocation", req.allocation_id))?;
        drop(conn);

        if existing.provider_id != provider_id {
            return Err(AllocError::Validation(format!(
                "Allocation {} does not belong to provider {}",
                existing.id, provider_id
            )));
        }

        let mut tx = self.begin(ctx)?;
        tx.acquire_lock(&tenant_site_key(provider_id, existing.site_id, existing.tenant_id))?;
        let current = dao::get_allocation(tx.conn(), req.allocation_id)?
            .ok_or_else(|| AllocError::not_found("Allocation", req.allocation_id))?;

        let name = req.name.clone().unwrap_or_else(|| current.name.clone());
        let description = req.description.clone().or_else(|| current.description.clone());
        let renamed = name != current.name;
        if !renamed && description == current.description {
            tx.rollback()?;
            return Ok(current);
        }

        if renamed {
            if let Some(other) = dao::find_allocation_by_name(tx.conn(), current.tenant_id, current.site_id, &name)? {
                warn!(allocation_id = %current.id, conflicting_id = %other.id, "allocation name taken");
                return Err(name_taken(&name, other.id));
            }
        }

        let now = Utc::now();
        if let Err(e) = dao::update_allocation_fields(tx.conn(), current.id, &name, description.as_deref(), now) {
            if is_unique_violation(&e) {
                if let Some(other) = dao::find_allocation_by_name(tx.conn(), current.tenant_id, current.site_id, &name)? {
                    return Err(name_taken(&name, other.id));
                }
            }
            return Err(e.into());
        }

        for constraint in dao::constraints_for(tx.conn(), current.id)? {
            if let (ResourceType::IpBlock, Some(derived_id)) =
                (constraint.resource_type, constraint.derived_resource_id)
            {
                dao::rename_ip_block(tx.conn(), derived_id, &name, req.description.as_deref())?;
                debug!(allocation_id = %current.id, ip_block_id = %derived_id, "derived IP Block renamed");
            }
        }
        tx.commit()?;

        info!(allocation_id = %current.id, from = %current.name, to = %name, "allocation updated");
        Ok(Allocation {
            name,
            description,
            updated: now,
            ..current
        })
    }

    /// Change the value of one constraint
    ///
    /// For an Instance Type constraint the new count must cover running
    /// instances, and an increase is admitted for the difference only. For an
    /// IP Block constraint the derived block is re-carved at the new length.
    pub fn update_constraint(
        &self,
        ctx: &RequestContext,
        provider_id: Uuid,
        req: &UpdateConstraintRequest,
    ) -> Result<AllocationConstraint> {
        req.check()?;

        let conn = self.read()?;
        let current = dao::get_constraint(&conn, req.constraint_id)?
            .ok_or_else(|| AllocError::not_found("AllocationConstraint", req.constraint_id))?;
        let allocation = dao::get_allocation(&conn, current.allocation_id)?
            .ok_or_else(|| AllocError::not_found("Allocation", current.allocation_id))?;
        drop(conn);

        if allocation.provider_id != provider_id {
            return Err(AllocError::Validation(format!(
                "Allocation {} does not belong to provider {}",
                allocation.id, provider_id
            )));
        }
        check_constraint_value(current.resource_type, current.constraint_type, req.constraint_value)?;
        if current.constraint_value == req.constraint_value {
            return Ok(current);
        }

        let mut tx = self.begin(ctx)?;
        let current = dao::get_constraint(tx.conn(), req.constraint_id)?
            .ok_or_else(|| AllocError::not_found("AllocationConstraint", req.constraint_id))?;
        // A concurrent update may already have set the value
        if current.constraint_value == req.constraint_value {
            tx.rollback()?;
            return Ok(current);
        }

        match current.resource_type {
            ResourceType::InstanceType => {
                self.resize_reservation(&mut tx, &current, allocation.tenant_id, req.constraint_value)?
            }
            ResourceType::IpBlock => {
                self.recarve_derived_block(&mut tx, &current, allocation.tenant_id, req.constraint_value)?
            }
        }

        let now = Utc::now();
        dao::update_constraint_value(tx.conn(), current.id, req.constraint_value, now)?;
        tx.commit()?;

        info!(
            allocation_id = %current.allocation_id,
            constraint_id = %current.id,
            from = current.constraint_value,
            to = req.constraint_value,
            "allocation constraint updated"
        );
        Ok(AllocationConstraint {
            constraint_value: req.constraint_value,
            updated: now,
            ..current
        })
    }

    fn resize_reservation(
        &self,
        tx: &mut StoreTx,
        current: &AllocationConstraint,
        tenant_id: Uuid,
        new_value: i64,
    ) -> Result<()> {
        tx.acquire_lock(&instance_type_key(current.resource_type_id))?;
        let instance_type = dao::get_instance_type(tx.conn(), current.resource_type_id)?
            .ok_or_else(|| AllocError::not_found("InstanceType", current.resource_type_id))?;

        let instances = dao::count_instances(
            tx.conn(),
            current.allocation_id,
            current.id,
            tenant_id,
            instance_type.provider_id,
            instance_type.id,
        )?;
        if instances > new_value {
            return Err(AllocError::Validation(format!(
                "{} Instance(s) run under this constraint, value cannot drop to {}",
                instances, new_value
            )));
        }

        let delta = new_value - current.constraint_value;
        if delta > 0 && current.constraint_type == ConstraintType::Reserved {
            self.reserve_instance_type(tx, &instance_type, delta)?;
        }
        Ok(())
    }

    fn recarve_derived_block(
        &self,
        tx: &mut StoreTx,
        current: &AllocationConstraint,
        tenant_id: Uuid,
        new_value: i64,
    ) -> Result<()> {
        let derived_id = current.derived_resource_id.ok_or_else(|| {
            AllocError::Internal(format!(
                "IP Block constraint {} has no derived IP Block",
                current.id
            ))
        })?;
        let parent_id = current.resource_type_id;
        let length = prefix_length(new_value)?;

        {
            let parent = dao::get_ip_block(tx.conn(), parent_id)?
                .ok_or_else(|| AllocError::not_found("IPBlock", parent_id))?;
            if length < parent.prefix_len() {
                return Err(AllocError::Validation(format!(
                    "prefix length /{} is shorter than parent IP Block {} ({})",
                    length, parent.id, parent.prefix
                )));
            }
        }

        tx.acquire_lock(&derived_block_key(tenant_id, derived_id))?;
        tx.acquire_lock(&ip_block_key(parent_id))?;

        let derived = dao::get_ip_block(tx.conn(), derived_id)?
            .ok_or_else(|| AllocError::not_found("IPBlock", derived_id))?;
        let subnets = dao::count_subnets(tx.conn(), tenant_id, derived.id, derived.protocol_version)?;
        if subnets > 0 {
            warn!(ip_block_id = %derived.id, subnets, "derived IP Block has subnets, cannot resize");
            return Err(AllocError::conflict_with(
                format!(
                    "IP Block {} is used by {} Subnet(s), delete them before resizing",
                    derived.id, subnets
                ),
                derived.id,
            ));
        }

        let parent = dao::get_ip_block(tx.conn(), parent_id)?
            .ok_or_else(|| AllocError::not_found("IPBlock", parent_id))?;
        ipam::release_for_block(self.prefixes.as_ref(), tx.conn(), &parent, derived.prefix)?;

        // Release may have cleared the full grant
        let parent = dao::get_ip_block(tx.conn(), parent_id)?
            .ok_or_else(|| AllocError::not_found("IPBlock", parent_id))?;
        let grant = ipam::carve_for_block(self.prefixes.as_ref(), tx.conn(), &parent, length)?;
        dao::update_ip_block_prefix(tx.conn(), derived.id, grant.prefix)?;

        debug!(
            ip_block_id = %derived.id,
            from = %derived.prefix,
            to = %grant.prefix,
            "derived IP Block re-carved"
        );
        Ok(())
    }
}
