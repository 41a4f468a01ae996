//! Inventory maintenance: sites, tenants, instance types, machines, parent IP
//! Blocks and the dependents (instances, subnets) other handlers create.
//!
//! These are thin writes with referential checks. Removing a machine is the
//! one exception: it is refused when the remaining machines would no longer
//! cover the Instance Type's reservations.

use super::{AllocationEngine, RequestContext};
use crate::core::ipam;
use crate::core::lock::{instance_type_key, ip_block_key};
use crate::core::model::{
    protocol_version_of, InstanceType, IpBlock, IpBlockStatus, RoutingType, Site, Tenant,
};
use crate::core::store::dao::{self, InstanceRecord, SubnetRecord};
use crate::error::{AllocError, Result};
use chrono::Utc;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters of a provider-owned IP Block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIpBlock {
    pub name: String,
    pub site_id: Uuid,
    pub routing_type: RoutingType,
    pub prefix: IpNet,
}

impl AllocationEngine {
    pub fn add_site(&self, ctx: &RequestContext, name: &str, provider_id: Uuid) -> Result<Site> {
        let site = Site {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider_id,
        };
        let tx = self.begin(ctx)?;
        dao::insert_site(tx.conn(), &site)?;
        tx.commit()?;
        info!(site_id = %site.id, provider_id = %provider_id, "site added");
        Ok(site)
    }

    pub fn add_tenant(&self, ctx: &RequestContext, org: &str, display_name: Option<&str>) -> Result<Tenant> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            org: org.to_string(),
            org_display_name: display_name.map(str::to_string),
        };
        let tx = self.begin(ctx)?;
        dao::insert_tenant(tx.conn(), &tenant)?;
        tx.commit()?;
        info!(tenant_id = %tenant.id, org, "tenant added");
        Ok(tenant)
    }

    pub fn add_instance_type(
        &self,
        ctx: &RequestContext,
        name: &str,
        provider_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<InstanceType> {
        let instance_type = InstanceType {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider_id,
            site_id,
        };
        let tx = self.begin(ctx)?;
        dao::insert_instance_type(tx.conn(), &instance_type)?;
        tx.commit()?;
        info!(instance_type_id = %instance_type.id, name, "instance type added");
        Ok(instance_type)
    }

    /// Register a machine, optionally associated with an Instance Type
    pub fn add_machine(&self, ctx: &RequestContext, site_id: Uuid, instance_type_id: Option<Uuid>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let tx = self.begin(ctx)?;
        if dao::get_site(tx.conn(), site_id)?.is_none() {
            return Err(AllocError::not_found("Site", site_id));
        }
        if let Some(it) = instance_type_id {
            if dao::get_instance_type(tx.conn(), it)?.is_none() {
                return Err(AllocError::not_found("InstanceType", it));
            }
        }
        dao::insert_machine(tx.conn(), id, site_id, instance_type_id)?;
        tx.commit()?;
        Ok(id)
    }

    /// Remove a machine unless its Instance Type would become over-reserved
    pub fn remove_machine(&self, ctx: &RequestContext, machine_id: Uuid) -> Result<()> {
        let mut tx = self.begin(ctx)?;
        let instance_type_id = dao::machine_instance_type(tx.conn(), machine_id)?
            .ok_or_else(|| AllocError::not_found("Machine", machine_id))?;

        if let Some(it) = instance_type_id {
            tx.acquire_lock(&instance_type_key(it))?;
            let instance_type = dao::get_instance_type(tx.conn(), it)?
                .ok_or_else(|| AllocError::not_found("InstanceType", it))?;
            let check = self
                .admission
                .check_capacity_after_removal(tx.conn(), &instance_type, 1)?;
            if !check.allowed {
                warn!(machine_id = %machine_id, instance_type_id = %it, reserved = check.reserved, "machine removal would break reservations");
                return Err(AllocError::conflict_with(
                    format!(
                        "removing Machine {} leaves {} machines for {} reserved on Instance Type {}",
                        machine_id, check.eligible, check.reserved, it
                    ),
                    it,
                ));
            }
        }

        dao::delete_machine(tx.conn(), machine_id)?;
        tx.commit()?;
        info!(machine_id = %machine_id, "machine removed");
        Ok(())
    }

    /// Create a provider-owned IP Block and register its prefix
    pub fn add_ip_block(&self, ctx: &RequestContext, provider_id: Uuid, new: &NewIpBlock) -> Result<IpBlock> {
        if new.prefix.trunc() != new.prefix {
            return Err(AllocError::Validation(format!(
                "prefix {} has host bits set, expected {}",
                new.prefix,
                new.prefix.trunc()
            )));
        }

        let tx = self.begin(ctx)?;
        let site = dao::get_site(tx.conn(), new.site_id)?
            .ok_or_else(|| AllocError::not_found("Site", new.site_id))?;
        if site.provider_id != provider_id {
            return Err(AllocError::Validation(format!(
                "Site {} does not belong to provider {}",
                site.id, provider_id
            )));
        }

        let block = IpBlock {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            description: None,
            site_id: site.id,
            provider_id,
            tenant_id: None,
            routing_type: new.routing_type,
            prefix: new.prefix,
            protocol_version: protocol_version_of(&new.prefix),
            status: IpBlockStatus::Ready,
            full_grant: false,
            created: Utc::now(),
        };
        dao::insert_ip_block(tx.conn(), &block)?;
        ipam::register_block(self.prefixes.as_ref(), tx.conn(), &block)?;
        tx.commit()?;

        info!(ip_block_id = %block.id, cidr = %block.prefix, site_id = %site.id, "IP Block added");
        Ok(block)
    }

    /// Remove a provider-owned IP Block no allocation draws from
    pub fn remove_ip_block(&self, ctx: &RequestContext, ip_block_id: Uuid) -> Result<()> {
        let mut tx = self.begin(ctx)?;
        tx.acquire_lock(&ip_block_key(ip_block_id))?;
        let block = dao::get_ip_block(tx.conn(), ip_block_id)?
            .ok_or_else(|| AllocError::not_found("IPBlock", ip_block_id))?;
        if block.tenant_id.is_some() {
            return Err(AllocError::Validation(format!(
                "IP Block {} is a tenant block, delete its allocation instead",
                block.id
            )));
        }

        if let Some(c) = dao::constraints_on_block(tx.conn(), block.id)?.first() {
            return Err(AllocError::conflict_with(
                format!("IP Block {} is used by Allocation {}", block.id, c.allocation_id),
                c.allocation_id,
            ));
        }

        self.prefixes
            .delete_prefix(tx.conn(), &ipam::namespace_for(&block), block.prefix)?;
        dao::delete_ip_block(tx.conn(), block.id)?;
        tx.commit()?;
        info!(ip_block_id = %block.id, cidr = %block.prefix, "IP Block removed");
        Ok(())
    }

    /// Record an instance running under an allocation constraint
    pub fn add_instance(&self, ctx: &RequestContext, instance: &InstanceRecord) -> Result<()> {
        let tx = self.begin(ctx)?;
        let constraint = dao::get_constraint(tx.conn(), instance.allocation_constraint_id)?
            .ok_or_else(|| AllocError::not_found("AllocationConstraint", instance.allocation_constraint_id))?;
        if constraint.allocation_id != instance.allocation_id {
            return Err(AllocError::Validation(format!(
                "Allocation Constraint {} does not belong to Allocation {}",
                constraint.id, instance.allocation_id
            )));
        }
        dao::insert_instance(tx.conn(), instance)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_instance(&self, ctx: &RequestContext, id: Uuid) -> Result<()> {
        let tx = self.begin(ctx)?;
        if dao::delete_instance(tx.conn(), id)? == 0 {
            return Err(AllocError::not_found("Instance", id));
        }
        tx.commit()
    }

    /// Record a subnet built on tenant IP Blocks
    pub fn add_subnet(&self, ctx: &RequestContext, subnet: &SubnetRecord) -> Result<()> {
        let tx = self.begin(ctx)?;
        for block_id in [subnet.ipv4_block_id, subnet.ipv6_block_id].into_iter().flatten() {
            if dao::get_ip_block(tx.conn(), block_id)?.is_none() {
                return Err(AllocError::not_found("IPBlock", block_id));
            }
        }
        dao::insert_subnet(tx.conn(), subnet)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_subnet(&self, ctx: &RequestContext, id: Uuid) -> Result<()> {
        let tx = self.begin(ctx)?;
        if dao::delete_subnet(tx.conn(), id)? == 0 {
            return Err(AllocError::not_found("Subnet", id));
        }
        tx.commit()
    }
}
