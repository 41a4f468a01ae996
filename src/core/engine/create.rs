use super::{is_unique_violation, status_detail, AllocationEngine, RequestContext};
use crate::core::ipam;
use crate::core::lock::{instance_type_key, ip_block_key, tenant_site_key};
use crate::core::model::{
    Allocation, AllocationConstraint, AllocationDetail, AllocationStatus, InstanceType, IpBlock,
    IpBlockStatus, ResourceType, Site, Tenant, TenantSite,
};
use crate::core::notifier::CREATE_TENANT;
use crate::core::store::{dao, StoreTx};
use crate::core::validation::{ConstraintRequest, CreateAllocationRequest};
use crate::error::{AllocError, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resource a constraint request draws from, resolved before the transaction
enum Resource {
    InstanceType(InstanceType),
    IpBlock(IpBlock),
}

struct Resolved {
    site: Site,
    tenant: Tenant,
    resources: Vec<(ConstraintRequest, Resource)>,
}

impl AllocationEngine {
    /// Create an allocation and reserve every requested resource
    ///
    /// All constraints are admitted or none are: a conflict on any one of
    /// them rolls back carved prefixes and rows of the ones before it.
    pub fn create_allocation(
        &self,
        ctx: &RequestContext,
        provider_id: Uuid,
        req: &CreateAllocationRequest,
    ) -> Result<AllocationDetail> {
        req.check()?;
        let resolved = self.resolve(&self.read()?, provider_id, req)?;

        let mut tx = self.begin(ctx)?;
        tx.acquire_lock(&tenant_site_key(provider_id, req.site_id, req.tenant_id))?;

        // The pre-check ran without the lock
        if let Some(existing) = dao::find_allocation_by_name(tx.conn(), req.tenant_id, req.site_id, &req.name)? {
            return Err(name_taken(&req.name, existing.id));
        }
        let first_on_site = dao::count_allocations(tx.conn(), req.tenant_id, req.site_id)? == 0;

        let now = Utc::now();
        let allocation = Allocation {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            description: req.description.clone(),
            status: AllocationStatus::Registered,
            provider_id,
            tenant_id: req.tenant_id,
            site_id: req.site_id,
            created_by: ctx.actor,
            created: now,
            updated: now,
        };

        if let Err(e) = dao::insert_allocation(tx.conn(), &allocation) {
            if is_unique_violation(&e) {
                if let Some(existing) = dao::find_allocation_by_name(tx.conn(), req.tenant_id, req.site_id, &req.name)? {
                    return Err(name_taken(&req.name, existing.id));
                }
            }
            return Err(e.into());
        }
        dao::insert_status_detail(
            tx.conn(),
            &status_detail(
                allocation.id,
                AllocationStatus::Registered.as_str(),
                "received allocation creation request, registered",
            ),
        )?;

        let mut constraints = Vec::with_capacity(resolved.resources.len());
        for (request, resource) in &resolved.resources {
            tx.check_deadline()?;
            let derived_resource_id = match resource {
                Resource::InstanceType(instance_type) => {
                    self.reserve_instance_type(&mut tx, instance_type, request.constraint_value)?;
                    None
                }
                Resource::IpBlock(parent) => {
                    Some(self.carve_derived_block(&mut tx, &allocation, parent, request.constraint_value)?)
                }
            };

            let constraint = AllocationConstraint {
                id: Uuid::new_v4(),
                allocation_id: allocation.id,
                resource_type: request.resource_type,
                resource_type_id: request.resource_type_id,
                constraint_type: request.constraint_type,
                constraint_value: request.constraint_value,
                derived_resource_id,
                created_by: ctx.actor,
                created: now,
                updated: now,
            };
            dao::insert_constraint(tx.conn(), &constraint)?;
            constraints.push(constraint);
        }

        if first_on_site {
            self.associate_tenant(&tx, &resolved, ctx.actor, now)?;
        }

        tx.commit()?;
        info!(
            allocation_id = %allocation.id,
            tenant_id = %allocation.tenant_id,
            site_id = %allocation.site_id,
            constraints = constraints.len(),
            "allocation created"
        );

        Ok(AllocationDetail {
            allocation,
            constraints,
        })
    }

    /// Look up every referenced entity and check ownership
    fn resolve(&self, conn: &Connection, provider_id: Uuid, req: &CreateAllocationRequest) -> Result<Resolved> {
        let site = dao::get_site(conn, req.site_id)?.ok_or_else(|| AllocError::not_found("Site", req.site_id))?;
        if site.provider_id != provider_id {
            return Err(AllocError::Validation(format!(
                "Site {} does not belong to provider {}",
                site.id, provider_id
            )));
        }
        let tenant =
            dao::get_tenant(conn, req.tenant_id)?.ok_or_else(|| AllocError::not_found("Tenant", req.tenant_id))?;

        if let Some(existing) = dao::find_allocation_by_name(conn, req.tenant_id, req.site_id, &req.name)? {
            return Err(name_taken(&req.name, existing.id));
        }

        let mut resources = Vec::with_capacity(req.constraints.len());
        for c in &req.constraints {
            let resource = match c.resource_type {
                ResourceType::InstanceType => {
                    let it = dao::get_instance_type(conn, c.resource_type_id)?
                        .ok_or_else(|| AllocError::not_found("InstanceType", c.resource_type_id))?;
                    if it.provider_id != provider_id {
                        return Err(AllocError::Validation(format!(
                            "Instance Type {} does not belong to provider {}",
                            it.id, provider_id
                        )));
                    }
                    if it.site_id.is_some_and(|s| s != site.id) {
                        return Err(AllocError::Validation(format!(
                            "Instance Type {} is not associated with Site {}",
                            it.id, site.id
                        )));
                    }
                    Resource::InstanceType(it)
                }
                ResourceType::IpBlock => {
                    let block = dao::get_ip_block(conn, c.resource_type_id)?
                        .ok_or_else(|| AllocError::not_found("IPBlock", c.resource_type_id))?;
                    if block.site_id != site.id {
                        return Err(AllocError::Validation(format!(
                            "IP Block {} does not belong to Site {}",
                            block.id, site.id
                        )));
                    }
                    if block.provider_id != provider_id {
                        return Err(AllocError::Validation(format!(
                            "IP Block {} does not belong to provider {}",
                            block.id, provider_id
                        )));
                    }
                    if block.tenant_id.is_some() {
                        return Err(AllocError::Validation(format!(
                            "IP Block {} is a tenant block and cannot be allocated from",
                            block.id
                        )));
                    }
                    let max = i64::from(block.prefix.max_prefix_len());
                    if c.constraint_value < i64::from(block.prefix_len()) || c.constraint_value > max {
                        return Err(AllocError::Validation(format!(
                            "prefix length /{} is invalid for IP Block {} ({})",
                            c.constraint_value, block.id, block.prefix
                        )));
                    }
                    Resource::IpBlock(block)
                }
            };
            resources.push((c.clone(), resource));
        }

        Ok(Resolved {
            site,
            tenant,
            resources,
        })
    }

    /// Lock the Instance Type and admit `requested` more units
    pub(super) fn reserve_instance_type(
        &self,
        tx: &mut StoreTx,
        instance_type: &InstanceType,
        requested: i64,
    ) -> Result<()> {
        tx.acquire_lock(&instance_type_key(instance_type.id))?;
        let admission = self.admission.admit(tx, instance_type, requested)?;
        if !admission.allowed {
            warn!(
                instance_type_id = %instance_type.id,
                requested,
                reserved = admission.reserved,
                eligible = admission.eligible,
                "insufficient machines for reservation"
            );
            return Err(AllocError::conflict_with(
                format!(
                    "Instance Type {} has {} of {} machines available, {} requested",
                    instance_type.id,
                    admission.available(),
                    admission.eligible,
                    requested
                ),
                instance_type.id,
            ));
        }
        Ok(())
    }

    /// Carve a child from the parent block and record it as a tenant block
    fn carve_derived_block(
        &self,
        tx: &mut StoreTx,
        allocation: &Allocation,
        parent: &IpBlock,
        length: i64,
    ) -> Result<Uuid> {
        tx.acquire_lock(&ip_block_key(parent.id))?;
        let parent = dao::get_ip_block(tx.conn(), parent.id)?
            .ok_or_else(|| AllocError::not_found("IPBlock", parent.id))?;
        let length = prefix_length(length)?;

        let grant = match ipam::carve_for_block(self.prefixes.as_ref(), tx.conn(), &parent, length) {
            Ok(grant) => grant,
            Err(e) => {
                warn!(ip_block_id = %parent.id, cidr = %parent.prefix, length, error = %e, "child prefix carve failed");
                return Err(e);
            }
        };

        let derived = IpBlock {
            id: Uuid::new_v4(),
            name: allocation.name.clone(),
            description: allocation.description.clone(),
            site_id: parent.site_id,
            provider_id: parent.provider_id,
            tenant_id: Some(allocation.tenant_id),
            routing_type: parent.routing_type,
            prefix: grant.prefix,
            protocol_version: parent.protocol_version,
            status: IpBlockStatus::Ready,
            full_grant: false,
            created: allocation.created,
        };
        dao::insert_ip_block(tx.conn(), &derived)?;
        dao::insert_status_detail(
            tx.conn(),
            &status_detail(derived.id, IpBlockStatus::Ready.as_str(), "Child IP Block is ready for use"),
        )?;

        debug!(
            allocation_id = %allocation.id,
            ip_block_id = %derived.id,
            cidr = %derived.prefix,
            full_grant = grant.full_grant,
            "derived IP Block created"
        );
        Ok(derived.id)
    }

    /// First allocation of the tenant on the site
    fn associate_tenant(&self, tx: &StoreTx, resolved: &Resolved, actor: Uuid, now: DateTime<Utc>) -> Result<()> {
        if dao::get_tenant_site(tx.conn(), resolved.tenant.id, resolved.site.id)?.is_none() {
            dao::insert_tenant_site(
                tx.conn(),
                &TenantSite {
                    id: Uuid::new_v4(),
                    tenant_id: resolved.tenant.id,
                    site_id: resolved.site.id,
                    created_by: actor,
                    created: now,
                },
            )?;
            debug!(tenant_id = %resolved.tenant.id, site_id = %resolved.site.id, "tenant site association created");
        }
        self.notify(
            tx,
            CREATE_TENANT,
            &resolved.tenant,
            resolved.site.id,
            self.config.notifier.create_failure,
        )?;
        Ok(())
    }
}

pub(super) fn name_taken(name: &str, existing: Uuid) -> AllocError {
    AllocError::conflict_with(
        format!("Allocation with name '{}' already exists for Tenant on Site", name),
        existing,
    )
}

pub(super) fn prefix_length(value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| AllocError::Validation(format!("prefix length {} is out of range", value)))
}
