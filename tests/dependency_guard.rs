//! Deletes refused while instances or subnets depend on an allocation

mod common;

use common::{carve, reserve, Harness};
use site_allocator::core::store::dao;
use site_allocator::{ErrorKind, InstanceRecord, SubnetRecord, UpdateConstraintRequest};
use uuid::Uuid;

#[test]
fn test_running_instance_blocks_delete() {
    let h = Harness::new();
    let it = h.instance_type(2);
    let block = h.ip_block("10.30.0.0/24");

    let created = h
        .engine
        .create_allocation(&h.ctx, h.provider, &h.request("pool", vec![carve(&block, 26), reserve(&it, 2)]))
        .unwrap();
    let machine_constraint = created
        .constraints
        .iter()
        .find(|c| c.resource_type_id == it.id)
        .unwrap();

    let instance = InstanceRecord {
        id: Uuid::new_v4(),
        name: "vm-1".into(),
        allocation_id: created.allocation.id,
        allocation_constraint_id: machine_constraint.id,
        tenant_id: h.tenant.id,
        provider_id: h.provider,
        instance_type_id: it.id,
    };
    h.engine.add_instance(&h.ctx, &instance).unwrap();

    let err = h
        .engine
        .delete_allocation(&h.ctx, h.provider, created.allocation.id)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.conflicting_id(), Some(machine_constraint.id));

    // Nothing was partially removed
    let still = h.engine.get_allocation(created.allocation.id).unwrap();
    assert_eq!(still.constraints.len(), 2);
    assert_eq!(h.engine.block_usage(block.id).unwrap().acquired_prefixes, 1);
    assert_eq!(h.engine.reserved_total(it.id).unwrap(), 2);
    assert!(h.engine.tenant_site(h.tenant.id, h.site.id).unwrap().is_some());

    h.engine.remove_instance(&h.ctx, instance.id).unwrap();
    let deletion = h
        .engine
        .delete_allocation(&h.ctx, h.provider, created.allocation.id)
        .unwrap();
    assert_eq!(deletion.released_blocks.len(), 1);
    assert_eq!(h.engine.block_usage(block.id).unwrap().acquired_prefixes, 0);
    assert_eq!(h.engine.reserved_total(it.id).unwrap(), 0);
}

#[test]
fn test_subnet_on_derived_block_blocks_delete() {
    let h = Harness::new();
    let block = h.ip_block("10.31.0.0/24");

    let created = h
        .engine
        .create_allocation(&h.ctx, h.provider, &h.request("net", vec![carve(&block, 25)]))
        .unwrap();
    let derived_id = created.constraints[0].derived_resource_id.unwrap();

    let subnet = SubnetRecord {
        id: Uuid::new_v4(),
        name: "subnet-a".into(),
        tenant_id: h.tenant.id,
        ipv4_block_id: Some(derived_id),
        ipv6_block_id: None,
    };
    h.engine.add_subnet(&h.ctx, &subnet).unwrap();

    let err = h
        .engine
        .delete_allocation(&h.ctx, h.provider, created.allocation.id)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.conflicting_id(), Some(derived_id));

    let conn = h.engine.store().connect().unwrap();
    assert!(dao::get_ip_block(&conn, derived_id).unwrap().is_some());
    assert_eq!(h.engine.block_usage(block.id).unwrap().acquired_prefixes, 1);

    let err = h
        .engine
        .update_constraint(
            &h.ctx,
            h.provider,
            &UpdateConstraintRequest {
                constraint_id: created.constraints[0].id,
                constraint_value: 26,
            },
        )
        .unwrap_err();
    assert_eq!(err.conflicting_id(), Some(derived_id));

    h.engine.remove_subnet(&h.ctx, subnet.id).unwrap();
    h.engine
        .delete_allocation(&h.ctx, h.provider, created.allocation.id)
        .unwrap();
    assert!(dao::get_ip_block(&conn, derived_id).unwrap().is_none());
    assert!(h.engine.status_details(derived_id).unwrap().is_empty());
}

#[test]
fn test_other_tenant_subnet_does_not_block() {
    let h = Harness::new();
    let block = h.ip_block("10.32.0.0/24");

    let created = h
        .engine
        .create_allocation(&h.ctx, h.provider, &h.request("net", vec![carve(&block, 25)]))
        .unwrap();
    let derived_id = created.constraints[0].derived_resource_id.unwrap();

    let stranger = h.engine.add_tenant(&h.ctx, "initech", None).unwrap();
    h.engine
        .add_subnet(
            &h.ctx,
            &SubnetRecord {
                id: Uuid::new_v4(),
                name: "foreign".into(),
                tenant_id: stranger.id,
                ipv4_block_id: Some(derived_id),
                ipv6_block_id: None,
            },
        )
        .unwrap();

    h.engine
        .delete_allocation(&h.ctx, h.provider, created.allocation.id)
        .unwrap();
}

#[test]
fn test_instance_must_match_its_allocation() {
    let h = Harness::new();
    let it = h.instance_type(1);

    let created = h
        .engine
        .create_allocation(&h.ctx, h.provider, &h.request("pool", vec![reserve(&it, 1)]))
        .unwrap();

    let err = h
        .engine
        .add_instance(
            &h.ctx,
            &InstanceRecord {
                id: Uuid::new_v4(),
                name: "vm-x".into(),
                allocation_id: Uuid::new_v4(),
                allocation_constraint_id: created.constraints[0].id,
                tenant_id: h.tenant.id,
                provider_id: h.provider,
                instance_type_id: it.id,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_shrinking_below_running_instances_is_refused() {
    let h = Harness::new();
    let it = h.instance_type(3);

    let created = h
        .engine
        .create_allocation(&h.ctx, h.provider, &h.request("pool", vec![reserve(&it, 3)]))
        .unwrap();
    for n in 0..2 {
        h.engine
            .add_instance(
                &h.ctx,
                &InstanceRecord {
                    id: Uuid::new_v4(),
                    name: format!("vm-{n}"),
                    allocation_id: created.allocation.id,
                    allocation_constraint_id: created.constraints[0].id,
                    tenant_id: h.tenant.id,
                    provider_id: h.provider,
                    instance_type_id: it.id,
                },
            )
            .unwrap();
    }

    let shrink = |value| {
        h.engine.update_constraint(
            &h.ctx,
            h.provider,
            &UpdateConstraintRequest {
                constraint_id: created.constraints[0].id,
                constraint_value: value,
            },
        )
    };
    assert_eq!(shrink(1).unwrap_err().kind(), ErrorKind::Validation);
    assert_eq!(shrink(2).unwrap().constraint_value, 2);
    assert_eq!(h.engine.reserved_total(it.id).unwrap(), 2);
}

#[test]
fn test_delete_tolerates_already_released_prefix() {
    use site_allocator::core::ipam;
    use site_allocator::{PrefixStore, SqlPrefixStore};

    let h = Harness::new();
    let block = h.ip_block("10.33.0.0/24");
    let created = h
        .engine
        .create_allocation(&h.ctx, h.provider, &h.request("net", vec![carve(&block, 27)]))
        .unwrap();
    let derived_id = created.constraints[0].derived_resource_id.unwrap();

    let conn = h.engine.store().connect().unwrap();
    let derived = dao::get_ip_block(&conn, derived_id).unwrap().unwrap();
    SqlPrefixStore
        .release_child(&conn, &ipam::namespace_for(&block), block.prefix, derived.prefix)
        .unwrap();

    let deletion = h
        .engine
        .delete_allocation(&h.ctx, h.provider, created.allocation.id)
        .unwrap();
    assert_eq!(deletion.released_blocks, vec![derived_id]);
    assert_eq!(h.engine.block_usage(block.id).unwrap().acquired_prefixes, 0);
}
