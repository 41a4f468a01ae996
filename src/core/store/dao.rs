//! Row access for every table the engine reads or writes
//!
//! Functions take a plain `&Connection` so they run equally inside a
//! [`StoreTx`](super::StoreTx) or on a read connection. Seeding helpers for
//! sites, tenants, machines and the like carry no business rules.

use crate::core::model::{
    Allocation, AllocationConstraint, InstanceType, IpBlock, ProtocolVersion, Site, StatusDetail,
    Tenant, TenantSite,
};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Parse a text column through `FromStr`
fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<BoxError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: T::Err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

// ---------------------------------------------------------------------------
// Allocations

const ALLOCATION_COLUMNS: &str = "id, name, description, status, provider_id, tenant_id, site_id, created_by, created, updated";

fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: text_col(row, 3)?,
        provider_id: row.get(4)?,
        tenant_id: row.get(5)?,
        site_id: row.get(6)?,
        created_by: row.get(7)?,
        created: row.get(8)?,
        updated: row.get(9)?,
    })
}

pub fn insert_allocation(conn: &Connection, a: &Allocation) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO allocations (id, name, description, status, provider_id, tenant_id, site_id, created_by, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            a.id,
            a.name,
            a.description,
            a.status.as_str(),
            a.provider_id,
            a.tenant_id,
            a.site_id,
            a.created_by,
            a.created,
            a.updated
        ],
    )?;
    Ok(())
}

pub fn get_allocation(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Allocation>> {
    conn.query_row(
        &format!("SELECT {} FROM allocations WHERE id = ?1", ALLOCATION_COLUMNS),
        params![id],
        allocation_from_row,
    )
    .optional()
}

pub fn find_allocation_by_name(
    conn: &Connection,
    tenant_id: Uuid,
    site_id: Uuid,
    name: &str,
) -> rusqlite::Result<Option<Allocation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM allocations WHERE tenant_id = ?1 AND site_id = ?2 AND name = ?3",
            ALLOCATION_COLUMNS
        ),
        params![tenant_id, site_id, name],
        allocation_from_row,
    )
    .optional()
}

/// Optional filters for listing allocations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationFilter {
    pub tenant_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub name: Option<String>,
}

pub fn list_allocations(
    conn: &Connection,
    filter: &AllocationFilter,
) -> rusqlite::Result<Vec<Allocation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM allocations
         WHERE (?1 IS NULL OR tenant_id = ?1)
           AND (?2 IS NULL OR site_id = ?2)
           AND (?3 IS NULL OR name = ?3)
         ORDER BY created, name",
        ALLOCATION_COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![filter.tenant_id, filter.site_id, filter.name],
        allocation_from_row,
    )?;
    rows.collect()
}

pub fn count_allocations(conn: &Connection, tenant_id: Uuid, site_id: Uuid) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM allocations WHERE tenant_id = ?1 AND site_id = ?2",
        params![tenant_id, site_id],
        |row| row.get(0),
    )
}

pub fn update_allocation_fields(
    conn: &Connection,
    id: Uuid,
    name: &str,
    description: Option<&str>,
    updated: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE allocations SET name = ?2, description = ?3, updated = ?4 WHERE id = ?1",
        params![id, name, description, updated],
    )
}

pub fn delete_allocation(conn: &Connection, id: Uuid) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM allocations WHERE id = ?1", params![id])
}

// ---------------------------------------------------------------------------
// Constraints

const CONSTRAINT_COLUMNS: &str = "id, allocation_id, resource_type, resource_type_id, constraint_type, constraint_value, derived_resource_id, created_by, created, updated";

fn constraint_from_row(row: &Row<'_>) -> rusqlite::Result<AllocationConstraint> {
    Ok(AllocationConstraint {
        id: row.get(0)?,
        allocation_id: row.get(1)?,
        resource_type: text_col(row, 2)?,
        resource_type_id: row.get(3)?,
        constraint_type: text_col(row, 4)?,
        constraint_value: row.get(5)?,
        derived_resource_id: row.get(6)?,
        created_by: row.get(7)?,
        created: row.get(8)?,
        updated: row.get(9)?,
    })
}

pub fn insert_constraint(conn: &Connection, c: &AllocationConstraint) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO allocation_constraints (id, allocation_id, resource_type, resource_type_id, constraint_type, constraint_value, derived_resource_id, created_by, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            c.id,
            c.allocation_id,
            c.resource_type.as_str(),
            c.resource_type_id,
            c.constraint_type.as_str(),
            c.constraint_value,
            c.derived_resource_id,
            c.created_by,
            c.created,
            c.updated
        ],
    )?;
    Ok(())
}

pub fn get_constraint(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<AllocationConstraint>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM allocation_constraints WHERE id = ?1",
            CONSTRAINT_COLUMNS
        ),
        params![id],
        constraint_from_row,
    )
    .optional()
}

pub fn constraints_for(
    conn: &Connection,
    allocation_id: Uuid,
) -> rusqlite::Result<Vec<AllocationConstraint>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM allocation_constraints WHERE allocation_id = ?1 ORDER BY created, rowid",
        CONSTRAINT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![allocation_id], constraint_from_row)?;
    rows.collect()
}

pub fn update_constraint_value(
    conn: &Connection,
    id: Uuid,
    value: i64,
    updated: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE allocation_constraints SET constraint_value = ?2, updated = ?3 WHERE id = ?1",
        params![id, value, updated],
    )
}

pub fn delete_constraints_for(conn: &Connection, allocation_id: Uuid) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM allocation_constraints WHERE allocation_id = ?1",
        params![allocation_id],
    )
}

/// Sum of Reserved values across every constraint drawing on the Instance Type
pub fn reserved_total(conn: &Connection, instance_type_id: Uuid) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(constraint_value), 0) FROM allocation_constraints
         WHERE resource_type = 'InstanceType' AND constraint_type = 'Reserved' AND resource_type_id = ?1",
        params![instance_type_id],
        |row| row.get(0),
    )
}

/// Constraints that carved a child from the parent block
pub fn constraints_on_block(
    conn: &Connection,
    ip_block_id: Uuid,
) -> rusqlite::Result<Vec<AllocationConstraint>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM allocation_constraints WHERE resource_type = 'IPBlock' AND resource_type_id = ?1",
        CONSTRAINT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![ip_block_id], constraint_from_row)?;
    rows.collect()
}

// ---------------------------------------------------------------------------
// IP blocks

const IP_BLOCK_COLUMNS: &str = "id, name, site_id, provider_id, tenant_id, routing_type, prefix, protocol_version, status, full_grant, created, description";

fn ip_block_from_row(row: &Row<'_>) -> rusqlite::Result<IpBlock> {
    Ok(IpBlock {
        id: row.get(0)?,
        name: row.get(1)?,
        site_id: row.get(2)?,
        provider_id: row.get(3)?,
        tenant_id: row.get(4)?,
        routing_type: text_col(row, 5)?,
        prefix: text_col(row, 6)?,
        protocol_version: text_col(row, 7)?,
        status: text_col(row, 8)?,
        full_grant: row.get(9)?,
        created: row.get(10)?,
        description: row.get(11)?,
    })
}

pub fn insert_ip_block(conn: &Connection, b: &IpBlock) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ip_blocks (id, name, site_id, provider_id, tenant_id, routing_type, prefix, protocol_version, status, full_grant, created, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            b.id,
            b.name,
            b.site_id,
            b.provider_id,
            b.tenant_id,
            b.routing_type.as_str(),
            b.prefix.to_string(),
            b.protocol_version.as_str(),
            b.status.as_str(),
            b.full_grant,
            b.created,
            b.description
        ],
    )?;
    Ok(())
}

pub fn get_ip_block(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<IpBlock>> {
    conn.query_row(
        &format!("SELECT {} FROM ip_blocks WHERE id = ?1", IP_BLOCK_COLUMNS),
        params![id],
        ip_block_from_row,
    )
    .optional()
}

pub fn update_ip_block_prefix(conn: &Connection, id: Uuid, prefix: IpNet) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE ip_blocks SET prefix = ?2 WHERE id = ?1",
        params![id, prefix.to_string()],
    )
}

/// Rename a block, optionally replacing its description
pub fn rename_ip_block(
    conn: &Connection,
    id: Uuid,
    name: &str,
    description: Option<&str>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE ip_blocks SET name = ?2, description = COALESCE(?3, description) WHERE id = ?1",
        params![id, name, description],
    )
}

pub fn set_full_grant(conn: &Connection, id: Uuid, full_grant: bool) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE ip_blocks SET full_grant = ?2 WHERE id = ?1",
        params![id, full_grant],
    )
}

pub fn delete_ip_block(conn: &Connection, id: Uuid) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM ip_blocks WHERE id = ?1", params![id])
}

// ---------------------------------------------------------------------------
// Tenant-site associations

pub fn get_tenant_site(
    conn: &Connection,
    tenant_id: Uuid,
    site_id: Uuid,
) -> rusqlite::Result<Option<TenantSite>> {
    conn.query_row(
        "SELECT id, tenant_id, site_id, created_by, created FROM tenant_sites WHERE tenant_id = ?1 AND site_id = ?2",
        params![tenant_id, site_id],
        |row| {
            Ok(TenantSite {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                site_id: row.get(2)?,
                created_by: row.get(3)?,
                created: row.get(4)?,
            })
        },
    )
    .optional()
}

pub fn insert_tenant_site(conn: &Connection, ts: &TenantSite) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tenant_sites (id, tenant_id, site_id, created_by, created) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![ts.id, ts.tenant_id, ts.site_id, ts.created_by, ts.created],
    )?;
    Ok(())
}

pub fn delete_tenant_site(conn: &Connection, tenant_id: Uuid, site_id: Uuid) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM tenant_sites WHERE tenant_id = ?1 AND site_id = ?2",
        params![tenant_id, site_id],
    )
}

// ---------------------------------------------------------------------------
// Status details

pub fn insert_status_detail(conn: &Connection, d: &StatusDetail) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO status_details (id, entity_id, status, message, created) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![d.id, d.entity_id, d.status, d.message, d.created],
    )?;
    Ok(())
}

pub fn status_details_for(conn: &Connection, entity_id: Uuid) -> rusqlite::Result<Vec<StatusDetail>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_id, status, message, created FROM status_details WHERE entity_id = ?1 ORDER BY created, rowid",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| {
        Ok(StatusDetail {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            status: row.get(2)?,
            message: row.get(3)?,
            created: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn delete_status_details(conn: &Connection, entity_id: Uuid) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM status_details WHERE entity_id = ?1",
        params![entity_id],
    )
}

// ---------------------------------------------------------------------------
// Dependents

/// Instances running under one constraint of an allocation
pub fn count_instances(
    conn: &Connection,
    allocation_id: Uuid,
    constraint_id: Uuid,
    tenant_id: Uuid,
    provider_id: Uuid,
    instance_type_id: Uuid,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM instances
         WHERE allocation_id = ?1 AND allocation_constraint_id = ?2 AND tenant_id = ?3
           AND provider_id = ?4 AND instance_type_id = ?5",
        params![allocation_id, constraint_id, tenant_id, provider_id, instance_type_id],
        |row| row.get(0),
    )
}

/// Subnets of the tenant built on the block, matched by protocol-specific column
pub fn count_subnets(
    conn: &Connection,
    tenant_id: Uuid,
    ip_block_id: Uuid,
    protocol: ProtocolVersion,
) -> rusqlite::Result<i64> {
    let sql = match protocol {
        ProtocolVersion::V4 => "SELECT COUNT(*) FROM subnets WHERE tenant_id = ?1 AND ipv4_block_id = ?2",
        ProtocolVersion::V6 => "SELECT COUNT(*) FROM subnets WHERE tenant_id = ?1 AND ipv6_block_id = ?2",
    };
    conn.query_row(sql, params![tenant_id, ip_block_id], |row| row.get(0))
}

// ---------------------------------------------------------------------------
// Inventory and seeding

pub fn insert_site(conn: &Connection, s: &Site) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sites (id, name, provider_id) VALUES (?1, ?2, ?3)",
        params![s.id, s.name, s.provider_id],
    )?;
    Ok(())
}

pub fn get_site(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Site>> {
    conn.query_row(
        "SELECT id, name, provider_id FROM sites WHERE id = ?1",
        params![id],
        |row| {
            Ok(Site {
                id: row.get(0)?,
                name: row.get(1)?,
                provider_id: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn insert_tenant(conn: &Connection, t: &Tenant) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tenants (id, org, org_display_name) VALUES (?1, ?2, ?3)",
        params![t.id, t.org, t.org_display_name],
    )?;
    Ok(())
}

pub fn get_tenant(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Tenant>> {
    conn.query_row(
        "SELECT id, org, org_display_name FROM tenants WHERE id = ?1",
        params![id],
        |row| {
            Ok(Tenant {
                id: row.get(0)?,
                org: row.get(1)?,
                org_display_name: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn insert_instance_type(conn: &Connection, it: &InstanceType) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO instance_types (id, name, provider_id, site_id) VALUES (?1, ?2, ?3, ?4)",
        params![it.id, it.name, it.provider_id, it.site_id],
    )?;
    Ok(())
}

pub fn get_instance_type(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<InstanceType>> {
    conn.query_row(
        "SELECT id, name, provider_id, site_id FROM instance_types WHERE id = ?1",
        params![id],
        |row| {
            Ok(InstanceType {
                id: row.get(0)?,
                name: row.get(1)?,
                provider_id: row.get(2)?,
                site_id: row.get(3)?,
            })
        },
    )
    .optional()
}

pub fn insert_machine(
    conn: &Connection,
    id: Uuid,
    site_id: Uuid,
    instance_type_id: Option<Uuid>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO machines (id, site_id, instance_type_id, created) VALUES (?1, ?2, ?3, ?4)",
        params![id, site_id, instance_type_id, Utc::now()],
    )?;
    Ok(())
}

/// Instance Type of a machine; `None` when the machine does not exist
pub fn machine_instance_type(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Option<Uuid>>> {
    conn.query_row(
        "SELECT instance_type_id FROM machines WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
}

pub fn delete_machine(conn: &Connection, id: Uuid) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM machines WHERE id = ?1", params![id])
}

pub fn count_machines(conn: &Connection, instance_type_id: Uuid) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM machines WHERE instance_type_id = ?1",
        params![instance_type_id],
        |row| row.get(0),
    )
}

/// Instance row as the external instance handler would create it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub name: String,
    pub allocation_id: Uuid,
    pub allocation_constraint_id: Uuid,
    pub tenant_id: Uuid,
    pub provider_id: Uuid,
    pub instance_type_id: Uuid,
}

pub fn insert_instance(conn: &Connection, i: &InstanceRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO instances (id, name, allocation_id, allocation_constraint_id, tenant_id, provider_id, instance_type_id, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            i.id,
            i.name,
            i.allocation_id,
            i.allocation_constraint_id,
            i.tenant_id,
            i.provider_id,
            i.instance_type_id,
            Utc::now()
        ],
    )?;
    Ok(())
}

pub fn delete_instance(conn: &Connection, id: Uuid) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM instances WHERE id = ?1", params![id])
}

/// Subnet row as the external subnet handler would create it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub id: Uuid,
    pub name: String,
    pub tenant_id: Uuid,
    pub ipv4_block_id: Option<Uuid>,
    pub ipv6_block_id: Option<Uuid>,
}

pub fn insert_subnet(conn: &Connection, s: &SubnetRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO subnets (id, name, tenant_id, ipv4_block_id, ipv6_block_id, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![s.id, s.name, s.tenant_id, s.ipv4_block_id, s.ipv6_block_id, Utc::now()],
    )?;
    Ok(())
}

pub fn delete_subnet(conn: &Connection, id: Uuid) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM subnets WHERE id = ?1", params![id])
}
