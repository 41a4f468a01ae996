//! Relational schema
//!
//! Ids are UUID blobs, timestamps are ISO 8601 text. Unique indexes back the
//! invariants the engine checks under lock, so a missed check still fails the
//! transaction instead of committing a duplicate.

use rusqlite::Connection;

/// Bumped whenever a table or index changes
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
    id              BLOB PRIMARY KEY,
    name            TEXT NOT NULL,
    provider_id     BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS tenants (
    id                  BLOB PRIMARY KEY,
    org                 TEXT NOT NULL UNIQUE,
    org_display_name    TEXT
);

CREATE TABLE IF NOT EXISTS instance_types (
    id              BLOB PRIMARY KEY,
    name            TEXT NOT NULL,
    provider_id     BLOB NOT NULL,
    site_id         BLOB REFERENCES sites(id)
);

CREATE TABLE IF NOT EXISTS machines (
    id                  BLOB PRIMARY KEY,
    site_id             BLOB NOT NULL REFERENCES sites(id),
    instance_type_id    BLOB REFERENCES instance_types(id),
    created             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS machines_instance_type ON machines(instance_type_id);

CREATE TABLE IF NOT EXISTS ip_blocks (
    id                  BLOB PRIMARY KEY,
    name                TEXT NOT NULL,
    description         TEXT,
    site_id             BLOB NOT NULL REFERENCES sites(id),
    provider_id         BLOB NOT NULL,
    tenant_id           BLOB,
    routing_type        TEXT NOT NULL,
    prefix              TEXT NOT NULL,
    protocol_version    TEXT NOT NULL,
    status              TEXT NOT NULL,
    full_grant          INTEGER NOT NULL DEFAULT 0,
    created             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS allocations (
    id              BLOB PRIMARY KEY,
    name            TEXT NOT NULL,
    description     TEXT,
    status          TEXT NOT NULL,
    provider_id     BLOB NOT NULL,
    tenant_id       BLOB NOT NULL REFERENCES tenants(id),
    site_id         BLOB NOT NULL REFERENCES sites(id),
    created_by      BLOB NOT NULL,
    created         TEXT NOT NULL,
    updated         TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS allocations_tenant_site_name
    ON allocations(tenant_id, site_id, name);

CREATE TABLE IF NOT EXISTS allocation_constraints (
    id                      BLOB PRIMARY KEY,
    allocation_id           BLOB NOT NULL REFERENCES allocations(id),
    resource_type           TEXT NOT NULL,
    resource_type_id        BLOB NOT NULL,
    constraint_type         TEXT NOT NULL,
    constraint_value        INTEGER NOT NULL,
    derived_resource_id     BLOB,
    created_by              BLOB NOT NULL,
    created                 TEXT NOT NULL,
    updated                 TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS allocation_constraints_resource
    ON allocation_constraints(allocation_id, resource_type, resource_type_id);
CREATE INDEX IF NOT EXISTS allocation_constraints_type
    ON allocation_constraints(resource_type, resource_type_id);

CREATE TABLE IF NOT EXISTS tenant_sites (
    id              BLOB PRIMARY KEY,
    tenant_id       BLOB NOT NULL REFERENCES tenants(id),
    site_id         BLOB NOT NULL REFERENCES sites(id),
    created_by      BLOB NOT NULL,
    created         TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS tenant_sites_pair ON tenant_sites(tenant_id, site_id);

CREATE TABLE IF NOT EXISTS instances (
    id                          BLOB PRIMARY KEY,
    name                        TEXT NOT NULL,
    allocation_id               BLOB NOT NULL,
    allocation_constraint_id    BLOB NOT NULL,
    tenant_id                   BLOB NOT NULL,
    provider_id                 BLOB NOT NULL,
    instance_type_id            BLOB NOT NULL,
    created                     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS instances_constraint ON instances(allocation_constraint_id);

CREATE TABLE IF NOT EXISTS subnets (
    id              BLOB PRIMARY KEY,
    name            TEXT NOT NULL,
    tenant_id       BLOB NOT NULL,
    ipv4_block_id   BLOB,
    ipv6_block_id   BLOB,
    created         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS status_details (
    id          BLOB PRIMARY KEY,
    entity_id   BLOB NOT NULL,
    status      TEXT NOT NULL,
    message     TEXT,
    created     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS status_details_entity ON status_details(entity_id);

CREATE TABLE IF NOT EXISTS prefixes (
    namespace       TEXT NOT NULL,
    cidr            TEXT NOT NULL,
    parent_cidr     TEXT,
    body            TEXT NOT NULL,
    PRIMARY KEY (namespace, cidr)
);

CREATE TABLE IF NOT EXISTS workflow_outbox (
    id                  BLOB PRIMARY KEY,
    workflow            TEXT NOT NULL,
    idempotency_key     TEXT NOT NULL UNIQUE,
    seq                 INTEGER NOT NULL,
    tenant_id           BLOB NOT NULL,
    site_id             BLOB NOT NULL,
    payload             TEXT NOT NULL,
    attempts            INTEGER NOT NULL DEFAULT 0,
    last_error          TEXT,
    enqueued            TEXT NOT NULL,
    updated             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS workflow_outbox_pair ON workflow_outbox(tenant_id, site_id);
"#;

/// Create every table and index that does not exist yet
pub fn create(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Schema version recorded in the database file
pub fn version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
