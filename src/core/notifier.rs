//! Orchestration Notifier and workflow outbox
//!
//! The notifier propagates tenant creation and teardown to a remote site. A
//! call that fails on a path configured to enqueue is written to the
//! `workflow_outbox` table inside the same transaction, and
//! [`AllocationEngine::drain_outbox`](crate::AllocationEngine::drain_outbox)
//! replays it later with the original idempotency key.
//!
//! Calls for one tenant-site pair are delivered in order: while any call for
//! the pair is still queued, new calls queue behind it instead of going out
//! directly.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Workflow run when a tenant gets its first allocation on a site
pub const CREATE_TENANT: &str = "CreateTenant";

/// Workflow run when a tenant loses its last allocation on a site
pub const DELETE_TENANT: &str = "DeleteTenant";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifierError {
    /// Orchestration backend could not be reached
    #[error("orchestration backend unavailable: {0}")]
    Unavailable(String),

    /// Backend refused to start the workflow
    #[error("workflow {workflow} rejected: {reason}")]
    Rejected { workflow: String, reason: String },

    #[error("workflow {0} timed out")]
    Timeout(String),
}

/// Acknowledgement of a started workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReceipt {
    pub workflow: String,
    pub idempotency_key: String,
    pub run_id: String,
}

/// Starts workflows on the orchestration backend
pub trait OrchestrationNotifier: Send + Sync {
    fn execute_workflow(
        &self,
        workflow: &str,
        idempotency_key: &str,
        payload: &serde_json::Value,
    ) -> Result<WorkflowReceipt, NotifierError>;
}

/// Notifier that only logs; used where no orchestration backend exists
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl OrchestrationNotifier for LoggingNotifier {
    fn execute_workflow(
        &self,
        workflow: &str,
        idempotency_key: &str,
        payload: &serde_json::Value,
    ) -> Result<WorkflowReceipt, NotifierError> {
        let run_id = Uuid::new_v4().to_string();
        info!(workflow, idempotency_key, run_id = %run_id, payload = %payload, "workflow started");
        Ok(WorkflowReceipt {
            workflow: workflow.to_string(),
            idempotency_key: idempotency_key.to_string(),
            run_id,
        })
    }
}

/// Idempotency key for a tenant workflow on a site
pub fn idempotency_key(workflow: &str, tenant_id: Uuid, site_id: Uuid) -> String {
    format!("{}-{}-{}", workflow, tenant_id, site_id)
}

/// Display metadata sent to the site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMetadata {
    pub name: String,
}

/// Payload of the tenant workflows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantWorkflowPayload {
    pub organization_id: String,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub task_queue: String,
    pub metadata: TenantMetadata,
}

/// How a notification left the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(WorkflowReceipt),
    /// Written to the outbox for a later drain
    Queued,
}

/// One queued workflow call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub workflow: String,
    pub idempotency_key: String,
    /// Position in the queue; bumped when the same key is queued again
    pub seq: i64,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub payload: serde_json::Value,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub enqueued: DateTime<Utc>,
}

/// Result of one outbox drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub remaining: usize,
}

pub mod outbox {
    //! Rows of the `workflow_outbox` table

    use super::*;

    /// Queue a call; re-queuing the same key moves it to the back of the line
    pub fn enqueue(
        conn: &Connection,
        workflow: &str,
        idempotency_key: &str,
        tenant_id: Uuid,
        site_id: Uuid,
        payload: &serde_json::Value,
        error: Option<&str>,
    ) -> crate::error::Result<()> {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO workflow_outbox (id, workflow, idempotency_key, seq, tenant_id, site_id, payload, attempts, last_error, enqueued, updated)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM workflow_outbox), ?4, ?5, ?6, 0, ?7, ?8, ?8)
             ON CONFLICT(idempotency_key) DO UPDATE SET
                seq = excluded.seq,
                payload = excluded.payload,
                last_error = excluded.last_error,
                enqueued = excluded.enqueued,
                updated = excluded.updated",
            params![
                Uuid::new_v4(),
                workflow,
                idempotency_key,
                tenant_id,
                site_id,
                serde_json::to_string(payload)?,
                error,
                now
            ],
        )?;
        Ok(())
    }

    pub fn has_pending(conn: &Connection, tenant_id: Uuid, site_id: Uuid) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM workflow_outbox WHERE tenant_id = ?1 AND site_id = ?2)",
            params![tenant_id, site_id],
            |row| row.get(0),
        )
    }

    /// Queued calls, oldest first
    pub fn pending(conn: &Connection) -> crate::error::Result<Vec<OutboxEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, workflow, idempotency_key, seq, tenant_id, site_id, payload, attempts, last_error, enqueued
             FROM workflow_outbox ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Uuid>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Uuid>(4)?,
                row.get::<_, Uuid>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, DateTime<Utc>>(9)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, workflow, idempotency_key, seq, tenant_id, site_id, payload, attempts, last_error, enqueued) =
                row?;
            entries.push(OutboxEntry {
                id,
                workflow,
                idempotency_key,
                seq,
                tenant_id,
                site_id,
                payload: serde_json::from_str(&payload)?,
                attempts,
                last_error,
                enqueued,
            });
        }
        Ok(entries)
    }

    /// Remove a delivered call
    ///
    /// Only the queued call at `seq` is removed. A row queued again while the
    /// call was in flight has a newer `seq` and stays for the next drain, so
    /// this returns 0 for it.
    pub fn mark_delivered(conn: &Connection, id: Uuid, seq: i64) -> rusqlite::Result<usize> {
        conn.execute(
            "DELETE FROM workflow_outbox WHERE id = ?1 AND seq = ?2",
            params![id, seq],
        )
    }

    pub fn record_failure(conn: &Connection, id: Uuid, error: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE workflow_outbox SET attempts = attempts + 1, last_error = ?2, updated = ?3 WHERE id = ?1",
            params![id, error, Utc::now()],
        )
    }

    pub fn count(conn: &Connection) -> rusqlite::Result<usize> {
        conn.query_row("SELECT COUNT(*) FROM workflow_outbox", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create(&conn).unwrap();
        conn
    }

    #[test]
    fn test_idempotency_key() {
        let t = Uuid::new_v4();
        let s = Uuid::new_v4();
        assert_eq!(
            idempotency_key(CREATE_TENANT, t, s),
            format!("CreateTenant-{}-{}", t, s)
        );
    }

    #[test]
    fn test_logging_notifier_echoes_key() {
        let receipt = LoggingNotifier
            .execute_workflow(DELETE_TENANT, "k-1", &serde_json::json!({}))
            .unwrap();
        assert_eq!(receipt.workflow, DELETE_TENANT);
        assert_eq!(receipt.idempotency_key, "k-1");
    }

    #[test]
    fn test_outbox_ordering_and_requeue() {
        let conn = conn();
        let t = Uuid::new_v4();
        let s = Uuid::new_v4();
        let payload = serde_json::json!({"n": 1});

        outbox::enqueue(&conn, CREATE_TENANT, "create", t, s, &payload, Some("down")).unwrap();
        outbox::enqueue(&conn, DELETE_TENANT, "delete", t, s, &payload, None).unwrap();
        assert!(outbox::has_pending(&conn, t, s).unwrap());
        assert!(!outbox::has_pending(&conn, Uuid::new_v4(), s).unwrap());

        // Same key again moves behind the delete
        outbox::enqueue(&conn, CREATE_TENANT, "create", t, s, &payload, None).unwrap();
        let pending = outbox::pending(&conn).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].idempotency_key, "delete");
        assert_eq!(pending[1].idempotency_key, "create");

        outbox::record_failure(&conn, pending[0].id, "still down").unwrap();
        let pending = outbox::pending(&conn).unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("still down"));

        outbox::mark_delivered(&conn, pending[0].id, pending[0].seq).unwrap();
        assert_eq!(outbox::count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_requeued_call_survives_stale_delivery() {
        let conn = conn();
        let t = Uuid::new_v4();
        let s = Uuid::new_v4();
        let payload = serde_json::json!({});

        outbox::enqueue(&conn, CREATE_TENANT, "create", t, s, &payload, Some("down")).unwrap();
        let loaded = outbox::pending(&conn).unwrap().remove(0);

        // Queued again while the loaded copy is being delivered
        outbox::enqueue(&conn, CREATE_TENANT, "create", t, s, &payload, None).unwrap();

        assert_eq!(outbox::mark_delivered(&conn, loaded.id, loaded.seq).unwrap(), 0);
        let pending = outbox::pending(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, loaded.id);
        assert!(pending[0].seq > loaded.seq);

        assert_eq!(outbox::mark_delivered(&conn, pending[0].id, pending[0].seq).unwrap(), 1);
        assert_eq!(outbox::count(&conn).unwrap(), 0);
    }
}
