//! Allocation Engine
//!
//! Each mutating operation runs in exactly one [`StoreTx`]: resolve and
//! validate the request on a read connection, open the transaction, take the
//! advisory locks, check admission and carve prefixes, write rows, reconcile
//! the tenant-site association, commit. Any error drops the transaction, which
//! rolls back every row and carved prefix and releases the locks.

mod catalog;
mod create;
mod delete;
mod update;

pub use catalog::NewIpBlock;
pub use delete::Deletion;

use crate::config::{EngineConfig, FailurePolicy};
use crate::core::admission::{Admission, AdmissionChecker};
use crate::core::inventory::{Inventory, SqlInventory};
use crate::core::ipam;
use crate::core::lock::LockCoordinator;
use crate::core::model::{AllocationDetail, StatusDetail, Tenant, TenantSite};
use crate::core::notifier::{
    idempotency_key, outbox, Delivery, DrainReport, LoggingNotifier, OrchestrationNotifier,
    OutboxEntry, TenantMetadata, TenantWorkflowPayload,
};
use crate::core::prefix::{PrefixStore, SqlPrefixStore, Usage};
use crate::core::store::dao::{self, AllocationFilter};
use crate::core::store::{Store, StoreTx};
use crate::error::{AllocError, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Caller identity and deadline of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// User recorded as creator of new rows
    pub actor: Uuid,
    /// Transaction is rolled back once this passes
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(actor: Uuid) -> Self {
        RequestContext {
            actor,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The allocation and admission engine
pub struct AllocationEngine {
    store: Store,
    config: EngineConfig,
    notifier: Arc<dyn OrchestrationNotifier>,
    prefixes: Arc<dyn PrefixStore>,
    admission: AdmissionChecker,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    /// Open with SQL-backed collaborators and a logging notifier
    pub fn open(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the request's transaction, falling back to the configured timeout
    fn begin(&self, ctx: &RequestContext) -> Result<StoreTx> {
        let deadline = ctx
            .deadline
            .unwrap_or_else(|| Instant::now() + self.config.request_timeout());
        self.store.begin(Some(deadline))
    }

    fn read(&self) -> Result<Connection> {
        self.store.connect()
    }

    // -----------------------------------------------------------------------
    // Reads

    /// Allocation with its constraints
    pub fn get_allocation(&self, id: Uuid) -> Result<AllocationDetail> {
        let conn = self.read()?;
        let allocation =
            dao::get_allocation(&conn, id)?.ok_or_else(|| AllocError::not_found("Allocation", id))?;
        let constraints = dao::constraints_for(&conn, id)?;
        Ok(AllocationDetail {
            allocation,
            constraints,
        })
    }

    pub fn list_allocations(&self, filter: &AllocationFilter) -> Result<Vec<AllocationDetail>> {
        let conn = self.read()?;
        dao::list_allocations(&conn, filter)?
            .into_iter()
            .map(|allocation| {
                let constraints = dao::constraints_for(&conn, allocation.id)?;
                Ok(AllocationDetail {
                    allocation,
                    constraints,
                })
            })
            .collect()
    }

    /// Prefix usage of a parent IP Block
    pub fn block_usage(&self, ip_block_id: Uuid) -> Result<Usage> {
        let conn = self.read()?;
        let block = dao::get_ip_block(&conn, ip_block_id)?
            .ok_or_else(|| AllocError::not_found("IPBlock", ip_block_id))?;
        ipam::usage_for_block(self.prefixes.as_ref(), &conn, &block)
    }

    /// Current Reserved total of an Instance Type
    pub fn reserved_total(&self, instance_type_id: Uuid) -> Result<i64> {
        let conn = self.read()?;
        Ok(dao::reserved_total(&conn, instance_type_id)?)
    }

    /// Unlocked admission view, for diagnostics only
    pub fn admission_snapshot(&self, instance_type_id: Uuid, requested: i64) -> Result<Admission> {
        let conn = self.read()?;
        let instance_type = dao::get_instance_type(&conn, instance_type_id)?
            .ok_or_else(|| AllocError::not_found("InstanceType", instance_type_id))?;
        self.admission.snapshot(&conn, &instance_type, requested)
    }

    /// Whether reservations still fit after removing machines from the type
    pub fn check_capacity_after_removal(
        &self,
        instance_type_id: Uuid,
        machines_removed: i64,
    ) -> Result<Admission> {
        let conn = self.read()?;
        let instance_type = dao::get_instance_type(&conn, instance_type_id)?
            .ok_or_else(|| AllocError::not_found("InstanceType", instance_type_id))?;
        self.admission
            .check_capacity_after_removal(&conn, &instance_type, machines_removed)
    }

    pub fn tenant_site(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Option<TenantSite>> {
        let conn = self.read()?;
        Ok(dao::get_tenant_site(&conn, tenant_id, site_id)?)
    }

    pub fn status_details(&self, entity_id: Uuid) -> Result<Vec<StatusDetail>> {
        let conn = self.read()?;
        Ok(dao::status_details_for(&conn, entity_id)?)
    }

    pub fn pending_workflows(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.read()?;
        outbox::pending(&conn)
    }

    // -----------------------------------------------------------------------
    // Notifier

    /// Send a tenant workflow, or queue it per the path's failure policy
    fn notify(
        &self,
        tx: &StoreTx,
        workflow: &str,
        tenant: &Tenant,
        site_id: Uuid,
        policy: FailurePolicy,
    ) -> Result<Delivery> {
        let key = idempotency_key(workflow, tenant.id, site_id);
        let payload = serde_json::to_value(TenantWorkflowPayload {
            organization_id: tenant.org.clone(),
            tenant_id: tenant.id,
            site_id,
            task_queue: self.config.notifier.site_task_queue.clone(),
            metadata: TenantMetadata {
                name: tenant.display_name().to_string(),
            },
        })?;

        if outbox::has_pending(tx.conn(), tenant.id, site_id)? {
            outbox::enqueue(tx.conn(), workflow, &key, tenant.id, site_id, &payload, None)?;
            info!(workflow, tenant_id = %tenant.id, site_id = %site_id, "workflow queued behind pending calls");
            return Ok(Delivery::Queued);
        }

        match self.notifier.execute_workflow(workflow, &key, &payload) {
            Ok(receipt) => {
                info!(workflow, tenant_id = %tenant.id, site_id = %site_id, run_id = %receipt.run_id, "workflow started");
                Ok(Delivery::Sent(receipt))
            }
            Err(e) => match policy {
                FailurePolicy::Abort => {
                    error!(workflow, tenant_id = %tenant.id, site_id = %site_id, error = %e, "workflow failed, aborting");
                    Err(e.into())
                }
                FailurePolicy::Enqueue => {
                    warn!(workflow, tenant_id = %tenant.id, site_id = %site_id, error = %e, "workflow failed, queued for retry");
                    outbox::enqueue(
                        tx.conn(),
                        workflow,
                        &key,
                        tenant.id,
                        site_id,
                        &payload,
                        Some(&e.to_string()),
                    )?;
                    Ok(Delivery::Queued)
                }
            },
        }
    }

    /// Replay queued workflows in order
    ///
    /// Stops at the first failure so calls for one tenant-site pair are never
    /// delivered out of order.
    pub fn drain_outbox(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let conn = self.read()?;

        for entry in outbox::pending(&conn)? {
            match self
                .notifier
                .execute_workflow(&entry.workflow, &entry.idempotency_key, &entry.payload)
            {
                Ok(receipt) => {
                    report.delivered += 1;
                    info!(workflow = %entry.workflow, idempotency_key = %entry.idempotency_key, run_id = %receipt.run_id, "queued workflow delivered");
                    if outbox::mark_delivered(&conn, entry.id, entry.seq)? == 0 {
                        debug!(workflow = %entry.workflow, idempotency_key = %entry.idempotency_key, "workflow queued again during delivery, kept");
                    }
                }
                Err(e) => {
                    outbox::record_failure(&conn, entry.id, &e.to_string())?;
                    report.failed += 1;
                    warn!(workflow = %entry.workflow, idempotency_key = %entry.idempotency_key, attempts = entry.attempts + 1, error = %e, "queued workflow failed");
                    break;
                }
            }
        }

        report.remaining = outbox::count(&conn)?;
        Ok(report)
    }
}

fn status_detail(entity_id: Uuid, status: &str, message: &str) -> StatusDetail {
    StatusDetail {
        id: Uuid::new_v4(),
        entity_id,
        status: status.to_string(),
        message: Some(message.to_string()),
        created: Utc::now(),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Builder for [`AllocationEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    notifier: Option<Arc<dyn OrchestrationNotifier>>,
    inventory: Option<Arc<dyn Inventory>>,
    prefixes: Option<Arc<dyn PrefixStore>>,
    locks: Option<LockCoordinator>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            config: EngineConfig::default(),
            notifier: None,
            inventory: None,
            prefixes: None,
            locks: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn OrchestrationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn prefix_store(mut self, prefixes: Arc<dyn PrefixStore>) -> Self {
        self.prefixes = Some(prefixes);
        self
    }

    /// Use a dedicated lock table instead of the process-wide one
    pub fn locks(mut self, locks: LockCoordinator) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> Result<AllocationEngine> {
        let store = match self.locks {
            Some(locks) => Store::open_with_locks(&self.config, locks)?,
            None => Store::open(&self.config)?,
        };
        let inventory = self
            .inventory
            .unwrap_or_else(|| Arc::new(SqlInventory) as Arc<dyn Inventory>);

        info!(path = %store.path().display(), "allocation engine ready");

        Ok(AllocationEngine {
            store,
            config: self.config,
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(LoggingNotifier) as Arc<dyn OrchestrationNotifier>),
            prefixes: self
                .prefixes
                .unwrap_or_else(|| Arc::new(SqlPrefixStore) as Arc<dyn PrefixStore>),
            admission: AdmissionChecker::new(inventory),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
