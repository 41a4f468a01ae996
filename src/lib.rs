//! # Site Allocator
//!
//! Transactional allocation and admission engine for bare-metal sites.
//!
//! A tenant reserves resources at a site through an *allocation*: a named set
//! of constraints, each drawing either machines of an Instance Type or a child
//! prefix carved from a provider IP Block. The engine guarantees that:
//!
//! - Reserved machines of an Instance Type never exceed the eligible machines
//! - Carved prefixes never overlap and always fall inside their parent
//! - A tenant is associated with a site exactly while it holds an allocation
//!   there, and the orchestration backend hears about every transition
//! - Every operation is all-or-nothing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use site_allocator::{
//!     AllocationEngine, ConstraintRequest, ConstraintType, CreateAllocationRequest,
//!     EngineConfig, RequestContext, ResourceType, Result,
//! };
//! use uuid::Uuid;
//!
//! # fn main() -> Result<()> {
//! let engine = AllocationEngine::open(EngineConfig::with_database("alloc.db"))?;
//! let ctx = RequestContext::new(Uuid::new_v4());
//!
//! let provider = Uuid::new_v4();
//! let site = engine.add_site(&ctx, "dc-1", provider)?;
//! let tenant = engine.add_tenant(&ctx, "acme", Some("Acme Corp"))?;
//! let gpu = engine.add_instance_type(&ctx, "gpu.large", provider, Some(site.id))?;
//! for _ in 0..4 {
//!     engine.add_machine(&ctx, site.id, Some(gpu.id))?;
//! }
//!
//! let created = engine.create_allocation(
//!     &ctx,
//!     provider,
//!     &CreateAllocationRequest {
//!         name: "training".into(),
//!         description: None,
//!         tenant_id: tenant.id,
//!         site_id: site.id,
//!         constraints: vec![ConstraintRequest {
//!             resource_type: ResourceType::InstanceType,
//!             resource_type_id: gpu.id,
//!             constraint_type: ConstraintType::Reserved,
//!             constraint_value: 2,
//!         }],
//!     },
//! )?;
//! assert_eq!(engine.reserved_total(gpu.id)?, 2);
//!
//! engine.delete_allocation(&ctx, provider, created.allocation.id)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See [`EngineConfig`]. Notifier failures are queued in the workflow outbox
//! by default and replayed with [`AllocationEngine::drain_outbox`].

pub mod config;
pub mod core;
pub mod error;

pub use crate::config::{EngineConfig, FailurePolicy, NotifierConfig};
pub use crate::core::{
    admission::Admission,
    engine::{AllocationEngine, Deletion, EngineBuilder, NewIpBlock, RequestContext},
    inventory::{Inventory, SqlInventory},
    lock::LockCoordinator,
    model::{
        Allocation, AllocationConstraint, AllocationDetail, AllocationStatus, ConstraintType,
        InstanceType, IpBlock, IpBlockStatus, ProtocolVersion, ResourceType, RoutingType, Site,
        StatusDetail, Tenant, TenantSite,
    },
    notifier::{
        Delivery, DrainReport, LoggingNotifier, NotifierError, OrchestrationNotifier,
        OutboxEntry, WorkflowReceipt, CREATE_TENANT, DELETE_TENANT,
    },
    prefix::{PrefixStore, SqlPrefixStore, Usage},
    store::dao::{AllocationFilter, InstanceRecord, SubnetRecord},
    validation::{
        AllocationName, ConstraintRequest, CreateAllocationRequest, UpdateAllocationRequest,
        UpdateConstraintRequest,
    },
};
pub use crate::error::{AllocError, ErrorKind, Result};
