//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use site_allocator::{
    AllocationEngine, ConstraintRequest, ConstraintType, CreateAllocationRequest, EngineConfig,
    InstanceType, IpBlock, LockCoordinator, NewIpBlock, NotifierError, OrchestrationNotifier,
    RequestContext, ResourceType, RoutingType, Site, Tenant, WorkflowReceipt,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

type Hook = Box<dyn FnOnce() + Send>;

/// Notifier that records calls and can be switched off
#[derive(Default)]
pub struct RecordingNotifier {
    down: AtomicBool,
    calls: Mutex<Vec<(String, String)>>,
    hook: Mutex<Option<Hook>>,
}

impl RecordingNotifier {
    /// Run `f` while the next successful call is in flight
    pub fn on_next_call(&self, f: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(f));
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delivered `(workflow, idempotency key)` pairs in order
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn workflows(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(w, _)| w.clone()).collect()
    }
}

impl OrchestrationNotifier for RecordingNotifier {
    fn execute_workflow(
        &self,
        workflow: &str,
        idempotency_key: &str,
        _payload: &serde_json::Value,
    ) -> Result<WorkflowReceipt, NotifierError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(NotifierError::Unavailable("backend down".into()));
        }
        let hook = self.hook.lock().take();
        if let Some(f) = hook {
            f();
        }
        self.calls
            .lock()
            .push((workflow.to_string(), idempotency_key.to_string()));
        Ok(WorkflowReceipt {
            workflow: workflow.to_string(),
            idempotency_key: idempotency_key.to_string(),
            run_id: Uuid::new_v4().to_string(),
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: AllocationEngine,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: RequestContext,
    pub provider: Uuid,
    pub site: Site,
    pub tenant: Tenant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_database(dir.path().join("alloc.db"));
        adjust(&mut config);

        let notifier = Arc::new(RecordingNotifier::default());
        let engine = AllocationEngine::builder()
            .config(config)
            .notifier(notifier.clone())
            .locks(LockCoordinator::new())
            .build()
            .unwrap();

        let ctx = RequestContext::new(Uuid::new_v4());
        let provider = Uuid::new_v4();
        let site = engine.add_site(&ctx, "site-a", provider).unwrap();
        let tenant = engine.add_tenant(&ctx, "acme", Some("Acme Corp")).unwrap();

        Harness {
            dir,
            engine,
            notifier,
            ctx,
            provider,
            site,
            tenant,
        }
    }

    /// Instance Type on the harness site with `machines` eligible machines
    pub fn instance_type(&self, machines: usize) -> InstanceType {
        let it = self
            .engine
            .add_instance_type(&self.ctx, "gpu.large", self.provider, Some(self.site.id))
            .unwrap();
        for _ in 0..machines {
            self.engine
                .add_machine(&self.ctx, self.site.id, Some(it.id))
                .unwrap();
        }
        it
    }

    pub fn ip_block(&self, cidr: &str) -> IpBlock {
        self.engine
            .add_ip_block(
                &self.ctx,
                self.provider,
                &NewIpBlock {
                    name: format!("block-{}", cidr),
                    site_id: self.site.id,
                    routing_type: RoutingType::DatacenterOnly,
                    prefix: cidr.parse().unwrap(),
                },
            )
            .unwrap()
    }

    pub fn request(&self, name: &str, constraints: Vec<ConstraintRequest>) -> CreateAllocationRequest {
        CreateAllocationRequest {
            name: name.to_string(),
            description: None,
            tenant_id: self.tenant.id,
            site_id: self.site.id,
            constraints,
        }
    }
}

pub fn reserve(instance_type: &InstanceType, count: i64) -> ConstraintRequest {
    ConstraintRequest {
        resource_type: ResourceType::InstanceType,
        resource_type_id: instance_type.id,
        constraint_type: ConstraintType::Reserved,
        constraint_value: count,
    }
}

pub fn carve(block: &IpBlock, length: i64) -> ConstraintRequest {
    ConstraintRequest {
        resource_type: ResourceType::IpBlock,
        resource_type_id: block.id,
        constraint_type: ConstraintType::Reserved,
        constraint_value: length,
    }
}
