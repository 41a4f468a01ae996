//! Benchmarks for allocation create/delete and prefix carving

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ipnet::IpNet;
use rusqlite::Connection;
use site_allocator::core::prefix::range;
use site_allocator::core::prefix::{PrefixStore, SqlPrefixStore};
use site_allocator::core::store::schema;
use site_allocator::{
    AllocationEngine, ConstraintRequest, ConstraintType, CreateAllocationRequest, EngineConfig,
    LockCoordinator, NewIpBlock, RequestContext, ResourceType, RoutingType,
};
use tempfile::TempDir;
use uuid::Uuid;

fn benchmark_first_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefix_first_fit");
    let parent: IpNet = "10.0.0.0/16".parse().unwrap();

    for acquired in [16usize, 128, 255].iter() {
        let children: Vec<IpNet> = (0..*acquired)
            .map(|i| format!("10.0.{}.0/24", i).parse().unwrap())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(acquired), &children, |b, children| {
            b.iter(|| black_box(range::first_fit(&parent, black_box(children), 24)));
        });
    }

    group.finish();
}

fn benchmark_carve_release(c: &mut Criterion) {
    let conn = Connection::open_in_memory().unwrap();
    schema::create(&conn).unwrap();
    let parent: IpNet = "10.0.0.0/16".parse().unwrap();
    SqlPrefixStore.create_prefix(&conn, "bench", parent).unwrap();

    c.bench_function("prefix_carve_release", |b| {
        b.iter(|| {
            let child = SqlPrefixStore.carve_child(&conn, "bench", parent, 26).unwrap();
            SqlPrefixStore.release_child(&conn, "bench", parent, child).unwrap();
        });
    });
}

fn benchmark_create_delete(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = AllocationEngine::builder()
        .config(EngineConfig::with_database(dir.path().join("bench.db")))
        .locks(LockCoordinator::new())
        .build()
        .unwrap();

    let ctx = RequestContext::new(Uuid::new_v4());
    let provider = Uuid::new_v4();
    let site = engine.add_site(&ctx, "bench-site", provider).unwrap();
    let tenant = engine.add_tenant(&ctx, "bench-org", None).unwrap();
    let it = engine
        .add_instance_type(&ctx, "bench.small", provider, Some(site.id))
        .unwrap();
    for _ in 0..64 {
        engine.add_machine(&ctx, site.id, Some(it.id)).unwrap();
    }
    let block = engine
        .add_ip_block(
            &ctx,
            provider,
            &NewIpBlock {
                name: "bench-v4".into(),
                site_id: site.id,
                routing_type: RoutingType::DatacenterOnly,
                prefix: "10.64.0.0/16".parse().unwrap(),
            },
        )
        .unwrap();

    // Keep one allocation so create/delete never toggles the tenant site
    let anchor = CreateAllocationRequest {
        name: "anchor".into(),
        description: None,
        tenant_id: tenant.id,
        site_id: site.id,
        constraints: vec![ConstraintRequest {
            resource_type: ResourceType::InstanceType,
            resource_type_id: it.id,
            constraint_type: ConstraintType::Reserved,
            constraint_value: 1,
        }],
    };
    engine.create_allocation(&ctx, provider, &anchor).unwrap();

    let req = CreateAllocationRequest {
        name: "bench".into(),
        description: None,
        tenant_id: tenant.id,
        site_id: site.id,
        constraints: vec![
            ConstraintRequest {
                resource_type: ResourceType::InstanceType,
                resource_type_id: it.id,
                constraint_type: ConstraintType::Reserved,
                constraint_value: 4,
            },
            ConstraintRequest {
                resource_type: ResourceType::IpBlock,
                resource_type_id: block.id,
                constraint_type: ConstraintType::Reserved,
                constraint_value: 26,
            },
        ],
    };

    c.bench_function("allocation_create_delete", |b| {
        b.iter(|| {
            let created = engine.create_allocation(&ctx, provider, &req).unwrap();
            engine
                .delete_allocation(&ctx, provider, created.allocation.id)
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_first_fit,
    benchmark_carve_release,
    benchmark_create_delete
);
criterion_main!(benches);
