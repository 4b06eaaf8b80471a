//! Benchmark for the draw path.
//!
//! Run with: cargo bench --package reliquary_rewards --bench draw_benchmark

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use reliquary_rewards::{
    AllocationIdempotencyGuard, Campaign, CampaignPool, ContributionEvent, ContributionSource,
    EmissionTable, GachaAllocator, Item, MemoryStore, RarityResolver,
};

fn create_campaign() -> (Campaign, Vec<Item>) {
    let campaign = Campaign {
        id: 1,
        issuer_id: 1,
        starts_at: 0,
        ends_at: u64::MAX,
        emission_table: EmissionTable::new([(1, 60.0), (2, 20.0), (3, 10.0), (4, 8.0), (5, 2.0)])
            .unwrap(),
    };
    let items = (1..=5u32)
        .flat_map(|tier| {
            (0..4u64).map(move |n| Item {
                id: u64::from(tier) * 100 + n,
                campaign_id: 1,
                rarity: tier,
            })
        })
        .collect();
    (campaign, items)
}

fn benchmark_resolve(c: &mut Criterion) {
    let (campaign, _) = create_campaign();
    let resolver = RarityResolver::new(&campaign.emission_table);
    let mut rng = ChaCha20Rng::seed_from_u64(7);

    c.bench_function("resolve_tier", |b| {
        b.iter(|| black_box(resolver.resolve(&mut rng)));
    });
}

fn benchmark_allocate(c: &mut Criterion) {
    let (campaign, items) = create_campaign();
    let pool = CampaignPool::new(&campaign, &items);
    let allocator = GachaAllocator::new(100).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(7);

    let mut group = c.benchmark_group("allocate");
    group.throughput(Throughput::Elements(100));
    group.bench_function("100_draws", |b| {
        b.iter(|| black_box(allocator.allocate(&pool, black_box(10_000), &mut rng).unwrap()));
    });
    group.finish();
}

fn benchmark_guarded_allocation(c: &mut Criterion) {
    let (campaign, items) = create_campaign();
    let pool = CampaignPool::new(&campaign, &items);
    let guard = AllocationIdempotencyGuard::new(
        Arc::new(MemoryStore::new()),
        GachaAllocator::new(100).unwrap(),
    );
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let mut n = 0u64;

    c.bench_function("guarded_allocation_10_draws", |b| {
        b.iter(|| {
            n += 1;
            let event = ContributionEvent {
                event_id: format!("bench-{n}"),
                user_id: n % 64,
                campaign_id: 1,
                amount: 1_000,
                currency: "USD".to_string(),
                source: ContributionSource::Payment,
                occurred_at: 0,
            };
            black_box(guard.process(&event, &pool, 0, &mut rng).unwrap())
        });
    });
}

criterion_group!(
    benches,
    benchmark_resolve,
    benchmark_allocate,
    benchmark_guarded_allocation
);
criterion_main!(benches);
