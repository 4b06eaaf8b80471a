//! # Reward Engine Verification Tests
//!
//! End-to-end checks of the engine's guarantees:
//!
//! 1. **Rarity**: draws converge to the emission table (χ², 100,000 draws)
//! 2. **Allocation**: counts sum to `floor(amount / unit_value)`, items belong to the campaign
//! 3. **Idempotence**: one record and one credit per external event id
//! 4. **Conservation**: issued supply matches every unit held, shipped or burned
//! 5. **Atomicity**: a fault mid-debit leaves every balance untouched
//! 6. **Exact set**: a superset of the requirement set is ineligible
//!
//! Run with: cargo test --package reliquary_rewards --test reward_verification -- --nocapture

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use reliquary_rewards::{
    AwardedItem, CampaignPool, Catalog, ContributionEvent, ContributionSource, EmissionTable, EngineConfig,
    EngineError, GachaAllocator, InventoryLedger, LedgerStore, ManualClock, MemoryStore,
    RarityResolver, RedemptionOutcome, RedemptionRequest, RejectionReason, RequirementEntry,
    RewardEngine, StaticCatalog,
};

const CATALOG: &str = r#"
    [[campaigns]]
    id = 1
    issuer_id = 9
    starts_at = 0
    ends_at = 1000000
    emission_rates = { 1 = 60, 2 = 20, 3 = 10, 4 = 8, 5 = 2 }

    [[items]]
    id = 101
    campaign_id = 1
    rarity = 1

    [[items]]
    id = 102
    campaign_id = 1
    rarity = 1

    [[items]]
    id = 201
    campaign_id = 1
    rarity = 2

    [[items]]
    id = 301
    campaign_id = 1
    rarity = 3

    [[items]]
    id = 401
    campaign_id = 1
    rarity = 4

    [[items]]
    id = 501
    campaign_id = 1
    rarity = 5

    [[privileges]]
    id = 1
    campaign_id = 1
    expires_at = 1000000
    limit_execution_times = 1
    requirements = [{ item_id = 101, amount = 5 }, { item_id = 102, amount = 5 }]

    [[privileges]]
    id = 2
    campaign_id = 1
    expires_at = 1000000
    limit_execution_times = 100
    requirements = [{ item_id = 101, amount = 1 }]
"#;

fn build_engine(seed: u64) -> RewardEngine<MemoryStore, StaticCatalog> {
    let config = EngineConfig {
        unit_value: 100,
        rng_seed: Some(seed),
        ..EngineConfig::default()
    };
    RewardEngine::with_clock(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticCatalog::from_toml_str(CATALOG).unwrap()),
        &config,
        Arc::new(ManualClock::new(10_000)),
    )
    .unwrap()
}

fn contribution(event_id: &str, user_id: u64, amount: u64) -> ContributionEvent {
    ContributionEvent {
        event_id: event_id.to_string(),
        user_id,
        campaign_id: 1,
        amount,
        currency: "USD".to_string(),
        source: ContributionSource::Payment,
        occurred_at: 10_000,
    }
}

// ============================================================================
// 1. RARITY DISTRIBUTION
// ============================================================================

#[test]
fn verify_rarity_distribution_chi_square() {
    let table = EmissionTable::new([(1, 60.0), (2, 20.0), (3, 10.0), (4, 8.0), (5, 2.0)]).unwrap();
    let resolver = RarityResolver::new(&table);
    let mut rng = ChaCha8Rng::seed_from_u64(2024);

    let stats = resolver.statistics(100_000, &mut rng);
    let chi_square = stats.chi_square(&table);

    println!("\n=== Rarity Distribution (100,000 draws) ===");
    for (tier, count) in &stats.tier_counts {
        println!("tier {tier}: {count}");
    }
    println!("chi-square: {chi_square:.3} (df = 4, critical 18.467 at p = 0.001)");

    assert_eq!(stats.total_draws, 100_000);
    assert!(chi_square < 18.467, "distribution diverges: chi-square {chi_square}");
}

// ============================================================================
// 2. ALLOCATION COUNTS
// ============================================================================

#[test]
fn verify_draw_count_is_floor_of_amount() {
    let engine = build_engine(1);

    let ten = engine.on_contribution(&contribution("pay-1000", 1, 1_000)).unwrap();
    let nine = engine.on_contribution(&contribution("pay-950", 1, 950)).unwrap();

    assert_eq!(ten.record().draw_count, 10);
    assert_eq!(nine.record().draw_count, 9);
    assert_eq!(ten.record().items.iter().map(|i| i.count).sum::<u64>(), 10);
    assert_eq!(nine.record().items.iter().map(|i| i.count).sum::<u64>(), 9);
}

#[test]
fn verify_counts_sum_and_membership_across_amounts() {
    let catalog = StaticCatalog::from_toml_str(CATALOG).unwrap();
    let campaign = catalog.campaign(1).unwrap();
    let items = catalog.items_in_campaign(1);
    let pool = CampaignPool::new(&campaign, &items);
    let mut rng = ChaCha8Rng::seed_from_u64(99);

    for unit_value in [1, 7, 100, 333] {
        let allocator = GachaAllocator::new(unit_value).unwrap();
        for amount in [0, 1, 6, 99, 100, 101, 999, 5_000] {
            let allocation = allocator.allocate(&pool, amount, &mut rng).unwrap();
            assert_eq!(allocation.draw_count, amount / unit_value);
            assert_eq!(allocation.total_units(), amount / unit_value);
            assert!(allocation.items.iter().all(|award| pool.contains(award.item_id)));
        }
    }
}

// ============================================================================
// 3. IDEMPOTENCE
// ============================================================================

#[test]
fn verify_redelivery_credits_once() {
    let engine = build_engine(3);
    let event = contribution("pay-dup", 5, 2_000);

    let first = engine.on_contribution(&event).unwrap();
    let second = engine.on_contribution(&event).unwrap();

    assert!(!first.is_replay());
    assert!(second.is_replay());
    assert_eq!(first.record(), second.record());
    assert_eq!(engine.ledger().store().allocation_count().unwrap(), 1);

    let owned: u64 = engine.inventory(5).unwrap().iter().map(|o| o.owned).sum();
    assert_eq!(owned, 20);
}

// ============================================================================
// 4. CONSERVATION
// ============================================================================

#[test]
fn verify_credit_conservation() {
    let engine = build_engine(4);
    let ledger = engine.ledger();

    let before: Vec<(u64, u64)> = [101, 102, 201, 301, 401, 501]
        .iter()
        .map(|&id| (id, ledger.total_issued(id).unwrap()))
        .collect();

    let outcome = engine.on_contribution(&contribution("pay-c", 8, 3_000)).unwrap();
    for award in &outcome.record().items {
        let (_, issued_before) = before.iter().find(|(id, _)| *id == award.item_id).unwrap();
        assert_eq!(ledger.total_issued(award.item_id).unwrap(), issued_before + award.count);
        assert_eq!(ledger.ownership(8, award.item_id).unwrap().owned, award.count);
    }

    engine.record_shipment(8, outcome.record().items[0].item_id, 1).unwrap();
    for (id, _) in before {
        assert!(ledger.audit_item(id).unwrap().is_balanced());
    }
}

// ============================================================================
// 5. ATOMICITY
// ============================================================================

#[test]
fn verify_debit_atomicity_under_injected_fault() {
    let store = Arc::new(MemoryStore::new());
    let ledger = InventoryLedger::new(Arc::clone(&store));
    let items: Vec<AwardedItem> = (1..=4).map(|id| AwardedItem::new(id, 10)).collect();
    ledger.credit_allocation(1, &items).unwrap();

    let requirements: Vec<RequirementEntry> = (1..=4).map(|id| RequirementEntry::new(id, 3)).collect();
    for fault_after in 1..4 {
        store.inject_write_fault(fault_after);
        let result = ledger.debit_for_redemption(1, &requirements);
        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
        for id in 1..=4 {
            assert_eq!(ledger.ownership(1, id).unwrap().owned, 10, "fault after {fault_after}");
        }
    }

    ledger.debit_for_redemption(1, &requirements).unwrap();
    for id in 1..=4 {
        assert_eq!(ledger.ownership(1, id).unwrap().owned, 7);
    }
}

// ============================================================================
// 6. ELIGIBILITY AND REDEMPTION SCENARIOS
// ============================================================================

#[test]
fn verify_superset_is_ineligible() {
    let engine = build_engine(5);
    engine
        .ledger()
        .credit_allocation(3, &[AwardedItem::new(101, 1), AwardedItem::new(102, 1)])
        .unwrap();

    let report = engine.check_eligibility(3, 2).unwrap().unwrap();
    assert!(report.amounts_sufficient);
    assert!(!report.set_matches);
    assert!(!report.is_eligible());

    let result = engine
        .redeem(&RedemptionRequest {
            user_id: 3,
            privilege_id: 2,
        })
        .unwrap();
    assert_eq!(result.rejection(), Some(RejectionReason::IncompleteSet));
}

#[test]
fn verify_redemption_scenario_with_global_limit() {
    let engine = build_engine(6);
    engine
        .ledger()
        .credit_allocation(1, &[AwardedItem::new(101, 10), AwardedItem::new(102, 10)])
        .unwrap();
    let request = RedemptionRequest {
        user_id: 1,
        privilege_id: 1,
    };

    assert!(engine.check_eligibility(1, 1).unwrap().unwrap().is_eligible());

    let first = engine.redeem(&request).unwrap();
    assert_eq!(first.outcome, RedemptionOutcome::Completed { execution_times: 1 });
    assert_eq!(engine.ledger().ownership(1, 101).unwrap().owned, 5);
    assert_eq!(engine.ledger().ownership(1, 102).unwrap().owned, 5);
    let store = engine.ledger().store();
    assert_eq!(store.execution(1, 1).unwrap().map(|e| e.execution_times), Some(1));

    let second = engine.redeem(&request).unwrap();
    assert_eq!(second.rejection(), Some(RejectionReason::LimitReached));
    assert_eq!(engine.ledger().ownership(1, 101).unwrap().owned, 5);
    assert!(engine.ledger().audit_item(101).unwrap().is_balanced());
}
