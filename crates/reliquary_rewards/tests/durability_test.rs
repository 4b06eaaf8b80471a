//! Integration tests for the journaled store: restart, torn tails, checkpoints.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reliquary_rewards::{
    AwardedItem, ContributionEvent, ContributionSource, EngineConfig, EngineError, LedgerStore,
    MemoryStore, RedemptionRequest, RejectionReason, RewardEngine, StaticCatalog,
};

const CATALOG: &str = r#"
    [[campaigns]]
    id = 1
    issuer_id = 9
    emission_rates = { 1 = 1 }

    [[items]]
    id = 11
    campaign_id = 1
    rarity = 1

    [[privileges]]
    id = 1
    campaign_id = 1
    expires_at = 4102444800000
    limit_execution_times = 1
    requirements = [{ item_id = 11, amount = 2 }]
"#;

fn temp_journal_path() -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("test_reliquary_{id}_{}.rlqj", std::process::id()))
}

fn open(path: &Path) -> RewardEngine<MemoryStore, StaticCatalog> {
    let config = EngineConfig {
        rng_seed: Some(5),
        journal_path: Some(path.to_path_buf()),
        ..EngineConfig::default()
    };
    let catalog = Arc::new(StaticCatalog::from_toml_str(CATALOG).unwrap());
    RewardEngine::from_config(catalog, &config).unwrap()
}

fn contribution(event_id: &str, amount: u64) -> ContributionEvent {
    ContributionEvent {
        event_id: event_id.to_string(),
        user_id: 1,
        campaign_id: 1,
        amount,
        currency: "USD".to_string(),
        source: ContributionSource::Payment,
        occurred_at: 1_000,
    }
}

#[test]
fn test_state_survives_restart() {
    let path = temp_journal_path();
    {
        let engine = open(&path);
        engine.on_contribution(&contribution("pay-1", 500)).unwrap();
        let result = engine
            .redeem(&RedemptionRequest {
                user_id: 1,
                privilege_id: 1,
            })
            .unwrap();
        assert!(result.is_completed());
        engine.record_shipment(1, 11, 1).unwrap();
    }
    {
        let engine = open(&path);
        let row = engine.ledger().ownership(1, 11).unwrap();
        assert_eq!((row.owned, row.shipped, row.consumed), (2, 1, 2));
        assert_eq!(engine.ledger().total_issued(11).unwrap(), 5);

        let replay = engine.on_contribution(&contribution("pay-1", 500)).unwrap();
        assert!(replay.is_replay());
        assert_eq!(replay.record().draw_count, 5);

        let again = engine
            .redeem(&RedemptionRequest {
                user_id: 1,
                privilege_id: 1,
            })
            .unwrap();
        assert_eq!(again.rejection(), Some(RejectionReason::LimitReached));
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_torn_tail_is_discarded() {
    let path = temp_journal_path();
    {
        let engine = open(&path);
        engine.on_contribution(&contribution("pay-1", 300)).unwrap();
    }
    let garbage = [0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xff];
    let clean = std::fs::read(&path).unwrap();
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&garbage).unwrap();
    }
    {
        let engine = open(&path);
        assert_eq!(engine.ledger().ownership(1, 11).unwrap().owned, 3);
        assert_eq!(std::fs::read(&path).unwrap(), clean);
        engine.on_contribution(&contribution("pay-2", 100)).unwrap();
    }
    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.starts_with(&clean));
    assert!(!bytes[clean.len()..].starts_with(&garbage));
    {
        let engine = open(&path);
        assert_eq!(engine.ledger().ownership(1, 11).unwrap().owned, 4);
        assert_eq!(engine.ledger().store().allocation_count().unwrap(), 2);
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_checkpoint_compacts_and_preserves_state() {
    let path = temp_journal_path();
    {
        let engine = open(&path);
        for n in 0..20 {
            engine
                .on_contribution(&contribution(&format!("pay-{n}"), 100))
                .unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();
        engine.checkpoint().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "checkpoint did not shrink journal: {before} -> {after}");
    }
    {
        let engine = open(&path);
        assert_eq!(engine.ledger().ownership(1, 11).unwrap().owned, 20);
        assert_eq!(engine.ledger().store().allocation_count().unwrap(), 20);
        assert!(engine.ledger().audit_item(11).unwrap().is_balanced());
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_failed_commit_is_not_journaled() {
    let path = temp_journal_path();
    {
        let engine = open(&path);
        engine
            .ledger()
            .credit_allocation(1, &[AwardedItem::new(11, 1)])
            .unwrap();
        engine.ledger().store().inject_write_fault(0);
        let result = engine.ledger().credit_allocation(1, &[AwardedItem::new(11, 1)]);
        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
    }
    {
        let engine = open(&path);
        assert_eq!(engine.ledger().ownership(1, 11).unwrap().owned, 1);
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_foreign_file_is_rejected() {
    let path = temp_journal_path();
    std::fs::write(&path, b"not a journal at all").unwrap();
    let config = EngineConfig {
        journal_path: Some(path.clone()),
        ..EngineConfig::default()
    };
    let catalog = Arc::new(StaticCatalog::from_toml_str(CATALOG).unwrap());
    assert!(matches!(
        RewardEngine::from_config(catalog, &config),
        Err(EngineError::Journal(_))
    ));
    std::fs::remove_file(&path).ok();
}
