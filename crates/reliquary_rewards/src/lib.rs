//! # RELIQUARY Rewards
//!
//! Reward allocation and redemption engine for NFT campaigns.
//!
//! ## Pipeline
//!
//! 1. **Allocation** - a completed contribution earns `floor(amount / unit_value)`
//!    weighted gacha draws, credited to the contributor exactly once per
//!    external event id.
//! 2. **Redemption** - a user holding exactly a privilege's required item set
//!    burns it to redeem the privilege, under row locks, all or nothing.
//!
//! ## Invariants
//!
//! - Awarded counts always sum to the draw count
//! - One allocation record per external event id
//! - `total_issued == Σ(owned + shipped + consumed)` for every item
//! - A failed transaction leaves no observable side effect
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reliquary_rewards::{EngineConfig, RewardEngine, StaticCatalog};
//!
//! let config = EngineConfig::load("config/engine.toml")?;
//! let catalog = Arc::new(StaticCatalog::load("config/catalog.toml")?);
//! let engine = RewardEngine::from_config(catalog, &config)?;
//!
//! let outcome = engine.on_contribution(&event)?;
//! let result = engine.redeem(&RedemptionRequest { user_id, privilege_id })?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod events;
pub mod gacha;
pub mod guard;
pub mod ledger;
pub mod rarity;
pub mod redemption;
pub mod retry;
pub mod store;
pub mod types;

pub use catalog::{Catalog, StaticCatalog};
pub use config::{CatalogConfig, EngineConfig};
pub use eligibility::{EligibilityInput, EligibilityReport, PrivilegeEligibilityEngine};
pub use engine::RewardEngine;
pub use error::{EngineError, EngineResult, RejectionReason};
pub use events::{EngineEvent, EventBus};
pub use gacha::{Allocation, CampaignPool, GachaAllocator};
pub use guard::{AllocationIdempotencyGuard, AllocationOutcome};
pub use ledger::{InventoryLedger, SupplyAudit};
pub use rarity::{EmissionTable, RarityResolver, RarityStatistics};
pub use redemption::{
    RedemptionExecutor, RedemptionOutcome, RedemptionRequest, RedemptionResult, RedemptionState,
};
pub use retry::{with_retry, RetryPolicy};
pub use store::{LedgerStore, MemoryStore, TxContext};
pub use types::{
    AllocationRecord, AwardedItem, Campaign, Clock, ContributionEvent, ContributionSource, Item,
    ManualClock, Ownership, Privilege, RequirementEntry, SystemClock,
};
