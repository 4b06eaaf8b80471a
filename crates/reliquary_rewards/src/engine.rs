//! # Reward Engine
//!
//! **One entry point** for the surrounding API layer.
//!
//! ```text
//! payment / tip listener ──> on_contribution() ──> guard ──> ledger
//!                                                     │
//! redemption API ─────────> redeem() ──> executor ────┤
//!                                                     ▼
//!                                          commit ──> EventBus ──> workers
//! ```
//!
//! Each operation runs under [`with_retry`], so a transient lock timeout is
//! retried with backoff before it reaches the caller. Retrying is safe: the
//! guard makes allocations idempotent and a failed redemption writes nothing.
//!
//! ## Randomness
//!
//! A master `ChaCha20Rng` (seeded from `rng_seed`, or OS entropy) hands each
//! contribution a child seed. Retries of the same delivery redraw from the
//! same child seed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::eligibility::EligibilityReport;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::gacha::{CampaignPool, GachaAllocator};
use crate::guard::{AllocationIdempotencyGuard, AllocationOutcome};
use crate::ledger::InventoryLedger;
use crate::redemption::{RedemptionExecutor, RedemptionRequest, RedemptionResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{LedgerStore, MemoryStore};
use crate::types::{
    CampaignId, Clock, ContributionEvent, ItemId, Ownership, PrivilegeId, SystemClock, UserId,
};

/// Allocation and redemption facade.
pub struct RewardEngine<S, C> {
    catalog: Arc<C>,
    guard: AllocationIdempotencyGuard<S>,
    executor: RedemptionExecutor<S, C>,
    ledger: InventoryLedger<S>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    pools: RwLock<HashMap<CampaignId, Arc<CampaignPool>>>,
    rng: Mutex<ChaCha20Rng>,
    retry: RetryPolicy,
}

impl<S: LedgerStore, C: Catalog> RewardEngine<S, C> {
    /// Creates an engine on the wall clock.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` fails validation.
    pub fn new(store: Arc<S>, catalog: Arc<C>, config: &EngineConfig) -> EngineResult<Self> {
        Self::with_clock(store, catalog, config, Arc::new(SystemClock))
    }

    /// Creates an engine on an injected clock.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` fails validation.
    pub fn with_clock(
        store: Arc<S>,
        catalog: Arc<C>,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let rng = match config.rng_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        let events = Arc::new(EventBus::new(config.event_capacity));
        let allocator = GachaAllocator::new(config.unit_value)?;

        tracing::info!(
            "reward engine ready: unit value {}, lock timeout {}ms, {} retry attempts",
            config.unit_value,
            config.lock_timeout_ms,
            config.retry.max_attempts
        );

        Ok(Self {
            guard: AllocationIdempotencyGuard::new(Arc::clone(&store), allocator),
            executor: RedemptionExecutor::new(
                Arc::clone(&store),
                Arc::clone(&catalog),
                Arc::clone(&events),
                Arc::clone(&clock),
            ),
            ledger: InventoryLedger::new(store),
            catalog,
            events,
            clock,
            pools: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
            retry: config.retry,
        })
    }

    /// Draw pool of a campaign, built from the catalogue on first use.
    fn pool(&self, campaign_id: CampaignId) -> EngineResult<Arc<CampaignPool>> {
        if let Some(pool) = self.pools.read().get(&campaign_id) {
            return Ok(Arc::clone(pool));
        }

        let campaign = self
            .catalog
            .campaign(campaign_id)
            .ok_or(EngineError::CampaignNotFound(campaign_id))?;
        let items = self.catalog.items_in_campaign(campaign_id);
        let pool = Arc::new(CampaignPool::new(&campaign, &items));

        Ok(Arc::clone(
            self.pools.write().entry(campaign_id).or_insert(pool),
        ))
    }

    /// Drops the cached draw pool of a campaign after a catalogue change.
    pub fn invalidate_campaign(&self, campaign_id: CampaignId) {
        self.pools.write().remove(&campaign_id);
    }

    /// Converts a contribution into items, exactly once per event id.
    ///
    /// # Errors
    ///
    /// - `CampaignNotFound` / `CampaignInactive` for a first delivery; a
    ///   redelivery replays even after its campaign left the catalogue
    /// - `CampaignMisconfigured` (fatal, not retried)
    /// - a transient store error once retries are exhausted
    pub fn on_contribution(&self, event: &ContributionEvent) -> EngineResult<AllocationOutcome> {
        // Replays must not depend on the campaign still being in the catalogue.
        if let Some(record) = self.ledger.store().allocation(&event.event_id)? {
            tracing::info!(
                "allocation {} replayed for user {}",
                record.event_id,
                record.user_id
            );
            return Ok(AllocationOutcome::Replayed(record));
        }

        let pool = self.pool(event.campaign_id)?;
        let seed = self.rng.lock().next_u64();

        let outcome = with_retry(&self.retry, || {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            self.guard
                .process(event, &pool, self.clock.now_ms(), &mut rng)
        })?;

        if let AllocationOutcome::Applied(record) = &outcome {
            self.events.publish(EngineEvent::AllocationCompleted {
                event_id: record.event_id.clone(),
                user_id: record.user_id,
                campaign_id: record.campaign_id,
                items: record.items.clone(),
            });
        }
        Ok(outcome)
    }

    /// Redeems a privilege.
    ///
    /// # Errors
    ///
    /// A transient store error once retries are exhausted. Business refusals
    /// are `Ok` with a rejected outcome.
    pub fn redeem(&self, request: &RedemptionRequest) -> EngineResult<RedemptionResult> {
        with_retry(&self.retry, || self.executor.redeem(request))
    }

    /// Advisory eligibility report on committed state, `None` if the
    /// privilege does not exist.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn check_eligibility(
        &self,
        user_id: UserId,
        privilege_id: PrivilegeId,
    ) -> EngineResult<Option<EligibilityReport>> {
        self.executor.preview(user_id, privilege_id)
    }

    /// Moves owned units to shipped.
    ///
    /// # Errors
    ///
    /// `InsufficientInventory`, or a transient store error once retries are
    /// exhausted.
    pub fn record_shipment(
        &self,
        user_id: UserId,
        item_id: ItemId,
        count: u64,
    ) -> EngineResult<Ownership> {
        with_retry(&self.retry, || {
            self.ledger.record_shipment(user_id, item_id, count)
        })
    }

    /// Every ownership row of a user.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn inventory(&self, user_id: UserId) -> EngineResult<Vec<Ownership>> {
        self.ledger.inventory_of(user_id)
    }

    /// The inventory ledger.
    #[must_use]
    pub const fn ledger(&self) -> &InventoryLedger<S> {
        &self.ledger
    }

    /// A receiver of post-commit events.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Takes every queued event.
    #[must_use]
    pub fn drain_events(&self) -> Vec<EngineEvent> {
        self.events.drain()
    }
}

impl<C: Catalog> RewardEngine<MemoryStore, C> {
    /// Creates an engine over a [`MemoryStore`], durable when
    /// `journal_path` is set.
    ///
    /// # Errors
    ///
    /// `InvalidConfig`, or `Journal` if the journal cannot be recovered.
    pub fn from_config(catalog: Arc<C>, config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let store = match &config.journal_path {
            Some(path) => MemoryStore::open_durable(path, config.lock_timeout())?,
            None => MemoryStore::with_lock_timeout(config.lock_timeout()),
        };
        Self::new(Arc::new(store), catalog, config)
    }

    /// Compacts the journal. No-op when volatile.
    ///
    /// # Errors
    ///
    /// `Journal` if the snapshot cannot be written.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.ledger.store().checkpoint()
    }
}

impl<S, C> fmt::Debug for RewardEngine<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewardEngine")
            .field("cached_pools", &self.pools.read().len())
            .field("queued_events", &self.events.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
