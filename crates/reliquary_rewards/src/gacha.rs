//! # Gacha Allocator
//!
//! Converts a contribution amount into awarded items.
//!
//! ```text
//! amount ──> floor(amount / unit_value) draws
//!              │
//!              ├─ RarityResolver ──> tier
//!              └─ uniform pick among the campaign's items of that tier
//!              │
//!              ▼
//!        aggregate duplicates ──> [(item_id, count)]
//! ```
//!
//! The allocator is pure: it never touches the ledger. A draw that resolves
//! to a tier without items aborts the whole allocation.

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{EngineError, EngineResult};
use crate::rarity::RarityResolver;
use crate::types::{AwardedItem, Campaign, CampaignId, Item, ItemId, Tier, Timestamp};

/// Pre-indexed draw pool of one campaign.
#[derive(Clone, Debug)]
pub struct CampaignPool {
    campaign_id: CampaignId,
    starts_at: Timestamp,
    ends_at: Timestamp,
    resolver: RarityResolver,
    items_by_tier: BTreeMap<Tier, Vec<ItemId>>,
}

impl CampaignPool {
    /// Indexes `items` by rarity. Items of other campaigns are ignored.
    #[must_use]
    pub fn new(campaign: &Campaign, items: &[Item]) -> Self {
        let mut items_by_tier: BTreeMap<Tier, Vec<ItemId>> = BTreeMap::new();
        for item in items.iter().filter(|i| i.campaign_id == campaign.id) {
            items_by_tier.entry(item.rarity).or_default().push(item.id);
        }
        for ids in items_by_tier.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }

        Self {
            campaign_id: campaign.id,
            starts_at: campaign.starts_at,
            ends_at: campaign.ends_at,
            resolver: RarityResolver::new(&campaign.emission_table),
            items_by_tier,
        }
    }

    /// The campaign this pool draws from.
    #[must_use]
    pub const fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    /// Returns true if `at` lies inside the campaign window.
    #[must_use]
    pub const fn is_active(&self, at: Timestamp) -> bool {
        at >= self.starts_at && at < self.ends_at
    }

    /// The tier resolver.
    #[must_use]
    pub const fn resolver(&self) -> &RarityResolver {
        &self.resolver
    }

    /// Items of `tier`, sorted by id.
    #[must_use]
    pub fn items_of(&self, tier: Tier) -> &[ItemId] {
        self.items_by_tier.get(&tier).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns true if `item_id` can be drawn from this pool.
    #[must_use]
    pub fn contains(&self, item_id: ItemId) -> bool {
        self.items_by_tier.values().any(|ids| ids.binary_search(&item_id).is_ok())
    }

    /// Draws one item.
    ///
    /// # Errors
    ///
    /// Returns `CampaignMisconfigured` if the drawn tier has no items.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> EngineResult<ItemId> {
        let tier = self.resolver.resolve(rng);
        let candidates = self.items_of(tier);
        if candidates.is_empty() {
            return Err(EngineError::CampaignMisconfigured {
                campaign_id: self.campaign_id,
                tier,
            });
        }
        Ok(candidates[rng.gen_range(0..candidates.len())])
    }
}

/// Result of converting one amount into draws.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Number of draws performed.
    pub draw_count: u64,
    /// Aggregated awards sorted by item id. Counts sum to `draw_count`.
    pub items: Vec<AwardedItem>,
}

impl Allocation {
    /// Returns true if nothing was drawn.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.draw_count == 0
    }

    /// Sum of all awarded counts.
    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.items.iter().map(|i| i.count).sum()
    }
}

/// Turns contribution amounts into draws.
#[derive(Clone, Copy, Debug)]
pub struct GachaAllocator {
    unit_value: u64,
}

impl GachaAllocator {
    /// Creates an allocator granting one draw per `unit_value` minor units.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `unit_value` is zero.
    pub fn new(unit_value: u64) -> EngineResult<Self> {
        if unit_value == 0 {
            return Err(EngineError::InvalidConfig(
                "unit_value must be greater than zero".to_string(),
            ));
        }
        Ok(Self { unit_value })
    }

    /// Minor units per draw.
    #[must_use]
    pub const fn unit_value(&self) -> u64 {
        self.unit_value
    }

    /// `floor(amount / unit_value)`.
    #[must_use]
    pub const fn draw_count(&self, amount: u64) -> u64 {
        amount / self.unit_value
    }

    /// Performs every draw earned by `amount` and aggregates duplicates.
    ///
    /// An amount below one unit yields an empty allocation.
    ///
    /// # Errors
    ///
    /// Returns `CampaignMisconfigured` if any draw lands on an empty tier; no
    /// partial allocation is returned.
    pub fn allocate<R: Rng + ?Sized>(
        &self,
        pool: &CampaignPool,
        amount: u64,
        rng: &mut R,
    ) -> EngineResult<Allocation> {
        let draw_count = self.draw_count(amount);
        if draw_count == 0 {
            return Ok(Allocation::default());
        }

        let mut counts: BTreeMap<ItemId, u64> = BTreeMap::new();
        for _ in 0..draw_count {
            let item_id = pool.draw(rng).map_err(|e| {
                tracing::error!("allocation aborted for campaign {}: {}", pool.campaign_id(), e);
                e
            })?;
            *counts.entry(item_id).or_insert(0) += 1;
        }

        let items = counts
            .into_iter()
            .map(|(item_id, count)| AwardedItem::new(item_id, count))
            .collect();

        Ok(Allocation { draw_count, items })
    }
}
