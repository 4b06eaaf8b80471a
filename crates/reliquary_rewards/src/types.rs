//! # Domain Types
//!
//! Identifiers, catalogue records and ledger rows shared by every module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::rarity::EmissionTable;

/// Unique identifier for a user.
pub type UserId = u64;

/// Unique identifier for an item (NFT) type.
pub type ItemId = u64;

/// Unique identifier for a campaign.
pub type CampaignId = u64;

/// Unique identifier for a privilege.
pub type PrivilegeId = u64;

/// Unique identifier for a campaign issuer.
pub type IssuerId = u64;

/// Rarity tier. Positive integer; lower tiers are usually more common.
pub type Tier = u32;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// A campaign as seen by the engine (read-only).
#[derive(Clone, Debug, PartialEq)]
pub struct Campaign {
    /// Unique identifier.
    pub id: CampaignId,
    /// Issuer that owns the campaign and its block list.
    pub issuer_id: IssuerId,
    /// Inclusive start of the campaign window.
    pub starts_at: Timestamp,
    /// Exclusive end of the campaign window.
    pub ends_at: Timestamp,
    /// Rarity tier to draw weight mapping.
    pub emission_table: EmissionTable,
}

impl Campaign {
    /// Returns true if `at` lies inside `[starts_at, ends_at)`.
    #[inline]
    #[must_use]
    pub const fn is_active(&self, at: Timestamp) -> bool {
        at >= self.starts_at && at < self.ends_at
    }
}

/// An item definition in a campaign catalogue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier.
    pub id: ItemId,
    /// Campaign this item belongs to.
    pub campaign_id: CampaignId,
    /// Rarity tier of this item.
    pub rarity: Tier,
}

/// A user's holding of one item. Unique per `(user_id, item_id)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    /// Holder.
    pub user_id: UserId,
    /// Item held.
    pub item_id: ItemId,
    /// Units currently held.
    pub owned: u64,
    /// Units shipped to the user. Never decreases.
    pub shipped: u64,
    /// Units burned by privilege redemptions. Never decreases.
    pub consumed: u64,
}

impl Ownership {
    /// Creates an empty row for a pair that has never been credited.
    #[inline]
    #[must_use]
    pub const fn empty(user_id: UserId, item_id: ItemId) -> Self {
        Self {
            user_id,
            item_id,
            owned: 0,
            shipped: 0,
            consumed: 0,
        }
    }
}

/// Issued-supply counter of one item. Never decreases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemSupply {
    /// Item tracked.
    pub item_id: ItemId,
    /// Units ever credited to any user.
    pub total_issued: u64,
}

/// One `(item, count)` pair produced by an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AwardedItem {
    /// Item awarded.
    pub item_id: ItemId,
    /// Units awarded.
    pub count: u64,
}

impl AwardedItem {
    /// Creates a new award.
    #[inline]
    #[must_use]
    pub const fn new(item_id: ItemId, count: u64) -> Self {
        Self { item_id, count }
    }
}

/// Where a contribution came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ContributionSource {
    /// A completed monetary payment.
    #[default]
    Payment = 1,
    /// An external blockchain tip.
    Tip = 2,
}

impl ContributionSource {
    /// Converts from the stored tag.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Payment),
            2 => Some(Self::Tip),
            _ => None,
        }
    }
}

/// A validated contribution delivered by the payment or chain listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionEvent {
    /// Externally supplied unique identifier (payment reference, tx hash).
    pub event_id: String,
    /// Contributor.
    pub user_id: UserId,
    /// Campaign contributed to.
    pub campaign_id: CampaignId,
    /// Amount in minor currency units.
    pub amount: u64,
    /// ISO currency code or token symbol.
    pub currency: String,
    /// Payment or tip.
    #[serde(default)]
    pub source: ContributionSource,
    /// When the contribution completed.
    pub occurred_at: Timestamp,
}

/// Idempotency record of one processed external event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    /// External event identifier (unique).
    pub event_id: String,
    /// User credited.
    pub user_id: UserId,
    /// Campaign drawn from.
    pub campaign_id: CampaignId,
    /// Payment or tip.
    pub source: ContributionSource,
    /// Contribution amount in minor units.
    pub amount: u64,
    /// Number of draws performed.
    pub draw_count: u64,
    /// Aggregated awards, sorted by item id.
    pub items: Vec<AwardedItem>,
    /// When the allocation was committed.
    pub recorded_at: Timestamp,
}

/// One required `(item, amount)` pair of a privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequirementEntry {
    /// Required item.
    pub item_id: ItemId,
    /// Units that must be held and are consumed on redemption.
    pub amount: u64,
}

impl RequirementEntry {
    /// Creates a new requirement.
    #[inline]
    #[must_use]
    pub const fn new(item_id: ItemId, amount: u64) -> Self {
        Self { item_id, amount }
    }
}

/// A benefit unlocked by holding an exact item set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privilege {
    /// Unique identifier.
    pub id: PrivilegeId,
    /// Campaign whose items are required.
    pub campaign_id: CampaignId,
    /// Redemptions at or after this instant are refused.
    pub expires_at: Timestamp,
    /// Global cap on executions across all users.
    pub limit_execution_times: u64,
    /// Ordered requirement set.
    pub requirements: Vec<RequirementEntry>,
}

/// Per-user execution counter of a privilege.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrivilegeExecution {
    /// Redeeming user.
    pub user_id: UserId,
    /// Privilege redeemed.
    pub privilege_id: PrivilegeId,
    /// How many times this user redeemed it.
    pub execution_times: u64,
}

/// Denormalised running total of a privilege's executions across all users.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrivilegeUsage {
    /// Privilege tracked.
    pub privilege_id: PrivilegeId,
    /// Sum of every user's `execution_times`.
    pub executed_total: u64,
}

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub const fn new(now: Timestamp) -> Self {
        Self(AtomicU64::new(now))
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}
