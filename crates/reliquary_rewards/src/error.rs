//! # Engine Error Types
//!
//! All errors that can cross the engine boundary.
//!
//! Business rejections of a redemption are *not* errors; they travel as
//! [`RejectionReason`] inside an `Ok` result so callers can tell them apart.

use thiserror::Error;

use crate::types::{CampaignId, ItemId, Tier};

/// Errors that can occur in the reward engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The emission table of a campaign is malformed.
    #[error("invalid emission table: {0}")]
    InvalidEmissionTable(String),

    /// A drawn rarity tier has no items in the campaign catalogue.
    #[error("campaign {campaign_id} has no items of rarity tier {tier}")]
    CampaignMisconfigured {
        /// The campaign being drawn from.
        campaign_id: CampaignId,
        /// The tier that resolved without candidates.
        tier: Tier,
    },

    /// Invalid configuration file or value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unique-key violation on an allocation record.
    #[error("external event {0} was already processed")]
    DuplicateEvent(String),

    /// The user holds fewer units than a debit requires.
    #[error("insufficient inventory: need {required} of item {item_id}, have {available}")]
    InsufficientInventory {
        /// The item that was short.
        item_id: ItemId,
        /// The amount requested.
        required: u64,
        /// The amount currently owned.
        available: u64,
    },

    /// Campaign not found in the catalogue.
    #[error("campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// Item not found in the catalogue.
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    /// The contribution happened outside the campaign window.
    #[error("campaign {0} is not active at the event time")]
    CampaignInactive(CampaignId),

    /// Arithmetic overflow in a counter update.
    #[error("arithmetic overflow in ledger counter")]
    ArithmeticOverflow,

    /// A row lock could not be acquired within the bounded wait.
    #[error("lock timeout on {resource}, try again")]
    LockTimeout {
        /// Human-readable row key.
        resource: String,
    },

    /// The backing store failed mid-transaction.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The durable journal could not be written or read.
    #[error("journal failure: {0}")]
    Journal(String),
}

impl EngineError {
    /// Returns true if retrying the whole operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::StorageUnavailable(_) | Self::Journal(_)
        )
    }

    /// Returns true for fatal configuration problems (logged, never retried).
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidEmissionTable(_)
                | Self::CampaignMisconfigured { .. }
                | Self::InvalidConfig(_)
        )
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Why a redemption attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// The privilege (or its campaign) does not exist.
    NotFound,
    /// The privilege expired before the request.
    Expired,
    /// The user is on the issuer's block list.
    Blocked,
    /// Owned item set differs from the required item set.
    IncompleteSet,
    /// At least one required item is held in too small a quantity.
    InsufficientAmount,
    /// The global execution cap has been reached.
    LimitReached,
}

impl RejectionReason {
    /// Stable machine-readable code for the surrounding API layer.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Blocked => "blocked",
            Self::IncompleteSet => "incomplete_set",
            Self::InsufficientAmount => "insufficient_amount",
            Self::LimitReached => "limit_reached",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
