//! # Allocation Idempotency Guard
//!
//! Exactly-once conversion of external contribution events into ledger
//! credits, under at-least-once delivery.
//!
//! ```text
//! event ──> lock allocation slot(event_id)
//!              │
//!              ├─ record exists ──────────────────────────> Replayed(record)
//!              │
//!              └─ absent ──> draw ──> credit ledger ──> insert record
//!                                                          │
//!                                         one transaction ─┘──> Applied(record)
//! ```
//!
//! The slot lock serialises concurrent deliveries of the same event id. A
//! unique-key violation at commit (another writer won) is read back as a
//! replay, never surfaced as an error. A crash before commit leaves neither
//! the record nor the credit, so redelivery applies the event normally.

use std::sync::Arc;

use rand::Rng;

use crate::error::{EngineError, EngineResult};
use crate::gacha::{CampaignPool, GachaAllocator};
use crate::ledger::credit_in;
use crate::store::LedgerStore;
use crate::types::{AllocationRecord, ContributionEvent, Timestamp};

/// What [`AllocationIdempotencyGuard::process`] did with an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// First delivery: items drawn and credited. The item list is empty when
    /// the amount earned no draws.
    Applied(AllocationRecord),
    /// Already processed: the stored record, nothing re-drawn.
    Replayed(AllocationRecord),
}

impl AllocationOutcome {
    /// The allocation record.
    #[must_use]
    pub const fn record(&self) -> &AllocationRecord {
        match self {
            Self::Applied(record) | Self::Replayed(record) => record,
        }
    }

    /// Returns true for a replay.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// Applies contribution events at most once.
#[derive(Debug)]
pub struct AllocationIdempotencyGuard<S> {
    store: Arc<S>,
    allocator: GachaAllocator,
}

impl<S: LedgerStore> AllocationIdempotencyGuard<S> {
    /// Creates a guard over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, allocator: GachaAllocator) -> Self {
        Self { store, allocator }
    }

    /// The allocator used for first deliveries.
    #[must_use]
    pub const fn allocator(&self) -> &GachaAllocator {
        &self.allocator
    }

    /// Processes one delivery of `event`.
    ///
    /// # Errors
    ///
    /// - `CampaignNotFound` if `pool` belongs to another campaign (checked
    ///   only when no record exists, so redeliveries still replay)
    /// - `CampaignInactive` if the event happened outside the campaign window
    /// - `CampaignMisconfigured` if a draw lands on an empty tier
    /// - `ArithmeticOverflow`, or a transient store error (retry is safe)
    ///
    /// Nothing is recorded or credited when an error is returned.
    pub fn process<R: Rng + ?Sized>(
        &self,
        event: &ContributionEvent,
        pool: &CampaignPool,
        now: Timestamp,
        rng: &mut R,
    ) -> EngineResult<AllocationOutcome> {
        let result = self.store.transaction(|tx| {
            if let Some(existing) = tx.lock_allocation_slot(&event.event_id)? {
                return Ok(AllocationOutcome::Replayed(existing));
            }
            if pool.campaign_id() != event.campaign_id {
                return Err(EngineError::CampaignNotFound(event.campaign_id));
            }
            if !pool.is_active(event.occurred_at) {
                return Err(EngineError::CampaignInactive(event.campaign_id));
            }

            let allocation = self.allocator.allocate(pool, event.amount, rng)?;
            credit_in(tx, event.user_id, &allocation.items)?;

            let record = AllocationRecord {
                event_id: event.event_id.clone(),
                user_id: event.user_id,
                campaign_id: event.campaign_id,
                source: event.source,
                amount: event.amount,
                draw_count: allocation.draw_count,
                items: allocation.items,
                recorded_at: now,
            };
            tx.insert_allocation(record.clone())?;
            Ok(AllocationOutcome::Applied(record))
        });

        let outcome = match result {
            Err(EngineError::DuplicateEvent(event_id)) => {
                match self.store.allocation(&event_id)? {
                    Some(record) => AllocationOutcome::Replayed(record),
                    None => return Err(EngineError::DuplicateEvent(event_id)),
                }
            }
            other => other?,
        };

        match &outcome {
            AllocationOutcome::Applied(record) => tracing::info!(
                "allocation {} applied: user {} received {} units from {} draws",
                record.event_id,
                record.user_id,
                record.items.iter().map(|i| i.count).sum::<u64>(),
                record.draw_count
            ),
            AllocationOutcome::Replayed(record) => tracing::info!(
                "allocation {} replayed for user {}",
                record.event_id,
                record.user_id
            ),
        }
        Ok(outcome)
    }
}
