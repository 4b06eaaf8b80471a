//! # Inventory Ledger
//!
//! Per-user item balances and the issued-supply counter.
//!
//! ## Conservation
//!
//! For every item:
//!
//! ```text
//! total_issued == Σ over users (owned + shipped + consumed)
//! ```
//!
//! Credits raise `owned` and `total_issued` together. Redemption debits move
//! units from `owned` to `consumed`; shipments move them to `shipped`. No
//! operation lowers `total_issued`, so [`InventoryLedger::audit_item`] can
//! check the equation at any time.
//!
//! The `*_in` functions run inside a caller's transaction; the methods on
//! [`InventoryLedger`] open their own.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::store::{LedgerStore, TxContext};
use crate::types::{AwardedItem, ItemId, Ownership, RequirementEntry, UserId};

/// Credits `items` to `user_id` and raises each item's issued supply.
///
/// # Errors
///
/// `ArithmeticOverflow` if a counter would wrap, or any store error.
pub(crate) fn credit_in(
    tx: &mut dyn TxContext,
    user_id: UserId,
    items: &[AwardedItem],
) -> EngineResult<()> {
    for award in items {
        let mut row = tx.lock_ownership(user_id, award.item_id)?;
        row.owned = row
            .owned
            .checked_add(award.count)
            .ok_or(EngineError::ArithmeticOverflow)?;
        tx.put_ownership(row)?;

        let mut supply = tx.lock_item_supply(award.item_id)?;
        supply.total_issued = supply
            .total_issued
            .checked_add(award.count)
            .ok_or(EngineError::ArithmeticOverflow)?;
        tx.put_item_supply(supply)?;
    }
    Ok(())
}

/// Consumes `requirements` from `user_id`. All or nothing.
///
/// Duplicate item ids are summed. Rows are locked in item order, every
/// balance is checked, and only then are the debits staged.
///
/// # Errors
///
/// `InsufficientInventory` if any balance is short, or any store error.
pub(crate) fn debit_in(
    tx: &mut dyn TxContext,
    user_id: UserId,
    requirements: &[RequirementEntry],
) -> EngineResult<()> {
    let mut needed: BTreeMap<ItemId, u64> = BTreeMap::new();
    for entry in requirements {
        let total = needed.entry(entry.item_id).or_insert(0);
        *total = total
            .checked_add(entry.amount)
            .ok_or(EngineError::ArithmeticOverflow)?;
    }

    let mut rows = Vec::with_capacity(needed.len());
    for (&item_id, &amount) in &needed {
        let row = tx.lock_ownership(user_id, item_id)?;
        if row.owned < amount {
            return Err(EngineError::InsufficientInventory {
                item_id,
                required: amount,
                available: row.owned,
            });
        }
        rows.push((row, amount));
    }

    for (mut row, amount) in rows {
        row.owned -= amount;
        row.consumed += amount;
        tx.put_ownership(row)?;
    }
    Ok(())
}

/// Result of checking one item against the conservation equation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupplyAudit {
    /// Item audited.
    pub item_id: ItemId,
    /// Issued-supply counter.
    pub total_issued: u64,
    /// Σ owned across holders.
    pub owned: u64,
    /// Σ shipped across holders.
    pub shipped: u64,
    /// Σ consumed across holders.
    pub consumed: u64,
}

impl SupplyAudit {
    /// Returns true if issued supply equals every unit accounted for.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.total_issued == self.owned + self.shipped + self.consumed
    }
}

/// Ledger of ownership rows and issued supply.
#[derive(Debug)]
pub struct InventoryLedger<S> {
    store: Arc<S>,
}

impl<S> Clone for InventoryLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> InventoryLedger<S> {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Credits items in a transaction of its own.
    ///
    /// # Errors
    ///
    /// `ArithmeticOverflow`, `LockTimeout` or a storage error; nothing is
    /// written on failure.
    pub fn credit_allocation(&self, user_id: UserId, items: &[AwardedItem]) -> EngineResult<()> {
        self.store.transaction(|tx| credit_in(tx, user_id, items))
    }

    /// Debits a requirement set in a transaction of its own.
    ///
    /// # Errors
    ///
    /// `InsufficientInventory` if any item is short; nothing is written.
    pub fn debit_for_redemption(
        &self,
        user_id: UserId,
        requirements: &[RequirementEntry],
    ) -> EngineResult<()> {
        self.store
            .transaction(|tx| debit_in(tx, user_id, requirements))
    }

    /// Moves `count` units of an item from owned to shipped.
    ///
    /// # Errors
    ///
    /// `InsufficientInventory` if fewer than `count` units are owned.
    pub fn record_shipment(
        &self,
        user_id: UserId,
        item_id: ItemId,
        count: u64,
    ) -> EngineResult<Ownership> {
        let row = self.store.transaction(|tx| {
            let mut row = tx.lock_ownership(user_id, item_id)?;
            if row.owned < count {
                return Err(EngineError::InsufficientInventory {
                    item_id,
                    required: count,
                    available: row.owned,
                });
            }
            row.owned -= count;
            row.shipped = row
                .shipped
                .checked_add(count)
                .ok_or(EngineError::ArithmeticOverflow)?;
            tx.put_ownership(row)?;
            Ok(row)
        })?;
        tracing::info!(
            "shipped {} of item {} to user {}",
            count,
            item_id,
            user_id
        );
        Ok(row)
    }

    /// Committed ownership row, or an empty row.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn ownership(&self, user_id: UserId, item_id: ItemId) -> EngineResult<Ownership> {
        Ok(self
            .store
            .ownership(user_id, item_id)?
            .unwrap_or_else(|| Ownership::empty(user_id, item_id)))
    }

    /// Every ownership row of a user, sorted by item id.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn inventory_of(&self, user_id: UserId) -> EngineResult<Vec<Ownership>> {
        self.store.ownerships_of(user_id)
    }

    /// Units of an item ever issued.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn total_issued(&self, item_id: ItemId) -> EngineResult<u64> {
        Ok(self.store.item_supply(item_id)?.total_issued)
    }

    /// Sums every holder of an item against its issued supply.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn audit_item(&self, item_id: ItemId) -> EngineResult<SupplyAudit> {
        let total_issued = self.total_issued(item_id)?;
        let holders = self.store.holders_of(item_id)?;

        let audit = holders.iter().fold(
            SupplyAudit {
                item_id,
                total_issued,
                owned: 0,
                shipped: 0,
                consumed: 0,
            },
            |mut acc, row| {
                acc.owned += row.owned;
                acc.shipped += row.shipped;
                acc.consumed += row.consumed;
                acc
            },
        );

        if !audit.is_balanced() {
            tracing::error!(
                "supply audit failed for item {}: issued {}, accounted {}",
                item_id,
                audit.total_issued,
                audit.owned + audit.shipped + audit.consumed
            );
        }
        Ok(audit)
    }
}
