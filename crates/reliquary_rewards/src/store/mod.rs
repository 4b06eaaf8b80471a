//! # Ledger Storage
//!
//! Repository-style ports over a transactional store, plus the in-process
//! adapter.
//!
//! Every multi-row mutation runs inside [`LedgerStore::transaction`]. The
//! closure receives a [`TxContext`] whose `lock_*` methods take an exclusive
//! row lock (the `SELECT ... FOR UPDATE` analogue) with a bounded wait. Writes
//! are staged and only become visible when the closure returns `Ok` and the
//! commit succeeds; an `Err` discards every staged write.
//!
//! - [`memory::MemoryStore`]: in-process tables with row locks and an optional
//!   durable journal ([`wal::Journal`]).

pub mod memory;
pub mod wal;

use std::fmt;

use crate::error::EngineResult;
use crate::types::{
    AllocationRecord, ItemId, ItemSupply, Ownership, PrivilegeExecution, PrivilegeId,
    PrivilegeUsage, UserId,
};

/// Primary key of a lockable row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    /// `(user, item)` ownership row.
    Ownership(UserId, ItemId),
    /// Issued-supply row of an item.
    ItemSupply(ItemId),
    /// Allocation record slot of an external event id.
    Allocation(String),
    /// `(user, privilege)` execution row.
    Execution(UserId, PrivilegeId),
    /// Aggregate usage row of a privilege.
    PrivilegeUsage(PrivilegeId),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ownership(user, item) => write!(f, "ownership({user},{item})"),
            Self::ItemSupply(item) => write!(f, "item_supply({item})"),
            Self::Allocation(event) => write!(f, "allocation({event})"),
            Self::Execution(user, privilege) => write!(f, "execution({user},{privilege})"),
            Self::PrivilegeUsage(privilege) => write!(f, "privilege_usage({privilege})"),
        }
    }
}

/// After-image of one row, as staged by a transaction and journaled on commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowImage {
    /// Ownership row.
    Ownership(Ownership),
    /// Item supply row.
    ItemSupply(ItemSupply),
    /// Allocation record (insert-only).
    Allocation(AllocationRecord),
    /// Execution row.
    Execution(PrivilegeExecution),
    /// Privilege usage row.
    PrivilegeUsage(PrivilegeUsage),
}

impl RowImage {
    /// Key of the row this image writes.
    #[must_use]
    pub fn key(&self) -> RowKey {
        match self {
            Self::Ownership(o) => RowKey::Ownership(o.user_id, o.item_id),
            Self::ItemSupply(s) => RowKey::ItemSupply(s.item_id),
            Self::Allocation(a) => RowKey::Allocation(a.event_id.clone()),
            Self::Execution(e) => RowKey::Execution(e.user_id, e.privilege_id),
            Self::PrivilegeUsage(u) => RowKey::PrivilegeUsage(u.privilege_id),
        }
    }
}

/// Row-level interface available inside a transaction.
///
/// `lock_*` returns the transaction's own staged value if it already wrote the
/// row, otherwise the latest committed value (or an empty row).
pub trait TxContext {
    /// Locks and reads an ownership row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the row stays locked past the bounded wait.
    fn lock_ownership(&mut self, user_id: UserId, item_id: ItemId) -> EngineResult<Ownership>;

    /// Stages an ownership row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `StorageUnavailable`.
    fn put_ownership(&mut self, row: Ownership) -> EngineResult<()>;

    /// Locks and reads an item supply row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the row stays locked past the bounded wait.
    fn lock_item_supply(&mut self, item_id: ItemId) -> EngineResult<ItemSupply>;

    /// Stages an item supply row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `StorageUnavailable`.
    fn put_item_supply(&mut self, row: ItemSupply) -> EngineResult<()>;

    /// Locks the allocation slot of `event_id` and returns the committed
    /// record, if any. Holding the slot serialises concurrent deliveries of the
    /// same event.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if another delivery holds the slot past the bounded wait.
    fn lock_allocation_slot(&mut self, event_id: &str) -> EngineResult<Option<AllocationRecord>>;

    /// Stages a new allocation record.
    ///
    /// # Errors
    ///
    /// `DuplicateEvent` if a record with the same event id exists.
    fn insert_allocation(&mut self, record: AllocationRecord) -> EngineResult<()>;

    /// Locks and reads an execution row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the row stays locked past the bounded wait.
    fn lock_execution(
        &mut self,
        user_id: UserId,
        privilege_id: PrivilegeId,
    ) -> EngineResult<PrivilegeExecution>;

    /// Stages an execution row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `StorageUnavailable`.
    fn put_execution(&mut self, row: PrivilegeExecution) -> EngineResult<()>;

    /// Locks and reads a privilege usage row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the row stays locked past the bounded wait.
    fn lock_privilege_usage(&mut self, privilege_id: PrivilegeId) -> EngineResult<PrivilegeUsage>;

    /// Stages a privilege usage row.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `StorageUnavailable`.
    fn put_privilege_usage(&mut self, row: PrivilegeUsage) -> EngineResult<()>;
}

/// A transactional store of ledger rows.
pub trait LedgerStore: Send + Sync {
    /// Runs `f` in a transaction. Commits on `Ok`, rolls back on `Err`.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns, or a commit failure.
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn TxContext) -> EngineResult<T>;

    /// Committed ownership row.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn ownership(&self, user_id: UserId, item_id: ItemId) -> EngineResult<Option<Ownership>>;

    /// Every committed ownership row of a user, sorted by item id.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn ownerships_of(&self, user_id: UserId) -> EngineResult<Vec<Ownership>>;

    /// Every committed ownership row of an item, sorted by user id.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn holders_of(&self, item_id: ItemId) -> EngineResult<Vec<Ownership>>;

    /// Committed supply row (zero if never issued).
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn item_supply(&self, item_id: ItemId) -> EngineResult<ItemSupply>;

    /// Committed allocation record of an event.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn allocation(&self, event_id: &str) -> EngineResult<Option<AllocationRecord>>;

    /// Number of committed allocation records.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn allocation_count(&self) -> EngineResult<usize>;

    /// Committed execution row.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn execution(
        &self,
        user_id: UserId,
        privilege_id: PrivilegeId,
    ) -> EngineResult<Option<PrivilegeExecution>>;

    /// Committed usage row (zero if never executed).
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the backend cannot be read.
    fn privilege_usage(&self, privilege_id: PrivilegeId) -> EngineResult<PrivilegeUsage>;
}

pub use memory::MemoryStore;
