//! # In-Process Ledger Store
//!
//! Committed tables behind a `RwLock`, a row lock manager, and an optional
//! durable [`Journal`].
//!
//! ## Transaction Model
//!
//! ```text
//! begin ──> lock rows (bounded wait) ──> stage after-images
//!                                              │
//!              Err ◄── closure fails ──────────┤
//!         (drop staged,                        ▼ Ok
//!          release locks)     journal append + fsync ──> apply to tables
//!                                              │
//!                                              ▼
//!                                       release locks
//! ```
//!
//! Locks are held until after the commit is applied (strict two-phase
//! locking), so a reader that locks a row always sees the latest committed
//! value. Lock waits are bounded; a timeout surfaces as the retryable
//! `LockTimeout` error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::store::wal::Journal;
use crate::store::{LedgerStore, RowImage, RowKey, TxContext};
use crate::types::{
    AllocationRecord, ItemId, ItemSupply, Ownership, PrivilegeExecution, PrivilegeId,
    PrivilegeUsage, UserId,
};

/// Default bounded wait for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Committed rows.
#[derive(Debug, Default)]
struct Tables {
    ownerships: BTreeMap<(UserId, ItemId), Ownership>,
    supplies: HashMap<ItemId, ItemSupply>,
    allocations: HashMap<String, AllocationRecord>,
    executions: HashMap<(UserId, PrivilegeId), PrivilegeExecution>,
    usage: HashMap<PrivilegeId, PrivilegeUsage>,
}

impl Tables {
    fn apply(&mut self, row: RowImage) {
        match row {
            RowImage::Ownership(o) => {
                self.ownerships.insert((o.user_id, o.item_id), o);
            }
            RowImage::ItemSupply(s) => {
                self.supplies.insert(s.item_id, s);
            }
            RowImage::Allocation(a) => {
                self.allocations.insert(a.event_id.clone(), a);
            }
            RowImage::Execution(e) => {
                self.executions.insert((e.user_id, e.privilege_id), e);
            }
            RowImage::PrivilegeUsage(u) => {
                self.usage.insert(u.privilege_id, u);
            }
        }
    }

    fn snapshot(&self) -> Vec<RowImage> {
        self.ownerships
            .values()
            .copied()
            .map(RowImage::Ownership)
            .chain(self.supplies.values().copied().map(RowImage::ItemSupply))
            .chain(self.allocations.values().cloned().map(RowImage::Allocation))
            .chain(self.executions.values().copied().map(RowImage::Execution))
            .chain(self.usage.values().copied().map(RowImage::PrivilegeUsage))
            .collect()
    }
}

/// Exclusive row locks with bounded waits.
#[derive(Debug, Default)]
struct RowLocks {
    held: Mutex<HashSet<RowKey>>,
    released: Condvar,
}

impl RowLocks {
    fn acquire(&self, key: &RowKey, timeout: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while held.contains(key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                tracing::warn!("lock wait on {} exceeded {:?}", key, timeout);
                return Err(EngineError::LockTimeout {
                    resource: key.to_string(),
                });
            }
        }
        held.insert(key.clone());
        Ok(())
    }

    fn release(&self, keys: impl Iterator<Item = RowKey>) {
        let mut held = self.held.lock();
        for key in keys {
            held.remove(&key);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// In-process transactional ledger store.
///
/// `MemoryStore` is `Send + Sync`; share it behind an `Arc`.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    locks: RowLocks,
    lock_timeout: Duration,
    journal: Option<Journal>,
    write_fault: Mutex<Option<usize>>,
}

impl MemoryStore {
    /// Creates a volatile store with the default lock timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a volatile store with a custom lock timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            locks: RowLocks::default(),
            lock_timeout,
            journal: None,
            write_fault: Mutex::new(None),
        }
    }

    /// Opens a journaled store, replaying every committed transaction.
    ///
    /// # Errors
    ///
    /// Returns `Journal` if the journal cannot be opened or recovered.
    pub fn open_durable(path: impl AsRef<Path>, lock_timeout: Duration) -> EngineResult<Self> {
        let (journal, recovered) = Journal::open(path)?;

        let mut tables = Tables::default();
        for transaction in recovered {
            for row in transaction {
                tables.apply(row);
            }
        }

        Ok(Self {
            tables: RwLock::new(tables),
            locks: RowLocks::default(),
            lock_timeout,
            journal: Some(journal),
            write_fault: Mutex::new(None),
        })
    }

    /// The configured lock timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Path of the journal, if durable.
    #[must_use]
    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(Journal::path)
    }

    /// Compacts the journal to one snapshot transaction. No-op when volatile.
    ///
    /// # Errors
    ///
    /// Returns `Journal` if the snapshot cannot be written.
    pub fn checkpoint(&self) -> EngineResult<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        // Read lock blocks commits, so the snapshot is consistent.
        let tables = self.tables.read();
        journal.checkpoint(&tables.snapshot())
    }

    /// Makes the next transaction fail on its `after_writes + 1`-th staged
    /// write with `StorageUnavailable`. Used to verify rollback.
    pub fn inject_write_fault(&self, after_writes: usize) {
        *self.write_fault.lock() = Some(after_writes);
    }

    fn begin(&self) -> MemoryTx<'_> {
        MemoryTx {
            store: self,
            held: HashSet::new(),
            staged: BTreeMap::new(),
            writes: 0,
            fail_after: self.write_fault.lock().take(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One open transaction against a [`MemoryStore`].
struct MemoryTx<'a> {
    store: &'a MemoryStore,
    held: HashSet<RowKey>,
    staged: BTreeMap<RowKey, RowImage>,
    writes: usize,
    fail_after: Option<usize>,
}

impl MemoryTx<'_> {
    fn lock(&mut self, key: &RowKey) -> EngineResult<()> {
        if self.held.contains(key) {
            return Ok(());
        }
        self.store.locks.acquire(key, self.store.lock_timeout)?;
        self.held.insert(key.clone());
        Ok(())
    }

    fn stage(&mut self, row: RowImage) -> EngineResult<()> {
        let key = row.key();
        self.lock(&key)?;
        if let Some(limit) = self.fail_after {
            if self.writes >= limit {
                return Err(EngineError::StorageUnavailable(format!(
                    "injected write fault on {key}"
                )));
            }
        }
        self.writes += 1;
        self.staged.insert(key, row);
        Ok(())
    }

    fn commit(mut self) -> EngineResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let rows: Vec<RowImage> = std::mem::take(&mut self.staged).into_values().collect();

        let mut tables = self.store.tables.write();
        for row in &rows {
            if let RowImage::Allocation(record) = row {
                if tables.allocations.contains_key(&record.event_id) {
                    return Err(EngineError::DuplicateEvent(record.event_id.clone()));
                }
            }
        }

        if let Some(journal) = &self.store.journal {
            journal.append_transaction(&rows)?;
        }

        tracing::debug!("committing {} rows", rows.len());
        for row in rows {
            tables.apply(row);
        }
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.store.locks.release(self.held.drain());
        }
    }
}

impl TxContext for MemoryTx<'_> {
    fn lock_ownership(&mut self, user_id: UserId, item_id: ItemId) -> EngineResult<Ownership> {
        let key = RowKey::Ownership(user_id, item_id);
        self.lock(&key)?;
        if let Some(RowImage::Ownership(row)) = self.staged.get(&key) {
            return Ok(*row);
        }
        Ok(self
            .store
            .tables
            .read()
            .ownerships
            .get(&(user_id, item_id))
            .copied()
            .unwrap_or_else(|| Ownership::empty(user_id, item_id)))
    }

    fn put_ownership(&mut self, row: Ownership) -> EngineResult<()> {
        self.stage(RowImage::Ownership(row))
    }

    fn lock_item_supply(&mut self, item_id: ItemId) -> EngineResult<ItemSupply> {
        let key = RowKey::ItemSupply(item_id);
        self.lock(&key)?;
        if let Some(RowImage::ItemSupply(row)) = self.staged.get(&key) {
            return Ok(*row);
        }
        Ok(self
            .store
            .tables
            .read()
            .supplies
            .get(&item_id)
            .copied()
            .unwrap_or(ItemSupply {
                item_id,
                total_issued: 0,
            }))
    }

    fn put_item_supply(&mut self, row: ItemSupply) -> EngineResult<()> {
        self.stage(RowImage::ItemSupply(row))
    }

    fn lock_allocation_slot(&mut self, event_id: &str) -> EngineResult<Option<AllocationRecord>> {
        let key = RowKey::Allocation(event_id.to_string());
        self.lock(&key)?;
        if let Some(RowImage::Allocation(record)) = self.staged.get(&key) {
            return Ok(Some(record.clone()));
        }
        Ok(self.store.tables.read().allocations.get(event_id).cloned())
    }

    fn insert_allocation(&mut self, record: AllocationRecord) -> EngineResult<()> {
        let key = RowKey::Allocation(record.event_id.clone());
        self.lock(&key)?;
        let exists = self.staged.contains_key(&key)
            || self
                .store
                .tables
                .read()
                .allocations
                .contains_key(&record.event_id);
        if exists {
            return Err(EngineError::DuplicateEvent(record.event_id));
        }
        self.stage(RowImage::Allocation(record))
    }

    fn lock_execution(
        &mut self,
        user_id: UserId,
        privilege_id: PrivilegeId,
    ) -> EngineResult<PrivilegeExecution> {
        let key = RowKey::Execution(user_id, privilege_id);
        self.lock(&key)?;
        if let Some(RowImage::Execution(row)) = self.staged.get(&key) {
            return Ok(*row);
        }
        Ok(self
            .store
            .tables
            .read()
            .executions
            .get(&(user_id, privilege_id))
            .copied()
            .unwrap_or(PrivilegeExecution {
                user_id,
                privilege_id,
                execution_times: 0,
            }))
    }

    fn put_execution(&mut self, row: PrivilegeExecution) -> EngineResult<()> {
        self.stage(RowImage::Execution(row))
    }

    fn lock_privilege_usage(&mut self, privilege_id: PrivilegeId) -> EngineResult<PrivilegeUsage> {
        let key = RowKey::PrivilegeUsage(privilege_id);
        self.lock(&key)?;
        if let Some(RowImage::PrivilegeUsage(row)) = self.staged.get(&key) {
            return Ok(*row);
        }
        Ok(self
            .store
            .tables
            .read()
            .usage
            .get(&privilege_id)
            .copied()
            .unwrap_or(PrivilegeUsage {
                privilege_id,
                executed_total: 0,
            }))
    }

    fn put_privilege_usage(&mut self, row: PrivilegeUsage) -> EngineResult<()> {
        self.stage(RowImage::PrivilegeUsage(row))
    }
}

impl LedgerStore for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn TxContext) -> EngineResult<T>,
    {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!("transaction rolled back: {}", e);
                Err(e)
            }
        }
    }

    fn ownership(&self, user_id: UserId, item_id: ItemId) -> EngineResult<Option<Ownership>> {
        Ok(self.tables.read().ownerships.get(&(user_id, item_id)).copied())
    }

    fn ownerships_of(&self, user_id: UserId) -> EngineResult<Vec<Ownership>> {
        Ok(self
            .tables
            .read()
            .ownerships
            .range((user_id, ItemId::MIN)..=(user_id, ItemId::MAX))
            .map(|(_, row)| *row)
            .collect())
    }

    fn holders_of(&self, item_id: ItemId) -> EngineResult<Vec<Ownership>> {
        Ok(self
            .tables
            .read()
            .ownerships
            .values()
            .filter(|row| row.item_id == item_id)
            .copied()
            .collect())
    }

    fn item_supply(&self, item_id: ItemId) -> EngineResult<ItemSupply> {
        Ok(self
            .tables
            .read()
            .supplies
            .get(&item_id)
            .copied()
            .unwrap_or(ItemSupply {
                item_id,
                total_issued: 0,
            }))
    }

    fn allocation(&self, event_id: &str) -> EngineResult<Option<AllocationRecord>> {
        Ok(self.tables.read().allocations.get(event_id).cloned())
    }

    fn allocation_count(&self) -> EngineResult<usize> {
        Ok(self.tables.read().allocations.len())
    }

    fn execution(
        &self,
        user_id: UserId,
        privilege_id: PrivilegeId,
    ) -> EngineResult<Option<PrivilegeExecution>> {
        Ok(self
            .tables
            .read()
            .executions
            .get(&(user_id, privilege_id))
            .copied())
    }

    fn privilege_usage(&self, privilege_id: PrivilegeId) -> EngineResult<PrivilegeUsage> {
        Ok(self
            .tables
            .read()
            .usage
            .get(&privilege_id)
            .copied()
            .unwrap_or(PrivilegeUsage {
                privilege_id,
                executed_total: 0,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AwardedItem, ContributionSource};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn temp_journal_path() -> std::path::PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_store_{id}_{}.rlqj", std::process::id()))
    }

    fn record(event_id: &str) -> AllocationRecord {
        AllocationRecord {
            event_id: event_id.to_string(),
            user_id: 1,
            campaign_id: 1,
            source: ContributionSource::Payment,
            amount: 100,
            draw_count: 1,
            items: vec![AwardedItem::new(10, 1)],
            recorded_at: 0,
        }
    }

    fn credit(tx: &mut dyn TxContext, user_id: UserId, item_id: ItemId, count: u64) -> EngineResult<()> {
        let mut row = tx.lock_ownership(user_id, item_id)?;
        row.owned += count;
        tx.put_ownership(row)
    }

    #[test]
    fn test_commit_makes_rows_visible() {
        let store = MemoryStore::new();
        store.transaction(|tx| credit(tx, 1, 10, 3)).unwrap();
        assert_eq!(store.ownership(1, 10).unwrap().map(|o| o.owned), Some(3));
        assert_eq!(store.ownerships_of(1).unwrap().len(), 1);
        assert!(store.ownerships_of(2).unwrap().is_empty());
    }

    #[test]
    fn test_error_rolls_back_every_staged_write() {
        let store = MemoryStore::new();
        let result: EngineResult<()> = store.transaction(|tx| {
            credit(tx, 1, 10, 3)?;
            credit(tx, 1, 11, 3)?;
            Err(EngineError::StorageUnavailable("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.ownership(1, 10).unwrap(), None);
        assert_eq!(store.ownership(1, 11).unwrap(), None);
    }

    #[test]
    fn test_reads_see_own_staged_writes() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| {
                credit(tx, 1, 10, 2)?;
                credit(tx, 1, 10, 2)?;
                assert_eq!(tx.lock_ownership(1, 10)?.owned, 4);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.ownership(1, 10).unwrap().map(|o| o.owned), Some(4));
    }

    #[test]
    fn test_injected_fault_fails_nth_write() {
        let store = MemoryStore::new();
        store.inject_write_fault(1);
        let result = store.transaction(|tx| {
            credit(tx, 1, 10, 1)?;
            credit(tx, 1, 11, 1)
        });
        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
        assert_eq!(store.ownership(1, 10).unwrap(), None);

        // The fault is one-shot.
        store.transaction(|tx| credit(tx, 1, 10, 1)).unwrap();
        assert!(store.ownership(1, 10).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_allocation_rejected() {
        let store = MemoryStore::new();
        store.transaction(|tx| tx.insert_allocation(record("evt"))).unwrap();
        let result = store.transaction(|tx| tx.insert_allocation(record("evt")));
        assert!(matches!(result, Err(EngineError::DuplicateEvent(id)) if id == "evt"));
        assert_eq!(store.allocation_count().unwrap(), 1);
    }

    #[test]
    fn test_lock_wait_is_bounded() {
        let store = Arc::new(MemoryStore::with_lock_timeout(Duration::from_millis(20)));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .transaction(|tx| {
                        tx.lock_ownership(1, 10)?;
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let result = store.transaction(|tx| tx.lock_ownership(1, 10));
        assert!(matches!(result, Err(EngineError::LockTimeout { .. })));
        assert!(result.unwrap_err().is_transient());

        // Unrelated rows stay available.
        store.transaction(|tx| tx.lock_ownership(1, 11)).unwrap();

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        store.transaction(|tx| tx.lock_ownership(1, 10)).unwrap();
    }

    #[test]
    fn test_durable_store_recovers_committed_state() {
        let path = temp_journal_path();
        {
            let store = MemoryStore::open_durable(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
            store
                .transaction(|tx| {
                    credit(tx, 1, 10, 5)?;
                    tx.insert_allocation(record("evt-1"))
                })
                .unwrap();
            let _ = store.transaction(|tx| {
                credit(tx, 1, 10, 100)?;
                Err::<(), _>(EngineError::StorageUnavailable("crash".into()))
            });
        }
        {
            let store = MemoryStore::open_durable(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
            assert_eq!(store.ownership(1, 10).unwrap().map(|o| o.owned), Some(5));
            assert!(store.allocation("evt-1").unwrap().is_some());
            store.checkpoint().unwrap();
        }
        {
            let store = MemoryStore::open_durable(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
            assert_eq!(store.ownership(1, 10).unwrap().map(|o| o.owned), Some(5));
        }
        std::fs::remove_file(&path).ok();
    }
}
