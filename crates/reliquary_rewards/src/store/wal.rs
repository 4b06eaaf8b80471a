//! # Ledger Journal
//!
//! **Crash-safe commit log for the in-process store**
//!
//! Every committed transaction is appended as one contiguous block and synced
//! to disk *before* the in-memory tables change:
//!
//! - Committed transactions: replayed on open
//! - Transactions without a COMMIT record (crash mid-append): discarded, and
//!   the torn tail is truncated so later appends stay readable
//!
//! Rows are journaled as after-images, so replaying a transaction twice yields
//! the same state.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "RLQJ"]
//! [4 bytes: version]
//! [8 bytes: LSN at last checkpoint]
//!
//! Record format:
//! [8 bytes: LSN]
//! [1 byte: record type (BEGIN/ROW/COMMIT)]
//! [4 bytes: payload length]
//! [N bytes: payload (encoded row image)]
//! [4 bytes: CRC32 of above]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::store::RowImage;
use crate::types::{
    AllocationRecord, AwardedItem, ContributionSource, ItemSupply, Ownership, PrivilegeExecution,
    PrivilegeUsage,
};

/// Magic bytes identifying a journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"RLQJ";

/// Current journal format version.
const JOURNAL_VERSION: u32 = 1;

/// Header length in bytes.
const HEADER_LEN: u64 = 16;

/// Fixed bytes per record around the payload (lsn + type + len + crc).
const RECORD_OVERHEAD: usize = 8 + 1 + 4 + 4;

/// Journal record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin a transaction.
    Begin = 1,
    /// One row image within a transaction.
    Row = 2,
    /// Commit the transaction.
    Commit = 3,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Row),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Row image tags.
mod tag {
    pub const OWNERSHIP: u8 = 1;
    pub const ITEM_SUPPLY: u8 = 2;
    pub const ALLOCATION: u8 = 3;
    pub const EXECUTION: u8 = 4;
    pub const PRIVILEGE_USAGE: u8 = 5;
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Encodes a row image.
#[must_use]
pub fn encode_row(row: &RowImage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(48);
    match row {
        RowImage::Ownership(o) => {
            buf.push(tag::OWNERSHIP);
            put_u64(&mut buf, o.user_id);
            put_u64(&mut buf, o.item_id);
            put_u64(&mut buf, o.owned);
            put_u64(&mut buf, o.shipped);
            put_u64(&mut buf, o.consumed);
        }
        RowImage::ItemSupply(s) => {
            buf.push(tag::ITEM_SUPPLY);
            put_u64(&mut buf, s.item_id);
            put_u64(&mut buf, s.total_issued);
        }
        RowImage::Allocation(a) => {
            buf.push(tag::ALLOCATION);
            put_u32(&mut buf, len_u32(a.event_id.len()));
            buf.extend_from_slice(a.event_id.as_bytes());
            put_u64(&mut buf, a.user_id);
            put_u64(&mut buf, a.campaign_id);
            buf.push(a.source as u8);
            put_u64(&mut buf, a.amount);
            put_u64(&mut buf, a.draw_count);
            put_u64(&mut buf, a.recorded_at);
            put_u32(&mut buf, len_u32(a.items.len()));
            for item in &a.items {
                put_u64(&mut buf, item.item_id);
                put_u64(&mut buf, item.count);
            }
        }
        RowImage::Execution(e) => {
            buf.push(tag::EXECUTION);
            put_u64(&mut buf, e.user_id);
            put_u64(&mut buf, e.privilege_id);
            put_u64(&mut buf, e.execution_times);
        }
        RowImage::PrivilegeUsage(u) => {
            buf.push(tag::PRIVILEGE_USAGE);
            put_u64(&mut buf, u.privilege_id);
            put_u64(&mut buf, u.executed_total);
        }
    }
    buf
}

/// Lengths are bounded by event ids and award lists, far below `u32::MAX`.
fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Little-endian reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)?.try_into().ok().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8)?.try_into().ok().map(u64::from_le_bytes)
    }

    const fn consumed(&self) -> usize {
        self.pos
    }
}

/// Decodes a row image. Returns `None` on malformed input.
#[must_use]
pub fn decode_row(data: &[u8]) -> Option<RowImage> {
    let mut r = Reader::new(data);
    match r.u8()? {
        tag::OWNERSHIP => Some(RowImage::Ownership(Ownership {
            user_id: r.u64()?,
            item_id: r.u64()?,
            owned: r.u64()?,
            shipped: r.u64()?,
            consumed: r.u64()?,
        })),
        tag::ITEM_SUPPLY => Some(RowImage::ItemSupply(ItemSupply {
            item_id: r.u64()?,
            total_issued: r.u64()?,
        })),
        tag::ALLOCATION => {
            let id_len = r.u32()? as usize;
            let event_id = String::from_utf8(r.bytes(id_len)?.to_vec()).ok()?;
            let user_id = r.u64()?;
            let campaign_id = r.u64()?;
            let source = ContributionSource::from_u8(r.u8()?)?;
            let amount = r.u64()?;
            let draw_count = r.u64()?;
            let recorded_at = r.u64()?;
            let count = r.u32()? as usize;
            let items = (0..count)
                .map(|_| Some(AwardedItem::new(r.u64()?, r.u64()?)))
                .collect::<Option<Vec<_>>>()?;
            Some(RowImage::Allocation(AllocationRecord {
                event_id,
                user_id,
                campaign_id,
                source,
                amount,
                draw_count,
                items,
                recorded_at,
            }))
        }
        tag::EXECUTION => Some(RowImage::Execution(PrivilegeExecution {
            user_id: r.u64()?,
            privilege_id: r.u64()?,
            execution_times: r.u64()?,
        })),
        tag::PRIVILEGE_USAGE => Some(RowImage::PrivilegeUsage(PrivilegeUsage {
            privilege_id: r.u64()?,
            executed_total: r.u64()?,
        })),
        _ => None,
    }
}

/// Appends one framed record to `buf`.
fn frame_record(buf: &mut Vec<u8>, lsn: u64, record_type: RecordType, payload: &[u8]) {
    let start = buf.len();
    put_u64(buf, lsn);
    buf.push(record_type as u8);
    put_u32(buf, len_u32(payload.len()));
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[start..]);
    put_u32(buf, crc);
}

/// A record read back from disk.
#[derive(Clone, Debug)]
struct JournalRecord {
    lsn: u64,
    record_type: RecordType,
    payload: Vec<u8>,
}

/// Reads one record; `None` on end of data, truncation or CRC mismatch.
fn read_record(data: &[u8]) -> Option<(JournalRecord, usize)> {
    let mut r = Reader::new(data);
    let lsn = r.u64()?;
    let type_byte = r.u8()?;
    let len = r.u32()? as usize;
    let payload = r.bytes(len)?.to_vec();
    let body_len = r.consumed();
    let stored_crc = r.u32()?;

    if crc32fast::hash(&data[..body_len]) != stored_crc {
        return None;
    }

    let record_type = RecordType::from_u8(type_byte)?;
    Some((
        JournalRecord {
            lsn,
            record_type,
            payload,
        },
        body_len + 4,
    ))
}

fn header_bytes(lsn: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN as usize);
    buf.extend_from_slice(JOURNAL_MAGIC);
    put_u32(&mut buf, JOURNAL_VERSION);
    put_u64(&mut buf, lsn);
    buf
}

/// True for an empty file, or a header cut short by a crash during creation.
fn is_unwritten(data: &[u8]) -> bool {
    if data.len() >= HEADER_LEN as usize {
        return false;
    }
    let expected = header_bytes(0);
    data.iter().all(|&b| b == 0) || expected.starts_with(data)
}

fn io_err(context: &str) -> impl Fn(std::io::Error) -> EngineError + '_ {
    move |e| EngineError::Journal(format!("{context}: {e}"))
}

/// Mutable journal state, guarded by one mutex.
struct JournalFile {
    file: File,
    /// Length of the durable, well-formed prefix.
    len: u64,
    next_lsn: u64,
    /// Set when a failed append could not be cut back. Every later append is
    /// refused until a checkpoint rewrites the file.
    poisoned: bool,
}

/// Result of scanning an existing journal.
struct Recovery {
    transactions: Vec<Vec<RowImage>>,
    valid_len: u64,
    next_lsn: u64,
    discarded: usize,
}

/// Append-only journal of committed ledger transactions.
pub struct Journal {
    path: PathBuf,
    state: Mutex<JournalFile>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Journal {
    /// Opens or creates a journal and recovers it.
    ///
    /// Returns the journal and the committed transactions to replay, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `Journal` if the file cannot be opened or has a foreign header.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<(Self, Vec<Vec<RowImage>>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err("failed to open journal"))?;

        let data = fs::read(&path).map_err(io_err("failed to read journal"))?;

        let recovery = if is_unwritten(&data) {
            if !data.is_empty() {
                tracing::warn!(
                    "journal {}: discarding {} byte partial header",
                    path.display(),
                    data.len()
                );
                file.set_len(0)
                    .map_err(io_err("failed to truncate journal"))?;
            }
            file.write_all(&header_bytes(0))
                .map_err(io_err("failed to write journal header"))?;
            file.sync_all().map_err(io_err("failed to sync journal"))?;
            Recovery {
                transactions: Vec::new(),
                valid_len: HEADER_LEN,
                next_lsn: 0,
                discarded: 0,
            }
        } else {
            Self::recover(&data)?
        };

        if recovery.valid_len < data.len() as u64 {
            tracing::warn!(
                "journal {}: truncating {} bytes of incomplete tail",
                path.display(),
                data.len() as u64 - recovery.valid_len
            );
            file.set_len(recovery.valid_len)
                .map_err(io_err("failed to truncate journal"))?;
        }
        if recovery.discarded > 0 {
            tracing::warn!(
                "journal {}: {} uncommitted transactions rolled back",
                path.display(),
                recovery.discarded
            );
        }
        file.seek(SeekFrom::Start(recovery.valid_len))
            .map_err(io_err("failed to seek journal"))?;

        tracing::info!(
            "journal {} recovered {} committed transactions",
            path.display(),
            recovery.transactions.len()
        );

        let journal = Self {
            path,
            state: Mutex::new(JournalFile {
                file,
                len: recovery.valid_len,
                next_lsn: recovery.next_lsn,
                poisoned: false,
            }),
        };
        Ok((journal, recovery.transactions))
    }

    /// Scans `data` and collects committed transactions.
    fn recover(data: &[u8]) -> EngineResult<Recovery> {
        if data.len() < HEADER_LEN as usize || &data[0..4] != JOURNAL_MAGIC {
            return Err(EngineError::Journal("invalid journal magic".to_string()));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != JOURNAL_VERSION {
            return Err(EngineError::Journal(format!(
                "unsupported journal version: {version}"
            )));
        }
        let mut lsn_bytes = [0u8; 8];
        lsn_bytes.copy_from_slice(&data[8..16]);
        let checkpoint_lsn = u64::from_le_bytes(lsn_bytes);

        let mut transactions = Vec::new();
        let mut pending: Option<Vec<RowImage>> = None;
        let mut discarded = 0;
        let mut offset = HEADER_LEN as usize;
        let mut valid_len = HEADER_LEN;
        let mut next_lsn = checkpoint_lsn;

        while let Some((record, consumed)) = read_record(&data[offset..]) {
            offset += consumed;
            next_lsn = next_lsn.max(record.lsn.saturating_add(1));

            match record.record_type {
                RecordType::Begin => {
                    if pending.replace(Vec::new()).is_some() {
                        discarded += 1;
                    }
                }
                RecordType::Row => {
                    let Some(rows) = pending.as_mut() else {
                        break;
                    };
                    let Some(row) = decode_row(&record.payload) else {
                        break;
                    };
                    rows.push(row);
                }
                RecordType::Commit => {
                    let Some(rows) = pending.take() else {
                        break;
                    };
                    transactions.push(rows);
                    valid_len = offset as u64;
                }
            }
        }

        if pending.is_some() {
            discarded += 1;
        }

        Ok(Recovery {
            transactions,
            valid_len,
            next_lsn,
            discarded,
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends one transaction. Returns the LSN of its COMMIT record.
    ///
    /// On failure the file is cut back to its previous length. If that cut
    /// fails too the journal is poisoned and refuses every later append, so no
    /// commit can land behind an unreadable record.
    ///
    /// # Errors
    ///
    /// Returns `Journal` if the write or sync fails, or the journal is
    /// poisoned.
    pub fn append_transaction(&self, rows: &[RowImage]) -> EngineResult<u64> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(EngineError::Journal(format!(
                "journal {} is poisoned by an earlier failed append",
                self.path.display()
            )));
        }

        let mut lsn = state.next_lsn;
        let mut buf = Vec::with_capacity(rows.len() * (RECORD_OVERHEAD + 48) + 2 * RECORD_OVERHEAD);
        frame_record(&mut buf, lsn, RecordType::Begin, &[]);
        for row in rows {
            lsn += 1;
            frame_record(&mut buf, lsn, RecordType::Row, &encode_row(row));
        }
        lsn += 1;
        frame_record(&mut buf, lsn, RecordType::Commit, &[]);

        let result = state
            .file
            .write_all(&buf)
            .and_then(|()| state.file.sync_data());

        if let Err(e) = result {
            let len = state.len;
            let rewound = state
                .file
                .set_len(len)
                .and_then(|()| state.file.seek(SeekFrom::Start(len)));
            if let Err(rewind) = rewound {
                tracing::error!(
                    "journal {} poisoned: cannot cut back failed append: {}",
                    self.path.display(),
                    rewind
                );
                state.poisoned = true;
            }
            return Err(EngineError::Journal(format!("journal append failed: {e}")));
        }

        state.len += buf.len() as u64;
        state.next_lsn = lsn + 1;
        Ok(lsn)
    }

    /// Replaces the journal with a single transaction holding `snapshot`.
    ///
    /// Call with a consistent image of every committed row.
    ///
    /// # Errors
    ///
    /// Returns `Journal` if the compacted file cannot be written or swapped in.
    pub fn checkpoint(&self, snapshot: &[RowImage]) -> EngineResult<()> {
        let mut state = self.state.lock();

        let mut lsn = state.next_lsn;
        let mut buf = header_bytes(lsn);
        frame_record(&mut buf, lsn, RecordType::Begin, &[]);
        for row in snapshot {
            lsn += 1;
            frame_record(&mut buf, lsn, RecordType::Row, &encode_row(row));
        }
        lsn += 1;
        frame_record(&mut buf, lsn, RecordType::Commit, &[]);

        let tmp_path = self.path.with_extension("checkpoint");
        {
            let mut tmp = File::create(&tmp_path).map_err(io_err("failed to create checkpoint"))?;
            tmp.write_all(&buf).map_err(io_err("failed to write checkpoint"))?;
            tmp.sync_all().map_err(io_err("failed to sync checkpoint"))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err("failed to swap checkpoint"))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(io_err("failed to reopen journal"))?;
        file.seek(SeekFrom::End(0))
            .map_err(io_err("failed to seek journal"))?;

        state.file = file;
        state.len = buf.len() as u64;
        state.next_lsn = lsn + 1;
        state.poisoned = false;

        tracing::info!(
            "journal {} checkpointed with {} rows",
            self.path.display(),
            snapshot.len()
        );
        Ok(())
    }

    /// Swaps in a read-only handle so that writes and truncation both fail.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&self) -> EngineResult<()> {
        let file = File::open(&self.path).map_err(io_err("failed to reopen journal"))?;
        self.state.lock().file = file;
        Ok(())
    }

    /// Appends a BEGIN and rows without COMMIT, as a crash mid-append would.
    #[cfg(test)]
    pub(crate) fn append_torn(&self, rows: &[RowImage]) -> EngineResult<()> {
        let mut state = self.state.lock();
        let mut lsn = state.next_lsn;
        let mut buf = Vec::new();
        frame_record(&mut buf, lsn, RecordType::Begin, &[]);
        for row in rows {
            lsn += 1;
            frame_record(&mut buf, lsn, RecordType::Row, &encode_row(row));
        }
        state
            .file
            .write_all(&buf)
            .and_then(|()| state.file.sync_data())
            .map_err(io_err("torn append failed"))?;
        state.len += buf.len() as u64;
        state.next_lsn = lsn + 1;
        Ok(())
    }
}
