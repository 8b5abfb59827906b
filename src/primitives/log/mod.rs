#![forbid(unsafe_code)]

//! Append-only log of typed, addressed records.
//!
//! The file starts with a 32-byte header followed by records, each a 32-byte
//! header plus payload. Records are CRC-chained the same way WAL frames are:
//! the chain value of record `n` is folded into the header of record `n + 1`,
//! so a torn or stale tail is detected during the recovery scan. A record's
//! address is the byte offset of its header, which makes addresses strictly
//! increasing and dense.

use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::FileIo;
use crate::types::{crc32_of, Address, Checksum, Crc32Fast, EnvError, Result, StructureId};

const LOG_MAGIC: [u8; 4] = *b"SOML";
const LOG_FORMAT_VERSION: u16 = 1;
/// Size of the file header preceding the first record.
pub const FILE_HEADER_LEN: usize = 32;
/// Size of the header preceding every record payload.
pub const RECORD_HEADER_LEN: usize = 32;
/// Largest payload a single record may carry.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - RECORD_HEADER_LEN;

/// Type tag of a log record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Non-root leaf page of a unique-key tree.
    Leaf = 1,
    /// Non-root internal page of a unique-key tree.
    Internal = 2,
    /// Root page of a unique-key tree that is a leaf.
    BottomRoot = 3,
    /// Root page of a unique-key tree that is internal.
    Root = 4,
    /// Non-root leaf page of a duplicate tree.
    DupLeaf = 5,
    /// Non-root internal page of a duplicate tree.
    DupInternal = 6,
    /// Root page of a duplicate tree that is a leaf.
    DupBottomRoot = 7,
    /// Root page of a duplicate tree that is internal.
    DupRoot = 8,
    /// Commit record mapping every structure id to its tree root.
    DatabaseRoot = 9,
}

impl RecordKind {
    /// Decodes a kind tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => RecordKind::Leaf,
            2 => RecordKind::Internal,
            3 => RecordKind::BottomRoot,
            4 => RecordKind::Root,
            5 => RecordKind::DupLeaf,
            6 => RecordKind::DupInternal,
            7 => RecordKind::DupBottomRoot,
            8 => RecordKind::DupRoot,
            9 => RecordKind::DatabaseRoot,
            _ => return None,
        })
    }

    /// Returns `true` for tree page kinds that start a tree.
    pub fn is_root(self) -> bool {
        matches!(
            self,
            RecordKind::BottomRoot
                | RecordKind::Root
                | RecordKind::DupBottomRoot
                | RecordKind::DupRoot
        )
    }

    /// Returns `true` for pages of duplicate trees.
    pub fn is_duplicates(self) -> bool {
        matches!(
            self,
            RecordKind::DupLeaf
                | RecordKind::DupInternal
                | RecordKind::DupBottomRoot
                | RecordKind::DupRoot
        )
    }

    /// Returns `true` for leaf page kinds, root or not.
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            RecordKind::Leaf
                | RecordKind::BottomRoot
                | RecordKind::DupLeaf
                | RecordKind::DupBottomRoot
        )
    }
}

/// A record read back from the log.
#[derive(Clone, PartialEq, Eq)]
pub struct Loggable {
    /// Record type.
    pub kind: RecordKind,
    /// Byte offset of the record header.
    pub address: Address,
    /// Tree the record belongs to; `StructureId(0)` for database roots.
    pub structure_id: StructureId,
    /// Record body.
    pub payload: Bytes,
}

impl fmt::Debug for Loggable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loggable")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("structure_id", &self.structure_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Options for opening a log.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Salt written into the header of a new log; seeds the record chain.
    pub salt: u64,
    /// When set, `open` never writes: neither a header nor tail truncation.
    /// Both are deferred to the first append.
    pub readonly: bool,
}

impl LogOptions {
    /// Creates options for a writable log with `salt`.
    pub fn new(salt: u64) -> Self {
        Self {
            salt,
            readonly: false,
        }
    }

    /// Sets the read-only flag.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self::new(0x534f_4d4c_0000_0001)
    }
}

/// Counters describing log activity since open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Records appended.
    pub records_appended: u64,
    /// Bytes appended, record headers included.
    pub bytes_appended: u64,
    /// Explicit syncs.
    pub syncs: u64,
    /// Bytes discarded behind the last complete database root during recovery.
    pub truncated_bytes: u64,
    /// Bytes removed again by [`Log::rollback_to`].
    pub rolled_back_bytes: u64,
}

/// Append position captured by [`Log::mark`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogMark {
    offset: u64,
    chain: u64,
}

impl LogMark {
    /// Address the next record after the mark is written at.
    pub fn address(&self) -> Address {
        Address(self.offset.max(FILE_HEADER_LEN as u64))
    }
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != LOG_MAGIC {
            return Err(EnvError::Corruption("log magic mismatch"));
        }
        if be_u16(&src[4..6]) != LOG_FORMAT_VERSION {
            return Err(EnvError::Corruption("log format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[16..28].iter().any(|b| *b != 0) {
            return Err(EnvError::Corruption("log reserved header bytes non-zero"));
        }
        if crc32_of(&[&src[..28]]) != be_u32(&src[28..32]) {
            return Err(EnvError::Corruption("log header crc mismatch"));
        }
        Ok(Self {
            salt: be_u64(&src[8..16]),
        })
    }
}

#[derive(Clone, Debug)]
struct RecordHeader {
    kind: RecordKind,
    payload_len: u32,
    structure_id: StructureId,
    prev_chain: u64,
    payload_crc32: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.structure_id.0.to_be_bytes());
        buf[16..24].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; RECORD_HEADER_LEN]) -> Result<Self> {
        if crc32_of(&[&src[..28]]) != be_u32(&src[28..32]) {
            return Err(EnvError::Corruption("log record header crc mismatch"));
        }
        if src[1..4] != [0, 0, 0] {
            return Err(EnvError::Corruption("log record reserved bytes non-zero"));
        }
        let kind =
            RecordKind::from_u8(src[0]).ok_or(EnvError::Corruption("unknown log record kind"))?;
        Ok(Self {
            kind,
            payload_len: be_u32(&src[4..8]),
            structure_id: StructureId(be_u64(&src[8..16])),
            prev_chain: be_u64(&src[16..24]),
            payload_crc32: be_u32(&src[24..28]),
        })
    }

    fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN as u64 + u64::from(self.payload_len)
    }
}

fn next_chain(prev_chain: u64, encoded_header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&prev_chain.to_be_bytes());
    hasher.update(encoded_header);
    hasher.update(payload);
    let record_len = (RECORD_HEADER_LEN + payload.len()) as u64;
    (record_len << 32) | u64::from(hasher.finalize())
}

struct LogState {
    salt: u64,
    /// Offset the next record is written at. Everything before it is valid.
    append_offset: u64,
    /// Physical file length; bigger than `append_offset` while a stale tail
    /// awaits truncation.
    file_len: u64,
    prev_chain: u64,
    stats: LogStats,
}

/// Append-only record log; the only component that performs physical I/O.
pub struct Log {
    io: Arc<dyn FileIo>,
    state: Mutex<LogState>,
    recovered_root: Option<Address>,
}

impl Log {
    /// Opens or creates a log.
    ///
    /// Scans the record chain, remembers the last complete database root and,
    /// unless `options.readonly`, truncates every byte after it.
    pub fn open(io: Arc<dyn FileIo>, options: LogOptions) -> Result<Self> {
        let file_len = io.len()?;
        if file_len < FILE_HEADER_LEN as u64 {
            let log = Self {
                io,
                state: Mutex::new(LogState {
                    salt: options.salt,
                    append_offset: 0,
                    file_len,
                    prev_chain: options.salt,
                    stats: LogStats::default(),
                }),
                recovered_root: None,
            };
            if !options.readonly {
                let mut state = log.state.lock();
                log.prepare_append(&mut state)?;
            }
            debug!(salt = options.salt, "log.open.created");
            return Ok(log);
        }

        let mut header_buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;

        let mut iter = LogIterator::new(Arc::clone(&io), header.salt, file_len);
        let mut recovered_root = None;
        let mut end = FILE_HEADER_LEN as u64;
        let mut chain = header.salt;
        let mut records = 0u64;
        while let Some(record) = iter.next_record()? {
            records += 1;
            if record.kind == RecordKind::DatabaseRoot {
                recovered_root = Some(record.address);
                end = iter.valid_up_to();
                chain = iter.prev_chain;
            }
        }
        let truncated = file_len - end;
        if truncated > 0 {
            warn!(
                valid_up_to = iter.valid_up_to(),
                keep = end,
                file_len,
                "log.open.discard_tail"
            );
        }
        let log = Self {
            io,
            state: Mutex::new(LogState {
                salt: header.salt,
                append_offset: end,
                file_len,
                prev_chain: chain,
                stats: LogStats {
                    truncated_bytes: truncated,
                    ..LogStats::default()
                },
            }),
            recovered_root,
        };
        if !options.readonly {
            let mut state = log.state.lock();
            log.prepare_append(&mut state)?;
        }
        info!(
            records,
            root = recovered_root.map(|a| a.0),
            append_offset = end,
            "log.open.recovered"
        );
        Ok(log)
    }

    /// Address of the last complete database root found when the log was opened.
    pub fn recovered_root(&self) -> Option<Address> {
        self.recovered_root
    }

    fn prepare_append(&self, state: &mut LogState) -> Result<()> {
        if state.append_offset == 0 {
            let header = FileHeader { salt: state.salt };
            self.io.write_at(0, &header.encode())?;
            state.append_offset = FILE_HEADER_LEN as u64;
            state.prev_chain = state.salt;
        }
        if state.file_len != state.append_offset {
            self.io.truncate(state.append_offset)?;
            state.file_len = state.append_offset;
        }
        Ok(())
    }

    /// Appends one record and returns its address.
    ///
    /// The append offset only advances once the write succeeded, so a failed
    /// append leaves the log unchanged. Call [`Log::sync`] for durability.
    pub fn append(
        &self,
        kind: RecordKind,
        structure_id: StructureId,
        payload: &[u8],
    ) -> Result<Address> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EnvError::Invalid("log record payload too large"));
        }
        let mut state = self.state.lock();
        self.prepare_append(&mut state)?;
        let header = RecordHeader {
            kind,
            payload_len: payload.len() as u32,
            structure_id,
            prev_chain: state.prev_chain,
            payload_crc32: crc32_of(&[payload]),
        };
        let encoded = header.encode();
        let address = Address(state.append_offset);
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&encoded);
        record.extend_from_slice(payload);
        if let Err(err) = self.io.write_at(address.0, &record) {
            // Drop whatever part of the record reached the file.
            if let Err(truncate) = self.io.truncate(address.0) {
                warn!(
                    address = address.0,
                    error = %truncate,
                    "log.append.truncate_failed"
                );
                // The next append retries the truncation.
                state.file_len = address.0 + record.len() as u64;
            }
            return Err(err);
        }
        let record_len = record.len() as u64;
        state.prev_chain = next_chain(state.prev_chain, &encoded, payload);
        state.append_offset += record_len;
        state.file_len = state.append_offset;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += record_len;
        Ok(address)
    }

    /// Captures the current append position.
    pub fn mark(&self) -> LogMark {
        let state = self.state.lock();
        LogMark {
            offset: state.append_offset,
            chain: state.prev_chain,
        }
    }

    /// Removes every record appended after `mark`.
    ///
    /// The append position and chain are restored even when truncating the
    /// file fails; the stale bytes are then truncated by the next append and
    /// the error is returned.
    pub fn rollback_to(&self, mark: LogMark) -> Result<()> {
        let mut state = self.state.lock();
        if mark.offset > state.append_offset {
            return Err(EnvError::Invalid("log mark is past the append offset"));
        }
        let removed = state.append_offset - mark.offset;
        state.append_offset = mark.offset;
        state.prev_chain = mark.chain;
        state.stats.rolled_back_bytes += removed;
        if let Err(err) = self.io.truncate(mark.offset) {
            warn!(offset = mark.offset, error = %err, "log.rollback.truncate_failed");
            return Err(err);
        }
        state.file_len = mark.offset;
        debug!(offset = mark.offset, removed, "log.rollback");
        Ok(())
    }

    /// Reads the record at `address`.
    pub fn read(&self, address: Address) -> Result<Loggable> {
        let limit = self.state.lock().append_offset;
        if address.0 < FILE_HEADER_LEN as u64 || address.0 + RECORD_HEADER_LEN as u64 > limit {
            return Err(EnvError::Corruption("log address out of range"));
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        self.io.read_at(address.0, &mut header_buf)?;
        let header = RecordHeader::decode(&header_buf)?;
        if address.0 + header.record_len() > limit {
            return Err(EnvError::Corruption("log record extends past end"));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.io
            .read_at(address.0 + RECORD_HEADER_LEN as u64, &mut payload)?;
        if crc32_of(&[&payload]) != header.payload_crc32 {
            return Err(EnvError::Corruption("log record payload crc mismatch"));
        }
        Ok(Loggable {
            kind: header.kind,
            address,
            structure_id: header.structure_id,
            payload: Bytes::from(payload),
        })
    }

    /// Syncs all appended records to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Iterates every valid record in address order.
    pub fn iter(&self) -> LogIterator {
        let state = self.state.lock();
        LogIterator::new(Arc::clone(&self.io), state.salt, state.append_offset)
    }

    /// Offset the next record will be written at.
    pub fn end_address(&self) -> Address {
        Address(self.state.lock().append_offset.max(FILE_HEADER_LEN as u64))
    }

    /// Returns current statistics.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }
}

/// Iterator over the valid prefix of a log.
///
/// Stops at the first record whose header, payload or chain value does not
/// verify.
pub struct LogIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
}

impl LogIterator {
    fn new(io: Arc<dyn FileIo>, salt: u64, end: u64) -> Self {
        Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            prev_chain: salt,
            valid_up_to: FILE_HEADER_LEN as u64,
        }
    }

    /// Reads the next record, or `None` at the end of the valid prefix.
    pub fn next_record(&mut self) -> Result<Option<Loggable>> {
        if self.offset + RECORD_HEADER_LEN as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        if !self.read_or_stop(self.offset, &mut header_buf)? {
            return Ok(None);
        }
        let header = match RecordHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(_) => return Ok(self.stop()),
        };
        if header.prev_chain != self.prev_chain || self.offset + header.record_len() > self.end {
            return Ok(self.stop());
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        if !self.read_or_stop(self.offset + RECORD_HEADER_LEN as u64, &mut payload)? {
            return Ok(None);
        }
        if crc32_of(&[&payload]) != header.payload_crc32 {
            return Ok(self.stop());
        }
        self.prev_chain = next_chain(self.prev_chain, &header_buf, &payload);
        let address = Address(self.offset);
        self.offset += header.record_len();
        self.valid_up_to = self.offset;
        Ok(Some(Loggable {
            kind: header.kind,
            address,
            structure_id: header.structure_id,
            payload: Bytes::from(payload),
        }))
    }

    /// Returns the offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    fn stop(&mut self) -> Option<Loggable> {
        self.offset = self.end;
        None
    }

    fn read_or_stop(&mut self, off: u64, dst: &mut [u8]) -> Result<bool> {
        match self.io.read_at(off, dst) {
            Ok(()) => Ok(true),
            Err(EnvError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                self.stop();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl Iterator for LogIterator {
    type Item = Result<Loggable>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn be_u16(src: &[u8]) -> u16 {
    let mut arr = [0u8; 2];
    arr.copy_from_slice(src);
    u16::from_be_bytes(arr)
}

fn be_u32(src: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(src);
    u32::from_be_bytes(arr)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(src);
    u64::from_be_bytes(arr)
}
