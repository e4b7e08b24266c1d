//! Year segment files
//!
//! One segment file holds one calendar year of one bucket. The file starts
//! with a fixed 4096-byte self-describing header; for fixed buckets the
//! payload is a dense, zero-filled array of `intervals_per_day × days`
//! record slots, addressed by `slot = (epoch − year_start) / step_seconds`.
//! Variable buckets append records after the header and keep a per-record
//! `(epoch, nanos)` index in memory, rebuilt by scan on open.

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::types::{
    days_in_year, year_start, BucketMeta, Column, ElementType, Epoch, RecordKind, Schema,
    TimeRange, NANOS_COLUMN,
};
use crate::{Result, TickError};

/// `"MKTS"` big-endian in the first four header bytes
pub const SEGMENT_MAGIC: u32 = 0x4D4B_5453;
pub const SEGMENT_VERSION: u16 = 1;
/// Fixed header region; slot 0 starts at this offset
pub const HEADER_SIZE: usize = 4096;

/// Decoded segment header
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    pub year: i32,
    pub intervals_per_day: u32,
    pub record_length: u32,
    pub record_kind: RecordKind,
    pub schema: Schema,
}

impl SegmentHeader {
    /// Serialize into the fixed header region (zero-padded to `HEADER_SIZE`)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32_le(SEGMENT_MAGIC);
        buf.put_u16_le(SEGMENT_VERSION);
        buf.put_u8(self.record_kind.code());
        buf.put_u8(0); // reserved
        buf.put_i32_le(self.year);
        buf.put_u32_le(self.intervals_per_day);
        buf.put_u32_le(self.record_length);
        buf.put_u16_le(self.schema.columns.len() as u16);
        for col in &self.schema.columns {
            buf.put_u16_le(col.name.len() as u16);
            buf.put_slice(col.name.as_bytes());
            buf.put_u8(col.elem.code());
        }
        if buf.len() > HEADER_SIZE {
            return Err(TickError::InvalidFormat(
                "schema does not fit the segment header".into(),
            ));
        }
        let mut out = buf.to_vec();
        out.resize(HEADER_SIZE, 0);
        Ok(out)
    }

    /// Deserialize from the header region, validating magic and version
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(TickError::Corruption("segment header too short".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        let magic = cursor.get_u32_le();
        if magic != SEGMENT_MAGIC {
            return Err(TickError::Corruption(format!(
                "bad segment magic: {:#010x}",
                magic
            )));
        }
        let version = cursor.get_u16_le();
        if version != SEGMENT_VERSION {
            return Err(TickError::Corruption(format!(
                "unsupported segment version: {}",
                version
            )));
        }
        let record_kind = RecordKind::from_code(cursor.get_u8())?;
        cursor.get_u8(); // reserved
        let year = cursor.get_i32_le();
        let intervals_per_day = cursor.get_u32_le();
        let record_length = cursor.get_u32_le();
        let column_count = cursor.get_u16_le() as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let name_len = cursor.get_u16_le() as usize;
            let pos = cursor.position() as usize;
            if pos + name_len + 1 > data.len() {
                return Err(TickError::Corruption("truncated segment header".into()));
            }
            let name = String::from_utf8(data[pos..pos + name_len].to_vec())
                .map_err(|e| TickError::Corruption(e.to_string()))?;
            cursor.set_position((pos + name_len) as u64);
            let elem = ElementType::from_code(cursor.get_u8())?;
            columns.push(Column::new(name, elem));
        }
        let schema = Schema::new(columns)?;
        if schema.record_length() != record_length as usize {
            return Err(TickError::Corruption(
                "record length disagrees with schema".into(),
            ));
        }
        Ok(Self {
            year,
            intervals_per_day,
            record_length,
            record_kind,
            schema,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct VarEntry {
    epoch: Epoch,
    nanos: i32,
    offset: u64,
}

#[derive(Debug, Default)]
struct VarState {
    index: Vec<VarEntry>,
    end_offset: u64,
}

/// A single year's worth of one bucket on disk.
///
/// Writes take the exclusive file lock, reads the shared lock; each record
/// write is a single positioned write of `record_length` bytes.
pub struct SegmentFile {
    path: PathBuf,
    header: SegmentHeader,
    step_seconds: i64,
    year_start: Epoch,
    slots: u64,
    file: RwLock<File>,
    var: RwLock<VarState>,
}

impl SegmentFile {
    /// Create a new segment for `year`, zero-filled for fixed buckets
    pub fn create(path: &Path, year: i32, meta: &BucketMeta) -> Result<Self> {
        let intervals_per_day = meta.timeframe.intervals_per_day() as u32;
        let header = SegmentHeader {
            year,
            intervals_per_day,
            record_length: meta.schema.record_length() as u32,
            record_kind: meta.record_kind,
            schema: meta.schema.clone(),
        };
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all_at(&header.encode()?, 0)?;
        let slots = intervals_per_day as u64 * days_in_year(year) as u64;
        if meta.record_kind == RecordKind::Fixed {
            file.set_len(HEADER_SIZE as u64 + slots * header.record_length as u64)?;
        }
        file.sync_all()?;
        tracing::debug!(path = ?path, year, slots, "created segment file");
        Ok(Self {
            path: path.to_path_buf(),
            step_seconds: 86400 / intervals_per_day as i64,
            year_start: year_start(year),
            slots,
            header,
            file: RwLock::new(file),
            var: RwLock::new(VarState::default()),
        })
    }

    /// Open an existing segment, reading its self-describing header. For
    /// variable buckets the `(epoch, nanos)` index is rebuilt by scanning.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut head = vec![0u8; HEADER_SIZE];
        file.read_exact_at(&mut head, 0)?;
        let header = SegmentHeader::decode(&head)?;
        let slots = header.intervals_per_day as u64 * days_in_year(header.year) as u64;
        let seg = Self {
            path: path.to_path_buf(),
            step_seconds: 86400 / header.intervals_per_day as i64,
            year_start: year_start(header.year),
            slots,
            header,
            file: RwLock::new(file),
            var: RwLock::new(VarState::default()),
        };
        if seg.header.record_kind == RecordKind::Variable {
            seg.rebuild_var_index()?;
        }
        Ok(seg)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn year(&self) -> i32 {
        self.header.year
    }

    pub fn schema(&self) -> &Schema {
        &self.header.schema
    }

    pub fn record_kind(&self) -> RecordKind {
        self.header.record_kind
    }

    pub fn record_length(&self) -> usize {
        self.header.record_length as usize
    }

    /// Slot index for an epoch, `None` when the epoch falls outside the year
    pub fn slot_for_epoch(&self, epoch: Epoch) -> Option<u64> {
        if epoch < self.year_start {
            return None;
        }
        let slot = ((epoch - self.year_start) / self.step_seconds) as u64;
        (slot < self.slots).then_some(slot)
    }

    /// Clamp a time range to this year's slots; `None` when disjoint
    pub fn slots_for_range(&self, range: &TimeRange) -> Option<(u64, u64)> {
        if range.is_empty() {
            return None;
        }
        let year_end = self.year_start + self.step_seconds * self.slots as i64 - 1;
        let lo = range.start.max(self.year_start);
        let hi = range.end.min(year_end);
        if lo > hi {
            return None;
        }
        let lo_slot = ((lo - self.year_start) / self.step_seconds) as u64;
        let hi_slot = ((hi - self.year_start) / self.step_seconds) as u64;
        Some((lo_slot, hi_slot.min(self.slots - 1)))
    }

    /// Write a batch of encoded records, each addressed by its leading epoch.
    /// A record that lands in an occupied slot overwrites it.
    pub fn write_records(&self, data: &[u8]) -> Result<u32> {
        match self.header.record_kind {
            RecordKind::Fixed => self.write_records_fixed(data),
            RecordKind::Variable => self.append_variable(data),
        }
    }

    fn write_records_fixed(&self, data: &[u8]) -> Result<u32> {
        let rec_len = self.record_length();
        if rec_len == 0 || data.len() % rec_len != 0 {
            return Err(TickError::InvalidFormat(
                "write payload is not a whole number of records".into(),
            ));
        }
        let file = self.file.write();
        let mut written = 0u32;
        for record in data.chunks_exact(rec_len) {
            let epoch = record_epoch(record);
            let slot = self.slot_for_epoch(epoch).ok_or_else(|| {
                TickError::Internal(format!(
                    "epoch {} does not belong to segment year {}",
                    epoch, self.header.year
                ))
            })?;
            let offset = HEADER_SIZE as u64 + slot * rec_len as u64;
            file.write_all_at(record, offset)?;
            written += 1;
        }
        Ok(written)
    }

    /// Append variable-length-bucket records, skipping `(epoch, nanos)`
    /// duplicates so replay and replication re-delivery stay idempotent.
    fn append_variable(&self, data: &[u8]) -> Result<u32> {
        let rec_len = self.record_length();
        if rec_len == 0 || data.len() % rec_len != 0 {
            return Err(TickError::InvalidFormat(
                "write payload is not a whole number of records".into(),
            ));
        }
        let nanos_off = self.nanos_offset()?;
        let file = self.file.write();
        let mut var = self.var.write();
        if var.end_offset == 0 {
            var.end_offset = HEADER_SIZE as u64;
        }
        let mut written = 0u32;
        for record in data.chunks_exact(rec_len) {
            let epoch = record_epoch(record);
            let nanos = i32::from_le_bytes([
                record[nanos_off],
                record[nanos_off + 1],
                record[nanos_off + 2],
                record[nanos_off + 3],
            ]);
            if var
                .index
                .iter()
                .any(|e| e.epoch == epoch && e.nanos == nanos)
            {
                continue;
            }
            let offset = var.end_offset;
            file.write_all_at(record, offset)?;
            var.index.push(VarEntry {
                epoch,
                nanos,
                offset,
            });
            var.end_offset += rec_len as u64;
            written += 1;
        }
        Ok(written)
    }

    /// Raw bytes of a closed slot range (fixed buckets)
    pub fn read_slot_range(&self, lo: u64, hi: u64) -> Result<Vec<u8>> {
        if lo > hi || hi >= self.slots {
            return Err(TickError::Internal(format!(
                "slot range {}..={} out of bounds ({} slots)",
                lo, hi, self.slots
            )));
        }
        let rec_len = self.record_length() as u64;
        let mut buf = vec![0u8; ((hi - lo + 1) * rec_len) as usize];
        let file = self.file.read();
        file.read_exact_at(&mut buf, HEADER_SIZE as u64 + lo * rec_len)?;
        Ok(buf)
    }

    /// Records of a variable bucket intersecting `range`, in epoch order
    pub fn read_variable_range(&self, range: &TimeRange) -> Result<Vec<u8>> {
        let rec_len = self.record_length();
        let entries: Vec<VarEntry> = {
            let var = self.var.read();
            let mut hits: Vec<VarEntry> = var
                .index
                .iter()
                .filter(|e| range.contains(e.epoch))
                .copied()
                .collect();
            hits.sort_by_key(|e| (e.epoch, e.nanos));
            hits
        };
        let file = self.file.read();
        let mut out = Vec::with_capacity(entries.len() * rec_len);
        let mut record = vec![0u8; rec_len];
        for entry in entries {
            file.read_exact_at(&mut record, entry.offset)?;
            out.extend_from_slice(&record);
        }
        Ok(out)
    }

    /// Flush file contents to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.read().sync_data()?;
        Ok(())
    }

    fn nanos_offset(&self) -> Result<usize> {
        let idx = self
            .header
            .schema
            .column_index(NANOS_COLUMN)
            .ok_or_else(|| {
                TickError::InvalidFormat(format!(
                    "variable bucket schema lacks a {} column",
                    NANOS_COLUMN
                ))
            })?;
        Ok(self.header.schema.column_offset(idx))
    }

    fn rebuild_var_index(&self) -> Result<()> {
        let rec_len = self.record_length();
        let nanos_off = self.nanos_offset()?;
        let file = self.file.read();
        let len = file.metadata()?.len();
        let mut var = self.var.write();
        var.index.clear();
        var.end_offset = HEADER_SIZE as u64;
        let mut record = vec![0u8; rec_len];
        while var.end_offset + rec_len as u64 <= len {
            file.read_exact_at(&mut record, var.end_offset)?;
            let epoch = record_epoch(&record);
            let nanos = i32::from_le_bytes([
                record[nanos_off],
                record[nanos_off + 1],
                record[nanos_off + 2],
                record[nanos_off + 3],
            ]);
            let offset = var.end_offset;
            var.index.push(VarEntry {
                epoch,
                nanos,
                offset,
            });
            var.end_offset += rec_len as u64;
        }
        Ok(())
    }
}

fn record_epoch(record: &[u8]) -> Epoch {
    i64::from_le_bytes([
        record[0], record[1], record[2], record[3], record[4], record[5], record[6], record[7],
    ])
}
