//! Memory-mapped record slab file format.
//!
//! A slab is a flat array of fixed-width slots. Each slot holds one record:
//! an occupancy byte, a value-encoding byte, the timestamp, and the raw
//! 64-bit value. Slots carry no ordering; the [`FileBackend`] keeps a
//! timestamp index in memory and rebuilds it from the slab on open.
//!
//! # File Format
//!
//! ```text
//! [0..64)                 Header
//! [64..64 + N * 24)       Slots (N = slot_count)
//!
//! Header:  magic "RRDS" | version u32 | slot_count u32 | reserved
//! Slot:    state u8 | kind u8 | pad [u8; 6] | timestamp i64 | value u64
//! ```
//!
//! All integers are little-endian. A slot is published by writing its state
//! byte last, so a torn write into a free slot leaves it empty rather than
//! half-filled. Replacing the value of an occupied slot with one of the same
//! encoding rewrites only the value bytes and never unpublishes the slot;
//! a replace that changes the encoding passes through the empty state.
//!
//! [`FileBackend`]: super::FileBackend

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{BackendError, Result};
use crate::record::MetricValue;

/// Magic bytes identifying a record slab.
const SLAB_MAGIC: [u8; 4] = *b"RRDS";

/// Current slab format version.
const SLAB_VERSION: u32 = 1;

/// Size of the slab header in bytes.
const HEADER_SIZE: usize = 64;

/// Size of one slot in bytes.
const SLOT_SIZE: usize = 24;

const STATE_EMPTY: u8 = 0;
const STATE_OCCUPIED: u8 = 1;

const KIND_INT: u8 = 1;
const KIND_FLOAT: u8 = 2;

/// A record read back from an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotEntry {
    /// The record timestamp.
    pub timestamp: i64,
    /// The decoded value, or `None` if the slot's encoding byte is unknown.
    pub value: Option<MetricValue>,
}

/// Memory-mapped array of record slots.
#[derive(Debug)]
pub struct RecordSlab {
    /// Backing file, kept open so the slab can be grown.
    file: File,
    /// Memory mapping of the whole file.
    mmap: MmapMut,
    /// Number of slots in the mapping.
    slot_count: u32,
    /// Path to the slab file (for error reporting).
    path: PathBuf,
}

impl RecordSlab {
    /// Creates a new slab with `slot_count` empty slots, truncating any
    /// existing file.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the file cannot be created or mapped.
    pub fn create<P: AsRef<Path>>(path: P, slot_count: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let slot_count = slot_count.max(1);

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_error("create slab", &path, e))?;

        file.set_len(file_size(slot_count))
            .map_err(|e| io_error("create slab", &path, e))?;

        let mut slab = Self {
            mmap: map(&file, &path)?,
            file,
            slot_count,
            path,
        };
        slab.write_header();
        Ok(slab)
    }

    /// Opens an existing slab and validates its header.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the file cannot be opened or mapped and
    /// [`BackendError::Corrupted`] if the header or size is wrong.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_error("open slab", &path, e))?;

        let len = file
            .metadata()
            .map_err(|e| io_error("open slab", &path, e))?
            .len();
        if len < HEADER_SIZE as u64 {
            return Err(corrupted(&path, format!("file is {len} bytes, shorter than header")));
        }

        let mmap = map(&file, &path)?;

        if mmap[0..4] != SLAB_MAGIC {
            return Err(corrupted(
                &path,
                format!("invalid magic bytes: expected {SLAB_MAGIC:?}, found {:?}", &mmap[0..4]),
            ));
        }
        let version = read_u32(&mmap, 4);
        if version != SLAB_VERSION {
            return Err(corrupted(
                &path,
                format!("unsupported version: expected {SLAB_VERSION}, found {version}"),
            ));
        }
        let slot_count = read_u32(&mmap, 8);
        if len != file_size(slot_count) {
            return Err(corrupted(
                &path,
                format!(
                    "file is {len} bytes but header declares {slot_count} slots ({} bytes)",
                    file_size(slot_count)
                ),
            ));
        }

        Ok(Self {
            file,
            mmap,
            slot_count,
            path,
        })
    }

    /// Returns the number of slots.
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Returns the slab's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the size of the slab file in bytes.
    pub fn file_size(&self) -> u64 {
        file_size(self.slot_count)
    }

    /// Reads a slot. Returns `None` for empty or out-of-range slots.
    pub fn read(&self, slot: u32) -> Option<SlotEntry> {
        if slot >= self.slot_count {
            return None;
        }
        let offset = slot_offset(slot);
        if self.mmap[offset] != STATE_OCCUPIED {
            return None;
        }

        let kind = self.mmap[offset + 1];
        let timestamp = i64::from_le_bytes(self.bytes8(offset + 8));
        let bits = u64::from_le_bytes(self.bytes8(offset + 16));
        let value = match kind {
            KIND_INT => Some(MetricValue::Int(i64::from_le_bytes(bits.to_le_bytes()))),
            KIND_FLOAT => Some(MetricValue::Float(f64::from_bits(bits))),
            _ => None,
        };

        Some(SlotEntry { timestamp, value })
    }

    /// Writes a record into `slot`, replacing whatever it held.
    ///
    /// If `slot` already holds `timestamp` with the same value encoding,
    /// only the value bytes change and the slot stays occupied throughout.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= slot_count()`.
    pub fn write(&mut self, slot: u32, timestamp: i64, value: MetricValue) {
        assert!(slot < self.slot_count, "slot {slot} out of range");
        let offset = slot_offset(slot);
        let (kind, bits) = match value {
            MetricValue::Int(v) => (KIND_INT, u64::from_le_bytes(v.to_le_bytes())),
            MetricValue::Float(v) => (KIND_FLOAT, v.to_bits()),
        };

        if self.replace_value(offset, timestamp, kind, bits) {
            return;
        }

        self.mmap[offset] = STATE_EMPTY;
        self.mmap[offset + 1] = kind;
        self.mmap[offset + 8..offset + 16].copy_from_slice(&timestamp.to_le_bytes());
        self.mmap[offset + 16..offset + 24].copy_from_slice(&bits.to_le_bytes());
        self.mmap[offset] = STATE_OCCUPIED;
    }

    /// Overwrites the value bytes of the slot at `offset` if it is occupied
    /// by `timestamp` with encoding `kind`. The state byte is not touched.
    fn replace_value(&mut self, offset: usize, timestamp: i64, kind: u8, bits: u64) -> bool {
        let same = self.mmap[offset] == STATE_OCCUPIED
            && self.mmap[offset + 1] == kind
            && i64::from_le_bytes(self.bytes8(offset + 8)) == timestamp;
        if same {
            self.mmap[offset + 16..offset + 24].copy_from_slice(&bits.to_le_bytes());
        }
        same
    }

    /// Marks `slot` empty. Out-of-range slots are ignored.
    pub fn clear(&mut self, slot: u32) {
        if slot < self.slot_count {
            self.mmap[slot_offset(slot)] = STATE_EMPTY;
        }
    }

    /// Iterates over all occupied slots.
    pub fn occupied(&self) -> impl Iterator<Item = (u32, SlotEntry)> + '_ {
        (0..self.slot_count).filter_map(|slot| self.read(slot).map(|entry| (slot, entry)))
    }

    /// Extends the slab to `new_count` slots. Existing slots are kept and
    /// new slots start empty. Shrinking is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the file cannot be resized or remapped.
    pub fn grow(&mut self, new_count: u32) -> Result<()> {
        if new_count <= self.slot_count {
            return Ok(());
        }

        self.flush()?;
        self.file
            .set_len(file_size(new_count))
            .map_err(|e| io_error("grow slab", &self.path, e))?;
        self.mmap = map(&self.file, &self.path)?;
        self.slot_count = new_count;
        self.write_header();

        tracing::debug!(path = %self.path.display(), slots = new_count, "grew record slab");
        Ok(())
    }

    /// Flushes dirty pages to disk.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| io_error("flush slab", &self.path, e))
    }

    fn write_header(&mut self) {
        self.mmap[0..4].copy_from_slice(&SLAB_MAGIC);
        self.mmap[4..8].copy_from_slice(&SLAB_VERSION.to_le_bytes());
        self.mmap[8..12].copy_from_slice(&self.slot_count.to_le_bytes());
    }

    fn bytes8(&self, offset: usize) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mmap[offset..offset + 8]);
        buf
    }
}

fn map(file: &File, path: &Path) -> Result<MmapMut> {
    // SAFETY: the file is opened read-write by this process and the mapping
    // is only accessed through the owning RecordSlab, which FileBackend keeps
    // behind a mutex. Concurrent modification by other processes is outside
    // the supported usage.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| io_error("map slab", path, e))
}

fn file_size(slot_count: u32) -> u64 {
    HEADER_SIZE as u64 + u64::from(slot_count) * SLOT_SIZE as u64
}

fn slot_offset(slot: u32) -> usize {
    HEADER_SIZE + slot as usize * SLOT_SIZE
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn io_error(operation: &'static str, path: &Path, source: std::io::Error) -> crate::error::RrdError {
    BackendError::Io {
        operation,
        path: path.to_path_buf(),
        source,
    }
    .into()
}

fn corrupted(path: &Path, reason: String) -> crate::error::RrdError {
    BackendError::Corrupted {
        path: path.to_path_buf(),
        reason,
    }
    .into()
}
