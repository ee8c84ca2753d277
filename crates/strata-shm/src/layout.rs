//! On-segment records
//!
//! ```text
//! +---------------+-----------------------+---------+-----------------+
//! | SegmentHeader | SlotRecord x slots    | padding | heap (data_len) |
//! +---------------+-----------------------+---------+-----------------+
//! ```
//!
//! Every cross-record reference is an offset (or a slot index), never a
//! pointer, so the segment can be mapped at different addresses by
//! different processes. Records are read and written by value with
//! `bytemuck`, so the backing bytes need no particular alignment.

use bytemuck::{Pod, Zeroable};

use crate::BackendError;

pub const SEGMENT_MAGIC: u32 = 0x5354_5348; // "STSH"
pub const SEGMENT_VERSION: u32 = 1;

/// Absent slot index
pub const NIL_INDEX: u32 = u32::MAX;

/// Absent offset
pub const NIL_OFFSET: u64 = u64::MAX;

/// Heap data starts on this boundary
pub const DATA_ALIGN: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub slot_count: u32,
    /// First free slot, `NIL_INDEX` when the table is exhausted
    pub free_head: u32,
    pub data_offset: u64,
    pub data_len: u64,
    /// First free heap block, `NIL_OFFSET` when the heap is full
    pub heap_head: u64,
    pub reserved: u64,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

/// One buffer handle's bookkeeping.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SlotRecord {
    /// Heap offset of the buffer data, `NIL_OFFSET` while unused
    pub offset: u64,
    pub len: u64,
    pub refcount: u32,
    next_free: u32,
}

pub const SLOT_SIZE: usize = std::mem::size_of::<SlotRecord>();

impl SlotRecord {
    pub fn unused(next_free: Option<u32>) -> Self {
        let mut slot = Self {
            offset: NIL_OFFSET,
            len: 0,
            refcount: 0,
            next_free: NIL_INDEX,
        };
        slot.set_next_free(next_free);
        slot
    }

    pub fn is_live(&self) -> bool {
        self.offset != NIL_OFFSET
    }

    pub fn next_free(&self) -> Option<u32> {
        (self.next_free != NIL_INDEX).then_some(self.next_free)
    }

    pub fn set_next_free(&mut self, next: Option<u32>) {
        self.next_free = next.unwrap_or(NIL_INDEX);
    }
}

/// Geometry of a formatted segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub slot_count: u32,
    pub data_offset: usize,
    pub data_len: usize,
}

impl Layout {
    pub fn new(slot_count: u32, data_len: usize) -> Self {
        let table_end = HEADER_SIZE + slot_count as usize * SLOT_SIZE;
        Self {
            slot_count,
            data_offset: table_end.next_multiple_of(DATA_ALIGN),
            data_len,
        }
    }

    pub fn total_size(&self) -> usize {
        self.data_offset + self.data_len
    }

    pub fn slot_offset(&self, handle: u32) -> usize {
        HEADER_SIZE + handle as usize * SLOT_SIZE
    }

    /// Recover and sanity-check the layout recorded in a segment header.
    pub fn from_header(header: &SegmentHeader, segment_len: usize) -> Result<Self, BackendError> {
        if header.magic != SEGMENT_MAGIC || header.version != SEGMENT_VERSION {
            return Err(BackendError::Corrupt("bad magic or version"));
        }
        let layout = Self::new(header.slot_count, header.data_len as usize);
        if layout.data_offset as u64 != header.data_offset || layout.total_size() > segment_len {
            return Err(BackendError::Corrupt("layout does not fit the segment"));
        }
        Ok(layout)
    }
}

/// Copy a record out of the segment.
pub fn read<T: Pod>(bytes: &[u8], offset: usize) -> Result<T, BackendError> {
    let end = offset
        .checked_add(std::mem::size_of::<T>())
        .ok_or(BackendError::Corrupt("record offset overflow"))?;
    bytes
        .get(offset..end)
        .map(bytemuck::pod_read_unaligned)
        .ok_or(BackendError::Corrupt("record out of bounds"))
}

/// Copy a record into the segment.
pub fn write<T: Pod>(bytes: &mut [u8], offset: usize, value: &T) -> Result<(), BackendError> {
    let src = bytemuck::bytes_of(value);
    let end = offset
        .checked_add(src.len())
        .ok_or(BackendError::Corrupt("record offset overflow"))?;
    bytes
        .get_mut(offset..end)
        .ok_or(BackendError::Corrupt("record out of bounds"))?
        .copy_from_slice(src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(HEADER_SIZE, 48);
        assert_eq!(SLOT_SIZE, 24);
    }

    #[test]
    fn test_layout_aligns_data() {
        let layout = Layout::new(1020, 1 << 20);
        assert_eq!(layout.data_offset % DATA_ALIGN, 0);
        assert!(layout.data_offset >= HEADER_SIZE + 1020 * SLOT_SIZE);
        assert_eq!(layout.total_size(), layout.data_offset + (1 << 20));
    }

    #[test]
    fn test_next_free_accessor() {
        let mut slot = SlotRecord::unused(Some(3));
        assert_eq!(slot.next_free(), Some(3));
        assert!(!slot.is_live());
        slot.set_next_free(None);
        assert_eq!(slot.next_free(), None);
    }

    #[test]
    fn test_unaligned_record_access() {
        let mut bytes = vec![0u8; 64];
        let slot = SlotRecord { offset: 16, len: 32, refcount: 2, next_free: NIL_INDEX };
        write(&mut bytes, 3, &slot).unwrap();
        assert_eq!(read::<SlotRecord>(&bytes, 3).unwrap(), slot);
        assert!(read::<SlotRecord>(&bytes, 60).is_err());
    }
}
