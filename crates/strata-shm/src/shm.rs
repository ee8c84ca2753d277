//! Shared-memory buffer backend
//!
//! Buffers are handles into a slot table at the front of a segment; each
//! live slot points at a block of the segment's heap. Handles are recycled
//! LIFO through a free list threaded through the unused slots.
//!
//! Not thread- or process-safe: two processes mapping the same segment
//! must sequence their allocations through the protocol (the client
//! allocates, the server only opens and destroys what it was told about).

use tracing::{debug, trace};

use crate::heap::Heap;
use crate::layout::{
    self, Layout, SegmentHeader, SlotRecord, NIL_OFFSET, SEGMENT_MAGIC, SEGMENT_VERSION,
};
use crate::segment::{HeapSegment, MappedSegment, Segment};
use crate::{Backend, BackendError, Buffer};

/// Backend name advertised to clients
pub const SHM_BACKEND_NAME: &str = "shm";

/// Default shared-memory object name
pub const DEFAULT_SEGMENT_NAME: &str = "/strata-shm";

/// Sizing for a newly formatted segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmConfig {
    pub slots: u32,
    pub data_size: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            slots: 1020,
            data_size: 64 * 1024 * 1024,
        }
    }
}

pub struct ShmBackend<S: Segment> {
    segment: S,
    layout: Layout,
    args: String,
}

impl ShmBackend<HeapSegment> {
    /// Private in-process segment. Clients cannot map it.
    pub fn anonymous(config: ShmConfig) -> Result<Self, BackendError> {
        let layout = Layout::new(config.slots, config.data_size);
        Self::format(HeapSegment::new(layout.total_size()), layout, String::new())
    }
}

impl ShmBackend<MappedSegment> {
    /// Create, size and format the named shared-memory object.
    pub fn create(name: &str, config: ShmConfig) -> Result<Self, BackendError> {
        let layout = Layout::new(config.slots, config.data_size);
        let segment = MappedSegment::create(name, layout.total_size())?;
        Self::format(segment, layout, name.to_owned())
    }

    /// Map a segment already formatted by the server.
    pub fn open_existing(name: &str) -> Result<Self, BackendError> {
        let segment = MappedSegment::open(name)?;
        Self::attach(segment, name.to_owned())
    }
}

impl<S: Segment> ShmBackend<S> {
    /// Lay out a fresh table and heap in `segment`.
    pub fn format(mut segment: S, layout: Layout, args: String) -> Result<Self, BackendError> {
        if segment.bytes().len() < layout.total_size() {
            return Err(BackendError::InvalidSegmentSize(segment.bytes().len()));
        }

        let bytes = segment.bytes_mut();
        for handle in 0..layout.slot_count {
            let next = (handle + 1 < layout.slot_count).then_some(handle + 1);
            layout::write(bytes, layout.slot_offset(handle), &SlotRecord::unused(next))?;
        }

        let mut heap_head = NIL_OFFSET;
        let data = &mut bytes[layout.data_offset..layout.total_size()];
        Heap::new(data, &mut heap_head).format()?;

        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            slot_count: layout.slot_count,
            free_head: if layout.slot_count > 0 { 0 } else { layout::NIL_INDEX },
            data_offset: layout.data_offset as u64,
            data_len: layout.data_len as u64,
            heap_head,
            reserved: 0,
        };
        layout::write(bytes, 0, &header)?;

        debug!(
            "formatted segment: {} slots, {} data bytes at offset {}",
            layout.slot_count, layout.data_len, layout.data_offset
        );
        Ok(Self { segment, layout, args })
    }

    /// Use a segment formatted elsewhere.
    pub fn attach(segment: S, args: String) -> Result<Self, BackendError> {
        let header: SegmentHeader = layout::read(segment.bytes(), 0)?;
        let layout = Layout::from_header(&header, segment.bytes().len())?;
        Ok(Self { segment, layout, args })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn into_segment(self) -> S {
        self.segment
    }

    /// Reference count of a handle, `None` while the slot is unused.
    pub fn refcount(&self, handle: u32) -> Result<Option<u32>, BackendError> {
        let slot = self.slot(handle)?;
        Ok(slot.is_live().then_some(slot.refcount))
    }

    /// Free bytes left in the heap, block headers included.
    pub fn free_space(&mut self) -> Result<u64, BackendError> {
        self.with_heap(|heap| heap.free_bytes())
    }

    fn header(&self) -> Result<SegmentHeader, BackendError> {
        layout::read(self.segment.bytes(), 0)
    }

    fn set_header(&mut self, header: &SegmentHeader) -> Result<(), BackendError> {
        layout::write(self.segment.bytes_mut(), 0, header)
    }

    fn slot(&self, handle: u32) -> Result<SlotRecord, BackendError> {
        if handle >= self.layout.slot_count {
            return Err(BackendError::InvalidHandle(handle));
        }
        layout::read(self.segment.bytes(), self.layout.slot_offset(handle))
    }

    fn set_slot(&mut self, handle: u32, slot: &SlotRecord) -> Result<(), BackendError> {
        let offset = self.layout.slot_offset(handle);
        layout::write(self.segment.bytes_mut(), offset, slot)
    }

    fn live_slot(&self, handle: u32) -> Result<SlotRecord, BackendError> {
        let slot = self.slot(handle)?;
        if !slot.is_live() {
            return Err(BackendError::UnusedSlot(handle));
        }
        Ok(slot)
    }

    fn pop_handle(&mut self) -> Result<Option<u32>, BackendError> {
        let mut header = self.header()?;
        if header.free_head == layout::NIL_INDEX {
            return Ok(None);
        }
        let handle = header.free_head;
        let slot = self.slot(handle)?;
        header.free_head = slot.next_free().unwrap_or(layout::NIL_INDEX);
        self.set_header(&header)?;
        Ok(Some(handle))
    }

    fn push_handle(&mut self, handle: u32) -> Result<(), BackendError> {
        let mut header = self.header()?;
        let head = (header.free_head != layout::NIL_INDEX).then_some(header.free_head);
        self.set_slot(handle, &SlotRecord::unused(head))?;
        header.free_head = handle;
        self.set_header(&header)
    }

    fn with_heap<R>(
        &mut self,
        f: impl FnOnce(&mut Heap<'_>) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        let mut header = self.header()?;
        let data = &mut self.segment.bytes_mut()[self.layout.data_offset..self.layout.total_size()];
        let result = f(&mut Heap::new(data, &mut header.heap_head));
        self.set_header(&header)?;
        result
    }

    fn region(&self, buffer: &Buffer, len: usize) -> Result<std::ops::Range<usize>, BackendError> {
        let slot = self.live_slot(buffer.handle)?;
        if len as u64 > slot.len {
            return Err(BackendError::TooLarge {
                requested: len,
                len: slot.len as usize,
            });
        }
        let start = self.layout.data_offset + slot.offset as usize;
        Ok(start..start + len)
    }
}

fn buffer_size(width: u32, height: u32, stride: u32) -> Result<usize, BackendError> {
    let invalid = BackendError::InvalidSize { width, height, stride };
    if width == 0 || height == 0 || (stride as u64) < width as u64 {
        return Err(invalid);
    }
    (height as usize)
        .checked_mul(stride as usize)
        .ok_or(invalid)
}

impl<S: Segment> Backend for ShmBackend<S> {
    fn name(&self) -> &str {
        SHM_BACKEND_NAME
    }

    fn args(&self) -> &str {
        &self.args
    }

    fn allocate(&mut self, width: u32, height: u32, stride: u32) -> Result<Buffer, BackendError> {
        let size = buffer_size(width, height, stride)?;
        let handle = self.pop_handle()?.ok_or(BackendError::Exhausted)?;

        let offset = match self.with_heap(|heap| heap.alloc(size)) {
            Ok(Some(offset)) => offset,
            Ok(None) => {
                self.push_handle(handle)?;
                return Err(BackendError::OutOfSpace { requested: size });
            }
            Err(e) => {
                self.push_handle(handle)?;
                return Err(e);
            }
        };

        let mut slot = SlotRecord::unused(None);
        slot.offset = offset;
        slot.len = size as u64;
        slot.refcount = 1;
        self.set_slot(handle, &slot)?;

        trace!("allocated handle {} ({}x{} stride {})", handle, width, height, stride);
        Ok(Buffer { width, height, stride, handle })
    }

    fn open(&mut self, handle: u32, width: u32, height: u32, stride: u32) -> Result<Buffer, BackendError> {
        let size = buffer_size(width, height, stride)?;
        let mut slot = self.live_slot(handle)?;
        if size as u64 > slot.len {
            return Err(BackendError::TooLarge {
                requested: size,
                len: slot.len as usize,
            });
        }
        slot.refcount += 1;
        self.set_slot(handle, &slot)?;
        trace!("opened handle {} (refcount {})", handle, slot.refcount);
        Ok(Buffer { width, height, stride, handle })
    }

    fn destroy(&mut self, buffer: Buffer) -> Result<(), BackendError> {
        let mut slot = self.live_slot(buffer.handle)?;
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount > 0 {
            return self.set_slot(buffer.handle, &slot);
        }

        self.with_heap(|heap| heap.free(slot.offset))?;
        self.push_handle(buffer.handle)?;
        trace!("released handle {}", buffer.handle);
        Ok(())
    }

    fn read(&self, buffer: &Buffer, dest: &mut [u8]) -> Result<(), BackendError> {
        let range = self.region(buffer, dest.len())?;
        let src = self
            .segment
            .bytes()
            .get(range)
            .ok_or(BackendError::Corrupt("slot outside the data region"))?;
        dest.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, buffer: &Buffer, src: &[u8]) -> Result<(), BackendError> {
        let range = self.region(buffer, src.len())?;
        let dest = self
            .segment
            .bytes_mut()
            .get_mut(range)
            .ok_or(BackendError::Corrupt("slot outside the data region"))?;
        dest.copy_from_slice(src);
        Ok(())
    }
}

impl<S: Segment> std::fmt::Debug for ShmBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBackend")
            .field("args", &self.args)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ShmBackend<HeapSegment> {
        ShmBackend::anonymous(ShmConfig { slots: 4, data_size: 64 * 1024 }).unwrap()
    }

    #[test]
    fn test_handles_are_recycled_lifo() {
        let mut backend = small();
        let a = backend.allocate(4, 4, 16).unwrap();
        let b = backend.allocate(4, 4, 16).unwrap();
        assert_eq!((a.handle, b.handle), (0, 1));

        backend.destroy(b).unwrap();
        backend.destroy(a).unwrap();
        // Most recently freed first
        assert_eq!(backend.allocate(4, 4, 16).unwrap().handle, 0);
        assert_eq!(backend.allocate(4, 4, 16).unwrap().handle, 1);
    }

    #[test]
    fn test_open_requires_live_handle() {
        let mut backend = small();
        assert!(matches!(backend.open(2, 4, 4, 16), Err(BackendError::UnusedSlot(2))));
        assert!(matches!(backend.open(9, 4, 4, 16), Err(BackendError::InvalidHandle(9))));

        let buffer = backend.allocate(4, 4, 16).unwrap();
        let opened = backend.open(buffer.handle, 4, 4, 16).unwrap();
        assert_eq!(backend.refcount(buffer.handle).unwrap(), Some(2));

        // The slot survives until the last reference is dropped.
        backend.destroy(opened).unwrap();
        assert_eq!(backend.refcount(buffer.handle).unwrap(), Some(1));
        backend.destroy(buffer).unwrap();
        assert_eq!(backend.refcount(0).unwrap(), None);
    }

    #[test]
    fn test_exhaustion_and_out_of_space() {
        let mut backend = small();
        let buffers: Vec<_> = (0..4).map(|_| backend.allocate(1, 1, 4).unwrap()).collect();
        assert!(matches!(backend.allocate(1, 1, 4), Err(BackendError::Exhausted)));
        for buffer in buffers {
            backend.destroy(buffer).unwrap();
        }

        let before = backend.free_space().unwrap();
        assert!(matches!(
            backend.allocate(1024, 1024, 4096),
            Err(BackendError::OutOfSpace { .. })
        ));
        // The handle went back on the free list and the heap is untouched.
        assert_eq!(backend.free_space().unwrap(), before);
        assert_eq!(backend.allocate(1, 1, 4).unwrap().handle, 3);
    }

    #[test]
    fn test_read_write_bounds() {
        let mut backend = small();
        let data: Vec<u8> = (0..64).collect();
        let buffer = backend.create_buffer_from_data(4, 4, 16, &data).unwrap();

        let mut out = vec![0u8; 64];
        backend.read(&buffer, &mut out).unwrap();
        assert_eq!(out, data);

        let mut too_big = vec![0u8; 65];
        assert!(matches!(
            backend.read(&buffer, &mut too_big),
            Err(BackendError::TooLarge { requested: 65, len: 64 })
        ));

        // A failed upload leaves nothing behind.
        assert!(backend.create_buffer_from_data(2, 2, 8, &data).is_err());
        assert_eq!(backend.refcount(1).unwrap(), None);
    }

    #[test]
    fn test_rejects_degenerate_sizes() {
        let mut backend = small();
        assert!(matches!(backend.allocate(0, 4, 16), Err(BackendError::InvalidSize { .. })));
        assert!(matches!(backend.allocate(8, 4, 4), Err(BackendError::InvalidSize { .. })));
    }

    #[test]
    fn test_attach_sees_formatted_table() {
        let mut backend = small();
        let buffer = backend.create_buffer_from_data(1, 1, 4, &[1, 2, 3, 4]).unwrap();

        let mut peer = ShmBackend::attach(backend.into_segment(), String::new()).unwrap();
        let opened = peer.open(buffer.handle, 1, 1, 4).unwrap();
        let mut out = [0u8; 4];
        peer.read(&opened, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_attach_rejects_garbage() {
        assert!(ShmBackend::attach(HeapSegment::new(4096), String::new()).is_err());
    }

    #[test]
    fn test_mapped_segment_shared_between_roles() {
        let name = format!("/strata-test-{}", std::process::id());
        let config = ShmConfig { slots: 8, data_size: 4096 };
        let mut server = ShmBackend::create(&name, config).unwrap();
        let mut client = ShmBackend::open_existing(&name).unwrap();

        let buffer = client.create_buffer_from_data(2, 1, 8, &[7; 8]).unwrap();
        let opened = server.open(buffer.handle, 2, 1, 8).unwrap();
        let mut out = [0u8; 8];
        server.read(&opened, &mut out).unwrap();
        assert_eq!(out, [7; 8]);
        assert_eq!(server.args(), name);
    }
}
