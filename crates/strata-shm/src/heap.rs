//! First-fit heap inside the segment's data region
//!
//! Free blocks form a singly linked list ordered by address. Each block
//! starts with a [`BlockHeader`]; offsets are relative to the start of the
//! data region. Allocation splits oversized blocks, freeing coalesces with
//! both neighbours.

use bytemuck::{Pod, Zeroable};
use tracing::trace;

use crate::layout::{self, NIL_OFFSET};
use crate::BackendError;

/// Marks a block as allocated in place of a free-list link
const USED: u64 = u64::MAX - 1;

/// Block sizes (header included) are multiples of this
pub const BLOCK_ALIGN: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlockHeader {
    /// Whole block, header included
    size: u64,
    /// Next free block, or `USED`
    next: u64,
}

const BLOCK_HEADER: usize = std::mem::size_of::<BlockHeader>();

/// Smallest remainder worth splitting off
const MIN_BLOCK: usize = BLOCK_HEADER + BLOCK_ALIGN;

pub struct Heap<'a> {
    region: &'a mut [u8],
    head: &'a mut u64,
}

impl<'a> Heap<'a> {
    pub fn new(region: &'a mut [u8], head: &'a mut u64) -> Self {
        Self { region, head }
    }

    /// Reset the heap to a single free block covering the whole region.
    pub fn format(&mut self) -> Result<(), BackendError> {
        let size = self.region.len() / BLOCK_ALIGN * BLOCK_ALIGN;
        if size < MIN_BLOCK {
            *self.head = NIL_OFFSET;
            return Ok(());
        }
        self.put(0, BlockHeader { size: size as u64, next: NIL_OFFSET })?;
        *self.head = 0;
        Ok(())
    }

    /// Allocate `len` bytes, returning the payload offset.
    pub fn alloc(&mut self, len: usize) -> Result<Option<u64>, BackendError> {
        let need = match len
            .checked_add(BLOCK_HEADER)
            .and_then(|n| n.checked_next_multiple_of(BLOCK_ALIGN))
        {
            Some(need) => need as u64,
            None => return Ok(None),
        };

        let mut prev = NIL_OFFSET;
        let mut cur = *self.head;
        while cur != NIL_OFFSET {
            let block = self.get(cur)?;
            if block.size >= need {
                let next = if block.size - need >= MIN_BLOCK as u64 {
                    let rest = cur + need;
                    self.put(rest, BlockHeader { size: block.size - need, next: block.next })?;
                    self.put(cur, BlockHeader { size: need, next: USED })?;
                    rest
                } else {
                    self.put(cur, BlockHeader { size: block.size, next: USED })?;
                    block.next
                };
                self.link(prev, next)?;
                trace!("heap alloc {} bytes at {}", len, cur);
                return Ok(Some(cur + BLOCK_HEADER as u64));
            }
            prev = cur;
            cur = block.next;
        }
        Ok(None)
    }

    /// Return a payload previously handed out by [`alloc`](Self::alloc).
    pub fn free(&mut self, payload: u64) -> Result<(), BackendError> {
        let offset = payload
            .checked_sub(BLOCK_HEADER as u64)
            .ok_or(BackendError::Corrupt("heap offset below first block"))?;
        let mut block = self.get(offset)?;
        if block.next != USED {
            return Err(BackendError::Corrupt("freeing a block that is not allocated"));
        }

        // Find the free neighbours on either side.
        let mut prev = NIL_OFFSET;
        let mut next = *self.head;
        while next != NIL_OFFSET && next < offset {
            prev = next;
            next = self.get(next)?.next;
        }

        block.next = next;
        if next != NIL_OFFSET && offset + block.size == next {
            let following = self.get(next)?;
            block.size += following.size;
            block.next = following.next;
        }
        self.put(offset, block)?;
        self.link(prev, offset)?;

        if prev != NIL_OFFSET {
            let mut before = self.get(prev)?;
            if prev + before.size == offset {
                before.size += block.size;
                before.next = block.next;
                self.put(prev, before)?;
            }
        }
        trace!("heap free block at {}", offset);
        Ok(())
    }

    /// Total bytes in free blocks, headers included.
    pub fn free_bytes(&self) -> Result<u64, BackendError> {
        let mut total = 0;
        let mut cur = *self.head;
        while cur != NIL_OFFSET {
            let block = self.get(cur)?;
            total += block.size;
            cur = block.next;
        }
        Ok(total)
    }

    /// Number of free blocks
    pub fn fragments(&self) -> Result<usize, BackendError> {
        let mut count = 0;
        let mut cur = *self.head;
        while cur != NIL_OFFSET {
            count += 1;
            cur = self.get(cur)?.next;
        }
        Ok(count)
    }

    fn link(&mut self, prev: u64, to: u64) -> Result<(), BackendError> {
        if prev == NIL_OFFSET {
            *self.head = to;
            Ok(())
        } else {
            let mut block = self.get(prev)?;
            block.next = to;
            self.put(prev, block)
        }
    }

    fn get(&self, offset: u64) -> Result<BlockHeader, BackendError> {
        let offset = usize::try_from(offset).map_err(|_| BackendError::Corrupt("heap offset"))?;
        layout::read(self.region, offset)
    }

    fn put(&mut self, offset: u64, block: BlockHeader) -> Result<(), BackendError> {
        let offset = usize::try_from(offset).map_err(|_| BackendError::Corrupt("heap offset"))?;
        layout::write(self.region, offset, &block)
    }
}
