//! Slab allocation management for `SegmentArray`.
//!
//! This module handles the single backing allocation, similar to how
//! `RawVec` works for `Vec` in the standard library: it owns the memory and
//! the layout math, but does not track element initialization; that is the
//! container's job.
//!
//! The slab is one contiguous region carved into four sub-structures:
//!
//! ```text
//! [ Header | bitmap bytes | ordering entries | Block | Block | ... | Block ]
//! ```
//!
//! Offsets are computed once per (re)allocation with `Layout::extend` chains
//! and stored beside the base pointer; every typed view (header reference,
//! bitmap slice, ordering slice, block pointer) derives from those offsets.
//! No other module does pointer arithmetic into the slab.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use allocator_api2::alloc::{Allocator, Global};

use crate::bitmap;
use crate::block::{Block, BLOCK_CAPACITY};
use crate::ordering::INVALID;
use crate::Error;

/// Block count of a default-constructed container (64 elements).
pub(crate) const DEFAULT_BLOCK_COUNT: usize = 8;

/// Slab metadata, stored at offset 0 of the allocation.
///
/// Written only by this module (allocation, growth) and the block
/// reserve/release pair; `dump_memory` renders it verbatim.
#[repr(C)]
pub(crate) struct Header {
    pub(crate) elem_size: u32,
    pub(crate) block_capacity: u32,
    pub(crate) num_blocks: u32,
    pub(crate) bitmap_bytes: u32,
    pub(crate) header_bytes: u32,
    pub(crate) blocks_in_use: u32,
    pub(crate) alloc_bytes: u64,
}

/// Region offsets for one slab allocation.
#[derive(Clone, Copy)]
struct SlabLayout {
    layout: Layout,
    bitmap_offset: usize,
    bitmap_len: usize,
    ordering_offset: usize,
    blocks_offset: usize,
    num_blocks: usize,
}

impl SlabLayout {
    fn compute<T>(num_blocks: usize) -> Result<Self, Error> {
        // Ordering entries are u32 with u32::MAX reserved as the sentinel.
        if num_blocks >= INVALID as usize {
            return Err(Error::CapacityOverflow);
        }

        let bitmap_len = bitmap::bytes_for(num_blocks);
        let overflow = |_| Error::CapacityOverflow;

        let header = Layout::new::<Header>();
        let (layout, bitmap_offset) = header
            .extend(Layout::array::<u8>(bitmap_len).map_err(overflow)?)
            .map_err(overflow)?;
        let (layout, ordering_offset) = layout
            .extend(Layout::array::<u32>(num_blocks).map_err(overflow)?)
            .map_err(overflow)?;
        let (layout, blocks_offset) = layout
            .extend(Layout::array::<Block<T>>(num_blocks).map_err(overflow)?)
            .map_err(overflow)?;

        Ok(SlabLayout {
            layout: layout.pad_to_align(),
            bitmap_offset,
            bitmap_len,
            ordering_offset,
            blocks_offset,
            num_blocks,
        })
    }
}

/// The raw slab: owns the allocation and the region offsets.
///
/// Elements live inside `Block` records whose `len` counters bound
/// initialization; dropping a `RawSlab` frees memory only, so the container
/// must drop live elements first.
pub(crate) struct RawSlab<T, A: Allocator = Global> {
    ptr: NonNull<u8>,
    layout: SlabLayout,
    alloc: A,
    _marker: PhantomData<T>,
}

impl<T, A: Allocator> RawSlab<T, A> {
    /// Allocates a slab of `num_blocks` empty blocks: header initialized,
    /// bitmap zeroed, ordering table all-sentinel, no elements constructed.
    pub(crate) fn allocate_in(num_blocks: usize, alloc: A) -> Result<Self, Error> {
        debug_assert!(num_blocks > 0);
        let layout = SlabLayout::compute::<T>(num_blocks)?;
        let ptr = Self::alloc_region(&alloc, layout)?;
        Ok(Self {
            ptr,
            layout,
            alloc,
            _marker: PhantomData,
        })
    }

    /// Obtains and initializes one region for `layout`. Split out so growth
    /// can build the replacement slab before touching the current one.
    fn alloc_region(alloc: &A, layout: SlabLayout) -> Result<NonNull<u8>, Error> {
        let ptr = alloc
            .allocate(layout.layout)
            .map_err(|_| Error::AllocError {
                layout: layout.layout,
            })?
            .cast::<u8>();

        unsafe {
            let base = ptr.as_ptr();
            ptr::write(
                base as *mut Header,
                Header {
                    elem_size: mem::size_of::<T>() as u32,
                    block_capacity: BLOCK_CAPACITY as u32,
                    num_blocks: layout.num_blocks as u32,
                    bitmap_bytes: layout.bitmap_len as u32,
                    header_bytes: mem::size_of::<Header>() as u32,
                    blocks_in_use: 0,
                    alloc_bytes: layout.layout.size() as u64,
                },
            );
            ptr::write_bytes(base.add(layout.bitmap_offset), 0, layout.bitmap_len);
            slice::from_raw_parts_mut(
                base.add(layout.ordering_offset) as *mut u32,
                layout.num_blocks,
            )
            .fill(INVALID);
            let blocks = base.add(layout.blocks_offset) as *mut Block<T>;
            for i in 0..layout.num_blocks {
                Block::init_record(blocks.add(i));
            }
        }

        Ok(ptr)
    }

    /// Total block slots in the slab.
    #[inline]
    pub(crate) fn num_blocks(&self) -> usize {
        self.layout.num_blocks
    }

    /// Element capacity of the slab.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.layout.num_blocks * BLOCK_CAPACITY
    }

    /// Blocks currently reserved from the bitmap.
    #[inline]
    pub(crate) fn blocks_in_use(&self) -> usize {
        self.header().blocks_in_use as usize
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        unsafe { &*(self.ptr.as_ptr() as *const Header) }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut Header {
        unsafe { &mut *(self.ptr.as_ptr() as *mut Header) }
    }

    #[inline]
    pub(crate) fn bitmap(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                self.ptr.as_ptr().add(self.layout.bitmap_offset),
                self.layout.bitmap_len,
            )
        }
    }

    #[inline]
    fn bitmap_mut(&mut self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.layout.bitmap_offset),
                self.layout.bitmap_len,
            )
        }
    }

    /// The full ordering table, sentinel tail included.
    #[inline]
    pub(crate) fn ordering(&self) -> &[u32] {
        unsafe {
            slice::from_raw_parts(
                self.ptr.as_ptr().add(self.layout.ordering_offset) as *const u32,
                self.layout.num_blocks,
            )
        }
    }

    #[inline]
    pub(crate) fn ordering_mut(&mut self) -> &mut [u32] {
        unsafe {
            slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.layout.ordering_offset) as *mut u32,
                self.layout.num_blocks,
            )
        }
    }

    #[inline]
    fn block_ptr(&self, id: u32) -> *mut Block<T> {
        debug_assert!((id as usize) < self.layout.num_blocks);
        unsafe {
            (self.ptr.as_ptr().add(self.layout.blocks_offset) as *mut Block<T>).add(id as usize)
        }
    }

    /// # Safety
    ///
    /// `id` must be below `num_blocks()`.
    #[inline]
    pub(crate) unsafe fn block(&self, id: u32) -> &Block<T> {
        &*self.block_ptr(id)
    }

    /// # Safety
    ///
    /// `id` must be below `num_blocks()`.
    #[inline]
    pub(crate) unsafe fn block_mut(&mut self, id: u32) -> &mut Block<T> {
        &mut *self.block_ptr(id)
    }

    /// Reserves the lowest free block: sets its bit, bumps blocks-in-use and
    /// zeroes the block's live counter. Returns `None` when the bitmap is
    /// full, in which case the caller grows the slab and retries.
    pub(crate) fn reserve_block(&mut self) -> Option<u32> {
        let free = bitmap::first_clear(self.bitmap(), self.layout.num_blocks)?;
        bitmap::set(self.bitmap_mut(), free);
        self.header_mut().blocks_in_use += 1;
        debug_assert_eq!(bitmap::count_ones(self.bitmap()), self.blocks_in_use());
        let id = free as u32;
        unsafe { self.block_mut(id).reset() };
        Some(id)
    }

    /// Returns a block to the free pool. The caller has already emptied the
    /// block and removed its ordering entry.
    pub(crate) fn release_block(&mut self, id: u32) {
        debug_assert!(bitmap::is_set(self.bitmap(), id as usize));
        debug_assert!(unsafe { self.block(id).is_empty() });
        bitmap::clear(self.bitmap_mut(), id as usize);
        self.header_mut().blocks_in_use -= 1;
        debug_assert_eq!(bitmap::count_ones(self.bitmap()), self.blocks_in_use());
    }

    /// Doubles the block count by allocating a new slab and migrating every
    /// live block into it, walking the ordering table start to end.
    ///
    /// Physical ids are preserved, so the ordering entries and bitmap copy
    /// verbatim and nothing needs renumbering. Elements move bitwise (a Rust
    /// move); the old region is then freed without dropping. On failure the
    /// slab is untouched.
    pub(crate) fn grow_double(&mut self) -> Result<(), Error> {
        let old = self.layout;
        let new_blocks = old
            .num_blocks
            .checked_mul(2)
            .ok_or(Error::CapacityOverflow)?;
        let new = SlabLayout::compute::<T>(new_blocks)?;
        let new_ptr = Self::alloc_region(&self.alloc, new)?;

        let in_use = self.header().blocks_in_use;
        unsafe {
            let new_base = new_ptr.as_ptr();
            (*(new_base as *mut Header)).blocks_in_use = in_use;

            // The new bitmap was zeroed by alloc_region; the old one is a
            // prefix of it.
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(old.bitmap_offset),
                new_base.add(new.bitmap_offset),
                old.bitmap_len,
            );

            let src_ord = self.ptr.as_ptr().add(old.ordering_offset) as *const u32;
            let dst_ord = new_base.add(new.ordering_offset) as *mut u32;
            let src_blocks = self.ptr.as_ptr().add(old.blocks_offset) as *const Block<T>;
            let dst_blocks = new_base.add(new.blocks_offset) as *mut Block<T>;
            for pos in 0..in_use as usize {
                let phys = *src_ord.add(pos);
                *dst_ord.add(pos) = phys;
                ptr::copy_nonoverlapping(
                    src_blocks.add(phys as usize),
                    dst_blocks.add(phys as usize),
                    1,
                );
            }
        }

        unsafe { self.alloc.deallocate(self.ptr, old.layout) };
        self.ptr = new_ptr;
        self.layout = new;
        Ok(())
    }
}

impl<T, A: Allocator> Drop for RawSlab<T, A> {
    fn drop(&mut self) {
        // Frees the region only; SegmentArray drops live elements first.
        unsafe { self.alloc.deallocate(self.ptr, self.layout.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    fn slab(blocks: usize) -> RawSlab<u64, Global> {
        RawSlab::allocate_in(blocks, Global).unwrap()
    }

    #[test]
    fn test_fresh_slab_is_empty() {
        let s = slab(4);
        assert_eq!(s.num_blocks(), 4);
        assert_eq!(s.capacity(), 32);
        assert_eq!(s.blocks_in_use(), 0);
        assert!(s.bitmap().iter().all(|&b| b == 0));
        assert!(s.ordering().iter().all(|&e| e == INVALID));

        let h = s.header();
        assert_eq!(h.elem_size, 8);
        assert_eq!(h.block_capacity, BLOCK_CAPACITY as u32);
        assert_eq!(h.num_blocks, 4);
        assert_eq!(h.bitmap_bytes, 1);
        assert_eq!(h.header_bytes as usize, mem::size_of::<Header>());
        // Header + bitmap + ordering + blocks, plus alignment padding.
        assert!(
            h.alloc_bytes as usize
                >= mem::size_of::<Header>() + 1 + 4 * 4 + 4 * mem::size_of::<Block<u64>>()
        );
    }

    #[test]
    fn test_reserve_is_lowest_first() {
        let mut s = slab(4);
        assert_eq!(s.reserve_block(), Some(0));
        assert_eq!(s.reserve_block(), Some(1));
        assert_eq!(s.reserve_block(), Some(2));
        assert_eq!(s.blocks_in_use(), 3);

        s.release_block(1);
        assert_eq!(s.blocks_in_use(), 2);
        assert_eq!(s.reserve_block(), Some(1));
    }

    #[test]
    fn test_reserve_exhaustion() {
        let mut s = slab(2);
        assert_eq!(s.reserve_block(), Some(0));
        assert_eq!(s.reserve_block(), Some(1));
        assert_eq!(s.reserve_block(), None);
    }

    #[test]
    fn test_grow_preserves_ids_and_order() {
        let mut s = slab(2);
        let a = s.reserve_block().unwrap();
        let b = s.reserve_block().unwrap();
        unsafe {
            s.block_mut(a).insert(0, 11);
            s.block_mut(b).insert(0, 22);
            s.block_mut(b).insert(1, 33);
        }
        s.ordering_mut()[0] = b;
        s.ordering_mut()[1] = a;

        s.grow_double().unwrap();

        assert_eq!(s.num_blocks(), 4);
        assert_eq!(s.blocks_in_use(), 2);
        assert_eq!(&s.ordering()[..2], &[b, a]);
        assert_eq!(&s.ordering()[2..], &[INVALID, INVALID]);
        assert_eq!(s.reserve_block(), Some(2));
        unsafe {
            assert_eq!(*s.block(a).get_unchecked(0), 11);
            assert_eq!(s.block(b).len(), 2);
            assert_eq!(*s.block(b).get_unchecked(1), 33);
        }
    }
}
