//! Ownership bookkeeping for the memory a single scenario creates.
//!
//! Every region is recorded with the exact length it was created with, so
//! cleanup never issues a mismatched `munmap`. After a successful remap the
//! ledger applies the ownership transfer the kernel performed: a moved
//! source is gone, a displaced destination is gone, the new mapping is owned.

use std::ptr::NonNull;

use log::{debug, error};

use super::stats::{self, Snapshot};
use super::vm::{PlatformVmOps, RemapFlags, VmError, VmOps};

/// A half-open address range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

impl Region {
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn from_ptr(ptr: NonNull<u8>, len: usize) -> Self {
        Self::new(ptr.as_ptr() as usize, len)
    }

    pub const fn end(self) -> usize {
        self.start.saturating_add(self.len)
    }

    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    pub fn overlaps(self, other: Region) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// The parts of `self` not covered by `other`, lowest first.
    pub fn subtract(self, other: Region) -> [Option<Region>; 2] {
        if !self.overlaps(other) {
            return [Some(self), None];
        }
        let below = (other.start > self.start)
            .then(|| Region::new(self.start, other.start - self.start));
        let above = (other.end() < self.end())
            .then(|| Region::new(other.end(), self.end() - other.end()));
        [below, above]
    }

    /// Smallest page-aligned region covering `self`.
    pub fn page_span(self, page_size: usize) -> Region {
        debug_assert!(page_size.is_power_of_two());
        let start = self.start & !(page_size - 1);
        let end = self.end().next_multiple_of(page_size);
        Region::new(start, end - start)
    }

    fn as_ptr(self) -> Option<NonNull<u8>> {
        NonNull::new(self.start as *mut u8)
    }
}

/// Pages a remap took out of a heap block, and where they live now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MovedPages {
    hole: Region,
    now_at: Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeapBlock {
    region: Region,
    align: usize,
    /// Set once a remap moved pages out of the block. They must be put back
    /// before the block goes back to the allocator.
    moved: Option<MovedPages>,
}

/// The pure part of the ledger: what is owned, no OS calls.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Holdings {
    mappings: Vec<Region>,
    heap: Vec<HeapBlock>,
}

impl Holdings {
    fn snapshot(&self) -> Snapshot {
        let moved = self.heap.iter().filter_map(|b| b.moved);
        Snapshot {
            live_mappings: self.mappings.len() + moved.clone().count(),
            mapped_bytes: self.mappings.iter().map(|m| m.len).sum::<usize>()
                + moved.map(|m| m.now_at.len).sum::<usize>(),
            live_heap_blocks: self.heap.len(),
            heap_bytes: self.heap.iter().map(|b| b.region.len).sum(),
        }
    }

    fn is_empty(&self) -> bool {
        self.mappings.is_empty() && self.heap.is_empty()
    }

    fn add_mapping(&mut self, region: Region) {
        self.mappings.push(region);
    }

    fn add_heap(&mut self, region: Region, align: usize) {
        self.heap.push(HeapBlock {
            region,
            align,
            moved: None,
        });
    }

    /// Drop `range` from every owned mapping, keeping whatever lies outside it.
    fn carve(&mut self, range: Region) {
        let mut kept = Vec::with_capacity(self.mappings.len() + 1);
        for mapping in self.mappings.drain(..) {
            kept.extend(mapping.subtract(range).into_iter().flatten());
        }
        self.mappings = kept;
    }

    fn record_remap(&mut self, source: Region, result: Region, flags: RemapFlags, page_size: usize) {
        // Whatever we owned under the new mapping was replaced by it.
        self.carve(result);

        if !flags.contains(RemapFlags::DONTUNMAP) {
            self.carve(source);
            // Pages taken from a heap block stay tied to it until they are
            // returned.
            if let Some(block) = self.heap.iter_mut().find(|b| b.region.overlaps(source)) {
                block.moved = Some(MovedPages {
                    hole: source.page_span(page_size),
                    now_at: result.page_span(page_size),
                });
                return;
            }
        }
        self.add_mapping(result);
    }
}

/// Move the pages of a heap block back to the address they were taken
/// from. Landing them at their old offset lets the kernel merge them with
/// the rest of the heap's mapping again.
fn restore(moved: MovedPages) -> Result<(), VmError> {
    let MovedPages { hole, now_at } = moved;
    let (Some(hole_ptr), Some(now_ptr)) = (hole.as_ptr(), now_at.as_ptr()) else {
        return Ok(());
    };
    let restore_failed = |source| VmError::RefillFailed {
        addr: hole.start,
        len: hole.len,
        source,
    };
    let back = now_at.len.min(hole.len);

    if now_at.start == hole.start {
        if now_at.len > hole.len {
            // Grown in place: shrink back to the block's pages.
            // Safety: the ledger owns the whole grown range.
            unsafe { PlatformVmOps::remap(now_ptr, now_at.len, hole.len, RemapFlags::empty(), None) }
                .map_err(restore_failed)?;
        }
    } else {
        // Safety: the hole is unmapped and lies inside a block we still own.
        unsafe {
            PlatformVmOps::remap(
                now_ptr,
                now_at.len,
                back,
                RemapFlags::FIXED | RemapFlags::MAYMOVE,
                Some(hole_ptr),
            )
        }
        .map_err(restore_failed)?;
    }

    // A shrinking remap gave back fewer pages than it took.
    if back < hole.len {
        let tail = Region::new(hole.start + back, hole.len - back);
        if let Some(ptr) = tail.as_ptr() {
            // Safety: the tail is unmapped and lies inside a block we still own.
            unsafe { PlatformVmOps::map_fixed_noreplace(ptr, tail.len)? };
        }
    }
    Ok(())
}

/// Regions owned by one scenario. Released explicitly with
/// [`Ledger::release`]; anything left at drop time is released and logged.
#[derive(Debug)]
pub struct Ledger {
    page_size: usize,
    holdings: Holdings,
}

impl Ledger {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            holdings: Holdings::default(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Map `len` anonymous bytes and take ownership of them.
    pub fn map_anonymous(&mut self, len: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap with a null hint; nothing existing is touched.
        let ptr = unsafe { PlatformVmOps::map_anonymous(len)? };
        debug!("mapped {len} bytes at {ptr:p}");
        self.update(|h| h.add_mapping(Region::from_ptr(ptr, len)));
        Ok(ptr)
    }

    /// Allocate a heap block of `len` bytes aligned to `align` and take
    /// ownership of it.
    pub fn alloc_heap(&mut self, len: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let ptr = PlatformVmOps::alloc_aligned(len, align)?;
        debug!("allocated {len} heap bytes (align {align}) at {ptr:p}");
        self.update(|h| h.add_heap(Region::from_ptr(ptr, len), align));
        Ok(ptr)
    }

    /// Apply the ownership transfer of a successful `mremap` of `source`
    /// that produced `result`.
    pub fn record_remap(&mut self, source: Region, result: Region, flags: RemapFlags) {
        let page_size = self.page_size;
        self.update(|h| h.record_remap(source, result, flags, page_size));
    }

    /// Mappings currently owned, in no particular order.
    pub fn mappings(&self) -> &[Region] {
        &self.holdings.mappings
    }

    pub fn heap_blocks(&self) -> usize {
        self.holdings.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }

    /// Release everything. Keeps going after a failure and reports the first
    /// one; a failure here means the process's address space no longer
    /// matches the ledger.
    pub fn release(mut self) -> Result<(), VmError> {
        self.release_all()
    }

    fn update(&mut self, f: impl FnOnce(&mut Holdings)) {
        let before = self.holdings.snapshot();
        f(&mut self.holdings);
        stats::apply_delta(before, self.holdings.snapshot());
    }

    fn release_all(&mut self) -> Result<(), VmError> {
        let holdings = std::mem::take(&mut self.holdings);
        stats::apply_delta(holdings.snapshot(), Snapshot::default());

        let mut first_err = None;

        for mapping in holdings.mappings {
            // Safety: the ledger created or inherited this exact region.
            if let Err(e) = unsafe { PlatformVmOps::unmap(mapping.as_ptr(), mapping.len) } {
                error!("munmap of {} bytes at {:#x} failed: {e}", mapping.len, mapping.start);
                first_err.get_or_insert(e);
            }
        }

        for block in holdings.heap {
            if let Some(moved) = block.moved {
                if let Err(e) = restore(moved) {
                    error!("leaking heap block at {:#x}: {e}", block.region.start);
                    first_err.get_or_insert(e);
                    continue;
                }
                debug!(
                    "returned {} bytes from {:#x} to {:#x}",
                    moved.hole.len, moved.now_at.start, moved.hole.start
                );
            }
            if let Some(ptr) = block.region.as_ptr() {
                // Safety: same size and alignment as the allocation.
                unsafe { PlatformVmOps::dealloc(ptr, block.region.len, block.align) };
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if self.holdings.is_empty() {
            return;
        }
        if let Err(e) = self.release_all() {
            error!("ledger cleanup on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn r(start: usize, len: usize) -> Region {
        Region::new(start, len)
    }

    #[test]
    fn test_subtract_cases() {
        // disjoint
        assert_eq!(r(0, 10).subtract(r(10, 5)), [Some(r(0, 10)), None]);
        // fully covered
        assert_eq!(r(10, 10).subtract(r(0, 40)), [None, None]);
        // hole in the middle
        assert_eq!(r(0, 30).subtract(r(10, 10)), [Some(r(0, 10)), Some(r(20, 10))]);
        // head covered
        assert_eq!(r(10, 20).subtract(r(0, 15)), [None, Some(r(15, 15))]);
        // tail covered
        assert_eq!(r(10, 20).subtract(r(25, 100)), [Some(r(10, 15)), None]);
    }

    #[test]
    fn test_empty_region_never_overlaps() {
        assert!(!r(10, 0).overlaps(r(0, 100)));
        assert!(!r(0, 100).overlaps(r(10, 0)));
    }

    #[test]
    fn test_page_span_rounds_outward() {
        assert_eq!(r(PAGE + 1, 10).page_span(PAGE), r(PAGE, PAGE));
        assert_eq!(r(PAGE - 1, 2).page_span(PAGE), r(0, 2 * PAGE));
        assert_eq!(r(2 * PAGE, 2 * PAGE).page_span(PAGE), r(2 * PAGE, 2 * PAGE));
    }

    #[test]
    fn test_fixed_move_displaces_destination() {
        let src = r(0x10_0000, 2 * PAGE);
        let dest = r(0x20_0000, 4 * PAGE);
        let mut h = Holdings::default();
        h.add_mapping(src);
        h.add_mapping(dest);

        h.record_remap(src, dest, RemapFlags::FIXED | RemapFlags::MAYMOVE, PAGE);

        // Only the new mapping is left: no double unmap of dest, no unmap of src.
        assert_eq!(h.mappings, vec![dest]);
    }

    #[test]
    fn test_fixed_move_keeps_destination_tail() {
        let src = r(0x10_0000, 2 * PAGE);
        let dest = r(0x20_0000, 4 * PAGE);
        let result = r(dest.start, 2 * PAGE);
        let mut h = Holdings::default();
        h.add_mapping(src);
        h.add_mapping(dest);

        h.record_remap(src, result, RemapFlags::FIXED | RemapFlags::MAYMOVE, PAGE);

        let mut got = h.mappings.clone();
        got.sort_by_key(|m| m.start);
        assert_eq!(got, vec![result, r(dest.start + 2 * PAGE, 2 * PAGE)]);
    }

    #[test]
    fn test_dontunmap_keeps_source() {
        let src = r(0x10_0000, 2 * PAGE);
        let result = r(0x30_0000, 2 * PAGE);
        let mut h = Holdings::default();
        h.add_mapping(src);

        h.record_remap(src, result, RemapFlags::DONTUNMAP | RemapFlags::MAYMOVE, PAGE);

        assert_eq!(h.mappings, vec![src, result]);
    }

    #[test]
    fn test_dontunmap_leaves_untouched_hint_mapping() {
        let src = r(0x10_0000, 2 * PAGE);
        let hint = r(0x20_0000, 2 * PAGE);
        let result = r(0x30_0000, 2 * PAGE);
        let mut h = Holdings::default();
        h.add_mapping(src);
        h.add_mapping(hint);

        h.record_remap(src, result, RemapFlags::DONTUNMAP | RemapFlags::MAYMOVE, PAGE);

        assert_eq!(h.mappings, vec![src, hint, result]);
    }

    #[test]
    fn test_grow_in_place_replaces_source() {
        let src = r(0x10_0000, 2 * PAGE);
        let result = r(src.start, 4 * PAGE);
        let mut h = Holdings::default();
        h.add_mapping(src);

        h.record_remap(src, result, RemapFlags::MAYMOVE, PAGE);

        assert_eq!(h.mappings, vec![result]);
    }

    #[test]
    fn test_move_out_of_heap_ties_pages_to_block() {
        let block = r(0x50_0000, 2 * PAGE);
        let result = r(0x70_0000, 4 * PAGE);
        let mut h = Holdings::default();
        h.add_heap(block, PAGE);

        h.record_remap(block, result, RemapFlags::MAYMOVE, PAGE);

        // The moved pages are owned through the block, not as a mapping.
        assert!(h.mappings.is_empty());
        assert_eq!(h.heap.len(), 1);
        assert_eq!(
            h.heap[0].moved,
            Some(MovedPages {
                hole: block,
                now_at: result
            })
        );
        let s = h.snapshot();
        assert_eq!(s.live_mappings, 1);
        assert_eq!(s.mapped_bytes, 4 * PAGE);
    }

    #[test]
    fn test_dontunmap_from_heap_leaves_block_whole() {
        let block = r(0x50_0000, 2 * PAGE);
        let result = r(0x70_0000, 2 * PAGE);
        let mut h = Holdings::default();
        h.add_heap(block, PAGE);

        h.record_remap(block, result, RemapFlags::DONTUNMAP | RemapFlags::MAYMOVE, PAGE);

        assert_eq!(h.heap[0].moved, None);
        assert_eq!(h.mappings, vec![result]);
    }

    #[test]
    fn test_snapshot_counts_splits() {
        let mut h = Holdings::default();
        h.add_mapping(r(0, 3 * PAGE));
        h.carve(r(PAGE, PAGE));
        let s = h.snapshot();
        assert_eq!(s.live_mappings, 2);
        assert_eq!(s.mapped_bytes, 2 * PAGE);
    }

    #[test]
    fn test_ledger_release_restores_counters() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        let before = Snapshot::current();

        let mut ledger = Ledger::new(page);
        let a = ledger.map_anonymous(2 * page).expect("map failed");
        let _b = ledger.map_anonymous(page).expect("map failed");
        let _c = ledger.alloc_heap(page, page).expect("alloc failed");

        let during = Snapshot::current();
        assert_eq!(during.live_mappings, before.live_mappings + 2);
        assert_eq!(during.mapped_bytes, before.mapped_bytes + 3 * page);
        assert_eq!(during.live_heap_blocks, before.live_heap_blocks + 1);

        ledger.release().expect("release failed");

        assert_eq!(Snapshot::current(), before);
        // Safety: Test code.
        assert!(!unsafe { PlatformVmOps::is_mapped(a, 2 * page) }.expect("mincore failed"));
    }

    #[test]
    fn test_ledger_drop_releases() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        let before = Snapshot::current();
        let ptr;
        {
            let mut ledger = Ledger::new(page);
            ptr = ledger.map_anonymous(page).expect("map failed");
        }
        assert_eq!(Snapshot::current(), before);
        // Safety: Test code.
        assert!(!unsafe { PlatformVmOps::is_mapped(ptr, page) }.expect("mincore failed"));
    }

    /// Bounds of the VMA containing `addr`, from `/proc/self/maps`.
    fn vma_around(addr: usize) -> Option<(usize, usize)> {
        let maps = std::fs::read_to_string("/proc/self/maps").expect("/proc/self/maps unavailable");
        maps.lines().find_map(|line| {
            let range = line.split_whitespace().next()?;
            let (lo, hi) = range.split_once('-')?;
            let lo = usize::from_str_radix(lo, 16).ok()?;
            let hi = usize::from_str_radix(hi, 16).ok()?;
            (lo <= addr && addr < hi).then_some((lo, hi))
        })
    }

    #[test]
    fn test_restore_rejoins_original_mapping() {
        // Moved-out pages must merge back, or a later remap spanning the
        // seam fails with EFAULT.
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let base = PlatformVmOps::map_anonymous(3 * page).expect("Map failed");
            for i in 0..3u8 {
                base.as_ptr().add(usize::from(i) * page).write(i + 1);
            }
            let middle = NonNull::new(base.as_ptr().add(page)).unwrap();
            let moved = PlatformVmOps::remap(middle, page, 2 * page, RemapFlags::MAYMOVE, None)
                .expect("mremap failed");
            assert_ne!(moved, middle);

            restore(MovedPages {
                hole: Region::from_ptr(middle, page),
                now_at: Region::from_ptr(moved, 2 * page),
            })
            .expect("restore failed");

            assert_eq!(middle.as_ptr().read(), 2);
            let start = base.as_ptr() as usize;
            let (lo, hi) = vma_around(start).expect("base not mapped");
            assert!(lo <= start && start + 3 * page <= hi, "mapping still split at {lo:#x}-{hi:#x}");

            // A remap across the old seam works again.
            let grown = PlatformVmOps::remap(base, 3 * page, 4 * page, RemapFlags::MAYMOVE, None)
                .expect("remap across the seam failed");
            assert_eq!(grown.as_ptr().add(page).read(), 2);
            PlatformVmOps::unmap(Some(grown), 4 * page).expect("Unmap failed");
        }
    }

    #[test]
    fn test_ledger_heap_block_survives_move_out() {
        // Move pages out of a heap block, then hand the block back to the
        // allocator. Without putting the pages back the allocator would fault.
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        let before = Snapshot::current();

        let mut ledger = Ledger::new(page);
        let block = ledger.alloc_heap(2 * page, page).expect("alloc failed");
        // Safety: Test code.
        unsafe {
            block.as_ptr().write(0x1);
            let moved = PlatformVmOps::remap(block, 2 * page, 4 * page, RemapFlags::MAYMOVE, None)
                .expect("mremap failed");
            assert_eq!(moved.as_ptr().read(), 0x1);
            ledger.record_remap(
                Region::from_ptr(block, 2 * page),
                Region::from_ptr(moved, 4 * page),
                RemapFlags::MAYMOVE,
            );
        }
        assert!(ledger.mappings().is_empty());
        assert_eq!(ledger.heap_blocks(), 1);
        ledger.release().expect("release failed");
        assert_eq!(Snapshot::current(), before);

        // The allocator is still healthy.
        let v: Vec<u8> = vec![0xAB; 4 * page];
        assert!(v.iter().all(|b| *b == 0xAB));
    }
}
