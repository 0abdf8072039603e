use std::io;
use std::ptr::NonNull;

use bitflags::bitflags;
use thiserror::Error;

/// `MREMAP_DONTUNMAP` (Linux 5.7+). Spelled out here because not every
/// libc target exports it; the value is the same on every architecture.
const MREMAP_DONTUNMAP: libc::c_int = 4;

bitflags! {
    /// Flags accepted by `mremap(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RemapFlags: libc::c_int {
        /// The kernel may relocate the mapping.
        const MAYMOVE = libc::MREMAP_MAYMOVE;
        /// The result must land exactly at the fifth argument, replacing
        /// whatever is mapped there. Requires `MAYMOVE`.
        const FIXED = libc::MREMAP_FIXED;
        /// Leave the source range mapped after moving its pages.
        /// Requires `MAYMOVE` and equal old/new sizes.
        const DONTUNMAP = MREMAP_DONTUNMAP;
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("allocation of {size} bytes aligned to {align} failed")]
    OutOfMemory { size: usize, align: usize },
    #[error("anonymous mapping failed: {0}")]
    MapFailed(#[source] io::Error),
    #[error("munmap failed: {0}")]
    UnmapFailed(#[source] io::Error),
    #[error("mincore failed: {0}")]
    ResidencyFailed(#[source] io::Error),
    #[error("could not refill {len} bytes at {addr:#x}: {source}")]
    RefillFailed {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("{pages} pages of {page_size} bytes overflows the address space")]
    SizeOverflow { pages: usize, page_size: usize },
}

/// Abstract interface for the OS memory primitives the harness drives.
pub trait VmOps {
    /// OS page size.
    fn page_size() -> usize;

    /// Private anonymous read/write mapping of `size` bytes, zero-filled.
    unsafe fn map_anonymous(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Anonymous mapping at exactly `addr`. The range must be unmapped;
    /// an existing mapping is never replaced.
    unsafe fn map_fixed_noreplace(addr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Unmap `size` bytes at `ptr`. `None` is a no-op.
    unsafe fn unmap(ptr: Option<NonNull<u8>>, size: usize) -> Result<(), VmError>;

    /// The primitive under test. `Err` carries the `errno` reported
    /// alongside `MAP_FAILED`.
    unsafe fn remap(
        old: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        flags: RemapFlags,
        hint: Option<NonNull<u8>>,
    ) -> io::Result<NonNull<u8>>;

    /// Whether every page of `[ptr, ptr + size)` is mapped. `ptr` must be
    /// page-aligned.
    unsafe fn is_mapped(ptr: NonNull<u8>, size: usize) -> Result<bool, VmError>;

    /// Number of mappings in the process, if the OS exposes it.
    fn mapping_count() -> Option<usize>;

    /// Heap block from the system allocator, aligned to `align`.
    fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Ordinary heap block. No page-alignment guarantee.
    fn alloc(size: usize) -> Result<NonNull<u8>, VmError> {
        Self::alloc_aligned(size, 1)
    }

    /// Return a block obtained from [`VmOps::alloc_aligned`] or [`VmOps::alloc`].
    unsafe fn dealloc(ptr: NonNull<u8>, size: usize, align: usize);
}

pub struct PlatformVmOps;

#[cfg(target_os = "linux")]
mod linux {
    use super::{NonNull, PlatformVmOps, RemapFlags, VmError, VmOps};
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::io;
    use std::sync::OnceLock;

    impl VmOps for PlatformVmOps {
        fn page_size() -> usize {
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // Only 64-bit Linux targets are supported; the page size fits in usize.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        unsafe fn map_anonymous(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn map_fixed_noreplace(addr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            let refill_failed = |source| VmError::RefillFailed {
                addr: addr.as_ptr() as usize,
                len: size,
                source,
            };

            // Safety: FFI call to mmap. MAP_FIXED_NOREPLACE never clobbers an
            // existing mapping.
            let ptr = unsafe {
                libc::mmap(
                    addr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(refill_failed(io::Error::last_os_error()));
            }

            // Kernels before 4.17 treat the flag as a plain hint.
            if ptr.cast::<u8>() != addr.as_ptr() {
                // Safety: we just created this mapping.
                unsafe { libc::munmap(ptr, size) };
                return Err(refill_failed(io::Error::from_raw_os_error(libc::EEXIST)));
            }

            Ok(())
        }

        unsafe fn unmap(ptr: Option<NonNull<u8>>, size: usize) -> Result<(), VmError> {
            let Some(ptr) = ptr else {
                return Ok(());
            };
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn remap(
            old: NonNull<u8>,
            old_size: usize,
            new_size: usize,
            flags: RemapFlags,
            hint: Option<NonNull<u8>>,
        ) -> io::Result<NonNull<u8>> {
            // The fifth argument is always passed: the kernel reads it for
            // both FIXED and DONTUNMAP.
            let hint = hint.map_or(std::ptr::null_mut(), |p| p.as_ptr().cast::<libc::c_void>());

            // Safety: FFI call to mremap.
            let ptr = unsafe {
                libc::mremap(
                    old.as_ptr().cast::<libc::c_void>(),
                    old_size,
                    new_size,
                    flags.bits(),
                    hint,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mremap returned null"))
        }

        unsafe fn is_mapped(ptr: NonNull<u8>, size: usize) -> Result<bool, VmError> {
            let pages = size.div_ceil(Self::page_size()).max(1);
            let mut residency = vec![0u8; pages];

            // Safety: FFI call to mincore; `residency` holds one byte per page.
            let rc = unsafe {
                libc::mincore(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    residency.as_mut_ptr(),
                )
            };

            if rc == 0 {
                return Ok(true);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOMEM) => Ok(false),
                _ => Err(VmError::ResidencyFailed(err)),
            }
        }

        fn mapping_count() -> Option<usize> {
            std::fs::read_to_string("/proc/self/maps")
                .ok()
                .map(|maps| maps.lines().count())
        }

        fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            let oom = VmError::OutOfMemory { size, align };
            if size == 0 {
                return Err(oom);
            }
            let Ok(layout) = Layout::from_size_align(size, align) else {
                return Err(oom);
            };
            // Safety: layout has non-zero size.
            let ptr = unsafe { System.alloc(layout) };
            NonNull::new(ptr).ok_or(oom)
        }

        unsafe fn dealloc(ptr: NonNull<u8>, size: usize, align: usize) {
            // Safety: caller passes the size and alignment the block was
            // allocated with, which formed a valid layout at that time.
            unsafe {
                let layout = Layout::from_size_align_unchecked(size, align);
                System.dealloc(ptr.as_ptr(), layout);
            }
        }
    }
}
