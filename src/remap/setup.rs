use std::ptr::NonNull;

use log::debug;

use crate::memory::ledger::Ledger;
use crate::memory::vm::VmError;

use super::table::{DEST_TAG, SOURCE_TAG, Scenario};

/// How a scenario builds its precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setup {
    /// Page-aligned heap block, tagged.
    GrowWithMove,
    /// Heap block whose address is deliberately not page-aligned.
    Unaligned,
    /// Tagged source and tagged destination mappings; the call targets the
    /// destination exactly.
    FixedDestination,
    /// One tagged mapping, duplicated without unmapping.
    DetachInPlace,
    /// Tagged source plus a candidate destination passed as a hint.
    DetachWithHint,
}

/// The addresses a setup produced. Both are owned by the scenario's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    pub source: NonNull<u8>,
    pub dest: Option<NonNull<u8>>,
}

impl Setup {
    /// Whether this setup maps a destination region.
    pub fn maps_destination(self) -> bool {
        matches!(self, Setup::FixedDestination | Setup::DetachWithHint)
    }

    /// Build the precondition for `scenario`, recording every region in
    /// `ledger`.
    pub fn prepare(self, scenario: &Scenario, ledger: &mut Ledger) -> Result<Prepared, VmError> {
        let page_size = ledger.page_size();
        let dest_size = scenario.dest_size.unwrap_or(scenario.new_size);

        let prepared = match self {
            Setup::GrowWithMove => {
                let source = ledger.alloc_heap(scenario.old_size, page_size)?;
                // Safety: source is a live block of old_size > 0 bytes.
                unsafe { write_tag(source, SOURCE_TAG) };
                Prepared { source, dest: None }
            }
            Setup::Unaligned => {
                // One spare byte so the source can be nudged off a page boundary.
                let block = ledger.alloc_heap(scenario.old_size + 1, 1)?;
                let source = if block.as_ptr() as usize % page_size == 0 {
                    // Safety: the block is old_size + 1 bytes long.
                    unsafe { block.add(1) }
                } else {
                    block
                };
                Prepared { source, dest: None }
            }
            Setup::FixedDestination => {
                let source = ledger.map_anonymous(scenario.old_size)?;
                let dest = ledger.map_anonymous(dest_size)?;
                // Safety: both are fresh read/write mappings.
                unsafe {
                    write_tag(source, SOURCE_TAG);
                    write_tag(dest, DEST_TAG);
                }
                Prepared {
                    source,
                    dest: Some(dest),
                }
            }
            Setup::DetachInPlace => {
                let source = ledger.map_anonymous(scenario.old_size)?;
                // Safety: fresh read/write mapping.
                unsafe { write_tag(source, SOURCE_TAG) };
                Prepared { source, dest: None }
            }
            Setup::DetachWithHint => {
                let source = ledger.map_anonymous(scenario.old_size)?;
                let dest = ledger.map_anonymous(dest_size)?;
                // Safety: fresh read/write mapping.
                unsafe { write_tag(source, SOURCE_TAG) };
                Prepared {
                    source,
                    dest: Some(dest),
                }
            }
        };

        debug!(
            "{self:?}: source {:p} ({} bytes), dest {:?}",
            prepared.source, scenario.old_size, prepared.dest
        );
        Ok(prepared)
    }
}

/// # Safety
/// `ptr` must point to at least one writable byte.
pub(crate) unsafe fn write_tag(ptr: NonNull<u8>, tag: u8) {
    // Volatile: the kernel moves these pages behind the compiler's back.
    unsafe { ptr.as_ptr().write_volatile(tag) }
}

/// # Safety
/// `ptr` must point to at least one readable byte.
pub(crate) unsafe fn read_tag(ptr: NonNull<u8>) -> u8 {
    unsafe { ptr.as_ptr().read_volatile() }
}
