//! The scenario matrix.
//!
//! Entries are declared in pages and materialized into byte sizes for a
//! given page size right before they run. The table itself is never mutated.

use crate::memory::vm::{RemapFlags, VmError};

use super::setup::Setup;

/// Byte written at offset 0 of every source before the call.
pub const SOURCE_TAG: u8 = 0x01;
/// Byte written at offset 0 of a destination mapping before the call.
pub const DEST_TAG: u8 = 0x02;

/// What `mremap` must return for a scenario to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Any address other than `MAP_FAILED`.
    Mapped,
    /// Exactly the destination mapping set up for the scenario.
    MappedAtDestination,
    /// `MAP_FAILED` with this `errno`.
    Failed { errno: i32 },
}

impl Expectation {
    pub fn expects_failure(self) -> bool {
        matches!(self, Expectation::Failed { .. })
    }
}

/// A scenario as declared: sizes in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioSpec {
    pub label: &'static str,
    pub setup: Setup,
    pub flags: RemapFlags,
    pub old_pages: usize,
    pub new_pages: usize,
    /// Size of the destination mapping, for setups that create one.
    pub dest_pages: Option<usize>,
    pub expect: Expectation,
}

/// A scenario ready to run: sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    pub label: &'static str,
    pub setup: Setup,
    pub flags: RemapFlags,
    pub old_size: usize,
    pub new_size: usize,
    pub dest_size: Option<usize>,
    pub expect: Expectation,
}

impl ScenarioSpec {
    /// Scale every page count by `page_size`, once.
    pub fn materialize(&self, page_size: usize) -> Result<Scenario, VmError> {
        let bytes = |pages: usize| {
            pages
                .checked_mul(page_size)
                .ok_or(VmError::SizeOverflow { pages, page_size })
        };

        Ok(Scenario {
            label: self.label,
            setup: self.setup,
            flags: self.flags,
            old_size: bytes(self.old_pages)?,
            new_size: bytes(self.new_pages)?,
            dest_size: self.dest_pages.map(bytes).transpose()?,
            expect: self.expect,
        })
    }
}

pub const SCENARIOS: [ScenarioSpec; 5] = [
    ScenarioSpec {
        label: "MREMAP_MAYMOVE grows an aligned mapping, moving it if needed",
        setup: Setup::GrowWithMove,
        flags: RemapFlags::MAYMOVE,
        old_pages: 2,
        new_pages: 4,
        dest_pages: None,
        expect: Expectation::Mapped,
    },
    ScenarioSpec {
        label: "MREMAP_MAYMOVE rejects a source that is not page-aligned",
        setup: Setup::Unaligned,
        flags: RemapFlags::MAYMOVE,
        old_pages: 2,
        new_pages: 4,
        dest_pages: None,
        expect: Expectation::Failed { errno: libc::EINVAL },
    },
    ScenarioSpec {
        label: "MREMAP_FIXED grows and moves the mapping onto new_addr, replacing what was there",
        setup: Setup::FixedDestination,
        flags: RemapFlags::FIXED.union(RemapFlags::MAYMOVE),
        old_pages: 2,
        new_pages: 4,
        dest_pages: Some(4),
        expect: Expectation::MappedAtDestination,
    },
    ScenarioSpec {
        label: "MREMAP_DONTUNMAP moves the pages without unmapping the old range",
        setup: Setup::DetachInPlace,
        flags: RemapFlags::DONTUNMAP.union(RemapFlags::MAYMOVE),
        old_pages: 2,
        new_pages: 2,
        dest_pages: None,
        expect: Expectation::Mapped,
    },
    ScenarioSpec {
        label: "MREMAP_DONTUNMAP with new_addr as a hint; the kernel may place the mapping elsewhere",
        setup: Setup::DetachWithHint,
        flags: RemapFlags::DONTUNMAP.union(RemapFlags::MAYMOVE),
        old_pages: 2,
        new_pages: 2,
        dest_pages: Some(2),
        expect: Expectation::Mapped,
    },
];
