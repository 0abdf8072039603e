use std::io;
use std::ptr::NonNull;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::memory::ledger::{Ledger, Region};
use crate::memory::vm::{PlatformVmOps, VmError, VmOps};

use super::setup::{Prepared, Setup, read_tag};
use super::table::{Expectation, SOURCE_TAG, Scenario, ScenarioSpec};

/// Why a scenario failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Mismatch {
    #[error("setup could not build the precondition: {0}")]
    Environment(String),
    #[error("expected a mapping, mremap failed with errno {errno}")]
    UnexpectedFailure { errno: i32 },
    #[error("expected errno {expected}, mremap returned {addr:#x}")]
    UnexpectedSuccess { expected: i32, addr: usize },
    #[error("expected errno {expected}, got {actual}")]
    WrongErrno { expected: i32, actual: i32 },
    #[error("expected the mapping at {expected:#x}, got {actual:#x}")]
    WrongAddress { expected: usize, actual: usize },
    #[error("byte at {addr:#x} reads {actual:#04x}, expected {expected:#04x}")]
    TagMismatch { addr: usize, expected: u8, actual: u8 },
    #[error("source at {addr:#x} is no longer mapped")]
    SourceUnmapped { addr: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(Mismatch),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    fn from_check(check: Result<(), Mismatch>) -> Self {
        match check {
            Ok(()) => Verdict::Passed,
            Err(m) => Verdict::Failed(m),
        }
    }
}

/// Run one scenario end to end: setup, `mremap`, verification, cleanup.
///
/// A verification failure or a refused heap allocation is reported in the
/// returned [`Verdict`]. `Err` means an anonymous mapping was refused or
/// cleanup failed; either ends the run.
pub fn run_scenario(spec: &ScenarioSpec, page_size: usize) -> Result<Verdict, VmError> {
    let scenario = spec.materialize(page_size)?;
    let mut ledger = Ledger::new(page_size);

    let prepared = match scenario.setup.prepare(&scenario, &mut ledger) {
        Ok(prepared) => prepared,
        // A refused mapping leaves nothing meaningful to test.
        Err(e @ VmError::MapFailed(_)) => {
            error!("{}: setup failed: {e}", scenario.label);
            ledger.release()?;
            return Err(e);
        }
        Err(e) => {
            warn!("{}: setup failed: {e}", scenario.label);
            ledger.release()?;
            return Ok(Verdict::Failed(Mismatch::Environment(e.to_string())));
        }
    };

    let hint = prepared.dest;

    debug!(
        "mremap({:p}, {}, {}, {:?}, {:?})",
        prepared.source, scenario.old_size, scenario.new_size, scenario.flags, hint
    );
    // Safety: the source and hint belong to this scenario's ledger; the
    // ledger is updated below to match whatever the kernel did.
    let result = unsafe {
        PlatformVmOps::remap(
            prepared.source,
            scenario.old_size,
            scenario.new_size,
            scenario.flags,
            hint,
        )
    };

    let verdict = match result {
        Ok(addr) => {
            debug!("mremap returned {addr:p}");
            let verdict = Verdict::from_check(check_mapped(&scenario, &prepared, addr));
            ledger.record_remap(
                Region::from_ptr(prepared.source, scenario.old_size),
                Region::from_ptr(addr, scenario.new_size),
                scenario.flags,
            );
            verdict
        }
        Err(err) => {
            debug!("mremap failed: {err}");
            Verdict::from_check(check_failed(&scenario, &err))
        }
    };

    ledger.release()?;

    match &verdict {
        Verdict::Passed => info!("{}: passed", scenario.label),
        Verdict::Failed(m) => warn!("{}: {m}", scenario.label),
    }
    Ok(verdict)
}

/// The call reported `MAP_FAILED`. Never touches the result.
fn check_failed(scenario: &Scenario, err: &io::Error) -> Result<(), Mismatch> {
    let actual = err.raw_os_error().unwrap_or(0);
    match scenario.expect {
        Expectation::Failed { errno } if errno == actual => Ok(()),
        Expectation::Failed { errno } => Err(Mismatch::WrongErrno {
            expected: errno,
            actual,
        }),
        Expectation::Mapped | Expectation::MappedAtDestination => {
            Err(Mismatch::UnexpectedFailure { errno: actual })
        }
    }
}

/// The call returned a mapping at `addr`.
fn check_mapped(scenario: &Scenario, prepared: &Prepared, addr: NonNull<u8>) -> Result<(), Mismatch> {
    match scenario.expect {
        Expectation::Failed { errno } => {
            return Err(Mismatch::UnexpectedSuccess {
                expected: errno,
                addr: addr.as_ptr() as usize,
            });
        }
        Expectation::MappedAtDestination => {
            let expected = prepared.dest.map_or(0, |d| d.as_ptr() as usize);
            let actual = addr.as_ptr() as usize;
            if actual != expected {
                return Err(Mismatch::WrongAddress { expected, actual });
            }
        }
        Expectation::Mapped => {}
    }

    match scenario.setup {
        Setup::GrowWithMove => expect_tag(addr, SOURCE_TAG),
        // Only reachable if the kernel accepted the unaligned source, which
        // the expectation above already rejects.
        Setup::Unaligned => Ok(()),
        // The destination's own tag must have been replaced by the source's.
        Setup::FixedDestination => expect_tag(addr, SOURCE_TAG),
        Setup::DetachInPlace => {
            expect_tag(addr, SOURCE_TAG)?;
            expect_still_mapped(prepared.source, scenario.old_size)
        }
        Setup::DetachWithHint => {
            if prepared.dest != Some(addr) {
                debug!("hint {:?} ignored, mapping placed at {addr:p}", prepared.dest);
            }
            expect_tag(addr, SOURCE_TAG)
        }
    }
}

fn expect_tag(addr: NonNull<u8>, expected: u8) -> Result<(), Mismatch> {
    // Safety: addr is the start of a live mapping of at least one page.
    let actual = unsafe { read_tag(addr) };
    if actual == expected {
        Ok(())
    } else {
        Err(Mismatch::TagMismatch {
            addr: addr.as_ptr() as usize,
            expected,
            actual,
        })
    }
}

/// DONTUNMAP leaves the old range mapped. Its pages moved with the mapping,
/// so it reads zero-filled; only its presence is checked.
fn expect_still_mapped(source: NonNull<u8>, size: usize) -> Result<(), Mismatch> {
    let addr = source.as_ptr() as usize;
    // Safety: source is page-aligned (it came from mmap).
    match unsafe { PlatformVmOps::is_mapped(source, size) } {
        Ok(true) => {
            // Safety: mincore just confirmed the range is mapped.
            let byte = unsafe { read_tag(source) };
            debug!("old range at {addr:#x} still mapped, first byte {byte:#04x}");
            Ok(())
        }
        Ok(false) => Err(Mismatch::SourceUnmapped { addr }),
        Err(e) => Err(Mismatch::Environment(e.to_string())),
    }
}
