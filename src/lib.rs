#[cfg(not(target_os = "linux"))]
compile_error!("remap-check drives Linux mremap(2) and builds only on Linux.");

pub mod config;
pub mod memory;
pub mod remap;

// configuration
pub use config::{ConfigError, SuiteConfig};

// memory primitives and bookkeeping
pub use memory::ledger::{Ledger, Region};
pub use memory::vm::{PlatformVmOps, RemapFlags, VmError, VmOps};

// scenario matrix and runner
pub use remap::executor::{Mismatch, Verdict, run_scenario};
pub use remap::report::{Report, ScenarioResult, Suite};
pub use remap::setup::{Prepared, Setup};
pub use remap::table::{DEST_TAG, Expectation, SCENARIOS, SOURCE_TAG, Scenario, ScenarioSpec};
