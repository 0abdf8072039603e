use thiserror::Error;

use crate::memory::vm::{PlatformVmOps, VmOps};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidRounds { var: &'static str, value: String },
}

/// Knobs for a suite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteConfig {
    /// Page size used to scale the scenario table. Default: the OS page size.
    pub page_size: usize,

    /// How many times to run the whole table in one process. Repeated runs
    /// must produce identical verdicts. Default: 1.
    pub rounds: usize,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            page_size: PlatformVmOps::page_size(),
            rounds: 1,
        }
    }
}

impl SuiteConfig {
    pub const ROUNDS_VAR: &'static str = "REMAP_CHECK_ROUNDS";

    /// Defaults, overridden by `REMAP_CHECK_ROUNDS` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_rounds(std::env::var(Self::ROUNDS_VAR).ok().as_deref())
    }

    fn with_rounds(mut self, value: Option<&str>) -> Result<Self, ConfigError> {
        let Some(value) = value else {
            return Ok(self);
        };
        match value.trim().parse::<usize>() {
            Ok(rounds) if rounds > 0 => {
                self.rounds = rounds;
                Ok(self)
            }
            _ => Err(ConfigError::InvalidRounds {
                var: Self::ROUNDS_VAR,
                value: value.to_string(),
            }),
        }
    }
}
