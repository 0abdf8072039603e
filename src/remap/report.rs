use log::info;

use crate::config::SuiteConfig;
use crate::memory::vm::VmError;

use super::executor::{Mismatch, Verdict, run_scenario};
use super::table::{SCENARIOS, ScenarioSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioResult {
    /// 1-based position in the table.
    pub number: usize,
    pub label: &'static str,
    pub verdict: Verdict,
}

impl ScenarioResult {
    /// The diagnostic line printed for a failed scenario.
    pub fn failure_line(&self) -> Option<String> {
        match &self.verdict {
            Verdict::Passed => None,
            Verdict::Failed(m) => Some(format!(
                "mremap test {} {} failed: {m}",
                self.number, self.label
            )),
        }
    }
}

/// Verdicts of one pass over the table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Report {
    pub results: Vec<ScenarioResult>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.verdict.is_pass())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ScenarioResult, &Mismatch)> {
        self.results.iter().filter_map(|r| match &r.verdict {
            Verdict::Passed => None,
            Verdict::Failed(m) => Some((r, m)),
        })
    }

    /// Just the pass/fail pattern, for comparing runs.
    pub fn outcomes(&self) -> Vec<bool> {
        self.results.iter().map(|r| r.verdict.is_pass()).collect()
    }
}

/// Runs a scenario table against the live kernel.
pub struct Suite<'a> {
    scenarios: &'a [ScenarioSpec],
    page_size: usize,
}

impl Suite<'static> {
    /// The full five-scenario table.
    pub fn new(config: &SuiteConfig) -> Self {
        Self::with_scenarios(&SCENARIOS, config.page_size)
    }
}

impl<'a> Suite<'a> {
    pub fn with_scenarios(scenarios: &'a [ScenarioSpec], page_size: usize) -> Self {
        Self {
            scenarios,
            page_size,
        }
    }

    /// Run every scenario, printing a line on stdout for each failure.
    ///
    /// A failing scenario never stops the run. `Err` is returned when an
    /// anonymous mapping is refused or cleanup fails; the remaining
    /// scenarios are not run.
    pub fn run(&self) -> Result<Report, VmError> {
        let mut report = Report {
            results: Vec::with_capacity(self.scenarios.len()),
        };

        for (i, spec) in self.scenarios.iter().enumerate() {
            let result = ScenarioResult {
                number: i + 1,
                label: spec.label,
                verdict: run_scenario(spec, self.page_size)?,
            };
            if let Some(line) = result.failure_line() {
                println!("{line}");
            }
            report.results.push(result);
        }

        info!(
            "{} of {} scenarios passed",
            report.results.iter().filter(|r| r.verdict.is_pass()).count(),
            report.results.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::table::Expectation;

    fn result(number: usize, verdict: Verdict) -> ScenarioResult {
        ScenarioResult {
            number,
            label: "label",
            verdict,
        }
    }

    #[test]
    fn test_report_passed_requires_all() {
        let mut report = Report::default();
        assert!(report.passed());
        report.results.push(result(1, Verdict::Passed));
        assert!(report.passed());
        report.results.push(result(
            2,
            Verdict::Failed(Mismatch::UnexpectedFailure { errno: libc::ENOMEM }),
        ));
        assert!(!report.passed());
        assert_eq!(report.outcomes(), vec![true, false]);
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_failure_line_names_scenario() {
        let r = result(
            3,
            Verdict::Failed(Mismatch::WrongAddress {
                expected: 0x1000,
                actual: 0x2000,
            }),
        );
        let line = r.failure_line().unwrap();
        assert!(line.starts_with("mremap test 3 label failed"), "{line}");
        assert!(line.contains("0x1000"));
        assert!(result(1, Verdict::Passed).failure_line().is_none());
    }

    #[test]
    fn test_full_suite_passes() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let suite = Suite::new(&SuiteConfig::default());
        let report = suite.run().expect("fatal harness error");
        assert_eq!(report.results.len(), SCENARIOS.len());
        if let Some((r, m)) = report.failures().next() {
            panic!("scenario {} failed: {m}", r.number);
        }
        assert!(report.passed());
    }

    #[test]
    fn test_failures_do_not_short_circuit() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let mut table = SCENARIOS;
        // Make the first scenario fail: it succeeds but we now expect EINVAL.
        table[0].expect = Expectation::Failed { errno: libc::EINVAL };

        let report = Suite::with_scenarios(&table, SuiteConfig::default().page_size)
            .run()
            .expect("fatal harness error");

        assert_eq!(report.results.len(), SCENARIOS.len());
        assert_eq!(report.outcomes(), vec![false, true, true, true, true]);
        assert!(!report.passed());
    }

    #[test]
    fn test_refused_mapping_aborts_run() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let mut table = SCENARIOS;
        table[2].dest_pages = Some(1 << 40);

        let err = Suite::with_scenarios(&table, SuiteConfig::default().page_size)
            .run()
            .expect_err("run continued past a refused mapping");

        assert!(matches!(err, VmError::MapFailed(_)), "{err}");
    }
}
