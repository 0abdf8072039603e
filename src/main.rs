use std::process::ExitCode;

use log::{error, info, warn};
use remap_check::{Suite, SuiteConfig};

fn main() -> ExitCode {
    env_logger::init();

    let config = match SuiteConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("remap-check: {e}");
            return ExitCode::from(2);
        }
    };
    info!(
        "page size {} bytes, {} round(s)",
        config.page_size, config.rounds
    );

    let suite = Suite::new(&config);
    let mut all_passed = true;
    let mut first_outcomes = None;

    for round in 1..=config.rounds {
        let report = match suite.run() {
            Ok(report) => report,
            Err(e) => {
                error!("round {round}: {e}");
                eprintln!("remap-check: aborting: {e}");
                return ExitCode::from(2);
            }
        };

        let outcomes = report.outcomes();
        let first = first_outcomes.get_or_insert_with(|| outcomes.clone());
        if *first != outcomes {
            warn!("round {round}: verdicts differ from round 1: {first:?} vs {outcomes:?}");
        }

        all_passed &= report.passed();
    }

    if all_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
