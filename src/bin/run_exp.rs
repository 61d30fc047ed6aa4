use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use verijoin::{
    config::SimulationConfig,
    datagen::generate_relation,
    session::{RunOutcome, Session},
    stats::{write_statistics, RunRecord},
    utils::init_tracing_subscriber,
    CONFIG_PATH,
};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let path = args.get(1).map(String::as_str).unwrap_or(CONFIG_PATH);

    let config = if Path::new(path).exists() {
        SimulationConfig::load(path)?
    } else {
        eprintln!("config {} not found, using defaults", path);
        SimulationConfig::default()
    };
    init_tracing_subscriber(&config.log_directives)?;

    let left = generate_relation(&config.data.l, &config.data.join_values);
    let right = generate_relation(&config.data.r, &config.data.join_values);
    let expected = left.local_join(&right).len();
    info!(left = left.get_size(), right = right.get_size(), expected, "data generated");

    let runs = config.number_of_runs;
    let mut session = Session::new(config, left, right).context("cannot start session")?;
    let mut verified = 0;
    let mut records = Vec::with_capacity(runs);
    for _ in 0..runs {
        let report = session.run_query()?;
        records.push(RunRecord::from(&report));
        let s = &report.stats;
        match &report.outcome {
            RunOutcome::Verified(rows) => {
                verified += 1;
                println!(
                    "run {}: verified {} rows (expected {}), control tuples {} ({} bytes), check {} ms, total {} ms",
                    report.run,
                    rows.len(),
                    expected,
                    s.control_tuples,
                    s.control_tuples_size,
                    s.check_integrity_ms,
                    report.elapsed_ms
                );
            }
            RunOutcome::Violation(v) => println!(
                "run {}: integrity violation, missing markers {}, unexpected markers {}, outstanding twins {}, occurrence mismatches {}, {} ms",
                report.run,
                v.missing_markers.len(),
                v.unexpected_markers.len(),
                v.outstanding_twins.len(),
                v.occurrence_mismatches.len(),
                report.elapsed_ms
            ),
            RunOutcome::Tampering(reason) => {
                println!("run {}: tampering detected ({})", report.run, reason)
            }
        }
    }
    println!("{}/{} runs verified", verified, runs);

    let config = session.config();
    if let Some(path) = &config.statistics_path {
        write_statistics(path, &records, config.overwrite_statistics)?;
    }
    Ok(())
}
