//! recalc-runner: headless driver for the enrollment billing engine.
//!
//! Usage:
//!   recalc-runner --db billing.db --seed-file data/seed/demo.json --sweep 25/26
//!   recalc-runner --db billing.db --recalc amira,example,com --year 25/26
//!   recalc-runner --db billing.db --funding lena,example,com --year 25/26
//!   recalc-runner --db billing.db --upgrade 25/26 --students "a,example,com;b,example,com"
//!   recalc-runner --db billing.db --ipc-mode

mod seed;

use anyhow::Result;
use enrollment_billing_core::{
    command::RecalcCommand,
    config::BillingConfig,
    engine::{RecalcEngine, RecalcKey, SweepReport},
    processor::{NoProcessor, PaymentProcessor, RecordedProcessor},
    store::BillingStore,
    types::SchoolYear,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let offline = args.iter().any(|a| a == "--offline");
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");
    let workers = parse_arg(&args, "--workers", 0usize);

    if !ipc_mode {
        println!("Enrollment billing — recalc-runner");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    let mut config = BillingConfig::load(data_dir)?;
    if workers > 0 {
        config.recalc.sweep_workers = workers;
    }

    // An in-memory store is one connection; sweeps over it run sequentially.
    let store = if db == ":memory:" {
        BillingStore::in_memory()?
    } else {
        BillingStore::open(db)?
    };

    let processor: Arc<dyn PaymentProcessor> = match flag_value(&args, "--processor") {
        Some(path) => {
            let recorded = RecordedProcessor::load(path)?;
            recorded.set_offline(offline);
            Arc::new(recorded)
        }
        None => Arc::new(NoProcessor),
    };

    let engine = RecalcEngine::build(config, store, processor)?;

    if let Some(path) = flag_value(&args, "--seed-file") {
        seed::load(engine.store(), engine.config(), path)?;
    }

    if ipc_mode {
        return run_ipc_loop(&engine);
    }

    let year = flag_value(&args, "--year").unwrap_or("25/26");

    if let Some(student) = flag_value(&args, "--recalc") {
        let key = RecalcKey::parse(student, year, flag_value(&args, "--type"))?;
        let outcome = engine.recalculate(&key)?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }

    if let Some(student) = flag_value(&args, "--funding") {
        let entry = engine.recalculate_funding(student, SchoolYear::parse(year)?)?;
        println!("{}", serde_json::to_string_pretty(&entry)?);
    }

    if let Some(raw) = flag_value(&args, "--upgrade") {
        let students: Vec<String> = flag_value(&args, "--students")
            .map(|s| {
                s.split(';')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let outcomes = engine.upgrade_allocations(SchoolYear::parse(raw)?, &students)?;
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }

    if let Some(raw) = flag_value(&args, "--sweep") {
        let report = engine.sweep(SchoolYear::parse(raw)?)?;
        print_summary(&engine, &report)?;
    }

    Ok(())
}

fn run_ipc_loop(engine: &RecalcEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: RecalcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };

        // Engine errors are replies, not exits: the next line may be fine.
        match cmd.execute(engine) {
            Ok(None) => break,
            Ok(Some(reply)) => writeln!(stdout, "{}", reply)?,
            Err(e) => {
                log::warn!("ipc: command failed: {e}");
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
            }
        }
        stdout.flush()?;
    }
    Ok(())
}

fn print_summary(engine: &RecalcEngine, report: &SweepReport) -> Result<()> {
    println!("=== SWEEP SUMMARY ===");
    println!("  school year:    {}", report.school_year);
    println!("  students:       {}", report.students);
    println!("  succeeded:      {}", report.succeeded);
    println!("  projections:    {}", report.projections_written);
    println!("  funding:        {}", report.funding_written);
    println!("  failures:       {}", report.failures.len());
    for f in &report.failures {
        println!("    {} | {}", f.student_key, f.error);
    }

    println!();
    println!("=== FUNDING (current / remaining) ===");
    let entries = engine.store().funding_entries_for_year(report.school_year)?;
    if entries.is_empty() {
        println!("  (No registered students)");
    } else {
        for e in &entries {
            println!(
                "  {} | {} | ${} / ${}{}",
                e.student_key,
                e.eligibility.age_category.as_str(),
                e.allocation.current_allocation,
                e.allocation.remaining_allocation,
                e.allocation
                    .error
                    .as_deref()
                    .map(|err| format!(" | {err}"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
