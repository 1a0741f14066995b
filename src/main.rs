mod cfg;
mod classfile;
mod config;
mod descriptor;
mod detector;
mod engine;
mod error;
mod findings;
mod ir;
mod opcodes;
mod rules;
mod sarif;
mod scan;
mod stack;
mod stream;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{ConfigFile, RulePolicy, load_config};
use crate::engine::{AnalysisContext, Engine, RunOptions};
use crate::findings::{CollectingSink, Priority};
use crate::rules::default_registry;
use crate::sarif::{build_invocation, build_results, build_rules, build_sarif};
use crate::scan::scan_inputs;

const LOG_ENV: &str = "STACKWISE_LOG";
const DEFAULT_LOG_FILTER: &str = "stackwise=warn";

/// CLI arguments for stackwise execution.
#[derive(Parser, Debug)]
#[command(
    name = "stackwise",
    about = "Bytecode pattern detection with SARIF output for JVM class files and JAR files.",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// JSON rule configuration (enable/disable patterns, override priorities).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Worker threads; defaults to the number of CPUs.
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,
    /// Stop starting new classes once this many milliseconds have elapsed.
    #[arg(long, value_name = "MS")]
    deadline_ms: Option<u64>,
    /// Drop findings below this priority.
    #[arg(long, value_enum, value_name = "PRIORITY")]
    min_priority: Option<Priority>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    run(cli)
}

/// Logs go to stderr so SARIF on stdout stays clean.
fn init_tracing(quiet: bool) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = if quiet {
            EnvFilter::new("error")
        } else {
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
        };

        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(io::stderr).with_target(true))
            .with(filter)
            .init();
    });
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    for entry in &cli.classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }

    let started_at = Instant::now();
    let registry = default_registry();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ConfigFile::default(),
    };
    let policy = RulePolicy::from_config(&config, &registry)?;
    let min_priority = cli
        .min_priority
        .or(policy.min_priority())
        .unwrap_or(Priority::Low);

    let scan = scan_inputs(&cli.input, &cli.classpath)?;
    info!(
        classes = scan.classes.len(),
        classpath_classes = scan.classpath_classes.len(),
        "inputs scanned"
    );
    let context = AnalysisContext::new(scan.classes.iter().chain(&scan.classpath_classes));
    debug!(
        known_types = context.len(),
        detectors = registry.len(),
        "analysis context ready"
    );
    let options = RunOptions {
        jobs: cli.jobs,
        deadline: cli
            .deadline_ms
            .map(|millis| started_at + Duration::from_millis(millis)),
    };
    let sink = CollectingSink::new(min_priority);
    let stats = Engine::new(&registry, &context, &policy).run(&scan.classes, &sink, options)?;
    if stats.cancelled_classes > 0 {
        warn!(
            cancelled = stats.cancelled_classes,
            "deadline reached before every class was analysed"
        );
    }
    let findings = sink.into_findings();

    let invocation = build_invocation();
    let rules = build_rules(registry.patterns());
    let results = build_results(&findings, &scan.artifacts);
    let sarif = build_sarif(scan.artifacts, invocation, rules, results);

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} methods={} skipped_methods={} findings={}",
            started_at.elapsed().as_millis(),
            stats.classes,
            stats.methods,
            stats.skipped_methods,
            findings.len()
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
