//! omop-partition CLI - split an OMOP CDM database into partitions.

use clap::{Parser, Subcommand};
use omop_partition::{
    Config, DistributionPolicy, PartitionError, Partitioner, RunResult, TableRef,
    ValidationReport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "omop-partition")]
#[command(about = "Split an OMOP CDM PostgreSQL database into schema-identical partitions")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distribute the source into the partitions
    Run {
        /// Override the distribution policy (uniform, hash, round_robin)
        #[arg(long)]
        policy: Option<DistributionPolicy>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Stop starting new jobs after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Skip validation after the transfer
        #[arg(long)]
        no_validate: bool,
    },

    /// Show split rules and transfer jobs without moving data
    Plan {
        /// Override the distribution policy (uniform, hash, round_robin)
        #[arg(long)]
        policy: Option<DistributionPolicy>,
    },

    /// Validate row counts of the partitions against the source
    Validate {
        /// Policy the partitions were distributed with
        #[arg(long)]
        policy: Option<DistributionPolicy>,
    },

    /// Show table metadata and split rules
    Analyze,

    /// Render the foreign-key graph in Graphviz DOT format
    Graph {
        /// Only draw this table and the tables that reference it
        #[arg(long)]
        anchor: Option<String>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, PartitionError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            policy,
            workers,
            timeout,
            no_validate,
        } => {
            if let Some(policy) = policy {
                config.distribution.policy = policy;
            }
            if let Some(w) = workers {
                config.distribution.workers = Some(w);
            }
            if let Some(secs) = timeout {
                config.distribution.run_timeout_secs = Some(secs);
            }
            if no_validate {
                config.distribution.validate_after_run = false;
            }
            config.validate()?;

            let cancel_token = setup_signal_handler()?;
            let partitioner = Partitioner::new(config).await?;
            let result = partitioner.run(cancel_token).await?;
            partitioner.close();

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_run_result(&result);
            }
            Ok(result.exit_code())
        }

        Commands::Plan { policy } => {
            let policy = policy.unwrap_or(config.distribution.policy);
            let partitioner = Partitioner::new(config).await?;
            let plan = partitioner.plan(policy).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!(
                    "Plan ({} policy, {} partitions, {} jobs):",
                    plan.policy,
                    plan.partitions,
                    plan.job_count()
                );
                for (i, wave) in plan.waves.iter().enumerate() {
                    println!("\n  Wave {}:", i + 1);
                    for table in wave.iter().filter_map(|t| plan.table(t)) {
                        println!(
                            "    {:<40} {:<50} {:>12} rows {:>4} jobs",
                            table.table.to_string(),
                            table.rule.to_string(),
                            table.metadata.row_count,
                            table.jobs.len()
                        );
                    }
                }
                for skipped in &plan.skipped {
                    println!("\n  Skipped {}: {}", skipped.table, skipped.reason);
                }
            }
            Ok(0)
        }

        Commands::Validate { policy } => {
            let policy = policy.unwrap_or(config.distribution.policy);
            let partitioner = Partitioner::new(config).await?;
            let report = partitioner.validate(policy).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.is_success() {
                Ok(0)
            } else {
                Ok(omop_partition::error::EXIT_VALIDATION_FAILED)
            }
        }

        Commands::Analyze => {
            let partitioner = Partitioner::new(config).await?;
            let analysis = partitioner.analyze().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                println!(
                    "Schema {} (subject table {}):",
                    analysis.schema, analysis.subject_table
                );
                for table in &analysis.tables {
                    println!(
                        "  {:<40} {:>12} rows  subject_col={:<5} reachable={:<5} hash_key={}  -> {}",
                        table.table.to_string(),
                        table.metadata.row_count,
                        table.metadata.has_subject_id_column,
                        table.metadata.is_reachable_from_subject_table,
                        table.metadata.hashable_key_column.as_deref().unwrap_or("-"),
                        table.rule
                    );
                    let counts: Vec<String> = table
                        .partition_rows
                        .iter()
                        .map(|rows| rows.map(|n| n.to_string()).unwrap_or_else(|| "?".into()))
                        .collect();
                    println!("  {:<40} partitions: {}", "", counts.join(" / "));
                }
                for skipped in &analysis.skipped {
                    println!("  Skipped {}: {}", skipped.table, skipped.reason);
                }
            }
            Ok(0)
        }

        Commands::Graph { anchor, output } => {
            let anchor = anchor
                .map(|a| TableRef::parse_with_default(&a, &config.source.schema))
                .transpose()?;
            let partitioner = Partitioner::new(config).await?;
            let dot = partitioner.graph_dot(anchor.as_ref()).await?;

            match output {
                Some(path) => {
                    std::fs::write(&path, dot)?;
                    info!("Wrote graph to {:?}", path);
                }
                None => print!("{}", dot),
            }
            Ok(0)
        }

        Commands::HealthCheck => {
            let partitioner = Partitioner::new(config).await?;
            let result = partitioner.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                let endpoints = std::iter::once(("Source".to_string(), &result.source)).chain(
                    result
                        .partitions
                        .iter()
                        .enumerate()
                        .map(|(i, p)| (format!("Partition {}", i), p)),
                );
                for (name, endpoint) in endpoints {
                    println!(
                        "  {} ({}): {} ({}ms)",
                        name,
                        endpoint.location,
                        if endpoint.connected { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(PartitionError::pool(
                    "one or more databases are unreachable",
                    "health check",
                ));
            }
            Ok(0)
        }
    }
}

fn print_run_result(result: &RunResult) {
    println!("\nDistribution {:?}", result.status);
    println!("  Run ID: {}", result.run_id);
    println!("  Policy: {}", result.policy);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Jobs: {}/{}", result.jobs_completed, result.jobs_total);
    println!("  Rows: {}", result.rows_transferred);
    for failed in &result.failed_jobs {
        println!(
            "  Failed: {} -> partition {}: {}",
            failed.table, failed.partition, failed.error
        );
    }
    if !result.not_started.is_empty() {
        println!("  Not started: {} jobs", result.not_started.len());
    }
    for skipped in &result.skipped_tables {
        println!("  Skipped {}: {}", skipped.table, skipped.reason);
    }
    if let Some(ref report) = result.validation {
        print_report(report);
    }
    if let Some(ref err) = result.validation_error {
        println!("\nValidation could not run: {}", err);
    }
}

fn print_report(report: &ValidationReport) {
    println!("\nValidation: {}", report.summary());
    for mismatch in report.mismatches() {
        match mismatch.error {
            Some(ref err) => println!(
                "  {} partition {}: {}",
                mismatch.table, mismatch.partition, err
            ),
            None => println!(
                "  {} partition {}: expected {}, found {}",
                mismatch.table, mismatch.partition, mismatch.expected, mismatch.actual
            ),
        }
    }
    for table in &report.global_mismatches {
        println!("  {}: partitions do not add up to the source", table);
    }
    for finding in &report.schema_findings {
        match finding.table {
            Some(ref table) => println!(
                "  partition {}: {:?} {}{}",
                finding.partition,
                finding.issue,
                table,
                finding
                    .detail
                    .as_ref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            ),
            None => println!("  partition {}: {:?}", finding.partition, finding.issue),
        }
    }
    for integrity in &report.integrity {
        let place = match integrity.partition {
            Some(p) => format!("partition {}", p),
            None => "any partition".to_string(),
        };
        match integrity.error {
            Some(ref err) => println!(
                "  {} in {}: row lookup failed: {}",
                integrity.table, place, err
            ),
            None => println!(
                "  {}: {} of {} sampled rows missing from {}",
                integrity.table, integrity.missing, integrity.sampled, place
            ),
        }
    }
    for null in &report.null_subjects {
        println!(
            "  warning: {} rows of {} in partition {} have no subject",
            null.rows, null.table, null.partition
        );
    }
    println!(
        "  Result: {}",
        if report.is_success() { "PASSED" } else { "FAILED" }
    );
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries reports, DOT output and JSON.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, PartitionError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. No new jobs will start; waiting for running jobs...",
            name
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, PartitionError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. No new jobs will start; waiting for running jobs...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
