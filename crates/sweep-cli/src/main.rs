use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use sweep_runner::{RunOptions, SchedulerOptions, UnitRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Parameter-sweep batch runner")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered simulation units.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run every task of a sweep.
    Run {
        unit: String,
        definition: PathBuf,
        #[arg(long)]
        strategy: Option<String>,
        /// Output name; may include a directory and an extension.
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        parallel: bool,
        /// Worker count for --parallel; 0 picks half the available cores.
        #[arg(long, default_value_t = 0)]
        workers: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show the tasks a sweep expands to without running them.
    Describe {
        definition: PathBuf,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List entries of an existing output file.
    Entries {
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let (name, json_mode) = command_info(&cli.command);
    let outcome = run_command(cli.command).and_then(|payload| match payload {
        Some(payload) => emit_json(&payload),
        None => Ok(()),
    });
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if json_mode => {
            if let Err(emit_err) = emit_json(&failure(name, &err)) {
                eprintln!("error: {:#} (and failed to emit JSON: {})", err, emit_err);
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    let registry = UnitRegistry::builtin();
    match command {
        Commands::List { json } => {
            let units: Vec<Value> = registry
                .iter()
                .map(|unit| json!({"name": unit.name(), "description": unit.description()}))
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "units": units
                })));
            }
            for unit in registry.iter() {
                println!("{:<12} {}", unit.name(), unit.description());
            }
        }
        Commands::Run {
            unit,
            definition,
            strategy,
            output,
            parallel,
            workers,
            json,
        } => {
            let options = RunOptions {
                strategy,
                output,
                scheduler: if parallel {
                    SchedulerOptions::parallel(workers)
                } else {
                    SchedulerOptions::default()
                },
            };
            let result = sweep_runner::run_sweep(&registry, &unit, &definition, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": serde_json::to_value(&result)?
                })));
            }
            print_run(&result);
        }
        Commands::Describe {
            definition,
            strategy,
            output,
            json,
        } => {
            let summary = sweep_runner::describe_sweep(
                &definition,
                strategy.as_deref(),
                output.as_deref(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": serde_json::to_value(&summary)?
                })));
            }
            print_summary(&summary);
        }
        Commands::Entries { store, json } => {
            let entries = sweep_runner::list_entries(&store)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "entries",
                    "store": store.display().to_string(),
                    "entries": entries
                })));
            }
            for entry in entries {
                println!("{}", entry);
            }
        }
    }
    Ok(None)
}

fn emit_json(payload: &Value) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, payload)?;
    writeln!(out)?;
    Ok(())
}

/// JSON body for a failed command; `causes` lists the error chain below the
/// top-level message.
fn failure(command: &str, err: &anyhow::Error) -> Value {
    json!({
        "ok": false,
        "command": command,
        "error": err.to_string(),
        "causes": err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>(),
    })
}

fn command_info(command: &Commands) -> (&'static str, bool) {
    match command {
        Commands::List { json } => ("list", *json),
        Commands::Run { json, .. } => ("run", *json),
        Commands::Describe { json, .. } => ("describe", *json),
        Commands::Entries { json, .. } => ("entries", *json),
    }
}

fn print_run(result: &sweep_runner::RunResult) {
    let report = &result.report;
    println!("unit: {}", result.unit);
    println!("strategy: {}", result.strategy);
    println!("backend: {}", result.backend);
    if let Some(path) = &result.output {
        println!("output: {}", path.display());
    }
    println!("tasks: {}", report.total);
    println!("completed: {}", report.completed);
    println!("failed: {}", report.failed);
    if report.unresolved > 0 {
        println!("unresolved: {}", report.unresolved);
    }
    if report.store_failures > 0 {
        println!("store_failures: {}", report.store_failures);
    }
    println!("reschedules: {}", report.reschedules);
    println!("metadata_written: {}", report.finalized);
}

fn print_summary(summary: &sweep_runner::SweepSummary) {
    println!("strategies: {}", summary.strategies.join(", "));
    println!("strategy: {} ({})", summary.strategy, summary.variant);
    println!("tasks: {}", summary.tasks.len());
    for task in &summary.tasks {
        match &task.base {
            Some(base) => println!("  {}  <- {}", task.id, base),
            None => println!("  {}", task.id),
        }
    }
    if let Some(output) = &summary.output {
        println!("output: {}", output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_payload_names_command_and_causes() {
        let err = anyhow::anyhow!("file missing").context("cannot read definition");
        let payload = failure("describe", &err);
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["command"], json!("describe"));
        assert_eq!(payload["error"], json!("cannot read definition"));
        assert_eq!(payload["causes"], json!(["file missing"]));
    }

    #[test]
    fn json_flag_is_read_per_command() {
        let cli = Cli::try_parse_from(["sweep", "entries", "out.json", "--json"]).expect("parse");
        assert_eq!(command_info(&cli.command), ("entries", true));
        let cli = Cli::try_parse_from(["sweep", "-vv", "run", "minimal", "d.yaml", "--parallel"])
            .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert_eq!(command_info(&cli.command), ("run", false));
    }
}
