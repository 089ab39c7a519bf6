//! Skein CLI: compile, inspect and run Skein programs.

mod colors;

use clap::{Parser, Subcommand};
use colors::{bold, gray, green, red, status_label, thread_status, yellow};
use skein_core::Value;
use skein_runtime::{read_trace, verify_chain, TraceRecordKind};
use skein_vm::{ExecutorKind, NoForeign, RuntimeConfig, Session, SessionError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein", version, about = "Compile and run Skein programs")]
struct Cli {
    /// Log executor activity to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a file and report errors
    Check {
        #[arg()]
        file: PathBuf,
    },
    /// Print the compiled bytecode
    Emit {
        #[arg()]
        file: PathBuf,
        /// Emit the program as JSON instead of a listing
        #[arg(long)]
        json: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a function of a file as the entry thread
    Run {
        #[arg()]
        file: PathBuf,
        /// Entry function (defaults to `[run] entry`, then `main`)
        #[arg(long)]
        entry: Option<String>,
        #[arg(long)]
        executor: Option<ExecutorKind>,
        /// Export the merged trace as JSONL into this directory
        #[arg(long)]
        trace_dir: Option<PathBuf>,
        /// 0 waits forever
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Config file to use instead of searching for skein.toml
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the final status of every thread in the session
        #[arg(long)]
        threads: bool,
        /// Entry arguments: ints, floats, true/false, null, else strings
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Show an exported trace file
    Trace {
        #[arg()]
        file: PathBuf,
        /// Check the hash chain
        #[arg(long)]
        verify: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Check { file } => cmd_check(&file),
        Commands::Emit { file, json, output } => cmd_emit(&file, json, output.as_deref()),
        Commands::Run { file, entry, executor, trace_dir, timeout_ms, config, threads, args } => {
            let overrides = RunOverrides { entry, executor, trace_dir, timeout_ms };
            cmd_run(&file, config.as_deref(), overrides, threads, &args)
        }
        Commands::Trace { file, verify } => cmd_trace(&file, verify),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{} {}", red("error:"), message);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "skein=debug,skein_vm=debug,skein_runtime=debug" } else { "skein=warn" };
    let filter = EnvFilter::try_from_env("SKEIN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn read_source(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read file '{}': {}", bold(&path.display().to_string()), e))
}

/// Compile or print diagnostics. The error string is empty because the
/// diagnostics were already written.
fn compile(path: &Path) -> Result<skein_compiler::Program, String> {
    let source = read_source(path)?;
    let filename = path.display().to_string();
    skein_compiler::compile(&source).map_err(|e| {
        eprint!("{}", skein_compiler::format_error(&e, &source, &filename));
        String::new()
    })
}

fn cmd_check(file: &Path) -> Result<(), String> {
    let program = compile(file)?;
    println!(
        "{} {} {}",
        green("✓"),
        bold(&file.display().to_string()),
        gray(&format!("{} functions, no errors found", program.functions.len()))
    );
    Ok(())
}

fn cmd_emit(file: &Path, json: bool, output: Option<&Path>) -> Result<(), String> {
    let program = compile(file)?;
    let text = if json {
        skein_compiler::compiler::emit::emit_json(&program).map_err(|e| e.to_string())?
    } else {
        program.listing()
    };
    match output {
        Some(path) => {
            std::fs::write(path, text).map_err(|e| format!("cannot write '{}': {}", path.display(), e))?;
            println!("{} {}", status_label("Emitted"), path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

struct RunOverrides {
    entry: Option<String>,
    executor: Option<ExecutorKind>,
    trace_dir: Option<PathBuf>,
    timeout_ms: Option<u64>,
}

impl RunOverrides {
    fn apply(self, config: &mut RuntimeConfig) {
        if let Some(entry) = self.entry {
            config.run.entry = entry;
        }
        if let Some(kind) = self.executor {
            config.executor.kind = kind;
        }
        if let Some(dir) = self.trace_dir {
            config.trace.enabled = true;
            config.trace.dir = Some(dir);
        }
        if let Some(ms) = self.timeout_ms {
            config.run.timeout_ms = ms;
        }
    }
}

fn cmd_run(
    file: &Path,
    config_path: Option<&Path>,
    overrides: RunOverrides,
    show_threads: bool,
    args: &[String],
) -> Result<(), String> {
    let mut config = match config_path {
        Some(path) => RuntimeConfig::load_from(path),
        None => RuntimeConfig::load(),
    }
    .map_err(|e| e.to_string())?;
    overrides.apply(&mut config);
    tracing::debug!(executor = ?config.executor.kind, entry = %config.run.entry, "resolved run config");

    println!("{} {}", status_label("Compiling"), file.display());
    let program = compile(file)?;
    let entry = config.run.entry.clone();
    let args: Vec<Value> = args.iter().map(|a| parse_literal(a)).collect();

    let session = Session::new(program, config, Arc::new(NoForeign)).map_err(|e| e.to_string())?;
    println!("{} {} {}", status_label("Running"), entry, gray(&format!("(session {})", session.id())));
    let report = match session.run(&entry, args) {
        Ok(report) => report,
        Err(SessionError::Timeout { thread, timeout_ms }) => {
            return Err(format!("{} did not settle within {}ms", thread, timeout_ms));
        }
        Err(e) => return Err(e.to_string()),
    };

    for line in &report.output {
        println!("{}", line);
    }
    if let Some(path) = &report.trace_file {
        println!("{} {}", gray("trace:"), path.display());
    }
    if show_threads {
        for thread in session.ledger().threads() {
            let status = session.status(thread).map_err(|e| e.to_string())?;
            println!("{:>12} {}", thread.to_string(), thread_status(status));
        }
    }
    match report.failure() {
        None => {
            if let Some(value) = report.value() {
                println!("{}", value);
            }
            Ok(())
        }
        Some(failure) => Err(format!("{} {}", red("runtime error:"), failure)),
    }
}

fn cmd_trace(file: &Path, verify: bool) -> Result<(), String> {
    let records = read_trace(file).map_err(|e| format!("cannot read trace '{}': {}", file.display(), e))?;
    for record in &records {
        match record.kind {
            TraceRecordKind::SessionStart => println!(
                "{} session {} program {}",
                status_label("Start"),
                record.session_id,
                record.program_hash.as_deref().unwrap_or("?")
            ),
            TraceRecordKind::Step => {
                if let Some(ev) = &record.event {
                    println!(
                        "{} {:<10} {:>4} {}{}@{} {}",
                        gray(&ev.timestamp.format("%H:%M:%S%.6f").to_string()),
                        ev.thread.to_string(),
                        ev.seq,
                        "  ".repeat(ev.depth.saturating_sub(1)),
                        ev.function,
                        ev.ip,
                        bold(&ev.opcode)
                    );
                }
            }
            TraceRecordKind::SessionEnd => {
                println!("{} {}", status_label("End"), record.message.as_deref().unwrap_or(""))
            }
        }
    }
    if verify {
        verify_chain(&records).map_err(|e| format!("{} {}", yellow("trace verification failed:"), e))?;
        println!("{} {} records, hash chain intact", green("✓"), records.len());
    }
    Ok(())
}

/// Parse a command-line argument as a Skein literal.
fn parse_literal(arg: &str) -> Value {
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(n) = arg.parse::<i64>() {
                Value::Int(n)
            } else if let Ok(x) = arg.parse::<f64>() {
                Value::Float(x)
            } else {
                Value::Str(arg.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn literals() {
        assert_eq!(parse_literal("42"), Value::Int(42));
        assert_eq!(parse_literal("-3"), Value::Int(-3));
        assert_eq!(parse_literal("0.7"), Value::Float(0.7));
        assert_eq!(parse_literal("true"), Value::Bool(true));
        assert_eq!(parse_literal("null"), Value::Null);
        assert_eq!(parse_literal("hello"), Value::Str("hello".into()));
    }

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::parse_from([
            "skein", "run", "prog.skein", "--entry", "f", "--executor", "distributed", "--timeout-ms", "0", "0.7",
        ]);
        let Commands::Run { entry, executor, trace_dir, timeout_ms, args, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args, vec!["0.7".to_string()]);
        let mut config = RuntimeConfig::default();
        RunOverrides { entry, executor, trace_dir, timeout_ms }.apply(&mut config);
        assert_eq!(config.run.entry, "f");
        assert_eq!(config.executor.kind, ExecutorKind::Distributed);
        assert_eq!(config.timeout(), None);
    }
}
