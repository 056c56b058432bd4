//! layerharvest - Runtime Extraction Pipeline CLI
//!
//! Fetches container layer blobs and streams them through the secret
//! scanner, writing rotating JSONL results.
//!
//! ## Usage
//!
//! ```sh
//! layerharvest runtime <input_jsonl> <max_storage_gb> [--fetchers N] [--out DIR]
//! ```
//!
//! The input file carries one layer descriptor per line
//! (`{"repo": ..., "layer_digest": ..., "size": ...}`). Scanner count
//! defaults to the host CPU count; fetcher count defaults to 30. Ctrl-C
//! cancels the root context and the pipeline drains before exiting 0.

use layerharvest::constants::{DEFAULT_FETCH_WORKERS, DEFAULT_RESULT_DIR};
use layerharvest::{Pipeline, PipelineConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Runtime {
        input: PathBuf,
        max_storage_gb: u64,
        fetchers: usize,
        out: PathBuf,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "runtime" => {
            if args.len() < 4 {
                return Err("runtime requires <input_jsonl> <max_storage_gb>".to_string());
            }
            let input = PathBuf::from(&args[2]);
            let max_storage_gb: u64 = args[3]
                .parse()
                .map_err(|_| "max_storage_gb must be a valid integer".to_string())?;

            let mut fetchers = DEFAULT_FETCH_WORKERS;
            let mut out = PathBuf::from(DEFAULT_RESULT_DIR);
            let mut i = 4;
            while i < args.len() {
                match args[i].as_str() {
                    "--fetchers" | "-f" => {
                        if i + 1 < args.len() {
                            fetchers = args[i + 1]
                                .parse()
                                .map_err(|_| "--fetchers requires an integer".to_string())?;
                            i += 2;
                        } else {
                            return Err("--fetchers requires a value".to_string());
                        }
                    }
                    "--out" | "-o" => {
                        if i + 1 < args.len() {
                            out = PathBuf::from(&args[i + 1]);
                            i += 2;
                        } else {
                            return Err("--out requires a path".to_string());
                        }
                    }
                    _ => i += 1,
                }
            }
            Ok(Command::Runtime {
                input,
                max_storage_gb,
                fetchers,
                out,
            })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_runtime(input: PathBuf, max_storage_gb: u64, fetchers: usize, out: PathBuf) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("tokio runtime: {}", e))?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();

        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, draining pipeline");
                interrupt.cancel();
            }
        });

        let scan_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let pipeline = Pipeline::new(
            PipelineConfig {
                input_path: input,
                result_dir: out,
                max_storage: max_storage_gb * 1_000_000_000,
                scan_workers,
                fetch_workers: fetchers,
            },
            cancel,
        );
        pipeline.run().await.map_err(|e| e.to_string())
    })
}

fn cmd_version() {
    println!("layerharvest version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"layerharvest - streaming secret extraction from registry layers

USAGE:
    layerharvest <command> [options]

COMMANDS:
    runtime <input_jsonl> <max_storage_gb>   Run the extraction pipeline
    version                                  Show version info
    help                                     Show this help

OPTIONS:
    --fetchers, -f <n>    Download worker count (default: 30)
    --out, -o <dir>       Output directory (default: runtime/results)

ENVIRONMENT:
    RUST_LOG              Log filter (default: info)

EXAMPLES:
    layerharvest runtime layers.jsonl 50
    layerharvest runtime layers.jsonl 100 --fetchers 60 --out results/
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Runtime {
                    input,
                    max_storage_gb,
                    fetchers,
                    out,
                } => cmd_runtime(input, max_storage_gb, fetchers, out),
                Command::Version => {
                    cmd_version();
                    Ok(())
                }
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
