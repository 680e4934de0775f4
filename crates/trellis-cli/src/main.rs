//! CLI entry point for running and validating Trellis pipelines.
//!
//! Exit codes: 0 success, 1 parse/validation error, 2 pipeline failure,
//! 3 invalid invocation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use trellis_engine::{
    apply_model_stylesheet, default_registry_with_interviewer, ConsoleInterviewer, Engine,
    EngineConfig, Graph, Severity,
};

const EXIT_VALIDATION: u8 = 1;
const EXIT_PIPELINE: u8 = 2;
const EXIT_USAGE: u8 = 3;

#[derive(Parser)]
#[command(
    name = "trellis",
    version,
    about = "Graph-driven pipeline runner for DOT-authored workflows"
)]
struct Cli {
    /// Path to the pipeline .dot file
    dotfile: PathBuf,

    /// Validate the pipeline and exit without executing
    #[arg(long)]
    validate_only: bool,

    /// Root directory for run logs and checkpoints
    #[arg(long, default_value = ".trellis/logs")]
    logs_root: PathBuf,

    /// Resume from the newest checkpoint under the logs root
    #[arg(long)]
    resume: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help/version are not usage errors.
            if e.use_stderr() {
                eprint!("{e}");
                return ExitCode::from(EXIT_USAGE);
            }
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    run(cli).await
}

async fn run(cli: Cli) -> ExitCode {
    if !cli.dotfile.exists() {
        eprintln!("error: file '{}' not found", cli.dotfile.display());
        return ExitCode::from(EXIT_USAGE);
    }

    let source = match std::fs::read_to_string(&cli.dotfile) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read '{}': {e}", cli.dotfile.display());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let mut graph = match trellis_dot::parse(&source).and_then(Graph::from_dot) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };
    if let Err(e) = apply_model_stylesheet(&mut graph) {
        eprintln!("error: {e}");
        return ExitCode::from(EXIT_VALIDATION);
    }

    println!("Pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }
    println!(
        "Nodes: {}  Edges: {}",
        graph.node_count(),
        graph.edges().len()
    );

    let diagnostics = trellis_engine::validate(&graph);
    let mut has_error = false;
    for diag in &diagnostics {
        let tag = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{tag}] {}: {}", diag.rule, diag.message);
    }
    if has_error {
        return ExitCode::from(EXIT_VALIDATION);
    }
    if cli.validate_only {
        println!("Pipeline is valid");
        return ExitCode::SUCCESS;
    }

    let registry = default_registry_with_interviewer(Arc::new(ConsoleInterviewer));
    let engine = Engine::new(registry);
    let config = EngineConfig::new(&cli.logs_root).resume(cli.resume);

    match engine.run(&graph, trellis_core::Context::new(), &config).await {
        Ok(result) => {
            println!("\nPipeline completed");
            println!("Visited: {}", result.visited.join(" -> "));
            println!("Run directory: {}", result.run_dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("\nPipeline failed: {e}");
            ExitCode::from(EXIT_PIPELINE)
        }
    }
}
