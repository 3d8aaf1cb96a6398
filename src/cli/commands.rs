use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::cli::args::{
    ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs, ServeArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};
use crate::gateway::WireEvent;
use crate::orchestrator::{Orchestrator, SubmitRequest};
use crate::sandbox::available_backends;
use crate::stream::{Completion, EventKind, TerminalStatus};

/// How long `run` waits for its sandbox to be torn down before exiting.
const RUN_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Execution Commands
// ============================================================================

/// Run one program to completion, streaming its output to this terminal.
/// Returns the exit code the CLI should exit with.
pub async fn run(args: RunArgs, mut config: RunletConfig, format: OutputFormat) -> Result<i32> {
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }

    let code = read_source(&args.file).await?;
    let language = match args.language {
        Some(language) => language,
        None => infer_language(&args.file).ok_or_else(|| {
            RunletError::Config(format!(
                "cannot infer language from '{}', pass --language",
                args.file.display()
            ))
        })?,
    };

    let mut request = SubmitRequest::new(language, code);
    request.timeout_seconds = args.timeout;
    request.memory_mb = args.memory;

    let orchestrator = Orchestrator::new(config).await?;
    let id = orchestrator.submit(request)?;
    info!(execution_id = %id, backend = orchestrator.backend_name(), "Submitted");

    // Replay from the start: the driver may already have published.
    let mut subscription = orchestrator.subscribe(&id, Some(0))?;
    let mut exit_code = 1;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                match format {
                    OutputFormat::Text => match &event.kind {
                        EventKind::Stdout(text) => {
                            print!("{}", text);
                            let _ = std::io::stdout().flush();
                        }
                        EventKind::Stderr(text) => {
                            eprint!("{}", text);
                        }
                        EventKind::Terminal(completion) => {
                            report_completion(completion);
                        }
                    },
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string(&WireEvent::from(event.as_ref()))?);
                    }
                }
                if let Some(completion) = event.completion() {
                    exit_code = cli_exit_code(completion);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(execution_id = %id, "Interrupted, cancelling");
                orchestrator.cancel(&id)?;
            }
        }
    }

    orchestrator.shutdown(RUN_TEARDOWN_GRACE).await;
    Ok(exit_code)
}

/// Start the HTTP/WebSocket server.
pub async fn serve(args: ServeArgs, mut config: RunletConfig) -> Result<()> {
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());

    let orchestrator = Arc::new(Orchestrator::new(config).await?);
    crate::server::serve(orchestrator, &bind).await
}

/// List isolation backends and their availability on this host.
pub async fn backends(format: OutputFormat) -> Result<()> {
    let backends = available_backends();

    match format {
        OutputFormat::Text => {
            println!("{:<12} {:<10} DESCRIPTION", "BACKEND", "STATUS");
            println!("{}", "-".repeat(70));
            for backend in &backends {
                let status = if backend.available {
                    "available"
                } else {
                    "missing"
                };
                match backend.unavailable_reason {
                    Some(reason) => println!(
                        "{:<12} {:<10} {} ({})",
                        backend.name, status, backend.description, reason
                    ),
                    None => println!(
                        "{:<12} {:<10} {}",
                        backend.name, status, backend.description
                    ),
                }
            }
        }
        OutputFormat::Json => {
            let json_backends: Vec<_> = backends
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "name": b.name,
                        "available": b.available,
                        "description": b.description,
                        "unavailable_reason": b.unavailable_reason,
                    })
                })
                .collect();

            println!("{}", serde_json::to_string_pretty(&json_backends)?);
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = RunletConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).map_err(|e| RunletError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Check which isolation backends work on this host");
    println!("  runlet backends");
    println!();
    println!("  # Run a script with a 5 second timeout");
    println!("  runlet run main.py --timeout 5");
    println!();
    println!("  # Serve the HTTP/WebSocket API");
    println!("  runlet serve --bind 127.0.0.1:3001");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: RunletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| RunletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        Ok(code)
    } else {
        Ok(tokio::fs::read_to_string(path).await?)
    }
}

fn infer_language(path: &Path) -> Option<String> {
    let language = match path.extension()?.to_str()? {
        "py" => "python",
        "js" | "mjs" | "cjs" => "nodejs",
        "sh" | "bash" => "shell",
        _ => return None,
    };
    Some(language.to_string())
}

fn report_completion(completion: &Completion) {
    match completion.status {
        TerminalStatus::Success | TerminalStatus::Error if completion.error.is_none() => {}
        TerminalStatus::Timeout => {
            eprintln!("runlet: timed out after {}ms", completion.execution_time_ms);
        }
        TerminalStatus::Killed => match completion.reason {
            Some(reason) => eprintln!("runlet: killed ({:?})", reason),
            None => eprintln!("runlet: killed"),
        },
        _ => {
            if let Some(error) = &completion.error {
                eprintln!("runlet: {}", error);
            }
        }
    }
}

/// Map a completion onto the exit code conventions of `timeout(1)` and shells.
fn cli_exit_code(completion: &Completion) -> i32 {
    match completion.status {
        TerminalStatus::Success => 0,
        TerminalStatus::Error => completion.exit_code.unwrap_or(1),
        TerminalStatus::Timeout => 124,
        TerminalStatus::Killed => 137,
        TerminalStatus::LaunchFailed => 127,
    }
}
