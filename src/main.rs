use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use delve_core::config::{AppConfig, ExecutorKind};
use delve_core::traits::{StateStore, StepExecutor};
use delve_core::types::{EventKind, RunId};
use delve_engine::{DeepSearchFactory, EchoExecutor, EngineLimits, RemoteExecutor, RunSnapshot};
use delve_gateway::{build_admission, GatewayServer, RunHost, RunRequest, StreamItem};

#[derive(Parser)]
#[command(name = "delve", version, about = "Deep-research workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "delve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/SSE gateway server
    Serve {
        /// Override the bind address from config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run (or resume) a workflow locally and print its events
    Run {
        /// Run ID (auto-generated if not provided)
        #[arg(short, long)]
        run_id: Option<String>,
        /// Workflow to build for a fresh run
        #[arg(short, long)]
        workflow: Option<String>,
        /// Use the echo executor regardless of config
        #[arg(long)]
        dry_run: bool,
        /// The research question; read from stdin when empty
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Show the stored state of a run
    Show {
        run_id: String,
    },
    /// List stored runs
    List,
    /// Delete a stored run
    Delete {
        run_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("delve=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "delve", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Show { run_id } => {
            let store = delve_store::open(&config.store)?;
            match RunSnapshot::load_from(store.as_ref(), &run_id).await? {
                Some(snapshot) => {
                    println!("{}", serde_json::to_string_pretty(&snapshot.summary())?)
                }
                None => anyhow::bail!("run not found: {}", run_id),
            }
        }
        Commands::List => {
            let store = delve_store::open(&config.store)?;
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No stored runs.");
            }
            for id in ids {
                match RunSnapshot::load_from(store.as_ref(), &id).await {
                    Ok(Some(s)) => println!("{:<38} {:<10} {}", id, s.status, s.context.query),
                    Ok(None) => {}
                    Err(e) => println!("{:<38} {:<10} {}", id, "?", e),
                }
            }
        }
        Commands::Delete { run_id } => {
            let store = delve_store::open(&config.store)?;
            if store.delete(&run_id).await? {
                println!("Deleted {}", run_id);
            } else {
                anyhow::bail!("run not found: {}", run_id);
            }
        }
        Commands::Serve { bind } => {
            let mut gateway_config = config.gateway.clone();
            if let Some(bind) = bind {
                gateway_config.bind = bind;
            }
            let host = build_host(&config, false)?;
            info!(bind = %gateway_config.bind, "Starting SSE gateway");
            let server = GatewayServer::new(gateway_config, host);

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Run {
            run_id,
            workflow,
            dry_run,
            query,
        } => {
            let mut text = query.join(" ");
            if text.is_empty() && run_id.is_none() {
                // Read from stdin
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }

            let host = build_host(&config, dry_run)?;
            let run_id = run_id.map(|s| RunId::from_string(&s)).unwrap_or_default();
            let payload = if text.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::json!({ "query": text })
            };
            let mut request = RunRequest::new(run_id, payload);
            request.workflow = workflow;

            run_once(&host, request).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    // Check for config in common locations
    if let Some(home_config) = dirs_home().map(|h| h.join(".delve").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn build_host(config: &AppConfig, dry_run: bool) -> anyhow::Result<Arc<RunHost>> {
    let store: Arc<dyn StateStore> = delve_store::open(&config.store)?;
    let executor: Arc<dyn StepExecutor> = if dry_run || config.executor.kind == ExecutorKind::Echo {
        Arc::new(EchoExecutor::new())
    } else {
        Arc::new(RemoteExecutor::from_config(&config.executor)?)
    };

    Ok(Arc::new(RunHost::new(
        Arc::new(DeepSearchFactory::new(config.research.clone())),
        store,
        executor,
        build_admission(&config.admission),
        EngineLimits::from(&config.engine),
        config.gateway.stream_buffer,
    )))
}

async fn run_once(host: &Arc<RunHost>, request: RunRequest) -> anyhow::Result<()> {
    let run_id = request.run_id.clone();
    eprintln!("[run {}]", run_id);

    let mut stream = host.execute(request);

    // Ctrl-C cancels the run; its checkpoint stays resumable
    let cancel_host = host.clone();
    let cancel_id = run_id.to_string();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[cancelling...]");
            cancel_host.cancel(&cancel_id);
        }
    });

    let mut failed = None;
    while let Some(item) = stream.recv().await {
        if let Some(error) = print_event(&item) {
            failed = Some(error);
        }
    }
    ctrl_c.abort();

    match failed {
        Some(error) => anyhow::bail!("run {} failed: {}", run_id, error),
        None => Ok(()),
    }
}

/// Print one event; returns the error text of an `error` event.
fn print_event(item: &StreamItem) -> Option<String> {
    let event = &item.event;
    let payload = &event.payload;
    let node = event.node_id.as_deref().unwrap_or("-");

    match event.kind {
        EventKind::RunStarted => eprintln!("[started: {}]", payload["workflow"].as_str().unwrap_or("")),
        EventKind::RunResumed => eprintln!("[resumed at {}]", payload["cursor"].as_str().unwrap_or("-")),
        EventKind::NodeStarted => eprintln!("\n[{}]", node),
        EventKind::NodeUpdated => {
            if let Some(reasoning) = payload["reasoning"].as_str() {
                eprintln!("  {}", reasoning);
            }
            match &payload["output"] {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => eprintln!("  {}", s),
                other => eprintln!("  {}", other),
            }
        }
        EventKind::NodeCompleted => {}
        EventKind::NodeError => {
            eprintln!("  [node error: {}]", payload["error"].as_str().unwrap_or("unknown"))
        }
        EventKind::RunSuspended => {
            eprintln!(
                "\n[suspended before {}; resume with: delve run --run-id {}]",
                payload["cursor"].as_str().unwrap_or("-"),
                item.run_id
            );
        }
        EventKind::Completed => {
            if payload["replayed"] == serde_json::json!(true) {
                eprintln!("[already completed]");
            }
            if let Some(answer) = payload["final_answer"].as_str() {
                println!("{}", answer);
                io::stdout().flush().ok();
            }
            eprintln!(
                "\n[done: {} steps, {} sources]",
                payload["steps"],
                payload["sources"].as_array().map_or(0, Vec::len)
            );
        }
        EventKind::Aborted => eprintln!("\n[aborted]"),
        EventKind::Error => {
            let error = payload["error"].as_str().unwrap_or("unknown error").to_string();
            eprintln!("\n[error: {}]", error);
            return Some(error);
        }
    }
    None
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
