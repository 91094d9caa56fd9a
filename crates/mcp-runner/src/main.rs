use std::future::IntoFuture;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};

use mcp_runner::api::{AppState, create_router};
use mcp_runner::auth::SessionTokens;
use mcp_runner::config::{RunnerConfig, default_config_path};
use mcp_runner::container::ContainerRuntimeApi;
use mcp_runner::control::{ControlLink, RunnerHandler};
use mcp_runner::launch::LaunchParamsResolver;
use mcp_runner::session::SessionManager;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config_path = match &cli.common.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    debug!("config file: {}", config_path.display());

    match cli.command {
        Command::Serve => {
            let config = RunnerConfig::load(&config_path)?;
            async_serve(config)
        }
        Command::Config { command } => handle_config(&cli.common, &config_path, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Runs MCP servers in containers for a control plane.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve sessions over HTTP and connect to the control plane
    Serve,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.quiet {
        return LevelFilter::Error;
    }
    match common.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match effective_log_level(common) {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mcp_runner={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(effective_log_level(common));
    builder.try_init().ok();
}

fn handle_config(common: &CommonOpts, path: &std::path::Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = RunnerConfig::load(path)?;
            if common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config).context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

#[tokio::main]
async fn async_serve(config: RunnerConfig) -> Result<()> {
    let runtime = config.container.runtime()?;
    match runtime.health_check().await {
        Ok(version) => info!("Using {:?} runtime: {}", runtime.runtime_type(), version),
        Err(e) => warn!("Container runtime not usable yet: {}", e),
    }
    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);

    let sessions = SessionManager::new(runtime, config.session_manager_config());
    let instance_id = config.auth.instance_id();
    info!("Runner instance {}", instance_id);
    let tokens = Arc::new(SessionTokens::new(instance_id, config.auth.token_ttl()));
    let state = AppState::new(
        Arc::clone(&sessions),
        tokens,
        config.server.public_url(),
    );

    let resolver = Arc::new(LaunchParamsResolver::new(config.launcher.clone()));
    if !resolver.is_available() {
        warn!(
            "'{}' not found; launch parameter scripts will fail",
            config.launcher.deno_binary
        );
    }

    let control = if config.control.url.is_some() {
        let (handler, outbound) = RunnerHandler::new(
            state.clone(),
            resolver,
            config.control.tags.clone(),
            config.control.max_concurrent_jobs,
        );
        Some(ControlLink::new(config.control.clone(), handler, outbound)?)
    } else {
        info!("No control plane configured, serving HTTP only");
        None
    };

    let router = create_router(state, &config.server.allowed_origins);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on {}", addr);

    let gc = tokio::spawn(Arc::clone(&sessions).gc_loop());

    let link = async {
        match &control {
            Some(link) => link.run().await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = axum::serve(listener, router).into_future() => result.context("HTTP server failed"),
        result = link => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    sessions.shutdown().await;
    let _ = gc.await;
    result
}
