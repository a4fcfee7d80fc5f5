use clap::{Args as ClapArgs, Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cron_dispatch::config::{AgentConfig, ControllerConfig, TlsConfig};
use cron_dispatch::controller::Controller;
use cron_dispatch::proto::TaskRequest;
use cron_dispatch::rpc::{AgentAddr, AgentServer, ConnectionPool, DispatchClient};
use cron_dispatch::shutdown::{listen_for_signals, wait_for_termination, ShutdownOutcome};
use cron_dispatch::store::MemoryTaskLogStore;
use cron_dispatch::tls::TlsIdentity;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "cron-dispatch")]
#[command(version)]
#[command(about = "Dispatch shell tasks from a controller to remote agents over gRPC")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the controller (HTTP API + dispatcher)
    Controller(ControllerArgs),

    /// Start an agent that executes commands for the controller
    Agent(AgentArgs),

    /// Run a single command on one agent and print the result
    Run(RunArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(ClapArgs, Debug)]
struct TlsArgs {
    /// Enable TLS for agent RPC
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Name the agent certificate is issued for
    #[arg(long, requires = "tls")]
    server_name: Option<String>,

    /// Fall back to plaintext when --tls is given but certificates are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

impl TlsArgs {
    fn into_config(self) -> TlsConfig {
        TlsConfig {
            enabled: self.tls,
            ca_cert_path: self.ca_cert,
            cert_path: self.cert,
            key_path: self.key,
            server_name: self.server_name,
            allow_insecure: self.allow_insecure,
        }
    }
}

#[derive(ClapArgs, Debug)]
struct ControllerArgs {
    /// Address for the HTTP API
    #[arg(long, default_value = "0.0.0.0:5920")]
    http_addr: SocketAddr,

    /// Upper bound on the whole shutdown drain, in seconds
    #[arg(long, default_value = "30")]
    shutdown_timeout: u64,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(ClapArgs, Debug)]
struct AgentArgs {
    /// Address to listen on for gRPC
    #[arg(long, default_value = "0.0.0.0:5921")]
    listen_addr: SocketAddr,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Agent address (host:port)
    #[arg(long, short = 'a', default_value = "127.0.0.1:5921")]
    agent: AgentAddr,

    /// Run identifier sent to the agent
    #[arg(long, default_value = "1")]
    id: i64,

    /// Timeout in seconds; values outside (0, 86400] run with the maximum
    #[arg(long, short = 't', default_value = "0")]
    timeout: i64,

    /// Output format
    #[arg(long, short = 'o', default_value = "text")]
    output: OutputFormat,

    #[command(flatten)]
    tls: TlsArgs,

    /// The command to execute (e.g., "echo hello")
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct RunOutput {
    id: i64,
    agent: String,
    output: String,
    error: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn load_tls(config: &TlsConfig) -> Result<Option<TlsIdentity>, BoxError> {
    TlsIdentity::resolve(config)
        .await
        .map_err(|e| format!("TLS certificate loading failed: {}", e).into())
}

// =============================================================================
// Sub-commands
// =============================================================================

async fn run_controller(args: ControllerArgs) -> Result<(), BoxError> {
    let tls = args.tls.into_config();
    let tls_identity = load_tls(&tls).await?;

    let mut config = ControllerConfig::new(args.http_addr)
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout));
    config.tls = tls;

    tracing::info!(
        http_addr = %config.http_addr,
        tls_enabled = tls_identity.is_some(),
        shutdown_timeout_secs = args.shutdown_timeout,
        "Starting cron-dispatch controller"
    );

    match Controller::new(config, tls_identity).run().await? {
        ShutdownOutcome::Completed { failed } if failed.is_empty() => Ok(()),
        ShutdownOutcome::Completed { failed } => {
            tracing::warn!(failed = ?failed, "Controller stopped with failed drain steps");
            Ok(())
        }
        ShutdownOutcome::Forced => std::process::exit(1),
    }
}

async fn run_agent(args: AgentArgs) -> Result<(), BoxError> {
    let tls = args.tls.into_config();
    let tls_identity = load_tls(&tls).await?;

    let mut config = AgentConfig::new(args.listen_addr);
    config.tls = tls;

    tracing::info!(
        listen_addr = %config.listen_addr,
        tls_enabled = tls_identity.is_some(),
        "Starting cron-dispatch agent"
    );

    let mut signals = listen_for_signals()?;
    AgentServer::new(config, tls_identity)
        .run(async move {
            wait_for_termination(&mut signals).await;
            tracing::info!("Stopping agent, waiting for running commands");
        })
        .await
}

async fn run_once(args: RunArgs) -> Result<(), BoxError> {
    let tls = args.tls.into_config();
    let tls_identity = load_tls(&tls).await?;

    let store = Arc::new(MemoryTaskLogStore::new());
    let pool = Arc::new(ConnectionPool::new(tls_identity, Default::default()));
    let client = DispatchClient::new(pool, store);

    let request = TaskRequest {
        id: args.id,
        command: args.command.join(" "),
        timeout: args.timeout,
    };

    let exec = client.exec(&args.agent, request);
    tokio::pin!(exec);
    let result = loop {
        tokio::select! {
            result = &mut exec => break result,
            _ = tokio::signal::ctrl_c() => {
                client.stop(&args.agent, args.id).await;
            }
        }
    };

    let (output, error) = match result {
        Ok(output) => (output, None),
        Err(failure) => (failure.output, Some(failure.error.to_string())),
    };
    let failed = error.is_some();

    match args.output {
        OutputFormat::Json => {
            let out = RunOutput {
                id: args.id,
                agent: args.agent.to_string(),
                output,
                error,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            print!("{output}");
            if let Some(error) = error {
                eprintln!("Error: {error}");
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Controller(controller_args) => run_controller(controller_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Run(run_args) => run_once(run_args).await?,
    }

    Ok(())
}
