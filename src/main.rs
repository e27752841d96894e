//! leasehold command line
//!
//! Runs the port reservation service, the session server, or one-shot
//! clients for either.
//!
//! Architecture:
//! - Servers run on a multi-threaded tokio runtime until SIGINT/SIGTERM/SIGQUIT
//! - Clients print a JSON outcome on stdout; logs go to stderr

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};
use leasehold::config::{
    parse_socket_addr, PrsConfig, SdClientConfig, SdServerConfig, DEFAULT_END_PORT,
    DEFAULT_KEEP_ALIVE_INTERVAL_SECS, DEFAULT_KEEP_ALIVE_TIMEOUT_SECS, DEFAULT_PRS_PORT,
    DEFAULT_RESPONSE_TIMEOUT_SECS, DEFAULT_SD_SERVICE_NAME, DEFAULT_START_PORT,
};
use leasehold::prs::{LeaseService, PortLeaseAllocator, PrsClient};
use leasehold::sd::{self, SdClient};
use leasehold::shutdown::wait_for_shutdown_signal;
use serde_json::{json, Value};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "leasehold", version, about = "Port leasing and resumable document sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the port reservation service
    PrsServer(PrsServerArgs),
    /// Send one request to the port reservation service
    PrsClient(PrsClientArgs),
    /// Run the session server on a port leased from the PRS
    SdServer(SdServerArgs),
    /// Run one session command against the session server
    SdClient(SdClientArgs),
}

#[derive(Args)]
struct PrsServerArgs {
    /// UDP port to listen on
    #[arg(short = 'p', long, default_value_t = DEFAULT_PRS_PORT)]
    port: u16,
    /// First leasable port
    #[arg(short = 's', long, default_value_t = DEFAULT_START_PORT)]
    start: u16,
    /// Last leasable port (inclusive)
    #[arg(short = 'e', long, default_value_t = DEFAULT_END_PORT)]
    end: u16,
    /// Seconds a lease survives without a keep-alive
    #[arg(short = 't', long, default_value_t = DEFAULT_KEEP_ALIVE_TIMEOUT_SECS)]
    timeout: u64,
}

#[derive(Args)]
struct PrsTarget {
    /// PRS address
    #[arg(long, default_value = "127.0.0.1:30000", value_parser = parse_socket_addr)]
    prs: SocketAddr,
    /// Seconds to wait for each reply
    #[arg(long, default_value_t = DEFAULT_RESPONSE_TIMEOUT_SECS)]
    timeout: u64,
}

#[derive(Args)]
struct PrsClientArgs {
    #[command(flatten)]
    target: PrsTarget,
    /// Service name the request is made for
    #[arg(long, default_value = DEFAULT_SD_SERVICE_NAME)]
    service: String,
    #[command(subcommand)]
    request: PrsRequest,
}

#[derive(Subcommand)]
enum PrsRequest {
    /// Lease a port
    Request,
    /// Renew a held lease
    KeepAlive { port: u16 },
    /// Release a held lease
    Close { port: u16 },
    /// Find the port leased to the service
    Lookup,
    /// Shut the PRS down
    Stop,
}

#[derive(Args)]
struct SdServerArgs {
    #[command(flatten)]
    target: PrsTarget,
    /// Name to lease the listening port under
    #[arg(long, default_value = DEFAULT_SD_SERVICE_NAME)]
    service_name: String,
    /// Seconds between lease renewals
    #[arg(long, default_value_t = DEFAULT_KEEP_ALIVE_INTERVAL_SECS)]
    keep_alive_secs: u64,
    /// Local address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["open", "resume", "close"])))]
struct SdClientArgs {
    #[command(flatten)]
    target: PrsTarget,
    /// Host the session server runs on
    #[arg(long, default_value = "127.0.0.1")]
    server: IpAddr,
    /// Service name the session server is leased under
    #[arg(long, default_value = DEFAULT_SD_SERVICE_NAME)]
    service_name: String,
    /// Open a new session
    #[arg(short = 'o', long)]
    open: bool,
    /// Resume an existing session
    #[arg(short = 'r', long, value_name = "ID")]
    resume: Option<u64>,
    /// Close a session
    #[arg(short = 'c', long, value_name = "ID", conflicts_with_all = ["get", "post"])]
    close: Option<u64>,
    /// Read a document from the session
    #[arg(long, value_name = "DOC", conflicts_with = "post")]
    get: Option<String>,
    /// Store stdin as a document in the session
    #[arg(long, value_name = "DOC")]
    post: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leasehold=info")))
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Command::PrsServer(args) => rt.block_on(run_prs_server(args)),
        Command::PrsClient(args) => rt.block_on(run_prs_client(args)),
        Command::SdServer(args) => rt.block_on(run_sd_server(args)),
        Command::SdClient(args) => rt.block_on(run_sd_client(args)),
    }
}

/// Cancel `cancel` when a shutdown signal arrives.
fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Shutdown signal received");
                cancel.cancel();
            }
            Err(e) => info!(error = %e, "Shutdown signal handler failed; running until stopped"),
        }
    });
}

async fn run_prs_server(args: PrsServerArgs) -> anyhow::Result<()> {
    let config = PrsConfig {
        service_port: args.port,
        start_port: args.start,
        end_port: args.end,
        keep_alive_timeout: Duration::from_secs(args.timeout),
    };
    config.validate().context("Invalid PRS configuration")?;

    let allocator = PortLeaseAllocator::new(
        config.start_port,
        config.end_port,
        config.keep_alive_timeout,
    )?;
    let service = LeaseService::bind(config.bind_addr(), allocator)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    service.run(cancel).await;
    info!("PRS stopped");
    Ok(())
}

async fn run_prs_client(args: PrsClientArgs) -> anyhow::Result<()> {
    let response_timeout = Duration::from_secs(args.target.timeout);
    let client = PrsClient::connect(args.target.prs, &args.service, response_timeout)
        .await
        .context("Failed to open PRS socket")?;

    let outcome: Value = match args.request {
        PrsRequest::Request => {
            let port = client.request_port().await?;
            json!({ "request": "REQUEST_PORT", "service": args.service, "port": port })
        }
        PrsRequest::KeepAlive { port } => {
            client.keep_alive(port).await?;
            json!({ "request": "KEEP_ALIVE", "service": args.service, "port": port })
        }
        PrsRequest::Close { port } => {
            client.close_port(port).await?;
            json!({ "request": "CLOSE_PORT", "service": args.service, "port": port })
        }
        PrsRequest::Lookup => {
            let port = client.lookup_port().await?;
            json!({ "request": "LOOKUP_PORT", "service": args.service, "port": port })
        }
        PrsRequest::Stop => {
            client.stop().await?;
            json!({ "request": "STOP" })
        }
    };
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_sd_server(args: SdServerArgs) -> anyhow::Result<()> {
    let config = SdServerConfig {
        prs_addr: args.target.prs,
        service_name: args.service_name,
        keep_alive_interval: Duration::from_secs(args.keep_alive_secs),
        bind_ip: args.bind,
        response_timeout: Duration::from_secs(args.target.timeout),
    };
    config.validate().context("Invalid session server configuration")?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    let stats = sd::run_leased(&config, cancel).await?;
    info!(
        open_sessions = stats.open_sessions,
        issued_sessions = stats.issued_sessions,
        "Session server stopped"
    );
    Ok(())
}

async fn run_sd_client(args: SdClientArgs) -> anyhow::Result<()> {
    let config = SdClientConfig {
        prs_addr: args.target.prs,
        server_ip: args.server,
        service_name: args.service_name,
        response_timeout: Duration::from_secs(args.target.timeout),
    };
    let mut client = SdClient::discover(&config).await?;

    let mut outcome = serde_json::Map::new();
    if args.open {
        let id = client.open_session().await?;
        outcome.insert("opened".into(), json!(id));
    } else if let Some(id) = args.resume {
        client.resume_session(id).await?;
        outcome.insert("resumed".into(), json!(id));
    } else if let Some(id) = args.close {
        client.close_session(id).await?;
        outcome.insert("closed".into(), json!(id));
    }

    if let Some(name) = args.get {
        let content = client.get_document(&name).await?;
        outcome.insert("document".into(), json!({ "name": name, "content": content }));
    } else if let Some(name) = args.post {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read document from stdin")?;
        let bytes = content.len();
        client.post_document(&name, &content).await?;
        outcome.insert("stored".into(), json!({ "name": name, "bytes": bytes }));
    }

    client.disconnect().await;
    println!("{}", serde_json::to_string_pretty(&Value::Object(outcome))?);
    Ok(())
}
