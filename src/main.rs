//! Nosh
//!
//! HTTP/WebSocket server with an auto-reconnecting WebSocket client. The
//! server serves the client bundle and accepts WebSocket upgrades on a single
//! well-known path; the client keeps one socket to it alive, backing off
//! exponentially between attempts. Schema updates for the database are
//! created and applied through the `schema` subcommand.

mod client;
mod endpoint;
mod logger;
mod random;
mod schema;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use client::SocketManager;
use endpoint::{socket_url, DEFAULT_HOST, DEFAULT_PORT};
use schema::{SchemaDatabase, SchemaDir, DEFAULT_DATABASE, DEFAULT_SCHEMA_DIR};
use server::{ServerConfig, WebSocketServer};

/// Nosh server and client
#[derive(Parser, Debug)]
#[command(name = "nosh")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket server
    Serve {
        /// Bind address
        #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
        host: String,

        /// Port to listen on
        #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Directory of static files to serve
        #[arg(long)]
        static_dir: Option<PathBuf>,
    },
    /// Connect to a server and keep the connection alive
    Connect {
        /// Server host, including the port
        #[arg(long, default_value_t = format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT))]
        host: String,
    },
    /// Manage database schema updates
    Schema(SchemaArgs),
}

#[derive(ClapArgs, Debug)]
struct SchemaArgs {
    /// Directory holding the schema updates
    #[arg(long, env = "NOSH_SCHEMA_DIR", default_value = DEFAULT_SCHEMA_DIR)]
    dir: PathBuf,

    /// Database file the updates are applied to
    #[arg(long, env = "NOSH_DATABASE", default_value = DEFAULT_DATABASE)]
    database: PathBuf,

    #[command(subcommand)]
    command: SchemaCommand,
}

#[derive(Subcommand, Debug)]
enum SchemaCommand {
    /// Create empty scripts for a new schema update
    Create {
        /// Update name: at least 3 lowercase letters or dashes
        name: String,
    },
    /// Apply every schema update not applied yet
    Update,
    /// Revert a single applied schema update
    Revert {
        /// Full update name, including its timestamp
        update: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .compact()
        .init();

    info!("Nosh v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Serve {
            host,
            port,
            static_dir,
        } => serve(ServerConfig::new(host, port).with_static_dir(static_dir)).await,
        Command::Connect { host } => connect(&host).await,
        Command::Schema(args) => schema(args).await,
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn connect(host: &str) -> anyhow::Result<()> {
    let manager = SocketManager::new(socket_url(host));

    let _connected = manager.is_connected().subscribe(|connected| {
        if *connected {
            info!("Connected");
        } else {
            info!("Disconnected");
        }
    });
    let _delay = manager.reconnect_delay().subscribe(|delay| {
        info!("Reconnect delay is now {}ms", delay.as_millis());
    });

    info!("Connecting to {}", manager.url());
    tokio::select! {
        result = manager.connect() => {
            result?;
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {}
    }

    manager.disconnect();
    info!("Client stopped");
    Ok(())
}

async fn schema(args: SchemaArgs) -> anyhow::Result<()> {
    let dir = SchemaDir::new(args.dir);

    match args.command {
        SchemaCommand::Create { name } => {
            let update = dir.create(&name).await?;
            info!("Created schema update {}", dir.path(&update).display());
        }
        SchemaCommand::Update => {
            let database = SchemaDatabase::open(&args.database).await?;
            let applied = database.update(&dir).await?;
            info!("Applied {} schema updates", applied);
        }
        SchemaCommand::Revert { update } => {
            dir.ensure_exists(&update).await?;
            let database = SchemaDatabase::open(&args.database).await?;
            database.revert(&dir, &update).await?;
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
