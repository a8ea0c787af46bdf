//! Botster Relay CLI - resumable TCP over WebSocket.
//!
//! `serve` runs the relay server. `connect` is the client: it pipes
//! stdin/stdout through a tunnel (usable as an SSH `ProxyCommand`) or, with
//! `--listen`, gives every accepted local connection its own tunnel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use botster_relay::server::{self, ServerState};
use botster_relay::{Config, EndpointContext, Tunnel, TunnelOptions};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "botster-relay")]
#[command(version)]
#[command(about = "Resumable TCP over WebSocket")]
struct Cli {
    /// JSON config file (defaults to $BOTSTER_RELAY_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More logging: -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server until Ctrl-C
    Serve {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
    },
    /// Open a tunnel to HOST:PORT through the relay
    Connect {
        /// Relay base URL, e.g. https://relay.example.com
        #[arg(long)]
        proxy: Option<String>,
        /// Accept local TCP connections on this address instead of using
        /// stdin/stdout. A bare port means 127.0.0.1:PORT.
        #[arg(long)]
        listen: Option<String>,
        /// Destination host, as seen from the server
        host: String,
        /// Destination port
        #[arg(default_value_t = 22)]
        port: u16,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = env_logger::Env::default().default_filter_or(default);
    let mut builder = env_logger::Builder::from_env(env);
    if verbose > 0 {
        builder.filter_level(if verbose == 1 {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Trace
        });
    }
    // stdout carries the tunnel in `connect` mode.
    builder
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .init();
}

/// `PORT` becomes `127.0.0.1:PORT`; anything else is used as is.
fn listen_addr(addr: &str) -> String {
    if addr.parse::<u16>().is_ok() {
        format!("127.0.0.1:{addr}")
    } else {
        addr.to_string()
    }
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, shutting down");
        }
        cancel.cancel();
    });
}

async fn run_serve(config: Config, listen: Option<String>) -> Result<()> {
    let listen = listen_addr(&listen.unwrap_or_else(|| config.server.listen.clone()));
    let state = Arc::new(ServerState::new(&config)?);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);
    server::serve(listener, state, cancel).await
}

async fn run_connect(
    config: Config,
    proxy: Option<String>,
    listen: Option<String>,
    host: String,
    port: u16,
) -> Result<()> {
    let proxy = proxy.unwrap_or_else(|| config.client.proxy.clone());
    if proxy.is_empty() {
        anyhow::bail!("no relay URL: pass --proxy or set BOTSTER_RELAY_PROXY");
    }
    let options = TunnelOptions {
        proxy,
        origin: config.client.origin.clone(),
        host,
        port,
        retry: config.client.retry,
    };
    let context = config.endpoint_context(config.client.timeouts);

    match listen {
        Some(listen) => accept_loop(&listen_addr(&listen), options, context).await,
        None => {
            let tunnel = Tunnel::new(options, &context);
            let task = tunnel.start();
            tunnel
                .pipe(tokio::io::stdin(), tokio::io::stdout())
                .await
                .context("tunnel failed")?;
            task.await
                .context("tunnel task panicked")?
                .context("tunnel closed")?;
            Ok(())
        }
    }
}

/// Give every accepted connection its own tunnel until Ctrl-C.
async fn accept_loop(listen: &str, options: TunnelOptions, context: EndpointContext) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    log::info!(
        "Forwarding {} to {}:{} via {}",
        listener.local_addr()?,
        options.host,
        options.port,
        options.proxy
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        log::info!("Accepted {}", peer);

        let tunnel = Tunnel::new(options.clone(), &context);
        let task = tunnel.start();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = tunnel.pipe(reader, writer).await {
                log::warn!("Connection from {} ended: {}", peer, e);
            }
            match task.await {
                Ok(Err(e)) => log::warn!("Tunnel for {} closed: {}", peer, e),
                Err(e) => log::error!("Tunnel task for {} panicked: {}", peer, e),
                Ok(Ok(())) => log::info!("Connection from {} closed", peer),
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { listen } => run_serve(config, listen).await,
        Commands::Connect {
            proxy,
            listen,
            host,
            port,
        } => run_connect(config, proxy, listen, host, port).await,
    }
}
