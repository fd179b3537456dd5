//! mudgate-server: multi-user MUD gateway.
//!
//! Accepts WebSocket clients, brokers recoverable sessions, and proxies
//! line-oriented traffic to the remote MUD, with sound-rule evaluation on
//! every upstream line.

mod config;
mod debug;
mod server;
mod session;
mod sounds;
mod transport;
mod upstream;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use config::{GateConfig, Overrides};
use server::GateServer;
use sounds::SoundEngine;
use tracing::{error, info, warn};

/// mudgate-server — MUD session gateway
#[derive(Parser, Debug)]
#[command(name = "mudgate-server", version, about = "MUD session gateway")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "mudgate.toml")]
    config: String,

    /// Remote MUD host
    #[arg(long)]
    mud_host: Option<String>,

    /// Remote MUD port
    #[arg(long)]
    mud_port: Option<u16>,

    /// Sound rule document path
    #[arg(long)]
    rules: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Upstream write timeout in seconds
    #[arg(long)]
    write_timeout: Option<u64>,

    /// Grace in milliseconds between sending quit and closing the socket
    #[arg(long)]
    quit_grace_ms: Option<u64>,

    /// Idle timeout in seconds (detached sessions)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Eviction sweep interval in seconds
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Login prompt grace window after connect, in seconds
    #[arg(long)]
    login_grace: Option<u64>,

    /// History retention: line budget
    #[arg(long)]
    history_lines: Option<usize>,

    /// History retention: byte budget
    #[arg(long)]
    history_bytes: Option<usize>,

    /// Pending command queue capacity
    #[arg(long)]
    command_queue_max: Option<usize>,

    /// Command truncation limit in bytes
    #[arg(long)]
    command_max_bytes: Option<usize>,

    /// Frames allowed per rate window, per transport
    #[arg(long)]
    rate_max_frames: Option<u32>,

    /// Rate window length in milliseconds
    #[arg(long)]
    rate_window_ms: Option<u64>,

    /// Outbound frame queue high-water mark, per transport
    #[arg(long)]
    write_highwater: Option<usize>,

    /// Partial-buffer prompt flush interval in milliseconds
    #[arg(long)]
    partial_flush_ms: Option<u64>,

    /// Partial-buffer size that triggers an early prompt scan
    #[arg(long)]
    partial_prompt_bytes: Option<usize>,

    /// Hard cap on the partial buffer before a forced flush
    #[arg(long)]
    partial_buffer_max: Option<usize>,

    /// Debug surface listen address (requires DEBUG=true)
    #[arg(long)]
    debug_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing; with DEBUG set, mirror events into the log ring
    // that backs /logs and /api/logs/stream.
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let log_ring = config::debug_env_enabled().then(|| debug::LogRing::new(500));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(log_ring.clone().map(debug::RingLayer::new))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mudgate-server");

    let overrides = Overrides {
        listen: cli.listen,
        debug_listen: cli.debug_listen,
        mud_host: cli.mud_host,
        mud_port: cli.mud_port,
        rules: cli.rules,
        max_sessions: cli.max_sessions,
        write_timeout_secs: cli.write_timeout,
        quit_grace_ms: cli.quit_grace_ms,
        history_max_lines: cli.history_lines,
        history_max_bytes: cli.history_bytes,
        command_queue_max: cli.command_queue_max,
        command_max_bytes: cli.command_max_bytes,
        idle_timeout_secs: cli.idle_timeout,
        sweep_interval_secs: cli.sweep_interval,
        login_grace_secs: cli.login_grace,
        rate_max_frames: cli.rate_max_frames,
        rate_window_ms: cli.rate_window_ms,
        transport_write_highwater: cli.write_highwater,
        partial_flush_ms: cli.partial_flush_ms,
        partial_prompt_bytes: cli.partial_prompt_bytes,
        partial_buffer_max: cli.partial_buffer_max,
    };

    let cfg = match GateConfig::load(Some(Path::new(&cli.config)), overrides) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let engine = match &cfg.rules_path {
        Some(path) => match SoundEngine::load(path) {
            Ok(engine) => {
                info!(rules = engine.rule_count(), "sound engine ready");
                engine
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load sound rules");
                std::process::exit(2);
            }
        },
        None => SoundEngine::empty(),
    };

    let server = Arc::new(GateServer::new(cfg.clone(), engine));

    if cfg.debug {
        warn!("DEBUG is set: inspection endpoints enabled, do not use in production");
        if let Some(ring) = log_ring {
            let manager = server.manager();
            let addr = cfg.debug_listen;
            tokio::spawn(async move {
                if let Err(e) = debug::serve(addr, manager, ring).await {
                    error!(error = %e, "debug surface failed");
                }
            });
        }
    }

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.manager().shutdown_all().await;
    info!("mudgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
