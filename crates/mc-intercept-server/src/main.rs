mod config;
mod console;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use config::InterceptConfig;
use mc_intercept_core::diagnostics::WebhookSink;
use mc_intercept_core::rate_limit::DEFAULT_LIMITS;
use mc_intercept_core::{EmptyWorld, LogErrorSink, ManagerSettings, ProtocolManager};
use mc_intercept_proto::{PacketType, Schema};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "intercept.toml".into());
    let config = Arc::new(match InterceptConfig::load(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            std::process::exit(1);
        }
    });

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        "mc-intercept v{} listening on {}, forwarding to {}",
        env!("CARGO_PKG_VERSION"),
        config.proxy.listen,
        config.proxy.backend
    );

    let manager = match build_manager(&config) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!("Startup failed: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.proxy.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Cannot bind {}: {e}", config.proxy.listen);
            std::process::exit(1);
        }
    };

    // Console REPL: read lines from stdin
    let (console_tx, mut console_rx) = tokio::sync::mpsc::channel::<String>(32);
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut tick_interval = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("Client connected from {addr}");
                    tokio::spawn(proxy::handle_client(
                        stream,
                        addr,
                        config.proxy.backend.clone(),
                        config.proxy.max_frame_size,
                        manager.clone(),
                    ));
                }
                Err(e) => warn!("Accept failed: {e}"),
            },
            _ = tick_interval.tick() => manager.tick(),
            Some(line) = console_rx.recv() => {
                for out in console::execute(&manager, &config, &line).await.lines() {
                    info!("{out}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown();
    info!("Proxy shut down.");
}

fn build_manager(config: &InterceptConfig) -> Result<ProtocolManager, Box<dyn std::error::Error>> {
    let schema = Arc::new(Schema::builtin()?);
    let settings = ManagerSettings {
        history_capacity: config.history.capacity,
        script_limits: config.scripts.limits.clone(),
    };
    let manager = ProtocolManager::new(schema, Arc::new(EmptyWorld), Arc::new(LogErrorSink), &settings)?;

    if !config.limits.defaults {
        for (packet_type, _) in DEFAULT_LIMITS {
            manager.rate_limiter().set_default_limit(*packet_type, 0);
        }
    }
    let (limits, unknown) = config.limits.resolve();
    for name in unknown {
        warn!("Ignoring rate limit for unknown packet type {name}");
    }
    for (packet_type, max) in limits {
        manager.rate_limiter().set_default_limit(packet_type, max);
    }

    if config.scripts.directory.is_dir() {
        let loaded = manager.load_filter_dir(&config.scripts.directory)?;
        info!("Loaded {loaded} filters from {}", config.scripts.directory.display());
    }

    manager.set_debug(config.diagnostics.debug);
    if let Some(url) = &config.diagnostics.webhook_url {
        let sink = WebhookSink::start(url.as_str())?;
        for name in &config.diagnostics.webhook_types {
            match PacketType::from_name(name) {
                Some(t) => sink.subscribe(t),
                None => warn!("Ignoring webhook subscription to unknown packet type {name}"),
            }
        }
        manager.diagnostics().set_webhook(Some(Arc::new(sink)));
        info!("Posting packets to {url}");
    }
    Ok(manager)
}
