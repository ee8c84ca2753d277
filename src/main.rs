//! Strata display server
//!
//! Listens on an abstract Unix socket and composites client surfaces into
//! a headless canvas.

use anyhow::{Context, Result};
use std::path::PathBuf;
use strata::{Config, Display, HeadlessCompositor};
use strata_shm::{open_backend, Backend, Role, ShmBackend};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line options
#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    anonymous_shm: bool,
}

impl Options {
    fn parse() -> Result<Self> {
        let mut options = Self::default();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    let path = args.next().context("--config needs a path")?;
                    options.config = Some(PathBuf::from(path));
                }
                "--anonymous-shm" => options.anonymous_shm = true,
                other => anyhow::bail!("unknown argument: {}", other),
            }
        }
        Ok(options)
    }
}

fn open_server_backend(config: &Config, anonymous: bool) -> Result<Box<dyn Backend>> {
    if anonymous || config.backend.anonymous {
        info!("Using process-private buffer memory");
        let backend = ShmBackend::anonymous(config.backend.shm())
            .context("Failed to set up anonymous buffer memory")?;
        return Ok(Box::new(backend));
    }

    open_backend(
        &config.backend.name,
        &config.backend.args,
        Role::Server(config.backend.shm()),
    )
    .with_context(|| format!("Failed to open backend {} '{}'", config.backend.name, config.backend.args))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "strata=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Strata display server");

    let options = Options::parse()?;
    let config = match &options.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    // The display is not Send; it lives entirely on the blocking thread.
    let (token_tx, token_rx) = tokio::sync::oneshot::channel();
    let server = tokio::task::spawn_blocking(move || -> Result<()> {
        let backend = open_server_backend(&config, options.anonymous_shm)?;
        let compositor = HeadlessCompositor::new(config.compositor.width, config.compositor.height);
        let mut display = Display::new(&config.server, backend, Box::new(compositor))
            .context("Failed to create display")?;
        display
            .add_socket(&config.server.socket_name)
            .with_context(|| format!("Failed to listen on @{}", config.server.socket_name))?;

        let _ = token_tx.send(display.shutdown_token());
        display.run().context("Display loop failed")
    });

    let Ok(token) = token_rx.await else {
        // Setup failed before the loop started.
        return server.await.context("Display thread panicked")?;
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            token.cancel();
        });
    }

    let result = server.await.context("Display thread panicked")?;
    if let Err(e) = &result {
        error!("Display server error: {:#}", e);
    }
    result
}
