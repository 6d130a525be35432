//! Server lifecycle: startup, hot reload and graceful shutdown.
//!
//! Shutdown runs in a fixed order:
//!
//! 1. the shutdown flag is set, so new requests get a 503
//! 2. the listener stops accepting and in-flight requests drain
//! 3. the config watcher and signal handlers are released
//! 4. draining is bounded by `shutdown_timeout`; past it the server task is
//!    aborted and [`ServerError::ShutdownTimeout`] is returned

use crate::config::ServerConfig;
use crate::dispatcher::RouteTable;
use crate::error::{ConfigError, ServerError};
use crate::server;
use crate::state::ServerState;
use crate::watcher::ConfigWatcher;
use notify::RecommendedWatcher;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "mocks.json";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Quiet period after a file event before reloading; editors often write
/// a file in several steps.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Options for [`start`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub config_path: PathBuf,
    pub addr: SocketAddr,
    pub shutdown_timeout: Duration,
    /// Reload routes when the config file changes
    pub watch_config: bool,
    /// Install SIGINT/SIGTERM handlers that trigger shutdown
    pub handle_signals: bool,
}

impl ServerOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            watch_config: true,
            handle_signals: true,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_watch_config(mut self, enabled: bool) -> Self {
        self.watch_config = enabled;
        self
    }

    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }
}

/// Load the config, bind the listener and start serving.
///
/// A config that fails to load or validate is fatal and no listener is
/// bound.
pub async fn start(options: ServerOptions) -> Result<ServerHandle, ServerError> {
    let table = load_table(&options.config_path).await?;
    let route_count = table.len();
    let state = Arc::new(ServerState::new(table));

    let listener = TcpListener::bind(options.addr)
        .await
        .map_err(|source| ServerError::Transport {
            addr: options.addr,
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Transport {
            addr: options.addr,
            source,
        })?;

    let mut background = Vec::new();

    let watcher = if options.watch_config {
        let (watcher, changes) = ConfigWatcher::new(&options.config_path);
        let guard = watcher.run()?;
        background.push(tokio::spawn(reload_on_change(
            state.clone(),
            options.config_path.clone(),
            changes,
        )));
        Some(guard)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if options.handle_signals {
        let state = state.clone();
        let tx = shutdown_tx.clone();
        background.push(tokio::spawn(async move {
            shutdown_signal().await;
            trigger_shutdown(&state, &tx);
        }));
    }

    let app = server::router(state.clone());
    let mut drain_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = drain_rx.wait_for(|stopping| *stopping).await;
            })
            .await
    });

    info!(
        address = %local_addr,
        routes = route_count,
        config = %options.config_path.display(),
        "Mock server started"
    );

    Ok(ServerHandle {
        local_addr,
        state,
        config_path: options.config_path,
        shutdown_timeout: options.shutdown_timeout,
        shutdown_tx,
        shutdown_rx,
        server,
        background,
        watcher,
    })
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    config_path: PathBuf,
    shutdown_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    server: JoinHandle<io::Result<()>>,
    background: Vec<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Reload the config file now.
    ///
    /// On failure the current routes stay active and the error is returned.
    pub async fn reload(&self) -> Result<usize, ConfigError> {
        reload_routes(&self.state, &self.config_path).await
    }

    /// Begin shutdown without waiting for it to complete.
    pub fn trigger_shutdown(&self) {
        trigger_shutdown(&self.state, &self.shutdown_tx);
    }

    /// Shut down and wait for in-flight requests to drain.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.trigger_shutdown();
        self.finish().await
    }

    /// Wait until shutdown is triggered (by a signal or
    /// [`trigger_shutdown`](Self::trigger_shutdown)), then drain.
    pub async fn wait(mut self) -> Result<(), ServerError> {
        let _ = self.shutdown_rx.wait_for(|stopping| *stopping).await;
        self.finish().await
    }

    async fn finish(mut self) -> Result<(), ServerError> {
        drop(self.watcher.take());
        for task in self.background.drain(..) {
            task.abort();
        }

        let timeout = self.shutdown_timeout;
        match tokio::time::timeout(timeout, &mut self.server).await {
            Ok(Ok(Ok(()))) => {
                info!("Server stopped, all requests drained");
                Ok(())
            }
            Ok(Ok(Err(source))) => Err(ServerError::Transport {
                addr: self.local_addr,
                source,
            }),
            Ok(Err(join_err)) => Err(ServerError::Transport {
                addr: self.local_addr,
                source: io::Error::other(join_err),
            }),
            Err(_) => {
                self.server.abort();
                error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Could not drain in-flight requests in time, forcing shutdown"
                );
                Err(ServerError::ShutdownTimeout { timeout })
            }
        }
    }
}

fn trigger_shutdown(state: &ServerState, tx: &watch::Sender<bool>) {
    if state.begin_shutdown() {
        info!("Shutting down, rejecting new requests");
        let _ = tx.send(true);
    }
}

async fn load_table(path: &Path) -> Result<RouteTable, ConfigError> {
    let config = ServerConfig::load(path).await?;
    RouteTable::build(&config)
}

/// Validate-then-swap reload. The old table stays active on failure.
async fn reload_routes(state: &ServerState, path: &Path) -> Result<usize, ConfigError> {
    match load_table(path).await {
        Ok(table) => {
            let count = table.len();
            state.swap_routes(table);
            state.stats().record_reload(true);
            info!(routes = count, "Configuration reloaded");
            Ok(count)
        }
        Err(err) => {
            state.stats().record_reload(false);
            error!(error = %err, "Failed to reload config, keeping current configuration");
            Err(err)
        }
    }
}

async fn reload_on_change(
    state: Arc<ServerState>,
    path: PathBuf,
    mut changes: mpsc::UnboundedReceiver<()>,
) {
    while changes.recv().await.is_some() {
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while changes.try_recv().is_ok() {}

        if state.is_shutting_down() {
            break;
        }
        info!(path = %path.display(), "Config file changed, reloading");
        let _ = reload_routes(&state, &path).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
