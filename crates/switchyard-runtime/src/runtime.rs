//! Process-level orchestration around a [`Router`].
//!
//! The runtime owns the loaded configuration, initializes logging from it
//! and builds the router. Transport adapters take a clone of
//! [`SwitchyardRuntime::router`] and feed it envelopes; the runtime only
//! decides when the process stops.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use switchyard_runtime::SwitchyardRuntime;
//!
//! // Auto-loads switchyard.toml / switchyard.yaml from the current directory
//! let runtime = SwitchyardRuntime::new();
//!
//! runtime.router().register_procedure("math.add", add, HandlerMeta::default())?;
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use switchyard_core::{DeliveryStore, Router};

use crate::config::{ConfigLoader, SwitchyardConfig};
use crate::error::RuntimeResult;
use crate::logging;

/// Owns the configuration and router of a Switchyard process.
///
/// ```rust,ignore
/// let runtime = SwitchyardRuntime::builder()
///     .config_file("config/switchyard.toml")
///     .profile("production")
///     .trace(true)
///     .build()?;
///
/// runtime.run_until(shutdown_rx).await?;
/// ```
pub struct SwitchyardRuntime {
    config: SwitchyardConfig,
    router: Router,
    running: Arc<RwLock<bool>>,
}

impl SwitchyardRuntime {
    /// Creates a runtime from the configuration found in the current
    /// directory, falling back to defaults when it cannot be loaded.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                // Logging is not initialized yet.
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                SwitchyardConfig::default()
            });

        Self::from_config(&config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration.
    pub fn from_config(config: &SwitchyardConfig) -> Self {
        Self::with_router(config, Router::new(config.router_config()))
    }

    fn with_router(config: &SwitchyardConfig, router: Router) -> Self {
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            registry_mode = ?config.registry.mode,
            high_water_mark = config.streams.high_water_mark,
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            router,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &SwitchyardConfig {
        &self.config
    }

    /// The router. Clones share registrations, interceptors and streams.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Marks the runtime as running.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            warn!("Runtime is already running");
            return;
        }
        *running = true;

        let stats = self.router.stats();
        info!(
            procedures = stats.procedures,
            streams = stats.streams,
            events = stats.events,
            interceptors = self.router.interceptor_count(),
            "Switchyard runtime started"
        );
    }

    /// Cancels live streams and stops event delivery.
    pub async fn shutdown(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                debug!("Runtime is not running");
                return;
            }
            *running = false;
        }

        info!("Stopping Switchyard runtime");
        self.router.shutdown().await;
        info!("Runtime stopped");
    }

    /// Runs until Ctrl+C (or SIGTERM on unix), then shuts down.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await;
        info!("Switchyard runtime is now running. Press Ctrl+C to stop.");

        let signal = wait_for_shutdown().await;
        self.shutdown().await;
        signal
    }

    /// Runs until `shutdown` resolves, then shuts down.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await;
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }
}

impl Default for SwitchyardRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`SwitchyardRuntime`] with custom configuration sources.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    store: Option<Arc<dyn DeliveryStore>>,
    trace: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            store: None,
            trace: false,
        }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges a configuration on top of every other source.
    pub fn merge(mut self, config: SwitchyardConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Persists retry state and deduplication marks in `store` instead of
    /// process memory.
    pub fn delivery_store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Installs the tracing interceptor as the outermost interceptor.
    pub fn trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    pub fn build(self) -> RuntimeResult<SwitchyardRuntime> {
        let config = self.config_loader.load()?;
        let router = match self.store {
            Some(store) => Router::with_store(config.router_config(), store),
            None => Router::new(config.router_config()),
        };
        if self.trace {
            router.use_interceptor(switchyard_framework::trace());
        }
        Ok(SwitchyardRuntime::with_router(&config, router))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{
        Context, Envelope, EnvelopeType, HandlerMeta, MemoryDeliveryStore, RegistryMode, RpcError,
        Value,
    };

    fn quiet_config() -> SwitchyardConfig {
        let mut config = SwitchyardConfig::default();
        config.registry.mode = RegistryMode::Strict;
        config
    }

    #[tokio::test]
    async fn test_router_follows_config() {
        let runtime = SwitchyardRuntime::from_config(&quiet_config());
        let router = runtime.router();
        let add = |_payload: Value, _ctx: Context| async move { Ok::<_, RpcError>(Value::Null) };

        router.register_procedure("x", add, HandlerMeta::default()).unwrap();
        let duplicate = router.register_procedure("x", add, HandlerMeta::default());
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_run_until_shuts_router_down() {
        let runtime = SwitchyardRuntime::from_config(&quiet_config());
        assert!(!runtime.is_running().await);

        runtime.run_until(async {}).await.unwrap();

        assert!(!runtime.is_running().await);
        assert!(runtime.router().delivery().is_stopped());
    }

    #[tokio::test]
    async fn test_builder_installs_trace_and_store() {
        let store = Arc::new(MemoryDeliveryStore::new());
        let runtime = SwitchyardRuntime::builder()
            .search_path(std::env::temp_dir().join("switchyard-runtime-test-empty"))
            .without_env()
            .merge(quiet_config())
            .delivery_store(store)
            .trace(true)
            .build()
            .unwrap();

        assert_eq!(runtime.router().interceptor_count(), 1);
        assert_eq!(runtime.config().registry.mode, RegistryMode::Strict);

        let reply = runtime
            .router()
            .dispatch(Envelope::request("missing", Value::Null))
            .await
            .into_response()
            .unwrap();
        assert_eq!(reply.kind(), EnvelopeType::Error);
    }
}
