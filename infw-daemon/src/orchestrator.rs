//! Composition root -- wiring, lifecycle management, and signal handling.
//!
//! The [`Orchestrator`] is the single owner of the firewall sync service.
//! It builds the engine configuration, creates the match-event channel and
//! statistics handle, and lazily spawns the [`SyncService`] on first use.
//!
//! # Run loop
//!
//! 1. Spawn the sync service and the SIGINT/SIGTERM teardown task
//! 2. Sync the rules file (startup sync)
//! 3. Spawn the event logger and statistics poller
//! 4. Re-sync the rules file on every SIGHUP
//! 5. On SIGINT/SIGTERM the teardown request goes through the same queue
//!    as sync requests, then background tasks stop and the worker drains

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio::task::JoinHandle;

use infw_core::config::InfwConfig;
use infw_engine::attach::{IfIndexResolver, InterfaceValidator};
use infw_engine::service::spawn_signal_teardown;
use infw_engine::{
    EngineBackendFactory, EngineConfig, EventSink, FirewallEvent, RuleStatistics,
    StatisticsHandle, SyncHandle, SyncReport, SyncService, Synchronizer, load_rules,
};

/// Upper bound on a single sync call as seen by the daemon.
///
/// The worker keeps running the request after a timeout; only the wait is abandoned.
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Interface validator and ifindex resolver pair used instead of sysfs.
type InterfaceHooks = (Arc<dyn InterfaceValidator>, Arc<dyn IfIndexResolver>);

/// The daemon composition root.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: InfwConfig,
    /// Engine configuration derived from `config`.
    engine_config: EngineConfig,
    /// Desired-state rules file.
    rules_path: PathBuf,
    /// Sync service, spawned on first use.
    service: OnceCell<SyncService>,
    /// Counter reader slot filled by the backend.
    statistics: StatisticsHandle,
    /// Match event channel (sender goes to the backend factory).
    event_tx: mpsc::Sender<FirewallEvent>,
    event_rx: Option<mpsc::Receiver<FirewallEvent>>,
    /// Replaces the sysfs validator/resolver (tests, containers without sysfs).
    interfaces: Option<InterfaceHooks>,
    /// Shutdown broadcast sender (signals all background tasks).
    shutdown_tx: broadcast::Sender<()>,
}

impl Orchestrator {
    /// Build the orchestrator from an already validated configuration.
    ///
    /// No kernel or external resource is touched until the first sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine configuration cannot be derived.
    pub fn build(config: InfwConfig) -> Result<Self> {
        let engine_config =
            EngineConfig::from_core(&config).context("invalid firewall configuration")?;

        infw_core::metrics::describe_all();

        let (event_tx, event_rx) = mpsc::channel(engine_config.event_channel_capacity);
        let (shutdown_tx, _) = broadcast::channel(4);

        tracing::info!(
            backend = config.firewall.backend.as_str(),
            default_action = %engine_config.default_action,
            rules_path = config.firewall.rules_path.as_str(),
            "orchestrator initialized"
        );

        Ok(Self {
            rules_path: PathBuf::from(&config.firewall.rules_path),
            config,
            engine_config,
            service: OnceCell::new(),
            statistics: StatisticsHandle::new(),
            event_tx,
            event_rx: Some(event_rx),
            interfaces: None,
            shutdown_tx,
        })
    }

    /// Use the given interface validator and ifindex resolver instead of sysfs.
    ///
    /// Must be called before the first sync.
    pub fn with_interfaces(
        mut self,
        validator: Arc<dyn InterfaceValidator>,
        resolver: Arc<dyn IfIndexResolver>,
    ) -> Self {
        self.interfaces = Some((validator, resolver));
        self
    }

    /// Whether the sync service has been spawned.
    pub fn is_started(&self) -> bool {
        self.service.initialized()
    }

    /// Handle to the sync service, spawning it on first call.
    pub async fn sync_handle(&self) -> SyncHandle {
        self.service
            .get_or_init(|| async { SyncService::spawn(self.synchronizer()) })
            .await
            .handle()
    }

    fn synchronizer(&self) -> Synchronizer {
        let mut factory = EngineBackendFactory::new(self.engine_config.clone())
            .statistics(self.statistics.clone())
            .events(EventSink {
                tx: self.event_tx.clone(),
                runtime: tokio::runtime::Handle::current(),
            });
        if let Some((validator, resolver)) = &self.interfaces {
            factory = factory.interfaces(Arc::clone(validator), Arc::clone(resolver));
        }
        tracing::debug!("sync service starting");
        Synchronizer::new(Box::new(factory))
    }

    /// Read the rules file and sync it.
    ///
    /// A missing rules file syncs an empty rule set.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules file is invalid, the sync fails, or the
    /// sync does not answer within the timeout.
    pub async fn sync_from_file(&self) -> Result<SyncReport> {
        let rules = load_rules(&self.rules_path)
            .await
            .with_context(|| format!("failed to load rules from {}", self.rules_path.display()))?;
        let handle = self.sync_handle().await;

        let report = tokio::time::timeout(SYNC_TIMEOUT, handle.sync_interface_rules(rules, false))
            .await
            .context("sync timed out")?
            .context("interface rule sync failed")?;
        Ok(report)
    }

    /// Remove every attachment and release the firewall instance.
    ///
    /// Returns `false` if no instance existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the teardown fails.
    pub async fn teardown(&self) -> Result<bool> {
        if !self.is_started() {
            return Ok(false);
        }
        let handle = self.sync_handle().await;
        handle.teardown().await.context("firewall teardown failed")
    }

    /// Start the sync service and enter the main loop.
    ///
    /// Blocks until SIGINT or SIGTERM has torn the firewall instance down.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed. Sync
    /// failures are logged and do not stop the daemon.
    pub async fn run(&mut self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let handle = self.sync_handle().await;
        let mut teardown_task =
            spawn_signal_teardown(handle).context("failed to install SIGINT/SIGTERM handlers")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        log_sync("startup", self.sync_from_file().await);

        let mut tasks = Vec::new();
        if let Some(event_rx) = self.event_rx.take() {
            tasks.push(spawn_event_logger(event_rx, self.shutdown_tx.subscribe()));
        }
        tasks.push(spawn_stats_poller(
            self.statistics.clone(),
            Duration::from_secs(self.config.firewall.stats_interval_secs),
            self.shutdown_tx.subscribe(),
        ));

        tracing::info!("entering main loop");
        let signal_result = loop {
            tokio::select! {
                biased;
                result = &mut teardown_task => break result,
                _ = sighup.recv() => {
                    tracing::info!(signal = "SIGHUP", "reloading rules file");
                    log_sync("reload", self.sync_from_file().await);
                }
            }
        };
        if let Err(e) = signal_result {
            tracing::error!(error = %e, "signal teardown task failed");
        }

        self.shutdown(tasks).await
    }

    /// Stop background tasks and wait for the sync worker to drain.
    async fn shutdown(&mut self, tasks: Vec<JoinHandle<()>>) -> Result<()> {
        // a reload queued behind the signal teardown may have re-created the instance
        match self.teardown().await {
            Ok(true) => tracing::warn!("instance re-created after teardown, released again"),
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "final teardown failed"),
        }

        tracing::info!("broadcasting shutdown signal to all tasks");
        let _ = self.shutdown_tx.send(());
        for task in tasks {
            let _ = task.await;
        }

        if let Some(service) = self.service.take() {
            service.join().await;
        }
        Ok(())
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &InfwConfig {
        &self.config
    }

    /// Statistics handle shared with the backend.
    pub fn statistics(&self) -> &StatisticsHandle {
        &self.statistics
    }
}

fn log_sync(trigger: &'static str, result: Result<SyncReport>) {
    match result {
        Ok(report) => tracing::info!(
            trigger,
            attached = ?report.attached,
            detached = ?report.detached,
            skipped = ?report.skipped,
            rules = report.rules_installed,
            "rules file synced"
        ),
        Err(e) => tracing::error!(trigger, error = %format!("{e:#}"), "rules file sync failed"),
    }
}

/// Spawn a background task that logs match events from the classifier.
fn spawn_event_logger(
    mut event_rx: mpsc::Receiver<FirewallEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            tracing::debug!(
                                ifindex = event.interface_index,
                                rule_id = event.rule_id,
                                action = %event.action,
                                src = %event.src,
                                len = event.pkt_len,
                                "match event"
                            );
                        }
                        None => {
                            tracing::debug!("event channel closed, exiting logger");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("event logger shutting down");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that polls per-rule counters.
///
/// Polling is skipped while no instance publishes counters; rates restart
/// from zero after the instance comes back.
fn spawn_stats_poller(
    statistics: StatisticsHandle,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rules = RuleStatistics::new();

        loop {
            tokio::select! {
                _ = interval.tick() => { poll_statistics(&statistics, &mut rules); }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("statistics poller shutting down");
                    break;
                }
            }
        }
    })
}

/// One statistics poll. Returns `true` if counters were read.
pub fn poll_statistics(statistics: &StatisticsHandle, rules: &mut RuleStatistics) -> bool {
    match statistics.read() {
        None => {
            rules.reset();
            false
        }
        Some(Ok(snapshot)) => {
            rules.update(snapshot);
            tracing::debug!(
                total_packets = rules.total_packets(),
                default_packets = rules.default_action().map_or(0, |m| m.packets),
                rules = rules.rules.len(),
                "rule statistics polled"
            );
            true
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "failed to read rule statistics");
            false
        }
    }
}
