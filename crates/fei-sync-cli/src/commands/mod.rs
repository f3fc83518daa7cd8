pub mod push;
pub mod status;
pub mod sync;
pub mod watch;

use anyhow::{Context, Result};
use colored::Colorize;
use fei_sync::{
    CacheStore, ConnectivityMonitor, ConnectivityProbe, HttpApi, RemoteApi, StepOutcome,
    SyncEngine, SyncReport, SyncSettings, Transition,
};
use std::sync::Arc;

/// Everything a command needs, wired from the settings
pub struct Session {
    pub engine: SyncEngine,
    pub probe: ConnectivityProbe,
}

impl Session {
    /// Open the cache and build the engine. Connectivity starts unknown
    /// (offline) until [`Session::check_connection`] runs.
    pub async fn open(settings: &SyncSettings) -> Result<Self> {
        let store = CacheStore::from_backend(&settings.store)
            .await
            .context("opening local cache")?;
        let api: Arc<dyn RemoteApi> =
            Arc::new(HttpApi::new(&settings.api).context("building HTTP client")?);
        let monitor = ConnectivityMonitor::new(None);

        let probe = ConnectivityProbe::new(
            monitor.clone(),
            api.clone(),
            settings.sync.probe_interval(),
            settings.sync.probe_timeout(),
        );
        let engine = SyncEngine::new(store, api, monitor, settings.sync.clone());

        Ok(Self { engine, probe })
    }

    pub async fn check_connection(&self) -> bool {
        if self.probe.probe_once().await == Transition::BecameOnline {
            println!("{} {}", "●".green(), "server reachable".green());
        }
        if !self.engine.monitor().is_online() {
            println!("{} {}", "●".red(), "server unreachable, working offline".yellow());
        }
        self.engine.monitor().is_online()
    }
}

pub fn print_report(report: &SyncReport) {
    for (target, outcome) in &report.steps {
        let line = match outcome {
            StepOutcome::Synced { fetched, kept, mark } => {
                let mark = mark
                    .map(|m| m.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                format!("fetched {fetched}, cached {kept}, mark {mark}").normal()
            }
            StepOutcome::Pushed { pushed, remaining } => {
                format!("pushed {pushed}, {remaining} left in queue").normal()
            }
            StepOutcome::SkippedOffline => "skipped (offline)".yellow(),
            StepOutcome::Failed(reason) => format!("failed: {reason}").red(),
        };
        println!("  {:<26} {}", target.to_string().cyan(), line);
    }
}
