use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tracing::{info, warn};
use uuid::Uuid;

use routewise_core::config::{AppConfig, EscalationConfig};
use routewise_core::escalation::{EscalationSettings, MIN_POLL_INTERVAL_SECS};
use routewise_db::{DbPool, SqlEscalationRepository, SqlSettingsRepository};

pub const WORKER_THREAD_NAME: &str = "escalation-worker";

/// Owns one escalation sweep loop. Ticks never overlap: the next sleep
/// starts only after the previous tick returned.
pub struct EscalationWorker {
    config: EscalationConfig,
    escalation: SqlEscalationRepository,
    settings: SqlSettingsRepository,
}

impl EscalationWorker {
    pub fn new(pool: DbPool, config: &AppConfig) -> Self {
        Self {
            config: config.escalation.clone(),
            escalation: SqlEscalationRepository::new(pool.clone(), config.workflow.engine()),
            settings: SqlSettingsRepository::new(pool),
        }
    }

    /// Runs one tick and returns how long to sleep before the next one.
    /// A failed tick keeps the normal cadence and is retried next time.
    pub async fn tick(&self) -> Duration {
        let correlation_id = format!("escalation-{}", Uuid::new_v4());
        if let Err(error) = self.escalation.run_tick(&self.config, Utc::now(), &correlation_id).await
        {
            warn!(
                event_name = "escalation.worker.tick_error",
                correlation_id = %correlation_id,
                error = %error,
                "escalation tick returned an error"
            );
        }
        self.poll_interval().await
    }

    async fn poll_interval(&self) -> Duration {
        match self.settings.all().await {
            Ok(stored) => EscalationSettings::resolve(&stored, &self.config).poll_interval(),
            Err(_) => Duration::from_secs(self.config.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS)),
        }
    }

    async fn run(self) {
        loop {
            let delay = self.tick().await;
            tokio::time::sleep(delay).await;
        }
    }
}

/// Starts the sweep loop on its own OS thread, driven by the caller's
/// runtime. Returns `None` when escalation is disabled.
pub fn spawn(pool: DbPool, config: &AppConfig) -> io::Result<Option<JoinHandle<()>>> {
    if !config.escalation.enabled {
        info!(
            event_name = "escalation.worker.disabled",
            correlation_id = "bootstrap",
            "escalation worker disabled by configuration"
        );
        return Ok(None);
    }

    let worker = EscalationWorker::new(pool, config);
    let handle = Handle::current();
    let thread = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || handle.block_on(worker.run()))?;

    info!(
        event_name = "escalation.worker.started",
        correlation_id = "bootstrap",
        poll_interval_secs = config.escalation.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS),
        throttle_secs = config.escalation.throttle_secs,
        "escalation worker thread started"
    );
    Ok(Some(thread))
}
