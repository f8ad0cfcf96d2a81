//! Shared daemon state passed to every subsystem.

use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use hb_domain::agent::Provider;
use hb_domain::time::{parse_tz, TimestampMs};
use hb_providers::ProviderDriver;
use hb_store::Store;

use crate::paths::DataDir;
use crate::runtime::bridge::Bridge;
use crate::runtime::executor::ExecutorMap;

/// Constructs the driver for a provider; swapped for a mock in tests.
pub type DriverFactory = dyn Fn(Provider) -> Box<dyn ProviderDriver> + Send + Sync;

/// Shared application state. Cheap to clone; every field is a handle.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub data_dir: Arc<DataDir>,
    pub bridge: Arc<Bridge>,
    pub executors: Arc<ExecutorMap>,
    /// Poke to re-aim the scheduler's wake timer.
    pub scheduler: Arc<Notify>,
    /// Poke to re-evaluate cron schedules.
    pub materializer: Arc<Notify>,
    pub drivers: Arc<DriverFactory>,
    pub shutdown: CancellationToken,
    pub started_at: TimestampMs,
}

impl AppState {
    pub fn new(store: Arc<Store>, data_dir: DataDir, drivers: Arc<DriverFactory>) -> Self {
        AppState {
            store,
            data_dir: Arc::new(data_dir),
            bridge: Arc::new(Bridge::new()),
            executors: Arc::new(ExecutorMap::new()),
            scheduler: Arc::new(Notify::new()),
            materializer: Arc::new(Notify::new()),
            drivers,
            shutdown: CancellationToken::new(),
            started_at: hb_domain::time::now_ms(),
        }
    }

    /// Default factory spawning the real provider CLIs.
    pub fn default_drivers() -> Arc<DriverFactory> {
        Arc::new(hb_providers::driver_for)
    }

    /// The configured boss timezone, UTC when unset.
    pub fn boss_timezone(&self) -> Tz {
        self.store
            .get_config(hb_store::config_keys::BOSS_TIMEZONE)
            .ok()
            .flatten()
            .as_deref()
            .map(parse_tz)
            .unwrap_or(chrono_tz::UTC)
    }

    pub fn boss_name(&self) -> String {
        self.store
            .get_config(hb_store::config_keys::BOSS_NAME)
            .ok()
            .flatten()
            .unwrap_or_else(|| "boss".to_string())
    }
}
