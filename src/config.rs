//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on the number of execution units in the pool.
pub const MAX_POOL_SIZE: usize = 6;

/// How many assignments a single dispatch tick may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// At most one assignment per tick, however many slots are free.
    #[default]
    OnePerTick,
    /// Keep assigning until every free slot is busy or no work is left.
    FillFreeSlots,
}

impl std::str::FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one" | "one_per_tick" => Ok(Self::OnePerTick),
            "fill" | "fill_free_slots" => Ok(Self::FillFreeSlots),
            other => Err(ConfigError::InvalidValue {
                key: "ECOCOMPUTE_DISPATCH_MODE".to_string(),
                message: format!("expected `one` or `fill`, got `{other}`"),
            }),
        }
    }
}

/// Provider-side configuration for a sharing session.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Period of the dispatch tick.
    pub dispatch_interval: Duration,
    /// How long an assignment may run before it is reclaimed.
    pub task_timeout: Duration,
    /// Attempt budget stamped on newly split microtasks.
    pub max_attempts: u32,
    /// Number of execution units.
    pub pool_size: usize,
    /// Lower bound of the artificial per-task latency.
    pub latency_min: Duration,
    /// Upper bound of the artificial per-task latency.
    pub latency_max: Duration,
    /// Assignments allowed per tick.
    pub dispatch_mode: DispatchMode,
    /// Only take work while the device is charging.
    pub require_charging: bool,
    /// Minimum battery percentage required to take work (0 disables).
    pub min_battery: u8,
    /// Path of the local libSQL database backing the shared store.
    pub db_path: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(20),
            max_attempts: 3,
            pool_size: default_pool_size(),
            latency_min: Duration::from_millis(200),
            latency_max: Duration::from_millis(800),
            dispatch_mode: DispatchMode::OnePerTick,
            require_charging: false,
            min_battery: 0,
            db_path: PathBuf::from("./data/ecocompute.db"),
        }
    }
}

impl ProviderConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let dispatch_mode = match std::env::var("ECOCOMPUTE_DISPATCH_MODE") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.dispatch_mode,
        };

        let latency_min = env_millis("ECOCOMPUTE_LATENCY_MIN_MS").unwrap_or(defaults.latency_min);
        let latency_max = env_millis("ECOCOMPUTE_LATENCY_MAX_MS").unwrap_or(defaults.latency_max);
        if latency_min > latency_max {
            return Err(ConfigError::InvalidValue {
                key: "ECOCOMPUTE_LATENCY_MIN_MS".to_string(),
                message: format!("{latency_min:?} exceeds maximum latency {latency_max:?}"),
            });
        }

        let min_battery: u8 = env_parse("ECOCOMPUTE_MIN_BATTERY").unwrap_or(defaults.min_battery);
        if min_battery > 100 {
            return Err(ConfigError::InvalidValue {
                key: "ECOCOMPUTE_MIN_BATTERY".to_string(),
                message: format!("{min_battery} is not a percentage"),
            });
        }

        Ok(Self {
            dispatch_interval: env_millis("ECOCOMPUTE_DISPATCH_INTERVAL_MS")
                .unwrap_or(defaults.dispatch_interval),
            task_timeout: env_millis("ECOCOMPUTE_TASK_TIMEOUT_MS").unwrap_or(defaults.task_timeout),
            max_attempts: env_parse::<u32>("ECOCOMPUTE_MAX_ATTEMPTS")
                .map(|n| n.max(1))
                .unwrap_or(defaults.max_attempts),
            pool_size: env_parse::<usize>("ECOCOMPUTE_POOL_SIZE")
                .map(|n| n.clamp(1, MAX_POOL_SIZE))
                .unwrap_or(defaults.pool_size),
            latency_min,
            latency_max,
            dispatch_mode,
            require_charging: std::env::var("ECOCOMPUTE_REQUIRE_CHARGING")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(defaults.require_charging),
            min_battery,
            db_path: std::env::var("ECOCOMPUTE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
        })
    }
}

/// Pool size derived from the host: one unit per core minus one for the
/// coordinator, between 1 and [`MAX_POOL_SIZE`].
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    pool_size_for(cores)
}

/// Pool size for a given core count.
pub fn pool_size_for(cores: usize) -> usize {
    cores.saturating_sub(1).clamp(1, MAX_POOL_SIZE)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
