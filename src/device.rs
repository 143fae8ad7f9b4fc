//! Device identity and runtime eligibility signals.
//!
//! The dispatcher consults an [`EligibilityPolicy`] against the latest
//! [`PowerStatus`] before every tick. Power readings come from a
//! [`PowerSource`]; unknown readings never pause dispatch.

use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::BlobStore;

/// Key the device identifier is persisted under.
pub const DEVICE_ID_KEY: &str = "eco_device_id";

/// Load the persisted device identifier, creating and storing one on first use.
pub async fn load_or_create_device_id(blobs: &dyn BlobStore) -> Result<String, StoreError> {
    if let Some(existing) = blobs.get(DEVICE_ID_KEY).await? {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let device_id = Uuid::new_v4().to_string();
    blobs.set(DEVICE_ID_KEY, &device_id).await?;
    info!(device_id = %device_id, "Generated new device identifier");
    Ok(device_id)
}

/// Latest power reading. `None` means the platform could not report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerStatus {
    /// Battery charge in percent.
    pub battery_level: Option<u8>,
    pub charging: Option<bool>,
}

/// Source of power readings, sampled once per dispatch tick.
pub trait PowerSource: Send + Sync {
    fn status(&self) -> PowerStatus;
}

/// Power source whose reading is set by the host (battery events, tests).
#[derive(Debug, Default)]
pub struct ManualPower {
    status: RwLock<PowerStatus>,
}

impl ManualPower {
    pub fn new(status: PowerStatus) -> Arc<Self> {
        Arc::new(Self {
            status: RwLock::new(status),
        })
    }

    /// A device that cannot report battery state.
    pub fn unknown() -> Arc<Self> {
        Self::new(PowerStatus::default())
    }

    pub fn set_battery_level(&self, level: Option<u8>) {
        self.update(|s| s.battery_level = level.map(|l| l.min(100)));
    }

    pub fn set_charging(&self, charging: Option<bool>) {
        self.update(|s| s.charging = charging);
    }

    fn update(&self, f: impl FnOnce(&mut PowerStatus)) {
        match self.status.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => {
                warn!("Power status lock poisoned, recovering");
                f(&mut poisoned.into_inner());
            }
        }
    }
}

impl PowerSource for ManualPower {
    fn status(&self) -> PowerStatus {
        match self.status.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Why a tick was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    NotCharging,
    BatteryBelowMinimum { level: u8, minimum: u8 },
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCharging => write!(f, "not charging"),
            Self::BatteryBelowMinimum { level, minimum } => {
                write!(f, "battery {level}% below min {minimum}%")
            }
        }
    }
}

/// Power-based gate applied at the start of every dispatch tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EligibilityPolicy {
    pub require_charging: bool,
    /// Minimum battery percentage; 0 disables the check.
    pub min_battery: u8,
}

impl EligibilityPolicy {
    /// `Ok(())` when the device may take work, otherwise the reason it may not.
    pub fn check(&self, status: PowerStatus) -> Result<(), PauseReason> {
        if self.require_charging && status.charging == Some(false) {
            return Err(PauseReason::NotCharging);
        }
        if self.min_battery > 0 {
            if let Some(level) = status.battery_level {
                if level < self.min_battery {
                    return Err(PauseReason::BatteryBelowMinimum {
                        level,
                        minimum: self.min_battery,
                    });
                }
            }
        }
        Ok(())
    }
}
