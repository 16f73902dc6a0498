//! Cached UPS telemetry and the values derived from it.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::nut::UpsReading;

/// Charge below this percentage raises the low-battery flag
pub const LOW_BATTERY_THRESHOLD: i64 = 20;

/// Smallest load value handed to the load sensor.
///
/// Relative-humidity characteristics reject an exact zero, so an idle UPS is
/// reported as this negligible value instead.
pub const LOAD_FLOOR: f64 = 0.0001;

/// Latest known UPS values
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Battery charge in percent
    pub charge: i64,
    /// Estimated runtime on battery
    pub runtime_seconds: u64,
    /// Output load in percent
    pub load_percent: f64,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            charge: 100,
            runtime_seconds: 0,
            load_percent: 0.0,
        }
    }
}

impl TelemetrySnapshot {
    /// Overwrite the fields present in `reading`, keep the rest.
    pub fn apply(&mut self, reading: &UpsReading) {
        if let Some(charge) = reading.charge {
            self.charge = charge;
        }
        if let Some(runtime) = reading.runtime_seconds {
            self.runtime_seconds = runtime;
        }
        if let Some(load) = reading.load_percent {
            self.load_percent = load;
        }
    }

    pub fn is_low_battery(&self) -> bool {
        is_low_battery(self.charge)
    }

    pub fn published_load(&self) -> f64 {
        floor_load(self.load_percent)
    }
}

pub fn is_low_battery(charge: i64) -> bool {
    charge < LOW_BATTERY_THRESHOLD
}

pub fn floor_load(load: f64) -> f64 {
    load.max(LOAD_FLOOR)
}

/// Snapshot handle shared between the refresh loop and host getters
#[derive(Debug, Clone, Default)]
pub struct SharedTelemetry {
    inner: Arc<Mutex<TelemetrySnapshot>>,
}

impl SharedTelemetry {
    pub fn new(initial: TelemetrySnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Copy of the current values
    pub fn get(&self) -> TelemetrySnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn apply(&self, reading: &UpsReading) -> TelemetrySnapshot {
        let mut snapshot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.apply(reading);
        *snapshot
    }

    pub fn charge(&self) -> i64 {
        self.get().charge
    }

    pub fn runtime_seconds(&self) -> u64 {
        self.get().runtime_seconds
    }

    pub fn low_battery(&self) -> bool {
        self.get().is_low_battery()
    }

    pub fn published_load(&self) -> f64 {
        self.get().published_load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let snapshot = TelemetrySnapshot::default();
        assert_eq!(snapshot.charge, 100);
        assert_eq!(snapshot.runtime_seconds, 0);
        assert_eq!(snapshot.load_percent, 0.0);
        assert!(!snapshot.is_low_battery());
    }

    #[test]
    fn test_low_battery_boundary() {
        for charge in 0..=100 {
            assert_eq!(is_low_battery(charge), charge < 20, "charge {}", charge);
        }
    }

    #[test]
    fn test_load_floor() {
        assert_eq!(floor_load(0.0), LOAD_FLOOR);
        assert_eq!(floor_load(-12.0), LOAD_FLOOR);
        assert_eq!(floor_load(14.5), 14.5);
        assert!(floor_load(0.00001) >= LOAD_FLOOR);
    }

    #[test]
    fn test_apply_keeps_missing_fields() {
        let mut snapshot = TelemetrySnapshot {
            charge: 90,
            runtime_seconds: 1800,
            load_percent: 22.0,
        };
        snapshot.apply(&UpsReading {
            charge: Some(15),
            ..Default::default()
        });
        assert_eq!(snapshot.charge, 15);
        assert_eq!(snapshot.runtime_seconds, 1800);
        assert_eq!(snapshot.load_percent, 22.0);
        assert!(snapshot.is_low_battery());
    }

    #[test]
    fn test_shared_handle_sees_updates() {
        let shared = SharedTelemetry::default();
        let reader = shared.clone();
        shared.apply(&UpsReading {
            charge: Some(64),
            runtime_seconds: Some(900),
            load_percent: Some(0.0),
        });
        assert_eq!(reader.charge(), 64);
        assert_eq!(reader.runtime_seconds(), 900);
        assert_eq!(reader.published_load(), LOAD_FLOOR);
    }
}
