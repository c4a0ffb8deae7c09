//! "Today" energy accounting from the inverter's lifetime grid counters.
//!
//! The inverter only exposes cumulative import/export totals, so the start of
//! day totals are checkpointed to durable storage and subtracted.

use crate::store::KeyValueStore;
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

/// Storage key of the checkpoint.
pub const CHECKPOINT_KEY: &str = "dailyEnergy";
/// Day of a checkpoint that was never reset.
pub const UNINITIALIZED_DAY: i32 = -1;

/// Lifetime grid counters in kWh.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyTotals {
    pub total_import_kwh: f64,
    pub total_export_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyEnergyCheckpoint {
    /// Days since the common era, [`UNINITIALIZED_DAY`] before the first reset.
    pub day: i32,
    /// Seconds of the day that passed before tracking started.
    pub missed_seconds: u32,
    pub start: EnergyTotals,
    pub now: EnergyTotals,
}

impl DailyEnergyCheckpoint {
    pub fn uninitialized() -> Self {
        Self {
            day: UNINITIALIZED_DAY,
            missed_seconds: 0,
            start: EnergyTotals::default(),
            now: EnergyTotals::default(),
        }
    }

    pub fn today_import_kwh(&self) -> f64 {
        self.now.total_import_kwh - self.start.total_import_kwh
    }

    pub fn today_export_kwh(&self) -> f64 {
        self.now.total_export_kwh - self.start.total_export_kwh
    }
}

/// Today's energy flow in kWh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyToday {
    pub production: f64,
    pub import: f64,
    pub export: f64,
    pub consumption: f64,
}

/// Day number used by checkpoints.
pub fn day_number(now: &NaiveDateTime) -> i32 {
    now.date().num_days_from_ce()
}

pub struct DailyEnergyTracker {
    store: Box<dyn KeyValueStore>,
    checkpoint: DailyEnergyCheckpoint,
}

impl DailyEnergyTracker {
    /// Restores the checkpoint from `store`, falling back to an
    /// uninitialized one when it is missing or unreadable.
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        let checkpoint = match store.get(CHECKPOINT_KEY) {
            Ok(Some(record)) => match serde_json::from_value(record) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!("Discarding unreadable daily energy checkpoint: {e}");
                    DailyEnergyCheckpoint::uninitialized()
                }
            },
            Ok(None) => DailyEnergyCheckpoint::uninitialized(),
            Err(e) => {
                warn!("Could not load daily energy checkpoint: {e:#}");
                DailyEnergyCheckpoint::uninitialized()
            }
        };
        Self { store, checkpoint }
    }

    /// Records the latest lifetime totals, starting a new day when the
    /// calendar day of `now` differs from the checkpoint's.
    pub fn observe(&mut self, now: NaiveDateTime, totals: EnergyTotals) -> &DailyEnergyCheckpoint {
        let today = day_number(&now);
        if today != self.checkpoint.day {
            self.checkpoint = DailyEnergyCheckpoint {
                day: today,
                missed_seconds: now.num_seconds_from_midnight(),
                start: totals,
                now: totals,
            };
            info!(
                "Starting daily energy tracking for {}, {} s of the day missed",
                now.date(),
                self.checkpoint.missed_seconds
            );
            self.persist();
        } else {
            self.checkpoint.now = totals;
        }
        &self.checkpoint
    }

    fn persist(&mut self) {
        let record = match serde_json::to_value(&self.checkpoint) {
            Ok(record) => record,
            Err(e) => {
                warn!("Could not serialize daily energy checkpoint: {e}");
                return;
            }
        };
        if let Err(e) = self.store.set(CHECKPOINT_KEY, record) {
            warn!("Could not persist daily energy checkpoint: {e:#}");
        }
    }

    pub fn checkpoint(&self) -> &DailyEnergyCheckpoint {
        &self.checkpoint
    }

    /// Today's flows, `production_kwh` coming from the inverter's daily yield.
    pub fn today(&self, production_kwh: f64) -> EnergyToday {
        let import = self.checkpoint.today_import_kwh();
        let export = self.checkpoint.today_export_kwh();
        EnergyToday {
            production: production_kwh,
            import,
            export,
            consumption: import + production_kwh - export,
        }
    }
}
