//! Threshold signals evaluated against the measurement window on every
//! fusion step.

use crate::measurement::Field;
use crate::measurement_store::MeasurementStore;
use serde_derive::Deserialize;

pub const OFF_GRID_SECONDS: usize = 60;
pub const NO_SUN_SECONDS: usize = 15 * 60;
pub const HIGH_IMPORT_WINDOW_SECONDS: usize = 15 * 60;
pub const HIGH_IMPORT_WATTS: f64 = 2500.0;
const HIGH_IMPORT_ROUNDING_BELOW: f64 = 2000.0;

/// A user defined surplus signal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SurplusSignalConfig {
    pub label: String,
    pub minutes: u32,
    pub watts: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub off_grid: bool,
    pub no_sun: bool,
    pub high_import: bool,
    pub surplus: Vec<SurplusSignalConfig>,
    pub base_load_variability: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            off_grid: false,
            no_sun: false,
            high_import: false,
            surplus: Vec::new(),
            base_load_variability: 50.0,
        }
    }
}

impl SignalConfig {
    /// Samples needed by the longest configured window.
    pub fn longest_window_seconds(&self) -> usize {
        let surplus = self
            .surplus
            .iter()
            .map(|s| s.minutes as usize * 60)
            .max()
            .unwrap_or(0);
        let built_in = if self.no_sun || self.high_import {
            NO_SUN_SECONDS.max(HIGH_IMPORT_WINDOW_SECONDS)
        } else if self.off_grid {
            OFF_GRID_SECONDS
        } else {
            0
        };
        surplus.max(built_in)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalId {
    OffGrid,
    NoSun,
    HighImport,
    /// Index into the configured surplus list.
    Surplus(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalState {
    pub active: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
struct SurplusRule {
    label: String,
    minutes: u32,
    window: usize,
    watts: f64,
    /// Sum of the watts of every surplus signal configured before this one.
    prior_watts: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Signal {
    id: SignalId,
    label: String,
    state: SignalState,
}

pub struct SignalEngine {
    signals: Vec<Signal>,
    surplus: Vec<SurplusRule>,
    base_load_variability: f64,
    /// Day number production was last seen on.
    produced_on: Option<i32>,
    import_average: Option<f64>,
}

impl SignalEngine {
    pub fn new(config: &SignalConfig) -> Self {
        let mut signals = Vec::new();
        let mut add = |id, label: &str| {
            signals.push(Signal {
                id,
                label: label.to_string(),
                state: SignalState {
                    active: false,
                    reason: "Waiting for measurements".to_string(),
                },
            })
        };
        if config.off_grid {
            add(SignalId::OffGrid, "Off-grid");
        }
        if config.no_sun {
            add(SignalId::NoSun, "No sun");
        }
        if config.high_import {
            add(SignalId::HighImport, "High import");
        }

        let mut prior_watts = 0.0;
        let mut surplus = Vec::with_capacity(config.surplus.len());
        for (index, signal) in config.surplus.iter().enumerate() {
            add(SignalId::Surplus(index), &signal.label);
            surplus.push(SurplusRule {
                label: signal.label.clone(),
                minutes: signal.minutes,
                window: (signal.minutes as usize * 60).max(1),
                watts: signal.watts,
                prior_watts,
            });
            prior_watts += signal.watts;
        }

        Self {
            signals,
            surplus,
            base_load_variability: config.base_load_variability,
            produced_on: None,
            import_average: None,
        }
    }

    /// Re-evaluates every signal. `today` is the current day number.
    pub fn evaluate(&mut self, store: &MeasurementStore, today: i32) {
        if store.latest().is_some_and(|m| m.production > 0.0) {
            self.produced_on = Some(today);
        }
        let produced_today = self.produced_on == Some(today);

        for index in 0..self.signals.len() {
            let state = match self.signals[index].id {
                SignalId::OffGrid => Some(off_grid(store)),
                SignalId::NoSun => Some(no_sun(store, produced_today)),
                SignalId::HighImport => {
                    let average =
                        store.windowed_average(Field::Import, HIGH_IMPORT_WINDOW_SECONDS);
                    self.import_average = Some(average);
                    Some(high_import(average))
                }
                SignalId::Surplus(rule) => {
                    surplus(&self.surplus[rule], self.base_load_variability, store)
                }
            };
            let signal = &mut self.signals[index];
            match state {
                Some(state) => signal.state = state,
                // Not enough data yet: hold the previous on/off state.
                None => {
                    signal.state.reason = insufficient_data(&self.surplus, signal.id, store)
                }
            }
        }
    }

    pub fn states(&self) -> impl Iterator<Item = (SignalId, &SignalState)> + '_ {
        self.signals.iter().map(|s| (s.id, &s.state))
    }

    pub fn state(&self, id: SignalId) -> Option<&SignalState> {
        self.signals.iter().find(|s| s.id == id).map(|s| &s.state)
    }

    pub fn label(&self, id: SignalId) -> Option<&str> {
        self.signals
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.label.as_str())
    }

    /// 15 minute average import, rounded for publishing.
    pub fn published_import_average(&self) -> Option<f64> {
        self.import_average.map(round_import_average)
    }
}

fn off_grid(store: &MeasurementStore) -> SignalState {
    let seconds = store.seconds_since_last_positive(Field::Import);
    if seconds >= OFF_GRID_SECONDS {
        SignalState {
            active: true,
            reason: format!("No grid import for {seconds} s"),
        }
    } else {
        SignalState {
            active: false,
            reason: "Importing from the grid".to_string(),
        }
    }
}

fn no_sun(store: &MeasurementStore, produced_today: bool) -> SignalState {
    let seconds = store.seconds_since_last_positive(Field::Production);
    if seconds < NO_SUN_SECONDS {
        return SignalState {
            active: false,
            reason: "Producing".to_string(),
        };
    }
    let reason = if produced_today {
        format!("No production for {} min", seconds / 60)
    } else {
        "No production yet today".to_string()
    };
    SignalState {
        active: true,
        reason,
    }
}

fn high_import(average: f64) -> SignalState {
    SignalState {
        active: average > HIGH_IMPORT_WATTS,
        reason: format!(
            "Average import over 15 min is {:.0} W (threshold {HIGH_IMPORT_WATTS:.0} W)",
            average
        ),
    }
}

/// Rounds to the nearest 100 W below 2000 W to reduce publishing churn.
pub fn round_import_average(watts: f64) -> f64 {
    if watts < HIGH_IMPORT_ROUNDING_BELOW {
        (watts / 100.0).round() * 100.0
    } else {
        watts
    }
}

/// `None` while the window is not yet full.
fn surplus(rule: &SurplusRule, variability: f64, store: &MeasurementStore) -> Option<SignalState> {
    let mut samples = store.last_values(Field::Export, rule.window);
    if samples.len() < rule.window {
        return None;
    }
    let minimum = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let p90 = percentile_90(&mut samples);
    let threshold = rule.watts + variability + rule.prior_watts;

    let state = if minimum <= rule.watts {
        SignalState {
            active: false,
            reason: format!(
                "Export dropped to {minimum:.0} W within {} min, needs {:.0} W",
                rule.minutes, rule.watts
            ),
        }
    } else if p90 <= threshold {
        SignalState {
            active: false,
            reason: format!(
                "90th percentile export {p90:.0} W does not exceed {threshold:.0} W"
            ),
        }
    } else {
        SignalState {
            active: true,
            reason: format!(
                "Surplus for {}: at least {minimum:.0} W exported for {} min",
                rule.label, rule.minutes
            ),
        }
    };
    Some(state)
}

fn insufficient_data(rules: &[SurplusRule], id: SignalId, store: &MeasurementStore) -> String {
    let needed = match id {
        SignalId::Surplus(index) => rules[index].window,
        _ => 0,
    };
    format!(
        "Insufficient data ({} of {needed} s)",
        store.len().min(needed)
    )
}

/// Nearest-rank 90th percentile. Sorts `samples` in place.
pub fn percentile_90(samples: &mut [f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(f64::total_cmp);
    let rank = (0.9 * samples.len() as f64).ceil() as usize;
    samples[rank.saturating_sub(1)]
}
