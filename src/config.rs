use crate::inverter_reader::InverterSettings;
use crate::meter_listener::MeterSettings;
use crate::power_fusion::FusionSettings;
use crate::signals::{SignalConfig, SurplusSignalConfig};
use crate::speedwire;
use crate::sunny_boy;
use anyhow::{bail, Context};
use std::env;
use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub inverter_address: SocketAddr,
    pub inverter_unit_id: u8,
    pub poll_interval: Duration,
    pub totals_interval: Duration,
    pub recent_minutes: u32,
    pub signals: SignalConfig,
    pub state_file: PathBuf,
    pub meter_port: u16,
    pub meter_group: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Zero config thanks to the inverter's fixed link-local address.
            inverter_address: SocketAddr::from(([169, 254, 12, 3], 502)),
            inverter_unit_id: sunny_boy::DEFAULT_UNIT_ID,
            poll_interval: Duration::from_millis(1000),
            totals_interval: Duration::from_millis(60_000),
            recent_minutes: 3,
            signals: SignalConfig::default(),
            state_file: PathBuf::from("sma-power-flow-state.json"),
            meter_port: speedwire::SPEEDWIRE_PORT,
            meter_group: speedwire::MULTICAST_GROUP,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, using defaults for every
    /// variable it does not know.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();
        let signal_defaults = SignalConfig::default();

        let surplus = match lookup("SURPLUS_SIGNALS") {
            Some(json) if !json.trim().is_empty() => {
                serde_json::from_str::<Vec<SurplusSignalConfig>>(&json)
                    .context("SURPLUS_SIGNALS must be a JSON list of {label, minutes, watts}")?
            }
            _ => Vec::new(),
        };
        if let Some(signal) = surplus.iter().find(|s| s.minutes == 0) {
            bail!("Surplus signal {:?} needs at least one minute", signal.label);
        }

        Ok(Self {
            inverter_address: parse(&lookup, "INVERTER_ADDRESS", defaults.inverter_address)?,
            inverter_unit_id: parse(&lookup, "INVERTER_UNIT_ID", defaults.inverter_unit_id)?,
            poll_interval: interval(&lookup, "POLL_INTERVAL_MS", defaults.poll_interval)?,
            totals_interval: interval(&lookup, "TOTALS_INTERVAL_MS", defaults.totals_interval)?,
            recent_minutes: parse(&lookup, "RECENT_MINUTES", defaults.recent_minutes)?,
            signals: SignalConfig {
                off_grid: flag(&lookup, "SIGNAL_OFF_GRID", signal_defaults.off_grid)?,
                no_sun: flag(&lookup, "SIGNAL_NO_SUN", signal_defaults.no_sun)?,
                high_import: flag(&lookup, "SIGNAL_HIGH_IMPORT", signal_defaults.high_import)?,
                surplus,
                base_load_variability: parse(
                    &lookup,
                    "BASE_LOAD_VARIABILITY_W",
                    signal_defaults.base_load_variability,
                )?,
            },
            state_file: lookup("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            meter_port: parse(&lookup, "METER_PORT", defaults.meter_port)?,
            meter_group: parse(&lookup, "METER_GROUP", defaults.meter_group)?,
        })
    }

    pub fn inverter_settings(&self) -> InverterSettings {
        InverterSettings {
            address: self.inverter_address,
            unit_id: self.inverter_unit_id,
            poll_interval: self.poll_interval,
            totals_interval: self.totals_interval,
        }
    }

    pub fn meter_settings(&self) -> MeterSettings {
        MeterSettings {
            port: self.meter_port,
            group: Some(self.meter_group),
            ..MeterSettings::default()
        }
    }

    pub fn fusion_settings(&self) -> FusionSettings {
        FusionSettings {
            recent_window_seconds: self.recent_minutes as usize * 60,
            signals: self.signals.clone(),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key} {value:?}: {e}")),
        None => Ok(default),
    }
}

/// Milliseconds, at least one.
fn interval(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    let millis: u64 = parse(lookup, key, default.as_millis() as u64)?;
    if millis == 0 {
        bail!("{key} must be at least 1 ms");
    }
    Ok(Duration::from_millis(millis))
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => bail!("Invalid {key} {other:?}, expected true or false"),
    }
}
