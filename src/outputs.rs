//! Values published to the smart home bridge.
//!
//! The set of outputs is closed: every output has a static definition with
//! its unit and bounds, and the bridge maps them onto its own schema.

use crate::measurement::Field;
use crate::signals::SignalId;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::{debug, info, warn};

// 230 V is expected, the safety threshold is 250 V at 40 A.
pub const MAX_VOLTS: f64 = 250.0;
pub const MAX_AMPERES: f64 = 40.0;
pub const MAX_WATTS: f64 = MAX_VOLTS * MAX_AMPERES;
pub const MAX_KILOWATT_HOURS: f64 = 65535.0;

pub const MANUFACTURER: &str = "SMA Solar Technology AG";
pub const MODEL: &str = "Sunny Boy & SMA Home Manager 2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Live,
    Recent,
    Today,
}

impl Group {
    pub const ALL: [Group; 3] = [Group::Live, Group::Recent, Group::Today];

    fn name(&self) -> &'static str {
        match self {
            Group::Live => "live",
            Group::Recent => "recent",
            Group::Today => "today",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    /// Watts for the live and recent groups, kWh for today.
    Flow(Group, Field),
    SelfSufficiency(Group),
    /// Smoothed net grid power, positive while importing.
    GridTrend,
    InverterActive,
    InverterFault,
    InverterAmperes,
    InverterVolts,
    SignalActive(SignalId),
    SignalReason(SignalId),
    HighImportAverage,
    Manufacturer,
    Model,
    SerialNumbers,
    FirmwareRevisions,
}

/// Static description of an output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDefinition {
    pub id: String,
    pub unit: Option<&'static str>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
}

impl OutputDefinition {
    fn plain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unit: None,
            min: None,
            max: None,
            step: None,
        }
    }

    fn numeric(id: impl Into<String>, unit: &'static str, min: f64, max: f64, step: f64) -> Self {
        Self {
            id: id.into(),
            unit: Some(unit),
            min: Some(min),
            max: Some(max),
            step: Some(step),
        }
    }
}

impl Output {
    pub fn definition(&self) -> OutputDefinition {
        match self {
            Output::Flow(Group::Today, field) => OutputDefinition::numeric(
                format!("today.{}", field.name()),
                "kWh",
                0.0,
                MAX_KILOWATT_HOURS,
                0.001,
            ),
            Output::Flow(group, field) => OutputDefinition::numeric(
                format!("{}.{}", group.name(), field.name()),
                "W",
                0.0,
                MAX_WATTS,
                0.1,
            ),
            Output::SelfSufficiency(group) => OutputDefinition::numeric(
                format!("{}.self_sufficiency", group.name()),
                "%",
                -100.0,
                1000.0,
                0.1,
            ),
            Output::GridTrend => {
                OutputDefinition::numeric("live.grid_trend", "W", -MAX_WATTS, MAX_WATTS, 0.1)
            }
            Output::InverterActive => OutputDefinition::plain("inverter.active"),
            Output::InverterFault => OutputDefinition::plain("inverter.fault"),
            Output::InverterAmperes => {
                OutputDefinition::numeric("inverter.amperes", "A", 0.0, MAX_AMPERES, 0.01)
            }
            Output::InverterVolts => {
                OutputDefinition::numeric("inverter.volts", "V", 0.0, MAX_VOLTS, 0.1)
            }
            Output::SignalActive(id) => {
                OutputDefinition::plain(format!("{}.active", signal_id(id)))
            }
            Output::SignalReason(id) => {
                OutputDefinition::plain(format!("{}.reason", signal_id(id)))
            }
            Output::HighImportAverage => OutputDefinition::numeric(
                "signal.high_import.average",
                "W",
                0.0,
                MAX_WATTS,
                100.0,
            ),
            Output::Manufacturer => OutputDefinition::plain("info.manufacturer"),
            Output::Model => OutputDefinition::plain("info.model"),
            Output::SerialNumbers => OutputDefinition::plain("info.serial_numbers"),
            Output::FirmwareRevisions => OutputDefinition::plain("info.firmware_revisions"),
        }
    }
}

fn signal_id(id: &SignalId) -> String {
    match id {
        SignalId::OffGrid => "signal.off_grid".to_string(),
        SignalId::NoSun => "signal.no_sun".to_string(),
        SignalId::HighImport => "signal.high_import".to_string(),
        SignalId::Surplus(index) => format!("signal.surplus.{index}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Number(f64),
    Flag(bool),
    Text(String),
    /// The source of the value is gone.
    Unavailable,
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Number(value) => write!(f, "{value:.3}"),
            OutputValue::Flag(value) => write!(f, "{value}"),
            OutputValue::Text(value) => write!(f, "{value:?}"),
            OutputValue::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// The bridge side. Implementations must not block.
pub trait Publisher: Send {
    fn update(&mut self, output: Output, value: OutputValue);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub output: Output,
    pub value: OutputValue,
}

/// Forwards publications into a bounded channel, dropping them when the
/// consumer falls behind.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: Sender<Publication>,
}

impl ChannelPublisher {
    pub fn new(buffer: usize) -> (Self, Receiver<Publication>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self { sender }, receiver)
    }
}

impl Publisher for ChannelPublisher {
    fn update(&mut self, output: Output, value: OutputValue) {
        match self.sender.try_send(Publication { output, value }) {
            Ok(()) => {}
            Err(TrySendError::Full(publication)) => {
                warn!(
                    "Publication queue full, dropping {}",
                    publication.output.definition().id
                );
            }
            Err(TrySendError::Closed(_)) => debug!("Publication queue closed"),
        }
    }
}

/// Remembers the last published value per output and only forwards changes.
pub struct PublishedValues<P> {
    publisher: P,
    last: HashMap<Output, OutputValue>,
}

impl<P: Publisher> PublishedValues<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            publisher,
            last: HashMap::new(),
        }
    }

    /// Returns whether the value was forwarded.
    pub fn publish(&mut self, output: Output, value: OutputValue) -> bool {
        if self.last.get(&output) == Some(&value) {
            return false;
        }
        self.last.insert(output, value.clone());
        self.publisher.update(output, value);
        true
    }

    pub fn number(&mut self, output: Output, value: f64) -> bool {
        self.publish(output, OutputValue::Number(value))
    }

    pub fn flag(&mut self, output: Output, value: bool) -> bool {
        self.publish(output, OutputValue::Flag(value))
    }

    pub fn text(&mut self, output: Output, value: impl Into<String>) -> bool {
        self.publish(output, OutputValue::Text(value.into()))
    }

    pub fn last(&self, output: &Output) -> Option<&OutputValue> {
        self.last.get(output)
    }
}

/// Logs every publication; stands in for a bridge.
pub async fn log_publications(mut publications: Receiver<Publication>) {
    info!("Starting publication log");
    while let Some(Publication { output, value }) = publications.recv().await {
        info!("{} = {value}", output.definition().id);
    }
    info!("Publication log exiting");
}
