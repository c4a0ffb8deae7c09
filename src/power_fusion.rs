use crate::daily_energy::{day_number, DailyEnergyTracker, EnergyTotals};
use crate::discovery_gate::{DeviceIdentity, DiscoveryGate, Identities};
use crate::inverter_reader::InverterEvent;
use crate::measurement::{Field, Measurement};
use crate::measurement_store::MeasurementStore;
use crate::outputs::{
    Group, Output, OutputValue, PublishedValues, Publisher, MANUFACTURER, MODEL,
};
use crate::running_average::RunningAverage;
use crate::signals::{SignalConfig, SignalEngine, SignalId, NO_SUN_SECONDS};
use chrono::{Local, NaiveDateTime};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Everything that may change fused state. Handled strictly in order.
#[derive(Debug, Clone, PartialEq)]
pub enum FusionEvent {
    MeterIdentity(DeviceIdentity),
    MeterSample { timestamp: f64, net_watts: f64 },
    MeterUnavailable,
    Inverter(InverterEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionSettings {
    pub recent_window_seconds: usize,
    pub signals: SignalConfig,
}

impl FusionSettings {
    /// Ring buffer size covering the recent window, the 15 minute built-in
    /// windows and every surplus window.
    pub fn capacity(&self) -> usize {
        self.recent_window_seconds
            .max(NO_SUN_SECONDS)
            .max(self.signals.longest_window_seconds())
    }
}

/// Single consumer of [`FusionEvent`]s and sole owner of the fused state.
pub struct PowerFusion<P> {
    gate: DiscoveryGate,
    store: MeasurementStore,
    tracker: DailyEnergyTracker,
    signals: SignalEngine,
    grid_trend: RunningAverage,
    outputs: PublishedValues<P>,
    recent_window_seconds: usize,
    latest_production: Option<f64>,
    production_today: Option<f64>,
    production_sender: watch::Sender<f64>,
}

impl<P: Publisher + 'static> PowerFusion<P> {
    /// Creates the fusion state. The returned receiver follows the production
    /// of the latest fused measurement.
    pub fn new(
        settings: FusionSettings,
        tracker: DailyEnergyTracker,
        publisher: P,
    ) -> (Self, watch::Receiver<f64>) {
        let (production_sender, production_receiver) = watch::channel(0.0);
        let recent_window_seconds = settings.recent_window_seconds.max(1);
        let fusion = Self {
            gate: DiscoveryGate::new(),
            store: MeasurementStore::new(settings.capacity()),
            tracker,
            signals: SignalEngine::new(&settings.signals),
            grid_trend: RunningAverage::new(recent_window_seconds as u32),
            outputs: PublishedValues::new(publisher),
            recent_window_seconds,
            latest_production: None,
            production_today: None,
            production_sender,
        };
        (fusion, production_receiver)
    }

    /// Spawns the event loop. Discovery is checked every `discovery_interval`.
    pub fn spawn(
        self,
        events: Receiver<FusionEvent>,
        discovery_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(events, discovery_interval).await;
        })
    }

    async fn run(mut self, mut events: Receiver<FusionEvent>, discovery_interval: Duration) {
        info!(
            "Starting power fusion, {} s ring buffer",
            self.store.capacity()
        );
        let mut discovery = interval(discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = discovery.tick(), if !self.gate.is_ready() => self.check_discovery(),
            }
        }
        info!("Power fusion exiting");
    }

    /// Applies one event. Runs to completion before the next one.
    pub fn handle(&mut self, event: FusionEvent) {
        match event {
            FusionEvent::MeterIdentity(identity) => self.gate.observe_meter(identity),
            FusionEvent::MeterSample {
                timestamp,
                net_watts,
            } => self.fuse(timestamp, net_watts),
            FusionEvent::MeterUnavailable => {
                if self.gate.is_ready() {
                    for field in [Field::Import, Field::Export] {
                        self.outputs
                            .publish(Output::Flow(Group::Live, field), OutputValue::Unavailable);
                    }
                }
            }
            FusionEvent::Inverter(event) => self.handle_inverter(event),
        }
    }

    /// One discovery cycle; publishes device information when both devices
    /// are first known.
    pub fn check_discovery(&mut self) {
        if let Some(identities) = self.gate.check() {
            info!("Discovery complete, publishing");
            self.publish_identities(&identities);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn store(&self) -> &MeasurementStore {
        &self.store
    }

    pub fn tracker(&self) -> &DailyEnergyTracker {
        &self.tracker
    }

    pub fn published(&self, output: &Output) -> Option<&OutputValue> {
        self.outputs.last(output)
    }

    fn publish_identities(&mut self, identities: &Identities) {
        self.outputs.text(Output::Manufacturer, MANUFACTURER);
        self.outputs.text(Output::Model, MODEL);
        self.outputs.text(
            Output::SerialNumbers,
            format!(
                "{} & {}",
                identities.inverter.serial_number, identities.meter.serial_number
            ),
        );
        self.outputs.text(
            Output::FirmwareRevisions,
            format!(
                "{} & {}",
                identities.inverter.firmware_revision, identities.meter.firmware_revision
            ),
        );
    }

    fn handle_inverter(&mut self, event: InverterEvent) {
        match event {
            InverterEvent::Identity(identity) => self.gate.observe_inverter(identity),
            InverterEvent::Production(watts) => self.latest_production = Some(watts),
            InverterEvent::Status(status) if self.gate.is_ready() => {
                self.outputs.flag(Output::InverterActive, status.active);
                self.outputs.flag(Output::InverterFault, status.fault);
            }
            InverterEvent::Amperes(amperes) if self.gate.is_ready() => {
                self.outputs.number(Output::InverterAmperes, amperes);
            }
            InverterEvent::Volts(volts) if self.gate.is_ready() => {
                self.outputs.number(Output::InverterVolts, volts);
            }
            InverterEvent::Totals {
                totals,
                production_today,
            } => self.track_energy(Local::now().naive_local(), totals, production_today),
            _ => debug!("Ignoring inverter reading before discovery completed"),
        }
    }

    /// Updates the daily checkpoint and the today group.
    pub fn track_energy(
        &mut self,
        now: NaiveDateTime,
        totals: EnergyTotals,
        production_today: Option<f64>,
    ) {
        if production_today.is_some() {
            self.production_today = production_today;
        }
        self.tracker.observe(now, totals);
        if !self.gate.is_ready() {
            return;
        }

        let today = self.tracker.today(self.production_today.unwrap_or(0.0));
        let flows = [
            (Field::Production, today.production),
            (Field::Import, today.import),
            (Field::Export, today.export),
            (Field::Consumption, today.consumption),
        ];
        for (field, kwh) in flows {
            self.outputs.number(Output::Flow(Group::Today, field), kwh);
        }
        let ratio = crate::measurement::self_sufficiency(
            today.production,
            today.import,
            today.export,
            today.consumption,
        );
        self.outputs
            .number(Output::SelfSufficiency(Group::Today), ratio);
    }

    /// One fusion step per meter datagram.
    fn fuse(&mut self, timestamp: f64, net_watts: f64) {
        if !self.gate.is_ready() {
            // Not buffered: the window starts when publishing starts.
            return;
        }
        let production = self.latest_production.unwrap_or(0.0);
        let measurement = Measurement::from_net(timestamp, net_watts, production);
        self.store.push(measurement);
        self.production_sender.send_replace(production);

        for field in Field::ALL {
            self.outputs
                .number(Output::Flow(Group::Live, field), measurement.get(field));
        }
        self.outputs
            .number(Output::SelfSufficiency(Group::Live), measurement.self_sufficiency());
        let trend = self.grid_trend.add(net_watts);
        self.outputs.number(Output::GridTrend, trend);

        let recent = self.store.windowed_measurement(self.recent_window_seconds);
        for field in Field::ALL {
            self.outputs
                .number(Output::Flow(Group::Recent, field), recent.get(field));
        }
        self.outputs
            .number(Output::SelfSufficiency(Group::Recent), recent.self_sufficiency());

        self.evaluate_signals();
    }

    fn evaluate_signals(&mut self) {
        let today = day_number(&Local::now().naive_local());
        self.signals.evaluate(&self.store, today);

        let states: Vec<(SignalId, bool, String)> = self
            .signals
            .states()
            .map(|(id, state)| (id, state.active, state.reason.clone()))
            .collect();
        for (id, active, reason) in states {
            self.outputs.flag(Output::SignalActive(id), active);
            self.outputs.text(Output::SignalReason(id), reason);
        }
        if let Some(average) = self.signals.published_import_average() {
            self.outputs.number(Output::HighImportAverage, average);
        }
    }
}
