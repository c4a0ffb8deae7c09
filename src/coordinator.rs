use crate::config::Config;
use crate::daily_energy::DailyEnergyTracker;
use crate::inverter_reader::{InverterReader, InverterSettings};
use crate::meter_listener::{MeterListener, MeterSettings};
use crate::outputs::Publisher;
use crate::power_fusion::{FusionSettings, PowerFusion};
use crate::store::KeyValueStore;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

const EVENT_QUEUE_LEN: usize = 128;

/// Everything the coordinator needs to start the tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub inverter: InverterSettings,
    pub meter: MeterSettings,
    pub fusion: FusionSettings,
    pub discovery_interval: Duration,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            inverter: config.inverter_settings(),
            meter: config.meter_settings(),
            fusion: config.fusion_settings(),
            discovery_interval: config.poll_interval,
        }
    }
}

/// Spawns one task per data source plus the fusion task, connected through
/// a single event queue.
pub struct Coordinator {
    fusion: JoinHandle<()>,
    inverter: JoinHandle<()>,
    meter: JoinHandle<()>,
}

impl Coordinator {
    pub fn start<P: Publisher + 'static>(
        settings: CoordinatorSettings,
        store: Box<dyn KeyValueStore>,
        publisher: P,
    ) -> Self {
        info!("Initializing power flow coordinator");

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let tracker = DailyEnergyTracker::load(store);
        let (fusion, production) = PowerFusion::new(settings.fusion, tracker, publisher);
        let fusion = fusion.spawn(events_rx, settings.discovery_interval);

        let inverter =
            InverterReader::new(settings.inverter, events_tx.clone(), production).spawn();
        let meter = MeterListener::new(settings.meter, events_tx).spawn();

        info!("All data source tasks started");
        Self {
            fusion,
            inverter,
            meter,
        }
    }

    /// Waits until the fusion task ends, which only happens once both
    /// sources have stopped.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.fusion.await?;
        self.inverter.await?;
        self.meter.await?;
        Ok(())
    }

    pub fn abort(&self) {
        self.inverter.abort();
        self.meter.abort();
        self.fusion.abort();
    }
}
