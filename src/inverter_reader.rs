use crate::daily_energy::EnergyTotals;
use crate::discovery_gate::DeviceIdentity;
use crate::power_fusion::FusionEvent;
use crate::sunny_boy::{self, InverterStatus, Register};
use anyhow::{anyhow, bail, Context as _};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// Readings surfaced by the inverter. Registers holding the NaN pattern
/// produce no event at all.
#[derive(Debug, Clone, PartialEq)]
pub enum InverterEvent {
    Identity(DeviceIdentity),
    Status(InverterStatus),
    Production(f64),
    Amperes(f64),
    Volts(f64),
    Totals {
        totals: EnergyTotals,
        production_today: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InverterSettings {
    pub address: SocketAddr,
    pub unit_id: u8,
    pub poll_interval: Duration,
    pub totals_interval: Duration,
}

/// Polls the SMA inverter over Modbus TCP in its own task.
pub struct InverterReader {
    settings: InverterSettings,
    events: Sender<FusionEvent>,
    /// Production of the latest fused measurement.
    production: watch::Receiver<f64>,
    connection: Option<client::Context>,
    serial_number: Option<u32>,
    firmware_revision: Option<String>,
    identified: bool,
    last_totals: Option<Instant>,
}

impl InverterReader {
    pub fn new(
        settings: InverterSettings,
        events: Sender<FusionEvent>,
        production: watch::Receiver<f64>,
    ) -> Self {
        Self {
            settings,
            events,
            production,
            connection: None,
            serial_number: None,
            firmware_revision: None,
            identified: false,
            last_totals: None,
        }
    }

    /// Spawns the reader in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = self;
            reader.run().await;
        })
    }

    async fn run(&mut self) {
        info!(
            "Starting SMA inverter reader for {} (unit {})",
            self.settings.address, self.settings.unit_id
        );
        self.connect().await;

        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            poll.tick().await;
            if self.events.is_closed() {
                break;
            }
            if self.connection.is_none() {
                self.connect().await;
                continue;
            }
            if let Err(e) = self.poll().await {
                warn!("Inverter refresh failed, attempting reconnect: {e:#}");
                self.connect().await;
            }
        }
        info!("SMA inverter reader exiting");
    }

    /// Opens the Modbus connection and selects the unit. Failures are logged
    /// and leave the reader disconnected until the next tick.
    pub async fn connect(&mut self) {
        self.connection = None;
        debug!("Attempting connection to {}", self.settings.address);
        match tcp::connect(self.settings.address).await {
            Ok(mut connection) => {
                connection.set_slave(Slave(self.settings.unit_id));
                info!("Connected to SMA inverter at {}", self.settings.address);
                self.connection = Some(connection);
            }
            Err(e) => warn!(
                "Connection attempt to {} failed: {e}",
                self.settings.address
            ),
        }
    }

    async fn poll(&mut self) -> anyhow::Result<()> {
        self.poll_metadata().await?;
        self.poll_data().await
    }

    /// Reads serial number and firmware until both are known, then emits the
    /// identity once.
    pub async fn poll_metadata(&mut self) -> anyhow::Result<()> {
        if self.identified {
            return Ok(());
        }
        if self.serial_number.is_none() {
            let words = self.read(sunny_boy::SERIAL_NUMBER.address).await?;
            self.serial_number = sunny_boy::SERIAL_NUMBER.decode_raw(&words);
        }
        if self.firmware_revision.is_none() {
            let words = self.read(sunny_boy::FIRMWARE_VERSION).await?;
            self.firmware_revision = sunny_boy::decode_firmware_version(&words);
        }
        if let (Some(serial_number), Some(firmware_revision)) =
            (self.serial_number, self.firmware_revision.clone())
        {
            self.send(InverterEvent::Identity(DeviceIdentity {
                serial_number,
                firmware_revision,
            }))
            .await?;
            self.identified = true;
        }
        Ok(())
    }

    /// Reads status, production and, while producing, current and voltage.
    /// Lifetime totals are read once per totals interval.
    pub async fn poll_data(&mut self) -> anyhow::Result<()> {
        let words = self.read(sunny_boy::CONDITION.address).await?;
        if let Some(code) = sunny_boy::CONDITION.decode_raw(&words) {
            self.send(InverterEvent::Status(InverterStatus::from_condition(code)))
                .await?;
        }

        let watts = self.read_value(sunny_boy::AC_POWER).await?;
        if let Some(watts) = watts.and_then(sunny_boy::plausible_production) {
            self.send(InverterEvent::Production(watts)).await?;
        }

        // Current and voltage are meaningless while idle.
        let producing = *self.production.borrow() != 0.0;
        if producing {
            if let Some(amperes) = self.read_value(sunny_boy::AC_CURRENT).await? {
                self.send(InverterEvent::Amperes(amperes)).await?;
            }
            if let Some(volts) = self.read_value(sunny_boy::GRID_VOLTAGE).await? {
                self.send(InverterEvent::Volts(volts)).await?;
            }
        }

        let totals_due = self
            .last_totals
            .map_or(true, |at| at.elapsed() >= self.settings.totals_interval);
        if totals_due {
            self.poll_totals().await?;
            self.last_totals = Some(Instant::now());
        }
        Ok(())
    }

    async fn poll_totals(&mut self) -> anyhow::Result<()> {
        let import = self.read_value(sunny_boy::GRID_IMPORT_TOTAL).await?;
        let export = self.read_value(sunny_boy::GRID_EXPORT_TOTAL).await?;
        let production_today = self.read_value(sunny_boy::DAILY_YIELD).await?;
        match (import, export) {
            (Some(total_import_kwh), Some(total_export_kwh)) => {
                self.send(InverterEvent::Totals {
                    totals: EnergyTotals {
                        total_import_kwh,
                        total_export_kwh,
                    },
                    production_today,
                })
                .await
            }
            _ => {
                debug!("Grid counters not available this cycle");
                Ok(())
            }
        }
    }

    async fn read_value(&mut self, register: Register) -> anyhow::Result<Option<f64>> {
        let words = self.read(register.address).await?;
        Ok(register.decode(&words))
    }

    /// Reads one 32 bit value.
    async fn read(&mut self, address: u16) -> anyhow::Result<Vec<u16>> {
        let connection = self
            .connection
            .as_mut()
            .context("No connection available")?;

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        let words = match connection
            .read_holding_registers(address, Register::WORDS)
            .await
        {
            Ok(Ok(words)) => words,
            Ok(Err(exception)) => bail!("Modbus exception reading {address}: {exception:?}"),
            Err(e) => return Err(anyhow!("IO error reading {address}: {e:?}")),
        };
        if words.len() < Register::WORDS as usize {
            bail!("Short reply reading {address}: {words:?}");
        }
        Ok(words)
    }

    async fn send(&mut self, event: InverterEvent) -> anyhow::Result<()> {
        self.events
            .send(FusionEvent::Inverter(event))
            .await
            .map_err(|_| anyhow!("fusion task has stopped"))
    }
}
