use tracing::info;

/// Serial number and firmware of one device. Learned once, never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial_number: u32,
    pub firmware_revision: String,
}

/// Both identities, handed out when the gate opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identities {
    pub inverter: DeviceIdentity,
    pub meter: DeviceIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Discovering,
    Ready,
}

/// Holds back publishing until both devices have identified themselves.
#[derive(Debug, Clone)]
pub struct DiscoveryGate {
    inverter: Option<DeviceIdentity>,
    meter: Option<DeviceIdentity>,
    state: GateState,
}

impl Default for DiscoveryGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryGate {
    pub fn new() -> Self {
        Self {
            inverter: None,
            meter: None,
            state: GateState::Discovering,
        }
    }

    /// Records the inverter identity. Later calls are ignored.
    pub fn observe_inverter(&mut self, identity: DeviceIdentity) {
        if self.inverter.is_none() {
            info!("Discovered SMA inverter: {identity:?}");
            self.inverter = Some(identity);
        }
    }

    /// Records the energy meter identity. Later calls are ignored.
    pub fn observe_meter(&mut self, identity: DeviceIdentity) {
        if self.meter.is_none() {
            info!("Discovered SMA energy meter: {identity:?}");
            self.meter = Some(identity);
        }
    }

    /// Runs one discovery cycle. Returns the identities exactly once, on the
    /// cycle both are first known.
    pub fn check(&mut self) -> Option<Identities> {
        if self.state == GateState::Ready {
            return None;
        }
        match (&self.inverter, &self.meter) {
            (Some(inverter), Some(meter)) => {
                self.state = GateState::Ready;
                Some(Identities {
                    inverter: inverter.clone(),
                    meter: meter.clone(),
                })
            }
            _ => {
                info!(
                    "Discovered SMA inverter: {}, SMA energy meter: {}",
                    describe(&self.inverter),
                    describe(&self.meter)
                );
                None
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn inverter(&self) -> Option<&DeviceIdentity> {
        self.inverter.as_ref()
    }

    pub fn meter(&self) -> Option<&DeviceIdentity> {
        self.meter.as_ref()
    }
}

fn describe(identity: &Option<DeviceIdentity>) -> String {
    match identity {
        Some(identity) => identity.serial_number.to_string(),
        None => "no".to_string(),
    }
}
