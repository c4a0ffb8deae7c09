use crate::discovery_gate::DeviceIdentity;
use crate::power_fusion::FusionEvent;
use crate::speedwire::{self, DatagramError};
use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, trace, warn};

const RECEIVE_BUFFER_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct MeterSettings {
    pub port: u16,
    /// Multicast group to join, `None` to only receive unicast.
    pub group: Option<Ipv4Addr>,
    pub membership_refresh: Duration,
    pub restart_delay: Duration,
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            port: speedwire::SPEEDWIRE_PORT,
            group: Some(speedwire::MULTICAST_GROUP),
            membership_refresh: Duration::from_secs(120),
            restart_delay: Duration::from_secs(10),
        }
    }
}

/// Receives SMA Home Manager datagrams and forwards them to the fusion task.
pub struct MeterListener {
    settings: MeterSettings,
    events: Sender<FusionEvent>,
    identity_sent: bool,
}

impl MeterListener {
    pub fn new(settings: MeterSettings, events: Sender<FusionEvent>) -> Self {
        Self {
            settings,
            events,
            identity_sent: false,
        }
    }

    /// Spawns the listener in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut listener = self;
            listener.run().await;
        })
    }

    async fn run(&mut self) {
        info!(
            "Starting SMA energy meter listener on port {}",
            self.settings.port
        );
        loop {
            match self.bind() {
                Ok(socket) => match self.listen(&socket).await {
                    // Only returns cleanly once nobody consumes events anymore.
                    Ok(()) => break,
                    Err(e) => {
                        error!("SMA energy meter listening error: {e:#}");
                        if self.events.send(FusionEvent::MeterUnavailable).await.is_err() {
                            break;
                        }
                    }
                },
                Err(e) => error!("Could not start SMA energy meter listener: {e:#}"),
            }
            if self.events.is_closed() {
                break;
            }
            // The socket is closed by now; rebind after a pause.
            sleep(self.settings.restart_delay).await;
            info!("Restarting SMA energy meter listener");
        }
        info!("SMA energy meter listener exiting");
    }

    fn bind(&self) -> anyhow::Result<UdpSocket> {
        let socket = bind_shared(self.settings.port)?;
        if let Some(group) = self.settings.group {
            socket
                .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                .with_context(|| format!("joining multicast group {group}"))?;
            info!("Joined multicast group {group}");
        }
        Ok(socket)
    }

    async fn listen(&mut self, socket: &UdpSocket) -> anyhow::Result<()> {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_LEN];
        let period = self.settings.membership_refresh;
        let mut refresh = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => {
                    let (len, from) = received.context("receiving datagram")?;
                    if !self.handle_datagram(&buffer[..len], from).await {
                        return Ok(());
                    }
                }
                _ = refresh.tick() => self.refresh_membership(socket)?,
            }
        }
    }

    /// Drops and re-adds the multicast membership. Memberships can lapse
    /// silently, after which the meter stops sending.
    fn refresh_membership(&self, socket: &UdpSocket) -> anyhow::Result<()> {
        let Some(group) = self.settings.group else {
            return Ok(());
        };
        debug!("Dropping and re-adding multicast membership");
        if let Err(e) = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
            debug!("Leaving multicast group {group} failed: {e}");
        }
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("rejoining multicast group {group}"))
    }

    /// Returns false once the fusion task is gone.
    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> bool {
        match speedwire::validate(datagram) {
            Ok(()) => {}
            Err(DatagramError::Discovery) => {
                trace!("Ignoring speedwire discovery datagram from {from}");
                return true;
            }
            Err(reason) => {
                warn!("Discarding datagram from {from}: {reason}");
                return true;
            }
        }

        let reading = speedwire::decode(datagram, !self.identity_sent);
        if let Some(firmware_revision) = reading.firmware_revision {
            debug!("SMA energy meter model {} at {from}", reading.model);
            let identity = DeviceIdentity {
                serial_number: reading.serial_number,
                firmware_revision,
            };
            if self
                .events
                .send(FusionEvent::MeterIdentity(identity))
                .await
                .is_err()
            {
                return false;
            }
            self.identity_sent = true;
        }

        self.events
            .send(FusionEvent::MeterSample {
                timestamp: reading.timestamp,
                net_watts: reading.net_watts.unwrap_or(0.0),
            })
            .await
            .is_ok()
    }
}

/// Binds the Speedwire port so other consumers on the host can share it.
pub fn bind_shared(port: u16) -> anyhow::Result<UdpSocket> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).context("setting SO_REUSEPORT")?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&address.into())
        .with_context(|| format!("binding {address}"))?;
    UdpSocket::from_std(socket.into()).with_context(|| format!("registering {address}"))
}
