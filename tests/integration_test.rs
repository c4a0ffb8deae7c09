use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_modbus::{
    prelude::*,
    server::{
        tcp::{accept_tcp_connection, Server},
        Service,
    },
};

use sma_power_flow::{
    config::Config,
    coordinator::{Coordinator, CoordinatorSettings},
    discovery_gate::DeviceIdentity,
    inverter_reader::{InverterEvent, InverterReader, InverterSettings},
    measurement::Field,
    meter_listener::{MeterListener, MeterSettings},
    outputs::{ChannelPublisher, Group, Output, OutputValue, Publication},
    power_fusion::FusionEvent,
    speedwire::DatagramBuilder,
    store::MemoryStore,
    sunny_boy,
};

const INVERTER_SERIAL: u32 = 3_001_234_567;
const METER_SERIAL: u32 = 1_900_123_456;

/// Mock Sunny Boy answering 32 bit holding register reads
#[derive(Clone)]
struct MockInverter {
    registers: Arc<Mutex<HashMap<u16, u32>>>,
    read_count: Arc<AtomicU32>,
    should_fail: Arc<AtomicBool>,
}

impl MockInverter {
    fn new() -> Self {
        let inverter = Self {
            registers: Arc::new(Mutex::new(HashMap::new())),
            read_count: Arc::new(AtomicU32::new(0)),
            should_fail: Arc::new(AtomicBool::new(false)),
        };
        inverter.set(sunny_boy::SERIAL_NUMBER.address, INVERTER_SERIAL);
        // 3.10.53.R
        inverter.set(sunny_boy::FIRMWARE_VERSION, 0x0310_3504);
        inverter.set(sunny_boy::CONDITION.address, 307);
        inverter.set(sunny_boy::AC_POWER.address, 1500);
        inverter.set(sunny_boy::AC_CURRENT.address, 6500);
        inverter.set(sunny_boy::GRID_VOLTAGE.address, 23100);
        inverter.set(sunny_boy::DAILY_YIELD.address, 4200);
        inverter.set(sunny_boy::GRID_IMPORT_TOTAL.address, 1_000_000);
        inverter.set(sunny_boy::GRID_EXPORT_TOTAL.address, 2_000_000);
        inverter
    }

    fn set(&self, address: u16, value: u32) {
        self.registers.lock().unwrap().insert(address, value);
    }

    fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    fn get_read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
}

impl Service for MockInverter {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Exception>> + Send>,
    >;

    fn call(&self, req: Self::Request) -> Self::Future {
        let registers = self.registers.clone();
        let read_count = self.read_count.clone();
        let should_fail = self.should_fail.clone();

        Box::pin(async move {
            read_count.fetch_add(1, Ordering::Relaxed);

            if should_fail.load(Ordering::Relaxed) {
                return Err(ExceptionCode::ServerDeviceFailure);
            }

            match req {
                Request::ReadHoldingRegisters(addr, 2) => {
                    let value = registers.lock().unwrap().get(&addr).copied();
                    match value {
                        Some(value) => Ok(Response::ReadHoldingRegisters(vec![
                            (value >> 16) as u16,
                            (value & 0xFFFF) as u16,
                        ])),
                        None => Err(ExceptionCode::IllegalDataAddress),
                    }
                }
                _ => Err(ExceptionCode::IllegalFunction),
            }
        })
    }
}

async fn start_mock_inverter() -> (MockInverter, SocketAddr, oneshot::Sender<()>) {
    let mock_inverter = MockInverter::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let inverter_clone = mock_inverter.clone();

    tokio::spawn(async move {
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(inverter_clone.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            eprintln!("Mock inverter error: {}", err);
        };

        tokio::select! {
            _ = server.serve(&on_connected, on_process_error) => {},
            _ = shutdown_rx => {
                println!("Mock inverter shutting down");
            }
        }
    });

    (mock_inverter, addr, shutdown_tx)
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn meter_datagram(timestamp_ms: u32, import_deciwatts: u32, export_deciwatts: u32) -> Vec<u8> {
    DatagramBuilder::new(349, METER_SERIAL, timestamp_ms)
        .version([2, 0, 18, b'R'])
        .power(1, import_deciwatts)
        .energy(1, 36_000_000)
        .power(2, export_deciwatts)
        .energy(2, 72_000_000)
        .build()
}

/// Emulates a Home Manager sending one datagram every 50 ms.
fn start_mock_meter(port: u16, import_deciwatts: u32, export_deciwatts: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut timestamp_ms = 1_000;
        loop {
            let datagram = meter_datagram(timestamp_ms, import_deciwatts, export_deciwatts);
            let _ = socket.send_to(&datagram, ("127.0.0.1", port)).await;
            timestamp_ms += 1_000;
            sleep(Duration::from_millis(50)).await;
        }
    })
}

/// Follows the publication queue, remembering the latest value per output
/// since unchanged values are published only once.
struct PublicationLog {
    publications: mpsc::Receiver<Publication>,
    latest: HashMap<Output, OutputValue>,
}

impl PublicationLog {
    fn new(publications: mpsc::Receiver<Publication>) -> Self {
        Self {
            publications,
            latest: HashMap::new(),
        }
    }

    /// Waits until the latest value of `output` is accepted by `accept`.
    async fn wait_for(
        &mut self,
        output: Output,
        accept: impl Fn(&OutputValue) -> bool,
    ) -> Option<OutputValue> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(value) = self.latest.get(&output).filter(|value| accept(value)) {
                return Some(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.publications.recv()).await {
                Ok(Some(publication)) => {
                    self.latest.insert(publication.output, publication.value);
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

/// Waits for an inverter event matching `accept`.
async fn wait_for_event(
    events: &mut mpsc::Receiver<FusionEvent>,
    within: Duration,
    accept: impl Fn(&InverterEvent) -> bool,
) -> Option<InverterEvent> {
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(FusionEvent::Inverter(event))) if accept(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

fn inverter_settings(address: SocketAddr) -> InverterSettings {
    InverterSettings {
        address,
        unit_id: sunny_boy::DEFAULT_UNIT_ID,
        poll_interval: Duration::from_millis(50),
        totals_interval: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn test_full_integration() {
    let (_mock_inverter, inverter_addr, _inverter_shutdown) = start_mock_inverter().await;
    let meter_port = free_udp_port();

    let vars: HashMap<&str, String> = [
        ("INVERTER_ADDRESS", inverter_addr.to_string()),
        ("POLL_INTERVAL_MS", "100".to_string()),
        ("TOTALS_INTERVAL_MS", "200".to_string()),
        ("RECENT_MINUTES", "1".to_string()),
        ("METER_PORT", meter_port.to_string()),
    ]
    .into_iter()
    .collect();
    let config = Config::from_vars(|key| vars.get(key).cloned()).unwrap();

    let mut settings = CoordinatorSettings::from(&config);
    // Loopback only, no multicast membership needed.
    settings.meter.group = None;

    let (publisher, publications) = ChannelPublisher::new(4096);
    let coordinator = Coordinator::start(settings, Box::new(MemoryStore::new()), publisher);
    let mut log = PublicationLog::new(publications);

    // 500 W import: consumption is 500 + 1500 production
    let meter = start_mock_meter(meter_port, 5000, 0);

    let serials = log.wait_for(Output::SerialNumbers, |_| true).await;
    assert_eq!(
        serials,
        Some(OutputValue::Text(format!("{INVERTER_SERIAL} & {METER_SERIAL}")))
    );

    let consumption = log
        .wait_for(Output::Flow(Group::Live, Field::Consumption), |value| {
            *value == OutputValue::Number(2000.0)
        })
        .await;
    assert!(consumption.is_some(), "Live consumption never reached 2000 W");

    let today = log
        .wait_for(Output::Flow(Group::Today, Field::Production), |_| true)
        .await;
    assert_eq!(today, Some(OutputValue::Number(4.2)));

    let volts = log.wait_for(Output::InverterVolts, |_| true).await;
    assert_eq!(volts, Some(OutputValue::Number(231.0)));

    meter.abort();
    coordinator.abort();
}

#[tokio::test]
async fn test_inverter_failure_recovery() {
    let (mock_inverter, inverter_addr, _inverter_shutdown) = start_mock_inverter().await;
    mock_inverter.set_should_fail(true);

    let (events_tx, mut events_rx) = mpsc::channel(128);
    let (_production_tx, production_rx) = watch::channel(0.0);
    let reader = InverterReader::new(inverter_settings(inverter_addr), events_tx, production_rx)
        .spawn();

    let identity = wait_for_event(&mut events_rx, Duration::from_millis(500), |event| {
        matches!(event, InverterEvent::Identity(_))
    })
    .await;
    assert!(identity.is_none(), "No identity while the inverter fails");
    assert!(
        mock_inverter.get_read_count() > 0,
        "Reader should keep retrying"
    );

    mock_inverter.set_should_fail(false);
    let identity = wait_for_event(&mut events_rx, Duration::from_secs(10), |event| {
        matches!(event, InverterEvent::Identity(_))
    })
    .await;
    assert_eq!(
        identity,
        Some(InverterEvent::Identity(DeviceIdentity {
            serial_number: INVERTER_SERIAL,
            firmware_revision: "3.10.53.R".to_string(),
        }))
    );

    reader.abort();
}

#[tokio::test]
async fn test_current_and_voltage_only_while_producing() {
    let (_mock_inverter, inverter_addr, _inverter_shutdown) = start_mock_inverter().await;

    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let (production_tx, production_rx) = watch::channel(0.0);
    let reader = InverterReader::new(inverter_settings(inverter_addr), events_tx, production_rx)
        .spawn();

    let production = wait_for_event(&mut events_rx, Duration::from_secs(10), |event| {
        matches!(event, InverterEvent::Production(_))
    })
    .await;
    assert_eq!(production, Some(InverterEvent::Production(1500.0)));

    let amperes = wait_for_event(&mut events_rx, Duration::from_millis(400), |event| {
        matches!(event, InverterEvent::Amperes(_))
    })
    .await;
    assert!(amperes.is_none(), "Current read while fused production is 0");

    production_tx.send_replace(1500.0);
    let amperes = wait_for_event(&mut events_rx, Duration::from_secs(10), |event| {
        matches!(event, InverterEvent::Amperes(_))
    })
    .await;
    assert_eq!(amperes, Some(InverterEvent::Amperes(6.5)));

    reader.abort();
}

#[tokio::test]
async fn test_meter_listener_filters_datagrams() {
    let port = free_udp_port();
    let (events_tx, mut events_rx) = mpsc::channel(128);
    let settings = MeterSettings {
        port,
        group: None,
        ..MeterSettings::default()
    };
    let listener = MeterListener::new(settings, events_tx).spawn();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut discovery = DatagramBuilder::new(349, METER_SERIAL, 0).build();
    // Protocol 0x6065 marks a discovery request.
    discovery[17] = 0x65;

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = Vec::new();
    while received.len() < 3 && Instant::now() < deadline {
        let _ = socket.send_to(b"garbage", ("127.0.0.1", port)).await;
        let _ = socket.send_to(&discovery, ("127.0.0.1", port)).await;
        let datagram = meter_datagram(5_000, 0, 3000);
        let _ = socket.send_to(&datagram, ("127.0.0.1", port)).await;
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), events_rx.recv()).await {
            received.push(event);
        }
    }

    assert_eq!(
        received.first(),
        Some(&FusionEvent::MeterIdentity(DeviceIdentity {
            serial_number: METER_SERIAL,
            firmware_revision: "2.0.18.R".to_string(),
        }))
    );
    // Identity is sent once, every valid datagram yields a sample.
    assert!(received.len() >= 2);
    assert!(received[1..].iter().all(|event| *event
        == FusionEvent::MeterSample {
            timestamp: 5.0,
            net_watts: -300.0,
        }));

    listener.abort();
}

/// Collects every inverter event arriving within `within`.
async fn collect_events(
    events: &mut mpsc::Receiver<FusionEvent>,
    within: Duration,
) -> Vec<InverterEvent> {
    let deadline = Instant::now() + within;
    let mut collected = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(FusionEvent::Inverter(event))) => collected.push(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return collected,
        }
    }
}

#[tokio::test]
async fn test_unusable_production_readings_are_not_reported() {
    let (mock_inverter, inverter_addr, _inverter_shutdown) = start_mock_inverter().await;

    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let (_production_tx, production_rx) = watch::channel(0.0);
    let reader = InverterReader::new(inverter_settings(inverter_addr), events_tx, production_rx)
        .spawn();

    let production = wait_for_event(&mut events_rx, Duration::from_secs(10), |event| {
        matches!(event, InverterEvent::Production(_))
    })
    .await;
    assert_eq!(production, Some(InverterEvent::Production(1500.0)));

    // Signed NaN pattern, then a reading far beyond any inverter.
    for raw in [0x8000_0000, 70_000_000] {
        mock_inverter.set(sunny_boy::AC_POWER.address, raw);
        // Let a poll that already read the old value finish.
        collect_events(&mut events_rx, Duration::from_millis(200)).await;

        let events = collect_events(&mut events_rx, Duration::from_millis(500)).await;
        assert!(
            events.iter().any(|e| matches!(e, InverterEvent::Status(_))),
            "Reader should keep polling, got {events:?}"
        );
        assert!(
            !events.iter().any(|e| matches!(e, InverterEvent::Production(_))),
            "Raw value {raw:#x} must not be reported, got {events:?}"
        );
    }

    mock_inverter.set(sunny_boy::AC_POWER.address, 1200);
    let production = wait_for_event(&mut events_rx, Duration::from_secs(10), |event| {
        matches!(event, InverterEvent::Production(_))
    })
    .await;
    assert_eq!(production, Some(InverterEvent::Production(1200.0)));

    reader.abort();
}

#[tokio::test]
async fn test_meter_listener_restarts_after_bind_failure() {
    let port = free_udp_port();
    // Holds the port without address reuse, so the listener cannot bind.
    let blocker = std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(128);
    let settings = MeterSettings {
        port,
        group: None,
        restart_delay: Duration::from_millis(100),
        ..MeterSettings::default()
    };
    let listener = MeterListener::new(settings, events_tx).spawn();

    sleep(Duration::from_millis(300)).await;
    assert!(events_rx.try_recv().is_err());
    drop(blocker);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut sample = None;
    while sample.is_none() && Instant::now() < deadline {
        let datagram = meter_datagram(7_000, 2500, 0);
        let _ = socket.send_to(&datagram, ("127.0.0.1", port)).await;
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), events_rx.recv()).await {
            if let FusionEvent::MeterSample { .. } = event {
                sample = Some(event);
                break;
            }
        }
    }

    assert_eq!(
        sample,
        Some(FusionEvent::MeterSample {
            timestamp: 7.0,
            net_watts: 250.0,
        })
    );

    listener.abort();
}
