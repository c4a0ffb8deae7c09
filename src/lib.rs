//! SMA Power Flow Library
//!
//! Fuses SMA Sunny Boy inverter readings (Modbus TCP) with SMA Home Manager
//! energy meter datagrams (Speedwire multicast) into live, recent and daily
//! household power flows plus derived signals.

pub mod config;
pub mod coordinator;
pub mod daily_energy;
pub mod discovery_gate;
pub mod inverter_reader;
pub mod measurement;
pub mod measurement_store;
pub mod meter_listener;
pub mod outputs;
pub mod power_fusion;
pub mod running_average;
pub mod signals;
pub mod speedwire;
pub mod store;
pub mod sunny_boy;

// Re-export commonly used types for easier access
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use inverter_reader::InverterReader;
pub use meter_listener::MeterListener;
pub use outputs::{ChannelPublisher, Output, OutputValue, Publisher};
pub use power_fusion::{FusionEvent, PowerFusion};
