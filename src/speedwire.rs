//! Speedwire energy meter datagrams.
//!
//! The SMA Home Manager multicasts one datagram per second. The layout is
//! documented in EMETER-Protocol-TI-en-10: a fixed 28 byte header, a run of
//! OBIS blocks and a four byte zero trailer.

use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::warn;

/// IANA registered port for `sma-spw`.
pub const SPEEDWIRE_PORT: u16 = 9522;
/// Multicast group the energy meter announces on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 12, 255, 254);

const HEADER_TAG: [u8; 4] = *b"SMA\0";
const STRUCTURE_TAG: [u8; 2] = [0x02, 0xa0];
const DATA_TAG: [u8; 2] = [0x00, 0x10];
const PROTOCOL_ENERGY_METER: u16 = 0x6069;
const PROTOCOL_DISCOVERY: u16 = 0x6065;
const TRAILER: [u8; 4] = [0x00; 4];
const BODY_LENGTH_INDICATOR: u16 = 4;
const BODY_OFFSET: usize = 28;
const MIN_DATAGRAM_LEN: usize = BODY_OFFSET + TRAILER.len();

const VERSION_CHANNEL: u8 = 144;
const TYPE_POWER: u8 = 4;
const TYPE_ENERGY: u8 = 8;
const INDEX_IMPORT: u8 = 1;
const INDEX_EXPORT: u8 = 2;

/// Reasons a datagram is rejected before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatagramError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid header tag {0:02x?}")]
    BadHeader([u8; 4]),
    #[error("unknown datagram structure, tags {0:02x?} and {1:02x?}")]
    UnknownStructure([u8; 2], [u8; 2]),
    #[error("speedwire discovery datagram")]
    Discovery,
    #[error("unknown protocol id {0:#06x}")]
    UnknownProtocol(u16),
    #[error("unexpected body length indicator {0}")]
    BadLengthIndicator(u16),
    #[error("invalid trailer {0:02x?}")]
    BadTrailer([u8; 4]),
}

/// Decoded content of one energy meter datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub model: u16,
    pub serial_number: u32,
    /// Device clock in seconds. Wraps together with the millisecond ticker.
    pub timestamp: f64,
    /// Positive while importing from the grid, negative while exporting.
    /// `None` when the datagram carried no positive power reading.
    pub net_watts: Option<f64>,
    pub firmware_revision: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Version,
    Power { index: u8 },
    Energy { index: u8 },
}

impl Block {
    fn from_header(header: [u8; 4]) -> Option<Self> {
        if header[0] == VERSION_CHANNEL {
            return Some(Block::Version);
        }
        // The channel byte is irrelevant for OBIS blocks.
        match header[2] {
            TYPE_POWER => Some(Block::Power { index: header[1] }),
            TYPE_ENERGY => Some(Block::Energy { index: header[1] }),
            _ => None,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Block::Version | Block::Power { .. } => 4,
            Block::Energy { .. } => 8,
        }
    }
}

/// Checks the fixed framing of a datagram.
pub fn validate(datagram: &[u8]) -> Result<(), DatagramError> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        return Err(DatagramError::TooShort(datagram.len()));
    }
    let header: [u8; 4] = array_at(datagram, 0);
    if header != HEADER_TAG {
        return Err(DatagramError::BadHeader(header));
    }
    let structure: [u8; 2] = array_at(datagram, 6);
    let data: [u8; 2] = array_at(datagram, 14);
    if structure != STRUCTURE_TAG || data != DATA_TAG {
        return Err(DatagramError::UnknownStructure(structure, data));
    }
    match u16::from_be_bytes(array_at(datagram, 16)) {
        PROTOCOL_ENERGY_METER => {}
        PROTOCOL_DISCOVERY => return Err(DatagramError::Discovery),
        other => return Err(DatagramError::UnknownProtocol(other)),
    }
    let length_indicator = u16::from_be_bytes(array_at(datagram, 4));
    if length_indicator != BODY_LENGTH_INDICATOR {
        return Err(DatagramError::BadLengthIndicator(length_indicator));
    }
    let trailer: [u8; 4] = array_at(datagram, datagram.len() - TRAILER.len());
    if trailer != TRAILER {
        return Err(DatagramError::BadTrailer(trailer));
    }
    Ok(())
}

pub fn is_valid_datagram(datagram: &[u8]) -> bool {
    validate(datagram).is_ok()
}

/// Decodes a datagram that passed [`validate`].
///
/// The version block is only decoded when `want_version` is set, which the
/// listener clears once the meter identity has been learned.
pub fn decode(datagram: &[u8], want_version: bool) -> MeterReading {
    let mut reading = MeterReading {
        model: u16::from_be_bytes(array_at(datagram, 18)),
        serial_number: u32::from_be_bytes(array_at(datagram, 20)),
        timestamp: f64::from(u32::from_be_bytes(array_at(datagram, 24))) / 1000.0,
        net_watts: None,
        firmware_revision: None,
    };

    let end = datagram.len().saturating_sub(TRAILER.len()).max(BODY_OFFSET);
    let mut body = &datagram[BODY_OFFSET..end];
    while !body.is_empty() {
        let Some(header) = body.get(..4) else {
            warn!("Truncated OBIS header ({} bytes left)", body.len());
            break;
        };
        let header: [u8; 4] = array_at(header, 0);
        let Some(block) = Block::from_header(header) else {
            // Without a known type the payload length is unknown too.
            warn!(
                "Unknown OBIS measurement type in header {header:02x?}, skipping rest of datagram"
            );
            break;
        };
        body = &body[4..];
        let Some(payload) = body.get(..block.payload_len()) else {
            warn!("Truncated OBIS payload for {block:?}");
            break;
        };

        match block {
            Block::Power { index } if index == INDEX_IMPORT || index == INDEX_EXPORT => {
                let watts = f64::from(u32::from_be_bytes(array_at(payload, 0))) / 10.0;
                if watts > 0.0 {
                    reading.net_watts = Some(if index == INDEX_IMPORT { watts } else { -watts });
                }
            }
            Block::Version if want_version && reading.firmware_revision.is_none() => {
                reading.firmware_revision = Some(format!(
                    "{}.{}.{}.{}",
                    payload[0], payload[1], payload[2], payload[3] as char
                ));
            }
            _ => {}
        }
        body = &body[block.payload_len()..];
    }
    reading
}

/// Assembles energy meter datagrams, used to emulate a meter on the wire.
#[derive(Debug, Clone, Default)]
pub struct DatagramBuilder {
    model: u16,
    serial_number: u32,
    timestamp_ms: u32,
    blocks: Vec<u8>,
}

impl DatagramBuilder {
    pub fn new(model: u16, serial_number: u32, timestamp_ms: u32) -> Self {
        Self {
            model,
            serial_number,
            timestamp_ms,
            blocks: Vec::new(),
        }
    }

    pub fn version(mut self, version: [u8; 4]) -> Self {
        self.blocks.extend_from_slice(&[VERSION_CHANNEL, 0, 0, 0]);
        self.blocks.extend_from_slice(&version);
        self
    }

    /// Adds an instantaneous power block, `deciwatts` being the raw value.
    pub fn power(mut self, index: u8, deciwatts: u32) -> Self {
        self.blocks.extend_from_slice(&[0, index, TYPE_POWER, 0]);
        self.blocks.extend_from_slice(&deciwatts.to_be_bytes());
        self
    }

    /// Adds an accumulated energy block in watt-seconds.
    pub fn energy(mut self, index: u8, watt_seconds: u64) -> Self {
        self.blocks.extend_from_slice(&[0, index, TYPE_ENERGY, 0]);
        self.blocks.extend_from_slice(&watt_seconds.to_be_bytes());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let data_len = (2 + 2 + 4 + 4 + self.blocks.len()) as u16;
        let mut datagram = Vec::with_capacity(MIN_DATAGRAM_LEN + self.blocks.len());
        datagram.extend_from_slice(&HEADER_TAG);
        datagram.extend_from_slice(&BODY_LENGTH_INDICATOR.to_be_bytes());
        datagram.extend_from_slice(&STRUCTURE_TAG);
        datagram.extend_from_slice(&1u32.to_be_bytes());
        datagram.extend_from_slice(&data_len.to_be_bytes());
        datagram.extend_from_slice(&DATA_TAG);
        datagram.extend_from_slice(&PROTOCOL_ENERGY_METER.to_be_bytes());
        datagram.extend_from_slice(&self.model.to_be_bytes());
        datagram.extend_from_slice(&self.serial_number.to_be_bytes());
        datagram.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        datagram.extend_from_slice(&self.blocks);
        datagram.extend_from_slice(&TRAILER);
        datagram
    }
}

/// Copies `N` bytes starting at `offset`; callers check the length first.
fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}
