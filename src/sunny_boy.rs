//! SMA Sunny Boy Modbus register map.
//!
//! Every value is a 32 bit big-endian quantity spread over two holding
//! registers. See the SMA Modbus interface documentation, section 3.5.

use tracing::warn;

/// Modbus unit id the inverter answers on.
pub const DEFAULT_UNIT_ID: u8 = 3;

const U32_NAN: u32 = 0xFFFF_FFFF;
const S32_NAN: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    U32,
    S32,
}

/// A scaled 32 bit register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    pub address: u16,
    pub format: Format,
    pub divisor: f64,
}

impl Register {
    /// Registers occupied by one value.
    pub const WORDS: u16 = 2;

    const fn new(address: u16, format: Format, divisor: f64) -> Self {
        Self {
            address,
            format,
            divisor,
        }
    }

    /// Decodes the scaled value, `None` for the "not a number" pattern.
    pub fn decode(&self, words: &[u16]) -> Option<f64> {
        let raw = merge_u16_be(words)?;
        match self.format {
            Format::U32 if raw == U32_NAN => None,
            Format::U32 => Some(f64::from(raw) / self.divisor),
            Format::S32 if raw == S32_NAN => None,
            Format::S32 => Some(f64::from(raw as i32) / self.divisor),
        }
    }

    /// Decodes the unscaled value of an unsigned register.
    pub fn decode_raw(&self, words: &[u16]) -> Option<u32> {
        merge_u16_be(words).filter(|raw| *raw != U32_NAN)
    }
}

pub const SERIAL_NUMBER: Register = Register::new(30057, Format::U32, 1.0);
pub const FIRMWARE_VERSION: u16 = 40063;
pub const CONDITION: Register = Register::new(30201, Format::U32, 1.0);
pub const AC_POWER: Register = Register::new(30775, Format::S32, 1.0);
pub const AC_CURRENT: Register = Register::new(30977, Format::S32, 1000.0);
pub const GRID_VOLTAGE: Register = Register::new(30783, Format::U32, 100.0);
pub const DAILY_YIELD: Register = Register::new(30535, Format::U32, 1000.0);
pub const GRID_IMPORT_TOTAL: Register = Register::new(30581, Format::U32, 1000.0);
pub const GRID_EXPORT_TOTAL: Register = Register::new(30583, Format::U32, 1000.0);

/// Readings above this are corrupt rather than production.
pub const MAX_PLAUSIBLE_WATTS: f64 = 65_535_000.0;

/// Sanitizes an AC power reading. Standby draw counts as idle, implausible
/// readings are dropped.
pub fn plausible_production(watts: f64) -> Option<f64> {
    if watts > MAX_PLAUSIBLE_WATTS {
        warn!("Ignoring implausible production reading of {watts} W");
        return None;
    }
    Some(watts.max(0.0))
}

/// Combines two registers, high word first.
fn merge_u16_be(words: &[u16]) -> Option<u32> {
    match words {
        [high, low, ..] => Some((u32::from(*high) << 16) | u32::from(*low)),
        _ => None,
    }
}

fn from_bcd(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

/// Formats the SMA firmware data format as `major.minor.build.release`.
///
/// The build byte is printed as received; some firmwares report a value that
/// does not match the version shown in the inverter UI.
pub fn decode_firmware_version(words: &[u16]) -> Option<String> {
    let raw = merge_u16_be(words).filter(|raw| *raw != U32_NAN)?;
    let [major, minor, build, release] = raw.to_be_bytes();
    let release = match release {
        0 => "N".to_string(),
        1 => "E".to_string(),
        2 => "A".to_string(),
        3 => "B".to_string(),
        4 => "R".to_string(),
        5 => "S".to_string(),
        other => other.to_string(),
    };
    Some(format!(
        "{}.{}.{}.{}",
        from_bcd(major),
        from_bcd(minor),
        build,
        release
    ))
}

/// Operating state derived from the condition register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InverterStatus {
    pub active: bool,
    pub fault: bool,
}

impl InverterStatus {
    pub fn from_condition(code: u32) -> Self {
        match code {
            // Fault
            35 => Self {
                active: false,
                fault: true,
            },
            // Warning
            455 => Self {
                active: true,
                fault: true,
            },
            // Off
            303 => Self {
                active: false,
                fault: false,
            },
            // Ok
            307 => Self {
                active: true,
                fault: false,
            },
            other => {
                warn!("Unknown inverter condition {other}");
                Self {
                    active: false,
                    fault: false,
                }
            }
        }
    }
}
