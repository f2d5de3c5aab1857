//! Serial port targets for the relay handler
//!
//! Address syntax: `<device>,<baud>,<parity>,<data-bits>,<stop-bits>`
//! with defaults `115200,N,8,1` for omitted fields.

use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Error, Result};

const DEFAULT_BAUD_RATE: u32 = 115200;

/// Parsed serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
        }
    }
}

/// Parse a serial address. Unparsable fields keep their defaults.
pub fn parse_config(addr: &str) -> SerialConfig {
    let mut config = SerialConfig::default();

    let mut fields = addr.split(',').map(str::trim);
    if let Some(device) = fields.next() {
        config.device = device.to_string();
    }
    if let Some(baud) = fields.next() {
        if let Ok(baud) = baud.parse() {
            config.baud_rate = baud;
        }
    }
    if let Some(parity) = fields.next() {
        config.parity = match parity.to_ascii_uppercase().as_str() {
            "O" => Parity::Odd,
            "E" => Parity::Even,
            _ => Parity::None,
        };
    }
    if let Some(data_bits) = fields.next() {
        config.data_bits = match data_bits {
            "5" => DataBits::Five,
            "6" => DataBits::Six,
            "7" => DataBits::Seven,
            _ => DataBits::Eight,
        };
    }
    if let Some(stop_bits) = fields.next() {
        config.stop_bits = match stop_bits {
            "2" => StopBits::Two,
            _ => StopBits::One,
        };
    }

    config
}

/// Open the port described by the configuration.
pub fn open(config: &SerialConfig) -> Result<SerialStream> {
    tokio_serial::new(&config.device, config.baud_rate)
        .parity(config.parity)
        .data_bits(config.data_bits)
        .stop_bits(config.stop_bits)
        .open_native_async()
        .map_err(|e| Error::Transport(format!("open {}: {}", config.device, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_config("/dev/ttyUSB0");
        assert_eq!(config.device, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
    }

    #[test]
    fn test_full_syntax() {
        let config = parse_config("/dev/ttyS1,9600,E,7,2");
        assert_eq!(config.device, "/dev/ttyS1");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.stop_bits, StopBits::Two);
    }

    #[test]
    fn test_partial_fields_keep_defaults() {
        let config = parse_config("/dev/ttyAMA0,57600");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.parity, Parity::None);

        let config = parse_config("/dev/ttyAMA0,bogus,O");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.parity, Parity::Odd);
    }
}
