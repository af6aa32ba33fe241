use std::io;
use thiserror::Error;

/// Failures opening or talking to the serial link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("port unavailable: {0}")]
    PortUnavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::PortUnavailable(err.description),
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                TransportError::PermissionDenied(err.description)
            }
            serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                TransportError::PortUnavailable(err.description)
            }
            serialport::ErrorKind::Io(kind) => {
                TransportError::Io(io::Error::new(kind, err.description))
            }
            serialport::ErrorKind::InvalidInput | serialport::ErrorKind::Unknown => {
                TransportError::PortUnavailable(err.description)
            }
        }
    }
}

/// A response frame that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("response from slave {actual}, expected {expected}")]
    AddressMismatch { expected: u8, actual: u8 },
    #[error("response function {actual:#04X}, expected {expected:#04X}")]
    FunctionMismatch { expected: u8, actual: u8 },
    #[error("CRC mismatch (received {received:#06X}, calculated {calculated:#06X})")]
    ChecksumInvalid { received: u16, calculated: u16 },
    #[error("truncated frame: {actual} bytes, need {needed}")]
    Truncated { needed: usize, actual: usize },
    #[error("sensor exception code {code:#04X}")]
    SensorException { code: u8 },
}

/// A valid frame whose payload does not fit the register map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{field}: expected {expected} registers, got {actual}")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },
    #[error("{field}: register {address} outside the returned block")]
    MissingRegister { field: String, address: u16 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid baud rate {0}")]
    BaudRate(u32),
    #[error("slave address {0} outside 1..=247")]
    SlaveAddress(u8),
    #[error("invalid link setting: {0}")]
    Link(String),
    #[error("invalid poll setting: {0}")]
    Poll(String),
    #[error("invalid register map: {0}")]
    RegisterMap(String),
    #[error("config file error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session error: {0}")]
    Session(String),
}

impl SensorError {
    /// Whether a poll attempt that failed this way may be retried on the same link.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SensorError::Frame(_) | SensorError::Decode(_) => true,
            SensorError::Transport(TransportError::Timeout(_)) => true,
            _ => false,
        }
    }

    pub fn is_sensor_exception(&self) -> bool {
        matches!(self, SensorError::Frame(FrameError::SensorException { .. }))
    }
}

pub type Result<T> = std::result::Result<T, SensorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classifies_recoverable_errors() {
        assert!(SensorError::from(FrameError::Truncated { needed: 8, actual: 3 }).is_recoverable());
        assert!(SensorError::from(DecodeError::LengthMismatch {
            field: "tev_waveform".into(),
            expected: 200,
            actual: 199,
        })
        .is_recoverable());
        assert!(SensorError::from(TransportError::Timeout(Duration::from_millis(500)))
            .is_recoverable());
        assert!(!SensorError::from(TransportError::PortUnavailable("/dev/ttyUSB9".into()))
            .is_recoverable());
        assert!(!SensorError::from(ConfigError::SlaveAddress(0)).is_recoverable());
    }

    #[test]
    fn sensor_exception_is_flagged() {
        let err = SensorError::from(FrameError::SensorException { code: 0x02 });
        assert!(err.is_sensor_exception());
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "framing error: sensor exception code 0x02");
    }

    #[test]
    fn maps_serialport_errors_by_kind() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            TransportError::from(err),
            TransportError::PortUnavailable(_)
        ));
        let err = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "dialout",
        );
        assert!(matches!(
            TransportError::from(err),
            TransportError::PermissionDenied(_)
        ));
    }
}
