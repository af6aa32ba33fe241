//! Serial transport and port enumeration.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use crate::config::LinkConfig;
use crate::errors::TransportError;

/// Byte-level link to the sensor.
///
/// `read` waits at most `timeout` and returns `Ok(0)` when nothing arrived,
/// so a poll cycle never blocks longer than its configured response timeout.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
    /// Discard anything already received.
    fn clear_input(&mut self) -> Result<(), TransportError>;
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    /// Device path passed to [`SerialTransport::open`].
    pub name: String,
    pub label: String,
}

/// Snapshot of the serial ports currently present.
pub fn enumerate_ports() -> Result<Vec<PortDescriptor>, TransportError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| PortDescriptor {
            label: describe(&p.port_type),
            name: p.port_name,
        })
        .collect())
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let name = usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_else(|| "USB serial".to_string());
            format!("{} ({:04x}:{:04x})", name, usb.vid, usb.pid)
        }
        SerialPortType::PciPort => "PCI serial".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
        SerialPortType::Unknown => "Serial port".to_string(),
    }
}

/// RS-485/RS-232 link opened with the sensor's fixed 8N1 framing.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    current_timeout: Duration,
}

impl SerialTransport {
    pub fn open(config: &LinkConfig) -> Result<Self, TransportError> {
        let timeout = config.timeout();
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;

        info!(
            "opened serial port {} at {} baud (8N1)",
            config.port, config.baud_rate
        );
        Ok(Self {
            port,
            current_timeout: timeout,
        })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        // serialport rejects a zero timeout on some platforms.
        let timeout = timeout.max(Duration::from_millis(1));
        if timeout != self.current_timeout {
            self.port.set_timeout(timeout)?;
            self.current_timeout = timeout;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!("closing serial port {:?}", self.port.name());
    }
}
