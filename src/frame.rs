//! Modbus RTU framing for register reads.
//!
//! Request layout (8 bytes):
//!
//! ```text
//! [slave][function][addr_hi][addr_lo][count_hi][count_lo][crc_lo][crc_hi]
//! ```
//!
//! Normal response: `[slave][function][byte_count][data...][crc_lo][crc_hi]`.
//! Exception response: `[slave][function | 0x80][code][crc_lo][crc_hi]`.
//!
//! The CRC is the standard Modbus CRC-16 (poly 0xA001 reflected, init 0xFFFF)
//! over every preceding byte, transmitted low byte first.

use std::time::{Duration, Instant};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::errors::{FrameError, Result, TransportError};
use crate::transport::Transport;

/// Most registers a single read request may ask for.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;
const REQUEST_LEN: usize = 8;
/// Slave, function, byte count / exception code.
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;
const MIN_RESPONSE_LEN: usize = HEADER_LEN + CRC_LEN;

/// Read function codes the sensor answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCode {
    #[default]
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            _ => None,
        }
    }
}

/// Modbus CRC-16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn check_crc(raw: &[u8]) -> std::result::Result<(), FrameError> {
    let split = raw.len() - CRC_LEN;
    let received = u16::from_le_bytes([raw[split], raw[split + 1]]);
    let calculated = crc16(&raw[..split]);
    if received != calculated {
        return Err(FrameError::ChecksumInvalid {
            received,
            calculated,
        });
    }
    Ok(())
}

/// A read request for `count` registers starting at on-wire register `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub slave: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
}

impl RequestFrame {
    pub fn read(slave: u8, function: FunctionCode, address: u16, count: u16) -> Self {
        Self {
            slave,
            function,
            address,
            count,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(REQUEST_LEN);
        frame.push(self.slave);
        frame.push(self.function.code());
        frame.extend_from_slice(&self.address.to_be_bytes());
        frame.extend_from_slice(&self.count.to_be_bytes());
        append_crc(&mut frame);
        frame
    }

    /// Parse a request as the sensor would see it.
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, FrameError> {
        if raw.len() < REQUEST_LEN {
            return Err(FrameError::Truncated {
                needed: REQUEST_LEN,
                actual: raw.len(),
            });
        }
        let raw = &raw[..REQUEST_LEN];
        check_crc(raw)?;
        let function = FunctionCode::from_code(raw[1]).ok_or(FrameError::FunctionMismatch {
            expected: FunctionCode::ReadHoldingRegisters.code(),
            actual: raw[1],
        })?;
        Ok(Self {
            slave: raw[0],
            function,
            address: u16::from_be_bytes([raw[2], raw[3]]),
            count: u16::from_be_bytes([raw[4], raw[5]]),
        })
    }

    /// Byte length of a normal response to this request.
    pub fn expected_response_len(&self) -> usize {
        MIN_RESPONSE_LEN + self.count as usize * 2
    }
}

/// A response that passed every framing check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub slave: u8,
    pub function: FunctionCode,
    /// Register data, two big-endian bytes per register.
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub fn new(slave: u8, function: FunctionCode, payload: Vec<u8>) -> Self {
        Self {
            slave,
            function,
            payload,
        }
    }

    /// Build a response carrying `registers`.
    pub fn from_registers(slave: u8, function: FunctionCode, registers: &[u16]) -> Self {
        let payload = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
        Self::new(slave, function, payload)
    }

    pub fn register_count(&self) -> usize {
        self.payload.len() / 2
    }

    /// The byte-count field is one byte, so the payload must hold at most
    /// [`MAX_REGISTERS_PER_READ`] registers.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(
            self.register_count() <= MAX_REGISTERS_PER_READ as usize,
            "{} registers do not fit one response",
            self.register_count()
        );
        let mut frame = Vec::with_capacity(MIN_RESPONSE_LEN + self.payload.len());
        frame.push(self.slave);
        frame.push(self.function.code());
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        append_crc(&mut frame);
        frame
    }

    /// Validate `raw` as the reply to `request`.
    ///
    /// The CRC is checked before anything else, so a corrupted address or
    /// function byte is reported as [`FrameError::ChecksumInvalid`].
    pub fn decode(raw: &[u8], request: &RequestFrame) -> std::result::Result<Self, FrameError> {
        if raw.len() < MIN_RESPONSE_LEN {
            return Err(FrameError::Truncated {
                needed: MIN_RESPONSE_LEN,
                actual: raw.len(),
            });
        }
        check_crc(raw)?;

        if raw[0] != request.slave {
            return Err(FrameError::AddressMismatch {
                expected: request.slave,
                actual: raw[0],
            });
        }

        let expected_fn = request.function.code();
        if raw[1] == expected_fn | EXCEPTION_FLAG {
            return Err(FrameError::SensorException { code: raw[2] });
        }
        if raw[1] != expected_fn {
            return Err(FrameError::FunctionMismatch {
                expected: expected_fn,
                actual: raw[1],
            });
        }

        let needed = MIN_RESPONSE_LEN + raw[2] as usize;
        if raw.len() != needed {
            return Err(FrameError::Truncated {
                needed,
                actual: raw.len(),
            });
        }

        Ok(Self {
            slave: raw[0],
            function: request.function,
            payload: raw[HEADER_LEN..raw.len() - CRC_LEN].to_vec(),
        })
    }
}

/// Encode an exception reply (function code with the high bit set).
pub fn encode_exception(slave: u8, function: FunctionCode, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, function.code() | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

/// Send `request` and wait up to `timeout` for the complete response.
///
/// The response length is taken from its own header: exception replies are
/// five bytes, normal replies five plus the advertised byte count.
pub fn transact(
    transport: &mut dyn Transport,
    request: &RequestFrame,
    timeout: Duration,
) -> Result<ResponseFrame> {
    transport.clear_input()?;
    let bytes = request.encode();
    trace!("tx {:02X?}", bytes);
    transport.write_all(&bytes)?;

    let deadline = Instant::now() + timeout;
    let mut raw = Vec::with_capacity(request.expected_response_len());
    let mut needed = HEADER_LEN;
    let mut chunk = [0u8; 256];

    loop {
        while raw.len() < needed {
            let now = Instant::now();
            if now >= deadline {
                if raw.is_empty() {
                    return Err(TransportError::Timeout(timeout).into());
                }
                debug!("response timed out after {} of {} bytes", raw.len(), needed);
                return Err(FrameError::Truncated {
                    needed,
                    actual: raw.len(),
                }
                .into());
            }
            let want = (needed - raw.len()).min(chunk.len());
            let n = transport.read(&mut chunk[..want], deadline - now)?;
            raw.extend_from_slice(&chunk[..n]);
        }

        if needed == HEADER_LEN {
            needed = if raw[1] & EXCEPTION_FLAG != 0 {
                MIN_RESPONSE_LEN
            } else {
                MIN_RESPONSE_LEN + raw[2] as usize
            };
            continue;
        }
        break;
    }

    trace!("rx {:02X?}", raw);
    Ok(ResponseFrame::decode(&raw, request)?)
}
