//! Table-driven register map and payload decoding.
//!
//! Each [`RegisterEntry`] names a field, its documented register address and
//! how to interpret it. Scalars are single 16-bit words scaled to engineering
//! units; waveforms are contiguous blocks of signed 16-bit samples. Supporting
//! a new firmware register is a table edit, not a new decode path.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, DecodeError};
use crate::frame::{FunctionCode, MAX_REGISTERS_PER_READ};

/// Waveform channels of the combined sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Tev,
    Aa,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Tev => "tev",
            Channel::Aa => "aa",
        }
    }
}

/// What a scalar register measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Tev,
    Aa,
    /// Any other value; delivered by name in `Reading::extras`.
    Auxiliary,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegisterKind {
    Scalar {
        quantity: Quantity,
        #[serde(default = "unit_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default)]
        unit: String,
        /// Interpret the raw word as two's complement.
        #[serde(default)]
        signed: bool,
    },
    Waveform {
        channel: Channel,
        samples: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub name: String,
    /// Address as printed in the device documentation.
    pub address: u16,
    #[serde(flatten)]
    pub kind: RegisterKind,
}

impl RegisterEntry {
    pub fn register_count(&self) -> u16 {
        match self.kind {
            RegisterKind::Scalar { .. } => 1,
            RegisterKind::Waveform { samples, .. } => samples,
        }
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Scalar(f64),
    Waveform(Vec<i16>),
}

/// A named scalar in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Scalars decoded from one block read.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarSet {
    pub tev: f64,
    pub aa: f64,
    pub extras: Vec<Measurement>,
}

/// A contiguous run of on-wire registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

impl RegisterBlock {
    /// Split into requests no larger than the Modbus per-read limit.
    pub fn chunks(self) -> impl Iterator<Item = RegisterBlock> {
        let end = self.start as u32 + self.count as u32;
        (self.start as u32..end)
            .step_by(MAX_REGISTERS_PER_READ as usize)
            .map(move |start| RegisterBlock {
                start: start as u16,
                count: (end - start).min(MAX_REGISTERS_PER_READ as u32) as u16,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Subtracted from documented addresses to get the on-wire register number.
    pub address_base: u16,
    pub function: FunctionCode,
    pub entries: Vec<RegisterEntry>,
}

fn scalar(name: &str, address: u16, quantity: Quantity, unit: &str) -> RegisterEntry {
    RegisterEntry {
        name: name.to_string(),
        address,
        kind: RegisterKind::Scalar {
            quantity,
            scale: 1.0,
            offset: 0.0,
            unit: unit.to_string(),
            signed: false,
        },
    }
}

fn waveform(name: &str, address: u16, channel: Channel, samples: u16) -> RegisterEntry {
    RegisterEntry {
        name: name.to_string(),
        address,
        kind: RegisterKind::Waveform { channel, samples },
    }
}

impl Default for RegisterMap {
    /// Register table of the TEV/AA combined sensor firmware.
    fn default() -> Self {
        Self {
            address_base: 1,
            function: FunctionCode::ReadHoldingRegisters,
            entries: vec![
                scalar("tev_level", 5003, Quantity::Tev, "dB"),
                scalar("tev_discharge_count", 5004, Quantity::Auxiliary, "count"),
                scalar("aa_level", 5005, Quantity::Aa, "dB"),
                waveform("tev_waveform", 201, Channel::Tev, 100),
                waveform("aa_waveform", 301, Channel::Aa, 100),
            ],
        }
    }
}

impl RegisterMap {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut channels = HashSet::new();
        let (mut tev, mut aa) = (0, 0);

        for entry in &self.entries {
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::RegisterMap(format!(
                    "duplicate entry name '{}'",
                    entry.name
                )));
            }
            if entry.address < self.address_base {
                return Err(ConfigError::RegisterMap(format!(
                    "'{}' address {} is below address_base {}",
                    entry.name, entry.address, self.address_base
                )));
            }
            let last = self.wire_address(entry) as u32 + entry.register_count() as u32;
            if last > u16::MAX as u32 + 1 {
                return Err(ConfigError::RegisterMap(format!(
                    "'{}' runs past the register space",
                    entry.name
                )));
            }
            match entry.kind {
                RegisterKind::Scalar { quantity, .. } => match quantity {
                    Quantity::Tev => tev += 1,
                    Quantity::Aa => aa += 1,
                    Quantity::Auxiliary => {}
                },
                RegisterKind::Waveform { channel, samples } => {
                    if samples == 0 {
                        return Err(ConfigError::RegisterMap(format!(
                            "'{}' has no samples",
                            entry.name
                        )));
                    }
                    if !channels.insert(channel) {
                        return Err(ConfigError::RegisterMap(format!(
                            "more than one {} waveform",
                            channel.as_str()
                        )));
                    }
                }
            }
        }

        if tev != 1 || aa != 1 {
            return Err(ConfigError::RegisterMap(
                "exactly one tev and one aa scalar are required".into(),
            ));
        }
        if let Some(block) = self.scalar_block() {
            if block.count > MAX_REGISTERS_PER_READ {
                return Err(ConfigError::RegisterMap(format!(
                    "scalar registers span {} registers, more than one read allows",
                    block.count
                )));
            }
        }
        Ok(())
    }

    pub fn wire_address(&self, entry: &RegisterEntry) -> u16 {
        entry.address - self.address_base
    }

    pub fn scalars(&self) -> impl Iterator<Item = &RegisterEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, RegisterKind::Scalar { .. }))
    }

    pub fn waveform(&self, channel: Channel) -> Option<&RegisterEntry> {
        self.entries.iter().find(|e| match e.kind {
            RegisterKind::Waveform { channel: c, .. } => c == channel,
            _ => false,
        })
    }

    /// The smallest block covering every scalar, read with one request per cycle.
    pub fn scalar_block(&self) -> Option<RegisterBlock> {
        let mut wires = self.scalars().map(|e| self.wire_address(e));
        let first = wires.next()?;
        let (lo, hi) = wires.fold((first, first), |(lo, hi), a| (lo.min(a), hi.max(a)));
        Some(RegisterBlock {
            start: lo,
            count: (hi as u32 - lo as u32 + 1).min(u16::MAX as u32) as u16,
        })
    }

    pub fn block_of(&self, entry: &RegisterEntry) -> RegisterBlock {
        RegisterBlock {
            start: self.wire_address(entry),
            count: entry.register_count(),
        }
    }

    /// Decode one entry from exactly the registers it occupies.
    pub fn decode(&self, entry: &RegisterEntry, payload: &[u8]) -> Result<RegisterValue, DecodeError> {
        let expected = entry.register_count() as usize;
        if payload.len() != expected * 2 {
            return Err(DecodeError::LengthMismatch {
                field: entry.name.clone(),
                expected,
                actual: payload.len() / 2,
            });
        }
        Ok(match &entry.kind {
            RegisterKind::Scalar {
                scale,
                offset,
                signed,
                ..
            } => {
                let word = u16::from_be_bytes([payload[0], payload[1]]);
                let raw = if *signed {
                    word as i16 as f64
                } else {
                    word as f64
                };
                RegisterValue::Scalar(raw * scale + offset)
            }
            RegisterKind::Waveform { .. } => RegisterValue::Waveform(
                payload
                    .chunks_exact(2)
                    .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            ),
        })
    }

    /// Decode every scalar from the payload of a [`Self::scalar_block`] read.
    pub fn decode_scalars(&self, block: RegisterBlock, payload: &[u8]) -> Result<ScalarSet, DecodeError> {
        if payload.len() != block.count as usize * 2 {
            return Err(DecodeError::LengthMismatch {
                field: "scalars".into(),
                expected: block.count as usize,
                actual: payload.len() / 2,
            });
        }

        let mut set = ScalarSet {
            // Overwritten below; validate() guarantees one tev and one aa entry.
            tev: 0.0,
            aa: 0.0,
            extras: Vec::new(),
        };
        for entry in self.scalars() {
            let wire = self.wire_address(entry);
            if wire < block.start || wire as u32 >= block.start as u32 + block.count as u32 {
                return Err(DecodeError::MissingRegister {
                    field: entry.name.clone(),
                    address: entry.address,
                });
            }
            let at = (wire - block.start) as usize * 2;
            let RegisterValue::Scalar(value) = self.decode(entry, &payload[at..at + 2])? else {
                continue;
            };
            if let RegisterKind::Scalar { quantity, unit, .. } = &entry.kind {
                match quantity {
                    Quantity::Tev => set.tev = value,
                    Quantity::Aa => set.aa = value,
                    Quantity::Auxiliary => set.extras.push(Measurement {
                        name: entry.name.clone(),
                        value,
                        unit: unit.clone(),
                    }),
                }
            }
        }
        Ok(set)
    }

    /// Decode a waveform from its reassembled block payload.
    pub fn decode_waveform(&self, channel: Channel, payload: &[u8]) -> Result<Vec<i16>, DecodeError> {
        let entry = self.waveform(channel).ok_or_else(|| DecodeError::MissingRegister {
            field: format!("{}_waveform", channel.as_str()),
            address: 0,
        })?;
        match self.decode(entry, payload)? {
            RegisterValue::Waveform(samples) => Ok(samples),
            RegisterValue::Scalar(_) => Err(DecodeError::MissingRegister {
                field: entry.name.clone(),
                address: entry.address,
            }),
        }
    }
}
