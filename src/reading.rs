//! Values produced by one successful poll cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::registers::{Channel, Measurement};

/// A decoded waveform block.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub channel: Channel,
    pub samples: Vec<i16>,
    /// Timestamp of the cycle that read it.
    pub captured_at: DateTime<Utc>,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn min(&self) -> Option<i16> {
        self.samples.iter().copied().min()
    }

    pub fn max(&self) -> Option<i16> {
        self.samples.iter().copied().max()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().map(|&s| s as i64).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }
}

/// One complete sample set.
///
/// Waveforms are shared: when a cycle does not read them, the most recent
/// blocks are carried forward. `sequence` and `timestamp` strictly increase
/// within a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// TEV level in the map's engineering unit (dB by default).
    pub tev: f64,
    /// AA level in the map's engineering unit (dB by default).
    pub aa: f64,
    pub extras: Vec<Measurement>,
    pub tev_waveform: Option<Arc<Waveform>>,
    pub aa_waveform: Option<Arc<Waveform>>,
}

impl Reading {
    pub fn waveform(&self, channel: Channel) -> Option<&Waveform> {
        match channel {
            Channel::Tev => self.tev_waveform.as_deref(),
            Channel::Aa => self.aa_waveform.as_deref(),
        }
    }

    /// Whether the waveform on `channel` was read in this reading's own cycle.
    pub fn is_waveform_fresh(&self, channel: Channel) -> bool {
        self.waveform(channel)
            .is_some_and(|w| w.captured_at == self.timestamp)
    }

    pub fn extra(&self, name: &str) -> Option<f64> {
        self.extras.iter().find(|m| m.name == name).map(|m| m.value)
    }
}
