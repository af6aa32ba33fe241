//! TEV/AA partial-discharge sensor driver.
//!
//! Polls a combined transient-earth-voltage / acoustic-emission sensor over
//! Modbus RTU and delivers decoded readings to a consumer in real time.
//!
//! # Layers
//!
//! 1. [`transport`] owns the serial port and bounds every read by a timeout.
//! 2. [`frame`] encodes read requests and validates responses (CRC-16, slave
//!    echo, function code, exception replies).
//! 3. [`registers`] turns register words into engineering values using a
//!    configurable [`RegisterMap`].
//! 4. [`engine`] runs the poll/retry/degrade state machine on its own thread.
//! 5. [`channel`] hands readings (latest wins) and state changes (never
//!    dropped) to the consumer.
//!
//! # Example
//! ```ignore
//! let mut sensor = SensorController::new(PollSettings::default(), RegisterMap::default());
//! let events = sensor.events();
//! sensor.connect(LinkConfig::new("/dev/ttyUSB0"))?;
//! while let Ok(event) = events.recv() {
//!     match event {
//!         Event::Reading(r) => println!("TEV {} dB, AA {} dB", r.tev, r.aa),
//!         Event::StateChanged { old, new } => println!("{old} -> {new}"),
//!     }
//! }
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod errors;
pub mod frame;
pub mod logging;
pub mod reading;
pub mod registers;
pub mod transport;

pub use channel::{Event, EventReceiver, EventSender, RecvError};
pub use config::{LinkConfig, PollSettings, SensorConfig};
pub use engine::{ConnectionState, SensorController, Session, SessionStats};
pub use errors::*;
pub use frame::{FunctionCode, RequestFrame, ResponseFrame};
pub use reading::{Reading, Waveform};
pub use registers::{Channel, Measurement, Quantity, RegisterEntry, RegisterKind, RegisterMap};
pub use transport::{enumerate_ports, PortDescriptor, SerialTransport, Transport};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod bindings {
    use std::collections::HashMap;
    use std::time::Duration;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    use crate::{
        Channel, ConnectionState, Event, LinkConfig, PollSettings, Reading, RegisterMap,
        SensorConfig, SensorController, SensorError, Transport, TransportError,
    };

    fn to_py_err(err: SensorError) -> PyErr {
        match err {
            SensorError::Config(e) => PyValueError::new_err(e.to_string()),
            SensorError::Transport(TransportError::PortUnavailable(msg))
            | SensorError::Transport(TransportError::PermissionDenied(msg)) => {
                PyConnectionError::new_err(msg)
            }
            SensorError::Transport(e) => PyIOError::new_err(e.to_string()),
            other => PyRuntimeError::new_err(other.to_string()),
        }
    }

    /// A serial port that may host the sensor.
    ///
    /// Attributes:
    ///     name: Device path to pass to `Sensor.connect`.
    ///     label: Human-readable description.
    #[pyclass(name = "PortInfo", frozen)]
    #[derive(Clone)]
    struct PyPortInfo {
        #[pyo3(get)]
        name: String,
        #[pyo3(get)]
        label: String,
    }

    #[pymethods]
    impl PyPortInfo {
        fn __repr__(&self) -> String {
            format!("PortInfo(name={:?}, label={:?})", self.name, self.label)
        }
    }

    /// One decoded sample set.
    ///
    /// Attributes:
    ///     sequence: Increasing counter within a session.
    ///     timestamp: UTC time of the poll cycle, RFC 3339.
    ///     tev: TEV level (dB with the default register map).
    ///     aa: AA level (dB with the default register map).
    ///     extras: Other scalar registers by name.
    ///     tev_waveform / aa_waveform: Latest samples, or None if never read.
    ///     tev_fresh / aa_fresh: True when the waveform was read in this cycle.
    #[pyclass(name = "Reading", frozen)]
    struct PyReading {
        #[pyo3(get)]
        sequence: u64,
        #[pyo3(get)]
        timestamp: String,
        #[pyo3(get)]
        tev: f64,
        #[pyo3(get)]
        aa: f64,
        #[pyo3(get)]
        extras: HashMap<String, f64>,
        #[pyo3(get)]
        tev_waveform: Option<Vec<i16>>,
        #[pyo3(get)]
        aa_waveform: Option<Vec<i16>>,
        #[pyo3(get)]
        tev_fresh: bool,
        #[pyo3(get)]
        aa_fresh: bool,
    }

    #[pymethods]
    impl PyReading {
        fn __repr__(&self) -> String {
            format!(
                "Reading(seq={}, tev={}, aa={}, tev_waveform={}, aa_waveform={})",
                self.sequence,
                self.tev,
                self.aa,
                self.tev_waveform.as_ref().map_or(0, Vec::len),
                self.aa_waveform.as_ref().map_or(0, Vec::len)
            )
        }
    }

    impl From<Reading> for PyReading {
        fn from(r: Reading) -> Self {
            PyReading {
                sequence: r.sequence,
                timestamp: r.timestamp.to_rfc3339(),
                tev: r.tev,
                aa: r.aa,
                tev_fresh: r.is_waveform_fresh(Channel::Tev),
                aa_fresh: r.is_waveform_fresh(Channel::Aa),
                extras: r.extras.iter().map(|m| (m.name.clone(), m.value)).collect(),
                tev_waveform: r.tev_waveform.map(|w| w.samples.clone()),
                aa_waveform: r.aa_waveform.map(|w| w.samples.clone()),
            }
        }
    }

    /// Connection state transition.
    ///
    /// Attributes:
    ///     old, new: One of "disconnected", "connecting", "connected",
    ///         "degraded", "failed".
    #[pyclass(name = "StateChange", frozen)]
    struct PyStateChange {
        #[pyo3(get)]
        old: String,
        #[pyo3(get)]
        new: String,
    }

    #[pymethods]
    impl PyStateChange {
        fn __repr__(&self) -> String {
            format!("StateChange({} -> {})", self.old, self.new)
        }

        /// True when the display should flag its data as stale.
        #[getter]
        fn is_stale(&self) -> bool {
            self.new != ConnectionState::Connected.to_string()
        }
    }

    /// TEV/AA sensor handle.
    ///
    /// Example:
    ///     >>> sensor = Sensor()
    ///     >>> sensor.connect("/dev/ttyUSB0", baud_rate=9600, address=1)
    ///     >>> event = sensor.next_event(timeout=2.0)
    ///     >>> sensor.disconnect()
    #[pyclass(name = "Sensor")]
    struct PySensor {
        inner: SensorController,
    }

    #[pymethods]
    impl PySensor {
        /// Args:
        ///     config_path: Optional JSON file with `poll` and `registers` sections.
        #[new]
        #[pyo3(signature = (config_path=None))]
        fn new(config_path: Option<&str>) -> PyResult<Self> {
            let (poll, map) = match config_path {
                Some(path) => {
                    let config = SensorConfig::load(path)
                        .map_err(|e| PyValueError::new_err(e.to_string()))?;
                    (config.poll, config.registers)
                }
                None => (PollSettings::default(), RegisterMap::default()),
            };
            Ok(PySensor {
                inner: SensorController::new(poll, map),
            })
        }

        /// Open the port and start polling.
        ///
        /// Raises:
        ///     ValueError: If a setting is out of range.
        ///     ConnectionError: If the port is missing or not accessible.
        #[pyo3(signature = (port, baud_rate=9600, address=1, timeout_ms=500, retries=3))]
        fn connect(
            &mut self,
            py: Python<'_>,
            port: &str,
            baud_rate: u32,
            address: u8,
            timeout_ms: u64,
            retries: u32,
        ) -> PyResult<()> {
            let link = LinkConfig {
                port: port.to_string(),
                baud_rate,
                slave_address: address,
                timeout_ms,
                retries,
            };
            self.open(py, link, None)
        }

        /// Stop polling and release the port. Always succeeds.
        fn disconnect(&mut self, py: Python<'_>) {
            let inner = &mut self.inner;
            py.detach(|| inner.disconnect());
        }

        /// Read waveforms every `n` cycles (0 disables them).
        fn set_waveform_subrate(&mut self, n: u32) {
            self.inner.set_waveform_subrate(n);
        }

        /// Wait for the next `Reading` or `StateChange`.
        ///
        /// Returns:
        ///     The event, or None if nothing arrived within `timeout` seconds.
        #[pyo3(signature = (timeout=1.0))]
        fn next_event(&self, py: Python<'_>, timeout: f64) -> PyResult<Option<Py<PyAny>>> {
            let events = self.inner.events();
            let wait = Duration::from_secs_f64(timeout.max(0.0));
            let event = py.detach(move || events.recv_timeout(wait));
            match event {
                Ok(Event::Reading(r)) => Ok(Some(Py::new(py, PyReading::from(r))?.into_any())),
                Ok(Event::StateChanged { old, new }) => Ok(Some(
                    Py::new(
                        py,
                        PyStateChange {
                            old: old.to_string(),
                            new: new.to_string(),
                        },
                    )?
                    .into_any(),
                )),
                Err(_) => Ok(None),
            }
        }

        #[getter]
        fn is_active(&self) -> bool {
            self.inner.is_active()
        }

        /// Link counters of the current session as a dict, or None.
        fn stats(&self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
            let Some(stats) = self.inner.stats() else {
                return Ok(None);
            };
            let dict = pyo3::types::PyDict::new(py);
            dict.set_item("requests", stats.requests)?;
            dict.set_item("responses", stats.responses)?;
            dict.set_item("timeouts", stats.timeouts)?;
            dict.set_item("checksum_errors", stats.checksum_errors)?;
            dict.set_item("framing_errors", stats.framing_errors)?;
            dict.set_item("sensor_exceptions", stats.sensor_exceptions)?;
            dict.set_item("decode_errors", stats.decode_errors)?;
            dict.set_item("io_errors", stats.io_errors)?;
            dict.set_item("cycles_ok", stats.cycles_ok)?;
            dict.set_item("cycles_failed", stats.cycles_failed)?;
            Ok(Some(dict.into_any().unbind()))
        }
    }

    impl PySensor {
        /// Replace the current session. Runs without the GIL: ending the old
        /// session joins its poll thread, which logs through Python on the way out.
        fn open(
            &mut self,
            py: Python<'_>,
            link: LinkConfig,
            transport: Option<Box<dyn Transport>>,
        ) -> PyResult<()> {
            let inner = &mut self.inner;
            py.detach(move || match transport {
                Some(transport) => inner.connect_with(link, transport),
                None => inner.connect(link),
            })
            .map_err(to_py_err)
        }
    }

    impl Drop for PySensor {
        fn drop(&mut self) {
            let inner = &mut self.inner;
            Python::attach(|py| py.detach(|| inner.disconnect()));
        }
    }

    /// List serial ports currently present.
    #[pyfunction]
    fn list_ports() -> PyResult<Vec<PyPortInfo>> {
        let ports = SensorController::list_ports().map_err(to_py_err)?;
        Ok(ports
            .into_iter()
            .map(|p| PyPortInfo {
                name: p.name,
                label: p.label,
            })
            .collect())
    }

    /// Set the Rust-side log level ("trace" .. "error", or None for `TEVAA_LOG`).
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        crate::logging::set_python_log_level(py, level)
    }

    /// The Python module definition
    #[pymodule]
    fn tevaa(m: &Bound<'_, PyModule>) -> PyResult<()> {
        crate::logging::init_python_logging(m.py())?;
        m.add_class::<PySensor>()?;
        m.add_class::<PyReading>()?;
        m.add_class::<PyStateChange>()?;
        m.add_class::<PyPortInfo>()?;
        m.add_function(wrap_pyfunction!(list_ports, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        m.add("DEFAULT_BAUD_RATE", crate::config::DEFAULT_BAUD_RATE)?;
        m.add("VALID_BAUD_RATES", crate::config::VALID_BAUD_RATES.to_vec())?;
        Ok(())
    }

}
