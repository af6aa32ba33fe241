//! Log setup: `env_logger` for the CLI, and (with the `python` feature) a
//! bridge that forwards `log` records into Python's `logging` module.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
#[cfg(feature = "python")]
use log::{Log, Metadata, Record};
#[cfg(feature = "python")]
use once_cell::sync::OnceCell;
#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use pyo3::types::{PyAny, PyModule, PyTuple};
#[cfg(feature = "python")]
use std::collections::HashMap;
#[cfg(feature = "python")]
use std::sync::Mutex;

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "TEVAA_LOG";

static RUST_LOG_ONCE: Once = Once::new();
#[cfg(feature = "python")]
static PY_LOG_ONCE: Once = Once::new();
#[cfg(feature = "python")]
static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

#[cfg_attr(not(feature = "python"), allow(dead_code))]
fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize logging for Rust binaries (stderr formatter) based on `TEVAA_LOG`/`RUST_LOG`.
///
/// `verbosity` raises the level above the environment default (1 = debug, 2+ = trace).
pub fn init_rust_logging(verbosity: u8) {
    let level = match verbosity {
        0 => env_level(),
        1 => env_level().max(LevelFilter::Debug),
        _ => LevelFilter::Trace,
    };
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

/// Forwards `log` records to `logging.getLogger(<target with dots>)`.
#[cfg(feature = "python")]
struct PyLogger {
    max_level: Mutex<LevelFilter>,
    logging: Py<PyModule>,
    /// Rust target -> Python logger object.
    loggers: Mutex<HashMap<String, Py<PyAny>>>,
}

#[cfg(feature = "python")]
impl PyLogger {
    fn python_level(level: log::Level) -> u32 {
        match level {
            log::Level::Error => 40,
            log::Level::Warn => 30,
            log::Level::Info => 20,
            log::Level::Debug => 10,
            log::Level::Trace => 5,
        }
    }

    fn logger_for<'py>(&self, py: Python<'py>, target: &str) -> PyResult<Bound<'py, PyAny>> {
        let mut loggers = self.loggers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(logger) = loggers.get(target) {
            return Ok(logger.bind(py).clone());
        }
        let name = target.replace("::", ".");
        let logger = self.logging.bind(py).call_method1("getLogger", (name,))?;
        loggers.insert(target.to_string(), logger.clone().unbind());
        Ok(logger)
    }

    fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
        let logger = self.logger_for(py, record.target())?;
        let level = Self::python_level(record.level());
        if !logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
            return Ok(());
        }
        let none = py.None();
        let py_record = logger.call_method1(
            "makeRecord",
            (
                logger.getattr("name")?,
                level,
                record.file().unwrap_or("<rust>"),
                record.line().unwrap_or_default(),
                record.args().to_string(),
                PyTuple::empty(py),
                &none,
            ),
        )?;
        logger.call_method1("handle", (py_record,))?;
        Ok(())
    }
}

#[cfg(feature = "python")]
impl Log for PyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let max = *self.max_level.lock().unwrap_or_else(|e| e.into_inner());
        metadata.level().to_level_filter() <= max
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        Python::attach(|py| {
            if let Err(e) = self.forward(py, record) {
                e.restore(py);
            }
        });
    }

    fn flush(&self) {}
}

/// Route Rust log records into Python's `logging`. Safe to call repeatedly;
/// only the first call installs the bridge.
#[cfg(feature = "python")]
pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
    let level = env_level();
    let mut result = Ok(());
    PY_LOG_ONCE.call_once(|| {
        let logging = match py.import("logging") {
            Ok(m) => m,
            Err(e) => {
                result = Err(e);
                return;
            }
        };
        let bridge: &'static PyLogger = Box::leak(Box::new(PyLogger {
            max_level: Mutex::new(level),
            logging: logging.unbind(),
            loggers: Mutex::new(HashMap::new()),
        }));
        if log::set_logger(bridge).is_ok() {
            log::set_max_level(level);
            let _ = PY_LOGGER.set(bridge);
        }
    });
    result
}

/// Forget cached Python loggers (after reconfiguring Python logging).
#[cfg(feature = "python")]
pub fn reset_python_logging_cache() {
    if let Some(bridge) = PY_LOGGER.get() {
        bridge
            .loggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Set the bridge level from a name such as `"debug"`; `None` falls back to the environment.
#[cfg(feature = "python")]
pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    init_python_logging(py)?;
    let level = parse_level(level).unwrap_or_else(env_level);
    if let Some(bridge) = PY_LOGGER.get() {
        *bridge.max_level.lock().unwrap_or_else(|e| e.into_inner()) = level;
    }
    reset_python_logging_cache();
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_round_trip() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }
}
