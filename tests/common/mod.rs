//! In-memory sensor that answers Modbus RTU reads over the `Transport` trait.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tevaa::frame::encode_exception;
use tevaa::{
    ConnectionState, Event, EventReceiver, FunctionCode, LinkConfig, PollSettings, Reading,
    RequestFrame, ResponseFrame, Transport, TransportError,
};

pub const SLAVE: u8 = 1;

/// How the sensor answers one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Normal,
    Silent,
    /// Answer with this many fewer registers than requested.
    Short(u16),
    Exception(u8),
    CorruptCrc,
}

pub type Script = Box<dyn FnMut(&RequestFrame, usize) -> Reply + Send>;

struct State {
    script: Script,
    requests: Vec<RequestFrame>,
    pending: VecDeque<u8>,
}

pub struct Shared {
    state: Mutex<State>,
    dropped: AtomicBool,
}

/// Inspection handle kept by the test.
#[derive(Clone)]
pub struct SimHandle(Arc<Shared>);

impl SimHandle {
    pub fn requests(&self) -> Vec<RequestFrame> {
        self.0.state.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.0.state.lock().unwrap().requests.len()
    }

    pub fn set_script(&self, script: Script) {
        self.0.state.lock().unwrap().script = script;
    }

    pub fn is_dropped(&self) -> bool {
        self.0.dropped.load(Ordering::SeqCst)
    }
}

pub struct SimSensor(Arc<Shared>);

impl SimSensor {
    pub fn new(script: Script) -> (Box<dyn Transport>, SimHandle) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                script,
                requests: Vec::new(),
                pending: VecDeque::new(),
            }),
            dropped: AtomicBool::new(false),
        });
        (Box::new(SimSensor(shared.clone())), SimHandle(shared))
    }

    pub fn healthy() -> (Box<dyn Transport>, SimHandle) {
        Self::new(Box::new(|_, _| Reply::Normal))
    }
}

impl Drop for SimSensor {
    fn drop(&mut self) {
        self.0.dropped.store(true, Ordering::SeqCst);
    }
}

/// Register contents: scalars at wire 5002..=5004, a ramp everywhere else.
pub fn register_value(address: u16) -> u16 {
    match address {
        5002 => 35,
        5003 => 12,
        5004 => 48,
        a => ((a % 64) as i16 - 32) as u16,
    }
}

fn respond(request: &RequestFrame, reply: Reply) -> Vec<u8> {
    let registers = |n: u16| -> Vec<u16> {
        (0..n).map(|i| register_value(request.address + i)).collect()
    };
    match reply {
        Reply::Normal => {
            ResponseFrame::from_registers(request.slave, request.function, &registers(request.count))
                .encode()
        }
        Reply::Silent => Vec::new(),
        Reply::Short(missing) => ResponseFrame::from_registers(
            request.slave,
            request.function,
            &registers(request.count.saturating_sub(missing)),
        )
        .encode(),
        Reply::Exception(code) => encode_exception(request.slave, request.function, code),
        Reply::CorruptCrc => {
            let mut raw =
                ResponseFrame::from_registers(request.slave, request.function, &registers(request.count))
                    .encode();
            let last = raw.len() - 1;
            raw[last] ^= 0x5A;
            raw
        }
    }
}

impl Transport for SimSensor {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.0.state.lock().unwrap();
        let request = RequestFrame::decode(bytes).expect("engine sent a malformed request");
        assert_eq!(request.function, FunctionCode::ReadHoldingRegisters);
        let index = state.requests.len();
        state.requests.push(request);
        let reply = (state.script)(&request, index);
        if request.slave == SLAVE {
            let raw = respond(&request, reply);
            state.pending.extend(raw);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        {
            let mut state = self.0.state.lock().unwrap();
            if !state.pending.is_empty() {
                let n = buf.len().min(state.pending.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.pending.pop_front().unwrap();
                }
                return Ok(n);
            }
        }
        // Nothing on the wire: behave like a serial read timing out.
        thread::sleep(timeout);
        Ok(0)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.0.state.lock().unwrap().pending.clear();
        Ok(())
    }
}

pub fn link(timeout_ms: u64, retries: u32) -> LinkConfig {
    LinkConfig {
        timeout_ms,
        retries,
        ..LinkConfig::new("sim0")
    }
}

pub fn poll(period_ms: u64, degraded_after: u32, failed_after: u32) -> PollSettings {
    PollSettings {
        period_ms,
        waveform_subrate: 0,
        retry_delay_ms: 1,
        degraded_after,
        failed_after,
        queue_capacity: 256,
    }
}

/// Collect events until `stop` matches one or `limit` elapses.
pub fn collect_until(
    events: &EventReceiver,
    limit: Duration,
    mut stop: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let deadline = Instant::now() + limit;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let done = stop(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    seen
}

pub fn states(events: &[Event]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged { new, .. } => Some(*new),
            Event::Reading(_) => None,
        })
        .collect()
}

pub fn readings(events: &[Event]) -> Vec<&Reading> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Reading(r) => Some(r),
            Event::StateChanged { .. } => None,
        })
        .collect()
}

pub fn is_state(event: &Event, state: ConnectionState) -> bool {
    matches!(event, Event::StateChanged { new, .. } if *new == state)
}
