//! Poll engine: one thread per session drives request/response cycles
//! against a single sensor and publishes readings and state changes.
//!
//! # State machine
//!
//! ```text
//! Disconnected -connect-> Connecting -success-> Connected
//! Connected -degraded_after failures-> Degraded -success-> Connected
//! Connecting | Connected | Degraded -failed_after failures-> Failed
//! any -disconnect-> Disconnected
//! ```
//!
//! # Cancellation
//!
//! `disconnect()` never aborts a blocking read. The polling thread checks for
//! a stop request before every attempt and while idle between cycles, so it
//! exits within one response timeout and drops the transport before
//! `disconnect()` returns.

use std::fmt;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::channel::{self, EventReceiver, EventSender};
use crate::config::{LinkConfig, PollSettings};
use crate::errors::{DecodeError, FrameError, Result, SensorError, TransportError};
use crate::frame::{self, RequestFrame, ResponseFrame};
use crate::reading::{Reading, Waveform};
use crate::registers::{Channel, RegisterBlock, RegisterMap};
use crate::transport::{enumerate_ports, PortDescriptor, SerialTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Link counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub checksum_errors: u64,
    pub framing_errors: u64,
    pub sensor_exceptions: u64,
    pub decode_errors: u64,
    pub io_errors: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
}

impl SessionStats {
    fn record_error(&mut self, err: &SensorError) {
        match err {
            SensorError::Transport(TransportError::Timeout(_)) => self.timeouts += 1,
            SensorError::Transport(_) => self.io_errors += 1,
            SensorError::Frame(FrameError::ChecksumInvalid { .. }) => self.checksum_errors += 1,
            SensorError::Frame(FrameError::SensorException { .. }) => self.sensor_exceptions += 1,
            SensorError::Frame(_) => self.framing_errors += 1,
            SensorError::Decode(_) => self.decode_errors += 1,
            SensorError::Config(_) | SensorError::Session(_) => {}
        }
    }
}

enum Command {
    SetWaveformSubrate(u32),
    Stop,
}

/// Why a cycle did not produce a reading.
enum CycleError {
    Sensor(SensorError),
    Stopped,
}

impl From<SensorError> for CycleError {
    fn from(err: SensorError) -> Self {
        CycleError::Sensor(err)
    }
}

impl From<DecodeError> for CycleError {
    fn from(err: DecodeError) -> Self {
        CycleError::Sensor(err.into())
    }
}

struct PollEngine {
    transport: Box<dyn Transport>,
    link: LinkConfig,
    poll: PollSettings,
    map: RegisterMap,
    events: EventSender,
    commands: mpsc::Receiver<Command>,
    stats: Arc<Mutex<SessionStats>>,
    state: ConnectionState,
    consecutive_failures: u32,
    waveform_subrate: u32,
    /// Cycles left before waveforms are due; 0 means due now.
    waveform_countdown: u32,
    sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    tev_waveform: Option<Arc<Waveform>>,
    aa_waveform: Option<Arc<Waveform>>,
}

impl PollEngine {
    fn run(mut self) -> ConnectionState {
        info!(
            "polling slave {} on {} every {:?} (waveform subrate {})",
            self.link.slave_address,
            self.link.port,
            self.poll.period(),
            self.waveform_subrate
        );

        let period = self.poll.period();
        let mut next_cycle = Instant::now();

        loop {
            match self.poll_cycle() {
                Ok(reading) => self.on_success(reading),
                Err(CycleError::Stopped) => break,
                Err(CycleError::Sensor(err)) => self.on_failure(err),
            }

            if self.state == ConnectionState::Failed {
                error!(
                    "sensor on {} unreachable after {} consecutive failed cycles, stopping",
                    self.link.port, self.consecutive_failures
                );
                break;
            }

            next_cycle += period;
            let now = Instant::now();
            if next_cycle < now {
                next_cycle = now;
            }
            if self.pause(next_cycle - now) {
                break;
            }
        }

        let stats = self.stats.lock().map(|s| (*s).clone()).unwrap_or_default();
        info!(
            "poll loop for {} finished in state {}: {:?}",
            self.link.port, self.state, stats
        );
        self.state
    }

    /// Handle pending commands; true when the loop must stop.
    fn check_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::SetWaveformSubrate(n)) => self.set_subrate(n),
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    /// Idle for `duration` while still answering commands; true on stop.
    fn pause(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.check_commands();
            }
            match self.commands.recv_timeout(deadline - now) {
                Ok(Command::SetWaveformSubrate(n)) => self.set_subrate(n),
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    fn set_subrate(&mut self, n: u32) {
        debug!("waveform subrate {} -> {}", self.waveform_subrate, n);
        self.waveform_subrate = n;
        self.waveform_countdown = self.waveform_countdown.min(n.saturating_sub(1));
    }

    fn poll_cycle(&mut self) -> std::result::Result<Reading, CycleError> {
        let block = self
            .map
            .scalar_block()
            .ok_or_else(|| SensorError::Session("register map has no scalars".into()))?;
        let payload = self.read_block(block, "scalars")?;
        let scalars = self.map.decode_scalars(block, &payload)?;

        let waveforms_due = self.waveform_subrate > 0 && self.waveform_countdown == 0;
        let mut fresh = Vec::new();
        if waveforms_due {
            for channel in [Channel::Tev, Channel::Aa] {
                let Some(entry) = self.map.waveform(channel) else {
                    continue;
                };
                let block = self.map.block_of(entry);
                let name = entry.name.clone();
                let payload = self.read_block(block, &name)?;
                let samples = self.map.decode_waveform(channel, &payload)?;
                fresh.push((channel, samples));
            }
        }

        // Nothing below can fail, so cached waveforms only change on a complete cycle.
        let timestamp = self.next_timestamp();
        for (channel, samples) in fresh {
            let waveform = Some(Arc::new(Waveform {
                channel,
                samples,
                captured_at: timestamp,
            }));
            match channel {
                Channel::Tev => self.tev_waveform = waveform,
                Channel::Aa => self.aa_waveform = waveform,
            }
        }
        if waveforms_due {
            self.waveform_countdown = self.waveform_subrate.saturating_sub(1);
        } else {
            self.waveform_countdown = self.waveform_countdown.saturating_sub(1);
        }

        self.sequence += 1;
        Ok(Reading {
            sequence: self.sequence,
            timestamp,
            tev: scalars.tev,
            aa: scalars.aa,
            extras: scalars.extras,
            tev_waveform: self.tev_waveform.clone(),
            aa_waveform: self.aa_waveform.clone(),
        })
    }

    /// Read `block`, split into per-request chunks, and return the reassembled payload.
    fn read_block(
        &mut self,
        block: RegisterBlock,
        field: &str,
    ) -> std::result::Result<Vec<u8>, CycleError> {
        let mut payload = Vec::with_capacity(block.count as usize * 2);
        for chunk in block.chunks() {
            let request =
                RequestFrame::read(self.link.slave_address, self.map.function, chunk.start, chunk.count);
            let response = self.request_with_retry(&request, field)?;
            payload.extend_from_slice(&response.payload);
        }
        Ok(payload)
    }

    fn request_with_retry(
        &mut self,
        request: &RequestFrame,
        field: &str,
    ) -> std::result::Result<ResponseFrame, CycleError> {
        let timeout = self.link.timeout();
        let attempts = self.link.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.check_commands() {
                return Err(CycleError::Stopped);
            }
            if attempt > 1 && self.pause(self.poll.retry_delay()) {
                return Err(CycleError::Stopped);
            }

            self.bump(|s| s.requests += 1);
            let result = frame::transact(self.transport.as_mut(), request, timeout).and_then(|resp| {
                if resp.register_count() != request.count as usize {
                    return Err(DecodeError::LengthMismatch {
                        field: field.to_string(),
                        expected: request.count as usize,
                        actual: resp.register_count(),
                    }
                    .into());
                }
                Ok(resp)
            });

            match result {
                Ok(resp) => {
                    self.bump(|s| s.responses += 1);
                    debug!(
                        "{}: {} registers @ {} (attempt {})",
                        field, request.count, request.address, attempt
                    );
                    return Ok(resp);
                }
                Err(err) => {
                    self.bump(|s| s.record_error(&err));
                    if err.is_sensor_exception() {
                        warn!(
                            "sensor rejected {} read ({} registers @ {}): {}",
                            field, request.count, request.address, err
                        );
                    } else {
                        warn!(
                            "{} read attempt {}/{} failed: {}",
                            field, attempt, attempts, err
                        );
                    }
                    if !err.is_recoverable() {
                        return Err(CycleError::Sensor(err));
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(CycleError::Sensor(last_error.unwrap_or_else(|| {
            SensorError::Session("no read attempts were made".into())
        })))
    }

    fn on_success(&mut self, reading: Reading) {
        self.consecutive_failures = 0;
        self.bump(|s| s.cycles_ok += 1);
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Degraded
        ) {
            self.transition(ConnectionState::Connected);
        }
        debug!(
            "reading #{}: tev={} aa={}",
            reading.sequence, reading.tev, reading.aa
        );
        self.events.publish_reading(reading);
    }

    fn on_failure(&mut self, err: SensorError) {
        self.consecutive_failures += 1;
        self.bump(|s| s.cycles_failed += 1);
        warn!(
            "poll cycle failed ({} consecutive): {}",
            self.consecutive_failures, err
        );

        if self.consecutive_failures >= self.poll.failed_after {
            self.transition(ConnectionState::Failed);
        } else if self.state == ConnectionState::Connected
            && self.consecutive_failures >= self.poll.degraded_after
        {
            self.transition(ConnectionState::Degraded);
        }
    }

    fn transition(&mut self, new: ConnectionState) {
        let old = self.state;
        if old == new {
            return;
        }
        match new {
            ConnectionState::Degraded | ConnectionState::Failed => {
                warn!("connection {} -> {}", old, new)
            }
            _ => info!("connection {} -> {}", old, new),
        }
        self.state = new;
        self.events.publish_state(old, new);
    }

    /// Wall-clock time, nudged forward if the clock did not advance.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn bump(&self, f: impl FnOnce(&mut SessionStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// A running polling session.
///
/// Owns the polling thread; the serial port lives on that thread only.
/// Dropping the session disconnects it.
pub struct Session {
    port: String,
    commands: mpsc::Sender<Command>,
    events: EventSender,
    stats: Arc<Mutex<SessionStats>>,
    worker: Option<JoinHandle<ConnectionState>>,
}

impl Session {
    /// Validate the configuration, open the serial port and start polling.
    pub fn connect(
        link: LinkConfig,
        poll: PollSettings,
        map: RegisterMap,
        events: EventSender,
    ) -> Result<Self> {
        link.validate()?;
        let transport = SerialTransport::open(&link)?;
        Self::start(link, poll, map, Box::new(transport), events)
    }

    /// Start polling over an already-open transport.
    pub fn start(
        link: LinkConfig,
        poll: PollSettings,
        map: RegisterMap,
        transport: Box<dyn Transport>,
        events: EventSender,
    ) -> Result<Self> {
        link.validate()?;
        poll.validate()?;
        map.validate()?;

        let (command_tx, command_rx) = mpsc::channel();
        let stats = Arc::new(Mutex::new(SessionStats::default()));
        events.publish_state(ConnectionState::Disconnected, ConnectionState::Connecting);

        let engine = PollEngine {
            transport,
            waveform_subrate: poll.waveform_subrate,
            link: link.clone(),
            poll,
            map,
            events: events.clone(),
            commands: command_rx,
            stats: stats.clone(),
            state: ConnectionState::Connecting,
            consecutive_failures: 0,
            waveform_countdown: 0,
            sequence: 0,
            last_timestamp: None,
            tev_waveform: None,
            aa_waveform: None,
        };

        let worker = thread::Builder::new()
            .name(format!("tevaa-poll-{}", link.slave_address))
            .spawn(move || engine.run())
            .map_err(|e| spawn_failed(&events, e))?;

        Ok(Self {
            port: link.port,
            commands: command_tx,
            events,
            stats,
            worker: Some(worker),
        })
    }

    /// Stop polling and release the port. Idempotent.
    pub fn disconnect(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.commands.send(Command::Stop);
        let last = match worker.join() {
            Ok(state) => state,
            Err(_) => {
                error!("poll thread for {} panicked", self.port);
                ConnectionState::Failed
            }
        };
        info!("disconnected from {}", self.port);
        self.events.publish_state(last, ConnectionState::Disconnected);
    }

    pub fn is_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn set_waveform_subrate(&self, n: u32) {
        let _ = self.commands.send(Command::SetWaveformSubrate(n));
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().map(|s| (*s).clone()).unwrap_or_default()
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

/// Close the `Connecting` announcement of a session whose thread never started.
fn spawn_failed(events: &EventSender, err: io::Error) -> SensorError {
    error!("failed to spawn poll thread: {}", err);
    events.publish_state(ConnectionState::Connecting, ConnectionState::Disconnected);
    SensorError::Session(format!("failed to spawn poll thread: {err}"))
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Command surface for a display layer: one event stream that outlives
/// individual sessions, plus connect / disconnect / sub-rate control.
pub struct SensorController {
    poll: PollSettings,
    map: RegisterMap,
    sender: EventSender,
    receiver: EventReceiver,
    session: Option<Session>,
}

impl SensorController {
    pub fn new(poll: PollSettings, map: RegisterMap) -> Self {
        let (sender, receiver) = channel::channel(poll.queue_capacity);
        Self {
            poll,
            map,
            sender,
            receiver,
            session: None,
        }
    }

    pub fn list_ports() -> Result<Vec<PortDescriptor>> {
        Ok(enumerate_ports()?)
    }

    /// Open `link` and start a fresh session, ending any current one first.
    pub fn connect(&mut self, link: LinkConfig) -> Result<()> {
        self.disconnect();
        let session = Session::connect(link, self.poll.clone(), self.map.clone(), self.sender.clone())?;
        self.session = Some(session);
        Ok(())
    }

    /// Like [`Self::connect`] over a caller-supplied transport.
    pub fn connect_with(&mut self, link: LinkConfig, transport: Box<dyn Transport>) -> Result<()> {
        self.disconnect();
        let session = Session::start(
            link,
            self.poll.clone(),
            self.map.clone(),
            transport,
            self.sender.clone(),
        )?;
        self.session = Some(session);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect();
        }
    }

    /// Applies to the running session and to later ones.
    pub fn set_waveform_subrate(&mut self, n: u32) {
        self.poll.waveform_subrate = n;
        if let Some(session) = &self.session {
            session.set_waveform_subrate(n);
        }
    }

    pub fn events(&self) -> EventReceiver {
        self.receiver.clone()
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_active)
    }

    pub fn stats(&self) -> Option<SessionStats> {
        self.session.as_ref().map(Session::stats)
    }
}
