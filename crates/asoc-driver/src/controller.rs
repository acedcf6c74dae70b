//! Run controller
//!
//! Drives a board through the acquisition life cycle:
//!
//! ```text
//!   Reset ──init──► Initialized ──configure_default──► Configured
//!                                                        │
//!        ┌──────────── start_run ◄───────────────────────┘
//!        ▼
//!     Running ──service_run (repeat)
//!        │
//!        └──stop_run──► Stopped ──start_run / configure_default──► …
//! ```
//!
//! Every operation checks the current state first; a call from the wrong
//! state returns [`AsocError::InvalidTransition`] and touches nothing.
//! [`AsocController::run`] is the whole flow with exit conditions, and
//! always stops the board once it has been started.

use crate::backend::{select_backend, BoardBackend};
use crate::clockfile::ClockFile;
use crate::config::{AsocConfig, RunConfig};
use crate::error::{AsocError, Result};
use crate::frame::{Event, FrameAssembler};
use crate::registers::{RegisterMap, RegisterPreset};
use asoc_chip::regs::{control, names, status};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, trace, warn};

/// Read buffer handed to `read_data`.
const SCRATCH_LEN: usize = 64 * 1024;

/// Upper bound on reads while draining at stop.
const MAX_DRAIN_READS: usize = 1 << 16;

/// Acquisition life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Power-on, or board state unknown
    Reset,
    /// Reset done, clocks and presets loaded
    Initialized,
    /// Acquisition registers written
    Configured,
    /// Acquisition running
    Running,
    /// Acquisition stopped and drained
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::Initialized => "initialized",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`RunControl::request_stop`] was called, or `stop_run` was called
    /// directly
    Requested,
    /// The event limit was reached
    EventLimit,
    /// The duration limit was reached
    DurationLimit,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "stop requested"),
            Self::EventLimit => write!(f, "event limit reached"),
            Self::DurationLimit => write!(f, "duration limit reached"),
        }
    }
}

/// Shared stop flag for a running loop.
///
/// Clones share the flag, so one can be handed to a signal handler or
/// another thread while the loop holds the other.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    stop: Arc<AtomicBool>,
}

impl RunControl {
    /// New flag, not set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop after the current service call.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Limits checked between service calls.
///
/// Limits are checked between service calls and the final drain may add
/// events, so a run can end with more events than `max_events`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    /// Stop once this many events were delivered
    pub max_events: Option<u64>,
    /// Stop once the run is this old
    pub max_duration: Option<Duration>,
}

impl From<&RunConfig> for RunLimits {
    fn from(run: &RunConfig) -> Self {
        Self {
            max_events: run.max_events,
            max_duration: run.max_duration,
        }
    }
}

/// Destination for decoded events.
pub trait EventSink {
    /// Take one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be stored; the run loop stops.
    fn accept(&mut self, event: Event) -> Result<()>;
}

impl EventSink for Vec<Event> {
    fn accept(&mut self, event: Event) -> Result<()> {
        self.push(event);
        Ok(())
    }
}

/// Outcome of one [`AsocController::service_run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
    /// Events delivered to the sink
    pub events: u64,
    /// Raw bytes read from the board
    pub bytes: u64,
    /// Board reported dropped events since the last status read
    pub overflow: bool,
}

/// Totals for a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Events delivered to the sink
    pub events: u64,
    /// Raw bytes read from the board
    pub bytes: u64,
    /// Status reads that showed OVERFLOW
    pub overflows: u64,
    /// Frames dropped because they did not decode
    pub decode_errors: u64,
    /// Bytes skipped while resynchronising the stream
    pub resync_bytes: u64,
    /// Wall-clock start
    pub started_at: SystemTime,
    /// Wall-clock stop
    pub stopped_at: SystemTime,
    /// Run length
    pub duration: Duration,
    /// Why the run ended
    pub reason: StopReason,
}

impl RunSummary {
    /// Events per second over the whole run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn event_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.events as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct RunCounters {
    started: Instant,
    started_at: SystemTime,
    events: u64,
    bytes: u64,
    overflows: u64,
    decode_errors: u64,
}

impl RunCounters {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: SystemTime::now(),
            events: 0,
            bytes: 0,
            overflows: 0,
            decode_errors: 0,
        }
    }
}

/// Board controller.
///
/// Generic over the backend so tests can reach the concrete simulated
/// board; the default is a boxed trait object from [`select_backend`].
#[derive(Debug)]
pub struct AsocController<B: BoardBackend + ?Sized = dyn BoardBackend> {
    backend: Box<B>,
    config: AsocConfig,
    map: RegisterMap,
    state: RunState,
    assembler: FrameAssembler,
    counters: Option<RunCounters>,
    scratch: Vec<u8>,
}

impl AsocController {
    /// Open the backend named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the backend
    /// cannot be opened.
    pub fn open(config: AsocConfig) -> Result<Self> {
        config.validate()?;
        let backend = select_backend(&config)?;
        Self::new(backend, config)
    }
}

impl<B: BoardBackend + ?Sized> AsocController<B> {
    /// Wrap an opened backend. The controller starts in [`RunState::Reset`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or its register map
    /// cannot be loaded.
    pub fn new(backend: Box<B>, config: AsocConfig) -> Result<Self> {
        config.validate()?;
        let map = RegisterMap::for_config(&config)?;
        Ok(Self {
            backend,
            config,
            map,
            state: RunState::Reset,
            assembler: FrameAssembler::new(),
            counters: None,
            scratch: vec![0; SCRATCH_LEN],
        })
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &AsocConfig {
        &self.config
    }

    /// Register map in use.
    #[must_use]
    pub const fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give the backend back, e.g. to hand it to another controller.
    #[must_use]
    pub fn into_backend(self) -> Box<B> {
        self.backend
    }

    /// Read a register by name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or transport failures.
    pub fn read_named(&mut self, name: &str) -> Result<u32> {
        let addr = self.map.resolve(name)?;
        let value = self.backend.read_register(addr)?;
        trace!("read {name} ({addr:#06x}) = {value:#010x}");
        Ok(value)
    }

    /// Write a register by name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or transport failures.
    pub fn write_named(&mut self, name: &str, value: u32) -> Result<()> {
        let addr = self.map.resolve(name)?;
        debug!("write {name} ({addr:#06x}) = {value:#010x}");
        self.backend.write_register(addr, value)
    }

    /// Adopt the board's current state, for a process that did not start
    /// the run itself (e.g. a separate `stop` invocation).
    ///
    /// RUNNING maps to [`RunState::Running`], READY to
    /// [`RunState::Initialized`], anything else to [`RunState::Reset`].
    ///
    /// # Errors
    ///
    /// Returns an error if the status register cannot be read.
    pub fn attach(&mut self) -> Result<RunState> {
        let st = self.read_named(names::STATUS)?;
        self.state = if st & status::RUNNING != 0 {
            self.counters = Some(RunCounters::start());
            RunState::Running
        } else if st & status::READY != 0 {
            RunState::Initialized
        } else {
            RunState::Reset
        };
        info!("Attached to board in state {} (status {st:#06x})", self.state);
        Ok(self.state)
    }

    /// Reset the board, program its clock, apply the register preset.
    ///
    /// Allowed from any state except [`RunState::Running`].
    ///
    /// # Errors
    ///
    /// Returns an error if the board never reports READY, or a clock or
    /// preset file cannot be loaded or written.
    pub fn init(&mut self) -> Result<()> {
        self.require(&[
            RunState::Reset,
            RunState::Initialized,
            RunState::Configured,
            RunState::Stopped,
        ], RunState::Initialized)?;

        info!(
            "Initializing {} via {} backend",
            self.config.model,
            self.backend.backend_type()
        );
        self.write_named(names::CONTROL, control::RESET)?;
        self.wait_ready()?;

        if let Some(path) = self.config.files.clock.clone() {
            let clock = ClockFile::load(&path)?;
            for entry in &clock.entries {
                self.write_named(names::CLOCK_ADDR, u32::from(entry.address))?;
                self.write_named(names::CLOCK_DATA, entry.data)?;
            }
            info!("Programmed {} clock registers from {}", clock.len(), path.display());
        }

        if let Some(path) = self.config.files.registers.clone() {
            let preset = RegisterPreset::load(&path)?;
            let writes = preset.resolve(&self.map)?;
            for (addr, value) in &writes {
                debug!("preset {addr:#06x} = {value:#010x}");
                self.backend.write_register(*addr, *value)?;
            }
            info!("Applied {} preset registers from {}", writes.len(), path.display());
        }

        let identity = self.read_named(names::IDENTITY)?;
        info!("Board identity {identity:#010x}");

        self.assembler.clear();
        self.counters = None;
        self.state = RunState::Initialized;
        Ok(())
    }

    /// Write the acquisition set-up from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error from the wrong state, on transport failure, or if the
    /// data receiver is not an IPv4 address.
    pub fn configure_default(&mut self) -> Result<()> {
        self.require(&[
            RunState::Initialized,
            RunState::Configured,
            RunState::Stopped,
        ], RunState::Configured)?;

        let acq = self.config.acquisition.clone();
        self.write_named(names::CHANNEL_ENABLE, acq.channel_mask())?;
        for (ch, value) in acq.trigger_values.iter().enumerate() {
            let addr = self.map.trigger_threshold(ch)?;
            self.backend.write_register(addr, u32::from(*value))?;
        }
        for (ch, value) in acq.dac_values.iter().enumerate() {
            let addr = self.map.dac(ch)?;
            self.backend.write_register(addr, u32::from(*value))?;
        }

        let rw = acq.read_window;
        self.write_named(names::READ_WINDOWS, u32::from(rw.windows))?;
        self.write_named(names::READ_LOOKBACK, u32::from(rw.lookback))?;
        self.write_named(names::READ_WRITE_AFTER_TRIG, u32::from(rw.write_after_trig))?;

        if let Some(receiver) = self.config.data_receiver() {
            let IpAddr::V4(ip) = receiver.ip() else {
                return Err(AsocError::config(format!(
                    "data receiver {receiver} must be an IPv4 address"
                )));
            };
            self.write_named(names::RECEIVER_IP, u32::from(ip))?;
            self.write_named(names::RECEIVER_PORT, u32::from(receiver.port()))?;
            debug!("Data receiver set to {receiver}");
        }

        info!(
            "Configured channels {:?}, {} windows (lookback {}, {} after trigger)",
            acq.channels, rw.windows, rw.lookback, rw.write_after_trig
        );
        self.state = RunState::Configured;
        Ok(())
    }

    /// Set trigger and lookback mode and start acquisition.
    ///
    /// # Errors
    ///
    /// Returns an error from the wrong state or on transport failure.
    pub fn start_run(&mut self) -> Result<()> {
        self.require(&[RunState::Configured, RunState::Stopped], RunState::Running)?;

        let acq = &self.config.acquisition;
        let (trigger, lookback) = (acq.trigger_mode, acq.lookback_mode);
        self.write_named(names::TRIGGER_MODE, trigger.register_value())?;
        self.write_named(names::LOOKBACK_MODE, lookback.register_value())?;
        self.write_named(names::CONTROL, control::START)?;

        self.assembler.clear();
        self.counters = Some(RunCounters::start());
        self.state = RunState::Running;
        info!("Run started ({trigger} trigger, {lookback} lookback)");
        Ok(())
    }

    /// Issue one software trigger.
    ///
    /// # Errors
    ///
    /// Returns an error unless running, or on transport failure.
    pub fn software_trigger(&mut self) -> Result<()> {
        self.require(&[RunState::Running], RunState::Running)?;
        self.write_named(names::CONTROL, control::SW_TRIGGER)
    }

    /// Poll status and move pending data into `sink`.
    ///
    /// Reads at most `frames_per_service` chunks from the board.
    ///
    /// # Errors
    ///
    /// Returns an error unless running, when the board reports a fault, on
    /// transport failure, or when the sink fails.
    pub fn service_run<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<ServiceReport> {
        self.require(&[RunState::Running], RunState::Running)?;

        let st = self.read_named(names::STATUS)?;
        if st & status::ERROR != 0 {
            return Err(AsocError::hardware(format!(
                "readout controller fault (status {st:#06x}), reset required"
            )));
        }
        let overflow = st & status::OVERFLOW != 0;
        if overflow {
            warn!("Board FIFO overflow: events were dropped");
        }

        let mut bytes = 0u64;
        for _ in 0..self.config.run.frames_per_service {
            let n = self.backend.read_data(&mut self.scratch)?;
            if n == 0 {
                break;
            }
            bytes += n as u64;
            self.assembler.push(&self.scratch[..n]);
        }
        let (events, decode_errors) = self.deliver(sink)?;

        if let Some(c) = self.counters.as_mut() {
            c.events += events;
            c.bytes += bytes;
            c.decode_errors += decode_errors;
            c.overflows += u64::from(overflow);
        }
        trace!("service: {events} events, {bytes} bytes");
        Ok(ServiceReport {
            events,
            bytes,
            overflow,
        })
    }

    /// Stop acquisition, flush, and drain everything still queued into
    /// `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error unless running, on transport failure, or when the
    /// sink fails.
    pub fn stop_run<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<RunSummary> {
        self.require(&[RunState::Running], RunState::Stopped)?;

        self.write_named(names::CONTROL, control::STOP)?;
        self.write_named(names::CONTROL, control::FLUSH)?;
        let st = self.read_named(names::STATUS)?;
        let overflow = st & status::OVERFLOW != 0;
        if overflow {
            warn!("Board FIFO overflow: events were dropped");
        }

        let mut bytes = 0u64;
        for _ in 0..MAX_DRAIN_READS {
            let n = self.backend.read_data(&mut self.scratch)?;
            if n == 0 {
                break;
            }
            bytes += n as u64;
            self.assembler.push(&self.scratch[..n]);
        }
        let (events, decode_errors) = self.deliver(sink)?;
        let partial = self.assembler.clear();
        if partial > 0 {
            warn!("Discarded {partial} bytes of an incomplete frame at stop");
        }

        let c = self.counters.take().unwrap_or_else(RunCounters::start);
        let summary = RunSummary {
            events: c.events + events,
            bytes: c.bytes + bytes,
            overflows: c.overflows + u64::from(overflow),
            decode_errors: c.decode_errors + decode_errors,
            resync_bytes: self.assembler.discarded(),
            started_at: c.started_at,
            stopped_at: SystemTime::now(),
            duration: c.started.elapsed(),
            reason: StopReason::Requested,
        };
        self.state = RunState::Stopped;
        info!(
            "Run stopped: {} events, {} bytes in {:.3} s",
            summary.events,
            summary.bytes,
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }

    /// Full flow: init, configure, start, service until a limit or a stop
    /// request, then stop.
    ///
    /// Once the run has started, `stop_run` is executed even when servicing
    /// fails; the servicing error is returned in that case.
    ///
    /// # Errors
    ///
    /// Returns the first error from any step.
    pub fn run<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
        limits: RunLimits,
        control: &RunControl,
    ) -> Result<RunSummary> {
        self.init()?;
        self.configure_default()?;
        self.start_run()?;

        let looped = self.service_loop(sink, limits, control);
        let stopped = self.stop_run(sink);
        match (looped, stopped) {
            (Ok(reason), Ok(mut summary)) => {
                summary.reason = reason;
                info!("Run ended: {reason}");
                Ok(summary)
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(stop_err)) => {
                warn!("Stopping after a failed run also failed: {stop_err}");
                Err(e)
            }
        }
    }

    fn service_loop<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
        limits: RunLimits,
        control: &RunControl,
    ) -> Result<StopReason> {
        let started = Instant::now();
        let mut events = 0u64;
        loop {
            if control.is_stop_requested() {
                return Ok(StopReason::Requested);
            }
            if let Some(max) = limits.max_events {
                if events >= max {
                    return Ok(StopReason::EventLimit);
                }
            }
            if let Some(max) = limits.max_duration {
                if started.elapsed() >= max {
                    return Ok(StopReason::DurationLimit);
                }
            }

            let report = self.service_run(sink)?;
            events += report.events;
            if report.bytes == 0 {
                std::thread::sleep(self.config.run.poll_interval);
            }
        }
    }

    fn deliver<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<(u64, u64)> {
        let mut events = 0;
        let mut errors = 0;
        while let Some(next) = self.assembler.next_event() {
            match next {
                Ok(event) => {
                    sink.accept(event)?;
                    events += 1;
                }
                Err(e) => {
                    warn!("Dropping undecodable event: {e}");
                    errors += 1;
                }
            }
        }
        Ok((events, errors))
    }

    fn wait_ready(&mut self) -> Result<()> {
        let timeout = self.config.run.ready_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_named(names::STATUS)? & status::READY != 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AsocError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            std::thread::sleep(self.config.run.poll_interval.min(deadline - now));
        }
    }

    fn require(&self, allowed: &[RunState], target: RunState) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(AsocError::invalid_transition(self.state, target))
        }
    }
}
