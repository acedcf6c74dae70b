// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated board backend
//!
//! Implements the `BoardBackend` trait with an in-process model of the
//! readout controller: a register file decoded through the same
//! [`RegisterMap`] the host uses, the control strobes, a byte FIFO, and an
//! event generator. This enables:
//!
//! 1. **CI without hardware**: every controller path (init, configure,
//!    start, service, stop/flush) runs against it.
//!
//! 2. **Dry runs**: a configuration can be exercised end to end, including
//!    run storage, before a board is attached.
//!
//! ## Behaviour
//!
//! ```text
//! RESET       clear registers and FIFO, set READY
//! START       set RUNNING, zero the event counter
//! STOP        clear RUNNING (queued data stays for draining)
//! SW_TRIGGER  queue one event if running
//! FLUSH       no-op: frames are queued whole
//! ```
//!
//! While running, each `read_data` call generates one event in immediate
//! mode, one event in self-trigger mode when any enabled channel's threshold
//! is at or below the simulated pulse height, and none in external mode.
//! When an event does not fit in the FIFO it is dropped and OVERFLOW is set.

use crate::backend::{BackendType, BoardBackend};
use crate::config::AsocConfig;
use crate::error::{AsocError, Result};
use crate::frame::{ChannelData, Event};
use crate::registers::RegisterMap;
use asoc_chip::platform::{BoardModel, SAMPLE_MAX};
use asoc_chip::regs::{control, names, status, CHANNEL_BANK_LEN};
use asoc_chip::trigger::TriggerMode;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Identity word reported by the simulated controller.
pub const SIM_IDENTITY: u32 = 0x5A0C_0003;

/// Default pulse height, in ADC counts.
pub const DEFAULT_PULSE_HEIGHT: u16 = 0x0800;

/// Default FIFO capacity in bytes.
pub const DEFAULT_FIFO_BYTES: usize = 1 << 20;

/// Baseline when no DAC value was written.
const DEFAULT_BASELINE: u16 = 0x0100;

/// Ticks between generated events (1 ms at 100 MHz).
const TICKS_PER_EVENT: u64 = 100_000;

/// Decoded role of a register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Identity,
    Control,
    Status,
    FifoCount,
    FifoData,
    EventCount,
    ClockAddr,
    ClockData,
    Threshold(u16),
    Dac(u16),
    Storage,
}

/// Simulated board backend.
#[derive(Debug)]
pub struct SimulatedBackend {
    model: BoardModel,
    map: RegisterMap,
    decode: BTreeMap<u16, Role>,
    /// Plain read/write registers
    values: BTreeMap<u16, u32>,
    ready: bool,
    running: bool,
    overflow: bool,
    fault: bool,
    fifo: VecDeque<u8>,
    fifo_capacity: usize,
    events_generated: u32,
    events_dropped: u64,
    pulse_height: u16,
    clock_latch: u16,
    clock_writes: Vec<(u16, u32)>,
}

impl SimulatedBackend {
    /// Create a simulated board decoding `map`.
    ///
    /// # Errors
    ///
    /// Returns an error if `map` lacks a register the simulator needs or a
    /// channel bank runs past the end of the address space.
    pub fn new(model: BoardModel, map: RegisterMap) -> Result<Self> {
        let mut decode = BTreeMap::new();
        for (_, addr) in map.iter() {
            decode.insert(addr, Role::Storage);
        }
        let fixed = [
            (names::IDENTITY, Role::Identity),
            (names::CONTROL, Role::Control),
            (names::STATUS, Role::Status),
            (names::FIFO_COUNT, Role::FifoCount),
            (names::FIFO_DATA, Role::FifoData),
            (names::EVENT_COUNT, Role::EventCount),
            (names::CLOCK_ADDR, Role::ClockAddr),
            (names::CLOCK_DATA, Role::ClockData),
        ];
        for (name, role) in fixed {
            decode.insert(map.resolve(name)?, role);
        }
        for ch in 0..CHANNEL_BANK_LEN {
            decode.insert(map.trigger_threshold(usize::from(ch))?, Role::Threshold(ch));
            decode.insert(map.dac(usize::from(ch))?, Role::Dac(ch));
        }

        Ok(Self {
            model,
            map,
            decode,
            values: BTreeMap::new(),
            ready: false,
            running: false,
            overflow: false,
            fault: false,
            fifo: VecDeque::new(),
            fifo_capacity: DEFAULT_FIFO_BYTES,
            events_generated: 0,
            events_dropped: 0,
            pulse_height: DEFAULT_PULSE_HEIGHT,
            clock_latch: 0,
            clock_writes: Vec::new(),
        })
    }

    /// Simulated ASoCv3 with the default register layout.
    ///
    /// # Panics
    ///
    /// Never: the default layout holds every register the simulator needs.
    #[must_use]
    pub fn default_board() -> Self {
        Self::new(BoardModel::Simulated, RegisterMap::default())
            .expect("default register map is complete")
    }

    /// Set the FIFO capacity in bytes.
    #[must_use]
    pub fn with_fifo_capacity(mut self, bytes: usize) -> Self {
        self.fifo_capacity = bytes;
        self
    }

    /// Set the simulated pulse height (clamped to 12 bits).
    pub fn set_pulse_height(&mut self, height: u16) {
        self.pulse_height = height.min(SAMPLE_MAX);
    }

    /// Signal on the trigger input: queues one event if running.
    pub fn inject_trigger(&mut self) {
        if self.running {
            self.generate_event();
        }
    }

    /// Raise the controller fault bit, as a broken link or PLL unlock would.
    pub fn inject_fault(&mut self) {
        self.fault = true;
    }

    /// Clock-chip writes received since the last reset, in order.
    #[must_use]
    pub fn clock_writes(&self) -> &[(u16, u32)] {
        &self.clock_writes
    }

    /// Whether acquisition is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Events dropped because the FIFO was full.
    #[must_use]
    pub const fn events_dropped(&self) -> u64 {
        self.events_dropped
    }

    /// Bytes waiting in the FIFO.
    #[must_use]
    pub fn fifo_len(&self) -> usize {
        self.fifo.len()
    }

    /// Value of a plain register by name (0 when never written).
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not mapped.
    pub fn register(&self, name: &str) -> Result<u32> {
        let addr = self.map.resolve(name)?;
        Ok(self.values.get(&addr).copied().unwrap_or(0))
    }

    fn named(&self, name: &str) -> u32 {
        self.map
            .resolve(name)
            .ok()
            .and_then(|a| self.values.get(&a).copied())
            .unwrap_or(0)
    }

    fn bank_value(&self, base: &str, ch: u16) -> Option<u32> {
        let addr = self.map.resolve(base).ok()?.checked_add(ch)?;
        self.values.get(&addr).copied()
    }

    fn role(&self, addr: u16) -> Result<Role> {
        self.decode
            .get(&addr)
            .copied()
            .ok_or_else(|| AsocError::hardware(format!("register {addr:#06x} not decoded by board")))
    }

    fn enabled_channels(&self) -> Vec<u16> {
        let mask = self.named(names::CHANNEL_ENABLE);
        (0..self.model.channel_count())
            .filter_map(|c| u16::try_from(c).ok())
            .filter(|c| mask & (1 << c) != 0)
            .collect()
    }

    fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::from_register(self.named(names::TRIGGER_MODE)).unwrap_or_default()
    }

    fn self_trigger_fires(&self) -> bool {
        self.enabled_channels().iter().any(|&ch| {
            self.bank_value(names::TRIGGER_THRESHOLD_BASE, ch)
                .is_some_and(|t| t <= u32::from(self.pulse_height))
        })
    }

    fn reset(&mut self) {
        self.values.clear();
        self.fifo.clear();
        self.clock_writes.clear();
        self.running = false;
        self.overflow = false;
        self.fault = false;
        self.events_generated = 0;
        self.ready = true;
        info!("Simulated board reset");
    }

    fn control(&mut self, bits: u32) {
        if bits & control::RESET != 0 {
            self.reset();
        }
        if bits & control::STOP != 0 {
            self.running = false;
            debug!("Simulated board stopped after {} events", self.events_generated);
        }
        if bits & control::START != 0 {
            self.running = true;
            self.events_generated = 0;
            debug!("Simulated board started ({})", self.trigger_mode());
        }
        if bits & control::SW_TRIGGER != 0 {
            self.inject_trigger();
        }
    }

    fn generate_event(&mut self) {
        let windows = u16::try_from(self.named(names::READ_WINDOWS))
            .ok()
            .filter(|w| *w > 0)
            .unwrap_or(1);
        let spw = u16::try_from(self.model.samples_per_window()).unwrap_or(u16::MAX);
        let n = usize::from(windows) * usize::from(spw);
        let number = self.events_generated;

        let channels = self
            .enabled_channels()
            .into_iter()
            .map(|ch| {
                let baseline = self
                    .bank_value(names::DAC_BASE, ch)
                    .and_then(|v| u16::try_from(v).ok())
                    .unwrap_or(DEFAULT_BASELINE)
                    .min(SAMPLE_MAX);
                ChannelData {
                    channel: u8::try_from(ch).unwrap_or(u8::MAX),
                    samples: pulse(n, baseline, self.pulse_height, number),
                }
            })
            .collect();

        let event = Event {
            event_number: number,
            timestamp: u64::from(number) * TICKS_PER_EVENT,
            windows,
            samples_per_window: spw,
            channels,
        };
        self.events_generated = self.events_generated.wrapping_add(1);

        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Simulated event {number} not queued: {e}");
                return;
            }
        };
        if self.fifo.len() + frame.len() > self.fifo_capacity {
            self.overflow = true;
            self.events_dropped += 1;
            warn!("Simulated FIFO full, dropped event {number}");
            return;
        }
        self.fifo.extend(frame.iter());
    }

    fn status_word(&mut self) -> u32 {
        let mut word = 0;
        if self.ready {
            word |= status::READY;
        }
        if self.running {
            word |= status::RUNNING;
        }
        if !self.fifo.is_empty() {
            word |= status::DATA_AVAILABLE;
        }
        if self.overflow {
            word |= status::OVERFLOW;
            self.overflow = false;
        }
        if self.fault {
            word |= status::ERROR;
        }
        word
    }

    fn pop_word(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        for b in &mut bytes {
            *b = self.fifo.pop_front().unwrap_or(0);
        }
        u32::from_be_bytes(bytes)
    }
}

/// Triangular pulse over a baseline, with a small event-dependent ripple.
fn pulse(n: usize, baseline: u16, height: u16, event_number: u32) -> Vec<u16> {
    let center = n / 2;
    let width = (n / 8).max(1);
    let amplitude = u32::from(height.saturating_sub(baseline));
    (0..n)
        .map(|i| {
            let dist = center.abs_diff(i);
            let shape = width.saturating_sub(dist);
            let bump = amplitude * u32::try_from(shape).unwrap_or(0)
                / u32::try_from(width).unwrap_or(1);
            let ripple = u32::try_from((i + event_number as usize) % 4).unwrap_or(0);
            let value = u32::from(baseline) + bump + ripple;
            u16::try_from(value.min(u32::from(SAMPLE_MAX))).unwrap_or(SAMPLE_MAX)
        })
        .collect()
}

impl BoardBackend for SimulatedBackend {
    fn init(config: &AsocConfig) -> Result<Self> {
        let map = RegisterMap::for_config(config)?;
        Self::new(config.model, map)
    }

    fn read_register(&mut self, addr: u16) -> Result<u32> {
        Ok(match self.role(addr)? {
            Role::Identity => SIM_IDENTITY,
            Role::Control => 0,
            Role::Status => self.status_word(),
            Role::FifoCount => u32::try_from(self.fifo.len().div_ceil(4)).unwrap_or(u32::MAX),
            Role::FifoData => self.pop_word(),
            Role::EventCount => self.events_generated,
            Role::ClockAddr => u32::from(self.clock_latch),
            Role::ClockData | Role::Threshold(_) | Role::Dac(_) | Role::Storage => {
                self.values.get(&addr).copied().unwrap_or(0)
            }
        })
    }

    fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
        match self.role(addr)? {
            Role::Control => self.control(value),
            Role::Identity | Role::Status | Role::FifoCount | Role::FifoData | Role::EventCount => {
                return Err(AsocError::hardware(format!("register {addr:#06x} is read-only")));
            }
            Role::ClockAddr => {
                self.clock_latch = u16::try_from(value).map_err(|_| {
                    AsocError::hardware(format!("clock address {value:#x} exceeds 16 bits"))
                })?;
            }
            Role::ClockData => {
                self.clock_writes.push((self.clock_latch, value));
                self.values.insert(addr, value);
            }
            Role::Threshold(_) | Role::Dac(_) | Role::Storage => {
                self.values.insert(addr, value);
            }
        }
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.running {
            match self.trigger_mode() {
                TriggerMode::Immediate => self.generate_event(),
                TriggerMode::SelfTrigger if self.self_trigger_fires() => self.generate_event(),
                TriggerMode::SelfTrigger | TriggerMode::External => {}
            }
        }
        let n = buf.len().min(self.fifo.len());
        for (dst, src) in buf.iter_mut().zip(self.fifo.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Simulated
    }

    fn is_ready(&self) -> bool {
        true
    }
}
