//! Register block of the FPGA readout controller.
//!
//! Addresses are 16-bit *word* addresses. Over UDP they travel as-is in the
//! request packet; over a memory-mapped bridge register `a` sits at byte
//! offset `a * 4`.
//!
//! ```text
//! 0x00        identity              read-only
//! 0x01        control               write-only strobes
//! 0x02        status                read-only
//! 0x03-0x08   channel enable, trigger/lookback mode, read window
//! 0x09-0x0A   data receiver address (IPv4, port)
//! 0x0B-0x0C   indirect clock-chip access
//! 0x0D-0x0F   data FIFO and event counter
//! 0x10+ch     trigger threshold per channel
//! 0x20+ch     bias DAC per channel
//! ```
//!
//! A board whose bridge uses a different layout is described with a
//! register-map file in the driver; the names below stay the same.

// ── Identity, control, status ────────────────────────────────────────────────

/// Firmware identity word.
pub const IDENTITY: u16 = 0x00;
/// Control strobes, see [`control`].
pub const CONTROL: u16 = 0x01;
/// Status bits, see [`status`].
pub const STATUS: u16 = 0x02;

// ── Acquisition set-up ───────────────────────────────────────────────────────

/// Bit N enables channel N.
pub const CHANNEL_ENABLE: u16 = 0x03;
/// Trigger mode, encoded by [`crate::trigger::TriggerMode::register_value`].
pub const TRIGGER_MODE: u16 = 0x04;
/// Lookback mode, encoded by [`crate::trigger::LookbackMode::register_value`].
pub const LOOKBACK_MODE: u16 = 0x05;
/// Windows read out per event.
pub const READ_WINDOWS: u16 = 0x06;
/// Lookback, in windows.
pub const READ_LOOKBACK: u16 = 0x07;
/// Windows written after the trigger arrives.
pub const READ_WRITE_AFTER_TRIG: u16 = 0x08;

// ── Data receiver ────────────────────────────────────────────────────────────

/// IPv4 address of the data receiver, big-endian.
pub const RECEIVER_IP: u16 = 0x09;
/// UDP port of the data receiver.
pub const RECEIVER_PORT: u16 = 0x0A;

// ── Clock chip (indirect) ────────────────────────────────────────────────────

/// Clock-chip register address latch.
pub const CLOCK_ADDR: u16 = 0x0B;
/// Clock-chip data; a write commits to the latched address.
pub const CLOCK_DATA: u16 = 0x0C;

// ── Data path ────────────────────────────────────────────────────────────────

/// Number of 32-bit words waiting in the data FIFO.
pub const FIFO_COUNT: u16 = 0x0D;
/// Reading pops one 32-bit word from the data FIFO.
pub const FIFO_DATA: u16 = 0x0E;
/// Events produced since the last start.
pub const EVENT_COUNT: u16 = 0x0F;

// ── Per-channel banks ────────────────────────────────────────────────────────

/// First trigger threshold register; channel N lives at `base + N`.
pub const TRIGGER_THRESHOLD_BASE: u16 = 0x10;
/// First bias DAC register; channel N lives at `base + N`.
pub const DAC_BASE: u16 = 0x20;
/// Size of each per-channel bank.
pub const CHANNEL_BANK_LEN: u16 = 0x10;

/// Register names as used in register-map and preset files.
#[allow(missing_docs)]
pub mod names {
    pub const IDENTITY: &str = "identity";
    pub const CONTROL: &str = "control";
    pub const STATUS: &str = "status";
    pub const CHANNEL_ENABLE: &str = "channel_enable";
    pub const TRIGGER_MODE: &str = "trigger_mode";
    pub const LOOKBACK_MODE: &str = "lookback_mode";
    pub const READ_WINDOWS: &str = "read_windows";
    pub const READ_LOOKBACK: &str = "read_lookback";
    pub const READ_WRITE_AFTER_TRIG: &str = "read_write_after_trig";
    pub const RECEIVER_IP: &str = "receiver_ip";
    pub const RECEIVER_PORT: &str = "receiver_port";
    pub const CLOCK_ADDR: &str = "clock_addr";
    pub const CLOCK_DATA: &str = "clock_data";
    pub const FIFO_COUNT: &str = "fifo_count";
    pub const FIFO_DATA: &str = "fifo_data";
    pub const EVENT_COUNT: &str = "event_count";
    pub const TRIGGER_THRESHOLD_BASE: &str = "trigger_threshold_base";
    pub const DAC_BASE: &str = "dac_base";
}

/// Default name → address table.
pub const DEFAULT_MAP: &[(&str, u16)] = &[
    (names::IDENTITY, IDENTITY),
    (names::CONTROL, CONTROL),
    (names::STATUS, STATUS),
    (names::CHANNEL_ENABLE, CHANNEL_ENABLE),
    (names::TRIGGER_MODE, TRIGGER_MODE),
    (names::LOOKBACK_MODE, LOOKBACK_MODE),
    (names::READ_WINDOWS, READ_WINDOWS),
    (names::READ_LOOKBACK, READ_LOOKBACK),
    (names::READ_WRITE_AFTER_TRIG, READ_WRITE_AFTER_TRIG),
    (names::RECEIVER_IP, RECEIVER_IP),
    (names::RECEIVER_PORT, RECEIVER_PORT),
    (names::CLOCK_ADDR, CLOCK_ADDR),
    (names::CLOCK_DATA, CLOCK_DATA),
    (names::FIFO_COUNT, FIFO_COUNT),
    (names::FIFO_DATA, FIFO_DATA),
    (names::EVENT_COUNT, EVENT_COUNT),
    (names::TRIGGER_THRESHOLD_BASE, TRIGGER_THRESHOLD_BASE),
    (names::DAC_BASE, DAC_BASE),
];

/// Highest address used by the default layout, plus one.
pub const BLOCK_LEN: u16 = DAC_BASE + CHANNEL_BANK_LEN;

// ── Control register bit definitions ─────────────────────────────────────────

/// Control register strobes.
pub mod control {
    /// Reset the readout controller and the ASIC.
    pub const RESET:      u32 = 1 << 0;
    /// Start acquisition.
    pub const START:      u32 = 1 << 1;
    /// Stop acquisition.
    pub const STOP:       u32 = 1 << 2;
    /// Issue one software trigger.
    pub const SW_TRIGGER: u32 = 1 << 3;
    /// Push partially built frames into the FIFO.
    pub const FLUSH:      u32 = 1 << 4;
}

// ── Status register bit definitions ──────────────────────────────────────────

/// Status register bits.
pub mod status {
    /// Controller out of reset and accepting commands.
    pub const READY:          u32 = 1 << 0;
    /// Acquisition running.
    pub const RUNNING:        u32 = 1 << 1;
    /// Data FIFO not empty.
    pub const DATA_AVAILABLE: u32 = 1 << 2;
    /// Events were dropped because the FIFO was full. Cleared on read.
    pub const OVERFLOW:       u32 = 1 << 3;
    /// Controller fault; requires reset.
    pub const ERROR:          u32 = 1 << 4;
}
