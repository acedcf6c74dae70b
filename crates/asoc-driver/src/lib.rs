//! Pure Rust control and readout driver for ASoC waveform digitizer boards.
//!
//! Covers the host side of the board: bring-up (reset, clock programming,
//! register presets), acquisition set-up, the run loop, and storage of the
//! event stream.
//!
//! # Backends
//!
//! ```text
//! Production:
//!   UdpBackend       register protocol to the board's Ethernet bridge
//!
//! On-board (software on the FPGA's processor):
//!   MmioBackend      UIO-mapped register block, FIFO drained word by word
//!
//! Development / CI:
//!   SimulatedBackend in-process board model with an event generator
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use asoc_driver::{AsocConfig, AsocController, RunControl, RunLimits, RunWriter};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AsocConfig::load(Path::new("board.toml"))?;
//! let limits = RunLimits::from(&config.run);
//! let mut ctrl = AsocController::open(config)?;
//! let mut writer = RunWriter::create_next(ctrl.config())?;
//!
//! let summary = ctrl.run(&mut writer, limits, &RunControl::new())?;
//! writer.finish(&summary)?;
//! println!("{} events at {:.1} Hz", summary.events, summary.event_rate());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
pub mod clockfile;
pub mod config;
pub mod controller;
mod error;
pub mod frame;
pub mod protocol;
pub mod registers;
pub mod storage;

/// Board model (re-exported from asoc-chip).
pub mod chip {
    pub use asoc_chip::platform::{BoardModel, CLK_SYS_HZ, SAMPLE_MAX};
    pub use asoc_chip::readout::ReadWindow;
    pub use asoc_chip::regs;
    pub use asoc_chip::trigger::{LookbackMode, TriggerMode};
}

pub use backend::{select_backend, BackendType, BoardBackend};
pub use backends::{MmioBackend, SimulatedBackend, UdpBackend, UioRegion};
pub use clockfile::{ClockEntry, ClockFile};
pub use config::{AsocConfig, CONFIG_ENV};
pub use controller::{
    AsocController, EventSink, RunControl, RunLimits, RunState, RunSummary, ServiceReport,
    StopReason,
};
pub use error::{AsocError, Result};
pub use frame::{ChannelData, Event, FrameAssembler};
pub use registers::{RegisterMap, RegisterPreset};
pub use storage::{next_run_id, RunMetadata, RunReader, RunStats, RunWriter};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AsocConfig, AsocController, AsocError, BoardBackend, Event, EventSink, Result,
        RunControl, RunLimits, RunState, RunSummary, RunWriter,
    };
}
