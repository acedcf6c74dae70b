//! Board model for ASoC waveform digitizer readout.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the board as seen from the host: platform constants, the
//! FPGA readout controller's register block, trigger and lookback modes,
//! the read window, and the event frame format the board streams out.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`platform`] | System clock, board models and their channel/window geometry |
//! | [`regs`] | Register block of the readout controller: addresses and bits |
//! | [`trigger`] | Trigger mode (imm / ext / self) and lookback mode |
//! | [`readout`] | Read window (windows, lookback, write-after-trigger) |
//! | [`event`] | Event frame header layout and size arithmetic |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod event;
pub mod platform;
pub mod readout;
pub mod regs;
pub mod trigger;
