//! Backend abstraction for board transports
//!
//! Provides one register/data interface over every way of reaching the
//! readout controller: UDP to the board's Ethernet bridge, a memory-mapped
//! UIO region when running on the FPGA's own processor, or the simulated
//! board used in CI.

use crate::config::AsocConfig;
use crate::error::Result;
use std::fmt::Debug;

/// Board backend trait - unified register and data access
pub trait BoardBackend: Debug + Send {
    /// Open the transport described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be opened (socket bind failure,
    /// missing device node, bad configuration).
    fn init(config: &AsocConfig) -> Result<Self>
    where
        Self: Sized;

    /// Read a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, timeout, or an address the board
    /// does not decode.
    fn read_register(&mut self, addr: u16) -> Result<u32>;

    /// Write a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, timeout, or an address the board
    /// does not decode.
    fn write_register(&mut self, addr: u16, value: u32) -> Result<()>;

    /// Move pending event bytes into `buf`
    ///
    /// Returns the number of bytes written; `0` means nothing is pending
    /// right now. Never blocks longer than the backend's poll interval.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;

    /// Check if the transport is open
    fn is_ready(&self) -> bool;
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    /// Register protocol over UDP
    Udp,

    /// Memory-mapped register block via UIO
    Mmio,

    /// Software board, no hardware required
    Simulated,
}

impl BackendType {
    /// Parse a backend name as used in configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "udp" | "ethernet" => Some(Self::Udp),
            "mmio" | "uio" => Some(Self::Mmio),
            "simulated" | "sim" | "software" => Some(Self::Simulated),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Mmio => write!(f, "MMIO (UIO)"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Open the backend named in `config`
///
/// # Errors
///
/// Returns error if the selected backend cannot be initialized.
pub fn select_backend(config: &AsocConfig) -> Result<Box<dyn BoardBackend>> {
    use crate::backends::{MmioBackend, SimulatedBackend, UdpBackend};

    tracing::info!("Using {} backend for {}", config.backend, config.model);
    match config.backend {
        BackendType::Udp => UdpBackend::init(config).map(|b| Box::new(b) as Box<dyn BoardBackend>),
        BackendType::Mmio => {
            MmioBackend::init(config).map(|b| Box::new(b) as Box<dyn BoardBackend>)
        }
        BackendType::Simulated => {
            SimulatedBackend::init(config).map(|b| Box::new(b) as Box<dyn BoardBackend>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names() {
        assert_eq!(BackendType::from_name("UDP"), Some(BackendType::Udp));
        assert_eq!(BackendType::from_name("uio"), Some(BackendType::Mmio));
        assert_eq!(BackendType::from_name("sim"), Some(BackendType::Simulated));
        assert_eq!(BackendType::from_name("ft60x"), None);
    }

    #[test]
    fn default_config_selects_simulated() {
        let backend = select_backend(&AsocConfig::default()).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Simulated);
        assert!(backend.is_ready());
    }
}
