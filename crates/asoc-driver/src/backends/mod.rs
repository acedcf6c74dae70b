//! Board backend implementations
//!
//! Three backends available:
//! - **UDP**: register protocol to the board's Ethernet bridge (production)
//! - **MMIO**: UIO-mapped register block, for software on the FPGA's own
//!   processor
//! - **Simulated**: in-process board model (CI, dry runs)

pub mod mmio;
pub mod simulated;
pub mod udp;

pub use mmio::{MmioBackend, UioRegion};
pub use simulated::SimulatedBackend;
pub use udp::UdpBackend;
