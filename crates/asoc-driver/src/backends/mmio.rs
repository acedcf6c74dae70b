//! Memory-mapped backend over Linux UIO
//!
//! When the host software runs on the processor next to the FPGA fabric, the
//! readout controller's register block is exposed through a UIO device
//! (`/dev/uioN`). Register `addr` lives at byte offset `addr * 4` of map 0.
//! Event data is popped word by word from the FIFO data register.

// Register access requires exact pointer casts; the block is word-aligned.
#![allow(clippy::cast_ptr_alignment)]

use crate::backend::{BackendType, BoardBackend};
use crate::config::AsocConfig;
use crate::error::{AsocError, Result};
use crate::registers::RegisterMap;
use asoc_chip::regs::{self, names};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Mapping size used when sysfs does not report one.
const FALLBACK_MAP_SIZE: usize = 4096;

/// Mapped UIO region
pub struct UioRegion {
    /// Memory-mapped pointer
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Device node the mapping came from
    path: PathBuf,
}

impl std::fmt::Debug for UioRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UioRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("path", &self.path)
            .finish()
    }
}

// SAFETY: Send - UioRegion owns the mapping exclusively; the mapping is
// process-wide, so moving the owner between threads does not invalidate it.
unsafe impl Send for UioRegion {}

impl UioRegion {
    /// Map region 0 of a UIO device
    ///
    /// `size` overrides the size reported by sysfs.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened or mapped.
    pub fn map(path: &Path, size: Option<usize>) -> Result<Self> {
        let size = size
            .or_else(|| uio_map_size(path))
            .unwrap_or(FALLBACK_MAP_SIZE);
        let min = usize::from(regs::BLOCK_LEN) * 4;
        if size < min {
            return Err(AsocError::config(format!(
                "{}: mapping of {size:#x} bytes is smaller than the register block ({min:#x})",
                path.display()
            )));
        }

        let file: File = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: mmap necessary for MMIO - maps the register block into the
        // process. Invariants: (1) file is an open UIO node; (2) offset 0
        // selects map0; (3) ptr valid for size bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &file,
                0,
            )
            .map_err(|e| {
                AsocError::hardware(format!("Failed to mmap {}: {e}", path.display()))
            })?
        };

        tracing::info!("Mapped {} at {:p}, size={:#x}", path.display(), ptr, size);

        Ok(Self {
            ptr: ptr.cast(),
            size,
            path: path.to_path_buf(),
        })
    }

    fn offset(&self, addr: u16) -> Result<usize> {
        let offset = usize::from(addr) * 4;
        if offset + 4 > self.size {
            return Err(AsocError::hardware(format!(
                "register {addr:#06x} outside mapped region of {:#x} bytes",
                self.size
            )));
        }
        Ok(offset)
    }

    /// Read a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns error if the register lies outside the mapping.
    pub fn read32(&self, addr: u16) -> Result<u32> {
        let offset = self.offset(addr)?;
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: ptr from mmap, offset+4 <= size, word aligned.
        Ok(unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) })
    }

    /// Write a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns error if the register lies outside the mapping.
    pub fn write32(&mut self, addr: u16, value: u32) -> Result<()> {
        let offset = self.offset(addr)?;
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side
        // effects. Invariants: ptr from mmap, offset+4 <= size, word aligned.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value) };
        Ok(())
    }

    /// Get region size
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for UioRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in map(); Drop runs
        // at most once and no references into the mapping outlive self.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped {}", self.path.display());
    }
}

/// Read `/sys/class/uio/uioN/maps/map0/size` for a `/dev/uioN` path.
fn uio_map_size(dev: &Path) -> Option<usize> {
    let name = dev.file_name()?.to_str()?;
    let text = std::fs::read_to_string(format!("/sys/class/uio/{name}/maps/map0/size")).ok()?;
    parse_sysfs_size(&text)
}

fn parse_sysfs_size(text: &str) -> Option<usize> {
    let t = text.trim();
    match t.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => t.parse().ok(),
    }
}

/// MMIO backend
#[derive(Debug)]
pub struct MmioBackend {
    region: UioRegion,
    fifo_count: u16,
    fifo_data: u16,
}

impl MmioBackend {
    /// Wrap an existing mapping
    ///
    /// # Errors
    ///
    /// Returns error if the FIFO registers are missing from `map`.
    pub fn new(region: UioRegion, map: &RegisterMap) -> Result<Self> {
        Ok(Self {
            region,
            fifo_count: map.resolve(names::FIFO_COUNT)?,
            fifo_data: map.resolve(names::FIFO_DATA)?,
        })
    }
}

impl BoardBackend for MmioBackend {
    fn init(config: &AsocConfig) -> Result<Self> {
        let path = config
            .device
            .as_deref()
            .ok_or_else(|| AsocError::config("mmio backend needs board.device"))?;
        let region = UioRegion::map(path, None)?;
        Self::new(region, &RegisterMap::for_config(config)?)
    }

    fn read_register(&mut self, addr: u16) -> Result<u32> {
        self.region.read32(addr)
    }

    fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
        self.region.write32(addr, value)
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.region.read32(self.fifo_count)? as usize;
        let words = available.min(buf.len() / 4);
        for chunk in buf.chunks_exact_mut(4).take(words) {
            let word = self.region.read32(self.fifo_data)?;
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        Ok(words * 4)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Mmio
    }

    fn is_ready(&self) -> bool {
        self.region.size() > 0
    }
}
