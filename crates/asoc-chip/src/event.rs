//! Event frame format streamed by the readout controller.
//!
//! ```text
//! offset size field
//! ────── ──── ──────────────────────────────────────────
//!  0      2   magic  b"EV"
//!  2      1   version (1)
//!  3      1   channel count C
//!  4      4   event number
//!  8      8   timestamp, ticks of CLK_SYS_HZ
//! 16      2   window count W
//! 18      2   samples per window S
//! 20      …   C channel blocks:
//!               [channel u8][reserved u8][W·S samples, u16 each]
//! ```
//!
//! All multi-byte fields are big-endian. Samples are 12-bit.

/// Frame magic.
pub const MAGIC: [u8; 2] = *b"EV";
/// Frame format version.
pub const VERSION: u8 = 1;
/// Header size in bytes.
pub const HEADER_LEN: usize = 20;
/// Bytes before the samples of each channel block.
pub const CHANNEL_PREFIX_LEN: usize = 2;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Format version
    pub version: u8,
    /// Number of channel blocks following the header
    pub channel_count: u8,
    /// Event number, counted by the controller since start
    pub event_number: u32,
    /// Trigger timestamp in system clock ticks
    pub timestamp: u64,
    /// Windows per channel block
    pub window_count: u16,
    /// Samples per window
    pub samples_per_window: u16,
}

impl EventHeader {
    /// Parse a header from the start of `bytes`.
    ///
    /// Returns `None` if fewer than [`HEADER_LEN`] bytes are available or the
    /// magic does not match.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN || bytes[0..2] != MAGIC {
            return None;
        }
        let be16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[8..16]);
        Some(Self {
            version: bytes[2],
            channel_count: bytes[3],
            event_number: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            timestamp: u64::from_be_bytes(ts),
            window_count: be16(16),
            samples_per_window: be16(18),
        })
    }

    /// Serialize into the 20-byte wire layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.channel_count;
        out[4..8].copy_from_slice(&self.event_number.to_be_bytes());
        out[8..16].copy_from_slice(&self.timestamp.to_be_bytes());
        out[16..18].copy_from_slice(&self.window_count.to_be_bytes());
        out[18..20].copy_from_slice(&self.samples_per_window.to_be_bytes());
        out
    }

    /// Samples in each channel block.
    #[must_use]
    pub const fn samples_per_channel(&self) -> usize {
        self.window_count as usize * self.samples_per_window as usize
    }

    /// Total frame length, header included.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        HEADER_LEN
            + self.channel_count as usize * (CHANNEL_PREFIX_LEN + 2 * self.samples_per_channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> EventHeader {
        EventHeader {
            version: VERSION,
            channel_count: 2,
            event_number: 0x0102_0304,
            timestamp: 0x1122_3344_5566_7788,
            window_count: 3,
            samples_per_window: 32,
        }
    }

    #[test]
    fn frame_len_counts_every_block() {
        // 20 + 2 * (2 + 2 * 96)
        assert_eq!(header().frame_len(), 408);
    }

    #[test]
    fn header_bytes_are_big_endian() {
        let bytes = header().to_bytes();
        assert_eq!(&bytes[0..2], b"EV");
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(bytes[8], 0x11);
        assert_eq!(EventHeader::parse(&bytes), Some(header()));
    }

    #[test]
    fn short_or_foreign_input_is_not_a_header() {
        let bytes = header().to_bytes();
        assert_eq!(EventHeader::parse(&bytes[..19]), None);
        let mut bad = bytes;
        bad[0] = b'X';
        assert_eq!(EventHeader::parse(&bad), None);
    }
}
