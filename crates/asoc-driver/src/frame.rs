//! Event decoding and stream reassembly
//!
//! The board emits event frames (see [`asoc_chip::event`]) over whatever
//! transport is in use: one frame per datagram on UDP, an unframed word
//! stream from the FIFO on memory-mapped bridges. [`FrameAssembler`] accepts
//! bytes in arbitrary chunks and hands back whole events, resynchronising on
//! the frame magic after corruption.

use crate::error::{AsocError, Result};
use asoc_chip::event::{self, EventHeader, CHANNEL_PREFIX_LEN, HEADER_LEN, MAGIC};
use asoc_chip::platform::SAMPLE_MAX;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// Largest frame accepted before the header is considered garbage.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Samples of one channel in one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel index on the board
    pub channel: u8,
    /// `windows × samples_per_window` samples, 12-bit
    pub samples: Vec<u16>,
}

impl ChannelData {
    /// Mean sample value, `None` for an empty block.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|&s| u64::from(s)).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    /// Largest sample.
    #[must_use]
    pub fn peak(&self) -> Option<u16> {
        self.samples.iter().copied().max()
    }
}

/// One triggered readout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event number since start
    pub event_number: u32,
    /// Trigger timestamp, system clock ticks
    pub timestamp: u64,
    /// Windows per channel
    pub windows: u16,
    /// Samples per window
    pub samples_per_window: u16,
    /// One block per enabled channel
    pub channels: Vec<ChannelData>,
}

impl Event {
    /// Decode one complete frame.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the header is missing or unsupported, the
    /// slice length disagrees with the header, or a sample exceeds 12 bits.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = EventHeader::parse(frame)
            .ok_or_else(|| AsocError::decode("missing or short event header"))?;
        if header.version != event::VERSION {
            return Err(AsocError::decode(format!(
                "unsupported frame version {}",
                header.version
            )));
        }
        if frame.len() != header.frame_len() {
            return Err(AsocError::decode(format!(
                "frame length {} does not match header ({})",
                frame.len(),
                header.frame_len()
            )));
        }

        let per_channel = header.samples_per_channel();
        let mut body = &frame[HEADER_LEN..];
        let mut channels = Vec::with_capacity(usize::from(header.channel_count));
        for _ in 0..header.channel_count {
            let channel = body.get_u8();
            let _reserved = body.get_u8();
            let mut samples = Vec::with_capacity(per_channel);
            for _ in 0..per_channel {
                let s = body.get_u16();
                if s > SAMPLE_MAX {
                    return Err(AsocError::decode(format!(
                        "event {}: channel {channel} sample {s:#06x} exceeds 12 bits",
                        header.event_number
                    )));
                }
                samples.push(s);
            }
            channels.push(ChannelData { channel, samples });
        }

        Ok(Self {
            event_number: header.event_number,
            timestamp: header.timestamp,
            windows: header.window_count,
            samples_per_window: header.samples_per_window,
            channels,
        })
    }

    /// Frame header describing this event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event holds more than 255 channel blocks.
    pub fn header(&self) -> Result<EventHeader> {
        let channel_count = u8::try_from(self.channels.len()).map_err(|_| {
            AsocError::invalid_event(format!(
                "{} channel blocks, a frame holds at most 255",
                self.channels.len()
            ))
        })?;
        Ok(EventHeader {
            version: event::VERSION,
            channel_count,
            event_number: self.event_number,
            timestamp: self.timestamp,
            window_count: self.windows,
            samples_per_window: self.samples_per_window,
        })
    }

    /// Encode into the wire frame format.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be built or a channel does not
    /// hold exactly `windows × samples_per_window` samples.
    pub fn encode(&self) -> Result<Bytes> {
        let header = self.header()?;
        let per_channel = header.samples_per_channel();
        let mut buf = BytesMut::with_capacity(header.frame_len());
        buf.put_slice(&header.to_bytes());
        for ch in &self.channels {
            if ch.samples.len() != per_channel {
                return Err(AsocError::invalid_event(format!(
                    "channel {} has {} samples, expected {per_channel}",
                    ch.channel,
                    ch.samples.len()
                )));
            }
            buf.put_u8(ch.channel);
            buf.put_u8(0);
            for &sample in &ch.samples {
                buf.put_u16(sample);
            }
        }
        Ok(buf.freeze())
    }

    /// Block for `channel`, if it was read out.
    #[must_use]
    pub fn channel(&self, channel: u8) -> Option<&ChannelData> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

/// Reassembles event frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
    discarded: u64,
}

impl FrameAssembler {
    /// Empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Bytes thrown away while resynchronising.
    #[must_use]
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop anything buffered (used when a run ends with a partial frame).
    pub fn clear(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }

    /// Next complete event, if one is buffered.
    ///
    /// A frame with a valid header whose body fails to decode is consumed and
    /// reported as `Some(Err(..))`; later frames are still delivered.
    pub fn next_event(&mut self) -> Option<Result<Event>> {
        loop {
            self.resync();
            let header = EventHeader::parse(&self.buf)?;
            let len = header.frame_len();
            if header.version != event::VERSION || header.channel_count == 0 || len > MAX_FRAME_LEN
            {
                // Not a real frame start; skip the magic and search again.
                debug!("Discarding bogus frame header (version {}, len {len})", header.version);
                self.skip(1);
                continue;
            }
            if self.buf.len() < len {
                return None;
            }
            let frame = self.buf.split_to(len);
            return Some(Event::decode(&frame));
        }
    }

    /// Drain every complete event currently buffered.
    ///
    /// Decode failures are logged and skipped.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(next) = self.next_event() {
            match next {
                Ok(ev) => out.push(ev),
                Err(e) => warn!("Dropping undecodable event: {e}"),
            }
        }
        out
    }

    fn resync(&mut self) {
        if self.buf.starts_with(&MAGIC) {
            return;
        }
        let pos = self.buf.windows(2).position(|w| w == MAGIC);
        let skip = match pos {
            Some(p) => p,
            // Keep a trailing first magic byte; its partner may be in flight.
            None if self.buf.last() == Some(&MAGIC[0]) => self.buf.len() - 1,
            None => self.buf.len(),
        };
        if skip > 0 {
            warn!("Resynchronising event stream: discarded {skip} bytes");
            self.skip(skip);
        }
    }

    fn skip(&mut self, n: usize) {
        self.buf.advance(n);
        self.discarded += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32, channels: &[u8]) -> Event {
        Event {
            event_number: n,
            timestamp: u64::from(n) * 1000,
            windows: 2,
            samples_per_window: 4,
            channels: channels
                .iter()
                .map(|&c| ChannelData {
                    channel: c,
                    samples: (0..8).map(|i| u16::from(c) * 100 + i).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let ev = event(3, &[0, 2]);
        assert_eq!(Event::decode(&ev.encode().unwrap()).unwrap(), ev);
    }

    #[test]
    fn decode_rejects_wide_samples() {
        let mut ev = event(1, &[1]);
        ev.channels[0].samples[3] = 0x1000;
        let err = Event::decode(&ev.encode().unwrap()).unwrap_err();
        assert!(err.to_string().contains("exceeds 12 bits"));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let bytes = event(1, &[0]).encode().unwrap();
        assert!(Event::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn assembler_handles_byte_at_a_time() {
        let a = event(1, &[0]);
        let b = event(2, &[0, 1, 3]);
        let mut stream = a.encode().unwrap().to_vec();
        stream.extend_from_slice(&b.encode().unwrap());

        let mut asm = FrameAssembler::new();
        let mut got = Vec::new();
        for byte in stream {
            asm.push(&[byte]);
            got.extend(asm.drain_events());
        }
        assert_eq!(got, vec![a, b]);
        assert_eq!(asm.pending(), 0);
        assert_eq!(asm.discarded(), 0);
    }

    #[test]
    fn assembler_resyncs_after_garbage() {
        let ev = event(9, &[2]);
        let mut asm = FrameAssembler::new();
        asm.push(&[0xFF, 0x00, b'E', 0x13]);
        asm.push(&ev.encode().unwrap());
        assert_eq!(asm.drain_events(), vec![ev]);
        assert_eq!(asm.discarded(), 4);
    }

    #[test]
    fn assembler_skips_bad_frame_and_continues() {
        let mut bad = event(1, &[0]);
        bad.channels[0].samples[0] = 0xFFFF;
        let good = event(2, &[0]);
        let mut asm = FrameAssembler::new();
        asm.push(&bad.encode().unwrap());
        asm.push(&good.encode().unwrap());
        assert!(asm.next_event().unwrap().is_err());
        assert_eq!(asm.next_event().unwrap().unwrap(), good);
        assert!(asm.next_event().is_none());
    }

    #[test]
    fn encode_rejects_short_channel() {
        let mut ev = event(1, &[0, 1]);
        ev.channels[1].samples.pop();
        let err = ev.encode().unwrap_err();
        assert!(matches!(err, AsocError::InvalidEvent { .. }));
        assert!(err.to_string().contains("channel 1 has 7 samples, expected 8"));
    }

    #[test]
    fn header_rejects_too_many_channels() {
        let mut ev = event(1, &[0]);
        ev.channels = vec![ev.channels[0].clone(); 256];
        assert!(matches!(ev.header(), Err(AsocError::InvalidEvent { .. })));
        assert!(ev.encode().is_err());
        ev.channels.truncate(255);
        assert_eq!(ev.header().unwrap().channel_count, 255);
    }

    #[test]
    fn channel_statistics() {
        let ch = ChannelData { channel: 0, samples: vec![10, 20, 30] };
        assert_eq!(ch.mean(), Some(20.0));
        assert_eq!(ch.peak(), Some(30));
        assert_eq!(ChannelData { channel: 0, samples: vec![] }.mean(), None);
    }
}
