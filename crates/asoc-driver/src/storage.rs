//! Run storage
//!
//! Each run lands in its own directory under the configured output
//! directory:
//!
//! ```text
//! data/
//!   run_1/
//!     events.bin    [u32 LE length][event frame] ...
//!     run.toml      run metadata, written when the run finishes
//!   run_2/
//! ```
//!
//! Frames are stored exactly as the board sends them, so `events.bin` can be
//! re-decoded with [`Event::decode`].

use crate::config::AsocConfig;
use crate::controller::{EventSink, RunSummary, StopReason};
use crate::error::{AsocError, Result};
use crate::frame::{Event, MAX_FRAME_LEN};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Event data file inside a run directory.
pub const EVENTS_FILE: &str = "events.bin";

/// Metadata file inside a run directory.
pub const METADATA_FILE: &str = "run.toml";

const RUN_PREFIX: &str = "run_";

/// Directory of run `id` under `output_dir`.
#[must_use]
pub fn run_dir(output_dir: &Path, id: u32) -> PathBuf {
    output_dir.join(format!("{RUN_PREFIX}{id}"))
}

/// One more than the highest `run_<n>` under `output_dir` (1 if none).
///
/// # Errors
///
/// Returns an I/O error if the directory exists but cannot be listed.
pub fn next_run_id(output_dir: &Path) -> Result<u32> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(e.into()),
    };
    let mut highest = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_prefix(RUN_PREFIX))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(id) = id {
            highest = highest.max(id);
        }
    }
    Ok(highest.saturating_add(1))
}

/// Contents of `run.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run number
    pub run_id: u32,
    /// Board model name
    pub model: String,
    /// Trigger mode short name
    pub trigger_mode: String,
    /// Lookback mode short name
    pub lookback_mode: String,
    /// Enabled channels
    pub channels: Vec<u8>,
    /// Windows read per event
    pub windows: u16,
    /// Events stored
    pub events: u64,
    /// Raw bytes received from the board
    pub bytes: u64,
    /// Status reads that showed OVERFLOW
    pub overflows: u64,
    /// Frames dropped as undecodable
    pub decode_errors: u64,
    /// Start, seconds since the Unix epoch
    pub started_unix: u64,
    /// Stop, seconds since the Unix epoch
    pub stopped_unix: u64,
    /// Run length in seconds
    pub duration_s: f64,
    /// Why the run ended
    pub stop_reason: String,
}

impl RunMetadata {
    /// Read `run.toml` from a run directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(METADATA_FILE);
        let text = fs::read_to_string(&path)?;
        toml::from_str(&text)
            .map_err(|e| AsocError::decode(format!("{}: {e}", path.display())))
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Writes one run directory.
#[derive(Debug)]
pub struct RunWriter {
    id: u32,
    dir: PathBuf,
    out: BufWriter<File>,
    record: BytesMut,
    events: u64,
    created: SystemTime,
    config: AsocConfig,
}

impl RunWriter {
    /// Create `run_<run_id>` under `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run directory already exists or cannot be
    /// created.
    pub fn create(output_dir: &Path, run_id: u32, config: &AsocConfig) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        let dir = run_dir(output_dir, run_id);
        fs::create_dir(&dir).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                AsocError::config(format!("{} already exists", dir.display()))
            } else {
                e.into()
            }
        })?;
        let out = BufWriter::new(File::create(dir.join(EVENTS_FILE))?);
        info!("Writing run {run_id} to {}", dir.display());
        Ok(Self {
            id: run_id,
            dir,
            out,
            record: BytesMut::new(),
            events: 0,
            created: SystemTime::now(),
            config: config.clone(),
        })
    }

    /// Create the next free run under the configured output directory.
    ///
    /// # Errors
    ///
    /// See [`Self::create`].
    pub fn create_next(config: &AsocConfig) -> Result<Self> {
        let output_dir = &config.run.output_dir;
        Self::create(output_dir, next_run_id(output_dir)?, config)
    }

    /// Run number.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Run directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Events written so far.
    #[must_use]
    pub const fn events_written(&self) -> u64 {
        self.events
    }

    /// Flush event data and write `run.toml`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if flushing or writing the metadata fails.
    pub fn finish(mut self, summary: &RunSummary) -> Result<RunMetadata> {
        self.out.flush()?;
        let meta = self.metadata(summary);
        self.write_metadata(&meta)?;
        info!("Run {} finished: {} events in {}", self.id, self.events, self.dir.display());
        Ok(meta)
    }

    /// Close a run that failed before producing a summary.
    ///
    /// A run without events is removed and `None` returned. Otherwise the
    /// events are kept and `run.toml` records `failed: <reason>`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be removed or the
    /// metadata cannot be written.
    pub fn abandon(mut self, reason: &str) -> Result<Option<RunMetadata>> {
        if self.events == 0 {
            drop(self.out);
            fs::remove_dir_all(&self.dir)?;
            info!("Removed empty run {}", self.dir.display());
            return Ok(None);
        }
        self.out.flush()?;
        let now = SystemTime::now();
        let mut meta = self.metadata(&RunSummary {
            events: self.events,
            bytes: 0,
            overflows: 0,
            decode_errors: 0,
            resync_bytes: 0,
            started_at: self.created,
            stopped_at: now,
            duration: now.duration_since(self.created).unwrap_or_default(),
            reason: StopReason::Requested,
        });
        meta.stop_reason = format!("failed: {reason}");
        self.write_metadata(&meta)?;
        warn!("Run {} failed after {} events: {reason}", self.id, self.events);
        Ok(Some(meta))
    }

    fn write_metadata(&self, meta: &RunMetadata) -> Result<()> {
        let text = toml::to_string(meta).map_err(std::io::Error::other)?;
        fs::write(self.dir.join(METADATA_FILE), text)?;
        Ok(())
    }

    fn metadata(&self, summary: &RunSummary) -> RunMetadata {
        let acq = &self.config.acquisition;
        RunMetadata {
            run_id: self.id,
            model: self.config.model.name().to_string(),
            trigger_mode: acq.trigger_mode.name().to_string(),
            lookback_mode: acq.lookback_mode.name().to_string(),
            channels: acq.channels.clone(),
            windows: acq.read_window.windows,
            events: self.events,
            bytes: summary.bytes,
            overflows: summary.overflows,
            decode_errors: summary.decode_errors,
            started_unix: unix_seconds(summary.started_at),
            stopped_unix: unix_seconds(summary.stopped_at),
            duration_s: summary.duration.as_secs_f64(),
            stop_reason: summary.reason.to_string(),
        }
    }
}

impl EventSink for RunWriter {
    fn accept(&mut self, event: Event) -> Result<()> {
        let frame = event.encode()?;
        let len = u32::try_from(frame.len())
            .map_err(|_| AsocError::decode(format!("frame of {} bytes", frame.len())))?;
        self.record.clear();
        self.record.put_u32_le(len);
        self.record.put_slice(&frame);
        self.out.write_all(&self.record)?;
        self.events += 1;
        Ok(())
    }
}

/// Iterates the events of a stored run.
///
/// A truncated trailing record yields one error naming its byte offset,
/// after which iteration ends.
#[derive(Debug)]
pub struct RunReader {
    path: PathBuf,
    input: BufReader<File>,
    offset: u64,
    done: bool,
}

impl RunReader {
    /// Open `events.bin` in `run_dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened.
    pub fn open(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(EVENTS_FILE);
        let input = BufReader::new(File::open(&path)?);
        debug!("Reading {}", path.display());
        Ok(Self {
            path,
            input,
            offset: 0,
            done: false,
        })
    }

    fn truncated(&self, what: &str) -> AsocError {
        AsocError::decode(format!(
            "{}: truncated {what} at offset {}",
            self.path.display(),
            self.offset
        ))
    }

    fn read_record(&mut self) -> Result<Option<Event>> {
        let mut prefix = [0u8; 4];
        match read_full(&mut self.input, &mut prefix)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(self.truncated("length prefix")),
        }
        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN {
            return Err(AsocError::decode(format!(
                "{}: record of {len} bytes at offset {}",
                self.path.display(),
                self.offset
            )));
        }
        let mut frame = vec![0u8; len];
        if read_full(&mut self.input, &mut frame)? != len {
            return Err(self.truncated("record"));
        }
        let event = Event::decode(&frame).map_err(|e| {
            AsocError::decode(format!("{}: offset {}: {e}", self.path.display(), self.offset))
        })?;
        self.offset += 4 + len as u64;
        Ok(Some(event))
    }
}

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

impl Iterator for RunReader {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Per-channel totals in [`RunStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStats {
    /// Events that read this channel out
    pub events: u64,
    /// Sum of per-event mean samples
    mean_sum: f64,
    /// Largest sample seen
    pub peak: u16,
}

impl ChannelStats {
    /// Average of per-event mean sample values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        (self.events > 0).then(|| self.mean_sum / self.events as f64)
    }
}

/// Summary of a stored run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    /// Events read
    pub events: u64,
    /// Lowest event number
    pub first_event: Option<u32>,
    /// Highest event number
    pub last_event: Option<u32>,
    /// Totals per channel
    pub channels: BTreeMap<u8, ChannelStats>,
}

impl RunStats {
    /// Read every event of the run in `run_dir`.
    ///
    /// # Errors
    ///
    /// Returns the first read or decode error.
    pub fn collect(run_dir: &Path) -> Result<Self> {
        let mut stats = Self::default();
        for event in RunReader::open(run_dir)? {
            stats.add(&event?);
        }
        Ok(stats)
    }

    /// Account for one event.
    pub fn add(&mut self, event: &Event) {
        self.events += 1;
        let n = event.event_number;
        self.first_event = Some(self.first_event.map_or(n, |f| f.min(n)));
        self.last_event = Some(self.last_event.map_or(n, |l| l.max(n)));
        for ch in &event.channels {
            let entry = self.channels.entry(ch.channel).or_default();
            entry.events += 1;
            entry.mean_sum += ch.mean().unwrap_or(0.0);
            entry.peak = entry.peak.max(ch.peak().unwrap_or(0));
        }
    }

    /// Events missing from the numbered range, e.g. after an overflow.
    #[must_use]
    pub fn missing_events(&self) -> u64 {
        match (self.first_event, self.last_event) {
            (Some(f), Some(l)) => (u64::from(l) - u64::from(f) + 1).saturating_sub(self.events),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelData;
    use std::time::Duration;

    fn event(n: u32) -> Event {
        Event {
            event_number: n,
            timestamp: u64::from(n) * 100,
            windows: 1,
            samples_per_window: 4,
            channels: vec![
                ChannelData { channel: 0, samples: vec![10, 20, 30, 40] },
                ChannelData { channel: 2, samples: vec![100; 4] },
            ],
        }
    }

    fn summary(events: u64) -> RunSummary {
        let now = SystemTime::now();
        RunSummary {
            events,
            bytes: 1234,
            overflows: 0,
            decode_errors: 0,
            resync_bytes: 0,
            started_at: now - Duration::from_secs(2),
            stopped_at: now,
            duration: Duration::from_secs(2),
            reason: StopReason::EventLimit,
        }
    }

    #[test]
    fn run_ids_count_up() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("data");
        assert_eq!(next_run_id(&out).unwrap(), 1);
        fs::create_dir_all(out.join("run_1")).unwrap();
        fs::create_dir_all(out.join("run_7")).unwrap();
        fs::create_dir_all(out.join("notes")).unwrap();
        assert_eq!(next_run_id(&out).unwrap(), 8);
    }

    #[test]
    fn written_run_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AsocConfig::default();
        let mut writer = RunWriter::create(dir.path(), 1, &config).unwrap();
        for n in 0..3 {
            writer.accept(event(n)).unwrap();
        }
        let run = writer.dir().to_path_buf();
        let meta = writer.finish(&summary(3)).unwrap();

        let events: Vec<Event> = RunReader::open(&run).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(events, vec![event(0), event(1), event(2)]);
        assert_eq!(RunMetadata::load(&run).unwrap(), meta);
        assert_eq!(meta.events, 3);
        assert_eq!(meta.stop_reason, "event limit reached");
        assert_eq!(meta.stopped_unix - meta.started_unix, 2);
    }

    #[test]
    fn existing_run_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let config = AsocConfig::default();
        let _first = RunWriter::create(dir.path(), 4, &config).unwrap();
        let err = RunWriter::create(dir.path(), 4, &config).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn abandoned_empty_run_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::create(dir.path(), 1, &AsocConfig::default()).unwrap();
        let run = writer.dir().to_path_buf();
        assert!(writer.abandon("board did not answer").unwrap().is_none());
        assert!(!run.exists());
        assert_eq!(next_run_id(dir.path()).unwrap(), 1);
    }

    #[test]
    fn abandoned_run_with_events_keeps_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RunWriter::create(dir.path(), 1, &AsocConfig::default()).unwrap();
        writer.accept(event(0)).unwrap();
        let run = writer.dir().to_path_buf();
        let meta = writer.abandon("controller fault").unwrap().unwrap();
        assert_eq!(meta.events, 1);
        assert_eq!(meta.stop_reason, "failed: controller fault");
        assert_eq!(RunMetadata::load(&run).unwrap(), meta);
        assert_eq!(RunStats::collect(&run).unwrap().events, 1);
    }

    #[test]
    fn truncated_record_names_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RunWriter::create(dir.path(), 1, &AsocConfig::default()).unwrap();
        writer.accept(event(0)).unwrap();
        writer.accept(event(1)).unwrap();
        let run = writer.dir().to_path_buf();
        writer.finish(&summary(2)).unwrap();

        let path = run.join(EVENTS_FILE);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let record_len = bytes.len() / 2;
        let mut reader = RunReader::open(&run).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), event(0));
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains(&format!("offset {record_len}")), "{err}");
        assert!(reader.next().is_none());
    }

    #[test]
    fn stats_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RunWriter::create(dir.path(), 1, &AsocConfig::default()).unwrap();
        for n in [0, 1, 3] {
            writer.accept(event(n)).unwrap();
        }
        let run = writer.dir().to_path_buf();
        writer.finish(&summary(3)).unwrap();

        let stats = RunStats::collect(&run).unwrap();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.first_event, Some(0));
        assert_eq!(stats.last_event, Some(3));
        assert_eq!(stats.missing_events(), 1);
        assert_eq!(stats.channels[&0].mean(), Some(25.0));
        assert_eq!(stats.channels[&2].peak, 100);
        assert!(!stats.channels.contains_key(&1));
    }
}
