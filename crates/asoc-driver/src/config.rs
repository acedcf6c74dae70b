// SPDX-License-Identifier: AGPL-3.0-only

//! Board and run configuration
//!
//! One TOML file describes the board, how to reach it, the acquisition
//! set-up and run limits. Every section is optional; an empty file yields a
//! simulated board.
//!
//! ```toml
//! [board]
//! model = "asocv3"
//! backend = "udp"          # udp | mmio | simulated
//!
//! [connection]
//! board = "192.168.1.59:4660"
//! host = "192.168.1.1:4660"
//! target = "192.168.1.2:4661"   # data receiver, defaults to host
//!
//! [files]
//! clock = "clocks/asocv3.txt"
//! registers = "presets/default.toml"
//!
//! [acquisition]
//! channels = [0, 1, 2, 3]
//! trigger_mode = "self"
//! trigger_values = [2100, 2100, 2100, 2100]
//! read_window = { windows = 16, lookback = 16, write_after_trig = 8 }
//!
//! [run]
//! output_dir = "data"
//! max_events = 10000
//! ```
//!
//! Relative paths resolve against the directory holding the file. The
//! `ASOC_CONFIG` environment variable names the default file.

use crate::backend::BackendType;
use crate::error::{AsocError, Result};
use asoc_chip::platform::{BoardModel, SAMPLE_MAX};
use asoc_chip::readout::ReadWindow;
use asoc_chip::trigger::{LookbackMode, TriggerMode};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the default configuration file.
pub const CONFIG_ENV: &str = "ASOC_CONFIG";

/// Complete, typed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AsocConfig {
    /// Board model
    pub model: BoardModel,
    /// Transport to the board
    pub backend: BackendType,
    /// UIO device node for the mmio backend
    pub device: Option<PathBuf>,
    /// Network endpoints for the udp backend
    pub connection: ConnectionConfig,
    /// Auxiliary input files
    pub files: FilesConfig,
    /// Acquisition set-up written by `configure_default` / `start_run`
    pub acquisition: AcquisitionConfig,
    /// Run loop limits and output
    pub run: RunConfig,
}

/// Network endpoints and link timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Board control endpoint
    pub board: Option<SocketAddr>,
    /// Local endpoint the host binds
    pub host: Option<SocketAddr>,
    /// Where the board sends event data; `None` keeps the host endpoint
    pub target: Option<SocketAddr>,
    /// Per-attempt response timeout
    pub timeout: Duration,
    /// Resends after a timeout before giving up
    pub retries: u32,
}

/// Optional files applied during `init`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesConfig {
    /// Clock programming file
    pub clock: Option<PathBuf>,
    /// Register preset file
    pub registers: Option<PathBuf>,
    /// Register map override file
    pub register_map: Option<PathBuf>,
}

/// Acquisition set-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Enabled channels
    pub channels: Vec<u8>,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Lookback mode
    pub lookback_mode: LookbackMode,
    /// Per-channel trigger thresholds, index = channel
    pub trigger_values: Vec<u16>,
    /// Per-channel bias DAC values, index = channel
    pub dac_values: Vec<u16>,
    /// Read window
    pub read_window: ReadWindow,
}

/// Run loop limits and output location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Directory receiving `run_<n>` folders
    pub output_dir: PathBuf,
    /// Stop after this many events
    pub max_events: Option<u64>,
    /// Stop after this long
    pub max_duration: Option<Duration>,
    /// Sleep between service calls that found no data
    pub poll_interval: Duration,
    /// Upper bound on data reads per service call
    pub frames_per_service: usize,
    /// How long `init` waits for the ready bit
    pub ready_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            board: None,
            host: None,
            target: None,
            timeout: Duration::from_millis(500),
            retries: 3,
        }
    }
}

impl AcquisitionConfig {
    /// Default set-up for `model`: all channels, external trigger.
    #[must_use]
    pub fn for_model(model: BoardModel) -> Self {
        Self {
            channels: (0..model.channel_count())
                .filter_map(|c| u8::try_from(c).ok())
                .collect(),
            trigger_mode: TriggerMode::default(),
            lookback_mode: LookbackMode::default(),
            trigger_values: Vec::new(),
            dac_values: Vec::new(),
            read_window: ReadWindow::default(),
        }
    }

    /// Channel enable mask, bit N for channel N.
    #[must_use]
    pub fn channel_mask(&self) -> u32 {
        self.channels
            .iter()
            .filter(|&&c| c < 32)
            .fold(0, |mask, &c| mask | (1 << c))
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            max_events: None,
            max_duration: None,
            poll_interval: Duration::from_millis(10),
            frames_per_service: 64,
            ready_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for AsocConfig {
    fn default() -> Self {
        let model = BoardModel::Simulated;
        Self {
            model,
            backend: BackendType::Simulated,
            device: None,
            connection: ConnectionConfig::default(),
            files: FilesConfig::default(),
            acquisition: AcquisitionConfig::for_model(model),
            run: RunConfig::default(),
        }
    }
}

// ── File representation ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    board: BoardSection,
    connection: ConnectionSection,
    files: FilesSection,
    acquisition: AcquisitionSection,
    run: RunSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BoardSection {
    model: Option<String>,
    backend: Option<String>,
    device: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConnectionSection {
    board: Option<String>,
    host: Option<String>,
    target: Option<String>,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FilesSection {
    clock: Option<PathBuf>,
    registers: Option<PathBuf>,
    register_map: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AcquisitionSection {
    channels: Option<Vec<u8>>,
    trigger_mode: Option<String>,
    lookback_mode: Option<String>,
    trigger_values: Vec<u16>,
    dac_values: Vec<u16>,
    read_window: Option<ReadWindowSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadWindowSection {
    windows: u16,
    lookback: u16,
    write_after_trig: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RunSection {
    output_dir: Option<PathBuf>,
    max_events: Option<u64>,
    max_duration_s: Option<f64>,
    poll_interval_ms: Option<u64>,
    frames_per_service: Option<usize>,
    ready_timeout_ms: Option<u64>,
}

impl AsocConfig {
    /// Load, resolve relative paths and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            AsocError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let config = Self::from_toml(&text, base)
            .map_err(|e| AsocError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `ASOC_CONFIG`, or `None` when it is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but the file is unusable.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)).map(Some),
            None => Ok(None),
        }
    }

    /// Parse TOML text; relative paths are joined onto `base`.
    ///
    /// Does not validate cross-field constraints; call [`Self::validate`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error on syntax errors, unknown keys or
    /// unparseable values.
    pub fn from_toml(text: &str, base: &Path) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text).map_err(|e| AsocError::config(e.to_string()))?;

        let model = match file.board.model.as_deref() {
            Some(name) => BoardModel::from_name(name)
                .ok_or_else(|| AsocError::config(format!("unknown board model `{name}`")))?,
            None => BoardModel::Simulated,
        };
        let backend = match file.board.backend.as_deref() {
            Some(name) => BackendType::from_name(name)
                .ok_or_else(|| AsocError::config(format!("unknown backend `{name}`")))?,
            None if model == BoardModel::Simulated => BackendType::Simulated,
            None => BackendType::Udp,
        };

        let defaults = ConnectionConfig::default();
        let endpoint = |s: Option<String>| s.as_deref().map(parse_endpoint).transpose();
        let connection = ConnectionConfig {
            board: endpoint(file.connection.board)?,
            host: endpoint(file.connection.host)?,
            target: endpoint(file.connection.target)?,
            timeout: file
                .connection
                .timeout_ms
                .map_or(defaults.timeout, Duration::from_millis),
            retries: file.connection.retries.unwrap_or(defaults.retries),
        };

        let resolve = |p: Option<PathBuf>| p.map(|p| base.join(p));
        let files = FilesConfig {
            clock: resolve(file.files.clock),
            registers: resolve(file.files.registers),
            register_map: resolve(file.files.register_map),
        };

        let mut acquisition = AcquisitionConfig::for_model(model);
        let acq = file.acquisition;
        if let Some(channels) = acq.channels {
            acquisition.channels = channels;
        }
        if let Some(name) = acq.trigger_mode.as_deref() {
            acquisition.trigger_mode = TriggerMode::from_name(name)
                .ok_or_else(|| AsocError::config(format!("unknown trigger mode `{name}`")))?;
        }
        if let Some(name) = acq.lookback_mode.as_deref() {
            acquisition.lookback_mode = LookbackMode::from_name(name)
                .ok_or_else(|| AsocError::config(format!("unknown lookback mode `{name}`")))?;
        }
        acquisition.trigger_values = acq.trigger_values;
        acquisition.dac_values = acq.dac_values;
        if let Some(rw) = acq.read_window {
            acquisition.read_window = ReadWindow::new(rw.windows, rw.lookback, rw.write_after_trig);
        }

        let rd = RunConfig::default();
        let max_duration = match file.run.max_duration_s {
            Some(s) if !(s.is_finite() && s > 0.0) => {
                return Err(AsocError::config(format!("max_duration_s must be positive, got {s}")))
            }
            Some(s) => Some(Duration::from_secs_f64(s)),
            None => None,
        };
        let run = RunConfig {
            output_dir: file
                .run
                .output_dir
                .map_or_else(|| base.join(&rd.output_dir), |p| base.join(p)),
            max_events: file.run.max_events,
            max_duration,
            poll_interval: file
                .run
                .poll_interval_ms
                .map_or(rd.poll_interval, Duration::from_millis),
            frames_per_service: file.run.frames_per_service.unwrap_or(rd.frames_per_service),
            ready_timeout: file
                .run
                .ready_timeout_ms
                .map_or(rd.ready_timeout, Duration::from_millis),
        };

        Ok(Self {
            model,
            backend,
            device: file.board.device.map(|p| base.join(p)),
            connection,
            files,
            acquisition,
            run,
        })
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violation.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendType::Udp => {
                if self.connection.board.is_none() {
                    return Err(AsocError::config("udp backend needs connection.board"));
                }
                if self.connection.host.is_none() {
                    return Err(AsocError::config("udp backend needs connection.host"));
                }
            }
            BackendType::Mmio => {
                if self.device.is_none() {
                    return Err(AsocError::config("mmio backend needs board.device"));
                }
            }
            BackendType::Simulated => {}
        }
        if let Some(receiver) = self.data_receiver() {
            if !receiver.is_ipv4() {
                return Err(AsocError::config(format!(
                    "data receiver {receiver} must be an IPv4 address"
                )));
            }
        }
        if self.connection.timeout.is_zero() {
            return Err(AsocError::config("connection.timeout_ms must be positive"));
        }

        let acq = &self.acquisition;
        let channel_count = self.model.channel_count();
        if acq.channels.is_empty() {
            return Err(AsocError::config("at least one channel must be enabled"));
        }
        let mut seen = vec![false; channel_count];
        for &ch in &acq.channels {
            let idx = usize::from(ch);
            if idx >= channel_count {
                return Err(AsocError::config(format!(
                    "channel {ch} out of range for {} ({channel_count} channels)",
                    self.model
                )));
            }
            if seen[idx] {
                return Err(AsocError::config(format!("channel {ch} listed twice")));
            }
            seen[idx] = true;
        }

        if acq.trigger_mode.needs_thresholds() && acq.trigger_values.is_empty() {
            return Err(AsocError::config(
                "trigger mode is self, please provide trigger values for channels",
            ));
        }
        check_channel_values("trigger_values", &acq.trigger_values, channel_count)?;
        check_channel_values("dac_values", &acq.dac_values, channel_count)?;

        acq.read_window.validate(self.model.max_windows())?;

        if self.run.poll_interval.is_zero() {
            return Err(AsocError::config("run.poll_interval_ms must be positive"));
        }
        if self.run.frames_per_service == 0 {
            return Err(AsocError::config("run.frames_per_service must be positive"));
        }
        Ok(())
    }

    /// Where the board should send event data.
    #[must_use]
    pub fn data_receiver(&self) -> Option<SocketAddr> {
        self.connection.target.or(self.connection.host)
    }
}

fn check_channel_values(field: &str, values: &[u16], channel_count: usize) -> Result<()> {
    if values.len() > channel_count {
        return Err(AsocError::config(format!(
            "{field}: {} values for {channel_count} channels",
            values.len()
        )));
    }
    if let Some((ch, v)) = values.iter().enumerate().find(|(_, v)| **v > SAMPLE_MAX) {
        return Err(AsocError::config(format!(
            "{field}: channel {ch} value {v} exceeds {SAMPLE_MAX}"
        )));
    }
    Ok(())
}

/// Parse an `ip:port` endpoint.
///
/// The IP must be a literal address and the port must be in `1..=65535`.
///
/// # Errors
///
/// Returns a configuration error naming the bad part.
pub fn parse_endpoint(s: &str) -> Result<SocketAddr> {
    let (ip, port) = s
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| AsocError::config(format!("`{s}`: expected ip:port")))?;
    let ip: IpAddr = ip
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| AsocError::config(format!("`{s}`: invalid IP address")))?;
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| AsocError::config(format!("`{s}`: port must be in 1..=65535")))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[board]
model = "asocv3"
backend = "udp"

[connection]
board = "192.168.1.59:4660"
host = "192.168.1.1:4660"
target = "192.168.1.2:4661"
timeout_ms = 250

[files]
clock = "clocks/asocv3.txt"

[acquisition]
channels = [0, 2]
trigger_mode = "self"
lookback_mode = "forced"
trigger_values = [2100, 2100, 2100, 2100]
dac_values = [1000, 1000]
read_window = { windows = 16, lookback = 12, write_after_trig = 8 }

[run]
output_dir = "out"
max_events = 500
max_duration_s = 1.5
"#;

    #[test]
    fn empty_file_is_simulated_board() {
        let cfg = AsocConfig::from_toml("", Path::new("/etc/asoc")).unwrap();
        assert_eq!(cfg.model, BoardModel::Simulated);
        assert_eq!(cfg.backend, BackendType::Simulated);
        assert_eq!(cfg.acquisition.channels, vec![0, 1, 2, 3]);
        assert_eq!(cfg.run.output_dir, PathBuf::from("/etc/asoc/data"));
        cfg.validate().unwrap();
    }

    #[test]
    fn full_file_parses() {
        let cfg = AsocConfig::from_toml(FULL, Path::new("/srv/daq")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.model, BoardModel::Asocv3);
        assert_eq!(cfg.backend, BackendType::Udp);
        assert_eq!(cfg.connection.timeout, Duration::from_millis(250));
        assert_eq!(cfg.connection.retries, 3);
        assert_eq!(
            cfg.data_receiver(),
            Some("192.168.1.2:4661".parse().unwrap())
        );
        assert_eq!(cfg.files.clock, Some(PathBuf::from("/srv/daq/clocks/asocv3.txt")));
        assert_eq!(cfg.acquisition.trigger_mode, TriggerMode::SelfTrigger);
        assert_eq!(cfg.acquisition.lookback_mode, LookbackMode::Forced);
        assert_eq!(cfg.acquisition.channel_mask(), 0b101);
        assert_eq!(cfg.acquisition.read_window, ReadWindow::new(16, 12, 8));
        assert_eq!(cfg.run.max_events, Some(500));
        assert_eq!(cfg.run.max_duration, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn self_trigger_without_values_rejected() {
        let mut cfg = AsocConfig::default();
        cfg.acquisition.trigger_mode = TriggerMode::SelfTrigger;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("trigger values"));
    }

    #[test]
    fn udp_needs_endpoints() {
        let cfg = AsocConfig::from_toml("[board]\nbackend = \"udp\"\n", Path::new("")).unwrap();
        assert!(cfg.validate().unwrap_err().to_string().contains("connection.board"));
    }

    #[test]
    fn data_receiver_must_be_ipv4() {
        let mut cfg = AsocConfig::default();
        cfg.connection.target = Some("[::1]:4661".parse().unwrap());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be an IPv4 address"), "{err}");

        // Without a target the host endpoint is the receiver.
        cfg.connection.target = None;
        cfg.connection.host = Some("[::1]:4660".parse().unwrap());
        assert!(cfg.validate().is_err());

        cfg.connection.target = Some("10.0.0.2:4661".parse().unwrap());
        cfg.validate().unwrap();
    }

    #[test]
    fn channel_checks() {
        let mut cfg = AsocConfig::default();
        cfg.acquisition.channels = vec![0, 4];
        assert!(cfg.validate().is_err());
        cfg.acquisition.channels = vec![1, 1];
        assert!(cfg.validate().unwrap_err().to_string().contains("twice"));
        cfg.acquisition.channels = vec![];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn value_lists_bounded() {
        let mut cfg = AsocConfig::default();
        cfg.acquisition.dac_values = vec![0; 5];
        assert!(cfg.validate().is_err());
        cfg.acquisition.dac_values = vec![0x1000];
        assert!(cfg.validate().unwrap_err().to_string().contains("exceeds"));
    }

    #[test]
    fn read_window_checked_against_model() {
        let mut cfg = AsocConfig::default();
        cfg.acquisition.read_window = ReadWindow::new(0, 0, 0);
        assert!(matches!(cfg.validate(), Err(AsocError::Config { .. })));
    }

    #[test]
    fn unknown_keys_and_names_rejected() {
        assert!(AsocConfig::from_toml("[board]\ncolour = 1\n", Path::new("")).is_err());
        assert!(AsocConfig::from_toml("[board]\nmodel = \"x\"\n", Path::new("")).is_err());
        assert!(
            AsocConfig::from_toml("[acquisition]\ntrigger_mode = \"auto\"\n", Path::new(""))
                .is_err()
        );
        assert!(AsocConfig::from_toml("[run]\nmax_duration_s = -1.0\n", Path::new("")).is_err());
    }

    #[test]
    fn endpoints_follow_script_rules() {
        assert_eq!(
            parse_endpoint("10.0.0.1:4660").unwrap(),
            "10.0.0.1:4660".parse().unwrap()
        );
        assert!(parse_endpoint("10.0.0.1:0").is_err());
        assert!(parse_endpoint("10.0.0.1:65536").is_err());
        assert!(parse_endpoint("10.0.0.256:1").is_err());
        assert!(parse_endpoint("board.local:1").is_err());
        assert!(parse_endpoint("10.0.0.1").is_err());
        assert!(parse_endpoint("[::1]:9").unwrap().is_ipv6());
    }

    #[test]
    fn load_reads_file_relative_to_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.toml");
        std::fs::write(&path, "[files]\nregisters = \"preset.toml\"\n").unwrap();
        let cfg = AsocConfig::load(&path).unwrap();
        assert_eq!(cfg.files.registers, Some(dir.path().join("preset.toml")));
    }
}
