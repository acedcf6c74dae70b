//! `asoc`: command-line interface for ASoC board control and acquisition.
//!
//! ```text
//! USAGE:
//!   asoc init                        Reset, program clock, apply register preset
//!   asoc start [options]             Configure acquisition and start readout
//!   asoc stop                        Stop readout, save queued events
//!   asoc run [--max-events N]        Full flow, events written to output_dir
//!   asoc inspect <run-dir>           Summarise a stored run
//!   asoc check-config                Validate the configuration file
//! ```
//!
//! The configuration file comes from `--config` or `ASOC_CONFIG`; without
//! either the simulated board is used.

use anyhow::{bail, Context, Result};
use asoc_driver::chip::{LookbackMode, ReadWindow, TriggerMode};
use asoc_driver::config::parse_endpoint;
use asoc_driver::{
    AsocConfig, AsocController, BackendType, EventSink, RunControl, RunLimits, RunMetadata,
    RunState, RunStats, RunWriter, CONFIG_ENV,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asoc", about = "ASoC board control and acquisition", version)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Override the backend (udp, mmio, simulated).
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Debug logging (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Reset the board, program its clock and apply the register preset.
    Init,
    /// Configure acquisition and start readout.
    Start(AcquisitionArgs),
    /// Stop readout; events still queued are saved as a new run.
    Stop,
    /// Run the full flow and store events under the output directory.
    Run {
        #[command(flatten)]
        acquisition: AcquisitionArgs,
        /// Stop after this many events.
        #[arg(long)]
        max_events: Option<u64>,
        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<f64>,
        /// Directory receiving run_<n> folders.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Print statistics for a stored run.
    Inspect {
        /// Run directory (e.g. data/run_3).
        run_dir: PathBuf,
    },
    /// Load and validate the configuration, then print it.
    CheckConfig,
}

/// Acquisition overrides shared by `start` and `run`.
#[derive(Args, Debug, Default)]
struct AcquisitionArgs {
    /// Trigger mode: imm, ext or self.
    #[arg(long)]
    trigger_mode: Option<String>,
    /// Lookback mode: forced or trig.
    #[arg(long)]
    lookback_mode: Option<String>,
    /// Trigger thresholds per channel, comma separated.
    #[arg(long, value_delimiter = ',')]
    trigger_values: Option<Vec<u16>>,
    /// Bias DAC values per channel, comma separated.
    #[arg(long, value_delimiter = ',')]
    dac_values: Option<Vec<u16>>,
    /// Read window: number of windows, lookback, write-after-trigger.
    #[arg(long, num_args = 3, value_names = ["WINDOWS", "LOOKBACK", "WRITE_AFTER_TRIG"])]
    readout_window: Option<Vec<u16>>,
    /// Where the board sends event data (ip:port).
    #[arg(long)]
    target: Option<String>,
}

impl AcquisitionArgs {
    fn apply(&self, config: &mut AsocConfig) -> Result<()> {
        let acq = &mut config.acquisition;
        if let Some(name) = &self.trigger_mode {
            acq.trigger_mode = TriggerMode::from_name(name)
                .with_context(|| format!("unknown trigger mode `{name}` (imm, ext, self)"))?;
        }
        if let Some(name) = &self.lookback_mode {
            acq.lookback_mode = LookbackMode::from_name(name)
                .with_context(|| format!("unknown lookback mode `{name}` (forced, trig)"))?;
        }
        if let Some(values) = &self.trigger_values {
            acq.trigger_values.clone_from(values);
        }
        if let Some(values) = &self.dac_values {
            acq.dac_values.clone_from(values);
        }
        if let Some(rw) = &self.readout_window {
            let [windows, lookback, write_after_trig] = rw[..] else {
                bail!("--readout-window takes three values");
            };
            acq.read_window = ReadWindow::new(windows, lookback, write_after_trig);
        }
        if let Some(target) = &self.target {
            config.connection.target = Some(parse_endpoint(target)?);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Cmd::Init => cmd_init(load_config(&cli)?)?,
        Cmd::Start(args) => {
            let mut config = load_config(&cli)?;
            args.apply(&mut config)?;
            cmd_start(config)?;
        }
        Cmd::Stop => cmd_stop(load_config(&cli)?)?,
        Cmd::Run {
            acquisition,
            max_events,
            duration,
            output_dir,
        } => {
            let mut config = load_config(&cli)?;
            acquisition.apply(&mut config)?;
            if let Some(n) = max_events {
                config.run.max_events = Some(*n);
            }
            if let Some(secs) = duration {
                if !(secs.is_finite() && *secs > 0.0) {
                    bail!("--duration must be a positive number of seconds");
                }
                config.run.max_duration = Some(Duration::from_secs_f64(*secs));
            }
            if let Some(dir) = output_dir {
                config.run.output_dir.clone_from(dir);
            }
            cmd_run(config)?;
        }
        Cmd::Inspect { run_dir } => cmd_inspect(run_dir)?,
        Cmd::CheckConfig => cmd_check_config(&load_config(&cli)?),
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AsocConfig> {
    let mut config = match &cli.config {
        Some(path) => AsocConfig::load(path)?,
        None => {
            tracing::info!("No configuration file given, using the simulated board");
            AsocConfig::default()
        }
    };
    if let Some(name) = &cli.backend {
        config.backend = BackendType::from_name(name)
            .with_context(|| format!("unknown backend `{name}` (udp, mmio, simulated)"))?;
    }
    Ok(config)
}

fn open(config: AsocConfig) -> Result<AsocController> {
    let backend = config.backend;
    AsocController::open(config).with_context(|| format!("opening {backend} backend"))
}

fn cmd_init(config: AsocConfig) -> Result<()> {
    let mut ctrl = open(config)?;
    ctrl.init()?;
    let identity = ctrl.read_named(asoc_driver::chip::regs::names::IDENTITY)?;
    println!("Board initialized ({}, identity {identity:#010x})", ctrl.config().model);
    Ok(())
}

fn cmd_start(config: AsocConfig) -> Result<()> {
    let mut ctrl = open(config)?;
    match ctrl.attach()? {
        RunState::Reset => bail!("board is not initialized, run `asoc init` first"),
        RunState::Running => bail!("board is already running, run `asoc stop` first"),
        _ => {}
    }
    ctrl.configure_default()?;
    ctrl.start_run()?;

    let acq = &ctrl.config().acquisition;
    println!(
        "Readout started: channels {:?}, {} trigger, {} lookback",
        acq.channels, acq.trigger_mode, acq.lookback_mode
    );
    if let Some(receiver) = ctrl.config().data_receiver() {
        println!("Data receiver : {receiver}");
    }
    Ok(())
}

fn cmd_stop(config: AsocConfig) -> Result<()> {
    let mut ctrl = open(config)?;
    if ctrl.attach()? != RunState::Running {
        println!("Board is not running.");
        return Ok(());
    }
    match stop_and_save(&mut ctrl)? {
        Some((events, dir)) => {
            println!("Readout stopped, {events} queued events saved to {}", dir.display());
        }
        None => println!("Readout stopped (no events queued)."),
    }
    Ok(())
}

/// Stop readout and write whatever the board still held as a new run.
fn stop_and_save(ctrl: &mut AsocController) -> Result<Option<(u64, PathBuf)>> {
    let mut drained = Vec::new();
    let summary = ctrl.stop_run(&mut drained)?;
    if drained.is_empty() {
        return Ok(None);
    }
    let mut writer = RunWriter::create_next(ctrl.config())?;
    for event in drained {
        writer.accept(event)?;
    }
    let dir = writer.dir().to_path_buf();
    writer.finish(&summary)?;
    Ok(Some((summary.events, dir)))
}

fn cmd_run(config: AsocConfig) -> Result<()> {
    let limits = RunLimits::from(&config.run);
    if limits.max_events.is_none() && limits.max_duration.is_none() {
        bail!("a run needs --max-events or --duration (or run.max_events / run.max_duration_s)");
    }
    let mut ctrl = open(config)?;
    let mut writer = RunWriter::create_next(ctrl.config())?;

    let summary = match ctrl.run(&mut writer, limits, &RunControl::new()) {
        Ok(summary) => summary,
        Err(e) => {
            if let Err(cleanup) = writer.abandon(&e.to_string()) {
                tracing::warn!("Could not close the failed run: {cleanup}");
            }
            return Err(e.into());
        }
    };
    let dir = writer.dir().to_path_buf();
    writer.finish(&summary)?;

    println!("Run directory : {}", dir.display());
    println!("Events        : {}", summary.events);
    println!("Bytes         : {}", summary.bytes);
    println!("Duration      : {:.3} s", summary.duration.as_secs_f64());
    println!("Event rate    : {:.1} Hz", summary.event_rate());
    println!("Stopped       : {}", summary.reason);
    if summary.overflows > 0 {
        println!("Overflows     : {} (events were dropped on the board)", summary.overflows);
    }
    if summary.decode_errors > 0 || summary.resync_bytes > 0 {
        println!(
            "Stream errors : {} undecodable frames, {} bytes skipped",
            summary.decode_errors, summary.resync_bytes
        );
    }
    Ok(())
}

fn cmd_inspect(run_dir: &Path) -> Result<()> {
    if let Ok(meta) = RunMetadata::load(run_dir) {
        println!("Run           : {}", meta.run_id);
        println!("Board         : {}", meta.model);
        println!(
            "Trigger       : {} (lookback {}), {} windows",
            meta.trigger_mode, meta.lookback_mode, meta.windows
        );
        println!("Duration      : {:.3} s ({})", meta.duration_s, meta.stop_reason);
    } else {
        println!("Run           : {} (no metadata)", run_dir.display());
    }

    let stats = RunStats::collect(run_dir)
        .with_context(|| format!("reading {}", run_dir.display()))?;
    println!("Events        : {}", stats.events);
    if let (Some(first), Some(last)) = (stats.first_event, stats.last_event) {
        println!("Event numbers : {first}..={last} ({} missing)", stats.missing_events());
    }
    println!();
    println!("  ch   events      mean   peak");
    for (ch, s) in &stats.channels {
        println!(
            "  {ch:>2}  {:>7}  {:>8.1}  {:>5}",
            s.events,
            s.mean().unwrap_or(0.0),
            s.peak
        );
    }
    Ok(())
}

fn cmd_check_config(config: &AsocConfig) {
    println!("Board         : {}", config.model);
    println!("Backend       : {}", config.backend);
    match config.backend {
        BackendType::Udp => {
            if let Some(board) = config.connection.board {
                println!("Board address : {board}");
            }
            if let Some(host) = config.connection.host {
                println!("Host address  : {host}");
            }
        }
        BackendType::Mmio => {
            if let Some(device) = &config.device {
                println!("Device        : {}", device.display());
            }
        }
        BackendType::Simulated => {}
    }
    if let Some(receiver) = config.data_receiver() {
        println!("Data receiver : {receiver}");
    }
    let acq = &config.acquisition;
    println!("Channels      : {:?}", acq.channels);
    println!("Trigger       : {} (lookback {})", acq.trigger_mode, acq.lookback_mode);
    if !acq.trigger_values.is_empty() {
        println!("Thresholds    : {:?}", acq.trigger_values);
    }
    if !acq.dac_values.is_empty() {
        println!("DAC values    : {:?}", acq.dac_values);
    }
    let rw = acq.read_window;
    println!(
        "Read window   : {} windows, lookback {}, {} after trigger",
        rw.windows, rw.lookback, rw.write_after_trig
    );
    for (label, path) in [
        ("Clock file    ", &config.files.clock),
        ("Register file ", &config.files.registers),
        ("Register map  ", &config.files.register_map),
    ] {
        if let Some(path) = path {
            println!("{label}: {}", path.display());
        }
    }
    println!("Output dir    : {}", config.run.output_dir.display());
    println!("Configuration OK");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_flags_override_configuration() {
        let cli = Cli::try_parse_from([
            "asoc",
            "start",
            "--trigger-mode",
            "self",
            "--trigger-values",
            "2100,2100,2000",
            "--readout-window",
            "16",
            "16",
            "8",
            "--target",
            "192.168.1.2:4661",
        ])
        .unwrap();
        let Cmd::Start(args) = cli.command else {
            panic!("expected start");
        };
        let mut config = AsocConfig::default();
        args.apply(&mut config).unwrap();
        config.validate().unwrap();

        let acq = &config.acquisition;
        assert_eq!(acq.trigger_mode, TriggerMode::SelfTrigger);
        assert_eq!(acq.trigger_values, vec![2100, 2100, 2000]);
        assert_eq!(acq.read_window, ReadWindow::new(16, 16, 8));
        assert_eq!(
            config.connection.target,
            Some("192.168.1.2:4661".parse().unwrap())
        );
    }

    #[test]
    fn bad_target_port_is_rejected() {
        let args = AcquisitionArgs {
            target: Some("192.168.1.2:0".into()),
            ..AcquisitionArgs::default()
        };
        assert!(args.apply(&mut AsocConfig::default()).is_err());
    }

    #[test]
    fn unreachable_board_leaves_no_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AsocConfig::default();
        config.backend = BackendType::Mmio;
        config.device = Some(dir.path().join("uio-missing"));
        config.run.max_events = Some(1);
        config.run.output_dir = dir.path().join("data");

        assert!(cmd_run(config).is_err());
        assert!(!dir.path().join("data").join("run_1").exists());
    }

    #[test]
    fn run_stores_events_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AsocConfig::default();
        config.acquisition.trigger_mode = TriggerMode::Immediate;
        config.run.max_events = Some(3);
        config.run.output_dir = dir.path().to_path_buf();

        cmd_run(config).unwrap();
        let run = dir.path().join("run_1");
        let meta = RunMetadata::load(&run).unwrap();
        assert!(meta.events >= 3);
        assert_eq!(RunStats::collect(&run).unwrap().events, meta.events);
    }

    #[test]
    fn stop_saves_queued_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AsocConfig::default();
        config.run.output_dir = dir.path().to_path_buf();
        let mut ctrl = open(config).unwrap();
        ctrl.init().unwrap();
        ctrl.configure_default().unwrap();
        ctrl.start_run().unwrap();
        ctrl.software_trigger().unwrap();
        ctrl.software_trigger().unwrap();

        let (events, run) = stop_and_save(&mut ctrl).unwrap().unwrap();
        assert_eq!(events, 2);
        assert_eq!(run, dir.path().join("run_1"));
        assert_eq!(RunStats::collect(&run).unwrap().events, 2);
        assert_eq!(RunMetadata::load(&run).unwrap().events, 2);

        ctrl.start_run().unwrap();
        assert!(stop_and_save(&mut ctrl).unwrap().is_none());
        assert!(!dir.path().join("run_2").exists());
    }

    #[test]
    fn self_trigger_needs_values() {
        let args = AcquisitionArgs {
            trigger_mode: Some("self".into()),
            ..AcquisitionArgs::default()
        };
        let mut config = AsocConfig::default();
        args.apply(&mut config).unwrap();
        assert!(config.validate().is_err());
    }
}
