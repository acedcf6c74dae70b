//! End-to-end runs against the simulated board
//!
//! Exercises the whole host path without hardware: configuration file,
//! clock and preset files, controller, run storage and statistics.

use asoc_driver::prelude::*;
use asoc_driver::{RunReader, RunStats, RunMetadata, StopReason};
use std::fs;
use std::path::Path;

fn write_setup(dir: &Path, trigger: &str) -> std::path::PathBuf {
    fs::write(dir.join("clock.txt"), "# dump\nAddress,Data\n0x06,0x08\n0x1B,0x70\n").unwrap();
    fs::write(dir.join("preset.toml"), "[values]\nread_lookback = 2\n").unwrap();
    let config = format!(
        r#"
[board]
model = "simulated"

[files]
clock = "clock.txt"
registers = "preset.toml"

[acquisition]
channels = [0, 1]
trigger_mode = "{trigger}"
trigger_values = [1000, 1000]
dac_values = [300, 400]
read_window = {{ windows = 4, lookback = 4, write_after_trig = 2 }}

[run]
output_dir = "out"
max_events = 20
"#
    );
    let path = dir.join("board.toml");
    fs::write(&path, config).unwrap();
    path
}

#[test]
fn self_triggered_run_is_stored() {
    let dir = tempfile::tempdir().unwrap();
    let config = AsocConfig::load(&write_setup(dir.path(), "self")).unwrap();
    assert_eq!(config.run.output_dir, dir.path().join("out"));

    let mut writer = RunWriter::create_next(&config).unwrap();
    assert_eq!(writer.id(), 1);
    let limits = RunLimits::from(&config.run);
    let mut ctrl = AsocController::open(config).unwrap();
    let summary = ctrl.run(&mut writer, limits, &RunControl::new()).unwrap();
    assert_eq!(summary.reason, StopReason::EventLimit);
    assert_eq!(ctrl.state(), RunState::Stopped);

    let run_dir = writer.dir().to_path_buf();
    let meta = writer.finish(&summary).unwrap();
    assert_eq!(meta.events, summary.events);
    assert_eq!(meta.trigger_mode, "self");
    assert_eq!(meta.channels, vec![0, 1]);

    let events: Vec<Event> = RunReader::open(&run_dir)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(events.len() as u64, summary.events);
    for ev in &events {
        assert_eq!(ev.windows, 4);
        assert_eq!(ev.channels.len(), 2);
        assert_eq!(ev.channels[0].samples.len(), 4 * 32);
    }

    let stats = RunStats::collect(&run_dir).unwrap();
    assert_eq!(stats.events, summary.events);
    assert_eq!(stats.missing_events(), 0);
    // The DAC sets the baseline, so channel 1 sits above channel 0.
    let mean0 = stats.channels[&0].mean().unwrap();
    let mean1 = stats.channels[&1].mean().unwrap();
    assert!(mean1 > mean0);
    assert_eq!(RunMetadata::load(&run_dir).unwrap(), meta);

    let next = RunWriter::create_next(ctrl.config()).unwrap();
    assert_eq!(next.id(), 2);
}

#[test]
fn external_trigger_run_ends_on_stop_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AsocConfig::load(&write_setup(dir.path(), "ext")).unwrap();
    config.run.max_events = None;

    let mut ctrl = AsocController::open(config).unwrap();
    let control = RunControl::new();
    let stopper = control.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        stopper.request_stop();
    });
    let mut events = Vec::new();
    let summary = ctrl.run(&mut events, RunLimits::default(), &control).unwrap();
    handle.join().unwrap();

    assert_eq!(summary.reason, StopReason::Requested);
    assert_eq!(summary.events, 0);
    assert!(events.is_empty());
}

#[test]
fn self_trigger_without_values_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.toml");
    fs::write(&path, "[acquisition]\ntrigger_mode = \"self\"\n").unwrap();
    let err = AsocConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("provide trigger values"), "{err}");
}

#[test]
fn missing_clock_file_fails_init() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_setup(dir.path(), "ext");
    fs::remove_file(dir.path().join("clock.txt")).unwrap();
    let config = AsocConfig::load(&path).unwrap();
    let mut ctrl = AsocController::open(config).unwrap();
    assert!(ctrl.init().is_err());
    assert_eq!(ctrl.state(), RunState::Reset);
}
