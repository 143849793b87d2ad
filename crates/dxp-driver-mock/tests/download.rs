//! Firmware download sequences against the simulated module.

mod common;

use common::{Rig, DETECTOR, MODULE};
use dxp_core::{Bus, ChannelSel, DownloadState, DxpError, TimingConfig};
use dxp_driver_mock::common::timing;
use dxp_driver_mock::{Direction, DspMode, ErrorConfig, ErrorScenario, SimulatedBus};
use dxp_driver_xia::registers::{symbol, whichtest, DATA, DATA_BASE, FIPPI};
use std::time::Duration;

fn program_writes(bus: &SimulatedBus) -> Vec<(u16, usize)> {
    bus.transfers()
        .iter()
        .filter(|t| t.port == DATA && t.direction == Direction::Write)
        .filter_map(|t| t.address.filter(|&a| a < DATA_BASE).map(|a| (a, t.len)))
        .collect()
}

#[test]
fn test_dsp_body_chunked_and_boot_written_last() {
    let bus = SimulatedBus::new();
    bus.set_max_block(100);
    let mut rig = Rig::new(bus, TimingConfig::default(), 260);

    rig.system.download_dsp(DETECTOR).unwrap();

    assert_eq!(
        program_writes(&rig.bus),
        vec![(1, 100), (101, 100), (201, 58), (0, 2)]
    );
    assert!(rig.bus.transfers().iter().all(|t| t.len <= 100));
    assert_eq!(rig.system.dsp_state(DETECTOR).unwrap(), DownloadState::Loaded);
    assert_eq!(rig.bus.dsp_mode(MODULE).unwrap(), DspMode::Running);
    assert!(rig.bus.elapsed() >= Duration::from_millis(1));
}

#[test]
fn test_dsp_download_applies_defaults() {
    let mut rig = Rig::new(SimulatedBus::new(), TimingConfig::default(), 64);
    rig.system.download_dsp(DETECTOR).unwrap();

    // GAIN 50, DECIMATION 2, TRACEWAIT 0Ah; the entry after END is ignored.
    assert_eq!(rig.bus.param(MODULE, "GAIN").unwrap(), 50);
    assert_eq!(rig.bus.param(MODULE, "DECIMATION").unwrap(), 2);
    assert_eq!(rig.system.read_symbol(DETECTOR, "tracewait").unwrap(), 10.0);
}

#[test]
fn test_dsp_never_ready_is_download_timeout() {
    let bus = SimulatedBus::new().with_errors(ErrorConfig::scenario(ErrorScenario::DspNeverReady));
    let mut rig = Rig::new(bus, TimingConfig::default(), 64);

    let err = rig.system.download_dsp(DETECTOR).unwrap_err();
    match err {
        DxpError::DownloadTimeout { module, channel, attempts } => {
            assert_eq!(module, MODULE);
            assert_eq!(channel, 0);
            assert_eq!(attempts, 50);
        }
        other => panic!("expected DownloadTimeout, got {other:?}"),
    }
    assert_eq!(rig.system.dsp_state(DETECTOR).unwrap(), DownloadState::NotLoaded);
    // 50 polls half a second apart.
    assert!(rig.bus.elapsed() >= Duration::from_secs(24));
}

#[test]
fn test_fpga_download_slow_words_then_block() {
    let mut rig = Rig::new(SimulatedBus::new(), TimingConfig::default(), 64);
    rig.system.download_fpga(DETECTOR, "all").unwrap();

    let fippi: Vec<usize> = rig
        .bus
        .transfers()
        .iter()
        .filter(|t| t.port == FIPPI)
        .map(|t| t.len)
        .collect();
    let mut expected = vec![1; 10];
    expected.push(30);
    assert_eq!(fippi, expected);
    assert!(rig.bus.fippi_configured(MODULE).unwrap());
    assert!(rig.bus.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_fpga_name_must_be_all_or_fippi() {
    let mut rig = Rig::new(SimulatedBus::new(), TimingConfig::default(), 64);
    assert!(rig.system.download_fpga(DETECTOR, "FiPPI").is_ok());
    let err = rig.system.download_fpga(DETECTOR, "system").unwrap_err();
    assert!(matches!(err, DxpError::BadParameter { .. }));
}

#[test]
fn test_fpga_never_done_is_firmware_timeout() {
    let bus = SimulatedBus::new().with_errors(ErrorConfig::scenario(ErrorScenario::FpgaNeverDone));
    let mut rig = Rig::new(bus, timing::fast(), 64);

    let err = rig.system.download_fpga(DETECTOR, "fippi").unwrap_err();
    assert!(
        matches!(err, DxpError::FirmwareTimeout { ref module, attempts: 10 } if module == MODULE),
        "{err:?}"
    );
    assert!(err.is_timeout());
}

#[test]
fn test_fpga_reload_sleeps_and_wakes_running_dsp() {
    let mut rig = Rig::loaded();
    rig.bus.clear_transfers();

    rig.system.download_fpga(DETECTOR, "all").unwrap();

    assert_eq!(rig.bus.dsp_mode(MODULE).unwrap(), DspMode::Running);
    assert_eq!(rig.bus.param(MODULE, symbol::WHICHTEST).unwrap(), whichtest::SLEEP_DSP);
    assert_eq!(rig.bus.param(MODULE, symbol::RUNTASKS).unwrap(), 0);
    assert_eq!(rig.bus.param(MODULE, symbol::BUSY).unwrap(), 0);
    assert!(rig.system.is_running(DETECTOR).unwrap().is_empty());
    assert_eq!(rig.system.dsp_state(DETECTOR).unwrap(), DownloadState::Loaded);
}

#[test]
fn test_download_done_checks() {
    let mut rig = Rig::loaded();
    let board = rig.system.registry_mut().board_mut(0).unwrap();
    let driver = board.board_type().clone();

    assert!(driver.download_fpga_done(board, ChannelSel::All, "fippi").unwrap());
    assert!(driver
        .download_dsp_done(board, 0, 0, Duration::from_millis(10))
        .unwrap());
    assert!(!driver
        .download_dsp_done(board, 0, 7, Duration::from_millis(10))
        .unwrap());
}

#[test]
fn test_transfer_failure_surfaces_as_device_io() {
    let bus = SimulatedBus::new().with_errors(ErrorConfig::scenario(ErrorScenario::FailAfterN {
        operation: "write",
        count: 3,
    }));
    let mut rig = Rig::new(bus, TimingConfig::default(), 64);

    let err = rig.system.download_dsp(DETECTOR).unwrap_err();
    assert!(matches!(err, DxpError::DeviceIo { .. }), "{err:?}");
    assert_eq!(rig.system.dsp_state(DETECTOR).unwrap(), DownloadState::NotLoaded);
}
