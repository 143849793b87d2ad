//! Four-channel DXP-4C2X modules: detector mapping, broadcast downloads and
//! per-channel parameters and control tasks.

mod common;

use common::{DEFAULTS, DSP, FIPPI};
use dxp_core::{
    ChannelAddr, ChannelSel, DownloadState, DxpError, DxpSystem, FileLocator, FirmwareKind,
    ModuleRegistry, RunStatus, TaskType, TimingConfig,
};
use dxp_driver_mock::{
    adc_trace, fixtures, Direction, DspMode, ErrorConfig, ErrorScenario, SimulatedBus,
};
use dxp_driver_xia::registers::{symbol, DATA, DATA_BASE};
use dxp_driver_xia::{Dxp4c2x, Dxp4c2xDriver, Family};
use std::io::Cursor;
use std::sync::Arc;

const MODULE: &str = "c1n5";
const DETECTORS: [i32; 4] = [10, 11, 12, 13];

struct Crate {
    bus: Arc<SimulatedBus>,
    system: DxpSystem,
}

fn registry(bus: &Arc<SimulatedBus>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new(FileLocator::default());
    registry.register_board_type(Arc::new(Dxp4c2xDriver::new(TimingConfig::default())));
    registry.add_interface("camac", bus.clone());
    let sources = [
        (FirmwareKind::Dsp, DSP, fixtures::dsp_program(64)),
        (FirmwareKind::Dsp, "alt.dsp", fixtures::dsp_program(32)),
        (FirmwareKind::Fpga, FIPPI, fixtures::fippi_bitstream(40)),
        (FirmwareKind::Defaults, DEFAULTS, fixtures::defaults()),
    ];
    for (kind, id, text) in sources {
        registry
            .load_firmware_from(Dxp4c2x::BOARD_TYPE, kind, id, &mut Cursor::new(text.as_bytes()))
            .unwrap();
    }
    registry
}

/// One four-channel module with the shared firmware assigned to every channel.
fn module(bus: SimulatedBus) -> Crate {
    let bus = Arc::new(bus.with_channels(Dxp4c2x::CHANNELS));
    let mut system = DxpSystem::new(registry(&bus), TimingConfig::default());
    system
        .add_module(Dxp4c2x::BOARD_TYPE, "camac", MODULE, &DETECTORS)
        .unwrap();
    for det in DETECTORS {
        for (kind, id) in [
            (FirmwareKind::Fpga, FIPPI),
            (FirmwareKind::Dsp, DSP),
            (FirmwareKind::Defaults, DEFAULTS),
        ] {
            system.assign_firmware(det, kind, id).unwrap();
        }
    }
    Crate { bus, system }
}

fn loaded() -> Crate {
    let mut c = module(SimulatedBus::new());
    c.system.download_all().unwrap();
    c
}

fn program_writes(bus: &SimulatedBus) -> Vec<(u16, usize)> {
    bus.transfers()
        .iter()
        .filter(|t| t.port == DATA && t.direction == Direction::Write)
        .filter_map(|t| t.address.filter(|&a| a < DATA_BASE).map(|a| (a, t.len)))
        .collect()
}

#[test]
fn test_detectors_map_to_channels() {
    let c = module(SimulatedBus::new());
    assert_eq!(c.system.registry().board(0).unwrap().channel_count(), 4);
    for (channel, det) in DETECTORS.into_iter().enumerate() {
        assert_eq!(c.system.locate(det).unwrap(), ChannelAddr { board: 0, channel });
    }
}

#[test]
fn test_repeated_detector_rejected_before_board_exists() {
    let bus = Arc::new(SimulatedBus::new().with_channels(4));
    let mut system = DxpSystem::new(registry(&bus), TimingConfig::default());

    let err = system
        .add_module(Dxp4c2x::BOARD_TYPE, "camac", MODULE, &[3, 3, 4, 5])
        .unwrap_err();
    assert!(matches!(err, DxpError::BadParameter { .. }), "{err:?}");
    assert!(system.registry().boards().is_empty());
    assert!(system.detectors().is_empty());
    assert_eq!(bus.open_handles(), 0);

    let err = system
        .add_module(Dxp4c2x::BOARD_TYPE, "camac", MODULE, &[1, 2, 3, 4, 5])
        .unwrap_err();
    assert!(matches!(err, DxpError::BadParameter { .. }), "{err:?}");
    assert!(system.detectors().is_empty());

    system
        .add_module(Dxp4c2x::BOARD_TYPE, "camac", MODULE, &[3, 4, 5, 6])
        .unwrap();
    assert_eq!(system.locate(3).unwrap(), ChannelAddr { board: 0, channel: 0 });
    assert_eq!(system.registry().boards().len(), 1);
}

#[test]
fn test_shared_program_broadcast_once() {
    let c = loaded();

    assert_eq!(program_writes(&c.bus), vec![(1, 62), (0, 2)]);
    for (channel, det) in DETECTORS.into_iter().enumerate() {
        assert_eq!(c.system.dsp_state(det).unwrap(), DownloadState::Loaded);
        assert_eq!(c.bus.dsp_mode_on(MODULE, channel).unwrap(), DspMode::Running);
        assert!(c.bus.fippi_configured_on(MODULE, channel).unwrap());
        assert_eq!(c.bus.param_on(MODULE, channel, "GAIN").unwrap(), 50);
    }
}

#[test]
fn test_broadcast_polls_every_channel() {
    let errors = ErrorConfig::scenario(ErrorScenario::ChannelNeverReady { channel: 2 });
    let mut c = module(SimulatedBus::new().with_errors(errors));

    let board = c.system.registry_mut().board_mut(0).unwrap();
    let driver = board.board_type().clone();
    let err = driver.download_dsp(board, ChannelSel::All).unwrap_err();
    assert!(
        matches!(err, DxpError::DownloadTimeout { channel: 2, .. }),
        "{err:?}"
    );
    for det in DETECTORS {
        assert_eq!(c.system.dsp_state(det).unwrap(), DownloadState::NotLoaded);
    }
    assert_eq!(c.bus.param_on(MODULE, 1, symbol::BUSY).unwrap(), 0);
}

#[test]
fn test_mixed_programs_downloaded_per_channel() {
    let mut c = module(SimulatedBus::new());
    c.system.assign_firmware(13, FirmwareKind::Dsp, "alt.dsp").unwrap();

    let board = c.system.registry_mut().board_mut(0).unwrap();
    let driver = board.board_type().clone();
    let err = driver.download_dsp(board, ChannelSel::All).unwrap_err();
    assert!(matches!(err, DxpError::BadParameter { .. }), "{err:?}");

    c.bus.clear_transfers();
    c.system.download_all().unwrap();
    let boots = program_writes(&c.bus).iter().filter(|&&(a, _)| a == 0).count();
    assert_eq!(boots, 4);
    for det in DETECTORS {
        assert_eq!(c.system.dsp_state(det).unwrap(), DownloadState::Loaded);
    }
}

#[test]
fn test_parameters_stay_on_their_channel() {
    let mut c = loaded();

    c.system.modify_symbol(12, "GAIN", 120.0).unwrap();
    for channel in 0..4 {
        let expected = if channel == 2 { 120 } else { 50 };
        assert_eq!(c.bus.param_on(MODULE, channel, "GAIN").unwrap(), expected);
    }
    assert_eq!(c.system.read_symbol(12, "GAIN").unwrap(), 120.0);
    assert_eq!(c.system.read_symbol(11, "GAIN").unwrap(), 50.0);

    c.bus.set_param_on(MODULE, 3, "RUNERROR", 4).unwrap();
    assert!(c.system.decode_error(13).unwrap().is_error());
    assert!(!c.system.decode_error(10).unwrap().is_error());
}

#[test]
fn test_control_task_on_one_channel() {
    let mut c = loaded();

    c.system.start_control_task(12, TaskType::Adc, &[0, 7]).unwrap();
    assert!(c.system.is_running(12).unwrap().contains(RunStatus::CONTROL_TASK));
    c.system.wait_control_task(12).unwrap();

    let data = c.system.get_control_task_data(12).unwrap();
    let expected: Vec<i64> = adc_trace(7, data.len()).into_iter().map(i64::from).collect();
    assert_eq!(data, expected);
    assert_eq!(c.bus.param_on(MODULE, 0, symbol::TRACEWAIT).unwrap(), 10);
    assert_eq!(c.bus.param_on(MODULE, 0, symbol::RUNTASKS).unwrap(), 0);

    // Another channel cannot start a task while the board is busy.
    let err = c.system.start_control_task(10, TaskType::Adc, &[0, 3]).unwrap_err();
    assert!(matches!(err, DxpError::TaskAlreadyActive { channel: 2, .. }), "{err:?}");

    c.system.stop_control_task(12).unwrap();
    assert_eq!(c.bus.param_on(MODULE, 2, symbol::RUNTASKS).unwrap(), 0);

    c.system.start_run(false, false).unwrap();
    assert!(c.system.is_running(13).unwrap().contains(RunStatus::HARDWARE_ACTIVE));
    c.system.stop_run().unwrap();
    assert!(c.system.is_running(13).unwrap().is_empty());
}

#[test]
fn test_fippi_reload_wakes_only_its_channel() {
    let mut c = loaded();
    c.system.download_fpga(11, "fippi").unwrap();

    for channel in 0..4 {
        assert_eq!(c.bus.dsp_mode_on(MODULE, channel).unwrap(), DspMode::Running);
        assert_eq!(c.bus.param_on(MODULE, channel, symbol::BUSY).unwrap(), 0);
        assert_eq!(c.bus.param_on(MODULE, channel, symbol::RUNTASKS).unwrap(), 0);
    }
    assert!(c.system.is_running(11).unwrap().is_empty());
    assert_eq!(c.bus.mca_resets(MODULE).unwrap(), 0);
}
