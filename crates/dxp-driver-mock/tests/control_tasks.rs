//! Control tasks and run control against the simulated module.

mod common;

use common::{Rig, DETECTOR, MODULE};
use dxp_core::{DxpError, RunStatus, TaskType, TimingConfig};
use dxp_driver_mock::{adc_trace, SimulatedBus, DEFAULT_HISTORY_LEN, DEFAULT_HISTORY_START};
use dxp_driver_xia::registers::{symbol, RunTasks, DATA_BASE};
use std::time::Duration;

fn loaded_with(bus: SimulatedBus) -> Rig {
    let mut rig = Rig::new(bus, TimingConfig::default(), 64);
    rig.system.download_all().unwrap();
    rig
}

#[test]
fn test_adc_trace_lifecycle() {
    let mut rig = Rig::loaded();

    let params = rig.system.control_task_info(DETECTOR, TaskType::Adc).unwrap();
    assert_eq!(params.buffer_len, usize::from(DEFAULT_HISTORY_LEN));
    assert_eq!(params.initial_wait, Duration::from_millis(4));

    rig.system.start_control_task(DETECTOR, TaskType::Adc, &[0, 12]).unwrap();
    let runtasks = RunTasks::from_bits_retain(rig.bus.param(MODULE, symbol::RUNTASKS).unwrap());
    assert_eq!(runtasks, RunTasks::CONTROL_TASK | RunTasks::STOP_BASELINE);
    assert_eq!(rig.bus.param(MODULE, symbol::TRACEWAIT).unwrap(), 12);
    assert!(rig.system.is_running(DETECTOR).unwrap().contains(RunStatus::CONTROL_TASK));

    rig.system.wait_control_task(DETECTOR).unwrap();
    let data = rig.system.get_control_task_data(DETECTOR).unwrap();
    let expected: Vec<i64> = adc_trace(12, data.len()).into_iter().map(i64::from).collect();
    assert_eq!(data.len(), usize::from(DEFAULT_HISTORY_LEN));
    assert_eq!(data, expected);

    rig.system.stop_control_task(DETECTOR).unwrap();
    assert_eq!(rig.bus.param(MODULE, symbol::RUNTASKS).unwrap(), 0);
    assert!(rig.system.is_running(DETECTOR).unwrap().is_empty());
}

#[test]
fn test_trace_data_refused_while_hardware_runs() {
    let mut rig = loaded_with(SimulatedBus::new().hold_control_tasks());

    rig.system.start_control_task(DETECTOR, TaskType::Adc, &[0, 3]).unwrap();
    let err = rig.system.get_control_task_data(DETECTOR).unwrap_err();
    assert!(matches!(err, DxpError::RunActive { .. }), "{err:?}");

    rig.bus.complete_run(MODULE).unwrap();
    rig.system.wait_control_task(DETECTOR).unwrap();
    assert_eq!(rig.system.get_control_task_data(DETECTOR).unwrap().len(), 64);
    rig.system.stop_control_task(DETECTOR).unwrap();
}

#[test]
fn test_task_lifecycle_guards() {
    let mut rig = Rig::loaded();

    let err = rig.system.start_control_task(DETECTOR, TaskType::Adc, &[0]).unwrap_err();
    assert!(matches!(err, DxpError::InsufficientParams { required: 2, provided: 1, .. }));
    let err = rig.system.start_control_task(DETECTOR, TaskType::SetPolarity, &[]).unwrap_err();
    assert!(matches!(err, DxpError::InsufficientParams { .. }));

    let err = rig.system.get_control_task_data(DETECTOR).unwrap_err();
    assert!(matches!(err, DxpError::TaskNotActive { .. }));

    rig.system.start_control_task(DETECTOR, TaskType::SetPolarity, &[1]).unwrap();
    let err = rig.system.start_control_task(DETECTOR, TaskType::Reset, &[1]).unwrap_err();
    assert!(matches!(err, DxpError::TaskAlreadyActive { .. }));
    assert!(rig.system.get_control_task_data(DETECTOR).unwrap().is_empty());
    rig.system.stop_control_task(DETECTOR).unwrap();

    let err = rig.system.stop_control_task(DETECTOR).unwrap_err();
    assert!(matches!(err, DxpError::TaskNotActive { .. }));
}

#[test]
fn test_unknown_task_code() {
    assert!(matches!(TaskType::from_code(7), Err(DxpError::UnknownTaskType { code: 7 })));
    assert_eq!(TaskType::from_code(13).unwrap(), TaskType::BaselineHistory);
}

#[test]
fn test_task_refused_during_acquisition() {
    let mut rig = Rig::loaded();
    rig.system.start_run(false, false).unwrap();
    let err = rig.system.start_control_task(DETECTOR, TaskType::Adc, &[0, 1]).unwrap_err();
    assert!(matches!(err, DxpError::RunActive { .. }));
    rig.system.stop_run().unwrap();
}

#[test]
fn test_baseline_history_rotation() {
    let mut rig = Rig::loaded();
    let history: Vec<u16> = (0..DEFAULT_HISTORY_LEN)
        .map(|i| if i % 2 == 0 { i } else { 0u16.wrapping_sub(i) })
        .collect();
    rig.bus
        .poke(MODULE, DATA_BASE + DEFAULT_HISTORY_START, &history)
        .unwrap();
    rig.bus
        .set_param(MODULE, symbol::CIRCULAR, DEFAULT_HISTORY_START + 10)
        .unwrap();

    rig.system
        .start_control_task(DETECTOR, TaskType::BaselineHistory, &[0])
        .unwrap();
    // Baseline history freezes collection without starting a run.
    assert_eq!(
        rig.bus.param(MODULE, symbol::RUNTASKS).unwrap(),
        RunTasks::STOP_BASELINE.bits()
    );
    assert!(!rig.system.is_running(DETECTOR).unwrap().contains(RunStatus::HARDWARE_ACTIVE));

    let data = rig.system.get_control_task_data(DETECTOR).unwrap();
    let expected: Vec<i64> = (10..history.len())
        .chain(0..10)
        .map(|i| i64::from(history[i] as i16))
        .collect();
    assert_eq!(data, expected);
    assert_eq!(data[1], -11);

    rig.system.stop_control_task(DETECTOR).unwrap();
    assert_eq!(rig.bus.param(MODULE, symbol::RUNTASKS).unwrap(), 0);
}

#[test]
fn test_external_memory_round_trip_across_chunks() {
    let mut rig = Rig::loaded();
    let base = (2 << 14) | 5;
    let data: Vec<u32> = (0..150).map(|i| i * 7).collect();

    rig.system.write_memory(DETECTOR, base, &data).unwrap();
    let stored = rig.bus.external(MODULE, base, data.len()).unwrap();
    assert_eq!(stored, data.iter().map(|&w| w as u16).collect::<Vec<_>>());
    // Three chunks of at most 64 words; the last one is 22.
    assert_eq!(rig.bus.param(MODULE, symbol::EXTLENGTH).unwrap(), 22);

    let read = rig.system.read_memory(DETECTOR, base, data.len()).unwrap();
    assert_eq!(read, data);
    assert!(rig.system.is_running(DETECTOR).unwrap().is_empty());
}

#[test]
fn test_read_memory_from_preloaded_page() {
    let mut rig = Rig::loaded();
    let base = 0x1_0000;
    let words: Vec<u16> = (0..10).map(|i| 0xA000 + i).collect();
    rig.bus.set_external(MODULE, base, &words).unwrap();

    let read = rig.system.read_memory(DETECTOR, base, 10).unwrap();
    assert_eq!(read, words.iter().map(|&w| u32::from(w)).collect::<Vec<_>>());
}

#[test]
fn test_task_params_table() {
    let rig = Rig::loaded();
    let info = |task| rig.system.control_task_info(DETECTOR, task).unwrap();

    let trk = info(TaskType::TrackingDac);
    assert_eq!((trk.buffer_len, trk.initial_wait), (1, Duration::from_millis(10)));

    let mem = info(TaskType::ReadMemory);
    assert_eq!(mem.buffer_len, 64);
    assert_eq!(mem.initial_wait, Duration::from_micros(32));

    let other = info(TaskType::SetAscDac);
    assert_eq!((other.buffer_len, other.initial_wait), (0, Duration::from_millis(1)));
    assert_eq!(other.poll_interval, Duration::from_millis(1));
}

#[test]
fn test_run_start_stop_resume() {
    let mut rig = Rig::loaded();

    rig.system.start_run(false, false).unwrap();
    assert_eq!(
        rig.system.is_running(DETECTOR).unwrap(),
        RunStatus::HARDWARE_ACTIVE | RunStatus::SOFTWARE_ACTIVE
    );
    assert_eq!(rig.bus.mca_resets(MODULE).unwrap(), 1);

    let err = rig.system.start_run(false, false).unwrap_err();
    assert!(matches!(err, DxpError::RunActive { .. }));

    rig.system.stop_run().unwrap();
    assert!(rig.system.is_running(DETECTOR).unwrap().is_empty());
    // Stopping an idle system is harmless.
    rig.system.stop_run().unwrap();

    rig.system.resume_run().unwrap();
    assert!(rig.system.is_running(DETECTOR).unwrap().contains(RunStatus::HARDWARE_ACTIVE));
    assert_eq!(rig.bus.mca_resets(MODULE).unwrap(), 1, "resume keeps the MCA");
    rig.system.stop_run().unwrap();
}

#[test]
fn test_lam_requests_validate_detector() {
    let mut rig = Rig::loaded();
    rig.system.enable_lam(DETECTOR).unwrap();
    rig.system.clear_lam(DETECTOR).unwrap();
    rig.system.disable_lam(DETECTOR).unwrap();
    assert!(matches!(
        rig.system.enable_lam(42),
        Err(DxpError::UnknownDetector { detector: 42 })
    ));
}
