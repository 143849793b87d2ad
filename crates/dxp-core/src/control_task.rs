//! Control task state machine.
//!
//! A control task is a bounded hardware operation (calibration, ADC trace,
//! memory access, DSP sleep) that borrows the run machinery of a board. The
//! lifecycle tracked per board is
//!
//! ```text
//! Idle ──begin──▶ Requested ──driver ok──▶ Running ──BUSY==0──▶ Completed
//!                     │                                            │
//!                     └──driver err──▶ Failed ──────end───────▶ Idle ◀──end──┘
//! ```
//!
//! [`ControlTaskRunner::read_memory`] and [`ControlTaskRunner::write_memory`]
//! drive the full `begin → wait → data → end` loop once per history-buffer
//! sized chunk.

use crate::board::{ActiveTask, Board};
use crate::error::{DxpError, Result};
use crate::poll::{poll_until, PollPolicy};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the DSP readiness symbol.
pub const BUSY_SYMBOL: &str = "BUSY";

/// Control task selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Set the ASC DAC
    SetAscDac,
    /// Capture an ADC trace into the history buffer
    Adc,
    /// Tracking DAC sweep
    TrackingDac,
    /// Slope calibration
    SlopeCalibration,
    /// Put the DSP to sleep (required while reprogramming the FPGA)
    SleepDsp,
    /// Reprogram the FiPPI from DSP-held parameters
    ProgramFippi,
    /// DSP reset task
    Reset,
    /// Set input polarity
    SetPolarity,
    /// Close the input relay
    CloseInputRelay,
    /// Open the input relay
    OpenInputRelay,
    /// RC preamp baseline measurement
    RcBaseline,
    /// RC preamp event capture
    RcEvent,
    /// Freeze the baseline history buffer
    BaselineHistory,
    /// Read external memory through the history buffer
    ReadMemory,
    /// Write external memory through the history buffer
    WriteMemory,
}

impl TaskType {
    /// All task types, in selector order.
    pub const ALL: [TaskType; 15] = [
        Self::SetAscDac,
        Self::Adc,
        Self::TrackingDac,
        Self::SlopeCalibration,
        Self::SleepDsp,
        Self::ProgramFippi,
        Self::Reset,
        Self::SetPolarity,
        Self::CloseInputRelay,
        Self::OpenInputRelay,
        Self::RcBaseline,
        Self::RcEvent,
        Self::BaselineHistory,
        Self::ReadMemory,
        Self::WriteMemory,
    ];

    /// Decode a numeric selector.
    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(DxpError::UnknownTaskType { code })
    }

    /// Numeric selector.
    pub fn code(self) -> i32 {
        match self {
            Self::SetAscDac => 0,
            Self::Adc => 1,
            Self::TrackingDac => 2,
            Self::SlopeCalibration => 3,
            Self::SleepDsp => 4,
            Self::ProgramFippi => 5,
            Self::Reset => 6,
            Self::SetPolarity => 8,
            Self::CloseInputRelay => 9,
            Self::OpenInputRelay => 10,
            Self::RcBaseline => 11,
            Self::RcEvent => 12,
            Self::BaselineHistory => 13,
            Self::ReadMemory => 14,
            Self::WriteMemory => 15,
        }
    }

    /// Minimum number of info words `begin` requires.
    pub fn min_info_words(self) -> usize {
        match self {
            Self::Adc => 2,
            Self::ReadMemory | Self::WriteMemory => 4,
            _ => 1,
        }
    }

    /// True for tasks that move data through external memory.
    pub fn is_memory(self) -> bool {
        matches!(self, Self::ReadMemory | Self::WriteMemory)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle phase of a control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskPhase {
    /// No task
    #[default]
    Idle,
    /// Accepted, hardware not yet configured
    Requested,
    /// Hardware is executing the task
    Running,
    /// Hardware reported completion
    Completed,
    /// Hardware setup failed
    Failed,
}

/// Buffer length and timing of a control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskParams {
    /// Words produced or consumed per task invocation
    pub buffer_len: usize,
    /// Suggested wait before the first completion poll
    pub initial_wait: Duration,
    /// Suggested completion poll interval
    pub poll_interval: Duration,
}

/// Poll the BUSY symbol of `channel` until it equals `expected`.
pub fn wait_for_busy(
    board: &Board,
    channel: usize,
    expected: f64,
    policy: &PollPolicy,
) -> Result<u32> {
    let driver = board.board_type();
    poll_until(
        policy,
        BUSY_SYMBOL,
        |d| board.io().wait(d),
        || Ok(driver.read_symbol(board, channel, BUSY_SYMBOL)? == expected),
    )
}

/// Control task lifecycle driver.
#[derive(Debug, Clone)]
pub struct ControlTaskRunner {
    busy_policy: PollPolicy,
}

impl Default for ControlTaskRunner {
    fn default() -> Self {
        Self::new(PollPolicy::new(Duration::from_millis(1), 1000))
    }
}

impl ControlTaskRunner {
    /// Runner polling BUSY with `busy_policy` in the memory loops.
    pub fn new(busy_policy: PollPolicy) -> Self {
        Self { busy_policy }
    }

    /// Current phase of `channel`.
    pub fn phase(board: &Board, channel: usize) -> TaskPhase {
        match board.run_state().control_task {
            Some(active) if active.channel == channel => active.phase,
            _ => TaskPhase::Idle,
        }
    }

    /// Start `task` on `channel`.
    pub fn begin(
        &self,
        board: &mut Board,
        channel: usize,
        task: TaskType,
        info: &[i32],
    ) -> Result<()> {
        board.channel(channel)?;
        if let Some(active) = board.run_state().control_task {
            if active.phase != TaskPhase::Idle {
                return Err(DxpError::TaskAlreadyActive {
                    module: board.iostring().to_string(),
                    channel: active.channel,
                });
            }
        }
        if board.run_state().acquisition_active {
            return Err(DxpError::RunActive {
                module: board.iostring().to_string(),
            });
        }
        if info.len() < task.min_info_words() {
            return Err(DxpError::InsufficientParams {
                task: task.to_string(),
                required: task.min_info_words(),
                provided: info.len(),
            });
        }

        board.run_state_mut().control_task = Some(ActiveTask {
            channel,
            task,
            phase: TaskPhase::Requested,
        });
        let driver = board.board_type().clone();
        match driver.begin_control_task(board, channel, task, info) {
            Ok(()) => {
                set_phase(board, TaskPhase::Running);
                debug!(module = board.iostring(), channel, task = %task, "Control task started");
                Ok(())
            }
            Err(e) => {
                set_phase(board, TaskPhase::Failed);
                warn!(
                    module = board.iostring(),
                    channel,
                    task = %task,
                    error = %e,
                    "Control task failed to start"
                );
                Err(e)
            }
        }
    }

    /// Block until the DSP reports BUSY == 0 and mark the task completed.
    pub fn wait_complete(&self, board: &mut Board, channel: usize) -> Result<()> {
        self.active(board, channel)?;
        wait_for_busy(board, channel, 0.0, &self.busy_policy)?;
        set_phase(board, TaskPhase::Completed);
        Ok(())
    }

    /// Copy the task's output buffer. Valid while running or completed.
    pub fn poll_data(&self, board: &Board, channel: usize) -> Result<Vec<i64>> {
        let active = self.active(board, channel)?;
        if !matches!(active.phase, TaskPhase::Running | TaskPhase::Completed) {
            return Err(not_active(board, channel));
        }
        board
            .board_type()
            .control_task_data(board, channel, active.task)
    }

    /// Finish the task and return to idle.
    pub fn end(&self, board: &mut Board, channel: usize) -> Result<()> {
        let active = self.active(board, channel)?;
        let driver = board.board_type().clone();
        let result = driver.end_control_task(board, channel, active.task);
        match (result, active.phase) {
            (Ok(()), _) => {
                board.run_state_mut().control_task = None;
                debug!(
                    module = board.iostring(),
                    channel,
                    task = %active.task,
                    "Control task ended"
                );
                Ok(())
            }
            (Err(e), TaskPhase::Failed) => {
                warn!(
                    module = board.iostring(),
                    channel,
                    error = %e,
                    "Cleanup of failed control task reported an error"
                );
                board.run_state_mut().control_task = None;
                Ok(())
            }
            (Err(e), _) => {
                set_phase(board, TaskPhase::Failed);
                Err(e)
            }
        }
    }

    /// Task timing and buffer size reported by the driver.
    pub fn params(&self, board: &Board, channel: usize, task: TaskType) -> Result<TaskParams> {
        board.board_type().control_task_params(board, channel, task)
    }

    /// Read `len` words of external memory starting at `base`.
    pub fn read_memory(
        &self,
        board: &mut Board,
        channel: usize,
        base: u32,
        len: usize,
    ) -> Result<Vec<u32>> {
        let chunk = self.memory_chunk(board, channel, TaskType::ReadMemory)?;
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        let mut first = true;
        while remaining > 0 {
            let current = remaining.min(chunk);
            let (page, addr) = memory_origin(base, first);
            let info = [0, page, addr, to_info_word(current)?];
            self.begin(board, channel, TaskType::ReadMemory, &info)?;
            let data = self
                .wait_complete(board, channel)
                .and_then(|()| self.poll_data(board, channel));
            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    self.abandon(board, channel, TaskType::ReadMemory);
                    return Err(e);
                }
            };
            out.extend(data.iter().take(current).map(|&w| w as u32));
            self.end(board, channel)?;
            remaining -= current;
            first = false;
        }
        info!(module = board.iostring(), channel, base, len, "Read external memory");
        Ok(out)
    }

    /// Write `data` to external memory starting at `base`.
    pub fn write_memory(
        &self,
        board: &mut Board,
        channel: usize,
        base: u32,
        data: &[u32],
    ) -> Result<()> {
        let chunk = self.memory_chunk(board, channel, TaskType::WriteMemory)?;
        for (i, words) in data.chunks(chunk).enumerate() {
            let (page, addr) = memory_origin(base, i == 0);
            let mut info = Vec::with_capacity(words.len() + 4);
            info.extend([0, page, addr, to_info_word(words.len())?]);
            info.extend(words.iter().map(|&w| (w & 0xFFFF) as i32));
            self.begin(board, channel, TaskType::WriteMemory, &info)?;
            if let Err(e) = self.wait_complete(board, channel) {
                self.abandon(board, channel, TaskType::WriteMemory);
                return Err(e);
            }
            self.end(board, channel)?;
        }
        info!(module = board.iostring(), channel, base, len = data.len(), "Wrote external memory");
        Ok(())
    }

    /// End a task whose transfer already failed. The transfer's error is the
    /// one reported, so a cleanup failure is only logged.
    fn abandon(&self, board: &mut Board, channel: usize, task: TaskType) {
        if let Err(e) = self.end(board, channel) {
            warn!(
                module = board.iostring(),
                channel,
                task = %task,
                error = %e,
                "Could not end abandoned control task"
            );
        }
    }

    fn memory_chunk(&self, board: &Board, channel: usize, task: TaskType) -> Result<usize> {
        let params = self.params(board, channel, task)?;
        if params.buffer_len == 0 {
            return Err(DxpError::bad_parameter(format!(
                "{task} reports a zero-length transfer buffer"
            )));
        }
        Ok(params.buffer_len)
    }

    fn active(&self, board: &Board, channel: usize) -> Result<ActiveTask> {
        match board.run_state().control_task {
            Some(active) if active.channel == channel => Ok(active),
            _ => Err(not_active(board, channel)),
        }
    }
}

fn set_phase(board: &mut Board, phase: TaskPhase) {
    if let Some(active) = board.run_state_mut().control_task.as_mut() {
        active.phase = phase;
    }
}

fn not_active(board: &Board, channel: usize) -> DxpError {
    DxpError::TaskNotActive {
        module: board.iostring().to_string(),
        channel,
    }
}

/// External memory page and in-page address for the first chunk; `-1`
/// (leave unchanged) for later chunks.
fn memory_origin(base: u32, first: bool) -> (i32, i32) {
    if first {
        (((base >> 14) & 0xFF) as i32, (base & 0x3FFF) as i32)
    } else {
        (-1, -1)
    }
}

fn to_info_word(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| DxpError::bad_parameter(format!("transfer length {len} too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{ChannelSel, ChannelSlot};
    use crate::bus::{Bus, BoardIo, BusHandle, IoBuffer};
    use crate::driver::DriverContract;
    use crate::firmware::{FirmwareImage, FirmwareInfo, FirmwareKind};
    use std::io::BufRead;
    use std::sync::Arc;
    use tracing_test::traced_test;

    struct QuietBus;

    impl Bus for QuietBus {
        fn name(&self) -> &str {
            "quiet"
        }
        fn open(&self, _iostring: &str) -> Result<BusHandle> {
            Ok(BusHandle(1))
        }
        fn io(&self, _handle: BusHandle, _address: u32, _buffer: IoBuffer<'_>) -> Result<()> {
            Ok(())
        }
        fn close(&self, _handle: BusHandle) -> Result<()> {
            Ok(())
        }
        fn max_block(&self) -> i64 {
            0
        }
        fn set_max_block(&self, _words: i64) {}
        fn wait(&self, _duration: Duration) {}
    }

    /// DSP that never finishes a task and cannot be stopped.
    struct WedgedFamily;

    impl DriverContract for WedgedFamily {
        fn name(&self) -> &'static str {
            "wedged"
        }
        fn max_channels(&self) -> usize {
            1
        }
        fn firmware_info(&self) -> FirmwareInfo {
            FirmwareInfo {
                max_program_len: 1,
                max_symbols: 1,
                max_symbol_name_len: 8,
            }
        }
        fn load_program(
            &self,
            _kind: FirmwareKind,
            _source_id: &str,
            _reader: &mut dyn BufRead,
            _info: &FirmwareInfo,
        ) -> Result<FirmwareImage> {
            Err(self.unsupported("load_program"))
        }
        fn download_fpga(&self, _board: &mut Board, _sel: ChannelSel, _name: &str) -> Result<()> {
            Ok(())
        }
        fn download_dsp(&self, _board: &mut Board, _sel: ChannelSel) -> Result<()> {
            Ok(())
        }
        fn read_symbol(&self, _board: &Board, _channel: usize, _name: &str) -> Result<f64> {
            Ok(1.0)
        }
        fn modify_symbol(
            &self,
            _board: &mut Board,
            _channel: usize,
            _name: &str,
            _value: f64,
        ) -> Result<Option<crate::driver::SymbolWarning>> {
            Ok(None)
        }
        fn begin_control_task(
            &self,
            _board: &mut Board,
            _channel: usize,
            _task: TaskType,
            _info: &[i32],
        ) -> Result<()> {
            Ok(())
        }
        fn end_control_task(
            &self,
            board: &mut Board,
            _channel: usize,
            _task: TaskType,
        ) -> Result<()> {
            Err(DxpError::device_io(board.iostring(), "run enable stuck"))
        }
        fn control_task_params(
            &self,
            _board: &Board,
            _channel: usize,
            _task: TaskType,
        ) -> Result<TaskParams> {
            Ok(TaskParams {
                buffer_len: 4,
                initial_wait: Duration::ZERO,
                poll_interval: Duration::ZERO,
            })
        }
        fn begin_run(&self, _board: &mut Board, _gate: bool, _resume: bool) -> Result<()> {
            Ok(())
        }
        fn end_run(&self, _board: &mut Board) -> Result<()> {
            Ok(())
        }
        fn run_active(&self, _board: &Board) -> Result<bool> {
            Ok(true)
        }
    }

    fn wedged_board() -> Board {
        let io = BoardIo::open(Arc::new(QuietBus), "w0").unwrap();
        Board::new(0, Arc::new(WedgedFamily), "quiet", "w0", io, vec![ChannelSlot::new(0)])
    }

    #[test]
    #[traced_test]
    fn test_failed_memory_transfer_reports_transfer_error_and_logs_cleanup() {
        let runner = ControlTaskRunner::new(PollPolicy::new(Duration::from_millis(1), 2));

        let mut board = wedged_board();
        let err = runner.read_memory(&mut board, 0, 0, 4).unwrap_err();
        assert!(matches!(err, DxpError::Timeout { attempts: 2, .. }), "{err:?}");
        assert!(logs_contain("Could not end abandoned control task"));
        assert!(logs_contain("run enable stuck"));

        let mut board = wedged_board();
        let err = runner.write_memory(&mut board, 0, 0, &[1, 2]).unwrap_err();
        assert!(matches!(err, DxpError::Timeout { .. }), "{err:?}");
        assert!(logs_contain("WriteMemory"));
    }

    #[test]
    fn test_task_codes_round_trip() {
        for task in TaskType::ALL {
            assert_eq!(TaskType::from_code(task.code()).unwrap(), task);
        }
        assert!(matches!(
            TaskType::from_code(7),
            Err(DxpError::UnknownTaskType { code: 7 })
        ));
        assert!(TaskType::from_code(99).is_err());
    }

    #[test]
    fn test_min_info_words() {
        assert_eq!(TaskType::ReadMemory.min_info_words(), 4);
        assert_eq!(TaskType::Adc.min_info_words(), 2);
        assert_eq!(TaskType::SleepDsp.min_info_words(), 1);
        assert!(TaskType::WriteMemory.is_memory());
    }

    #[test]
    fn test_memory_origin() {
        let base = (3 << 14) | 0x0123;
        assert_eq!(memory_origin(base, true), (3, 0x0123));
        assert_eq!(memory_origin(base, false), (-1, -1));
    }
}
