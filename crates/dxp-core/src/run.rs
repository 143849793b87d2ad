//! Per-board run-state machine.
//!
//! `Idle ─start_run─▶ Acquiring ─stop_run─▶ Idle`. Control tasks occupy the
//! third state and are driven by [`ControlTaskRunner`](crate::control_task::ControlTaskRunner).
//!
//! The software state and the hardware run-active flag can disagree (after a
//! crash or a disconnect); [`is_running`] reports both so callers can
//! reconcile, and [`abort_run`] forces the hardware back to idle.

use crate::board::{Board, BoardState};
use crate::error::{DxpError, Result};
use bitflags::bitflags;
use tracing::{debug, info, warn};

bitflags! {
    /// Combined hardware/software run status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunStatus: u8 {
        /// Hardware reports an active run
        const HARDWARE_ACTIVE = 0b001;
        /// Software believes a run is active
        const SOFTWARE_ACTIVE = 0b010;
        /// A control task is in progress
        const CONTROL_TASK = 0b100;
    }
}

impl RunStatus {
    /// True if hardware and software disagree about acquisition.
    pub fn is_inconsistent(self) -> bool {
        !self.contains(Self::CONTROL_TASK)
            && self.contains(Self::HARDWARE_ACTIVE) != self.contains(Self::SOFTWARE_ACTIVE)
    }
}

/// Start a run. `resume = false` clears the accumulated spectrum;
/// `gate = true` ignores the external gate input.
pub fn start_run(board: &mut Board, gate: bool, resume: bool) -> Result<()> {
    if board.run_state().state() != BoardState::Idle {
        return Err(DxpError::RunActive {
            module: board.iostring().to_string(),
        });
    }
    let driver = board.board_type().clone();
    if driver.run_active(board)? {
        warn!(module = board.iostring(), "Hardware reports a run already active");
        return Err(DxpError::RunActive {
            module: board.iostring().to_string(),
        });
    }
    driver.begin_run(board, gate, resume)?;
    let run = board.run_state_mut();
    run.acquisition_active = true;
    run.gate = gate;
    info!(module = board.iostring(), gate, resume, "Run started");
    Ok(())
}

/// Restart a run without clearing the spectrum, reusing the last gate mode.
pub fn resume_run(board: &mut Board) -> Result<()> {
    let gate = board.run_state().gate;
    start_run(board, gate, true)
}

/// Stop an acquisition. A no-op when the board is not acquiring.
pub fn stop_run(board: &mut Board) -> Result<()> {
    if board.run_state().state() != BoardState::Acquiring {
        debug!(module = board.iostring(), "stop_run on idle board ignored");
        return Ok(());
    }
    let driver = board.board_type().clone();
    driver.end_run(board)?;
    board.run_state_mut().acquisition_active = false;
    info!(module = board.iostring(), "Run stopped");
    Ok(())
}

/// Unconditionally stop the hardware and clear the software run flag.
pub fn abort_run(board: &mut Board) -> Result<()> {
    let driver = board.board_type().clone();
    driver.end_run(board)?;
    let run = board.run_state_mut();
    run.acquisition_active = false;
    run.control_task = None;
    warn!(module = board.iostring(), "Run aborted");
    Ok(())
}

/// Hardware and software run status.
pub fn is_running(board: &Board) -> Result<RunStatus> {
    let mut status = RunStatus::empty();
    if board.board_type().run_active(board)? {
        status |= RunStatus::HARDWARE_ACTIVE;
    }
    if board.run_state().acquisition_active {
        status |= RunStatus::SOFTWARE_ACTIVE;
    }
    if board.run_state().control_task.is_some() {
        status |= RunStatus::CONTROL_TASK;
    }
    if status.is_inconsistent() {
        warn!(
            module = board.iostring(),
            status = status.bits(),
            "Hardware and software run state disagree"
        );
    }
    Ok(status)
}

/// Enable the attention request of `channel`.
pub fn enable_lam(board: &mut Board, channel: usize) -> Result<()> {
    board.channel(channel)?;
    let driver = board.board_type().clone();
    driver.enable_lam(board, channel)
}

/// Disable the attention request of `channel`.
pub fn disable_lam(board: &mut Board, channel: usize) -> Result<()> {
    board.channel(channel)?;
    let driver = board.board_type().clone();
    driver.disable_lam(board, channel)
}

/// Clear a pending attention request of `channel`.
pub fn clear_lam(board: &mut Board, channel: usize) -> Result<()> {
    board.channel(channel)?;
    let driver = board.board_type().clone();
    driver.clear_lam(board, channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_bits() {
        let s = RunStatus::HARDWARE_ACTIVE | RunStatus::SOFTWARE_ACTIVE;
        assert_eq!(s.bits(), 3);
        assert!(!s.is_inconsistent());
        assert!(RunStatus::HARDWARE_ACTIVE.is_inconsistent());
        assert!(RunStatus::SOFTWARE_ACTIVE.is_inconsistent());
        assert!(!(RunStatus::HARDWARE_ACTIVE | RunStatus::CONTROL_TASK).is_inconsistent());
        assert!(!RunStatus::empty().is_inconsistent());
    }
}
