//! The per-family driver contract.
//!
//! Everything above the bus is written against [`DriverContract`]; nothing in
//! the core branches on a family name. A family is registered once with the
//! [`ModuleRegistry`](crate::registry::ModuleRegistry) and selected by its
//! [`name`](DriverContract::name) when boards are created.
//!
//! # Implementing a family
//!
//! ```rust,ignore
//! struct MyFamily;
//!
//! impl DriverContract for MyFamily {
//!     fn name(&self) -> &'static str { "myfamily" }
//!     fn firmware_info(&self) -> FirmwareInfo { /* sizing */ }
//!     fn load_program(&self, kind, source_id, reader, info) -> Result<FirmwareImage> {
//!         /* parse */
//!     }
//!     // downloads, symbol access and run control ...
//! }
//!
//! registry.register_board_type(Arc::new(MyFamily));
//! ```
//!
//! Optional capabilities (control tasks, error decoding, bulk parameter
//! transfers) have default implementations returning
//! [`DxpError::NotSupported`]; LAM handling defaults to a no-op.

use crate::board::{Board, ChannelSel};
use crate::control_task::{TaskParams, TaskType};
use crate::error::{DxpError, Result};
use crate::firmware::{FirmwareImage, FirmwareInfo, FirmwareKind};
use std::io::BufRead;
use std::time::Duration;

/// Non-fatal outcome of a symbol write.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolWarning {
    /// The requested value was outside the symbol's range and was clamped
    BoundsClamped {
        /// Symbol written
        name: String,
        /// Value the caller asked for
        requested: f64,
        /// Value actually written
        written: u16,
    },
}

/// Fault state reported by the DSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFault {
    /// Run error code (0 = none)
    pub run_error: u16,
    /// Additional information, 0 when `run_error` is 0
    pub error_info: u16,
}

impl DeviceFault {
    /// True if the DSP reported an error.
    pub fn is_error(&self) -> bool {
        self.run_error != 0
    }
}

/// Capability set implemented once per hardware family.
pub trait DriverContract: Send + Sync {
    /// Case-insensitive family name (e.g. `"dxpx10p"`).
    fn name(&self) -> &'static str;

    /// Channels per module for this family.
    fn max_channels(&self) -> usize;

    /// Sizing used before allocating a firmware image.
    fn firmware_info(&self) -> FirmwareInfo;

    /// Parse a firmware source of `kind`.
    fn load_program(
        &self,
        kind: FirmwareKind,
        source_id: &str,
        reader: &mut dyn BufRead,
        info: &FirmwareInfo,
    ) -> Result<FirmwareImage>;

    /// Push the assigned FPGA bitstream to the selected channels.
    fn download_fpga(&self, board: &mut Board, sel: ChannelSel, name: &str) -> Result<()>;

    /// Verify an FPGA download.
    fn download_fpga_done(
        &self,
        _board: &mut Board,
        _sel: ChannelSel,
        _name: &str,
    ) -> Result<bool> {
        Err(self.unsupported("download_fpga_done"))
    }

    /// Push the assigned DSP program to the selected channels.
    fn download_dsp(&self, board: &mut Board, sel: ChannelSel) -> Result<()>;

    /// Verify a DSP download by waiting for BUSY to reach `expected_busy`.
    fn download_dsp_done(
        &self,
        _board: &mut Board,
        _channel: usize,
        _expected_busy: u16,
        _timeout: Duration,
    ) -> Result<bool> {
        Err(self.unsupported("download_dsp_done"))
    }

    /// Read a (possibly multi-word) DSP symbol.
    fn read_symbol(&self, board: &Board, channel: usize, name: &str) -> Result<f64>;

    /// Write a DSP symbol, clamping to its bounds.
    fn modify_symbol(
        &self,
        board: &mut Board,
        channel: usize,
        name: &str,
        value: f64,
    ) -> Result<Option<SymbolWarning>>;

    /// Read the whole parameter block and refresh the channel snapshot.
    fn read_all(&self, _board: &mut Board, _channel: usize) -> Result<Vec<u16>> {
        Err(self.unsupported("read_all"))
    }

    /// Write the whole parameter block.
    fn write_all(&self, _board: &mut Board, _channel: usize, _params: &[u16]) -> Result<()> {
        Err(self.unsupported("write_all"))
    }

    /// Decode a control task selector.
    fn task_type(&self, code: i32) -> Result<TaskType> {
        TaskType::from_code(code)
    }

    /// Start a control task on the hardware.
    fn begin_control_task(
        &self,
        _board: &mut Board,
        _channel: usize,
        _task: TaskType,
        _info: &[i32],
    ) -> Result<()> {
        Err(self.unsupported("begin_control_task"))
    }

    /// Stop a control task on the hardware.
    fn end_control_task(&self, _board: &mut Board, _channel: usize, _task: TaskType) -> Result<()> {
        Err(self.unsupported("end_control_task"))
    }

    /// Buffer length and timing for a control task.
    fn control_task_params(
        &self,
        _board: &Board,
        _channel: usize,
        _task: TaskType,
    ) -> Result<TaskParams> {
        Err(self.unsupported("control_task_params"))
    }

    /// Copy the data produced by a control task.
    fn control_task_data(
        &self,
        _board: &Board,
        _channel: usize,
        _task: TaskType,
    ) -> Result<Vec<i64>> {
        Err(self.unsupported("control_task_data"))
    }

    /// Start a run on the hardware.
    fn begin_run(&self, board: &mut Board, gate: bool, resume: bool) -> Result<()>;

    /// Stop a run on the hardware.
    fn end_run(&self, board: &mut Board) -> Result<()>;

    /// Whether the hardware reports an active run.
    fn run_active(&self, board: &Board) -> Result<bool>;

    /// Decode run error words from a parameter snapshot.
    fn decode_error(
        &self,
        _board: &Board,
        _channel: usize,
        _snapshot: &[u16],
    ) -> Result<DeviceFault> {
        Err(self.unsupported("decode_error"))
    }

    /// Clear a non-fatal DSP error.
    fn clear_error(&self, _board: &mut Board, _channel: usize) -> Result<()> {
        Err(self.unsupported("clear_error"))
    }

    /// Enable the attention request line.
    fn enable_lam(&self, _board: &mut Board, _channel: usize) -> Result<()> {
        Ok(())
    }

    /// Disable the attention request line.
    fn disable_lam(&self, _board: &mut Board, _channel: usize) -> Result<()> {
        Ok(())
    }

    /// Clear a pending attention request.
    fn clear_lam(&self, _board: &mut Board, _channel: usize) -> Result<()> {
        Ok(())
    }

    /// Error for an optional capability this family does not provide.
    fn unsupported(&self, operation: &'static str) -> DxpError {
        DxpError::NotSupported {
            board_type: self.name().to_string(),
            operation,
        }
    }
}
