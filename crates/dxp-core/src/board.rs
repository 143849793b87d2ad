//! Physical modules and their per-channel state.
//!
//! A [`Board`] owns its channel slots and run state exclusively. Firmware in a
//! [`ChannelSlot`] is a shared reference into the registry and is never copied
//! or mutated through the board.

use crate::bus::BoardIo;
use crate::control_task::{TaskPhase, TaskType};
use crate::driver::DriverContract;
use crate::error::{DxpError, Result};
use crate::firmware::{FirmwareKind, SharedFirmware};
use std::fmt;
use std::sync::Arc;

/// Whether a channel's DSP program is resident on the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    /// Never downloaded
    #[default]
    NotLoaded = 0,
    /// Current image is running
    Loaded = 1,
    /// A different image has since been assigned
    Stale = 2,
}

/// Channel addressing for operations that may target every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSel {
    /// Every channel of the board
    All,
    /// A single channel
    One(usize),
}

/// One detector-processing lane of a board.
#[derive(Debug, Clone, Default)]
pub struct ChannelSlot {
    /// Channel takes part in acquisition
    pub enabled: bool,
    /// Detector number mapped to this channel
    pub detector: i32,
    /// Assigned DSP program
    pub dsp: Option<SharedFirmware>,
    /// Assigned FPGA bitstream
    pub fpga: Option<SharedFirmware>,
    /// Assigned default values
    pub defaults: Option<SharedFirmware>,
    /// Last parameter block read from or written to the DSP
    pub parameter_snapshot: Vec<u16>,
    /// DSP residency
    pub dsp_downloaded: DownloadState,
}

impl ChannelSlot {
    /// Slot for `detector`, enabled, with no firmware.
    pub fn new(detector: i32) -> Self {
        Self {
            enabled: true,
            detector,
            ..Self::default()
        }
    }

    /// Assigned firmware of `kind`.
    pub fn firmware(&self, kind: FirmwareKind) -> Option<&SharedFirmware> {
        match kind {
            FirmwareKind::Dsp => self.dsp.as_ref(),
            FirmwareKind::Fpga => self.fpga.as_ref(),
            FirmwareKind::Defaults => self.defaults.as_ref(),
        }
    }
}

/// A control task in progress on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTask {
    /// Channel running the task
    pub channel: usize,
    /// Task selector
    pub task: TaskType,
    /// Lifecycle phase
    pub phase: TaskPhase,
}

/// Coarse board state derived from [`RunState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardState {
    /// Nothing running
    Idle,
    /// Data acquisition in progress
    Acquiring,
    /// A control task owns the board
    ControlTask,
}

/// Software view of a board's activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    /// Software believes a run is active
    pub acquisition_active: bool,
    /// Gate mode used by the last `start_run`, reused by resume
    pub gate: bool,
    /// Control task in progress, if any
    pub control_task: Option<ActiveTask>,
    /// Advisory lock for higher layers; not enforced here
    pub resource_locked: bool,
}

impl RunState {
    /// Coarse state.
    pub fn state(&self) -> BoardState {
        if self.control_task.is_some() {
            BoardState::ControlTask
        } else if self.acquisition_active {
            BoardState::Acquiring
        } else {
            BoardState::Idle
        }
    }
}

/// One physical module.
pub struct Board {
    id: usize,
    board_type: Arc<dyn DriverContract>,
    interface: String,
    iostring: String,
    io: BoardIo,
    channels: Vec<ChannelSlot>,
    run: RunState,
}

impl Board {
    /// Create a board with `channels` already populated.
    pub fn new(
        id: usize,
        board_type: Arc<dyn DriverContract>,
        interface: impl Into<String>,
        iostring: impl Into<String>,
        io: BoardIo,
        channels: Vec<ChannelSlot>,
    ) -> Self {
        Self {
            id,
            board_type,
            interface: interface.into(),
            iostring: iostring.into(),
            io,
            channels,
            run: RunState::default(),
        }
    }

    /// Registry index of this board.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Driver for this board's hardware family.
    pub fn board_type(&self) -> &Arc<dyn DriverContract> {
        &self.board_type
    }

    /// Interface name the board is attached to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Bus address string.
    pub fn iostring(&self) -> &str {
        &self.iostring
    }

    /// Bus handle for this board.
    pub fn io(&self) -> &BoardIo {
        &self.io
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// All channel slots.
    pub fn channels(&self) -> &[ChannelSlot] {
        &self.channels
    }

    /// Channel slot `channel`.
    pub fn channel(&self, channel: usize) -> Result<&ChannelSlot> {
        let count = self.channels.len();
        self.channels
            .get(channel)
            .ok_or_else(|| bad_channel(&self.iostring, channel, count))
    }

    /// Mutable channel slot `channel`.
    pub fn channel_mut(&mut self, channel: usize) -> Result<&mut ChannelSlot> {
        let count = self.channels.len();
        let iostring = &self.iostring;
        self.channels
            .get_mut(channel)
            .ok_or_else(|| bad_channel(iostring, channel, count))
    }

    /// Bus handle together with a mutable channel slot.
    pub fn io_and_channel_mut(&mut self, channel: usize) -> Result<(&BoardIo, &mut ChannelSlot)> {
        let count = self.channels.len();
        match self.channels.get_mut(channel) {
            Some(slot) => Ok((&self.io, slot)),
            None => Err(bad_channel(&self.iostring, channel, count)),
        }
    }

    /// Channel indices selected by `sel`.
    pub fn select(&self, sel: ChannelSel) -> Result<Vec<usize>> {
        match sel {
            ChannelSel::All => Ok((0..self.channels.len()).collect()),
            ChannelSel::One(ch) => self.channel(ch).map(|_| vec![ch]),
        }
    }

    /// Software run state.
    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    pub(crate) fn run_state_mut(&mut self) -> &mut RunState {
        &mut self.run
    }

    /// Set the advisory resource lock.
    pub fn set_resource_locked(&mut self, locked: bool) {
        self.run.resource_locked = locked;
    }

    /// Assign a firmware image to `channel`, into the slot matching its kind.
    ///
    /// Assigning a different DSP image marks a loaded channel [`DownloadState::Stale`].
    pub fn assign_firmware(&mut self, channel: usize, image: SharedFirmware) -> Result<()> {
        let slot = self.channel_mut(channel)?;
        match image.kind() {
            FirmwareKind::Dsp => {
                let changed = slot
                    .dsp
                    .as_ref()
                    .map_or(true, |old| !Arc::ptr_eq(old, &image));
                if changed && slot.dsp_downloaded == DownloadState::Loaded {
                    slot.dsp_downloaded = DownloadState::Stale;
                }
                slot.dsp = Some(image);
            }
            FirmwareKind::Fpga => slot.fpga = Some(image),
            FirmwareKind::Defaults => slot.defaults = Some(image),
        }
        Ok(())
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("id", &self.id)
            .field("board_type", &self.board_type.name())
            .field("interface", &self.interface)
            .field("iostring", &self.iostring)
            .field("channels", &self.channels.len())
            .field("run", &self.run)
            .finish()
    }
}

fn bad_channel(iostring: &str, channel: usize, count: usize) -> DxpError {
    DxpError::bad_parameter(format!(
        "channel {channel} out of range for module '{iostring}' ({count} channels)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_derivation() {
        let mut rs = RunState::default();
        assert_eq!(rs.state(), BoardState::Idle);
        rs.acquisition_active = true;
        assert_eq!(rs.state(), BoardState::Acquiring);
        rs.control_task = Some(ActiveTask {
            channel: 0,
            task: TaskType::Adc,
            phase: TaskPhase::Running,
        });
        assert_eq!(rs.state(), BoardState::ControlTask);
    }

    #[test]
    fn test_channel_slot_defaults() {
        let slot = ChannelSlot::new(4);
        assert!(slot.enabled);
        assert_eq!(slot.detector, 4);
        assert_eq!(slot.dsp_downloaded, DownloadState::NotLoaded);
        assert!(slot.firmware(FirmwareKind::Dsp).is_none());
    }
}
