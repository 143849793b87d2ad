//! Register map shared by the DXP-X10P and DXP-4C2X.
//!
//! A module exposes four ports. Memory transfers write a start address to
//! [`TSAR`] and then move words through [`DATA`], which auto-increments the
//! address after every word. FPGA configuration words go to [`FIPPI`].
//!
//! DSP program memory starts at [`PROGRAM_BASE`]; parameter (data) memory
//! starts at [`DATA_BASE`] and every symbol address is relative to it.
//!
//! On multi-channel modules the CSR channel field ([`Csr::CHANNEL`]) picks
//! the DSP and FiPPI that memory and configuration transfers reach, and
//! [`Csr::ALL_CHANNELS`] broadcasts writes to every channel. Run control is
//! module wide.

use bitflags::bitflags;

// =============================================================================
// Ports
// =============================================================================

/// Transfer start address register
pub const TSAR: u32 = 0;
/// Control/status register
pub const CSR: u32 = 1;
/// Auto-incrementing data port
pub const DATA: u32 = 2;
/// FiPPI configuration port
pub const FIPPI: u32 = 3;

// =============================================================================
// Memory layout
// =============================================================================

/// First word of DSP program memory.
pub const PROGRAM_BASE: u16 = 0x0000;
/// First word of DSP parameter memory.
pub const DATA_BASE: u16 = 0x4000;

/// Words of the DSP program written last to start it running.
pub const BOOT_WORDS: usize = 2;
/// FPGA words sent one at a time before block transfers.
pub const FIPPI_SLOW_WORDS: usize = 10;

// =============================================================================
// Sizing
// =============================================================================

/// Longest DSP program, in 16-bit words.
pub const MAX_DSP_PROGRAM_LEN: usize = DATA_BASE as usize;
/// Most symbols in one DSP parameter table.
pub const MAX_DSP_SYMBOLS: usize = 500;
/// Longest DSP symbol name.
pub const MAX_SYMBOL_NAME_LEN: usize = 15;

// =============================================================================
// Bit layouts
// =============================================================================

bitflags! {
    /// Control/status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csr: u16 {
        /// Start (set) or stop (clear) a run
        const RUN_ENABLE = 0x0001;
        /// Clear the MCA when the run starts
        const RESET_MCA = 0x0002;
        /// Ignore the external gate input
        const IGNORE_GATE = 0x0004;
        /// Hold the DSP in reset for a program download
        const DSP_RESET = 0x0010;
        /// Reset the FiPPI for a configuration download
        const FIPPI_RESET = 0x0020;
        /// Channel addressed by memory and FiPPI transfers
        const CHANNEL = 0x00C0;
        /// FiPPI not configured (cleared once the download completes)
        const FIPPI_ERROR = 0x0100;
        /// Send writes to every channel at once
        const ALL_CHANNELS = 0x0200;
        /// Hardware reports an active run
        const RUN_ACTIVE = 0x0800;
    }
}

/// Position of [`Csr::CHANNEL`].
pub const CHANNEL_SHIFT: u32 = 6;

impl Csr {
    /// Channel field selecting `channel`, or `None` past the field's width.
    pub fn select(channel: usize) -> Option<Csr> {
        let max = Csr::CHANNEL.bits() >> CHANNEL_SHIFT;
        u16::try_from(channel)
            .ok()
            .filter(|&ch| ch <= max)
            .map(|ch| Csr::from_bits_retain(ch << CHANNEL_SHIFT))
    }

    /// Channel named by the channel field.
    pub fn selected_channel(self) -> usize {
        usize::from((self.bits() & Csr::CHANNEL.bits()) >> CHANNEL_SHIFT)
    }
}

bitflags! {
    /// `RUNTASKS` DSP parameter bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunTasks: u16 {
        /// Next run executes the `WHICHTEST` control task
        const CONTROL_TASK = 0x0100;
        /// Freeze baseline history collection
        const STOP_BASELINE = 0x0200;
    }
}

/// `WHICHTEST` values selecting the DSP control task.
pub mod whichtest {
    /// Set the ASC DAC
    pub const SET_ASCDAC: u16 = 0;
    /// Acquire an ADC trace
    pub const ACQUIRE_ADC: u16 = 1;
    /// Tracking DAC
    pub const TRKDAC: u16 = 2;
    /// Slope calibration
    pub const SLOPE_CALIB: u16 = 3;
    /// Put the DSP to sleep
    pub const SLEEP_DSP: u16 = 4;
    /// Reprogram the FiPPI
    pub const PROGRAM_FIPPI: u16 = 5;
    /// Set input polarity
    pub const SET_POLARITY: u16 = 6;
    /// Close the input relay
    pub const CLOSE_INPUT_RELAY: u16 = 7;
    /// Open the input relay
    pub const OPEN_INPUT_RELAY: u16 = 8;
    /// RC preamp baseline
    pub const RC_BASELINE: u16 = 9;
    /// RC preamp event
    pub const RC_EVENT: u16 = 10;
    /// DSP reset task
    pub const RESET: u16 = 11;
    /// External memory to history buffer
    pub const READ_MEMORY: u16 = 12;
    /// History buffer to external memory
    pub const WRITE_MEMORY: u16 = 13;
}

/// `BUSY` value reported while the DSP sleeps.
pub const BUSY_SLEEPING: u16 = 7;

/// DSP parameter names the driver relies on.
pub mod symbol {
    /// DSP readiness
    pub const BUSY: &str = "BUSY";
    /// Control task enable bits
    pub const RUNTASKS: &str = "RUNTASKS";
    /// Control task selector
    pub const WHICHTEST: &str = "WHICHTEST";
    /// ADC trace sample interval
    pub const TRACEWAIT: &str = "TRACEWAIT";
    /// External memory page
    pub const EXTPAGE: &str = "EXTPAGE";
    /// External memory address within the page
    pub const EXTADDRESS: &str = "EXTADDRESS";
    /// External memory transfer length
    pub const EXTLENGTH: &str = "EXTLENGTH";
    /// History buffer offset in parameter memory
    pub const HSTSTART: &str = "HSTSTART";
    /// History buffer length
    pub const HSTLEN: &str = "HSTLEN";
    /// Write position in the circular baseline history
    pub const CIRCULAR: &str = "CIRCULAR";
    /// Run error code
    pub const RUNERROR: &str = "RUNERROR";
    /// Run error detail
    pub const ERRINFO: &str = "ERRINFO";
}
