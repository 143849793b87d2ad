//! Hardware families served by [`XiaDriver`](crate::XiaDriver).
//!
//! Both families share the port layout, DSP memory map and control-task
//! protocol in [`registers`](crate::registers). They differ in how many
//! channels a module carries; only multi-channel modules route transfers
//! through the CSR channel field.

use std::fmt;

/// Static description of one hardware family.
pub trait Family: fmt::Debug + Default + Clone + Copy + Send + Sync + 'static {
    /// Name the family registers under.
    const BOARD_TYPE: &'static str;
    /// Model name used in messages.
    const MODEL: &'static str;
    /// Channels per module.
    const CHANNELS: usize;

    /// Whether transfers must select a channel first.
    fn routed() -> bool {
        Self::CHANNELS > 1
    }
}

/// The single-channel DXP-X10P (Saturn).
#[derive(Debug, Default, Clone, Copy)]
pub struct X10p;

impl Family for X10p {
    const BOARD_TYPE: &'static str = "dxpx10p";
    const MODEL: &'static str = "DXP-X10P";
    const CHANNELS: usize = 1;
}

/// The four-channel DXP-4C2X.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dxp4c2x;

impl Family for Dxp4c2x {
    const BOARD_TYPE: &'static str = "dxp4c2x";
    const MODEL: &'static str = "DXP-4C2X";
    const CHANNELS: usize = 4;
}
