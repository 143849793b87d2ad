//! Firmware sources matching the simulator's parameter layout.
//!
//! [`dsp_program`] renders a DSP program whose symbol table is
//! [`SYMBOLS`]; the simulator resolves its well-known parameters against the
//! same list, so a program built here and downloaded to a
//! [`SimulatedBus`](crate::SimulatedBus) behaves like real firmware.

use std::fmt::Write;

/// Symbol lines of the simulated DSP, in address order.
pub const SYMBOLS: &[&str] = &[
    "BUSY -",
    "RUNTASKS",
    "WHICHTEST",
    "TRACEWAIT",
    "EXTPAGE",
    "EXTADDRESS",
    "EXTLENGTH",
    "HSTSTART",
    "HSTLEN",
    "CIRCULAR -",
    "RUNERROR",
    "ERRINFO -",
    "GAIN * 10 200",
    "FOO0",
    "FOO1",
    "LIVETIME0 -",
    "LIVETIME1 -",
    "LIVETIME2 -",
    "DECIMATION * 0 6",
    "SECRET w",
];

/// Address of `name` in [`SYMBOLS`].
pub fn symbol_address(name: &str) -> Option<u16> {
    SYMBOLS
        .iter()
        .position(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|i| u16::try_from(i).ok())
}

/// DSP program source with [`SYMBOLS`] and `words` program words
/// (rounded up to an even count, two words per instruction line).
pub fn dsp_program(words: usize) -> String {
    let mut text = String::from("* simulated DXP DSP program\n");
    let _ = writeln!(text, "{}", SYMBOLS.len());
    for line in SYMBOLS {
        let _ = writeln!(text, "{line}");
    }
    for i in 0..words.div_ceil(2) {
        let _ = writeln!(text, "{:04X}{:02X}", i & 0xFFFF, i & 0xFF);
    }
    text
}

/// FiPPI bitstream source with `words` configuration words.
pub fn fippi_bitstream(words: usize) -> String {
    let mut text = String::from("* simulated FiPPI\n");
    for i in 0..words {
        let word = (i as u16).wrapping_mul(0x0101);
        let _ = writeln!(text, "{:02X}{:02X}", word & 0xFF, word >> 8);
    }
    text
}

/// Defaults source for the simulated DSP.
pub fn defaults() -> String {
    "* simulated defaults\nGAIN 50\nDECIMATION 2\nTRACEWAIT 0Ah\nEND\nGAIN 99\n".to_string()
}
