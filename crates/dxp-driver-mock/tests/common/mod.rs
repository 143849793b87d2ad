//! Shared rig for the simulated-module scenarios.

#![allow(dead_code)]

use dxp_core::{DxpSystem, FileLocator, FirmwareKind, ModuleRegistry, SharedFirmware, TimingConfig};
use dxp_driver_mock::{fixtures, SimulatedBus};
use dxp_driver_xia::{Family, X10p, X10pDriver};
use std::io::Cursor;
use std::sync::Arc;

pub const MODULE: &str = "0x378";
pub const DETECTOR: i32 = 7;
pub const DSP: &str = "sim.dsp";
pub const FIPPI: &str = "sim.fip";
pub const DEFAULTS: &str = "sim.def";

pub struct Rig {
    pub bus: Arc<SimulatedBus>,
    pub system: DxpSystem,
}

impl Rig {
    /// One X10P module on `bus` with firmware assigned but not downloaded.
    pub fn new(bus: SimulatedBus, timing: TimingConfig, program_words: usize) -> Self {
        let bus = Arc::new(bus);
        let mut registry = ModuleRegistry::new(FileLocator::default());
        registry.register_board_type(Arc::new(X10pDriver::new(timing)));
        registry.add_interface("sim", bus.clone());

        load(&mut registry, FirmwareKind::Dsp, DSP, &fixtures::dsp_program(program_words));
        load(&mut registry, FirmwareKind::Fpga, FIPPI, &fixtures::fippi_bitstream(40));
        load(&mut registry, FirmwareKind::Defaults, DEFAULTS, &fixtures::defaults());

        let mut system = DxpSystem::new(registry, timing);
        system.add_module(X10p::BOARD_TYPE, "sim", MODULE, &[DETECTOR]).unwrap();
        for (kind, id) in [
            (FirmwareKind::Fpga, FIPPI),
            (FirmwareKind::Dsp, DSP),
            (FirmwareKind::Defaults, DEFAULTS),
        ] {
            system.assign_firmware(DETECTOR, kind, id).unwrap();
        }
        Self { bus, system }
    }

    /// Default rig with everything downloaded.
    pub fn loaded() -> Self {
        let mut rig = Self::new(SimulatedBus::new(), TimingConfig::default(), 64);
        rig.system.download_all().unwrap();
        rig
    }
}

fn load(registry: &mut ModuleRegistry, kind: FirmwareKind, id: &str, text: &str) -> SharedFirmware {
    registry
        .load_firmware_from(X10p::BOARD_TYPE, kind, id, &mut Cursor::new(text.as_bytes()))
        .unwrap()
}
