//! Detector-addressed facade over the registry.
//!
//! [`DxpSystem`] is what applications hold: it owns the [`ModuleRegistry`],
//! the [`DetectorMap`] and the [`ControlTaskRunner`], and every public
//! operation takes a detector number that is resolved to a board channel
//! before any board or symbol table is touched.

use crate::board::{ChannelSel, ChannelSlot, DownloadState};
use crate::bus::Bus;
use crate::config::{InterfaceConfig, SystemConfig, TimingConfig};
use crate::control_task::{ControlTaskRunner, TaskParams, TaskType};
use crate::detector::{ChannelAddr, DetectorMap};
use crate::driver::{DeviceFault, DriverContract, SymbolWarning};
use crate::error::{DxpError, Result};
use crate::firmware::{FirmwareKind, SharedFirmware};
use crate::registry::ModuleRegistry;
use crate::run::{self, RunStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A configured set of modules addressed by detector number.
pub struct DxpSystem {
    registry: ModuleRegistry,
    detectors: DetectorMap,
    runner: ControlTaskRunner,
    timing: TimingConfig,
}

impl DxpSystem {
    /// Wrap an existing registry with no detectors mapped.
    pub fn new(registry: ModuleRegistry, timing: TimingConfig) -> Self {
        Self {
            registry,
            detectors: DetectorMap::new(),
            runner: ControlTaskRunner::new(timing.memory_busy_policy()),
            timing,
        }
    }

    /// Build a system from `config`, registering `drivers` and creating one
    /// bus per interface with `make_bus`.
    pub fn from_config<F>(
        config: &SystemConfig,
        drivers: Vec<Arc<dyn DriverContract>>,
        mut make_bus: F,
    ) -> Result<Self>
    where
        F: FnMut(&InterfaceConfig) -> Result<Arc<dyn Bus>>,
    {
        config.validate()?;
        let mut registry = ModuleRegistry::new(config.search.locator());
        for driver in drivers {
            registry.register_board_type(driver);
        }
        for iface in &config.interfaces {
            let bus = make_bus(iface)?;
            bus.set_max_block(iface.max_block);
            registry.add_interface(iface.name.clone(), bus);
        }

        let mut system = Self::new(registry, config.timing);
        for module in &config.modules {
            let board = system.add_module(
                &module.board_type,
                &module.interface,
                &module.iostring,
                &module.detectors,
            )?;
            for &ch in &module.disabled_channels {
                system.registry.board_mut(board)?.channel_mut(ch)?.enabled = false;
            }
            let assignments = [
                (FirmwareKind::Fpga, &module.fippi),
                (FirmwareKind::Dsp, &module.dsp),
                (FirmwareKind::Defaults, &module.defaults),
            ];
            for (kind, source) in assignments {
                if let Some(source_id) = source {
                    for &det in &module.detectors {
                        system.assign_firmware(det, kind, source_id)?;
                    }
                }
            }
        }
        info!(
            boards = system.registry.boards().len(),
            detectors = system.detectors.len(),
            firmware = system.registry.firmware_count(),
            "System configured"
        );
        Ok(system)
    }

    /// Add a module whose channels map to `detectors`. Returns the board index.
    ///
    /// Every detector number is checked, against the existing map and against
    /// the rest of `detectors`, before the board is created.
    pub fn add_module(
        &mut self,
        board_type: &str,
        interface: &str,
        iostring: &str,
        detectors: &[i32],
    ) -> Result<usize> {
        let mut seen = HashSet::with_capacity(detectors.len());
        for &det in detectors {
            if self.detectors.resolve(det).is_ok() {
                return Err(DxpError::bad_parameter(format!("detector {det} is already mapped")));
            }
            if !seen.insert(det) {
                return Err(DxpError::bad_parameter(format!(
                    "detector {det} is listed twice for module '{iostring}'"
                )));
            }
        }
        let channels = detectors.iter().map(|&d| ChannelSlot::new(d)).collect();
        let board = self.registry.add_board(board_type, interface, iostring, channels)?;
        for (ch, &det) in detectors.iter().enumerate() {
            self.detectors.insert(det, board, ch)?;
        }
        Ok(board)
    }

    /// Load (or reuse) firmware and assign it to `detector`'s channel.
    pub fn assign_firmware(
        &mut self,
        detector: i32,
        kind: FirmwareKind,
        source_id: &str,
    ) -> Result<SharedFirmware> {
        let addr = self.locate(detector)?;
        let board_type = self.registry.board(addr.board)?.board_type().name();
        let image = self.registry.load_firmware(board_type, kind, source_id)?;
        self.registry
            .board_mut(addr.board)?
            .assign_firmware(addr.channel, Arc::clone(&image))?;
        Ok(image)
    }

    /// Underlying registry.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Underlying registry, mutably.
    pub fn registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.registry
    }

    /// Detector mapping.
    pub fn detectors(&self) -> &DetectorMap {
        &self.detectors
    }

    /// Timing constants in effect.
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Resolve `detector`.
    pub fn locate(&self, detector: i32) -> Result<ChannelAddr> {
        self.detectors.resolve(detector)
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// Download the FPGA image `name` (`"all"` or `"fippi"`) to `detector`.
    pub fn download_fpga(&mut self, detector: i32, name: &str) -> Result<()> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let driver = board.board_type().clone();
        driver.download_fpga(board, ChannelSel::One(addr.channel), name)
    }

    /// Download the DSP program to `detector` and apply its defaults.
    pub fn download_dsp(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        {
            let board = self.registry.board_mut(addr.board)?;
            let driver = board.board_type().clone();
            driver.download_dsp(board, ChannelSel::One(addr.channel))?;
        }
        self.apply_defaults(detector)?;
        Ok(())
    }

    /// Write the assigned default values to `detector`. Returns the number of
    /// values written.
    pub fn apply_defaults(&mut self, detector: i32) -> Result<usize> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let Some(defaults) = board.channel(addr.channel)?.defaults.clone() else {
            return Ok(0);
        };
        let driver = board.board_type().clone();
        for value in defaults.default_values() {
            if let Some(SymbolWarning::BoundsClamped { written, .. }) =
                driver.modify_symbol(board, addr.channel, &value.name, f64::from(value.value))?
            {
                debug!(symbol = %value.name, written, "Default value clamped");
            }
        }
        Ok(defaults.default_values().len())
    }

    /// Download FPGA, DSP and defaults to every enabled channel.
    ///
    /// FPGAs go first. A multi-channel board whose channels are all enabled
    /// and share one DSP program receives it in a single broadcast; other
    /// boards are downloaded channel by channel.
    pub fn download_all(&mut self) -> Result<()> {
        let mut dsp_pending: Vec<(i32, usize)> = Vec::new();
        for detector in self.detectors.detectors().to_vec() {
            let addr = self.locate(detector)?;
            let slot = self.registry.board(addr.board)?.channel(addr.channel)?;
            if !slot.enabled {
                debug!(detector, "Skipping disabled channel");
                continue;
            }
            let (has_fpga, has_dsp) = (slot.fpga.is_some(), slot.dsp.is_some());
            if has_fpga {
                self.download_fpga(detector, "all")?;
            }
            if has_dsp {
                dsp_pending.push((detector, addr.board));
            }
        }

        for index in 0..self.registry.boards().len() {
            let detectors: Vec<i32> = dsp_pending
                .iter()
                .filter(|&&(_, board)| board == index)
                .map(|&(det, _)| det)
                .collect();
            if detectors.is_empty() {
                continue;
            }
            if self.shares_dsp(index)? {
                let board = self.registry.board_mut(index)?;
                let driver = board.board_type().clone();
                driver.download_dsp(board, ChannelSel::All)?;
                debug!(module = board.iostring(), channels = detectors.len(), "DSP broadcast");
                for det in detectors {
                    self.apply_defaults(det)?;
                }
            } else {
                for det in detectors {
                    self.download_dsp(det)?;
                }
            }
        }
        Ok(())
    }

    /// Whether every channel of board `index` is enabled and carries the same
    /// DSP program, with more than one channel to serve.
    fn shares_dsp(&self, index: usize) -> Result<bool> {
        let channels = self.registry.board(index)?.channels();
        let Some(first) = channels.first().and_then(|slot| slot.dsp.as_ref()) else {
            return Ok(false);
        };
        Ok(channels.len() > 1
            && channels.iter().all(|slot| {
                slot.enabled
                    && slot
                        .dsp
                        .as_ref()
                        .is_some_and(|dsp| dsp.source_id() == first.source_id())
            }))
    }

    /// DSP residency of `detector`.
    pub fn dsp_state(&self, detector: i32) -> Result<DownloadState> {
        let addr = self.locate(detector)?;
        Ok(self.registry.board(addr.board)?.channel(addr.channel)?.dsp_downloaded)
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Read symbol `name` of `detector`.
    pub fn read_symbol(&self, detector: i32, name: &str) -> Result<f64> {
        let addr = self.locate(detector)?;
        let board = self.registry.board(addr.board)?;
        board.board_type().read_symbol(board, addr.channel, name)
    }

    /// Write symbol `name` of `detector`.
    pub fn modify_symbol(
        &mut self,
        detector: i32,
        name: &str,
        value: f64,
    ) -> Result<Option<SymbolWarning>> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let driver = board.board_type().clone();
        driver.modify_symbol(board, addr.channel, name, value)
    }

    /// Snapshot the whole parameter block of `detector`.
    pub fn read_all(&mut self, detector: i32) -> Result<Vec<u16>> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let driver = board.board_type().clone();
        driver.read_all(board, addr.channel)
    }

    /// Restore the whole parameter block of `detector`.
    pub fn write_all(&mut self, detector: i32, params: &[u16]) -> Result<()> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let driver = board.board_type().clone();
        driver.write_all(board, addr.channel, params)
    }

    // =========================================================================
    // Run control
    // =========================================================================

    /// Start a run on every board. Fails with [`DxpError::RunActive`] if any
    /// board is already running; boards started before a failure are stopped.
    pub fn start_run(&mut self, gate: bool, resume: bool) -> Result<()> {
        for board in self.registry.boards() {
            if !run::is_running(board)?.is_empty() {
                return Err(DxpError::RunActive {
                    module: board.iostring().to_string(),
                });
            }
        }
        let boards = self.registry.boards_mut();
        for i in 0..boards.len() {
            if let Err(e) = run::start_run(&mut boards[i], gate, resume) {
                for started in boards[..i].iter_mut() {
                    if let Err(stop_err) = run::stop_run(started) {
                        warn!(
                            module = started.iostring(),
                            error = %stop_err,
                            "Rollback stop failed"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Resume every board with its recorded gate mode.
    pub fn resume_run(&mut self) -> Result<()> {
        for board in self.registry.boards_mut() {
            run::resume_run(board)?;
        }
        Ok(())
    }

    /// Stop every acquiring board.
    pub fn stop_run(&mut self) -> Result<()> {
        for board in self.registry.boards_mut() {
            run::stop_run(board)?;
        }
        Ok(())
    }

    /// Run status of the board holding `detector`.
    pub fn is_running(&self, detector: i32) -> Result<RunStatus> {
        let addr = self.locate(detector)?;
        run::is_running(self.registry.board(addr.board)?)
    }

    /// Enable the attention request of `detector`.
    pub fn enable_lam(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        run::enable_lam(self.registry.board_mut(addr.board)?, addr.channel)
    }

    /// Disable the attention request of `detector`.
    pub fn disable_lam(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        run::disable_lam(self.registry.board_mut(addr.board)?, addr.channel)
    }

    /// Clear a pending attention request of `detector`.
    pub fn clear_lam(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        run::clear_lam(self.registry.board_mut(addr.board)?, addr.channel)
    }

    // =========================================================================
    // Control tasks
    // =========================================================================

    /// Start control task `task` on `detector`.
    pub fn start_control_task(
        &mut self,
        detector: i32,
        task: TaskType,
        info: &[i32],
    ) -> Result<()> {
        let addr = self.locate(detector)?;
        self.runner
            .begin(self.registry.board_mut(addr.board)?, addr.channel, task, info)
    }

    /// Buffer size and timing of `task` on `detector`.
    pub fn control_task_info(&self, detector: i32, task: TaskType) -> Result<TaskParams> {
        let addr = self.locate(detector)?;
        self.runner
            .params(self.registry.board(addr.board)?, addr.channel, task)
    }

    /// Block until the running control task reports completion.
    pub fn wait_control_task(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        self.runner
            .wait_complete(self.registry.board_mut(addr.board)?, addr.channel)
    }

    /// Copy the running control task's data. Trace and memory tasks require
    /// the hardware run to have ended.
    pub fn get_control_task_data(&self, detector: i32) -> Result<Vec<i64>> {
        let addr = self.locate(detector)?;
        let board = self.registry.board(addr.board)?;
        let needs_stop = board
            .run_state()
            .control_task
            .is_some_and(|t| t.task == TaskType::Adc || t.task.is_memory());
        if needs_stop && board.board_type().run_active(board)? {
            return Err(DxpError::RunActive {
                module: board.iostring().to_string(),
            });
        }
        self.runner.poll_data(board, addr.channel)
    }

    /// End the control task on `detector`.
    pub fn stop_control_task(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        self.runner
            .end(self.registry.board_mut(addr.board)?, addr.channel)
    }

    /// Read external memory of `detector`.
    pub fn read_memory(&mut self, detector: i32, base: u32, len: usize) -> Result<Vec<u32>> {
        let addr = self.locate(detector)?;
        self.runner
            .read_memory(self.registry.board_mut(addr.board)?, addr.channel, base, len)
    }

    /// Write external memory of `detector`.
    pub fn write_memory(&mut self, detector: i32, base: u32, data: &[u32]) -> Result<()> {
        let addr = self.locate(detector)?;
        self.runner
            .write_memory(self.registry.board_mut(addr.board)?, addr.channel, base, data)
    }

    // =========================================================================
    // Faults
    // =========================================================================

    /// Read the parameter block of `detector` and decode its run error.
    pub fn decode_error(&mut self, detector: i32) -> Result<DeviceFault> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let driver = board.board_type().clone();
        let snapshot = driver.read_all(board, addr.channel)?;
        driver.decode_error(board, addr.channel, &snapshot)
    }

    /// Clear a non-fatal DSP error on `detector`.
    pub fn clear_error(&mut self, detector: i32) -> Result<()> {
        let addr = self.locate(detector)?;
        let board = self.registry.board_mut(addr.board)?;
        let driver = board.board_type().clone();
        driver.clear_error(board, addr.channel)
    }

    /// Release every resource. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.detectors.clear();
        self.registry.teardown();
    }
}
