//! Simulated XIA DXP bus.
//!
//! [`SimulatedBus`] implements [`Bus`] for any number of modules, each keyed
//! by its iostring. A module models:
//!
//! - one or more channels ([`SimulatedBus::with_channels`]), each with 64K
//!   words of DSP memory behind the auto-incrementing TSAR/DATA ports
//! - the CSR, with run-enable edges, DSP and FiPPI resets, and the channel
//!   field that routes memory and FiPPI transfers (or broadcasts writes)
//! - DSPs that boot when their boot words land at address 0, run control
//!   tasks selected by `RUNTASKS`/`WHICHTEST`, sleep and wake
//! - external memory reached by the memory control tasks
//!
//! The DSP finds its parameters by name in the same layout the firmware
//! declares ([`fixtures::SYMBOLS`] unless overridden with
//! [`SimulatedBus::with_symbols`]).
//!
//! Waits advance a virtual clock instead of sleeping.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = Arc::new(SimulatedBus::new());
//! registry.add_interface("sim", bus.clone());
//! // ... download firmware, run control tasks ...
//! assert!(bus.transfers().iter().any(|t| t.port == DATA));
//! ```

use crate::common::{ErrorConfig, ErrorScenario, MockRng};
use crate::fixtures;
use dxp_core::{Bus, BusHandle, DxpError, IoBuffer, Result, SymbolTable};
use dxp_driver_xia::registers::{
    symbol, whichtest, Csr, RunTasks, BUSY_SLEEPING, CSR, DATA, DATA_BASE, FIPPI, PROGRAM_BASE,
    TSAR,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

const MEMORY_WORDS: usize = 1 << 16;

/// `BUSY` while the DSP is working.
pub const BUSY_WORKING: u16 = 1;
/// History buffer offset set by the simulated DSP at boot.
pub const DEFAULT_HISTORY_START: u16 = 0x0100;
/// History buffer length set by the simulated DSP at boot.
pub const DEFAULT_HISTORY_LEN: u16 = 64;

/// CSR bits the host writes and reads back unchanged.
const HOST_BITS: Csr = Csr::RUN_ENABLE
    .union(Csr::RESET_MCA)
    .union(Csr::IGNORE_GATE)
    .union(Csr::CHANNEL)
    .union(Csr::ALL_CHANNELS);

/// Direction of a logged transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Module to host
    Read,
    /// Host to module
    Write,
}

/// One bus transfer as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Module iostring
    pub module: String,
    /// Port addressed
    pub port: u32,
    /// Memory address of the first word, for data-port transfers
    pub address: Option<u16>,
    /// Words moved
    pub len: usize,
    /// Direction
    pub direction: Direction,
}

/// State of a simulated DSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DspMode {
    /// Never booted
    #[default]
    Halted,
    /// Held in reset for a program download
    Reset,
    /// Booted and accepting runs
    Running,
    /// Asleep after a `SleepDsp` control task
    Sleeping,
}

/// ADC trace the simulated DSP records for a given `TRACEWAIT`.
pub fn adc_trace(tracewait: u16, len: usize) -> Vec<u16> {
    (0..len)
        .map(|i| tracewait.wrapping_add((i as u16).wrapping_mul(4)))
        .collect()
}

#[derive(Debug, Clone, Default)]
struct Layout {
    addresses: HashMap<String, u16>,
}

impl Layout {
    fn from_lines(lines: &[&str]) -> Self {
        let addresses = lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| {
                let name = line.split_whitespace().next()?;
                Some((name.to_ascii_uppercase(), u16::try_from(i).ok()?))
            })
            .collect();
        Self { addresses }
    }

    fn from_table(table: &SymbolTable) -> Self {
        let addresses = table.iter().map(|s| (s.name.clone(), s.address)).collect();
        Self { addresses }
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.addresses
            .get(&name.to_ascii_uppercase())
            .map(|&a| usize::from(DATA_BASE.wrapping_add(a)))
    }

    fn len(&self) -> usize {
        self.addresses.len()
    }
}

/// One DSP/FiPPI pair with its private memory.
#[derive(Debug)]
struct SimChannel {
    memory: Vec<u16>,
    dsp: DspMode,
    fippi_configured: bool,
    fippi_words: Option<usize>,
    task_pending: bool,
    external: HashMap<u32, u16>,
}

impl SimChannel {
    fn new() -> Self {
        Self {
            memory: vec![0; MEMORY_WORDS],
            dsp: DspMode::Halted,
            fippi_configured: false,
            fippi_words: None,
            task_pending: false,
            external: HashMap::new(),
        }
    }

    fn param(&self, layout: &Layout, name: &str) -> u16 {
        layout.index(name).map_or(0, |i| self.memory[i])
    }

    fn set_param(&mut self, layout: &Layout, name: &str, value: u16) {
        if let Some(i) = layout.index(name) {
            self.memory[i] = value;
        }
    }

    fn history_index(&self, layout: &Layout, i: usize) -> usize {
        let start = self.param(layout, symbol::HSTSTART);
        usize::from(DATA_BASE.wrapping_add(start).wrapping_add(i as u16))
    }

    fn external_pointer(&self, layout: &Layout) -> u32 {
        let page = u32::from(self.param(layout, symbol::EXTPAGE) & 0xFF);
        let addr = u32::from(self.param(layout, symbol::EXTADDRESS) & 0x3FFF);
        (page << 14) | addr
    }

    fn set_external_pointer(&mut self, layout: &Layout, pointer: u32) {
        self.set_param(layout, symbol::EXTPAGE, ((pointer >> 14) & 0xFF) as u16);
        self.set_param(layout, symbol::EXTADDRESS, (pointer & 0x3FFF) as u16);
    }

    /// Promote a FiPPI that has received configuration words.
    fn settle_fippi(&mut self, never_done: bool) {
        if let Some(words) = self.fippi_words {
            if words > 0 && !never_done {
                self.fippi_configured = true;
                self.fippi_words = None;
            }
        }
    }
}

#[derive(Debug)]
struct SimModule {
    tsar: u16,
    csr: Csr,
    acquiring: bool,
    mca_resets: u32,
    channels: Vec<SimChannel>,
}

impl SimModule {
    fn new(channels: usize) -> Self {
        Self {
            tsar: 0,
            csr: Csr::empty(),
            acquiring: false,
            mca_resets: 0,
            channels: (0..channels).map(|_| SimChannel::new()).collect(),
        }
    }

    /// Channels the CSR currently addresses. Empty if the channel field
    /// points past the module.
    fn routed(&self) -> Vec<usize> {
        if self.csr.contains(Csr::ALL_CHANNELS) {
            return (0..self.channels.len()).collect();
        }
        let ch = self.csr.selected_channel();
        if ch < self.channels.len() {
            vec![ch]
        } else {
            Vec::new()
        }
    }

    fn task_pending(&self) -> bool {
        self.channels.iter().any(|c| c.task_pending)
    }
}

#[derive(Debug, Default)]
struct SimState {
    modules: HashMap<String, SimModule>,
    handles: HashMap<u32, String>,
    next_handle: u32,
    log: Vec<Transfer>,
}

/// Simulated bus hosting any number of DXP modules.
#[derive(Debug)]
pub struct SimulatedBus {
    name: String,
    layout: Layout,
    history: (u16, u16),
    hold_tasks: bool,
    channels: usize,
    errors: ErrorConfig,
    rng: MockRng,
    max_block: Mutex<i64>,
    clock: Mutex<Duration>,
    state: Mutex<SimState>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Bus with the fixture parameter layout, no faults and no transfer limit.
    pub fn new() -> Self {
        Self {
            name: "sim".to_string(),
            layout: Layout::from_lines(fixtures::SYMBOLS),
            history: (DEFAULT_HISTORY_START, DEFAULT_HISTORY_LEN),
            hold_tasks: false,
            channels: 1,
            errors: ErrorConfig::none(),
            rng: MockRng::new(Some(0)),
            max_block: Mutex::new(0),
            clock: Mutex::new(Duration::ZERO),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Resolve DSP parameters against `table` instead of the fixture layout.
    pub fn with_symbols(mut self, table: &SymbolTable) -> Self {
        self.layout = Layout::from_table(table);
        self
    }

    /// Inject faults.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// History buffer offset and length the DSP reports after boot.
    pub fn with_history(mut self, start: u16, len: u16) -> Self {
        self.history = (start, len);
        self
    }

    /// Seed the baseline noise generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = MockRng::new(Some(seed));
        self
    }

    /// Give every module `channels` DSP/FiPPI pairs, addressed through the
    /// CSR channel field.
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Keep control-task runs active (BUSY != 0, run active) until
    /// [`complete_run`](Self::complete_run) is called.
    pub fn hold_control_tasks(mut self) -> Self {
        self.hold_tasks = true;
        self
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every transfer since creation or the last [`clear_transfers`](Self::clear_transfers).
    pub fn transfers(&self) -> Vec<Transfer> {
        self.state.lock().log.clone()
    }

    /// Forget logged transfers.
    pub fn clear_transfers(&self) {
        self.state.lock().log.clear();
    }

    /// Virtual time spent in [`Bus::wait`].
    pub fn elapsed(&self) -> Duration {
        *self.clock.lock()
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Words of channel 0 DSP memory starting at `address`.
    pub fn peek(&self, iostring: &str, address: u16, len: usize) -> Result<Vec<u16>> {
        self.with_channel(iostring, 0, |c| {
            (0..len)
                .map(|i| c.memory[usize::from(address.wrapping_add(i as u16))])
                .collect()
        })
    }

    /// Overwrite channel 0 DSP memory starting at `address`.
    pub fn poke(&self, iostring: &str, address: u16, words: &[u16]) -> Result<()> {
        self.with_channel(iostring, 0, |c| {
            for (i, &w) in words.iter().enumerate() {
                c.memory[usize::from(address.wrapping_add(i as u16))] = w;
            }
        })
    }

    /// Current value of DSP parameter `name` on channel 0.
    pub fn param(&self, iostring: &str, name: &str) -> Result<u16> {
        self.param_on(iostring, 0, name)
    }

    /// Current value of DSP parameter `name` on `channel`.
    pub fn param_on(&self, iostring: &str, channel: usize, name: &str) -> Result<u16> {
        let index = self.param_index(name)?;
        self.with_channel(iostring, channel, |c| c.memory[index])
    }

    /// Set DSP parameter `name` on channel 0 as the DSP itself would.
    pub fn set_param(&self, iostring: &str, name: &str, value: u16) -> Result<()> {
        self.set_param_on(iostring, 0, name, value)
    }

    /// Set DSP parameter `name` on `channel` as the DSP itself would.
    pub fn set_param_on(
        &self,
        iostring: &str,
        channel: usize,
        name: &str,
        value: u16,
    ) -> Result<()> {
        let index = self.param_index(name)?;
        self.with_channel(iostring, channel, |c| c.memory[index] = value)
    }

    /// Words of channel 0 external memory starting at `base`.
    pub fn external(&self, iostring: &str, base: u32, len: usize) -> Result<Vec<u16>> {
        self.with_channel(iostring, 0, |c| {
            (0..len as u32)
                .map(|i| c.external.get(&(base + i)).copied().unwrap_or(0))
                .collect()
        })
    }

    /// Fill channel 0 external memory starting at `base`.
    pub fn set_external(&self, iostring: &str, base: u32, words: &[u16]) -> Result<()> {
        self.with_channel(iostring, 0, |c| {
            for (i, &w) in words.iter().enumerate() {
                c.external.insert(base + i as u32, w);
            }
        })
    }

    /// State of the channel 0 DSP.
    pub fn dsp_mode(&self, iostring: &str) -> Result<DspMode> {
        self.dsp_mode_on(iostring, 0)
    }

    /// State of the DSP on `channel`.
    pub fn dsp_mode_on(&self, iostring: &str, channel: usize) -> Result<DspMode> {
        self.with_channel(iostring, channel, |c| c.dsp)
    }

    /// Whether the channel 0 FiPPI is configured.
    pub fn fippi_configured(&self, iostring: &str) -> Result<bool> {
        self.fippi_configured_on(iostring, 0)
    }

    /// Whether the FiPPI on `channel` is configured.
    pub fn fippi_configured_on(&self, iostring: &str, channel: usize) -> Result<bool> {
        self.with_channel(iostring, channel, |c| c.fippi_configured)
    }

    /// Runs started with the MCA reset bit set.
    pub fn mca_resets(&self, iostring: &str) -> Result<u32> {
        self.with_module(iostring, |m| m.mca_resets)
    }

    /// Finish every control-task run held by
    /// [`hold_control_tasks`](Self::hold_control_tasks).
    pub fn complete_run(&self, iostring: &str) -> Result<()> {
        self.with_module(iostring, |m| {
            for (channel, c) in m.channels.iter_mut().enumerate() {
                if c.task_pending {
                    c.task_pending = false;
                    c.set_param(&self.layout, symbol::BUSY, 0);
                    debug!(module = iostring, channel, "Held control task completed");
                }
            }
        })
    }

    fn with_module<T>(&self, iostring: &str, f: impl FnOnce(&mut SimModule) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let module = state
            .modules
            .get_mut(iostring)
            .ok_or_else(|| DxpError::device_io(iostring, "no such simulated module"))?;
        Ok(f(module))
    }

    fn with_channel<T>(
        &self,
        iostring: &str,
        channel: usize,
        f: impl FnOnce(&mut SimChannel) -> T,
    ) -> Result<T> {
        self.with_module(iostring, |m| m.channels.get_mut(channel).map(f))?
            .ok_or_else(|| DxpError::device_io(iostring, format!("no simulated channel {channel}")))
    }

    fn param_index(&self, name: &str) -> Result<usize> {
        self.layout.index(name).ok_or_else(|| DxpError::UnknownSymbol {
            name: name.to_ascii_uppercase(),
        })
    }

    // =========================================================================
    // Module behaviour
    // =========================================================================

    fn read_csr(&self, m: &mut SimModule) -> Csr {
        let never_done = self.errors.has(&ErrorScenario::FpgaNeverDone);
        let routed = m.routed();
        for &ch in &routed {
            m.channels[ch].settle_fippi(never_done);
        }
        let mut csr = m.csr;
        if routed.is_empty() || routed.iter().any(|&ch| !m.channels[ch].fippi_configured) {
            csr |= Csr::FIPPI_ERROR;
        }
        if m.acquiring || m.task_pending() {
            csr |= Csr::RUN_ACTIVE;
        }
        csr
    }

    fn write_csr(&self, module: &str, m: &mut SimModule, value: Csr) {
        if value.contains(Csr::DSP_RESET) {
            m.csr = value & HOST_BITS;
            m.acquiring = false;
            let routed = m.routed();
            for &ch in &routed {
                let c = &mut m.channels[ch];
                c.dsp = DspMode::Reset;
                c.task_pending = false;
                c.set_param(&self.layout, symbol::BUSY, BUSY_WORKING);
            }
            debug!(module, channels = ?routed, "DSP held in reset");
            return;
        }
        if value.contains(Csr::FIPPI_RESET) {
            m.csr = value & HOST_BITS;
            let routed = m.routed();
            for &ch in &routed {
                let c = &mut m.channels[ch];
                c.fippi_configured = false;
                c.fippi_words = Some(0);
            }
            debug!(module, channels = ?routed, "FiPPI reset");
            return;
        }

        let was_enabled = m.csr.contains(Csr::RUN_ENABLE);
        let enabled = value.contains(Csr::RUN_ENABLE);
        m.csr = value & HOST_BITS;
        if enabled && !was_enabled {
            self.start_run(module, m, value);
        } else if !enabled && was_enabled {
            m.acquiring = false;
        }
    }

    /// Rising run-enable edge. Sleeping DSPs only wake; otherwise channels
    /// armed for a control task run it and the rest stay idle, and with no
    /// task armed every running DSP acquires.
    fn start_run(&self, module: &str, m: &mut SimModule, csr: Csr) {
        let layout = &self.layout;
        let mut woke = false;
        for (channel, c) in m.channels.iter_mut().enumerate() {
            if c.dsp == DspMode::Sleeping {
                c.dsp = DspMode::Running;
                c.set_param(layout, symbol::BUSY, 0);
                woke = true;
                debug!(module, channel, "DSP woken");
            }
        }
        if woke {
            return;
        }

        let armed: Vec<(usize, u16)> = m
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.dsp == DspMode::Running)
            .filter(|(_, c)| {
                RunTasks::from_bits_retain(c.param(layout, symbol::RUNTASKS))
                    .contains(RunTasks::CONTROL_TASK)
            })
            .map(|(i, c)| (i, c.param(layout, symbol::WHICHTEST)))
            .collect();
        if !armed.is_empty() {
            for (channel, test) in armed {
                self.run_task(module, channel, &mut m.channels[channel], test);
            }
            return;
        }

        if !m.channels.iter().any(|c| c.dsp == DspMode::Running) {
            debug!(module, "Run request ignored, no DSP running");
            return;
        }
        m.acquiring = true;
        if csr.contains(Csr::RESET_MCA) {
            m.mca_resets += 1;
        }
        debug!(module, gate_ignored = csr.contains(Csr::IGNORE_GATE), "Acquisition started");
    }

    fn run_task(&self, module: &str, channel: usize, c: &mut SimChannel, test: u16) {
        let layout = &self.layout;
        match test {
            whichtest::SLEEP_DSP => {
                c.dsp = DspMode::Sleeping;
                c.set_param(layout, symbol::BUSY, BUSY_SLEEPING);
                debug!(module, channel, "DSP asleep");
                return;
            }
            whichtest::ACQUIRE_ADC => {
                let len = usize::from(c.param(layout, symbol::HSTLEN));
                let trace = adc_trace(c.param(layout, symbol::TRACEWAIT), len);
                for (i, w) in trace.into_iter().enumerate() {
                    let index = c.history_index(layout, i);
                    c.memory[index] = w;
                }
            }
            whichtest::READ_MEMORY => {
                let len = c.param(layout, symbol::EXTLENGTH);
                let pointer = c.external_pointer(layout);
                for i in 0..usize::from(len) {
                    let word = c.external.get(&(pointer + i as u32)).copied().unwrap_or(0);
                    let index = c.history_index(layout, i);
                    c.memory[index] = word;
                }
                c.set_external_pointer(layout, pointer + u32::from(len));
            }
            whichtest::WRITE_MEMORY => {
                let len = c.param(layout, symbol::EXTLENGTH);
                let pointer = c.external_pointer(layout);
                for i in 0..usize::from(len) {
                    let word = c.memory[c.history_index(layout, i)];
                    c.external.insert(pointer + i as u32, word);
                }
                c.set_external_pointer(layout, pointer + u32::from(len));
            }
            _ => {}
        }
        debug!(module, channel, whichtest = test, held = self.hold_tasks, "Control task executed");
        if self.hold_tasks {
            c.task_pending = true;
            c.set_param(layout, symbol::BUSY, BUSY_WORKING);
        } else {
            c.set_param(layout, symbol::BUSY, 0);
        }
    }

    fn boot(&self, module: &str, channel: usize, c: &mut SimChannel) {
        let layout = &self.layout;
        let base = usize::from(DATA_BASE);
        c.memory[base..base + layout.len()].fill(0);

        let (start, len) = self.history;
        c.set_param(layout, symbol::HSTSTART, start);
        c.set_param(layout, symbol::HSTLEN, len);
        c.set_param(layout, symbol::CIRCULAR, start);
        for i in 0..usize::from(len) {
            let index = c.history_index(layout, i);
            c.memory[index] = self.rng.gen_range(0..32);
        }
        if let Some((code, info)) = self.errors.run_error() {
            c.set_param(layout, symbol::RUNERROR, code);
            c.set_param(layout, symbol::ERRINFO, info);
        }
        let ready = !self.errors.has(&ErrorScenario::DspNeverReady)
            && !self.errors.has(&ErrorScenario::ChannelNeverReady { channel });
        c.set_param(layout, symbol::BUSY, if ready { 0 } else { BUSY_WORKING });
        c.dsp = DspMode::Running;
        debug!(module, channel, ready, "DSP booted");
    }

    fn transfer(
        &self,
        module: &str,
        m: &mut SimModule,
        port: u32,
        buffer: IoBuffer<'_>,
    ) -> Result<Option<u16>> {
        match (port, buffer) {
            (TSAR, IoBuffer::Write(data)) => {
                if let Some(&address) = data.last() {
                    m.tsar = address;
                }
                Ok(None)
            }
            (TSAR, IoBuffer::Read(buf)) => {
                buf.fill(m.tsar);
                Ok(None)
            }
            (CSR, IoBuffer::Write(data)) => {
                for &word in data {
                    self.write_csr(module, m, Csr::from_bits_retain(word));
                }
                Ok(None)
            }
            (CSR, IoBuffer::Read(buf)) => {
                let csr = self.read_csr(m);
                buf.fill(csr.bits());
                Ok(None)
            }
            (DATA, IoBuffer::Write(data)) => {
                let routed = self.routed_channels(module, m)?;
                let start = m.tsar;
                for ch in routed {
                    let c = &mut m.channels[ch];
                    let boot = c.dsp == DspMode::Reset && start == PROGRAM_BASE;
                    let mut address = start;
                    for &word in data {
                        c.memory[usize::from(address)] = word;
                        address = address.wrapping_add(1);
                    }
                    if boot {
                        self.boot(module, ch, c);
                    }
                }
                m.tsar = start.wrapping_add(data.len() as u16);
                Ok(Some(start))
            }
            (DATA, IoBuffer::Read(buf)) => {
                if m.csr.contains(Csr::ALL_CHANNELS) {
                    return Err(DxpError::device_io(module, "cannot read while broadcasting"));
                }
                let ch = self.routed_channels(module, m)?[0];
                let start = m.tsar;
                for word in buf.iter_mut() {
                    *word = m.channels[ch].memory[usize::from(m.tsar)];
                    m.tsar = m.tsar.wrapping_add(1);
                }
                Ok(Some(start))
            }
            (FIPPI, IoBuffer::Write(data)) => {
                for ch in self.routed_channels(module, m)? {
                    match m.channels[ch].fippi_words.as_mut() {
                        Some(count) => *count += data.len(),
                        None => debug!(
                            module,
                            channel = ch,
                            words = data.len(),
                            "FiPPI data outside configuration ignored"
                        ),
                    }
                }
                Ok(None)
            }
            (port, _) => Err(DxpError::device_io(
                module,
                format!("port {port} does not support this transfer"),
            )),
        }
    }

    fn routed_channels(&self, module: &str, m: &SimModule) -> Result<Vec<usize>> {
        let routed = m.routed();
        if routed.is_empty() {
            return Err(DxpError::device_io(
                module,
                format!("channel {} is not fitted", m.csr.selected_channel()),
            ));
        }
        Ok(routed)
    }
}

impl Bus for SimulatedBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, iostring: &str) -> Result<BusHandle> {
        let mut state = self.state.lock();
        state
            .modules
            .entry(iostring.to_string())
            .or_insert_with(|| SimModule::new(self.channels));
        state.next_handle += 1;
        let handle = state.next_handle;
        state.handles.insert(handle, iostring.to_string());
        debug!(iostring, handle, "Opened simulated module");
        Ok(BusHandle(handle))
    }

    fn io(&self, handle: BusHandle, address: u32, buffer: IoBuffer<'_>) -> Result<()> {
        let mut state = self.state.lock();
        let module = state
            .handles
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| {
                DxpError::device_io(format!("handle {}", handle.0), "handle is not open")
            })?;

        let direction = match buffer {
            IoBuffer::Read(_) => Direction::Read,
            IoBuffer::Write(_) => Direction::Write,
        };
        let operation = match direction {
            Direction::Read => "read",
            Direction::Write => "write",
        };
        self.errors.check_operation(&module, operation)?;

        let len = buffer.len();
        let limit = *self.max_block.lock();
        if limit > 0 && len as i64 > limit {
            return Err(DxpError::device_io(
                &module,
                format!("transfer of {len} words exceeds the {limit}-word block limit"),
            ));
        }

        let sim = state
            .modules
            .get_mut(&module)
            .ok_or_else(|| DxpError::device_io(&module, "no such simulated module"))?;
        let start = self.transfer(&module, sim, address, buffer)?;
        trace!(module = %module, port = address, len, ?direction, "Simulated transfer");
        state.log.push(Transfer {
            module,
            port: address,
            address: start,
            len,
            direction,
        });
        Ok(())
    }

    fn close(&self, handle: BusHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| {
                DxpError::device_io(format!("handle {}", handle.0), "handle is not open")
            })
    }

    fn max_block(&self) -> i64 {
        *self.max_block.lock()
    }

    fn set_max_block(&self, words: i64) {
        *self.max_block.lock() = words;
    }

    fn wait(&self, duration: Duration) {
        *self.clock.lock() += duration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(bus: &SimulatedBus) -> BusHandle {
        bus.open("m0").unwrap()
    }

    fn write(bus: &SimulatedBus, h: BusHandle, port: u32, data: &[u16]) {
        bus.io(h, port, IoBuffer::Write(data)).unwrap();
    }

    fn read_csr(bus: &SimulatedBus, h: BusHandle) -> Csr {
        let mut word = [0u16];
        bus.io(h, CSR, IoBuffer::Read(&mut word)).unwrap();
        Csr::from_bits_retain(word[0])
    }

    fn boot(bus: &SimulatedBus, h: BusHandle) {
        write(bus, h, CSR, &[Csr::DSP_RESET.bits()]);
        write(bus, h, TSAR, &[PROGRAM_BASE]);
        write(bus, h, DATA, &[0x1234, 0x56]);
    }

    #[test]
    fn test_data_port_auto_increments() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        write(&bus, h, TSAR, &[0x4100]);
        write(&bus, h, DATA, &[1, 2, 3]);
        assert_eq!(bus.peek("m0", 0x4100, 3).unwrap(), vec![1, 2, 3]);

        write(&bus, h, TSAR, &[0x4101]);
        let mut buf = [0u16; 2];
        bus.io(h, DATA, IoBuffer::Read(&mut buf)).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn test_boot_initialises_parameters() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        assert_eq!(bus.dsp_mode("m0").unwrap(), DspMode::Halted);
        boot(&bus, h);
        assert_eq!(bus.dsp_mode("m0").unwrap(), DspMode::Running);
        assert_eq!(bus.param("m0", "BUSY").unwrap(), 0);
        assert_eq!(bus.param("m0", "HSTSTART").unwrap(), DEFAULT_HISTORY_START);
        assert_eq!(bus.param("m0", "HSTLEN").unwrap(), DEFAULT_HISTORY_LEN);
    }

    #[test]
    fn test_fippi_error_clears_after_configuration() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        assert!(read_csr(&bus, h).contains(Csr::FIPPI_ERROR));
        write(&bus, h, CSR, &[Csr::FIPPI_RESET.bits()]);
        assert!(read_csr(&bus, h).contains(Csr::FIPPI_ERROR));
        write(&bus, h, FIPPI, &[0xABCD; 4]);
        assert!(!read_csr(&bus, h).contains(Csr::FIPPI_ERROR));
        assert!(bus.fippi_configured("m0").unwrap());
    }

    #[test]
    fn test_run_enable_edge_starts_acquisition() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        boot(&bus, h);
        write(&bus, h, CSR, &[(Csr::RUN_ENABLE | Csr::RESET_MCA).bits()]);
        assert!(read_csr(&bus, h).contains(Csr::RUN_ACTIVE));
        assert_eq!(bus.mca_resets("m0").unwrap(), 1);
        write(&bus, h, CSR, &[0]);
        assert!(!read_csr(&bus, h).contains(Csr::RUN_ACTIVE));
    }

    #[test]
    fn test_block_limit_enforced() {
        let bus = SimulatedBus::new();
        bus.set_max_block(4);
        let h = open(&bus);
        let err = bus.io(h, DATA, IoBuffer::Write(&[0; 5])).unwrap_err();
        assert!(matches!(err, DxpError::DeviceIo { .. }));
        assert!(bus.io(h, DATA, IoBuffer::Write(&[0; 4])).is_ok());
    }

    #[test]
    fn test_wait_advances_virtual_clock() {
        let bus = SimulatedBus::new();
        bus.wait(Duration::from_millis(500));
        bus.wait(Duration::from_millis(250));
        assert_eq!(bus.elapsed(), Duration::from_millis(750));
    }

    #[test]
    fn test_closed_handle_rejected() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        assert_eq!(bus.open_handles(), 1);
        bus.close(h).unwrap();
        assert_eq!(bus.open_handles(), 0);
        assert!(bus.io(h, CSR, IoBuffer::Write(&[0])).is_err());
        assert!(bus.close(h).is_err());
    }

    #[test]
    fn test_transfer_log_records_data_address() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        write(&bus, h, TSAR, &[0x0042]);
        write(&bus, h, DATA, &[9, 9]);
        let log = bus.transfers();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].port, DATA);
        assert_eq!(log[1].address, Some(0x0042));
        assert_eq!(log[1].len, 2);
        assert_eq!(log[1].direction, Direction::Write);
    }

    fn select(channel: usize) -> Csr {
        Csr::select(channel).unwrap()
    }

    #[test]
    fn test_broadcast_write_boots_every_channel() {
        let bus = SimulatedBus::new().with_channels(4);
        let h = open(&bus);
        write(&bus, h, CSR, &[(Csr::ALL_CHANNELS | Csr::DSP_RESET).bits()]);
        for ch in 0..4 {
            assert_eq!(bus.dsp_mode_on("m0", ch).unwrap(), DspMode::Reset);
        }
        write(&bus, h, TSAR, &[PROGRAM_BASE]);
        write(&bus, h, DATA, &[0x1234, 0x56]);
        for ch in 0..4 {
            assert_eq!(bus.dsp_mode_on("m0", ch).unwrap(), DspMode::Running);
            assert_eq!(bus.param_on("m0", ch, "HSTLEN").unwrap(), DEFAULT_HISTORY_LEN);
        }

        let mut buf = [0u16; 1];
        write(&bus, h, TSAR, &[0x4000]);
        let err = bus.io(h, DATA, IoBuffer::Read(&mut buf)).unwrap_err();
        assert!(matches!(err, DxpError::DeviceIo { .. }));
    }

    #[test]
    fn test_channel_field_routes_memory() {
        let bus = SimulatedBus::new().with_channels(4);
        let h = open(&bus);
        write(&bus, h, CSR, &[select(2).bits()]);
        write(&bus, h, TSAR, &[0x4100]);
        write(&bus, h, DATA, &[42]);
        assert_eq!(read_csr(&bus, h).selected_channel(), 2);

        write(&bus, h, CSR, &[select(1).bits()]);
        write(&bus, h, TSAR, &[0x4100]);
        let mut buf = [0u16; 1];
        bus.io(h, DATA, IoBuffer::Read(&mut buf)).unwrap();
        assert_eq!(buf, [0]);

        write(&bus, h, CSR, &[select(2).bits()]);
        write(&bus, h, TSAR, &[0x4100]);
        bus.io(h, DATA, IoBuffer::Read(&mut buf)).unwrap();
        assert_eq!(buf, [42]);
    }

    #[test]
    fn test_unfitted_channel_rejected() {
        let bus = SimulatedBus::new().with_channels(2);
        let h = open(&bus);
        write(&bus, h, CSR, &[select(3).bits()]);
        let err = bus.io(h, DATA, IoBuffer::Write(&[1])).unwrap_err();
        assert!(matches!(err, DxpError::DeviceIo { .. }));
        assert!(read_csr(&bus, h).contains(Csr::FIPPI_ERROR));
        assert!(bus.param_on("m0", 3, "BUSY").is_err());
    }

    #[test]
    fn test_sleeping_dsp_wakes_on_rising_edge_only() {
        let bus = SimulatedBus::new();
        let h = open(&bus);
        boot(&bus, h);
        bus.set_param("m0", "RUNTASKS", RunTasks::CONTROL_TASK.bits()).unwrap();
        bus.set_param("m0", "WHICHTEST", whichtest::SLEEP_DSP).unwrap();
        write(&bus, h, CSR, &[Csr::RUN_ENABLE.bits()]);
        assert_eq!(bus.dsp_mode("m0").unwrap(), DspMode::Sleeping);
        assert_eq!(bus.param("m0", "BUSY").unwrap(), BUSY_SLEEPING);

        write(&bus, h, CSR, &[(Csr::RUN_ENABLE | Csr::IGNORE_GATE).bits()]);
        assert_eq!(bus.dsp_mode("m0").unwrap(), DspMode::Sleeping);

        write(&bus, h, CSR, &[0]);
        write(&bus, h, CSR, &[Csr::RUN_ENABLE.bits()]);
        assert_eq!(bus.dsp_mode("m0").unwrap(), DspMode::Running);
        assert_eq!(bus.param("m0", "BUSY").unwrap(), 0);
        assert!(!read_csr(&bus, h).contains(Csr::RUN_ACTIVE));
    }
}
