//! [`DriverContract`] implementation for the XIA DXP families.
//!
//! Every memory access goes through the TSAR/DATA port pair (see
//! [`registers`](crate::registers)), run control through the CSR, and control
//! tasks through the `RUNTASKS`/`WHICHTEST` DSP parameters followed by a run.
//!
//! Multi-channel families first point the CSR channel field at the target
//! channel. DSP downloads to a whole module are broadcast once and then
//! confirmed channel by channel.

use crate::family::{Dxp4c2x, Family, X10p};
use crate::parse;
use crate::registers::{
    symbol, whichtest, Csr, RunTasks, BOOT_WORDS, BUSY_SLEEPING, CSR, DATA, DATA_BASE, FIPPI,
    FIPPI_SLOW_WORDS, PROGRAM_BASE, TSAR,
};
use dxp_core::{
    combine_words, parse_defaults, split_words, wait_for_busy, Board, BoardIo, ChannelSel,
    DeviceFault, DownloadEngine, DownloadState, DriverContract, DxpError, FirmwareImage,
    FirmwareInfo, FirmwareKind, PollPolicy, Result, SharedFirmware, SymbolLookup, SymbolWarning,
    TaskParams, TaskType, TimingConfig,
};
use std::io::BufRead;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Driver for one XIA hardware family.
#[derive(Debug, Clone, Default)]
pub struct XiaDriver<F: Family> {
    timing: TimingConfig,
    family: PhantomData<F>,
}

/// DXP-X10P driver.
pub type X10pDriver = XiaDriver<X10p>;

/// DXP-4C2X driver.
pub type Dxp4c2xDriver = XiaDriver<Dxp4c2x>;

/// Channels reached by a memory or FiPPI transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Channel(usize),
    Broadcast,
}

impl From<ChannelSel> for Route {
    fn from(sel: ChannelSel) -> Self {
        match sel {
            ChannelSel::All => Route::Broadcast,
            ChannelSel::One(ch) => Route::Channel(ch),
        }
    }
}

impl<F: Family> XiaDriver<F> {
    /// Driver using `timing` for settle times and poll budgets.
    pub fn new(timing: TimingConfig) -> Self {
        Self {
            timing,
            family: PhantomData,
        }
    }

    /// Timing in effect.
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Point the CSR channel field at `route`. The CSR is only written when
    /// the selection changes; single-channel families never touch it.
    fn route(&self, io: &BoardIo, route: Route) -> Result<()> {
        if !F::routed() {
            return Ok(());
        }
        let field = match route {
            Route::Channel(ch) => Csr::select(ch).filter(|_| ch < F::CHANNELS).ok_or_else(|| {
                DxpError::bad_parameter(format!("{} has no channel {ch}", F::MODEL))
            })?,
            Route::Broadcast => Csr::ALL_CHANNELS,
        };
        let csr = read_csr(io)?;
        let routed = (csr - (Csr::CHANNEL | Csr::ALL_CHANNELS)) | field;
        if routed != csr {
            write_csr(io, routed)?;
        }
        Ok(())
    }

    fn read_param(&self, board: &Board, channel: usize, name: &str) -> Result<u16> {
        // Single-word parameters only; the value always fits.
        Ok(self.read_symbol(board, channel, name)? as u16)
    }

    fn write_param(&self, board: &mut Board, channel: usize, name: &str, value: u16) -> Result<()> {
        self.modify_symbol(board, channel, name, f64::from(value)).map(|_| ())
    }

    fn read_history(&self, board: &Board, channel: usize) -> Result<Vec<u16>> {
        let start = self.read_param(board, channel, symbol::HSTSTART)?;
        let len = usize::from(self.read_param(board, channel, symbol::HSTLEN)?);
        let mut buf = vec![0u16; len];
        self.route(board.io(), Route::Channel(channel))?;
        read_block(board.io(), DATA_BASE.wrapping_add(start), &mut buf)?;
        Ok(buf)
    }

    fn write_history(&self, board: &Board, channel: usize, words: &[u16]) -> Result<()> {
        let start = self.read_param(board, channel, symbol::HSTSTART)?;
        self.route(board.io(), Route::Channel(channel))?;
        write_block(board.io(), DATA_BASE.wrapping_add(start), words)
    }

    /// Sleep the DSP if loaded, reconfigure the FiPPI of `channel`, and wake
    /// the DSP again.
    fn download_fippi(
        &self,
        board: &mut Board,
        channel: usize,
        fippi: &SharedFirmware,
    ) -> Result<()> {
        // A running DSP must sleep while the FiPPI is reconfigured.
        let sleep = board.channel(channel)?.dsp_downloaded == DownloadState::Loaded;
        if sleep {
            self.begin_control_task(board, channel, TaskType::SleepDsp, &[1])?;
            let policy = self.timing.sleep_policy();
            wait_for_busy(board, channel, f64::from(BUSY_SLEEPING), &policy)?;
            debug!(module = board.iostring(), channel, "DSP asleep for FiPPI download");
        }

        let io = board.io();
        self.route(io, Route::Channel(channel))?;
        let csr = read_csr(io)? | Csr::FIPPI_RESET;
        write_csr(io, csr)?;
        io.wait(self.timing.fpga_settle);

        let payload = fippi.payload();
        let slow = payload.len().min(FIPPI_SLOW_WORDS);
        for word in &payload[..slow] {
            io.write(FIPPI, std::slice::from_ref(word))?;
        }
        let engine = DownloadEngine::new(io);
        let transfers = engine.write_chunked(&payload[slow..], |_, chunk| io.write(FIPPI, chunk))?;

        let policy = self.timing.fpga_done_policy();
        engine
            .poll(&policy, "FiPPI done", || Ok(!read_csr(io)?.contains(Csr::FIPPI_ERROR)))
            .map_err(|e| match e {
                DxpError::Timeout { attempts, .. } => DxpError::FirmwareTimeout {
                    module: io.module().to_string(),
                    attempts,
                },
                other => other,
            })?;

        if sleep {
            self.end_control_task(board, channel, TaskType::SleepDsp)?;
        }
        info!(
            module = board.iostring(),
            channel,
            source_id = fippi.source_id(),
            words = payload.len(),
            transfers,
            "FiPPI downloaded"
        );
        Ok(())
    }
}

// =============================================================================
// Bus primitives
// =============================================================================

fn read_csr(io: &BoardIo) -> Result<Csr> {
    let mut word = [0u16; 1];
    io.read(CSR, &mut word)?;
    Ok(Csr::from_bits_retain(word[0]))
}

fn write_csr(io: &BoardIo, csr: Csr) -> Result<()> {
    debug!(module = io.module(), csr = csr.bits(), "CSR write");
    io.write(CSR, &[csr.bits()])
}

/// Point the TSAR at `address` and write `words` through the data port.
fn write_block(io: &BoardIo, address: u16, words: &[u16]) -> Result<()> {
    if words.is_empty() {
        return Ok(());
    }
    io.write(TSAR, &[address])?;
    DownloadEngine::new(io).write_chunked(words, |_, chunk| io.write(DATA, chunk))?;
    Ok(())
}

/// Point the TSAR at `address` and fill `buf` from the data port.
fn read_block(io: &BoardIo, address: u16, buf: &mut [u16]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    io.write(TSAR, &[address])?;
    DownloadEngine::new(io).read_chunked(buf, |_, chunk| io.read(DATA, chunk))?;
    Ok(())
}

fn param_address(offset: u16) -> u16 {
    DATA_BASE.wrapping_add(offset)
}

fn program_address(offset: usize) -> Result<u16> {
    u16::try_from(offset + 1)
        .map(|a| PROGRAM_BASE.wrapping_add(a))
        .map_err(|_| {
            DxpError::bad_parameter(format!("program offset {offset} exceeds the address space"))
        })
}

fn check_fpga_name(model: &str, name: &str) -> Result<()> {
    if name.eq_ignore_ascii_case("all") || name.eq_ignore_ascii_case("fippi") {
        Ok(())
    } else {
        Err(DxpError::bad_parameter(format!("the {model} has no FPGA called '{name}'")))
    }
}

/// Words to write for `value`, with a warning when a bounded symbol clamped
/// it. `None` when the value cannot be represented: not finite, or outside
/// the word range of an unbounded or multi-word symbol.
fn encode_value(
    lookup: &SymbolLookup<'_>,
    value: f64,
) -> Option<(Vec<(u16, u16)>, Option<SymbolWarning>)> {
    if !value.is_finite() {
        return None;
    }
    match lookup {
        SymbolLookup::Single(sym) if sym.is_bounded() => {
            let (lower, upper) = (f64::from(sym.lower_bound), f64::from(sym.upper_bound));
            let (written, clamped) = if value < lower {
                (sym.lower_bound, true)
            } else if value > upper {
                (sym.upper_bound, true)
            } else {
                (value as u16, false)
            };
            let warning = clamped.then(|| SymbolWarning::BoundsClamped {
                name: sym.name.clone(),
                requested: value,
                written,
            });
            Some((vec![(sym.address, written)], warning))
        }
        SymbolLookup::Single(sym) => {
            (0.0..65536.0).contains(&value).then(|| (vec![(sym.address, value as u16)], None))
        }
        SymbolLookup::Words(syms) => {
            let max = 65536f64.powi(i32::try_from(syms.len()).ok()?);
            if !(0.0..max).contains(&value) {
                return None;
            }
            let words = split_words(value as u64, syms.len());
            Some((syms.iter().map(|s| s.address).zip(words).collect(), None))
        }
    }
}

fn info_word(task: TaskType, value: i32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| DxpError::bad_parameter(format!("{task} info word {value} is out of range")))
}

/// DSP image of `channel`, required to be non-empty.
fn loaded_dsp(board: &Board, channel: usize) -> Result<SharedFirmware> {
    match &board.channel(channel)?.dsp {
        Some(image) if !image.is_empty() => Ok(image.clone()),
        _ => Err(DxpError::DspNotLoaded {
            module: board.iostring().to_string(),
            channel,
        }),
    }
}

fn whichtest_for(task: TaskType) -> Option<u16> {
    let test = match task {
        TaskType::SetAscDac => whichtest::SET_ASCDAC,
        TaskType::Adc => whichtest::ACQUIRE_ADC,
        TaskType::TrackingDac => whichtest::TRKDAC,
        TaskType::SlopeCalibration => whichtest::SLOPE_CALIB,
        TaskType::SleepDsp => whichtest::SLEEP_DSP,
        TaskType::ProgramFippi => whichtest::PROGRAM_FIPPI,
        TaskType::Reset => whichtest::RESET,
        TaskType::SetPolarity => whichtest::SET_POLARITY,
        TaskType::CloseInputRelay => whichtest::CLOSE_INPUT_RELAY,
        TaskType::OpenInputRelay => whichtest::OPEN_INPUT_RELAY,
        TaskType::RcBaseline => whichtest::RC_BASELINE,
        TaskType::RcEvent => whichtest::RC_EVENT,
        TaskType::ReadMemory => whichtest::READ_MEMORY,
        TaskType::WriteMemory => whichtest::WRITE_MEMORY,
        TaskType::BaselineHistory => return None,
    };
    Some(test)
}

impl<F: Family> DriverContract for XiaDriver<F> {
    fn name(&self) -> &'static str {
        F::BOARD_TYPE
    }

    fn max_channels(&self) -> usize {
        F::CHANNELS
    }

    fn firmware_info(&self) -> FirmwareInfo {
        parse::firmware_info()
    }

    fn load_program(
        &self,
        kind: FirmwareKind,
        source_id: &str,
        reader: &mut dyn BufRead,
        info: &FirmwareInfo,
    ) -> Result<FirmwareImage> {
        match kind {
            FirmwareKind::Dsp => parse::parse_dsp_program(source_id, reader, info),
            FirmwareKind::Fpga => parse::parse_fpga_bitstream(source_id, reader),
            FirmwareKind::Defaults => parse_defaults(source_id, reader),
        }
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    fn download_fpga(&self, board: &mut Board, sel: ChannelSel, name: &str) -> Result<()> {
        check_fpga_name(F::MODEL, name)?;
        let targets: Vec<(usize, SharedFirmware)> = board
            .select(sel)?
            .into_iter()
            .filter_map(|ch| {
                let slot = board.channels().get(ch)?;
                if slot.enabled {
                    slot.fpga.clone().map(|image| (ch, image))
                } else {
                    None
                }
            })
            .collect();
        if targets.is_empty() {
            return Err(DxpError::bad_parameter(format!(
                "no FiPPI configuration assigned to module '{}'",
                board.iostring()
            )));
        }
        for (channel, fippi) in targets {
            self.download_fippi(board, channel, &fippi)?;
        }
        Ok(())
    }

    fn download_fpga_done(&self, board: &mut Board, sel: ChannelSel, name: &str) -> Result<bool> {
        check_fpga_name(F::MODEL, name)?;
        board.select(sel)?;
        self.route(board.io(), sel.into())?;
        Ok(!read_csr(board.io())?.contains(Csr::FIPPI_ERROR))
    }

    fn download_dsp(&self, board: &mut Board, sel: ChannelSel) -> Result<()> {
        let selected = board.select(sel)?;
        let found = selected
            .iter()
            .find_map(|&ch| board.channels().get(ch)?.dsp.clone());
        let Some(dsp) = found else {
            return Err(DxpError::bad_parameter(format!(
                "no DSP program assigned to module '{}'",
                board.iostring()
            )));
        };
        // A broadcast writes one image to every channel.
        let mixed = selected.iter().any(|&ch| {
            board.channels()[ch]
                .dsp
                .as_ref()
                .is_some_and(|other| other.source_id() != dsp.source_id())
        });
        if mixed {
            return Err(DxpError::bad_parameter(format!(
                "channels of module '{}' carry different DSP programs; download them one at a time",
                board.iostring()
            )));
        }
        let payload = dsp.payload();
        if payload.len() <= BOOT_WORDS {
            return Err(DxpError::LoadError {
                source_id: dsp.source_id().to_string(),
                message: format!(
                    "program has {} words, need more than {BOOT_WORDS}",
                    payload.len()
                ),
            });
        }

        let io = board.io();
        self.route(io, sel.into())?;
        let csr = read_csr(io)? | Csr::DSP_RESET;
        write_csr(io, csr)?;

        // Program body first, boot vector last so the DSP starts on a
        // complete image.
        let engine = DownloadEngine::new(io);
        let transfers = engine.write_chunked(&payload[BOOT_WORDS..], |offset, chunk| {
            write_block(io, program_address(offset)?, chunk)
        })?;
        write_block(io, PROGRAM_BASE, &payload[..BOOT_WORDS])?;
        io.wait(self.timing.dsp_arm_wait);

        let policy = self.timing.dsp_ready_policy();
        for &ch in &selected {
            wait_for_busy(board, ch, 0.0, &policy).map_err(|e| match e {
                DxpError::Timeout { attempts, .. } => DxpError::DownloadTimeout {
                    module: board.iostring().to_string(),
                    channel: ch,
                    attempts,
                },
                other => other,
            })?;
        }

        for &ch in &selected {
            board.channel_mut(ch)?.dsp_downloaded = DownloadState::Loaded;
        }
        info!(
            module = board.iostring(),
            channels = ?selected,
            source_id = dsp.source_id(),
            words = payload.len(),
            transfers = transfers + 1,
            "DSP downloaded"
        );
        Ok(())
    }

    fn download_dsp_done(
        &self,
        board: &mut Board,
        channel: usize,
        expected_busy: u16,
        timeout: Duration,
    ) -> Result<bool> {
        let policy = PollPolicy::divided(timeout, self.timing.sleep_divisions);
        match wait_for_busy(board, channel, f64::from(expected_busy), &policy) {
            Ok(_) => Ok(true),
            Err(DxpError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    fn read_symbol(&self, board: &Board, channel: usize, name: &str) -> Result<f64> {
        let dsp = loaded_dsp(board, channel)?;
        let table = dsp.symbols().ok_or_else(|| DxpError::UnknownSymbol {
            name: name.to_ascii_uppercase(),
        })?;
        let lookup = table.lookup(name)?;
        self.route(board.io(), Route::Channel(channel))?;
        let mut words = Vec::with_capacity(lookup.word_count());
        for sym in lookup.symbols() {
            if !sym.access.is_readable() {
                return Err(DxpError::AccessViolation {
                    name: sym.name.clone(),
                    message: "symbol is write-only".to_string(),
                });
            }
            let mut word = [0u16; 1];
            read_block(board.io(), param_address(sym.address), &mut word)?;
            words.push(word[0]);
        }
        Ok(combine_words(&words))
    }

    fn modify_symbol(
        &self,
        board: &mut Board,
        channel: usize,
        name: &str,
        value: f64,
    ) -> Result<Option<SymbolWarning>> {
        let dsp = loaded_dsp(board, channel)?;
        let table = dsp.symbols().ok_or_else(|| DxpError::UnknownSymbol {
            name: name.to_ascii_uppercase(),
        })?;
        let lookup = table.lookup(name)?;
        for sym in lookup.symbols() {
            if !sym.access.is_writable() {
                return Err(DxpError::AccessViolation {
                    name: sym.name.clone(),
                    message: "symbol is read-only".to_string(),
                });
            }
        }

        let (writes, warning) = encode_value(&lookup, value).ok_or_else(|| {
            DxpError::bad_parameter(format!(
                "value {value} does not fit symbol '{}'",
                name.to_ascii_uppercase()
            ))
        })?;

        let (io, slot) = board.io_and_channel_mut(channel)?;
        self.route(io, Route::Channel(channel))?;
        for (address, word) in writes {
            write_block(io, param_address(address), &[word])?;
            if let Some(cached) = slot.parameter_snapshot.get_mut(usize::from(address)) {
                *cached = word;
            }
        }
        if let Some(SymbolWarning::BoundsClamped { name, requested, written }) = &warning {
            warn!(symbol = %name, requested, written, "Value outside symbol bounds, clamped");
        }
        Ok(warning)
    }

    fn read_all(&self, board: &mut Board, channel: usize) -> Result<Vec<u16>> {
        let dsp = loaded_dsp(board, channel)?;
        let len = dsp.symbols().map_or(0, |t| t.len());
        let mut params = vec![0u16; len];
        let (io, slot) = board.io_and_channel_mut(channel)?;
        self.route(io, Route::Channel(channel))?;
        read_block(io, DATA_BASE, &mut params)?;
        slot.parameter_snapshot.clone_from(&params);
        Ok(params)
    }

    fn write_all(&self, board: &mut Board, channel: usize, params: &[u16]) -> Result<()> {
        let dsp = loaded_dsp(board, channel)?;
        let len = dsp.symbols().map_or(0, |t| t.len());
        if params.len() != len {
            return Err(DxpError::bad_parameter(format!(
                "parameter block has {len} words, got {}",
                params.len()
            )));
        }
        let (io, slot) = board.io_and_channel_mut(channel)?;
        self.route(io, Route::Channel(channel))?;
        write_block(io, DATA_BASE, params)?;
        slot.parameter_snapshot = params.to_vec();
        Ok(())
    }

    // =========================================================================
    // Control tasks
    // =========================================================================

    fn begin_control_task(
        &self,
        board: &mut Board,
        channel: usize,
        task: TaskType,
        info: &[i32],
    ) -> Result<()> {
        if info.len() < task.min_info_words() {
            return Err(DxpError::InsufficientParams {
                task: task.to_string(),
                required: task.min_info_words(),
                provided: info.len(),
            });
        }

        let current = self.read_param(board, channel, symbol::RUNTASKS)?;
        let mut runtasks = RunTasks::from_bits_retain(current);
        if task != TaskType::BaselineHistory {
            runtasks |= RunTasks::CONTROL_TASK;
        }
        if matches!(task, TaskType::Adc | TaskType::BaselineHistory) || task.is_memory() {
            runtasks |= RunTasks::STOP_BASELINE;
        }
        self.write_param(board, channel, symbol::RUNTASKS, runtasks.bits())?;

        if task == TaskType::Adc {
            self.write_param(board, channel, symbol::TRACEWAIT, info_word(task, info[1])?)?;
        }
        if task.is_memory() {
            let fields = [
                (symbol::EXTPAGE, info[1]),
                (symbol::EXTADDRESS, info[2]),
                (symbol::EXTLENGTH, info[3]),
            ];
            for (name, value) in fields {
                if value != -1 {
                    self.write_param(board, channel, name, info_word(task, value)?)?;
                }
            }
            if task == TaskType::WriteMemory {
                let words = info[4..]
                    .iter()
                    .map(|&v| info_word(task, v))
                    .collect::<Result<Vec<u16>>>()?;
                self.write_history(board, channel, &words)?;
            }
        }

        if let Some(test) = whichtest_for(task) {
            self.write_param(board, channel, symbol::WHICHTEST, test)?;
            self.begin_run(board, true, true)?;
        }
        debug!(
            module = board.iostring(),
            channel,
            task = %task,
            runtasks = runtasks.bits(),
            "Control task armed"
        );
        Ok(())
    }

    fn end_control_task(&self, board: &mut Board, channel: usize, task: TaskType) -> Result<()> {
        if task == TaskType::SleepDsp {
            // A fresh run-enable edge wakes the DSP.
            self.end_run(board)?;
            self.begin_run(board, true, true)?;
            wait_for_busy(board, channel, 0.0, &self.timing.sleep_policy())?;
        }
        if task != TaskType::BaselineHistory {
            self.end_run(board)?;
        }

        let current = self.read_param(board, channel, symbol::RUNTASKS)?;
        let mut runtasks = RunTasks::from_bits_retain(current);
        if task != TaskType::BaselineHistory {
            runtasks.remove(RunTasks::CONTROL_TASK);
        }
        runtasks.remove(RunTasks::STOP_BASELINE);
        self.write_param(board, channel, symbol::RUNTASKS, runtasks.bits())
    }

    fn control_task_params(
        &self,
        board: &Board,
        channel: usize,
        task: TaskType,
    ) -> Result<TaskParams> {
        let ms = Duration::from_millis;
        let params = match task {
            TaskType::Adc => TaskParams {
                buffer_len: usize::from(self.read_param(board, channel, symbol::HSTLEN)?),
                initial_wait: ms(4),
                poll_interval: ms(1),
            },
            TaskType::TrackingDac => TaskParams {
                buffer_len: 1,
                initial_wait: ms(10),
                poll_interval: ms(1),
            },
            TaskType::BaselineHistory => TaskParams {
                buffer_len: usize::from(self.read_param(board, channel, symbol::HSTLEN)?),
                initial_wait: ms(1),
                poll_interval: ms(1),
            },
            TaskType::ReadMemory | TaskType::WriteMemory => {
                let len = self.read_param(board, channel, symbol::HSTLEN)?;
                TaskParams {
                    buffer_len: usize::from(len),
                    initial_wait: Duration::from_nanos(500 * u64::from(len)),
                    poll_interval: ms(1),
                }
            }
            _ => TaskParams {
                buffer_len: 0,
                initial_wait: ms(1),
                poll_interval: ms(1),
            },
        };
        Ok(params)
    }

    fn control_task_data(&self, board: &Board, channel: usize, task: TaskType) -> Result<Vec<i64>> {
        match task {
            TaskType::Adc | TaskType::WriteMemory => Ok(self
                .read_history(board, channel)?
                .into_iter()
                .map(i64::from)
                .collect()),
            TaskType::ReadMemory => {
                let len = usize::from(self.read_param(board, channel, symbol::EXTLENGTH)?);
                Ok(self
                    .read_history(board, channel)?
                    .into_iter()
                    .take(len)
                    .map(i64::from)
                    .collect())
            }
            TaskType::BaselineHistory => {
                let history = self.read_history(board, channel)?;
                if history.is_empty() {
                    return Ok(Vec::new());
                }
                let circular = self.read_param(board, channel, symbol::CIRCULAR)?;
                let start = self.read_param(board, channel, symbol::HSTSTART)?;
                let offset = usize::from(circular.wrapping_sub(start)) % history.len();
                let mut out: Vec<i64> = Vec::with_capacity(history.len());
                out.extend(history[offset..].iter().map(|&w| i64::from(w as i16)));
                out.extend(history[..offset].iter().map(|&w| i64::from(w as i16)));
                Ok(out)
            }
            _ => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Run control
    // =========================================================================

    fn begin_run(&self, board: &mut Board, gate: bool, resume: bool) -> Result<()> {
        let io = board.io();
        let mut csr = read_csr(io)? | Csr::RUN_ENABLE;
        csr.set(Csr::RESET_MCA, !resume);
        csr.set(Csr::IGNORE_GATE, gate);
        write_csr(io, csr)
    }

    fn end_run(&self, board: &mut Board) -> Result<()> {
        let io = board.io();
        let csr = read_csr(io)? - Csr::RUN_ENABLE;
        write_csr(io, csr)
    }

    fn run_active(&self, board: &Board) -> Result<bool> {
        Ok(read_csr(board.io())?.contains(Csr::RUN_ACTIVE))
    }

    // =========================================================================
    // Faults
    // =========================================================================

    fn decode_error(&self, board: &Board, channel: usize, snapshot: &[u16]) -> Result<DeviceFault> {
        let dsp = loaded_dsp(board, channel)?;
        let table = dsp.symbols().ok_or_else(|| DxpError::UnknownSymbol {
            name: symbol::RUNERROR.to_string(),
        })?;
        let word = |name: &str| -> Result<u16> {
            let sym = table.get(name).ok_or_else(|| DxpError::UnknownSymbol {
                name: name.to_string(),
            })?;
            snapshot.get(usize::from(sym.address)).copied().ok_or_else(|| {
                DxpError::bad_parameter(format!(
                    "parameter snapshot of {} words has no {name}",
                    snapshot.len()
                ))
            })
        };
        let run_error = word(symbol::RUNERROR)?;
        let error_info = if run_error != 0 { word(symbol::ERRINFO)? } else { 0 };
        Ok(DeviceFault { run_error, error_info })
    }

    fn clear_error(&self, board: &mut Board, channel: usize) -> Result<()> {
        loaded_dsp(board, channel)?;
        self.write_param(board, channel, symbol::RUNERROR, 0)
    }

    // Neither family drives a LAM line; requests are accepted after validating the channel.

    fn enable_lam(&self, board: &mut Board, channel: usize) -> Result<()> {
        board.channel(channel).map(|_| ())
    }

    fn disable_lam(&self, board: &mut Board, channel: usize) -> Result<()> {
        board.channel(channel).map(|_| ())
    }

    fn clear_lam(&self, board: &mut Board, channel: usize) -> Result<()> {
        board.channel(channel).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fpga_names() {
        assert!(check_fpga_name(X10p::MODEL, "all").is_ok());
        assert!(check_fpga_name(X10p::MODEL, "FiPPI").is_ok());
        let err = check_fpga_name(Dxp4c2x::MODEL, "system").unwrap_err();
        assert!(matches!(err, DxpError::BadParameter { .. }));
        assert!(err.to_string().contains("DXP-4C2X"));
    }

    #[test]
    fn test_whichtest_mapping() {
        assert_eq!(whichtest_for(TaskType::Adc), Some(whichtest::ACQUIRE_ADC));
        assert_eq!(whichtest_for(TaskType::Reset), Some(whichtest::RESET));
        assert_eq!(whichtest_for(TaskType::BaselineHistory), None);
        let distinct: std::collections::HashSet<u16> =
            TaskType::ALL.iter().filter_map(|&t| whichtest_for(t)).collect();
        assert_eq!(distinct.len(), TaskType::ALL.len() - 1);
    }

    #[test]
    fn test_program_address_follows_offset() {
        assert_eq!(program_address(0).unwrap(), 1);
        assert_eq!(program_address(100).unwrap(), 101);
        assert!(program_address(usize::from(u16::MAX)).is_err());
    }

    #[test]
    fn test_info_word_range() {
        assert_eq!(info_word(TaskType::Adc, 12).unwrap(), 12);
        assert!(info_word(TaskType::Adc, -1).is_err());
        assert!(info_word(TaskType::Adc, 70_000).is_err());
    }

    #[test]
    fn test_driver_identity() {
        let driver = X10pDriver::default();
        assert_eq!(driver.name(), "dxpx10p");
        assert_eq!(driver.max_channels(), 1);
        assert_eq!(driver.firmware_info().max_symbol_name_len, 15);
        assert_eq!(driver.timing().dsp_ready_attempts, 50);

        let driver = Dxp4c2xDriver::new(TimingConfig::default());
        assert_eq!(driver.name(), "dxp4c2x");
        assert_eq!(driver.max_channels(), 4);
    }

    #[test]
    fn test_channel_selection_follows_sel() {
        assert_eq!(Route::from(ChannelSel::All), Route::Broadcast);
        assert_eq!(Route::from(ChannelSel::One(2)), Route::Channel(2));
    }
}
