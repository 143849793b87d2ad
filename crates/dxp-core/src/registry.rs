//! Module registry.
//!
//! The [`ModuleRegistry`] is the single context object that owns every board,
//! interface, board type and firmware image of a running system.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────── ModuleRegistry ─────────────────────────────┐
//! │ board_types: name ─▶ Arc<dyn DriverContract>                             │
//! │ interfaces:  name ─▶ Arc<dyn Bus>                                        │
//! │ firmware:    (kind, source_id) ─▶ Arc<FirmwareImage>  ◀──┐ shared        │
//! │ boards:      [Board { channels: [ChannelSlot { dsp, fpga, defaults }] }] │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Firmware is loaded at most once per `(kind, source_id)`; every later
//! request returns the same `Arc`. A failed load inserts nothing.

use crate::board::{Board, ChannelSlot};
use crate::bus::{BoardIo, Bus};
use crate::driver::DriverContract;
use crate::error::{DxpError, Result};
use crate::firmware::{parse_defaults, FirmwareImage, FirmwareKind, SharedFirmware, NULL_SOURCE};
use crate::locate::FileLocator;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owner of all boards, interfaces, board types and firmware images.
#[derive(Default)]
pub struct ModuleRegistry {
    board_types: HashMap<String, Arc<dyn DriverContract>>,
    interfaces: HashMap<String, Arc<dyn Bus>>,
    firmware: HashMap<(FirmwareKind, String), SharedFirmware>,
    boards: Vec<Board>,
    locator: FileLocator,
}

impl ModuleRegistry {
    /// Empty registry resolving firmware files with `locator`.
    pub fn new(locator: FileLocator) -> Self {
        Self {
            board_types: HashMap::new(),
            interfaces: HashMap::new(),
            firmware: HashMap::new(),
            boards: Vec::new(),
            locator,
        }
    }

    /// File locator used by [`load_firmware`](Self::load_firmware).
    pub fn locator(&self) -> &FileLocator {
        &self.locator
    }

    // =========================================================================
    // Board types and interfaces
    // =========================================================================

    /// Register a hardware family under its (lowercased) name.
    pub fn register_board_type(&mut self, driver: Arc<dyn DriverContract>) {
        let name = driver.name().to_ascii_lowercase();
        debug!(board_type = %name, "Registered board type");
        self.board_types.insert(name, driver);
    }

    /// Driver registered under `name` (case-insensitive).
    pub fn get_board_type(&self, name: &str) -> Result<Arc<dyn DriverContract>> {
        self.board_types
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DxpError::UnknownBoardType {
                name: name.to_string(),
            })
    }

    /// Names of all registered board types, sorted.
    pub fn board_type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.board_types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a bus under `name`.
    pub fn add_interface(&mut self, name: impl Into<String>, bus: Arc<dyn Bus>) {
        let name = name.into();
        debug!(interface = %name, bus = bus.name(), "Added interface");
        self.interfaces.insert(name, bus);
    }

    /// Bus registered under `name`.
    pub fn interface(&self, name: &str) -> Result<Arc<dyn Bus>> {
        self.interfaces
            .get(name)
            .cloned()
            .ok_or_else(|| DxpError::bad_parameter(format!("unknown interface '{name}'")))
    }

    // =========================================================================
    // Firmware
    // =========================================================================

    /// Load firmware `source_id` of `kind` for `board_type`, or return the
    /// already-loaded image.
    pub fn load_firmware(
        &mut self,
        board_type: &str,
        kind: FirmwareKind,
        source_id: &str,
    ) -> Result<SharedFirmware> {
        if let Some(existing) = self.firmware(kind, source_id) {
            debug!(source_id, kind = %kind, "Reusing loaded firmware");
            return Ok(existing);
        }
        if kind == FirmwareKind::Defaults && source_id.eq_ignore_ascii_case(NULL_SOURCE) {
            let image = Arc::new(FirmwareImage::defaults(source_id, Vec::new()));
            self.firmware
                .insert((kind, source_id.to_string()), Arc::clone(&image));
            return Ok(image);
        }
        let mut reader = self.locator.open(source_id)?;
        self.load_firmware_from(board_type, kind, source_id, &mut reader)
    }

    /// Like [`load_firmware`](Self::load_firmware) but parse from `reader`
    /// instead of searching for a file.
    pub fn load_firmware_from(
        &mut self,
        board_type: &str,
        kind: FirmwareKind,
        source_id: &str,
        reader: &mut dyn BufRead,
    ) -> Result<SharedFirmware> {
        if let Some(existing) = self.firmware(kind, source_id) {
            return Ok(existing);
        }
        let image = match kind {
            FirmwareKind::Defaults => parse_defaults(source_id, reader)?,
            _ => {
                let driver = self.get_board_type(board_type)?;
                let info = driver.firmware_info();
                driver.load_program(kind, source_id, reader, &info)?
            }
        };
        let image = Arc::new(image);
        info!(
            source_id,
            kind = %kind,
            words = image.len(),
            symbols = image.symbols().map_or(0, |s| s.len()),
            "Loaded firmware"
        );
        self.firmware
            .insert((kind, source_id.to_string()), Arc::clone(&image));
        Ok(image)
    }

    /// Reload `source_id` from disk even if already loaded, and reassign it to
    /// every channel that held the old image.
    pub fn replace_firmware(
        &mut self,
        board_type: &str,
        kind: FirmwareKind,
        source_id: &str,
    ) -> Result<SharedFirmware> {
        let key = (kind, source_id.to_string());
        let old = self.firmware.remove(&key);
        let fresh = match self.load_firmware(board_type, kind, source_id) {
            Ok(image) => image,
            Err(e) => {
                if let Some(old) = old {
                    self.firmware.insert(key, old);
                }
                return Err(e);
            }
        };
        if let Some(old) = old {
            for board in &mut self.boards {
                let holders: Vec<usize> = board
                    .channels()
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.firmware(kind).is_some_and(|fw| Arc::ptr_eq(fw, &old)))
                    .map(|(ch, _)| ch)
                    .collect();
                for ch in holders {
                    board.assign_firmware(ch, Arc::clone(&fresh))?;
                }
            }
        }
        Ok(fresh)
    }

    /// Already-loaded firmware, without loading.
    pub fn firmware(&self, kind: FirmwareKind, source_id: &str) -> Option<SharedFirmware> {
        self.firmware.get(&(kind, source_id.to_string())).cloned()
    }

    /// Number of distinct firmware images loaded.
    pub fn firmware_count(&self) -> usize {
        self.firmware.len()
    }

    // =========================================================================
    // Boards
    // =========================================================================

    /// Open `iostring` on `interface` and add a board of `board_type`.
    /// Returns the board index.
    pub fn add_board(
        &mut self,
        board_type: &str,
        interface: &str,
        iostring: &str,
        channels: Vec<ChannelSlot>,
    ) -> Result<usize> {
        let driver = self.get_board_type(board_type)?;
        if channels.is_empty() || channels.len() > driver.max_channels() {
            return Err(DxpError::bad_parameter(format!(
                "board type '{}' supports 1..={} channels, got {}",
                driver.name(),
                driver.max_channels(),
                channels.len()
            )));
        }
        let bus = self.interface(interface)?;
        let io = BoardIo::open(bus, iostring)?;
        let id = self.boards.len();
        info!(
            board = id,
            board_type = driver.name(),
            interface,
            iostring,
            channels = channels.len(),
            "Added board"
        );
        self.boards
            .push(Board::new(id, driver, interface, iostring, io, channels));
        Ok(id)
    }

    /// Board at `index`.
    pub fn board(&self, index: usize) -> Result<&Board> {
        self.boards
            .get(index)
            .ok_or_else(|| DxpError::bad_parameter(format!("no board {index}")))
    }

    /// Mutable board at `index`.
    pub fn board_mut(&mut self, index: usize) -> Result<&mut Board> {
        self.boards
            .get_mut(index)
            .ok_or_else(|| DxpError::bad_parameter(format!("no board {index}")))
    }

    /// All boards.
    pub fn boards(&self) -> &[Board] {
        &self.boards
    }

    /// All boards, mutably.
    pub fn boards_mut(&mut self) -> &mut [Board] {
        &mut self.boards
    }

    /// Release every board, interface, board type and firmware image.
    /// Safe to call repeatedly.
    pub fn teardown(&mut self) {
        for board in self.boards.drain(..) {
            if let Err(e) = board.io().close() {
                warn!(board = board.id(), error = %e, "Failed to close bus handle");
            }
        }
        if !self.firmware.is_empty() || !self.board_types.is_empty() {
            info!(firmware = self.firmware.len(), "Registry torn down");
        }
        self.firmware.clear();
        self.interfaces.clear();
        self.board_types.clear();
    }
}

impl Drop for ModuleRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ChannelSel;
    use crate::board::DownloadState;
    use crate::firmware::FirmwareInfo;
    use crate::symbols::SymbolTable;
    use std::io::Cursor;
    use tracing_test::traced_test;

    /// Family that treats every source line as one decimal word.
    struct LineFamily;

    impl DriverContract for LineFamily {
        fn name(&self) -> &'static str {
            "LineFamily"
        }
        fn max_channels(&self) -> usize {
            4
        }
        fn firmware_info(&self) -> FirmwareInfo {
            FirmwareInfo {
                max_program_len: 8,
                max_symbols: 4,
                max_symbol_name_len: 8,
            }
        }
        fn load_program(
            &self,
            kind: FirmwareKind,
            source_id: &str,
            reader: &mut dyn BufRead,
            info: &FirmwareInfo,
        ) -> Result<FirmwareImage> {
            let mut words = Vec::new();
            for line in reader.lines() {
                let line = line?;
                let word = line.trim().parse::<u16>().map_err(|e| DxpError::LoadError {
                    source_id: source_id.to_string(),
                    message: e.to_string(),
                })?;
                words.push(word);
            }
            if words.len() > info.max_program_len {
                return Err(DxpError::OutOfMemory {
                    source_id: source_id.to_string(),
                    what: "program",
                    requested: words.len(),
                    limit: info.max_program_len,
                });
            }
            Ok(match kind {
                FirmwareKind::Fpga => FirmwareImage::bitstream(source_id, words),
                _ => FirmwareImage::program(
                    source_id,
                    words,
                    info.max_program_len,
                    SymbolTable::new(info.max_symbol_name_len),
                ),
            })
        }
        fn download_fpga(&self, _b: &mut Board, _s: ChannelSel, _n: &str) -> Result<()> {
            Ok(())
        }
        fn download_dsp(&self, _b: &mut Board, _s: ChannelSel) -> Result<()> {
            Ok(())
        }
        fn read_symbol(&self, _b: &Board, _c: usize, name: &str) -> Result<f64> {
            Err(DxpError::UnknownSymbol { name: name.into() })
        }
        fn modify_symbol(
            &self,
            _b: &mut Board,
            _c: usize,
            name: &str,
            _v: f64,
        ) -> Result<Option<crate::driver::SymbolWarning>> {
            Err(DxpError::UnknownSymbol { name: name.into() })
        }
        fn begin_run(&self, _b: &mut Board, _g: bool, _r: bool) -> Result<()> {
            Ok(())
        }
        fn end_run(&self, _b: &mut Board) -> Result<()> {
            Ok(())
        }
        fn run_active(&self, _b: &Board) -> Result<bool> {
            Ok(false)
        }
    }

    fn registry() -> ModuleRegistry {
        let mut reg = ModuleRegistry::default();
        reg.register_board_type(Arc::new(LineFamily));
        reg
    }

    #[test]
    fn test_board_type_lookup_is_case_insensitive() {
        let reg = registry();
        assert_eq!(reg.get_board_type("LINEFAMILY").unwrap().name(), "LineFamily");
        assert!(matches!(
            reg.get_board_type("x10p"),
            Err(DxpError::UnknownBoardType { .. })
        ));
    }

    #[test]
    fn test_same_source_id_is_shared() {
        let mut reg = registry();
        let a = reg
            .load_firmware_from(
                "linefamily",
                FirmwareKind::Dsp,
                "a.dsp",
                &mut Cursor::new("1\n2\n"),
            )
            .unwrap();
        // Different content under the same id still resolves to the first image.
        let again = reg
            .load_firmware_from("linefamily", FirmwareKind::Dsp, "a.dsp", &mut Cursor::new("9\n"))
            .unwrap();
        let b = reg
            .load_firmware_from(
                "linefamily",
                FirmwareKind::Dsp,
                "b.dsp",
                &mut Cursor::new("1\n2\n"),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(again.payload(), &[1, 2]);
        assert_eq!(reg.firmware_count(), 2);
    }

    #[test]
    fn test_kinds_do_not_alias() {
        let mut reg = registry();
        let dsp = reg
            .load_firmware_from("linefamily", FirmwareKind::Dsp, "same", &mut Cursor::new("1\n"))
            .unwrap();
        let fpga = reg
            .load_firmware_from("linefamily", FirmwareKind::Fpga, "same", &mut Cursor::new("1\n"))
            .unwrap();
        assert!(!Arc::ptr_eq(&dsp, &fpga));
    }

    #[test]
    fn test_failed_load_inserts_nothing() {
        let mut reg = registry();
        let err = reg
            .load_firmware_from(
                "linefamily",
                FirmwareKind::Dsp,
                "bad.dsp",
                &mut Cursor::new("1\nxx\n"),
            )
            .unwrap_err();
        assert!(matches!(err, DxpError::LoadError { .. }));
        assert!(reg.firmware(FirmwareKind::Dsp, "bad.dsp").is_none());

        let too_big = "1\n".repeat(9);
        let err = reg
            .load_firmware_from(
                "linefamily",
                FirmwareKind::Dsp,
                "big.dsp",
                &mut Cursor::new(too_big),
            )
            .unwrap_err();
        assert!(matches!(err, DxpError::OutOfMemory { .. }));
        assert_eq!(reg.firmware_count(), 0);
    }

    #[test]
    #[traced_test]
    fn test_null_defaults() {
        let mut reg = registry();
        let d = reg
            .load_firmware("linefamily", FirmwareKind::Defaults, "NULL")
            .unwrap();
        assert!(d.default_values().is_empty());
        let again = reg
            .load_firmware("linefamily", FirmwareKind::Defaults, "NULL")
            .unwrap();
        assert!(Arc::ptr_eq(&d, &again));
        assert!(logs_contain("Reusing loaded firmware"));
    }

    #[test]
    fn test_replace_firmware_marks_channels_stale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r.dsp"), "1\n").unwrap();
        let locator = FileLocator::with_roots(Some(dir.path().to_path_buf()), None);
        let mut reg = ModuleRegistry::new(locator);
        reg.register_board_type(Arc::new(LineFamily));

        let old = reg.load_firmware("linefamily", FirmwareKind::Dsp, "r.dsp").unwrap();
        let mut slot = ChannelSlot::new(0);
        slot.dsp = Some(Arc::clone(&old));
        slot.dsp_downloaded = DownloadState::Loaded;
        reg.boards.push(Board::new(
            0,
            Arc::new(LineFamily),
            "none",
            "io0",
            crate::bus::BoardIo::new(Arc::new(NullBus), crate::bus::BusHandle(0), "io0"),
            vec![slot],
        ));

        std::fs::write(dir.path().join("r.dsp"), "2\n").unwrap();
        let fresh = reg.replace_firmware("linefamily", FirmwareKind::Dsp, "r.dsp").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.payload(), &[2]);
        let slot = reg.board(0).unwrap().channel(0).unwrap();
        assert!(Arc::ptr_eq(slot.dsp.as_ref().unwrap(), &fresh));
        assert_eq!(slot.dsp_downloaded, DownloadState::Stale);
    }

    struct NullBus;

    impl Bus for NullBus {
        fn name(&self) -> &str {
            "null"
        }
        fn open(&self, _iostring: &str) -> Result<crate::bus::BusHandle> {
            Ok(crate::bus::BusHandle(0))
        }
        fn io(
            &self,
            _h: crate::bus::BusHandle,
            _a: u32,
            _b: crate::bus::IoBuffer<'_>,
        ) -> Result<()> {
            Ok(())
        }
        fn close(&self, _h: crate::bus::BusHandle) -> Result<()> {
            Ok(())
        }
        fn max_block(&self) -> i64 {
            0
        }
        fn set_max_block(&self, _w: i64) {}
    }

    #[test]
    fn test_add_board_validates_channel_count() {
        let mut reg = registry();
        reg.add_interface("epp", Arc::new(NullBus));
        let err = reg
            .add_board("linefamily", "epp", "0x378", (0..5).map(ChannelSlot::new).collect())
            .unwrap_err();
        assert!(matches!(err, DxpError::BadParameter { .. }));
        let id = reg
            .add_board("linefamily", "epp", "0x378", vec![ChannelSlot::new(0)])
            .unwrap();
        assert_eq!(id, 0);
        assert!(reg.add_board("linefamily", "usb", "1", vec![ChannelSlot::new(1)]).is_err());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut reg = registry();
        reg.add_interface("epp", Arc::new(NullBus));
        reg.add_board("linefamily", "epp", "0x378", vec![ChannelSlot::new(0)])
            .unwrap();
        reg.load_firmware_from("linefamily", FirmwareKind::Fpga, "f", &mut Cursor::new("1\n"))
            .unwrap();
        reg.teardown();
        reg.teardown();
        assert_eq!(reg.firmware_count(), 0);
        assert!(reg.boards().is_empty());
        assert!(reg.get_board_type("linefamily").is_err());
    }
}
