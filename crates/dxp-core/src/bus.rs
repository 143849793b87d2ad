//! Bus driver contract.
//!
//! A [`Bus`] moves 16-bit words between the host and a module. The core never
//! interprets the addresses it passes through; register maps belong to the
//! hardware family driver. Physical transports (EPP, CAMAC, USB) implement this
//! trait outside the core.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = bus.open("0x378")?;
//! let io = BoardIo::new(bus.clone(), handle, "module0");
//! io.write(CSR_PORT, &[0x0001])?;
//! ```

use crate::error::{DxpError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque handle returned by [`Bus::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle(pub u32);

/// Direction and buffer of a single bus transfer.
#[derive(Debug)]
pub enum IoBuffer<'a> {
    /// Fill the buffer from the device
    Read(&'a mut [u16]),
    /// Send the buffer to the device
    Write(&'a [u16]),
}

impl IoBuffer<'_> {
    /// Number of words in the transfer.
    pub fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
        }
    }

    /// True for a zero-length transfer.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability set a bus transport must provide.
pub trait Bus: Send + Sync {
    /// Short transport name used in logs.
    fn name(&self) -> &str;

    /// Open a connection to the module addressed by `iostring`.
    fn open(&self, iostring: &str) -> Result<BusHandle>;

    /// Perform one transfer to or from `address`.
    fn io(&self, handle: BusHandle, address: u32, buffer: IoBuffer<'_>) -> Result<()>;

    /// Release a handle returned by [`Bus::open`].
    fn close(&self, handle: BusHandle) -> Result<()>;

    /// Largest transfer the transport accepts in one call. Zero or negative
    /// means unlimited.
    fn max_block(&self) -> i64;

    /// Change the transfer size limit.
    fn set_max_block(&self, words: i64);

    /// Block the caller for `duration`.
    fn wait(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A bus together with an open handle for one module.
#[derive(Clone)]
pub struct BoardIo {
    bus: Arc<dyn Bus>,
    handle: BusHandle,
    module: String,
}

impl BoardIo {
    /// Wrap an already-open handle.
    pub fn new(bus: Arc<dyn Bus>, handle: BusHandle, module: impl Into<String>) -> Self {
        Self {
            bus,
            handle,
            module: module.into(),
        }
    }

    /// Open `iostring` on `bus` and wrap the resulting handle.
    pub fn open(bus: Arc<dyn Bus>, iostring: &str) -> Result<Self> {
        let handle = bus.open(iostring)?;
        Ok(Self::new(bus, handle, iostring))
    }

    /// Module label used in errors and logs.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Handle for this module.
    pub fn handle(&self) -> BusHandle {
        self.handle
    }

    /// Read `buf.len()` words from `address`.
    pub fn read(&self, address: u32, buf: &mut [u16]) -> Result<()> {
        self.bus
            .io(self.handle, address, IoBuffer::Read(buf))
            .map_err(|e| self.wrap(address, e))
    }

    /// Write `data` to `address`.
    pub fn write(&self, address: u32, data: &[u16]) -> Result<()> {
        self.bus
            .io(self.handle, address, IoBuffer::Write(data))
            .map_err(|e| self.wrap(address, e))
    }

    /// Transfer size limit of the underlying bus.
    pub fn max_block(&self) -> i64 {
        self.bus.max_block()
    }

    /// Sleep using the bus's notion of time.
    pub fn wait(&self, duration: Duration) {
        self.bus.wait(duration);
    }

    /// Close the handle.
    pub fn close(&self) -> Result<()> {
        self.bus.close(self.handle)
    }

    /// Attach the module and port to untyped transport failures. Errors a bus
    /// already classified pass through unchanged.
    fn wrap(&self, address: u32, err: DxpError) -> DxpError {
        match err {
            DxpError::Io(source) => DxpError::device_io(
                format!("{} @ {:#06x}", self.module, address),
                source.to_string(),
            ),
            typed => typed,
        }
    }
}

impl fmt::Debug for BoardIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardIo")
            .field("bus", &self.bus.name())
            .field("handle", &self.handle)
            .field("module", &self.module)
            .finish()
    }
}
