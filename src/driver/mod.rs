//! Native driver access layer
//!
//! The local backends (`a`, `b`) sit on vendor scanner libraries that push
//! pages and faults from threads outside the request flow. [`DriverPort`] /
//! [`DriverSession`] are that boundary: a port lists sources and opens
//! sessions; a session takes options, starts an acquisition streaming
//! [`DriverEvent`]s into a channel, and can be aborted at any time.
//!
//! The [`emulated`] port stands where a vendor runtime would plug in; it
//! drives development and the test suite.

pub mod emulated;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Value of a driver option
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Acquisition UI mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    /// No vendor window
    Headless,
    /// Vendor window without blocking the host UI
    NonModal,
    /// Blocking vendor window
    Modal,
}

/// Events pushed by a driver during an acquisition
///
/// Drivers are noisy: `Fault` may repeat, and `FeederEmpty` can arrive after
/// a batch already completed. The backends reconcile this into exactly one
/// terminal event per job.
#[derive(Debug)]
pub enum DriverEvent {
    Page {
        data: Vec<u8>,
        width: u32,
        height: u32,
        /// Encoded format tag ("png", "jpg", "raw")
        format: String,
        dpi: u32,
    },
    /// No more media in the feeder
    FeederEmpty,
    /// Normal end of batch
    Done { pages: u32 },
    /// Transfer error; may repeat
    Fault(String),
}

/// Source advertised by a driver library
///
/// `local_id` may be empty until the source is opened; callers fall back to
/// the display name and cache the mapping.
#[derive(Debug, Clone)]
pub struct DriverSource {
    pub local_id: String,
    pub display_name: String,
    pub adf: bool,
    pub duplex_one_pass: bool,
    pub duplex_two_pass: bool,
    /// Headless acquisition refused by this driver
    pub ui_required: bool,
    /// Vendor window available at all
    pub ui_supported: bool,
    pub dpi_values: Vec<u32>,
    pub paper_sizes: Vec<String>,
    pub pixel_types: Vec<String>,
}

/// Option keys shared by the local driver families
pub mod option_keys {
    pub const DPI: &str = "dpi";
    pub const PIXEL_TYPE: &str = "pixelType";
    pub const PAPER_SIZE: &str = "paperSize";
    pub const USE_ADF: &str = "useAdf";
    pub const DUPLEX: &str = "duplex";
    /// One-pass (interleaved) vs two-pass duplex
    pub const DUPLEX_TWO_PASS: &str = "duplexTwoPass";
    /// Hard cap on transferred pages; vendor windows own this value in UI mode
    pub const TRANSFER_COUNT: &str = "transferCount";
}

/// Entry point into one vendor runtime
#[async_trait]
pub trait DriverPort: Send + Sync {
    /// Human-readable runtime name for logs
    fn runtime_name(&self) -> &str;

    /// List available sources
    async fn sources(&self) -> Result<Vec<DriverSource>>;

    /// Open a source by local id or display name
    async fn open(&self, local_id: &str) -> Result<Box<dyn DriverSession>>;
}

/// An opened device handle
#[async_trait]
pub trait DriverSession: Send {
    /// Descriptor of the opened source; `local_id` is populated here
    fn descriptor(&self) -> DriverSource;

    /// Push one option; returns false when the device does not support it
    async fn set_option(&mut self, key: &str, value: OptionValue) -> Result<bool>;

    /// Start an acquisition, streaming events into `events`
    ///
    /// Must not block across pages; the transfer runs on the driver's own
    /// schedule.
    async fn begin(&mut self, ui: UiMode, events: mpsc::Sender<DriverEvent>) -> Result<()>;

    /// Request abort of a running acquisition; safe to call at any time
    async fn abort(&mut self);

    /// Release the handle
    async fn close(&mut self);
}
