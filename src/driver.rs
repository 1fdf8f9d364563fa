//! Driver boundary.
//!
//! The hardware driver is an external collaborator: enumeration, open/close,
//! tuner configuration and the blocking asynchronous read loop. Sessions only
//! talk to it through these two traits, so the same session logic runs on
//! real hardware (`rtlsdr` feature) and on [`crate::mock::MockDriver`].
//!
//! Fallible calls return the driver's raw negative status code as the error,
//! the way librtlsdr does.

/// Result of a driver call: `Err` carries the negative status code.
pub type DriverResult<T> = std::result::Result<T, i32>;

/// Number of USB transfer buffers requested from the read loop.
pub const DEFAULT_ASYNC_BUF_NUMBER: u32 = 32;

/// Length in bytes of each read loop buffer.
pub const DEFAULT_BUF_LENGTH: u32 = 16 * 16384;

/// USB descriptor strings of one attached device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbStrings {
    pub vendor: String,
    pub product: String,
    pub serial: String,
}

/// Tuner gain setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gain {
    /// Tuner AGC.
    #[default]
    Auto,
    /// Manual gain in tenths of a dB (e.g. 496 for 49.6 dB).
    Manual(i32),
}

/// Device enumeration and open.
pub trait Driver: Send + Sync + 'static {
    type Handle: DriverHandle;

    /// Number of currently attached devices.
    fn device_count(&self) -> u32;

    /// Vendor, product and serial strings of the device at `index`.
    fn usb_strings(&self, index: u32) -> DriverResult<UsbStrings>;

    /// Display name of the device at `index` (empty if unknown).
    fn device_name(&self, index: u32) -> String;

    /// Open the device at `index`. Must fail rather than share a handle
    /// already held by someone else.
    fn open(&self, index: u32) -> DriverResult<Self::Handle>;
}

/// An opened device.
///
/// `cancel_async` is called from other threads while `read_async` blocks, so
/// implementations must be `Sync`.
pub trait DriverHandle: Send + Sync + 'static {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()>;

    fn set_center_freq(&self, freq: u32) -> DriverResult<()>;

    fn set_tuner_gain(&self, gain: Gain) -> DriverResult<()>;

    fn reset_buffer(&self) -> DriverResult<()>;

    /// Run the blocking read loop, calling `callback` with every captured
    /// buffer on the calling thread. The slice is only valid for the duration
    /// of the call. Returns once cancelled or on a fatal error.
    fn read_async(
        &self,
        callback: &mut dyn FnMut(&[u8]),
        buf_num: u32,
        buf_len: u32,
    ) -> DriverResult<()>;

    /// Ask a running `read_async` to return. Fire-and-forget.
    fn cancel_async(&self);

    /// Release the device.
    fn close(self);
}
