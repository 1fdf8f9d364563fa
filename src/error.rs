//! Error types for RTL-SDR session operations.
//!
//! Every failure carries structured fields (the operation, the session state,
//! the raw driver status code) so callers can match on them instead of parsing
//! messages. The `Display` output is meant for logs.

use std::fmt;

use thiserror::Error;

use crate::session::SessionState;

/// Result type for rtlsdr-session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Operations that can fail or be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enumerate,
    Open,
    SetSampleRate,
    SetCenterFrequency,
    SetTunerGain,
    ResetBuffer,
    ReadAsync,
    Start,
    Stop,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Enumerate => "enumerate",
            Operation::Open => "open",
            Operation::SetSampleRate => "setSampleRate",
            Operation::SetCenterFrequency => "setCenterFrequency",
            Operation::SetTunerGain => "setTunerGain",
            Operation::ResetBuffer => "resetBuffer",
            Operation::ReadAsync => "readAsync",
            Operation::Start => "start",
            Operation::Stop => "stop",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tuner parameters the hardware may reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    SampleRate,
    CenterFrequency,
    TunerGain,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parameter::SampleRate => "sample rate",
            Parameter::CenterFrequency => "center frequency",
            Parameter::TunerGain => "tuner gain",
        })
    }
}

/// Errors that can occur while enumerating, configuring or streaming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The driver returned a negative status.
    #[error(
        "{operation} failed{} (driver error {code}: {})",
        device_suffix(.device),
        code_name(.code)
    )]
    Driver {
        operation: Operation,
        /// Device index involved, when there is one.
        device: Option<u32>,
        code: i32,
    },

    /// The operation is not valid in the session's current state.
    #[error("cannot {attempted} while session is {current}")]
    InvalidState {
        attempted: Operation,
        current: SessionState,
    },

    /// The hardware rejected a tuner parameter.
    #[error("failed to set {parameter} (driver error {code}: {})", code_name(.code))]
    Configuration { parameter: Parameter, code: i32 },
}

impl Error {
    pub(crate) fn driver(operation: Operation, device: Option<u32>, code: i32) -> Self {
        Error::Driver {
            operation,
            device,
            code,
        }
    }

    pub(crate) fn invalid_state(attempted: Operation, current: SessionState) -> Self {
        Error::InvalidState { attempted, current }
    }

    /// Raw driver status code, if the error came from the driver.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Driver { code, .. } | Error::Configuration { code, .. } => Some(*code),
            Error::InvalidState { .. } => None,
        }
    }
}

fn device_suffix(device: &Option<u32>) -> String {
    device
        .map(|index| format!(" for device {}", index))
        .unwrap_or_default()
}

fn code_name(code: &i32) -> &'static str {
    LibusbErrorCode::from_code(*code).map_or("unknown", LibusbErrorCode::name)
}

/// Status codes reported by librtlsdr-style drivers.
///
/// librtlsdr passes libusb's negative codes through unchanged and uses `-1`
/// for its own generic failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LibusbErrorCode {
    Io = -1,
    InvalidParam = -2,
    Access = -3,
    NoDevice = -4,
    NotFound = -5,
    Busy = -6,
    Timeout = -7,
    Overflow = -8,
    Pipe = -9,
    Interrupted = -10,
    NoMem = -11,
    NotSupported = -12,
    Other = -99,
}

impl LibusbErrorCode {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => LibusbErrorCode::Io,
            -2 => LibusbErrorCode::InvalidParam,
            -3 => LibusbErrorCode::Access,
            -4 => LibusbErrorCode::NoDevice,
            -5 => LibusbErrorCode::NotFound,
            -6 => LibusbErrorCode::Busy,
            -7 => LibusbErrorCode::Timeout,
            -8 => LibusbErrorCode::Overflow,
            -9 => LibusbErrorCode::Pipe,
            -10 => LibusbErrorCode::Interrupted,
            -11 => LibusbErrorCode::NoMem,
            -12 => LibusbErrorCode::NotSupported,
            -99 => LibusbErrorCode::Other,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Get a human-readable name for the error code.
    pub fn name(self) -> &'static str {
        match self {
            LibusbErrorCode::Io => "LIBUSB_ERROR_IO",
            LibusbErrorCode::InvalidParam => "LIBUSB_ERROR_INVALID_PARAM",
            LibusbErrorCode::Access => "LIBUSB_ERROR_ACCESS",
            LibusbErrorCode::NoDevice => "LIBUSB_ERROR_NO_DEVICE",
            LibusbErrorCode::NotFound => "LIBUSB_ERROR_NOT_FOUND",
            LibusbErrorCode::Busy => "LIBUSB_ERROR_BUSY",
            LibusbErrorCode::Timeout => "LIBUSB_ERROR_TIMEOUT",
            LibusbErrorCode::Overflow => "LIBUSB_ERROR_OVERFLOW",
            LibusbErrorCode::Pipe => "LIBUSB_ERROR_PIPE",
            LibusbErrorCode::Interrupted => "LIBUSB_ERROR_INTERRUPTED",
            LibusbErrorCode::NoMem => "LIBUSB_ERROR_NO_MEM",
            LibusbErrorCode::NotSupported => "LIBUSB_ERROR_NOT_SUPPORTED",
            LibusbErrorCode::Other => "LIBUSB_ERROR_OTHER",
        }
    }
}
