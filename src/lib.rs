#![doc = include_str!("../readme.md")]

pub mod bridge;
pub mod context;
pub mod driver;
pub mod error;
pub mod finalize;
pub mod mock;
pub mod registry;
#[cfg(feature = "rtlsdr")]
pub mod rtlsdr;
pub mod session;

pub use bridge::{ChunkSink, ChunkStream, StreamChunk, StreamConfig};
pub use context::SdrContext;
pub use driver::{DEFAULT_ASYNC_BUF_NUMBER, DEFAULT_BUF_LENGTH, Driver, DriverHandle, Gain};
pub use error::{Error, Operation, Parameter, Result};
pub use finalize::FinalizationGuard;
pub use registry::{DeviceDescriptor, DeviceFilter};
pub use session::{DeviceSession, SessionState, Stopper, TunerSettings};
