//! Device sessions.
//!
//! A [`DeviceSession`] owns the handle of one opened device and enforces the
//! session state machine:
//!
//! ```text
//! Closed --open--> Open --start--> Streaming --(read loop returns)--> Open --close--> Closed
//! ```
//!
//! All transitions go through one mutex. The mutex is never held while the
//! blocking read loop runs, so `stop()` and `close()` can be called from any
//! thread, including from inside the chunk sink.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bridge::{self, ChannelSink, ChunkSink, ChunkStream, StreamConfig, StreamingBridge};
use crate::driver::{Driver, DriverHandle, DriverResult, Gain};
use crate::error::{Error, Operation, Parameter, Result};
use crate::finalize::FinalizationGuard;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No handle held.
    Closed,
    /// Handle held, not streaming.
    Open,
    /// The read loop is running.
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Closed => "closed",
            SessionState::Open => "open",
            SessionState::Streaming => "streaming",
        })
    }
}

/// Tuner parameters applied together by [`DeviceSession::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunerSettings {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Center frequency in Hz
    pub center_freq: u32,
    /// Tuner gain, left untouched when `None`
    pub gain: Option<Gain>,
}

impl TunerSettings {
    pub fn new(sample_rate: u32, center_freq: u32) -> Self {
        Self {
            sample_rate,
            center_freq,
            gain: None,
        }
    }

    pub fn with_gain(mut self, gain: Gain) -> Self {
        self.gain = Some(gain);
        self
    }
}

struct Inner<H> {
    state: SessionState,
    // Some iff state is Open or Streaming.
    handle: Option<Arc<H>>,
    // Cancellation flag of the current (or last) streaming run.
    cancelled: Arc<AtomicBool>,
    close_pending: bool,
}

/// A handle checked out for one streaming run.
struct StreamLease<H> {
    handle: Arc<H>,
    cancelled: Arc<AtomicBool>,
}

/// State shared by the consumer-facing session, its stoppers, its
/// finalization guard and the streaming worker.
pub(crate) struct SessionCore<D: Driver> {
    driver: Arc<D>,
    index: u32,
    inner: Mutex<Inner<D::Handle>>,
}

impl<D: Driver> SessionCore<D> {
    fn new(driver: Arc<D>, index: u32) -> Self {
        Self {
            driver,
            index,
            inner: Mutex::new(Inner {
                state: SessionState::Closed,
                handle: None,
                cancelled: Arc::new(AtomicBool::new(false)),
                close_pending: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<D::Handle>> {
        // No sink or driver callback ever runs under this lock.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn open(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != SessionState::Closed {
            return Err(Error::invalid_state(Operation::Open, inner.state));
        }

        let handle = self.driver.open(self.index).map_err(|code| {
            warn!("could not open device {}: error {}", self.index, code);
            Error::driver(Operation::Open, Some(self.index), code)
        })?;

        inner.handle = Some(Arc::new(handle));
        inner.state = SessionState::Open;
        inner.close_pending = false;
        debug!("device {} opened", self.index);
        Ok(())
    }

    fn configure(
        &self,
        attempted: Operation,
        parameter: Parameter,
        apply: impl FnOnce(&D::Handle) -> DriverResult<()>,
    ) -> Result<()> {
        let inner = self.lock();
        let handle = match (inner.state, &inner.handle) {
            (SessionState::Open, Some(handle)) => handle,
            (state, _) => return Err(Error::invalid_state(attempted, state)),
        };

        apply(&**handle).map_err(|code| {
            warn!("device {} rejected {}: error {}", self.index, parameter, code);
            Error::Configuration { parameter, code }
        })
    }

    fn begin_streaming(&self) -> Result<StreamLease<D::Handle>> {
        let mut inner = self.lock();
        let handle = match (inner.state, &inner.handle) {
            (SessionState::Open, Some(handle)) => Arc::clone(handle),
            (state, _) => return Err(Error::invalid_state(Operation::Start, state)),
        };

        handle.reset_buffer().map_err(|code| {
            warn!("failed to reset buffer of device {}: error {}", self.index, code);
            Error::driver(Operation::ResetBuffer, Some(self.index), code)
        })?;

        let cancelled = Arc::new(AtomicBool::new(false));
        inner.cancelled = Arc::clone(&cancelled);
        inner.state = SessionState::Streaming;
        Ok(StreamLease { handle, cancelled })
    }

    /// Drive one streaming run on the calling thread, then go back to Open
    /// (or Closed, if a close came in meanwhile).
    fn run<S: ChunkSink>(
        &self,
        lease: StreamLease<D::Handle>,
        sink: S,
        config: &StreamConfig,
    ) -> (Result<()>, S) {
        // Declared before the lease is unpacked so that, on unwind too, the
        // handle is dropped before the run ends.
        let ending = RunEnding { core: self };
        let StreamLease { handle, cancelled } = lease;
        debug!(
            "device {} streaming: {} buffers of {} bytes",
            self.index, config.buf_num, config.buf_len
        );

        let mut bridge = StreamingBridge::new(sink, cancelled);
        let status = bridge::run_read_loop(&*handle, &mut bridge, config);
        // Give the handle back before a deferred close tries to take it.
        drop(handle);
        let (sink, _) = bridge.finish();

        let result = status.map_err(|code| {
            warn!("read loop of device {} failed: error {}", self.index, code);
            Error::driver(Operation::ReadAsync, Some(self.index), code)
        });

        drop(ending);
        (result, sink)
    }

    /// Leave Streaming: back to Open, then run a close requested meanwhile.
    fn end_run(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Open;
        if inner.close_pending {
            debug!("device {} read loop exited, running deferred close", self.index);
            self.release(&mut inner);
        }
    }

    fn stop(&self) -> Result<()> {
        let inner = self.lock();
        match inner.state {
            SessionState::Closed => Err(Error::invalid_state(Operation::Stop, inner.state)),
            SessionState::Open => {
                trace!("stop on idle device {}: nothing to cancel", self.index);
                Ok(())
            }
            SessionState::Streaming => {
                self.cancel(&inner);
                Ok(())
            }
        }
    }

    fn cancel(&self, inner: &Inner<D::Handle>) {
        if inner.cancelled.swap(true, Ordering::AcqRel) {
            trace!("device {} cancellation already requested", self.index);
        } else {
            debug!("cancelling read loop of device {}", self.index);
        }
        if let Some(handle) = &inner.handle {
            handle.cancel_async();
        }
    }

    /// Release the handle now, or once the read loop returns.
    fn shutdown(&self, inner: &mut Inner<D::Handle>) {
        match inner.state {
            SessionState::Closed => trace!("device {} already closed", self.index),
            SessionState::Open => self.release(inner),
            SessionState::Streaming => {
                inner.close_pending = true;
                self.cancel(inner);
            }
        }
    }

    fn release(&self, inner: &mut Inner<D::Handle>) {
        let Some(handle) = inner.handle.take() else {
            return;
        };

        match Arc::try_unwrap(handle) {
            Ok(handle) => {
                handle.close();
                inner.state = SessionState::Closed;
                inner.close_pending = false;
                debug!("device {} closed", self.index);
            }
            Err(shared) => {
                warn!("device {} handle still in use, deferring close", self.index);
                inner.handle = Some(shared);
                inner.close_pending = true;
            }
        }
    }

    fn close(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Streaming {
            debug!("device {} close requested while streaming", self.index);
        }
        self.shutdown(&mut inner);
    }

    /// Release path for an unreachable session. Never fails; logs instead.
    pub(crate) fn finalize(&self) {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Closed => {}
            SessionState::Open => {
                warn!("device {} session dropped without close, releasing handle", self.index)
            }
            SessionState::Streaming => {
                warn!("device {} session dropped while streaming, cancelling", self.index)
            }
        }
        self.shutdown(&mut inner);
    }
}

/// Ends a streaming run when dropped, whether the run returned or a sink
/// panicked out of it.
struct RunEnding<'a, D: Driver> {
    core: &'a SessionCore<D>,
}

impl<D: Driver> Drop for RunEnding<'_, D> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("device {} read loop unwound, ending stream", self.core.index);
        }
        self.core.end_run();
    }
}

/// An RTL-SDR device session.
///
/// Created in the Closed state for one enumerated device index. Dropping the
/// session without calling [`close`](Self::close) still releases the handle
/// exactly once, through its [`FinalizationGuard`].
///
/// # Example
///
/// ```
/// use rtlsdr_session::mock::{MockDevice, MockDriver};
/// use rtlsdr_session::{SdrContext, SessionState, StreamChunk};
///
/// let device = MockDevice::new("Realtek", "RTL2838UHIDIR", "00000001")
///     .with_buffers(vec![vec![0u8; 512]; 4]);
/// let context = SdrContext::init(MockDriver::new().with_device(device));
///
/// let session = context.open(0)?;
/// session.set_sample_rate(2_048_000)?;
/// session.set_center_frequency(100_000_000)?;
///
/// let mut received = 0;
/// session.start(|chunk: StreamChunk| received += chunk.len())?;
/// assert_eq!(received, 4 * 512);
///
/// session.close();
/// assert_eq!(session.state(), SessionState::Closed);
/// # Ok::<(), rtlsdr_session::Error>(())
/// ```
pub struct DeviceSession<D: Driver> {
    // Dropped before `core`, while the core is still reachable.
    guard: FinalizationGuard<D>,
    core: Arc<SessionCore<D>>,
}

impl<D: Driver> DeviceSession<D> {
    pub(crate) fn new(driver: Arc<D>, index: u32) -> Self {
        let core = Arc::new(SessionCore::new(driver, index));
        Self {
            guard: FinalizationGuard::arm(&core),
            core,
        }
    }

    /// Index of the device this session is bound to.
    pub fn index(&self) -> u32 {
        self.core.index
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Open the device. Only valid while Closed.
    pub fn open(&self) -> Result<()> {
        self.core.open()
    }

    /// Set the sample rate in Hz. Only valid while Open.
    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        self.core
            .configure(Operation::SetSampleRate, Parameter::SampleRate, |handle| {
                handle.set_sample_rate(rate)
            })?;
        debug!("device {} sample rate set to {} Hz", self.index(), rate);
        Ok(())
    }

    /// Set the center frequency in Hz. Only valid while Open.
    pub fn set_center_frequency(&self, freq: u32) -> Result<()> {
        self.core.configure(
            Operation::SetCenterFrequency,
            Parameter::CenterFrequency,
            |handle| handle.set_center_freq(freq),
        )?;
        debug!("device {} center frequency set to {} Hz", self.index(), freq);
        Ok(())
    }

    pub fn set_tuner_gain(&self, gain: Gain) -> Result<()> {
        self.core
            .configure(Operation::SetTunerGain, Parameter::TunerGain, |handle| {
                handle.set_tuner_gain(gain)
            })?;
        debug!("device {} tuner gain set to {:?}", self.index(), gain);
        Ok(())
    }

    /// Apply sample rate, center frequency and gain, stopping at the first
    /// rejected parameter.
    pub fn configure(&self, settings: &TunerSettings) -> Result<()> {
        self.set_sample_rate(settings.sample_rate)?;
        self.set_center_frequency(settings.center_freq)?;
        if let Some(gain) = settings.gain {
            self.set_tuner_gain(gain)?;
        }
        Ok(())
    }

    /// Stream with the default buffer settings. See [`start_with`](Self::start_with).
    pub fn start<S: ChunkSink>(&self, sink: S) -> Result<()> {
        self.start_with(sink, &StreamConfig::default())
    }

    /// Reset the device buffer and run the read loop on the calling thread,
    /// delivering every buffer to `sink`.
    ///
    /// Blocks until [`stop`](Self::stop) (or a [`Stopper`]) cancels the loop
    /// or the driver fails. The session is Open again when this returns,
    /// unless it was closed in the meantime.
    pub fn start_with<S: ChunkSink>(&self, sink: S, config: &StreamConfig) -> Result<()> {
        let lease = self.core.begin_streaming()?;
        self.core.run(lease, sink, config).0
    }

    /// Start streaming on a dedicated worker thread and return the consumer
    /// end of the chunk channel.
    ///
    /// State and buffer-reset errors are reported here, synchronously. A
    /// failure of the running read loop arrives as the last stream item.
    /// Once [`stop`](Self::stop) is called, chunks still queued in the
    /// channel are dropped rather than yielded.
    pub fn stream(&self, config: &StreamConfig) -> Result<ChunkStream> {
        let lease = self.core.begin_streaming()?;
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let cancelled = Arc::clone(&lease.cancelled);
        let sink = ChannelSink::new(tx, Arc::clone(&cancelled));
        let core = Arc::clone(&self.core);
        let config = *config;

        let handle = std::thread::spawn(move || {
            let (result, sink) = core.run(lease, sink, &config);
            if let Err(err) = result {
                sink.fail(err);
            }
        });

        Ok(ChunkStream::new(rx, cancelled, handle))
    }

    /// Request cancellation of the read loop. Does not wait for it.
    ///
    /// A no-op when the session is Open. Fails only when Closed.
    pub fn stop(&self) -> Result<()> {
        self.core.stop()
    }

    /// Release the device handle. Idempotent.
    ///
    /// While streaming, the read loop is cancelled and the handle is closed
    /// as soon as it returns.
    pub fn close(&self) {
        self.core.close()
    }

    /// A handle that can cancel streaming from another thread or from
    /// inside a sink, without borrowing the session.
    pub fn stopper(&self) -> Stopper<D> {
        Stopper {
            core: Arc::downgrade(&self.core),
        }
    }

    /// The guard releasing this session's handle on drop.
    pub fn finalization_guard(&self) -> &FinalizationGuard<D> {
        &self.guard
    }
}

impl<D: Driver> fmt::Debug for DeviceSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("index", &self.index())
            .field("state", &self.state())
            .finish()
    }
}

/// Cancels a session's read loop. Does not keep the session alive.
pub struct Stopper<D: Driver> {
    core: Weak<SessionCore<D>>,
}

impl<D: Driver> Stopper<D> {
    /// Request cancellation if the session is still streaming.
    pub fn stop(&self) {
        let Some(core) = self.core.upgrade() else {
            trace!("stop requested after the session was dropped");
            return;
        };
        if let Err(e) = core.stop() {
            trace!("stop ignored: {}", e);
        }
    }
}

impl<D: Driver> Clone for Stopper<D> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockDriver};

    fn session(device: MockDevice) -> (MockDriver, DeviceSession<MockDriver>) {
        let driver = MockDriver::new().with_device(device);
        let session = DeviceSession::new(Arc::new(driver.clone()), 0);
        (driver, session)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Streaming.to_string(), "streaming");
    }

    #[test]
    fn test_new_session_is_closed() {
        let (driver, session) = session(MockDevice::new("v", "p", "s"));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.opens(), 0);
    }

    #[test]
    fn test_open_twice_is_invalid() {
        let (_driver, session) = session(MockDevice::new("v", "p", "s"));
        session.open().unwrap();
        assert_eq!(
            session.open(),
            Err(Error::InvalidState {
                attempted: Operation::Open,
                current: SessionState::Open
            })
        );
    }

    #[test]
    fn test_open_failure_stays_closed() {
        let (_driver, session) = session(MockDevice::new("v", "p", "s").fail_open(-3));
        assert_eq!(
            session.open(),
            Err(Error::Driver {
                operation: Operation::Open,
                device: Some(0),
                code: -3
            })
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_configure_applies_all_settings() {
        let (driver, session) = session(MockDevice::new("v", "p", "s"));
        session.open().unwrap();
        session
            .configure(&TunerSettings::new(2_048_000, 100_000_000).with_gain(Gain::Manual(496)))
            .unwrap();

        let tuning = driver.tuning(0);
        assert_eq!(tuning.sample_rate, Some(2_048_000));
        assert_eq!(tuning.center_freq, Some(100_000_000));
        assert_eq!(tuning.gain, Some(Gain::Manual(496)));
    }

    #[test]
    fn test_configure_stops_at_first_rejection() {
        let (driver, session) =
            session(MockDevice::new("v", "p", "s").reject_sample_rate(3_500_000, -22));
        session.open().unwrap();

        let err = session
            .configure(&TunerSettings::new(3_500_000, 100_000_000))
            .unwrap_err();
        assert_eq!(
            err,
            Error::Configuration {
                parameter: Parameter::SampleRate,
                code: -22
            }
        );
        assert_eq!(driver.tuning(0).center_freq, None);
    }

    #[test]
    fn test_stop_while_closed_is_invalid() {
        let (_driver, session) = session(MockDevice::new("v", "p", "s"));
        assert_eq!(
            session.stop(),
            Err(Error::InvalidState {
                attempted: Operation::Stop,
                current: SessionState::Closed
            })
        );
    }

    #[test]
    fn test_stop_while_open_is_noop() {
        let (driver, session) = session(MockDevice::new("v", "p", "s"));
        session.open().unwrap();
        assert_eq!(session.stop(), Ok(()));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(driver.cancels(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (driver, session) = session(MockDevice::new("v", "p", "s"));
        session.open().unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn test_stopper_on_closed_session_is_ignored() {
        let (driver, session) = session(MockDevice::new("v", "p", "s"));
        session.open().unwrap();
        let stopper = session.stopper();
        session.close();
        stopper.stop();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.cancels(), 0);
    }

    #[test]
    fn test_stopper_outlives_session() {
        let (_driver, session) = session(MockDevice::new("v", "p", "s"));
        let stopper = session.stopper();
        drop(session);
        stopper.stop();
    }
}
