//! In-memory driver for tests and demos.
//!
//! [`MockDriver`] behaves like librtlsdr from the session's point of view:
//! a device can be opened by one holder at a time (a second open fails with
//! `LIBUSB_ERROR_BUSY`), the read loop delivers scripted buffers through one
//! reused scratch buffer, and `cancel_async` makes the loop return before the
//! next buffer. Every failure can be scripted per device, and the driver
//! counts opens, closes, cancels and buffer resets for assertions.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::driver::{Driver, DriverHandle, DriverResult, Gain, UsbStrings};
use crate::error::LibusbErrorCode;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted behaviour of one mock device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    strings: UsbStrings,
    name: String,
    strings_error: Option<i32>,
    open_error: Option<i32>,
    rejected_sample_rate: Option<(u32, i32)>,
    rejected_center_freq: Option<(u32, i32)>,
    gain_error: Option<i32>,
    reset_error: Option<i32>,
    read_error: Option<i32>,
    buffers: Vec<Vec<u8>>,
    until_cancelled: bool,
}

impl MockDevice {
    pub fn new(vendor: &str, product: &str, serial: &str) -> Self {
        Self {
            strings: UsbStrings {
                vendor: vendor.to_string(),
                product: product.to_string(),
                serial: serial.to_string(),
            },
            name: "Generic RTL2832U OEM".to_string(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Buffers delivered, in order, by every read loop run.
    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Keep the read loop blocked after the scripted buffers until cancelled,
    /// like real hardware that never runs out of samples.
    pub fn stream_until_cancelled(mut self) -> Self {
        self.until_cancelled = true;
        self
    }

    pub fn fail_usb_strings(mut self, code: i32) -> Self {
        self.strings_error = Some(code);
        self
    }

    pub fn fail_open(mut self, code: i32) -> Self {
        self.open_error = Some(code);
        self
    }

    pub fn reject_sample_rate(mut self, rate: u32, code: i32) -> Self {
        self.rejected_sample_rate = Some((rate, code));
        self
    }

    pub fn reject_center_freq(mut self, freq: u32, code: i32) -> Self {
        self.rejected_center_freq = Some((freq, code));
        self
    }

    pub fn fail_tuner_gain(mut self, code: i32) -> Self {
        self.gain_error = Some(code);
        self
    }

    pub fn fail_reset_buffer(mut self, code: i32) -> Self {
        self.reset_error = Some(code);
        self
    }

    /// Make the read loop fail with `code` after the scripted buffers.
    pub fn fail_read(mut self, code: i32) -> Self {
        self.read_error = Some(code);
        self
    }
}

/// Tuner settings last accepted by a mock device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tuning {
    pub sample_rate: Option<u32>,
    pub center_freq: Option<u32>,
    pub gain: Option<Gain>,
}

#[derive(Default)]
struct MockState {
    devices: Mutex<Vec<MockDevice>>,
    open: Mutex<BTreeSet<u32>>,
    tuning: Mutex<HashMap<u32, Tuning>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    cancels: AtomicUsize,
    resets: AtomicUsize,
}

/// Scriptable driver. Clones share the same devices and counters.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device at the next index.
    pub fn with_device(self, device: MockDevice) -> Self {
        lock(&self.state.devices).push(device);
        self
    }

    /// Detach every device. Sessions already open keep their handles.
    pub fn unplug_all(&self) {
        lock(&self.state.devices).clear();
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.state.resets.load(Ordering::SeqCst)
    }

    /// Indices currently held open.
    pub fn open_devices(&self) -> Vec<u32> {
        lock(&self.state.open).iter().copied().collect()
    }

    pub fn tuning(&self, index: u32) -> Tuning {
        lock(&self.state.tuning)
            .get(&index)
            .copied()
            .unwrap_or_default()
    }

    fn device(&self, index: u32) -> Option<MockDevice> {
        lock(&self.state.devices).get(index as usize).cloned()
    }
}

impl Driver for MockDriver {
    type Handle = MockHandle;

    fn device_count(&self) -> u32 {
        lock(&self.state.devices).len() as u32
    }

    fn usb_strings(&self, index: u32) -> DriverResult<UsbStrings> {
        let device = self
            .device(index)
            .ok_or(LibusbErrorCode::InvalidParam.code())?;
        match device.strings_error {
            Some(code) => Err(code),
            None => Ok(device.strings),
        }
    }

    fn device_name(&self, index: u32) -> String {
        self.device(index).map(|d| d.name).unwrap_or_default()
    }

    fn open(&self, index: u32) -> DriverResult<MockHandle> {
        let device = self.device(index).ok_or(LibusbErrorCode::NotFound.code())?;
        if let Some(code) = device.open_error {
            return Err(code);
        }
        if !lock(&self.state.open).insert(index) {
            return Err(LibusbErrorCode::Busy.code());
        }

        self.state.opens.fetch_add(1, Ordering::SeqCst);
        trace!("mock device {} opened", index);
        Ok(MockHandle {
            index,
            device,
            state: Arc::clone(&self.state),
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        })
    }
}

/// Handle of an opened mock device.
pub struct MockHandle {
    index: u32,
    device: MockDevice,
    state: Arc<MockState>,
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl MockHandle {
    fn update_tuning(&self, update: impl FnOnce(&mut Tuning)) {
        update(lock(&self.state.tuning).entry(self.index).or_default());
    }

    fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }
}

impl DriverHandle for MockHandle {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()> {
        match self.device.rejected_sample_rate {
            Some((rejected, code)) if rejected == rate => Err(code),
            _ => {
                self.update_tuning(|t| t.sample_rate = Some(rate));
                Ok(())
            }
        }
    }

    fn set_center_freq(&self, freq: u32) -> DriverResult<()> {
        match self.device.rejected_center_freq {
            Some((rejected, code)) if rejected == freq => Err(code),
            _ => {
                self.update_tuning(|t| t.center_freq = Some(freq));
                Ok(())
            }
        }
    }

    fn set_tuner_gain(&self, gain: Gain) -> DriverResult<()> {
        if let Some(code) = self.device.gain_error {
            return Err(code);
        }
        self.update_tuning(|t| t.gain = Some(gain));
        Ok(())
    }

    fn reset_buffer(&self) -> DriverResult<()> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.device.reset_error {
            return Err(code);
        }
        // A new run starts uncancelled; later cancels are never lost.
        *lock(&self.cancelled) = false;
        Ok(())
    }

    fn read_async(
        &self,
        callback: &mut dyn FnMut(&[u8]),
        _buf_num: u32,
        _buf_len: u32,
    ) -> DriverResult<()> {
        let mut scratch = Vec::new();
        for buf in &self.device.buffers {
            if self.is_cancelled() {
                return Ok(());
            }
            scratch.clear();
            scratch.extend_from_slice(buf);
            callback(scratch.as_slice());
        }

        if let Some(code) = self.device.read_error {
            return Err(code);
        }

        if self.device.until_cancelled {
            let mut cancelled = lock(&self.cancelled);
            while !*cancelled {
                cancelled = self
                    .wake
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        Ok(())
    }

    fn cancel_async(&self) {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        *lock(&self.cancelled) = true;
        self.wake.notify_all();
    }

    fn close(self) {
        lock(&self.state.open).remove(&self.index);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        trace!("mock device {} closed", self.index);
    }
}
