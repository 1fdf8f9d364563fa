//! RTL-SDR hardware driver
//! (requires the `rtlsdr` feature)
//!
//! Implements the driver boundary on top of the `rtl_sdr_rs` crate for tuner
//! control and bulk reads, and `rusb` for enumeration strings.
//!
//! `rtl_sdr_rs::RtlSdr` is opened and used on a dedicated device thread;
//! [`RtlSdrHandle`] talks to it through a command channel. The read loop runs
//! synchronous bulk reads on that thread and forwards each filled buffer to
//! the thread that called `read_async`, where the callback runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use rtl_sdr_rs::{RtlSdr, TunerGain, error::RtlsdrError};
use rusb::{Context, DeviceDescriptor, UsbContext};
use tracing::{debug, trace, warn};

use crate::driver::{Driver, DriverHandle, DriverResult, Gain, UsbStrings};
use crate::error::LibusbErrorCode;

// Devices rtl_sdr_rs knows how to open, in its index order.
const KNOWN_DEVICES: &[(u16, u16, &str)] = &[
    (0x0bda, 0x2832, "Generic RTL2832U"),
    (0x0bda, 0x2838, "Generic RTL2832U OEM"),
];

fn known_device(desc: &DeviceDescriptor) -> Option<&'static str> {
    KNOWN_DEVICES
        .iter()
        .find(|&&(vid, pid, _)| vid == desc.vendor_id() && pid == desc.product_id())
        .map(|&(_, _, name)| name)
}

/// Map a libusb error to its numeric code.
pub fn usb_error_code(err: rusb::Error) -> i32 {
    let code = match err {
        rusb::Error::Io => LibusbErrorCode::Io,
        rusb::Error::InvalidParam => LibusbErrorCode::InvalidParam,
        rusb::Error::Access => LibusbErrorCode::Access,
        rusb::Error::NoDevice => LibusbErrorCode::NoDevice,
        rusb::Error::NotFound => LibusbErrorCode::NotFound,
        rusb::Error::Busy => LibusbErrorCode::Busy,
        rusb::Error::Timeout => LibusbErrorCode::Timeout,
        rusb::Error::Overflow => LibusbErrorCode::Overflow,
        rusb::Error::Pipe => LibusbErrorCode::Pipe,
        rusb::Error::Interrupted => LibusbErrorCode::Interrupted,
        rusb::Error::NoMem => LibusbErrorCode::NoMem,
        rusb::Error::NotSupported => LibusbErrorCode::NotSupported,
        _ => LibusbErrorCode::Other,
    };
    code.code()
}

// rtl_sdr_rs reports errors without a numeric status; use librtlsdr's generic -1.
fn rtl_error_code(what: &str, err: RtlsdrError) -> i32 {
    debug!("{} failed: {}", what, err);
    LibusbErrorCode::Io.code()
}

/// Driver for RTL2832U-based dongles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtlSdrDriver;

impl RtlSdrDriver {
    pub fn new() -> Self {
        Self
    }

    fn devices() -> rusb::Result<Vec<(rusb::Device<Context>, DeviceDescriptor)>> {
        let context = Context::new()?;
        let mut found = Vec::new();
        for device in context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if known_device(&desc).is_some() {
                found.push((device, desc));
            }
        }
        Ok(found)
    }

    fn device(index: u32) -> DriverResult<(rusb::Device<Context>, DeviceDescriptor)> {
        Self::devices()
            .map_err(usb_error_code)?
            .into_iter()
            .nth(index as usize)
            .ok_or(LibusbErrorCode::InvalidParam.code())
    }
}

impl Driver for RtlSdrDriver {
    type Handle = RtlSdrHandle;

    fn device_count(&self) -> u32 {
        match Self::devices() {
            Ok(devices) => devices.len() as u32,
            Err(e) => {
                warn!("USB enumeration failed: {}", e);
                0
            }
        }
    }

    fn usb_strings(&self, index: u32) -> DriverResult<UsbStrings> {
        let (device, desc) = Self::device(index)?;
        let handle = device.open().map_err(usb_error_code)?;

        let read = |string_index: Option<u8>| -> DriverResult<String> {
            match string_index {
                Some(idx) => handle
                    .read_string_descriptor_ascii(idx)
                    .map_err(usb_error_code),
                None => Ok(String::new()),
            }
        };

        Ok(UsbStrings {
            vendor: read(desc.manufacturer_string_index())?,
            product: read(desc.product_string_index())?,
            serial: read(desc.serial_number_string_index())?,
        })
    }

    fn device_name(&self, index: u32) -> String {
        Self::device(index)
            .ok()
            .and_then(|(_, desc)| known_device(&desc))
            .unwrap_or_default()
            .to_string()
    }

    fn open(&self, index: u32) -> DriverResult<RtlSdrHandle> {
        RtlSdrHandle::open(index)
    }
}

type Reply = Sender<DriverResult<()>>;

enum Command {
    SetSampleRate(u32, Reply),
    SetCenterFreq(u32, Reply),
    SetTunerGain(Gain, Reply),
    ResetBuffer(Reply),
    Read {
        buf_len: usize,
        buffers: Sender<DriverResult<Vec<u8>>>,
    },
}

/// An opened RTL-SDR device.
pub struct RtlSdrHandle {
    index: u32,
    commands: Sender<Command>,
    cancelled: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RtlSdrHandle {
    fn open(index: u32) -> DriverResult<Self> {
        let (commands, rx) = channel::unbounded::<Command>();
        let (tx_init, rx_init) = channel::bounded::<DriverResult<()>>(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let loop_cancelled = Arc::clone(&cancelled);

        let thread = std::thread::spawn(move || {
            match RtlSdr::open_with_index(index as usize) {
                Ok(rtl) => {
                    let _ = tx_init.send(Ok(()));
                    device_thread(rtl, rx, loop_cancelled);
                }
                Err(e) => {
                    let _ = tx_init.send(Err(rtl_error_code("open", e)));
                }
            }
        });

        match rx_init.recv() {
            Ok(Ok(())) => Ok(Self {
                index,
                commands,
                cancelled,
                thread,
            }),
            Ok(Err(code)) => Err(code),
            Err(_) => Err(LibusbErrorCode::Other.code()),
        }
    }

    fn call(&self, command: impl FnOnce(Reply) -> Command) -> DriverResult<()> {
        let (reply, response) = channel::bounded(1);
        self.commands
            .send(command(reply))
            .map_err(|_| LibusbErrorCode::NoDevice.code())?;
        response
            .recv()
            .unwrap_or(Err(LibusbErrorCode::NoDevice.code()))
    }
}

fn device_thread(mut rtl: RtlSdr, commands: Receiver<Command>, cancelled: Arc<AtomicBool>) {
    for command in commands {
        match command {
            Command::SetSampleRate(rate, reply) => {
                let result = rtl
                    .set_sample_rate(rate)
                    .map_err(|e| rtl_error_code("set sample rate", e));
                let _ = reply.send(result);
            }
            Command::SetCenterFreq(freq, reply) => {
                let result = rtl
                    .set_center_freq(freq)
                    .map_err(|e| rtl_error_code("set center frequency", e));
                let _ = reply.send(result);
            }
            Command::SetTunerGain(gain, reply) => {
                let gain = match gain {
                    Gain::Auto => TunerGain::Auto,
                    Gain::Manual(tenths) => TunerGain::Manual(tenths),
                };
                let result = rtl
                    .set_tuner_gain(gain)
                    .map_err(|e| rtl_error_code("set tuner gain", e));
                let _ = reply.send(result);
            }
            Command::ResetBuffer(reply) => {
                let result = rtl
                    .reset_buffer()
                    .map_err(|e| rtl_error_code("reset buffer", e));
                let _ = reply.send(result);
            }
            Command::Read { buf_len, buffers } => {
                while !cancelled.load(Ordering::Acquire) {
                    let mut buf = vec![0u8; buf_len];
                    match rtl.read_sync(&mut buf) {
                        Ok(0) => std::thread::yield_now(),
                        Ok(n) => {
                            buf.truncate(n);
                            if buffers.send(Ok(buf)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = buffers.send(Err(rtl_error_code("bulk read", e)));
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("RTL-SDR device thread exiting");
}

impl DriverHandle for RtlSdrHandle {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()> {
        self.call(|reply| Command::SetSampleRate(rate, reply))
    }

    fn set_center_freq(&self, freq: u32) -> DriverResult<()> {
        self.call(|reply| Command::SetCenterFreq(freq, reply))
    }

    fn set_tuner_gain(&self, gain: Gain) -> DriverResult<()> {
        self.call(|reply| Command::SetTunerGain(gain, reply))
    }

    fn reset_buffer(&self) -> DriverResult<()> {
        self.cancelled.store(false, Ordering::Release);
        self.call(Command::ResetBuffer)
    }

    fn read_async(
        &self,
        callback: &mut dyn FnMut(&[u8]),
        buf_num: u32,
        buf_len: u32,
    ) -> DriverResult<()> {
        if buf_len == 0 {
            return Err(LibusbErrorCode::InvalidParam.code());
        }
        let (tx, buffers) = channel::bounded(buf_num.max(1) as usize);
        self.commands
            .send(Command::Read {
                buf_len: buf_len as usize,
                buffers: tx,
            })
            .map_err(|_| LibusbErrorCode::NoDevice.code())?;

        // Ends when the device thread leaves its read loop and drops the sender.
        for item in buffers {
            match item {
                Ok(buf) => callback(&buf),
                Err(code) => return Err(code),
            }
        }
        trace!("device {} read loop returned", self.index);
        Ok(())
    }

    fn cancel_async(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn close(self) {
        let Self {
            index,
            commands,
            thread,
            ..
        } = self;
        // Closing the command channel ends the device thread, which drops
        // (and thereby closes) the device.
        drop(commands);
        if thread.join().is_err() {
            warn!("device {} thread panicked", index);
        }
        debug!("device {} closed", index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_codes() {
        assert_eq!(usb_error_code(rusb::Error::Busy), -6);
        assert_eq!(usb_error_code(rusb::Error::NoDevice), -4);
        assert_eq!(usb_error_code(rusb::Error::Other), -99);
    }

    #[test]
    fn test_known_device_names() {
        assert!(KNOWN_DEVICES.iter().any(|&(_, pid, _)| pid == 0x2838));
    }
}
