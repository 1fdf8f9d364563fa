//! Test helper utilities for building scripted mock devices

#![allow(dead_code)]

use std::f32::consts::PI;

use rtlsdr_session::mock::{MockDevice, MockDriver};
use rtlsdr_session::{DeviceSession, SdrContext};

/// Generate `count` buffers of `len` bytes; every byte of buffer `n` is `n`.
///
/// Lets a test tell from the payload alone which driver buffer a chunk came
/// from.
pub fn numbered_buffers(count: usize, len: usize) -> Vec<Vec<u8>> {
    (0..count).map(|n| vec![n as u8; len]).collect()
}

/// Generate a complex sine wave as interleaved unsigned 8-bit I/Q bytes
///
/// # Arguments
/// * `frequency` - Frequency in Hz
/// * `sample_rate` - Sample rate in Hz
/// * `num_samples` - Number of samples to generate
pub fn generate_sine_wave_cu8(frequency: f32, sample_rate: u32, num_samples: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(num_samples * 2);
    let angular_freq = 2.0 * PI * frequency / sample_rate as f32;

    for n in 0..num_samples {
        let phase = angular_freq * n as f32;
        // Convert from [-1, 1] to [0, 255]
        buffer.push(((phase.cos() + 1.0) * 127.5) as u8);
        buffer.push(((phase.sin() + 1.0) * 127.5) as u8);
    }

    buffer
}

/// A typical dongle as reported by librtlsdr.
pub fn dongle(serial: &str) -> MockDevice {
    MockDevice::new("Realtek", "RTL2838UHIDIR", serial)
}

/// A context over a driver with the given devices, plus a clone of the driver
/// for inspecting its counters.
pub fn context_with(devices: Vec<MockDevice>) -> (MockDriver, SdrContext<MockDriver>) {
    let driver = devices
        .into_iter()
        .fold(MockDriver::new(), |driver, device| driver.with_device(device));
    (driver.clone(), SdrContext::init(driver))
}

/// An opened session on a single-device context.
pub fn open_session(device: MockDevice) -> (MockDriver, DeviceSession<MockDriver>) {
    let (driver, context) = context_with(vec![device]);
    let session = context.open(0).expect("Failed to open mock device");
    (driver, session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_buffers() {
        let buffers = numbered_buffers(3, 4);
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers[2], vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_generate_sine_wave_cu8_length() {
        let samples = generate_sine_wave_cu8(1000.0, 96000, 100);
        assert_eq!(samples.len(), 200); // 100 samples * 2 bytes per sample
    }
}
