//! Device enumeration.
//!
//! [`list_devices`] takes a snapshot of the attached devices. Descriptors are
//! plain values: they go stale when devices are plugged or unplugged and are
//! never updated, so callers re-enumerate when they need a fresh view.

use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::{Error, Operation, Result};

/// Device information captured at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device index (0-based, at enumeration time)
    pub index: u32,
    /// Manufacturer string
    pub vendor: String,
    /// Product string
    pub product: String,
    /// Serial number
    pub serial: String,
    /// Display name reported by the driver
    pub name: String,
}

/// List all attached devices.
///
/// Fails fast: if the strings of any device cannot be read, the whole listing
/// fails with the index and code of that device and nothing is returned.
///
/// # Examples
///
/// ```
/// use rtlsdr_session::mock::{MockDevice, MockDriver};
/// use rtlsdr_session::registry::list_devices;
///
/// let device = MockDevice::new("Realtek", "RTL2838UHIDIR", "00000001");
/// let driver = MockDriver::new().with_device(device);
/// let devices = list_devices(&driver)?;
/// assert_eq!(devices.len(), 1);
/// assert_eq!(devices[0].serial, "00000001");
/// # Ok::<(), rtlsdr_session::Error>(())
/// ```
pub fn list_devices<D: Driver>(driver: &D) -> Result<Vec<DeviceDescriptor>> {
    let count = driver.device_count();
    debug!("driver reports {} device(s)", count);

    let mut devices = Vec::with_capacity(count as usize);
    for index in 0..count {
        let strings = driver.usb_strings(index).map_err(|code| {
            warn!("could not get strings of device {}: error {}", index, code);
            Error::driver(Operation::Enumerate, Some(index), code)
        })?;

        devices.push(DeviceDescriptor {
            index,
            vendor: strings.vendor,
            product: strings.product,
            serial: strings.serial,
            name: driver.device_name(index),
        });
    }

    Ok(devices)
}

/// Select a device by its strings. All provided filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceFilter {
    /// Filter matching a serial number only
    pub fn serial<S: Into<String>>(serial: S) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        let vendor_match = self
            .vendor
            .as_ref()
            .map(|v| device.vendor == *v)
            .unwrap_or(true);

        let product_match = self
            .product
            .as_ref()
            .map(|p| device.product == *p)
            .unwrap_or(true);

        let serial_match = self
            .serial
            .as_ref()
            .map(|s| device.serial == *s)
            .unwrap_or(true);

        vendor_match && product_match && serial_match
    }
}

/// Enumerate and return the first device matching `filter`.
pub fn find_device<D: Driver>(
    driver: &D,
    filter: &DeviceFilter,
) -> Result<Option<DeviceDescriptor>> {
    let found = list_devices(driver)?
        .into_iter()
        .find(|device| filter.matches(device));

    if found.is_none() {
        debug!(
            "no device matching vendor={:?}, product={:?}, serial={:?}",
            filter.vendor, filter.product, filter.serial
        );
    }
    Ok(found)
}
