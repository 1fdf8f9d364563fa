//! Entry point for embedding layers.
//!
//! [`SdrContext::init`] is the one explicit initialization step: it takes
//! ownership of the driver and everything else hangs off the returned
//! context. There is no hidden global state, so an embedding layer that wants
//! a single process-wide context creates one and keeps it.

use std::sync::Arc;

use tracing::{debug, info};

use crate::driver::Driver;
use crate::error::Result;
use crate::registry::{self, DeviceDescriptor, DeviceFilter};
use crate::session::DeviceSession;

/// Driver plus everything needed to create sessions on it.
pub struct SdrContext<D: Driver> {
    driver: Arc<D>,
}

impl<D: Driver> SdrContext<D> {
    /// Initialize the library on top of `driver`.
    pub fn init(driver: D) -> Self {
        info!("SDR context initialized");
        Self {
            driver: Arc::new(driver),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Enumerate the attached devices. See [`registry::list_devices`].
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        registry::list_devices(&*self.driver)
    }

    pub fn find_device(&self, filter: &DeviceFilter) -> Result<Option<DeviceDescriptor>> {
        registry::find_device(&*self.driver, filter)
    }

    /// A Closed session for an enumerated device.
    pub fn session(&self, device: &DeviceDescriptor) -> DeviceSession<D> {
        self.session_for_index(device.index)
    }

    pub fn session_for_index(&self, index: u32) -> DeviceSession<D> {
        DeviceSession::new(Arc::clone(&self.driver), index)
    }

    /// Create a session for `index` and open it.
    pub fn open(&self, index: u32) -> Result<DeviceSession<D>> {
        let session = self.session_for_index(index);
        session.open()?;
        Ok(session)
    }

    /// Callback form of [`list_devices`](Self::list_devices): the outcome is
    /// passed to `done` before this returns.
    pub fn get_devices<F>(&self, done: F)
    where
        F: FnOnce(Result<Vec<DeviceDescriptor>>),
    {
        let result = self.list_devices();
        debug!(
            "enumeration finished: {}",
            match &result {
                Ok(devices) => format!("{} device(s)", devices.len()),
                Err(e) => e.to_string(),
            }
        );
        done(result);
    }

    /// Callback form of [`open`](Self::open).
    pub fn open_with<F>(&self, index: u32, done: F)
    where
        F: FnOnce(Result<DeviceSession<D>>),
    {
        done(self.open(index));
    }
}

impl<D: Driver> Clone for SdrContext<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
        }
    }
}
