//! Release of device handles whose session became unreachable.
//!
//! Every [`DeviceSession`](crate::DeviceSession) carries a
//! [`FinalizationGuard`]. The guard only holds a weak reference to the
//! session state, so it never keeps a session alive. When the session is
//! dropped the guard fires and releases the handle: cancel the read loop if it
//! is still running (the streaming thread then closes the handle on exit),
//! close it directly otherwise.
//!
//! The release path is idempotent. After an explicit `close()`, or a first
//! finalization, firing again does nothing. Nothing is reported to the caller
//! since there is no caller left; problems are logged.

use std::sync::{Arc, Weak};

use tracing::trace;

use crate::driver::Driver;
use crate::session::SessionCore;

/// Weak observer releasing a session's handle when the session goes away.
pub struct FinalizationGuard<D: Driver> {
    core: Weak<SessionCore<D>>,
}

impl<D: Driver> FinalizationGuard<D> {
    pub(crate) fn arm(core: &Arc<SessionCore<D>>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }

    /// Release the handle now, as the drop of the session would.
    ///
    /// The session stays usable afterwards: it is simply Closed (or closing,
    /// if it was streaming) and may be opened again.
    pub fn finalize(&self) {
        match self.core.upgrade() {
            Some(core) => core.finalize(),
            None => trace!("session state already gone, nothing to release"),
        }
    }
}

impl<D: Driver> Drop for FinalizationGuard<D> {
    fn drop(&mut self) {
        self.finalize();
    }
}
