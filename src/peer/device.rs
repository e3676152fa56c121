use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ProctorError, Result};

/// A physical camera/microphone pair. Only one lease can exist at a time.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    name: String,
    in_use: Arc<AtomicBool>,
    available: Arc<AtomicBool>,
}

impl CaptureDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_use: Arc::new(AtomicBool::new(false)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Permission revoked or hardware unplugged.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_leased(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) -> Result<DeviceLease> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProctorError::DeviceUnavailable(self.name.clone()));
        }
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProctorError::DeviceBusy(self.name.clone()));
        }

        tracing::info!(device = %self.name, "Capture device acquired");
        Ok(DeviceLease {
            name: self.name.clone(),
            in_use: self.in_use.clone(),
        })
    }
}

/// Exclusive hold on a `CaptureDevice`; dropping it stops capture.
#[derive(Debug)]
pub struct DeviceLease {
    name: String,
    in_use: Arc<AtomicBool>,
}

impl DeviceLease {
    pub fn device_name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::SeqCst);
        tracing::info!(device = %self.name, "Capture device released");
    }
}
