//! In-process device provider that needs no GPU.
//!
//! Used to force hardware availability (or unavailability) in dry runs and
//! tests. Devices record their release into a [`LifecycleLog`] so teardown
//! order can be inspected.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cutline_common::error::{CutlineError, CutlineResult};

use crate::backend::{HardwareBackend, HardwareDevice};
use crate::registry::{DeviceHandle, DeviceProvider};

/// Ordered record of lifecycle events, shareable across components.
#[derive(Debug, Clone, Default)]
pub struct LifecycleLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl LifecycleLog {
    pub fn record(&self, event: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Index of the first entry equal to `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == event)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// A device that exists only in memory.
#[derive(Debug)]
pub struct SyntheticDevice {
    backend: HardwareBackend,
    log: Option<LifecycleLog>,
}

impl DeviceHandle for SyntheticDevice {
    fn backend(&self) -> HardwareBackend {
        self.backend
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        if let Some(log) = &self.log {
            log.record("context.release");
        }
    }
}

/// Provider reporting a fixed set of backends.
#[derive(Debug, Default)]
pub struct SyntheticDeviceProvider {
    backends: Vec<HardwareBackend>,
    failing_probes: HashSet<HardwareBackend>,
    fail_open: bool,
    log: Option<LifecycleLog>,
    probe_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl SyntheticDeviceProvider {
    /// A provider with no hardware at all.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// One device for each listed backend.
    pub fn with_backends(backends: &[HardwareBackend]) -> Self {
        Self {
            backends: backends.iter().copied().filter(|b| b.is_hardware()).collect(),
            ..Self::default()
        }
    }

    /// Make the probe for `backend` return an error.
    pub fn failing_probe(mut self, backend: HardwareBackend) -> Self {
        self.failing_probes.insert(backend);
        self
    }

    /// Make every device open fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

impl DeviceProvider for SyntheticDeviceProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn probe(&self, backend: HardwareBackend) -> CutlineResult<Vec<HardwareDevice>> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_probes.contains(&backend) {
            return Err(CutlineError::hardware(format!(
                "synthetic probe failure for {backend}"
            )));
        }
        if self.backends.contains(&backend) {
            Ok(vec![HardwareDevice::with_default_path(backend, 0)])
        } else {
            Ok(Vec::new())
        }
    }

    fn open(&self, device: &HardwareDevice) -> CutlineResult<Box<dyn DeviceHandle>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open || !self.backends.contains(&device.backend) {
            return Err(CutlineError::hardware(format!(
                "synthetic {} device {} cannot be opened",
                device.backend, device.index
            )));
        }
        Ok(Box::new(SyntheticDevice {
            backend: device.backend,
            log: self.log.clone(),
        }))
    }
}
