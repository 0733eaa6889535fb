//! Hardware capability discovery.
//!
//! Probing never fails: a backend whose probe errors is simply absent from
//! the result. The registry caches the first probe because trial device
//! creation is slow (hundreds of milliseconds on some drivers).

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use cutline_common::error::CutlineResult;

use crate::backend::{decoder_name, encoder_name, HardwareBackend, HardwareDevice, VideoCodec};

/// An opened GPU device session.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    /// Backend this device belongs to.
    fn backend(&self) -> HardwareBackend;

    /// Access to the concrete handle for native session code.
    fn as_any(&self) -> &dyn Any;
}

/// Platform layer that enumerates and opens GPU devices.
pub trait DeviceProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Enumerate devices of one backend. Errors are treated as "none".
    fn probe(&self, backend: HardwareBackend) -> CutlineResult<Vec<HardwareDevice>>;

    /// Open a device session.
    fn open(&self, device: &HardwareDevice) -> CutlineResult<Box<dyn DeviceHandle>>;
}

/// Summary of what the registry discovered, for diagnostics.
#[derive(Debug, Clone)]
pub struct CapabilityReport {
    pub provider: String,
    pub devices: Vec<HardwareDevice>,
    pub available: Vec<HardwareBackend>,
    pub best: HardwareBackend,
}

/// Enumerates backends and resolves backend requests.
pub struct HardwareRegistry {
    provider: Arc<dyn DeviceProvider>,
    devices: Mutex<Option<Vec<HardwareDevice>>>,
}

impl HardwareRegistry {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            devices: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<dyn DeviceProvider> {
        &self.provider
    }

    /// All discovered devices, probing on first use.
    pub fn devices(&self) -> Vec<HardwareDevice> {
        let mut cached = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(devices) = cached.as_ref() {
            return devices.clone();
        }
        let devices = self.probe_all();
        *cached = Some(devices.clone());
        devices
    }

    /// Forget cached probe results.
    pub fn refresh(&self) {
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn probe_all(&self) -> Vec<HardwareDevice> {
        let mut found = Vec::new();
        for backend in HardwareBackend::PROBE_ORDER {
            match self.provider.probe(backend) {
                Ok(devices) => {
                    tracing::debug!(
                        provider = self.provider.name(),
                        %backend,
                        count = devices.len(),
                        "Hardware probe finished"
                    );
                    found.extend(devices);
                }
                Err(e) => {
                    tracing::debug!(
                        provider = self.provider.name(),
                        %backend,
                        error = %e,
                        "Hardware probe failed; backend unavailable"
                    );
                }
            }
        }
        found
    }

    /// Backends with at least one device, in probe order.
    pub fn list_available_backends(&self) -> Vec<HardwareBackend> {
        let devices = self.devices();
        HardwareBackend::PROBE_ORDER
            .into_iter()
            .filter(|backend| devices.iter().any(|d| d.backend == *backend))
            .collect()
    }

    /// Devices of a single backend.
    pub fn devices_for(&self, backend: HardwareBackend) -> Vec<HardwareDevice> {
        self.devices()
            .into_iter()
            .filter(|d| d.backend == backend)
            .collect()
    }

    /// First available backend by priority, else `None`.
    pub fn best_backend(&self) -> HardwareBackend {
        let available = self.list_available_backends();
        HardwareBackend::PRIORITY
            .into_iter()
            .find(|backend| available.contains(backend))
            .unwrap_or(HardwareBackend::None)
    }

    /// Resolve a request: `Auto` picks the best backend, explicit values
    /// pass through unchanged (availability is checked when opening).
    pub fn resolve(&self, requested: HardwareBackend) -> HardwareBackend {
        match requested {
            HardwareBackend::Auto => self.best_backend(),
            other => other,
        }
    }

    /// Resolve a user-facing name; unrecognized names resolve to `None`.
    pub fn resolve_name(&self, name: &str) -> HardwareBackend {
        self.resolve(HardwareBackend::parse(name))
    }

    pub fn encoder_name(&self, codec: VideoCodec, backend: HardwareBackend) -> Option<&'static str> {
        encoder_name(codec, backend)
    }

    pub fn decoder_name(&self, codec: VideoCodec, backend: HardwareBackend) -> Option<&'static str> {
        decoder_name(codec, backend)
    }

    pub fn report(&self) -> CapabilityReport {
        CapabilityReport {
            provider: self.provider.name().to_string(),
            devices: self.devices(),
            available: self.list_available_backends(),
            best: self.best_backend(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticDeviceProvider;

    fn registry(provider: SyntheticDeviceProvider) -> HardwareRegistry {
        HardwareRegistry::new(Arc::new(provider))
    }

    #[test]
    fn best_backend_prefers_cuda_then_videotoolbox_then_vaapi() {
        let all = registry(SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Vaapi,
            HardwareBackend::VideoToolbox,
            HardwareBackend::Cuda,
        ]));
        assert_eq!(all.best_backend(), HardwareBackend::Cuda);
        assert_eq!(
            all.list_available_backends(),
            vec![
                HardwareBackend::Cuda,
                HardwareBackend::Vaapi,
                HardwareBackend::VideoToolbox
            ]
        );

        let no_cuda = registry(SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Vaapi,
            HardwareBackend::VideoToolbox,
        ]));
        assert_eq!(no_cuda.best_backend(), HardwareBackend::VideoToolbox);

        let vaapi = registry(SyntheticDeviceProvider::with_backends(&[HardwareBackend::Vaapi]));
        assert_eq!(vaapi.best_backend(), HardwareBackend::Vaapi);
    }

    #[test]
    fn probe_failures_shrink_the_list() {
        let provider = SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Cuda,
            HardwareBackend::Vaapi,
        ])
        .failing_probe(HardwareBackend::Cuda);
        let reg = registry(provider);
        assert_eq!(reg.list_available_backends(), vec![HardwareBackend::Vaapi]);
        assert_eq!(reg.resolve(HardwareBackend::Auto), HardwareBackend::Vaapi);
    }

    #[test]
    fn resolve_passes_explicit_values_through() {
        let reg = registry(SyntheticDeviceProvider::unavailable());
        assert_eq!(reg.resolve(HardwareBackend::Auto), HardwareBackend::None);
        assert_eq!(reg.resolve(HardwareBackend::Vaapi), HardwareBackend::Vaapi);
        assert_eq!(reg.resolve_name("bogus"), HardwareBackend::None);
    }

    #[test]
    fn probes_are_cached_until_refresh() {
        let provider = Arc::new(SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Cuda,
        ]));
        let reg = HardwareRegistry::new(provider.clone());
        reg.list_available_backends();
        reg.best_backend();
        assert_eq!(provider.probe_calls(), 3);
        reg.refresh();
        reg.devices();
        assert_eq!(provider.probe_calls(), 6);
    }
}
