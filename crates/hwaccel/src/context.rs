//! Process-wide hardware device context.
//!
//! A [`HardwareContextManager`] owns at most one live device session. Every
//! decoder and encoder that runs on the GPU holds a [`HardwareContext`]
//! clone; the device is released when the manager has been reset *and* the
//! last session has dropped its clone, never earlier.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::backend::{HardwareBackend, HardwareDevice};
use crate::registry::{DeviceHandle, DeviceProvider, HardwareRegistry};

/// What the caller asks the manager for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextRequest {
    pub backend: HardwareBackend,
    pub device_index: u32,
}

impl ContextRequest {
    pub fn new(backend: HardwareBackend, device_index: u32) -> Self {
        Self {
            backend,
            device_index,
        }
    }
}

impl From<&cutline_common::config::HardwareConfig> for ContextRequest {
    fn from(config: &cutline_common::config::HardwareConfig) -> Self {
        Self::new(HardwareBackend::parse(&config.backend), config.device_index)
    }
}

struct ContextInner {
    device: HardwareDevice,
    handle: Box<dyn DeviceHandle>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        tracing::info!(
            backend = %self.device.backend,
            index = self.device.index,
            "Hardware context released"
        );
    }
}

/// Reference-counted handle to the shared device session.
#[derive(Clone)]
pub struct HardwareContext {
    inner: Arc<ContextInner>,
}

impl HardwareContext {
    fn new(device: HardwareDevice, handle: Box<dyn DeviceHandle>) -> Self {
        Self {
            inner: Arc::new(ContextInner { device, handle }),
        }
    }

    pub fn backend(&self) -> HardwareBackend {
        self.inner.device.backend
    }

    pub fn device(&self) -> &HardwareDevice {
        &self.inner.device
    }

    pub fn handle(&self) -> &dyn DeviceHandle {
        self.inner.handle.as_ref()
    }

    /// Concrete device handle, for native session code.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.inner.handle.as_any().downcast_ref::<T>()
    }

    /// Number of live holders, including the manager.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_session(&self, other: &HardwareContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HardwareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareContext")
            .field("device", &self.inner.device)
            .field("holders", &self.holders())
            .finish()
    }
}

/// Owner of the single shared GPU context. All mutation is mutex-guarded.
pub struct HardwareContextManager {
    registry: HardwareRegistry,
    current: Mutex<Option<HardwareContext>>,
}

static NAMED_MANAGERS: OnceLock<Mutex<HashMap<String, Arc<HardwareContextManager>>>> =
    OnceLock::new();

impl HardwareContextManager {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self::with_registry(HardwareRegistry::new(provider))
    }

    pub fn with_registry(registry: HardwareRegistry) -> Self {
        Self {
            registry,
            current: Mutex::new(None),
        }
    }

    /// Convenience lookup of a process-wide manager by name.
    ///
    /// The provider is only used when `name` has not been registered yet.
    pub fn named(name: &str, provider: impl FnOnce() -> Arc<dyn DeviceProvider>) -> Arc<Self> {
        let managers = NAMED_MANAGERS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut managers = managers.lock().unwrap_or_else(|e| e.into_inner());
        managers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Self::new(provider())))
            .clone()
    }

    pub fn registry(&self) -> &HardwareRegistry {
        &self.registry
    }

    /// Create the shared context if needed.
    ///
    /// Returns `false` (leaving the manager uninitialized) when no backend
    /// resolves or the device cannot be opened, so callers can continue in
    /// software.
    pub fn initialize(&self, request: ContextRequest) -> bool {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = current.as_ref() {
            if request.backend == HardwareBackend::Auto || request.backend == existing.backend() {
                return true;
            }
            tracing::warn!(
                existing = %existing.backend(),
                requested = %request.backend,
                "Hardware context re-initialized with a different backend; tearing down the old one"
            );
            *current = None;
        }

        let backend = self.registry.resolve(request.backend);
        if !backend.is_hardware() {
            tracing::debug!(requested = %request.backend, "No hardware backend to initialize");
            return false;
        }

        let device = self
            .registry
            .devices_for(backend)
            .into_iter()
            .find(|d| d.index == request.device_index)
            .unwrap_or_else(|| HardwareDevice::with_default_path(backend, request.device_index));

        match self.registry.provider().open(&device) {
            Ok(handle) => {
                tracing::info!(%backend, index = device.index, "Hardware context created");
                *current = Some(HardwareContext::new(device, handle));
                true
            }
            Err(e) => {
                tracing::warn!(%backend, error = %e, "Failed to create hardware context");
                false
            }
        }
    }

    /// The shared context, if one is live.
    pub fn shared_context(&self) -> Option<HardwareContext> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Backend of the live context, or `None`.
    pub fn backend(&self) -> HardwareBackend {
        self.shared_context()
            .map(|ctx| ctx.backend())
            .unwrap_or(HardwareBackend::None)
    }

    /// Drop the manager's reference. Idempotent. Sessions still holding a
    /// clone keep the device alive until they are torn down.
    pub fn reset(&self) {
        let released = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ctx) = released {
            let remaining = ctx.holders() - 1;
            if remaining > 0 {
                tracing::debug!(
                    backend = %ctx.backend(),
                    remaining,
                    "Hardware context reset; sessions still hold references"
                );
            }
        }
    }
}

impl Drop for HardwareContextManager {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{LifecycleLog, SyntheticDeviceProvider};

    fn manager(provider: SyntheticDeviceProvider) -> HardwareContextManager {
        HardwareContextManager::new(Arc::new(provider))
    }

    #[test]
    fn initialize_is_idempotent_for_same_backend() {
        let provider = Arc::new(SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Cuda,
        ]));
        let mgr = HardwareContextManager::new(provider.clone());
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Cuda, 0)));
        let first = mgr.shared_context().unwrap();
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Cuda, 0)));
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Auto, 0)));
        assert!(first.same_session(&mgr.shared_context().unwrap()));
        assert_eq!(provider.open_calls(), 1);
    }

    #[test]
    fn switching_backend_replaces_context() {
        let mgr = manager(SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Cuda,
            HardwareBackend::Vaapi,
        ]));
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Cuda, 0)));
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Vaapi, 0)));
        assert_eq!(mgr.backend(), HardwareBackend::Vaapi);
    }

    #[test]
    fn failure_leaves_manager_uninitialized() {
        let mgr = manager(
            SyntheticDeviceProvider::with_backends(&[HardwareBackend::Cuda]).failing_open(),
        );
        assert!(!mgr.initialize(ContextRequest::new(HardwareBackend::Cuda, 0)));
        assert!(!mgr.is_initialized());
        assert!(mgr.shared_context().is_none());

        let none = manager(SyntheticDeviceProvider::unavailable());
        assert!(!none.initialize(ContextRequest::new(HardwareBackend::Auto, 0)));
        assert!(!none.initialize(ContextRequest::new(HardwareBackend::None, 0)));
    }

    #[test]
    fn context_outlives_reset_while_sessions_hold_it() {
        let log = LifecycleLog::default();
        let mgr = manager(
            SyntheticDeviceProvider::with_backends(&[HardwareBackend::Cuda]).with_log(log.clone()),
        );
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Auto, 0)));
        let session = mgr.shared_context().unwrap();
        assert_eq!(session.holders(), 2);

        mgr.reset();
        mgr.reset();
        assert!(log.entries().is_empty());
        assert_eq!(session.holders(), 1);

        drop(session);
        assert_eq!(log.entries(), vec!["context.release".to_string()]);
    }

    #[test]
    fn named_lookup_returns_the_same_manager() {
        let a = HardwareContextManager::named("context-tests", || {
            Arc::new(SyntheticDeviceProvider::unavailable())
        });
        let b = HardwareContextManager::named("context-tests", || {
            panic!("provider factory must not run twice")
        });
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn concurrent_lookups_see_one_context() {
        let mgr = Arc::new(manager(SyntheticDeviceProvider::with_backends(&[
            HardwareBackend::Cuda,
        ])));
        assert!(mgr.initialize(ContextRequest::new(HardwareBackend::Cuda, 0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || mgr.shared_context().unwrap())
            })
            .collect();
        let contexts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let reference = mgr.shared_context().unwrap();
        assert!(contexts.iter().all(|c| c.same_session(&reference)));
    }
}
