//! Backend selection and fallback
//!
//! The selector is the only stateful owner of hardware access. It tries its
//! providers in preference order, caches the winning handle and lends it out
//! one transaction at a time behind a bounded-wait lock. Attempt failures
//! never escape `acquire`; they are kept as reasons for status reporting.
//! A kind that fails to open several times in a row is no longer tried
//! until the forced kind changes or the selector is shut down.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Availability, BackendHandle, BackendProvider, DirectDriverProvider, SignedModuleProvider};
use crate::constants::timing;
use crate::data::{BackendKind, BackendStatus};
use crate::error::{OmenError, Result};

const REMEDIATION: &str = "Install the signed hardware-access module (libomen_hwaccess.so) \
into /usr/lib/omenfan, or load the omen_hwaccess kernel driver, then restart omenfand as root";

#[derive(Default)]
struct SelectorState {
    handle: Option<BackendHandle>,
    forced: Option<BackendKind>,
    /// Per-kind reason from the last failed attempt
    failures: Vec<(BackendKind, String)>,
    consecutive_failures: HashMap<BackendKind, u32>,
}

impl SelectorState {
    fn record_failure(&mut self, kind: BackendKind, reason: String) {
        self.failures.retain(|(k, _)| *k != kind);
        self.failures.push((kind, reason));
    }

    fn record_open_failure(&mut self, kind: BackendKind, reason: String) {
        self.record_failure(kind, reason);
        let count = self.consecutive_failures.entry(kind).or_insert(0);
        *count += 1;
        if *count == timing::BACKEND_DISABLE_AFTER {
            warn!(kind = %kind, failures = *count, "Backend disabled after repeated open failures");
        }
    }

    fn is_disabled(&self, kind: BackendKind) -> bool {
        self.consecutive_failures
            .get(&kind)
            .map_or(false, |&count| count >= timing::BACKEND_DISABLE_AFTER)
    }

    fn reset_failures(&mut self) {
        self.failures.clear();
        self.consecutive_failures.clear();
    }

    fn failure_summary(&self) -> String {
        if self.failures.is_empty() {
            return "no backend has been tried".to_string();
        }
        self.failures
            .iter()
            .map(|(kind, reason)| {
                if self.is_disabled(*kind) {
                    format!("{}: {} (disabled)", kind, reason)
                } else {
                    format!("{}: {}", kind, reason)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct BackendSelector {
    providers: Vec<Box<dyn BackendProvider>>,
    state: Mutex<SelectorState>,
    lock_timeout: Duration,
}

impl BackendSelector {
    /// Selector over `providers`, earlier entries preferred
    pub fn new(providers: Vec<Box<dyn BackendProvider>>) -> Self {
        Self {
            providers,
            state: Mutex::new(SelectorState::default()),
            lock_timeout: timing::BACKEND_LOCK_TIMEOUT,
        }
    }

    /// Signed module first, then the legacy driver
    pub fn with_default_providers(signed: SignedModuleProvider, driver: DirectDriverProvider) -> Self {
        Self::new(vec![Box::new(signed), Box::new(driver)])
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Restrict selection to one kind, or `None` for preference order
    ///
    /// Also re-enables kinds disabled after repeated open failures.
    pub fn set_forced(&self, kind: Option<BackendKind>) {
        let mut state = self.state.lock();
        let kind = kind.filter(|k| *k != BackendKind::None);
        if let (Some(forced), Some(handle)) = (kind, state.handle.as_ref()) {
            if handle.kind() != forced {
                info!(from = %handle.kind(), to = %forced, "Forced backend differs, dropping active handle");
                state.handle = None;
            }
        }
        state.forced = kind;
        state.consecutive_failures.clear();
    }

    pub fn forced(&self) -> Option<BackendKind> {
        self.state.lock().forced
    }

    /// Make sure a backend is open; returns the active kind
    pub fn acquire(&self) -> Option<BackendKind> {
        let mut state = self.state.try_lock_for(self.lock_timeout)?;
        self.acquire_locked(&mut state, None)
    }

    /// Try only `kind`, ignoring preference order
    pub fn acquire_preferred(&self, kind: BackendKind) -> Option<BackendKind> {
        let mut state = self.state.try_lock_for(self.lock_timeout)?;
        self.acquire_locked(&mut state, Some(kind))
    }

    fn acquire_locked(&self, state: &mut SelectorState, preferred: Option<BackendKind>) -> Option<BackendKind> {
        let wanted = preferred.or(state.forced);

        if let Some(handle) = state.handle.as_ref() {
            let kind_matches = wanted.map_or(true, |k| k == handle.kind());
            if handle.is_available() && kind_matches {
                return Some(handle.kind());
            }
            debug!(kind = %handle.kind(), "Closing stale backend handle");
        }
        state.handle = None;

        let mut attempted = false;
        let candidates: Vec<&dyn BackendProvider> = match wanted {
            Some(kind) => {
                let matching: Vec<&dyn BackendProvider> = self
                    .providers
                    .iter()
                    .filter(|p| p.kind() == kind)
                    .map(|p| p.as_ref())
                    .collect();
                if matching.is_empty() {
                    state.record_failure(kind, "no provider for this backend kind".to_string());
                    attempted = true;
                }
                matching
            }
            None => self.providers.iter().map(|p| p.as_ref()).collect(),
        };

        for provider in candidates {
            let kind = provider.kind();
            if state.is_disabled(kind) {
                continue;
            }
            attempted = true;
            let mut backend = provider.create();
            match backend.open() {
                Ok(Availability::Available) => {
                    info!(kind = %kind, "Hardware backend acquired");
                    state.failures.retain(|(k, _)| *k != kind);
                    state.consecutive_failures.remove(&kind);
                    state.handle = Some(BackendHandle::new(backend));
                    return Some(kind);
                }
                Ok(Availability::Unavailable(reason)) => {
                    debug!(kind = %kind, reason = %reason, "Backend unavailable");
                    backend.close();
                    state.record_open_failure(kind, reason);
                }
                Err(e) => {
                    debug!(kind = %kind, error = %e, "Backend open failed");
                    backend.close();
                    state.record_open_failure(kind, e.to_string());
                }
            }
        }

        if attempted {
            warn!(reasons = %state.failure_summary(), "No hardware backend available");
        }
        None
    }

    /// Run one transaction against the active handle
    ///
    /// Acquires a backend first if none is open. The lock is held only for
    /// the duration of `f`.
    pub fn with_handle<T>(&self, f: impl FnOnce(&mut BackendHandle) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| OmenError::Busy("backend I/O lock".to_string()))?;

        if self.acquire_locked(&mut state, None).is_none() {
            return Err(OmenError::unavailable(state.failure_summary()));
        }
        match state.handle.as_mut() {
            Some(handle) => f(handle),
            None => Err(OmenError::unavailable(state.failure_summary())),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state
            .try_lock_for(self.lock_timeout)
            .map_or(false, |s| s.handle.as_ref().map_or(false, |h| h.is_available()))
    }

    pub fn active_kind(&self) -> BackendKind {
        self.state
            .try_lock_for(self.lock_timeout)
            .and_then(|s| s.handle.as_ref().map(|h| h.kind()))
            .unwrap_or(BackendKind::None)
    }

    /// Current selection with remediation text when nothing is open
    pub fn status(&self) -> BackendStatus {
        let Some(state) = self.state.try_lock_for(self.lock_timeout) else {
            return BackendStatus::unavailable("Backend busy; status unavailable");
        };
        match state.handle.as_ref() {
            Some(handle) if handle.is_available() => BackendStatus {
                kind: handle.kind(),
                available: true,
                status_message: format!("Using {} backend", handle.kind()),
            },
            _ => BackendStatus::unavailable(format!(
                "No hardware backend available ({}). {}",
                state.failure_summary(),
                REMEDIATION
            )),
        }
    }

    /// Close and clear everything; safe to call any number of times
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            info!(kind = %handle.kind(), "Shutting down hardware backend");
        }
        state.reset_failures();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Authorized, RegisterAddress, RegisterBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeProvider {
        kind: BackendKind,
        available: bool,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeProvider {
        fn boxed(kind: BackendKind, available: bool) -> (Box<dyn BackendProvider>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let opens = Arc::new(AtomicUsize::new(0));
            let closes = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                kind,
                available,
                opens: opens.clone(),
                closes: closes.clone(),
            };
            (Box::new(provider), opens, closes)
        }
    }

    struct FakeBackend {
        kind: BackendKind,
        available: bool,
        open: bool,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl BackendProvider for FakeProvider {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn create(&self) -> Box<dyn RegisterBackend> {
            Box::new(FakeBackend {
                kind: self.kind,
                available: self.available,
                open: false,
                opens: self.opens.clone(),
                closes: self.closes.clone(),
            })
        }
    }

    impl RegisterBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn open(&mut self) -> Result<Availability> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.available {
                self.open = true;
                Ok(Availability::Available)
            } else {
                Ok(Availability::Unavailable(format!("{} missing", self.kind)))
            }
        }
        fn is_available(&self) -> bool {
            self.open
        }
        fn close(&mut self) {
            if self.open {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            self.open = false;
        }
        fn read_ec(&mut self, _addr: RegisterAddress) -> Result<u8> {
            Ok(42)
        }
        fn write_ec(&mut self, _addr: Authorized<RegisterAddress>, _value: u8) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_prefers_first_available_provider() {
        let (signed, signed_opens, _) = FakeProvider::boxed(BackendKind::SignedModule, true);
        let (driver, driver_opens, _) = FakeProvider::boxed(BackendKind::DirectDriver, true);
        let selector = BackendSelector::new(vec![signed, driver]);

        assert_eq!(selector.acquire(), Some(BackendKind::SignedModule));
        assert_eq!(signed_opens.load(Ordering::SeqCst), 1);
        assert_eq!(driver_opens.load(Ordering::SeqCst), 0);

        // Cached handle is reused
        assert_eq!(selector.acquire(), Some(BackendKind::SignedModule));
        assert_eq!(signed_opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_falls_back_and_retains_reason() {
        let (signed, _, _) = FakeProvider::boxed(BackendKind::SignedModule, false);
        let (driver, _, _) = FakeProvider::boxed(BackendKind::DirectDriver, true);
        let selector = BackendSelector::new(vec![signed, driver]);

        assert_eq!(selector.acquire(), Some(BackendKind::DirectDriver));
        let status = selector.status();
        assert!(status.available);
        assert_eq!(status.kind, BackendKind::DirectDriver);
    }

    #[test]
    fn test_total_failure_reports_remediation() {
        let (signed, _, _) = FakeProvider::boxed(BackendKind::SignedModule, false);
        let (driver, _, _) = FakeProvider::boxed(BackendKind::DirectDriver, false);
        let selector = BackendSelector::new(vec![signed, driver]);

        assert_eq!(selector.acquire(), None);
        let status = selector.status();
        assert!(!status.available);
        assert_eq!(status.kind, BackendKind::None);
        assert!(status.status_message.contains("signed_module missing"));
        assert!(status.status_message.contains("direct_driver missing"));
        assert!(status.status_message.contains("libomen_hwaccess.so"));

        let err = selector.with_handle(|h| h.read_byte(RegisterAddress::read_only(0x57))).unwrap_err();
        assert!(matches!(err, OmenError::BackendUnavailable(_)));
    }

    #[test]
    fn test_acquire_preferred_skips_order() {
        let (signed, signed_opens, _) = FakeProvider::boxed(BackendKind::SignedModule, true);
        let (driver, _, _) = FakeProvider::boxed(BackendKind::DirectDriver, true);
        let selector = BackendSelector::new(vec![signed, driver]);

        assert_eq!(selector.acquire_preferred(BackendKind::DirectDriver), Some(BackendKind::DirectDriver));
        assert_eq!(signed_opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_forced_kind_replaces_handle() {
        let (signed, _, signed_closes) = FakeProvider::boxed(BackendKind::SignedModule, true);
        let (driver, _, _) = FakeProvider::boxed(BackendKind::DirectDriver, true);
        let selector = BackendSelector::new(vec![signed, driver]);

        assert_eq!(selector.acquire(), Some(BackendKind::SignedModule));
        selector.set_forced(Some(BackendKind::DirectDriver));
        assert_eq!(signed_closes.load(Ordering::SeqCst), 1);
        assert_eq!(selector.acquire(), Some(BackendKind::DirectDriver));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (signed, _, closes) = FakeProvider::boxed(BackendKind::SignedModule, true);
        let selector = BackendSelector::new(vec![signed]);
        selector.acquire();
        selector.shutdown();
        selector.shutdown();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(selector.active_kind(), BackendKind::None);
    }

    #[test]
    fn test_failing_kind_stops_being_opened() {
        let (signed, opens, _) = FakeProvider::boxed(BackendKind::SignedModule, false);
        let selector = BackendSelector::new(vec![signed]);

        for _ in 0..10 {
            let err = selector.with_handle(|h| h.read_byte(RegisterAddress::read_only(0x57))).unwrap_err();
            assert!(matches!(err, OmenError::BackendUnavailable(_)));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert!(selector.status().status_message.contains("(disabled)"));

        selector.set_forced(None);
        assert_eq!(selector.acquire(), None);
        assert_eq!(opens.load(Ordering::SeqCst), 4);

        selector.shutdown();
        for _ in 0..5 {
            selector.acquire();
        }
        assert_eq!(opens.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_with_handle_reads_through_active_backend() {
        let (signed, _, _) = FakeProvider::boxed(BackendKind::SignedModule, true);
        let selector = BackendSelector::new(vec![signed]);
        let value = selector
            .with_handle(|h| h.read_byte(RegisterAddress::read_only(0x57)))
            .unwrap();
        assert_eq!(value, 42);
    }
}
