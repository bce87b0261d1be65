//! Backend-wide apply serialization
//!
//! Boost, mirrored duty registers and firmware max are shared across
//! channels, so one gate covers every hardware write sequence. An
//! apply/verify or calibration sweep holds it from the first write to the
//! final revert. The telemetry poller only writes when it can take the
//! gate without waiting.

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct ApplyGate {
    gate: Mutex<()>,
}

impl ApplyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the gate
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Take the gate only if nobody holds it
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.gate.try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_excludes_try_lock() {
        let gate = ApplyGate::new();
        let held = gate.lock().await;
        assert!(gate.try_lock().is_none());
        drop(held);
        assert!(gate.try_lock().is_some());
    }
}
