//! BLE transport seam.
//!
//! The provisioning session drives the peripheral exclusively through
//! [`BleTransport`], so the state machine can run against the btleplug
//! implementation or a scripted fake.

use crate::error::TransportError;
use crate::scan::{DiscoveredPeripheral, ScanCollector};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Services and characteristics enumerated on the connected peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattProfile {
    pub services: Vec<Uuid>,
    pub characteristics: Vec<Uuid>,
}

impl GattProfile {
    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid)
    }

    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }
}

#[async_trait]
pub trait BleTransport: Send {
    /// Run one scan window, feeding observed peripherals into `collector`.
    /// Returns early when the collector is satisfied or `cancel` fires.
    async fn scan(
        &mut self,
        collector: ScanCollector,
        window: Duration,
        cancel: &CancelHandle,
    ) -> Result<Vec<DiscoveredPeripheral>, TransportError>;

    /// Connect to a peripheral previously returned by `scan`.
    async fn connect(&mut self, peripheral_id: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Enumerate services and characteristics of the connected peripheral.
    async fn discover(&mut self) -> Result<GattProfile, TransportError>;

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Write with response. The provisioning characteristics do not accept
    /// write-without-response.
    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Best-effort; succeeds if nothing is connected.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Link state as last reported by the platform's disconnect events.
    async fn is_connected(&self) -> bool;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cloneable cancel signal shared between a session and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns false on cancel.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}
