// Shared BLE adapter management
//
// Provides a singleton btleplug manager + adapter. Every transport created in
// this process reuses the same adapter, so only one central is ever active.

use crate::error::TransportError;
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Shared adapter state
// ============================================================================

pub struct BleAdapterState {
    manager: Option<Manager>,
    pub adapter: Option<Adapter>,
}

pub static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Initialise the BLE manager and adapter if not already done.
/// A host without a manager or without any adapter is `Unsupported`.
pub async fn ensure_adapter() -> Result<(), TransportError> {
    let mut state = BLE_ADAPTER.lock().await;
    if state.adapter.is_some() {
        return Ok(());
    }
    let manager = Manager::new()
        .await
        .map_err(|e| TransportError::Unsupported(format!("BLE manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| TransportError::Unsupported(format!("Failed to list BLE adapters: {e}")))?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Unsupported("No BLE adapter found".to_string()))?;
    state.adapter = Some(adapter);
    state.manager = Some(manager);
    Ok(())
}

/// Get a clone of the shared BLE adapter, initialising it on first use.
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    ensure_adapter().await?;
    let state = BLE_ADAPTER.lock().await;
    state
        .adapter
        .clone()
        .ok_or_else(|| TransportError::Unsupported("BLE adapter not initialised".to_string()))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Build a 128-bit UUID from its five dash-separated fields, as printed in
/// the canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Map a btleplug error onto the transport taxonomy.
pub fn classify_btleplug_error(err: btleplug::Error) -> TransportError {
    match err {
        btleplug::Error::NotConnected => TransportError::Disconnected,
        btleplug::Error::DeviceNotFound => TransportError::NotFound("device".to_string()),
        btleplug::Error::NoSuchCharacteristic => {
            TransportError::NotFound("characteristic".to_string())
        }
        btleplug::Error::TimedOut(d) => TransportError::Timeout(d),
        btleplug::Error::PermissionDenied => {
            TransportError::Unsupported("Bluetooth permission denied".to_string())
        }
        btleplug::Error::NotSupported(msg) => TransportError::Unsupported(msg),
        other => TransportError::Other(other.to_string()),
    }
}
