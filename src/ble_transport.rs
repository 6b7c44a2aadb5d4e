// btleplug-backed BLE transport
//
// Talks to the smart-LED provisioning GATT service through the shared host
// adapter from `ble_common`. Disconnects are tracked from the adapter's
// central event stream so the session can tell a rebooting device apart
// from a failed write without looking at error text.

use crate::ble_common::{self, classify_btleplug_error};
use crate::error::TransportError;
use crate::scan::{DiscoveredPeripheral, ScanCollector};
use crate::transport::{BleTransport, CancelHandle, GattProfile};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// How often the adapter's peripheral list is polled during a scan.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on a single characteristic read.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single write. The firmware restarts inside the save
/// command's write callback, so that response may never arrive.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback link check when the adapter has no event stream.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    connected: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Bind to the shared host adapter. Fails with `Unsupported` when the
    /// host has no usable Bluetooth LE adapter.
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = ble_common::get_adapter().await?;
        Ok(Self {
            adapter,
            peripheral: None,
            connected: Arc::new(AtomicBool::new(false)),
            watcher: None,
        })
    }

    fn connected_peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::Disconnected)
    }

    fn stop_watcher(&mut self) {
        if let Some(handle) = self.watcher.take() {
            handle.abort();
        }
    }

    /// Spawn a task that clears `connected` when the peripheral drops.
    async fn spawn_watcher(&mut self, peripheral: &Peripheral) {
        let connected = self.connected.clone();
        let target = peripheral.id();

        let handle = match self.adapter.events().await {
            Ok(mut events) => tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == target {
                            tlog!("[ble_transport] Peripheral {target:?} disconnected");
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }),
            Err(e) => {
                tlog!("[ble_transport] No central event stream ({e}), polling link state instead");
                let peripheral = peripheral.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(WATCHDOG_INTERVAL).await;
                        if !peripheral.is_connected().await.unwrap_or(false) {
                            tlog!("[ble_transport] Watchdog: peripheral {target:?} disconnected");
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                })
            }
        };
        self.watcher = Some(handle);
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::NotFound(format!("characteristic {uuid}")))
    }

    /// After a failed GATT operation, ask the stack whether the link is
    /// still up. A dropped link is reported as `Disconnected`.
    async fn settle_error(&self, peripheral: &Peripheral, err: btleplug::Error) -> TransportError {
        let classified = classify_btleplug_error(err);
        if classified == TransportError::Disconnected {
            self.connected.store(false, Ordering::SeqCst);
            return classified;
        }
        let still_connected = self.connected.load(Ordering::SeqCst)
            && peripheral.is_connected().await.unwrap_or(false);
        if !still_connected {
            self.connected.store(false, Ordering::SeqCst);
            return TransportError::Disconnected;
        }
        classified
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan(
        &mut self,
        mut collector: ScanCollector,
        window: Duration,
        cancel: &CancelHandle,
    ) -> Result<Vec<DiscoveredPeripheral>, TransportError> {
        // Unfiltered: 128-bit service UUIDs often sit in the scan response,
        // which platform-side filters do not see.
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(classify_btleplug_error)?;
        tlog!("[ble_transport] Scan started ({window:?} window)");

        let deadline = Instant::now() + window;
        while !collector.is_done() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if !cancel.sleep(SCAN_POLL_INTERVAL.min(deadline - now)).await {
                tlog!("[ble_transport] Scan cancelled");
                break;
            }

            let peripherals = match self.adapter.peripherals().await {
                Ok(p) => p,
                Err(e) => {
                    tlog!("[ble_transport] Failed to list peripherals: {e}");
                    continue;
                }
            };

            for peripheral in peripherals {
                let props = match peripheral.properties().await.ok().flatten() {
                    Some(p) => p,
                    None => continue,
                };
                let mut services = props.services.clone();
                services.extend(props.service_data.keys().copied());

                let candidate = DiscoveredPeripheral {
                    id: peripheral.id().to_string(),
                    name: props.local_name.clone(),
                    rssi: props.rssi,
                    services,
                };
                let label = format!("{} ({})", candidate.display_name(), candidate.id);
                let rssi = candidate.rssi;
                if collector.offer(candidate) {
                    tlog!("[ble_transport] Matched: {label}, RSSI: {rssi:?}");
                }
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            tlog!("[ble_transport] Failed to stop scan: {e}");
        }
        let matches = collector.finish();
        tlog!("[ble_transport] Scan finished, {} match(es)", matches.len());
        Ok(matches)
    }

    async fn connect(&mut self, peripheral_id: &str, timeout: Duration) -> Result<(), TransportError> {
        // One link at a time
        if self.peripheral.is_some() {
            let _ = self.disconnect().await;
            tlog!("[ble_transport] Disconnected previous peripheral before new connect");
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(classify_btleplug_error)?
            .into_iter()
            .find(|p| p.id().to_string() == peripheral_id)
            .ok_or_else(|| TransportError::NotFound(format!("device '{peripheral_id}'")))?;

        tlog!("[ble_transport] Connecting to {peripheral_id}...");
        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(classify_btleplug_error(e)),
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(TransportError::Timeout(timeout));
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        self.spawn_watcher(&peripheral).await;
        self.peripheral = Some(peripheral);
        tlog!("[ble_transport] Connected to {peripheral_id}");
        Ok(())
    }

    async fn discover(&mut self) -> Result<GattProfile, TransportError> {
        let peripheral = self.connected_peripheral()?.clone();
        if let Err(e) = peripheral.discover_services().await {
            return Err(self.settle_error(&peripheral, e).await);
        }
        let profile = GattProfile {
            services: peripheral.services().iter().map(|s| s.uuid).collect(),
            characteristics: peripheral.characteristics().iter().map(|c| c.uuid).collect(),
        };
        tlog!(
            "[ble_transport] Discovered {} service(s), {} characteristic(s)",
            profile.services.len(),
            profile.characteristics.len()
        );
        Ok(profile)
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.connected_peripheral()?.clone();
        let chr = Self::find_characteristic(&peripheral, characteristic)?;
        match tokio::time::timeout(READ_TIMEOUT, peripheral.read(&chr)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(self.settle_error(&peripheral, e).await),
            Err(_) => Err(TransportError::Timeout(READ_TIMEOUT)),
        }
    }

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral()?.clone();
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let chr = Self::find_characteristic(&peripheral, characteristic)?;
        match tokio::time::timeout(WRITE_TIMEOUT, peripheral.write(&chr, data, WriteType::WithResponse)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.settle_error(&peripheral, e).await),
            Err(_) => {
                if self.connected.load(Ordering::SeqCst) && peripheral.is_connected().await.unwrap_or(false) {
                    Err(TransportError::Timeout(WRITE_TIMEOUT))
                } else {
                    tlog!("[ble_transport] Link dropped while waiting for write response");
                    self.connected.store(false, Ordering::SeqCst);
                    Err(TransportError::Disconnected)
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_watcher();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(peripheral) = self.peripheral.take() {
            tlog!("[ble_transport] Disconnecting from {:?}", peripheral.id());
            // The peripheral may already be gone
            match peripheral.disconnect().await {
                Ok(()) | Err(btleplug::Error::NotConnected) => {}
                Err(e) => return Err(classify_btleplug_error(e)),
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_some() && self.connected.load(Ordering::SeqCst)
    }
}
