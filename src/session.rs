// Provisioning session
//
// Drives one device from discovery to a claimed backend record:
//
//   Idle -> Scanning -> Connecting -> Discovering -> Ready
//        -> WritingCredentials -> AwaitingReboot -> Claiming -> Done
//
// Any step can end in Failed(kind); cancel() ends in Cancelled from
// anywhere. The session owns its transport, so at most one BLE link exists
// per session, and every BLE operation is awaited in order.

use crate::backend::{resolve_location, BackendApi, ClaimRequest, DeviceRecord, LocationChoice};
use crate::error::{ErrorKind, ProvisionError, Result, TransportError};
use crate::gatt::{self, DeviceCommand, DeviceStatus};
use crate::identity::{DeviceIdentity, MacAddress, ProofOfPossession};
use crate::scan::{DiscoveredPeripheral, MatchRule, ScanCollector, ScanMode};
use crate::transport::{BleTransport, CancelHandle, GattProfile};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// WiFi SSIDs are at most 32 octets.
const MAX_SSID_LEN: usize = 32;
/// WPA2 passphrases are at most 64 octets.
const MAX_PASSWORD_LEN: usize = 64;

/// Characteristics `submit` writes to; discovery fails without them.
const REQUIRED_CHARACTERISTICS: [Uuid; 4] = [
    gatt::CHAR_SSID_UUID,
    gatt::CHAR_PASSWORD_UUID,
    gatt::CHAR_IDS_UUID,
    gatt::CHAR_COMMAND_UUID,
];

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub match_rule: MatchRule,
    pub scan_mode: ScanMode,
    pub scan_window: Duration,
    pub connect_timeout: Duration,
    /// Pause between characteristic writes while the firmware commits to flash.
    pub settle_delay: Duration,
    /// Wait after the save command before the backend can expect the device.
    pub reboot_grace: Duration,
    /// Fixed customer id; when `None` it is taken from `GET /users/me`.
    pub customer_id: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            match_rule: MatchRule::Name(gatt::DEFAULT_ADVERTISED_NAME.to_string()),
            scan_mode: ScanMode::FirstMatch,
            scan_window: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(20),
            settle_delay: Duration::from_millis(500),
            reboot_grace: Duration::from_secs(10),
            customer_id: None,
        }
    }
}

/// One characteristic write in the provisioning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    Ssid,
    Password,
    BrokerUrl,
    Ids,
    Save,
}

impl WriteStep {
    pub fn label(self) -> &'static str {
        match self {
            WriteStep::Ssid => "SSID",
            WriteStep::Password => "password",
            WriteStep::BrokerUrl => "broker URL",
            WriteStep::Ids => "device IDs",
            WriteStep::Save => "save command",
        }
    }

    pub fn characteristic(self) -> Uuid {
        match self {
            WriteStep::Ssid => gatt::CHAR_SSID_UUID,
            WriteStep::Password => gatt::CHAR_PASSWORD_UUID,
            WriteStep::BrokerUrl => gatt::CHAR_BROKER_URL_UUID,
            WriteStep::Ids => gatt::CHAR_IDS_UUID,
            WriteStep::Save => gatt::CHAR_COMMAND_UUID,
        }
    }

    /// Broker URL is best-effort; everything else aborts on failure.
    pub fn is_required(self) -> bool {
        self != WriteStep::BrokerUrl
    }
}

/// Where a failed session can be resumed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPoint {
    /// Rescan and reconnect.
    Idle,
    /// Re-validate the link, then submit again.
    Ready,
    /// Device is configured; only the claim needs repeating.
    Claiming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn retry_point(&self) -> RetryPoint {
        match self.kind {
            ErrorKind::WriteError => RetryPoint::Ready,
            ErrorKind::ClaimError => RetryPoint::Claiming,
            _ => RetryPoint::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    WritingCredentials(WriteStep),
    AwaitingReboot,
    Claiming,
    Done { device_id: i64 },
    Failed(Failure),
    Cancelled,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Scanning => "Scanning",
            SessionState::Connecting => "Connecting",
            SessionState::Discovering => "Discovering",
            SessionState::Ready => "Ready",
            SessionState::WritingCredentials(_) => "WritingCredentials",
            SessionState::AwaitingReboot => "AwaitingReboot",
            SessionState::Claiming => "Claiming",
            SessionState::Done { .. } => "Done",
            SessionState::Failed(_) => "Failed",
            SessionState::Cancelled => "Cancelled",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

impl std::fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the user submits once the device is connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// `None` keeps the network the device already has.
    pub network: Option<NetworkCredentials>,
    pub location: Option<LocationChoice>,
    /// Defaults to `Smart LED XXXX` from the MAC suffix.
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLinkage {
    pub customer_id: String,
    pub location_id: i64,
    pub device_id: String,
    pub broker_url: Option<String>,
}

struct PendingWrite {
    step: WriteStep,
    payload: Vec<u8>,
}

/// Build the ordered write sequence: SSID, password, [broker URL], IDs, save.
fn plan_writes(
    credentials: Option<&NetworkCredentials>,
    linkage: &BackendLinkage,
) -> Result<Vec<PendingWrite>> {
    let mut writes = Vec::with_capacity(5);
    if let Some(creds) = credentials {
        writes.push(PendingWrite {
            step: WriteStep::Ssid,
            payload: creds.ssid.as_bytes().to_vec(),
        });
        writes.push(PendingWrite {
            step: WriteStep::Password,
            payload: creds.password.as_bytes().to_vec(),
        });
    }
    if let Some(url) = &linkage.broker_url {
        if url.len() <= gatt::BROKER_URL_MAX_LEN {
            writes.push(PendingWrite {
                step: WriteStep::BrokerUrl,
                payload: url.as_bytes().to_vec(),
            });
        } else {
            tlog!("[session] Broker URL longer than {} bytes, not sending it", gatt::BROKER_URL_MAX_LEN);
        }
    }
    let ids = gatt::encode_ids(&linkage.customer_id, linkage.location_id, &linkage.device_id)
        .map_err(ProvisionError::Validation)?;
    writes.push(PendingWrite {
        step: WriteStep::Ids,
        payload: ids,
    });
    writes.push(PendingWrite {
        step: WriteStep::Save,
        payload: vec![DeviceCommand::Save.byte()],
    });
    Ok(writes)
}

/// Race a transport call against the cancel signal. `None` means the cancel
/// won and the call was dropped mid-flight.
async fn until_cancelled<F: Future>(cancel: &CancelHandle, op: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = op => Some(out),
    }
}

fn validate_network(creds: &NetworkCredentials) -> Result<()> {
    if creds.ssid.trim().is_empty() {
        return Err(ProvisionError::Validation("SSID must not be empty".to_string()));
    }
    if creds.ssid.len() > MAX_SSID_LEN {
        return Err(ProvisionError::Validation(format!(
            "SSID is {} bytes, at most {MAX_SSID_LEN} allowed",
            creds.ssid.len()
        )));
    }
    if creds.password.len() > MAX_PASSWORD_LEN {
        return Err(ProvisionError::Validation(format!(
            "Password is {} bytes, at most {MAX_PASSWORD_LEN} allowed",
            creds.password.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Session
// ============================================================================

pub struct ProvisioningSession<T, B> {
    transport: T,
    backend: B,
    config: SessionConfig,
    state: SessionState,
    cancel: CancelHandle,

    discovered: Vec<DiscoveredPeripheral>,
    peripheral_id: Option<String>,
    profile: Option<GattProfile>,
    identity: DeviceIdentity,
    credentials: Option<NetworkCredentials>,
    linkage: Option<BackendLinkage>,
    device_name: Option<String>,
    claimed: Option<DeviceRecord>,
    last_warning: Option<String>,
}

impl<T: BleTransport, B: BackendApi> ProvisioningSession<T, B> {
    pub fn new(transport: T, backend: B, config: SessionConfig) -> Self {
        Self {
            transport,
            backend,
            config,
            state: SessionState::Idle,
            cancel: CancelHandle::new(),
            discovered: Vec::new(),
            peripheral_id: None,
            profile: None,
            identity: DeviceIdentity::default(),
            credentials: None,
            linkage: None,
            device_name: None,
            claimed: None,
            last_warning: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn credentials(&self) -> Option<&NetworkCredentials> {
        self.credentials.as_ref()
    }

    pub fn linkage(&self) -> Option<&BackendLinkage> {
        self.linkage.as_ref()
    }

    pub fn discovered(&self) -> &[DiscoveredPeripheral] {
        &self.discovered
    }

    pub fn claimed(&self) -> Option<&DeviceRecord> {
        self.claimed.as_ref()
    }

    /// Last non-fatal problem (failed identity read, skipped broker URL, ...).
    pub fn last_warning(&self) -> Option<&str> {
        self.last_warning.as_deref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Handle that cancels the session from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Human-readable status line for the current state.
    pub fn status_text(&self) -> String {
        match &self.state {
            SessionState::Idle => match &self.last_warning {
                Some(w) => format!("Idle ({w})"),
                None => "Idle".to_string(),
            },
            SessionState::Scanning => {
                if self.discovered.is_empty() {
                    "Scanning...".to_string()
                } else {
                    format!("Found {} device(s). Select one to connect.", self.discovered.len())
                }
            }
            SessionState::Connecting => "Found device. Connecting...".to_string(),
            SessionState::Discovering => "Discovering services...".to_string(),
            SessionState::Ready => "Connected!".to_string(),
            SessionState::WritingCredentials(step) => format!("Writing {}...", step.label()),
            SessionState::AwaitingReboot => {
                "Configuration sent. Waiting for the device to join WiFi...".to_string()
            }
            SessionState::Claiming => "Registering device...".to_string(),
            SessionState::Done { device_id } => format!("Device registered (id {device_id})."),
            SessionState::Failed(failure) => {
                let hint = match failure.retry_point() {
                    RetryPoint::Idle => "scan again to retry",
                    RetryPoint::Ready => "reconnect and submit again",
                    RetryPoint::Claiming => "device is configured; retry the claim",
                };
                format!("{} ({hint})", failure.message)
            }
            SessionState::Cancelled => "Cancelled".to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------------

    fn transition(&mut self, next: SessionState) {
        tlog!("[session] {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    fn fail(&mut self, err: ProvisionError) -> ProvisionError {
        tlog!("[session] Failed ({}): {err}", err.kind());
        self.transition(SessionState::Failed(Failure {
            kind: err.kind(),
            message: err.to_string(),
        }));
        err
    }

    fn require_state(&self, allowed: &[&'static str], op: &str) -> Result<()> {
        if allowed.contains(&self.state.name()) {
            Ok(())
        } else {
            Err(ProvisionError::InvalidState(format!(
                "{} (cannot {op})",
                self.state.name()
            )))
        }
    }

    fn clear_session_fields(&mut self) {
        self.discovered.clear();
        self.peripheral_id = None;
        self.profile = None;
        self.identity = DeviceIdentity::default();
        self.credentials = None;
        self.linkage = None;
        self.device_name = None;
        self.claimed = None;
        self.last_warning = None;
    }

    async fn release_link(&mut self) {
        let held = self.peripheral_id.take().is_some();
        if held || self.transport.is_connected().await {
            if let Err(e) = self.transport.disconnect().await {
                tlog!("[session] Disconnect failed: {e}");
            }
        }
        self.profile = None;
    }

    /// Consumes the cancel signal, so the next operation starts clean.
    async fn finish_cancel(&mut self) -> ProvisionError {
        self.cancel.clear();
        self.release_link().await;
        self.credentials = None;
        self.transition(SessionState::Cancelled);
        ProvisionError::Cancelled
    }

    async fn check_cancel(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.finish_cancel().await);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Scan / connect
    // ------------------------------------------------------------------------

    /// Start a fresh scan. Resets every session-scoped field first.
    /// In `FirstMatch` mode the first match is connected immediately; in
    /// `Collect` mode the session stays in `Scanning` with the match list.
    ///
    /// A cancel raised through the handle while nothing was running is
    /// honoured here: the session ends `Cancelled` without scanning.
    pub async fn start_scan(&mut self) -> Result<&[DiscoveredPeripheral]> {
        self.require_state(&["Idle", "Ready", "Scanning", "Done", "Failed", "Cancelled"], "scan")?;
        self.check_cancel().await?;
        self.release_link().await;
        self.clear_session_fields();
        self.transition(SessionState::Scanning);

        let collector = ScanCollector::new(self.config.match_rule.clone(), self.config.scan_mode);
        let result = self
            .transport
            .scan(collector, self.config.scan_window, &self.cancel)
            .await;
        self.check_cancel().await?;

        let matches = match result {
            Ok(m) => m,
            Err(e) => return Err(self.fail(ProvisionError::from_connect(e))),
        };

        if matches.is_empty() {
            tlog!("[session] Scan finished without a matching device");
            self.transition(SessionState::Idle);
            self.last_warning = Some("no matching device found; try again".to_string());
            return Ok(&self.discovered);
        }

        self.discovered = matches;
        if self.config.scan_mode == ScanMode::FirstMatch {
            let target = self.discovered[0].id.clone();
            self.connect(&target).await?;
        }
        Ok(&self.discovered)
    }

    /// Connect to a scanned peripheral and verify the provisioning service.
    pub async fn connect(&mut self, peripheral_id: &str) -> Result<()> {
        self.require_state(&["Idle", "Scanning"], "connect")?;
        self.check_cancel().await?;

        self.transition(SessionState::Connecting);
        let connecting = self.transport.connect(peripheral_id, self.config.connect_timeout);
        match until_cancelled(&self.cancel, connecting).await {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail(ProvisionError::from_connect(e))),
            None => {
                // The link may have come up just as the connect was dropped
                self.peripheral_id = Some(peripheral_id.to_string());
                return Err(self.finish_cancel().await);
            }
        }
        self.peripheral_id = Some(peripheral_id.to_string());
        self.check_cancel().await?;

        self.transition(SessionState::Discovering);
        self.discover().await
    }

    async fn discover(&mut self) -> Result<()> {
        let profile = match until_cancelled(&self.cancel, self.transport.discover()).await {
            None => return Err(self.finish_cancel().await),
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                self.release_link().await;
                return Err(self.fail(ProvisionError::Connect(format!(
                    "service discovery failed: {e}"
                ))));
            }
        };
        self.check_cancel().await?;

        if !profile.has_service(&gatt::PROV_SERVICE_UUID) {
            self.release_link().await;
            return Err(self.fail(ProvisionError::ServiceNotFound(
                format!("provisioning service {}", gatt::PROV_SERVICE_UUID),
            )));
        }
        if let Some(missing) = REQUIRED_CHARACTERISTICS
            .iter()
            .find(|c| !profile.has_characteristic(c))
        {
            self.release_link().await;
            return Err(self.fail(ProvisionError::ServiceNotFound(format!(
                "provisioning characteristic {missing}"
            ))));
        }
        self.profile = Some(profile);
        self.transition(SessionState::Ready);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Ready-state operations
    // ------------------------------------------------------------------------

    /// Read MAC and PoP. A failed read keeps any value read earlier and is
    /// reported, but the session stays `Ready`.
    pub async fn read_identity(&mut self) -> Result<&DeviceIdentity> {
        self.require_state(&["Ready"], "read identity")?;
        self.check_cancel().await?;
        let mut first_error: Option<ProvisionError> = None;

        let mac = match until_cancelled(&self.cancel, self.transport.read(gatt::CHAR_MAC_UUID)).await {
            Some(r) => r,
            None => return Err(self.finish_cancel().await),
        };
        let mac = mac
            .map_err(|e| e.to_string())
            .and_then(|data| MacAddress::from_slice(&data));
        match mac {
            Ok(mac) => {
                tlog!("[session] Device MAC: {mac}");
                self.identity.mac = Some(mac);
            }
            Err(message) => {
                first_error.get_or_insert(ProvisionError::Read { what: "MAC address", message });
            }
        }

        let pop = match until_cancelled(&self.cancel, self.transport.read(gatt::CHAR_POP_UUID)).await {
            Some(r) => r,
            None => return Err(self.finish_cancel().await),
        };
        let pop = pop
            .map_err(|e| e.to_string())
            .and_then(|data| ProofOfPossession::from_bytes(&data));
        match pop {
            Ok(pop) => {
                tlog!("[session] Device PoP read ({} bytes)", pop.len());
                self.identity.pop = Some(pop);
            }
            Err(message) => {
                first_error.get_or_insert(ProvisionError::Read {
                    what: "proof of possession",
                    message,
                });
            }
        }

        if let Some(err) = first_error {
            tlog!("[session] Identity read incomplete: {err}");
            self.last_warning = Some(err.to_string());
            return Err(err);
        }
        Ok(&self.identity)
    }

    /// Read the firmware's provisioning status byte.
    pub async fn read_device_status(&mut self) -> Result<DeviceStatus> {
        self.require_state(&["Ready"], "read status")?;
        let read = match until_cancelled(&self.cancel, self.transport.read(gatt::CHAR_STATUS_UUID)).await {
            Some(r) => r,
            None => return Err(self.finish_cancel().await),
        };
        let data = read.map_err(|e| ProvisionError::Read {
                what: "device status",
                message: e.to_string(),
            })?;
        let code = data.first().copied().ok_or_else(|| ProvisionError::Read {
            what: "device status",
            message: "empty value".to_string(),
        })?;
        Ok(DeviceStatus::from_byte(code))
    }

    /// Send a maintenance command. Commands that reboot the device end the
    /// session in `Idle`.
    pub async fn send_command(&mut self, command: DeviceCommand) -> Result<()> {
        self.require_state(&["Ready"], "send a command")?;
        if command == DeviceCommand::Save {
            return Err(ProvisionError::Validation(
                "use submit() to save a configuration".to_string(),
            ));
        }
        let payload = [command.byte()];
        let writing = self.transport.write(gatt::CHAR_COMMAND_UUID, &payload);
        let result = match until_cancelled(&self.cancel, writing).await {
            Some(r) => r,
            None => return Err(self.finish_cancel().await),
        };
        match result {
            Ok(()) => {}
            Err(TransportError::Disconnected) if command.reboots() => {
                tlog!("[session] Device dropped the link after {command:?} (expected)");
            }
            Err(e) => {
                return Err(ProvisionError::Write {
                    what: "command",
                    message: e.to_string(),
                })
            }
        }
        tlog!("[session] Sent {command:?} command");
        if command.reboots() {
            self.release_link().await;
            self.clear_session_fields();
            self.transition(SessionState::Idle);
        }
        Ok(())
    }

    /// Validate the request, write the configuration, wait for the reboot
    /// and claim the device.
    ///
    /// Validation and backend lookups happen before any write; if they fail
    /// the session stays `Ready`.
    pub async fn submit(&mut self, request: ProvisionRequest) -> Result<&DeviceRecord> {
        self.require_state(&["Ready"], "submit")?;

        if let Some(creds) = &request.network {
            validate_network(creds)?;
        }
        let location = match &request.location {
            Some(LocationChoice::Id(id)) if *id <= 0 => {
                return Err(ProvisionError::Validation(format!("Invalid room id {id}")))
            }
            Some(LocationChoice::Name(name)) if name.trim().is_empty() => {
                return Err(ProvisionError::Validation("Room name must not be empty".to_string()))
            }
            Some(choice) => choice.clone(),
            None => {
                return Err(ProvisionError::Validation(
                    "Select a room before provisioning".to_string(),
                ))
            }
        };

        if !self.identity.is_complete() {
            // Best effort; the check below decides
            let _ = self.read_identity().await;
        }
        let mac = match (&self.identity.mac, &self.identity.pop) {
            (Some(mac), Some(_)) => *mac,
            _ => {
                return Err(ProvisionError::Read {
                    what: "device identity",
                    message: "MAC address and proof of possession are required to claim the device"
                        .to_string(),
                })
            }
        };

        let device_name = request
            .device_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| mac.default_device_name());

        self.check_cancel().await?;
        let linkage = self.build_linkage(&location, &mac).await?;
        let writes = plan_writes(request.network.as_ref(), &linkage)?;

        self.credentials = request.network;
        self.linkage = Some(linkage);
        self.device_name = Some(device_name);

        self.write_configuration(writes).await?;
        self.await_reboot().await?;
        self.claim().await
    }

    async fn build_linkage(&self, location: &LocationChoice, mac: &MacAddress) -> Result<BackendLinkage> {
        let customer_id = match &self.config.customer_id {
            Some(id) => id.clone(),
            None => self.backend.current_user().await?.id.to_string(),
        };
        let location_id = resolve_location(&self.backend, location).await?;
        let broker_url = match self.backend.system_config().await {
            Ok(config) => config.mqtt_broker_url.filter(|u| !u.trim().is_empty()),
            Err(e) => {
                tlog!("[session] System config unavailable ({e}), continuing without broker URL");
                None
            }
        };
        Ok(BackendLinkage {
            customer_id,
            location_id,
            device_id: mac.compact(),
            broker_url,
        })
    }

    // ------------------------------------------------------------------------
    // Write / reboot / claim
    // ------------------------------------------------------------------------

    async fn write_configuration(&mut self, writes: Vec<PendingWrite>) -> Result<()> {
        for (i, write) in writes.into_iter().enumerate() {
            self.check_cancel().await?;
            if i > 0 && !self.cancel.sleep(self.config.settle_delay).await {
                return Err(self.finish_cancel().await);
            }
            self.transition(SessionState::WritingCredentials(write.step));

            let writing = self.transport.write(write.step.characteristic(), &write.payload);
            let result = match until_cancelled(&self.cancel, writing).await {
                Some(r) => r,
                None => {
                    tlog!("[session] Cancelled while writing {}", write.step.label());
                    return Err(self.finish_cancel().await);
                }
            };

            let err = match result {
                Ok(()) => {
                    tlog!("[session] Wrote {} ({} bytes)", write.step.label(), write.payload.len());
                    continue;
                }
                Err(e) => e,
            };

            if write.step == WriteStep::Save {
                // The firmware reboots as soon as it has saved, often before
                // the write response makes it back.
                let dropped = err == TransportError::Disconnected || !self.transport.is_connected().await;
                if dropped {
                    tlog!("[session] Device disconnected after save command (expected)");
                    continue;
                }
            }

            if !write.step.is_required() {
                tlog!("[session] {} write failed ({err}), continuing", write.step.label());
                self.last_warning = Some(format!("{} not sent: {err}", write.step.label()));
                continue;
            }

            return Err(self.fail(ProvisionError::Write {
                what: write.step.label(),
                message: err.to_string(),
            }));
        }

        // Device is rebooting; drop our side of the link
        self.release_link().await;
        self.transition(SessionState::AwaitingReboot);
        Ok(())
    }

    async fn await_reboot(&mut self) -> Result<()> {
        tlog!("[session] Waiting {:?} for the device to join WiFi", self.config.reboot_grace);
        if !self.cancel.sleep(self.config.reboot_grace).await {
            return Err(self.finish_cancel().await);
        }
        self.transition(SessionState::Claiming);
        Ok(())
    }

    fn claim_request(&self) -> Result<ClaimRequest> {
        let (mac, pop) = match (&self.identity.mac, &self.identity.pop) {
            (Some(mac), Some(pop)) => (mac, pop),
            _ => return Err(ProvisionError::InvalidState("device identity missing".to_string())),
        };
        let linkage = self
            .linkage
            .as_ref()
            .ok_or_else(|| ProvisionError::InvalidState("backend linkage missing".to_string()))?;
        Ok(ClaimRequest {
            mac_address: mac.to_string(),
            proof_of_possession: pop.to_hex(),
            location_id: linkage.location_id,
            name: self
                .device_name
                .clone()
                .unwrap_or_else(|| mac.default_device_name()),
        })
    }

    async fn claim(&mut self) -> Result<&DeviceRecord> {
        let request = match self.claim_request() {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };
        self.check_cancel().await?;

        tlog!(
            "[session] Claiming {} as '{}' in location {}",
            request.mac_address,
            request.name,
            request.location_id
        );
        match self.backend.claim_device(&request).await {
            Ok(record) => {
                tlog!("[session] Device claimed, id {}", record.id);
                self.credentials = None;
                self.transition(SessionState::Done { device_id: record.id });
                Ok(&*self.claimed.insert(record))
            }
            Err(e) => Err(self.fail(ProvisionError::Claim(e.to_string()))),
        }
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Repeat only the backend claim after a `ClaimError`.
    pub async fn retry_claim(&mut self) -> Result<&DeviceRecord> {
        match &self.state {
            SessionState::Failed(f) if f.retry_point() == RetryPoint::Claiming => {}
            _ => {
                return Err(ProvisionError::InvalidState(format!(
                    "{} (nothing to re-claim)",
                    self.state.name()
                )))
            }
        }
        self.check_cancel().await?;
        self.transition(SessionState::Claiming);
        self.claim().await
    }

    /// Return to `Ready` after a write failure. The link is re-validated and
    /// services rediscovered, since characteristic handles may be stale.
    pub async fn recover(&mut self) -> Result<()> {
        match &self.state {
            SessionState::Failed(f) if f.retry_point() == RetryPoint::Ready => {}
            _ => {
                return Err(ProvisionError::InvalidState(format!(
                    "{} (nothing to recover)",
                    self.state.name()
                )))
            }
        }
        self.check_cancel().await?;
        if !self.transport.is_connected().await {
            self.release_link().await;
            return Err(self.fail(ProvisionError::Connect(
                "device is no longer connected; scan again".to_string(),
            )));
        }
        self.transition(SessionState::Discovering);
        self.discover().await
    }

    /// Cancel from any state, releasing the BLE link if one is held.
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        self.finish_cancel().await;
    }

    /// Drop everything and return to `Idle`.
    pub async fn reset(&mut self) {
        self.release_link().await;
        self.clear_session_fields();
        self.cancel.clear();
        self.transition(SessionState::Idle);
    }

    /// Convenience for single-device flows: scan, connect to the first (or
    /// strongest) match, read identity and submit.
    pub async fn provision(&mut self, request: ProvisionRequest) -> Result<&DeviceRecord> {
        self.start_scan().await?;
        match &self.state {
            SessionState::Ready => {}
            SessionState::Scanning => {
                let target = self.discovered[0].id.clone();
                self.connect(&target).await?;
            }
            _ => {
                return Err(ProvisionError::Connect(
                    "no matching device found".to_string(),
                ))
            }
        }
        if let Err(e) = self.read_identity().await {
            tlog!("[session] Continuing after identity read problem: {e}");
        }
        self.submit(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Location, SystemConfig, UserProfile};
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
    const POP: [u8; 32] = [0x5A; 32];

    // ------------------------------------------------------------------------
    // Fake transport
    // ------------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Scan,
        Connect(String),
        Discover,
        Read(Uuid),
        Write(Uuid, Vec<u8>),
        Disconnect,
    }

    struct FakeDevice {
        peripherals: Vec<DiscoveredPeripheral>,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
        reads: HashMap<Uuid, std::result::Result<Vec<u8>, TransportError>>,
        write_errors: HashMap<Uuid, TransportError>,
        scan_error: Option<TransportError>,
        connect_error: Option<TransportError>,
        /// Link drops when the save command arrives.
        reboot_on_save: bool,
        cancel_on_write: Option<(Uuid, CancelHandle)>,
        /// This write never gets a response.
        hang_on_write: Option<Uuid>,
        connected: bool,
        ops: Vec<Op>,
        write_times: Vec<tokio::time::Instant>,
    }

    impl FakeDevice {
        fn led(mac: [u8; 6]) -> Self {
            let mut reads = HashMap::new();
            reads.insert(gatt::CHAR_MAC_UUID, Ok(mac.to_vec()));
            reads.insert(gatt::CHAR_POP_UUID, Ok(POP.to_vec()));
            reads.insert(gatt::CHAR_STATUS_UUID, Ok(vec![0x00]));
            Self {
                peripherals: vec![DiscoveredPeripheral {
                    id: "hci0/dev_AA_BB".to_string(),
                    name: Some(gatt::DEFAULT_ADVERTISED_NAME.to_string()),
                    rssi: Some(-52),
                    services: vec![],
                }],
                services: vec![gatt::PROV_SERVICE_UUID],
                characteristics: vec![
                    gatt::CHAR_MAC_UUID,
                    gatt::CHAR_POP_UUID,
                    gatt::CHAR_SSID_UUID,
                    gatt::CHAR_PASSWORD_UUID,
                    gatt::CHAR_STATUS_UUID,
                    gatt::CHAR_COMMAND_UUID,
                    gatt::CHAR_IDS_UUID,
                    gatt::CHAR_BROKER_URL_UUID,
                ],
                reads,
                write_errors: HashMap::new(),
                scan_error: None,
                connect_error: None,
                reboot_on_save: true,
                cancel_on_write: None,
                hang_on_write: None,
                connected: false,
                ops: Vec::new(),
                write_times: Vec::new(),
            }
        }

        fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
            self.ops
                .iter()
                .filter_map(|op| match op {
                    Op::Write(uuid, data) => Some((*uuid, data.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Clone)]
    struct FakeTransport(Arc<Mutex<FakeDevice>>);

    #[async_trait]
    impl BleTransport for FakeTransport {
        async fn scan(
            &mut self,
            mut collector: ScanCollector,
            _window: Duration,
            _cancel: &CancelHandle,
        ) -> std::result::Result<Vec<DiscoveredPeripheral>, TransportError> {
            let mut dev = self.0.lock().unwrap();
            dev.ops.push(Op::Scan);
            if let Some(err) = dev.scan_error.clone() {
                return Err(err);
            }
            for p in dev.peripherals.clone() {
                collector.offer(p);
            }
            Ok(collector.finish())
        }

        async fn connect(&mut self, id: &str, _timeout: Duration) -> std::result::Result<(), TransportError> {
            let mut dev = self.0.lock().unwrap();
            dev.ops.push(Op::Connect(id.to_string()));
            if let Some(err) = dev.connect_error.clone() {
                return Err(err);
            }
            dev.connected = true;
            Ok(())
        }

        async fn discover(&mut self) -> std::result::Result<GattProfile, TransportError> {
            let mut dev = self.0.lock().unwrap();
            dev.ops.push(Op::Discover);
            Ok(GattProfile {
                services: dev.services.clone(),
                characteristics: dev.characteristics.clone(),
            })
        }

        async fn read(&mut self, characteristic: Uuid) -> std::result::Result<Vec<u8>, TransportError> {
            let mut dev = self.0.lock().unwrap();
            dev.ops.push(Op::Read(characteristic));
            dev.reads
                .get(&characteristic)
                .cloned()
                .unwrap_or_else(|| Err(TransportError::NotFound(characteristic.to_string())))
        }

        async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> std::result::Result<(), TransportError> {
            let hang = {
                let mut dev = self.0.lock().unwrap();
                if !dev.connected {
                    return Err(TransportError::Disconnected);
                }
                dev.ops.push(Op::Write(characteristic, data.to_vec()));
                dev.write_times.push(tokio::time::Instant::now());
                dev.hang_on_write == Some(characteristic)
            };
            if hang {
                std::future::pending::<()>().await;
            }

            let mut dev = self.0.lock().unwrap();
            if let Some((uuid, handle)) = &dev.cancel_on_write {
                if *uuid == characteristic {
                    handle.cancel();
                }
            }
            let rebooting = characteristic == gatt::CHAR_COMMAND_UUID && dev.reboot_on_save;
            if rebooting {
                dev.connected = false;
            }
            if let Some(err) = dev.write_errors.get(&characteristic) {
                return Err(err.clone());
            }
            if rebooting {
                return Err(TransportError::Disconnected);
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> std::result::Result<(), TransportError> {
            let mut dev = self.0.lock().unwrap();
            dev.ops.push(Op::Disconnect);
            dev.connected = false;
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.0.lock().unwrap().connected
        }
    }

    // ------------------------------------------------------------------------
    // Fake backend
    // ------------------------------------------------------------------------

    struct FakeApi {
        customer_id: i64,
        locations: Vec<Location>,
        broker_url: Option<String>,
        config_error: bool,
        claim_result: std::result::Result<DeviceRecord, BackendError>,
        claims: Vec<ClaimRequest>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                customer_id: 1,
                locations: vec![Location {
                    id: 4,
                    name: "Living Room".to_string(),
                }],
                broker_url: None,
                config_error: false,
                claim_result: Ok(DeviceRecord {
                    id: 17,
                    name: Some("Smart LED EEFF".to_string()),
                    status: Some("OFFLINE".to_string()),
                    location_id: Some(4),
                }),
                claims: Vec::new(),
            }
        }
    }

    #[derive(Clone)]
    struct FakeBackend(Arc<Mutex<FakeApi>>);

    #[async_trait]
    impl BackendApi for FakeBackend {
        async fn current_user(&self) -> std::result::Result<UserProfile, BackendError> {
            Ok(UserProfile {
                id: self.0.lock().unwrap().customer_id,
                email: Some("owner@example.com".to_string()),
            })
        }

        async fn list_locations(&self) -> std::result::Result<Vec<Location>, BackendError> {
            Ok(self.0.lock().unwrap().locations.clone())
        }

        async fn create_location(&self, name: &str) -> std::result::Result<Location, BackendError> {
            let mut api = self.0.lock().unwrap();
            let location = Location {
                id: 50 + api.locations.len() as i64,
                name: name.to_string(),
            };
            api.locations.push(location.clone());
            Ok(location)
        }

        async fn system_config(&self) -> std::result::Result<SystemConfig, BackendError> {
            let api = self.0.lock().unwrap();
            if api.config_error {
                return Err(BackendError::Status {
                    status: 500,
                    message: "Failed to fetch system config".to_string(),
                });
            }
            Ok(SystemConfig {
                mqtt_broker_url: api.broker_url.clone(),
            })
        }

        async fn claim_device(&self, request: &ClaimRequest) -> std::result::Result<DeviceRecord, BackendError> {
            let mut api = self.0.lock().unwrap();
            api.claims.push(request.clone());
            api.claim_result.clone()
        }
    }

    // ------------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------------

    struct Harness {
        device: Arc<Mutex<FakeDevice>>,
        api: Arc<Mutex<FakeApi>>,
        session: ProvisioningSession<FakeTransport, FakeBackend>,
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            settle_delay: Duration::ZERO,
            reboot_grace: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn harness_with(device: FakeDevice, api: FakeApi, config: SessionConfig) -> Harness {
        let device = Arc::new(Mutex::new(device));
        let api = Arc::new(Mutex::new(api));
        let session = ProvisioningSession::new(
            FakeTransport(device.clone()),
            FakeBackend(api.clone()),
            config,
        );
        Harness {
            device,
            api,
            session,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeDevice::led(MAC), FakeApi::new(), test_config())
    }

    fn home_request(room: i64) -> ProvisionRequest {
        ProvisionRequest {
            network: Some(NetworkCredentials {
                ssid: "HomeNet".to_string(),
                password: "secret123".to_string(),
            }),
            location: Some(LocationChoice::Id(room)),
            device_name: None,
        }
    }

    async fn connected(h: &mut Harness) {
        h.session.start_scan().await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Ready);
        h.session.read_identity().await.unwrap();
    }

    fn failure_kind(state: &SessionState) -> Option<ErrorKind> {
        match state {
            SessionState::Failed(f) => Some(f.kind),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_end_to_end_home_network() {
        let mut h = harness();
        connected(&mut h).await;
        assert_eq!(h.session.identity().mac.unwrap().to_string(), "AA:BB:CC:DD:EE:FF");

        let record = h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(record.id, 17);
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });

        let writes = h.device.lock().unwrap().writes();
        assert_eq!(
            writes,
            vec![
                (gatt::CHAR_SSID_UUID, b"HomeNet".to_vec()),
                (gatt::CHAR_PASSWORD_UUID, b"secret123".to_vec()),
                (gatt::CHAR_IDS_UUID, b"1,4,AABBCCDDEEFF".to_vec()),
                (gatt::CHAR_COMMAND_UUID, vec![0x01]),
            ]
        );

        let claims = h.api.lock().unwrap().claims.clone();
        assert_eq!(
            claims,
            vec![ClaimRequest {
                mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
                proof_of_possession: hex::encode(POP),
                location_id: 4,
                name: "Smart LED EEFF".to_string(),
            }]
        );
        assert!(h.session.credentials().is_none());
    }

    #[tokio::test]
    async fn test_broker_url_written_between_password_and_ids() {
        let mut api = FakeApi::new();
        api.broker_url = Some("mqtt://10.0.0.5:1883".to_string());
        let mut h = harness_with(FakeDevice::led(MAC), api, test_config());
        connected(&mut h).await;
        h.session.submit(home_request(4)).await.unwrap();

        let order: Vec<Uuid> = h.device.lock().unwrap().writes().into_iter().map(|(u, _)| u).collect();
        assert_eq!(
            order,
            vec![
                gatt::CHAR_SSID_UUID,
                gatt::CHAR_PASSWORD_UUID,
                gatt::CHAR_BROKER_URL_UUID,
                gatt::CHAR_IDS_UUID,
                gatt::CHAR_COMMAND_UUID,
            ]
        );
    }

    #[tokio::test]
    async fn test_broker_url_failure_is_not_fatal() {
        let mut api = FakeApi::new();
        api.broker_url = Some("mqtt://10.0.0.5:1883".to_string());
        let mut device = FakeDevice::led(MAC);
        device
            .write_errors
            .insert(gatt::CHAR_BROKER_URL_UUID, TransportError::Other("GATT error 0x0d".into()));
        let mut h = harness_with(device, api, test_config());
        connected(&mut h).await;

        h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });
        assert!(h.session.last_warning().unwrap().contains("broker URL"));
        let order: Vec<Uuid> = h.device.lock().unwrap().writes().into_iter().map(|(u, _)| u).collect();
        assert_eq!(order.len(), 5);
        assert_eq!(order[3], gatt::CHAR_IDS_UUID);
    }

    #[tokio::test]
    async fn test_missing_system_config_skips_broker_url() {
        let mut api = FakeApi::new();
        api.config_error = true;
        let mut h = harness_with(FakeDevice::led(MAC), api, test_config());
        connected(&mut h).await;
        h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(h.session.linkage().unwrap().broker_url, None);
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });
    }

    #[tokio::test]
    async fn test_required_write_failure_stops_sequence() {
        let mut device = FakeDevice::led(MAC);
        device
            .write_errors
            .insert(gatt::CHAR_PASSWORD_UUID, TransportError::Other("GATT error 0x0e".into()));
        let mut h = harness_with(device, FakeApi::new(), test_config());
        connected(&mut h).await;

        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteError);
        assert_eq!(failure_kind(h.session.state()), Some(ErrorKind::WriteError));

        let order: Vec<Uuid> = h.device.lock().unwrap().writes().into_iter().map(|(u, _)| u).collect();
        assert_eq!(order, vec![gatt::CHAR_SSID_UUID, gatt::CHAR_PASSWORD_UUID]);
        assert!(h.api.lock().unwrap().claims.is_empty());

        // Link is still up: recover rediscovers and returns to Ready
        h.device.lock().unwrap().write_errors.clear();
        h.session.recover().await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Ready);
        let discovers = h
            .device
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| **op == Op::Discover)
            .count();
        assert_eq!(discovers, 2);

        h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });
    }

    #[tokio::test]
    async fn test_recover_requires_live_link() {
        let mut device = FakeDevice::led(MAC);
        device
            .write_errors
            .insert(gatt::CHAR_SSID_UUID, TransportError::Other("GATT error".into()));
        let mut h = harness_with(device, FakeApi::new(), test_config());
        connected(&mut h).await;
        h.session.submit(home_request(4)).await.unwrap_err();

        h.device.lock().unwrap().connected = false;
        let err = h.session.recover().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        match h.session.state() {
            SessionState::Failed(f) => assert_eq!(f.retry_point(), RetryPoint::Idle),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_save_error_with_dropped_link_is_expected() {
        // Link drops but the stack reports a generic error instead
        let mut device = FakeDevice::led(MAC);
        device
            .write_errors
            .insert(gatt::CHAR_COMMAND_UUID, TransportError::Other("ATT timeout".into()));
        let mut h = harness_with(device, FakeApi::new(), test_config());
        connected(&mut h).await;
        h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });
    }

    #[tokio::test]
    async fn test_save_error_on_live_link_is_write_failure() {
        let mut device = FakeDevice::led(MAC);
        device.reboot_on_save = false;
        device
            .write_errors
            .insert(gatt::CHAR_COMMAND_UUID, TransportError::Other("ATT timeout".into()));
        let mut h = harness_with(device, FakeApi::new(), test_config());
        connected(&mut h).await;

        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteError);
        assert!(h.api.lock().unwrap().claims.is_empty());
    }

    #[tokio::test]
    async fn test_claim_uses_mac_read_from_device() {
        let device_mac = [0x24, 0x6F, 0x28, 0x01, 0x9A, 0x3C];
        let mut h = harness_with(FakeDevice::led(device_mac), FakeApi::new(), test_config());
        connected(&mut h).await;

        let mut request = home_request(4);
        request.device_name = Some("  Desk Lamp ".to_string());
        h.session.submit(request).await.unwrap();

        let claims = h.api.lock().unwrap().claims.clone();
        assert_eq!(claims[0].mac_address, "24:6F:28:01:9A:3C");
        assert_eq!(claims[0].name, "Desk Lamp");
        let ids = h
            .device
            .lock()
            .unwrap()
            .writes()
            .into_iter()
            .find(|(u, _)| *u == gatt::CHAR_IDS_UUID)
            .unwrap()
            .1;
        assert_eq!(ids, b"1,4,246F28019A3C".to_vec());
    }

    #[tokio::test]
    async fn test_claim_failure_retries_without_ble() {
        let mut api = FakeApi::new();
        api.claim_result = Err(BackendError::Status {
            status: 400,
            message: "Device is currently online and cannot be claimed.".to_string(),
        });
        let mut h = harness_with(FakeDevice::led(MAC), api, test_config());
        connected(&mut h).await;

        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClaimError);
        match h.session.state() {
            SessionState::Failed(f) => assert_eq!(f.retry_point(), RetryPoint::Claiming),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(h.session.status_text().contains("retry the claim"));
        let ops_before = h.device.lock().unwrap().ops.len();

        h.api.lock().unwrap().claim_result = Ok(DeviceRecord {
            id: 17,
            name: None,
            status: None,
            location_id: Some(4),
        });
        let record = h.session.retry_claim().await.unwrap();
        assert_eq!(record.id, 17);
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });
        assert_eq!(h.device.lock().unwrap().ops.len(), ops_before);
        assert_eq!(h.api.lock().unwrap().claims.len(), 2);
    }

    #[tokio::test]
    async fn test_new_scan_resets_session_fields() {
        let mut api = FakeApi::new();
        api.claim_result = Err(BackendError::Request("connection refused".into()));
        let mut h = harness_with(FakeDevice::led(MAC), api, test_config());
        connected(&mut h).await;
        h.session.submit(home_request(4)).await.unwrap_err();
        assert!(h.session.credentials().is_some());
        assert!(h.session.linkage().is_some());

        h.device.lock().unwrap().peripherals.clear();
        let found = h.session.start_scan().await.unwrap();
        assert!(found.is_empty());
        assert_eq!(h.session.state(), &SessionState::Idle);
        assert_eq!(h.session.identity(), &DeviceIdentity::default());
        assert!(h.session.credentials().is_none());
        assert!(h.session.linkage().is_none());
        assert!(h.session.claimed().is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_writes_disconnects() {
        let mut h = harness();
        connected(&mut h).await;
        let handle = h.session.cancel_handle();
        h.device.lock().unwrap().cancel_on_write = Some((gatt::CHAR_PASSWORD_UUID, handle));

        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled);
        assert_eq!(h.session.state(), &SessionState::Cancelled);

        let dev = h.device.lock().unwrap();
        let pass_at = dev
            .ops
            .iter()
            .position(|op| matches!(op, Op::Write(u, _) if *u == gatt::CHAR_PASSWORD_UUID))
            .unwrap();
        assert_eq!(dev.ops[pass_at + 1..], [Op::Disconnect]);
        assert!(h.api.lock().unwrap().claims.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_from_ready_releases_link() {
        let mut h = harness();
        connected(&mut h).await;
        h.session.cancel().await;
        assert_eq!(h.session.state(), &SessionState::Cancelled);
        assert_eq!(h.device.lock().unwrap().ops.last(), Some(&Op::Disconnect));
        assert!(!h.device.lock().unwrap().connected);
    }

    #[tokio::test]
    async fn test_cancel_during_reboot_grace_never_claims() {
        let config = SessionConfig {
            settle_delay: Duration::ZERO,
            reboot_grace: Duration::from_secs(600),
            ..SessionConfig::default()
        };
        let mut h = harness_with(FakeDevice::led(MAC), FakeApi::new(), config);
        connected(&mut h).await;
        let handle = h.session.cancel_handle();
        h.device.lock().unwrap().cancel_on_write = Some((gatt::CHAR_COMMAND_UUID, handle));

        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled);
        assert_eq!(h.session.state(), &SessionState::Cancelled);
        assert!(h.api.lock().unwrap().claims.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_unanswered_write() {
        let mut h = harness();
        connected(&mut h).await;
        h.device.lock().unwrap().hang_on_write = Some(gatt::CHAR_PASSWORD_UUID);

        let handle = h.session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), h.session.submit(home_request(4)))
            .await
            .expect("submit did not return after cancel")
            .unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled);
        assert_eq!(h.session.state(), &SessionState::Cancelled);

        let dev = h.device.lock().unwrap();
        assert_eq!(dev.ops.last(), Some(&Op::Disconnect));
        assert!(!dev.connected);
        assert!(dev.writes().iter().all(|(u, _)| *u != gatt::CHAR_IDS_UUID));
        assert!(h.api.lock().unwrap().claims.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_between_writes() {
        let config = SessionConfig {
            settle_delay: Duration::from_millis(500),
            reboot_grace: Duration::ZERO,
            ..SessionConfig::default()
        };
        let mut h = harness_with(FakeDevice::led(MAC), FakeApi::new(), config);
        connected(&mut h).await;

        let start = tokio::time::Instant::now();
        h.session.submit(home_request(4)).await.unwrap();

        let dev = h.device.lock().unwrap();
        // SSID, password, IDs, save
        assert_eq!(dev.write_times.len(), 4);
        assert_eq!(dev.write_times[0], start);
        for pair in dev.write_times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
        let total = dev.write_times[3] - start;
        assert!(total >= Duration::from_millis(1500));
        assert!(total < Duration::from_millis(1510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_settle_delay_stops_writes() {
        let config = SessionConfig {
            settle_delay: Duration::from_millis(500),
            reboot_grace: Duration::ZERO,
            ..SessionConfig::default()
        };
        let mut h = harness_with(FakeDevice::led(MAC), FakeApi::new(), config);
        connected(&mut h).await;

        let handle = h.session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            handle.cancel();
        });

        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled);
        assert_eq!(h.session.state(), &SessionState::Cancelled);

        let dev = h.device.lock().unwrap();
        let written: Vec<Uuid> = dev.writes().into_iter().map(|(u, _)| u).collect();
        assert_eq!(written, vec![gatt::CHAR_SSID_UUID]);
        assert_eq!(dev.ops.last(), Some(&Op::Disconnect));
    }

    #[tokio::test]
    async fn test_cancel_while_idle_applies_to_next_scan() {
        let mut h = harness();
        h.session.cancel_handle().cancel();

        let err = h.session.start_scan().await.unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled);
        assert_eq!(h.session.state(), &SessionState::Cancelled);
        assert!(!h.device.lock().unwrap().ops.contains(&Op::Scan));

        h.session.start_scan().await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Ready);
    }

    #[tokio::test]
    async fn test_missing_service_fails_and_disconnects() {
        let mut device = FakeDevice::led(MAC);
        device.services = vec![Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb)];
        let mut h = harness_with(device, FakeApi::new(), test_config());

        let err = h.session.start_scan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceNotFound);
        assert_eq!(failure_kind(h.session.state()), Some(ErrorKind::ServiceNotFound));
        assert_eq!(h.device.lock().unwrap().ops.last(), Some(&Op::Disconnect));
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_and_disconnects() {
        let mut device = FakeDevice::led(MAC);
        device.characteristics.retain(|c| *c != gatt::CHAR_IDS_UUID);
        let mut h = harness_with(device, FakeApi::new(), test_config());

        let err = h.session.start_scan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceNotFound);
        assert!(err.to_string().contains(&gatt::CHAR_IDS_UUID.to_string()));
        assert_eq!(failure_kind(h.session.state()), Some(ErrorKind::ServiceNotFound));
        assert_eq!(h.device.lock().unwrap().ops.last(), Some(&Op::Disconnect));
    }

    #[tokio::test]
    async fn test_connect_error_retries_from_idle() {
        let mut device = FakeDevice::led(MAC);
        device.connect_error = Some(TransportError::Timeout(Duration::from_secs(20)));
        let mut h = harness_with(device, FakeApi::new(), test_config());

        let err = h.session.start_scan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        match h.session.state() {
            SessionState::Failed(f) => assert_eq!(f.retry_point(), RetryPoint::Idle),
            other => panic!("unexpected state {other:?}"),
        }

        h.device.lock().unwrap().connect_error = None;
        h.session.start_scan().await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Ready);
    }

    #[tokio::test]
    async fn test_no_adapter_is_ble_unsupported() {
        let mut device = FakeDevice::led(MAC);
        device.scan_error = Some(TransportError::Unsupported("No BLE adapter found".into()));
        let mut h = harness_with(device, FakeApi::new(), test_config());
        let err = h.session.start_scan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BleUnsupported);
    }

    #[tokio::test]
    async fn test_collect_mode_waits_for_selection() {
        let mut device = FakeDevice::led(MAC);
        device.peripherals.push(DiscoveredPeripheral {
            id: "hci0/dev_11_22".to_string(),
            name: None,
            rssi: Some(-40),
            services: vec![gatt::PROV_SERVICE_UUID],
        });
        device.peripherals[0].services = vec![gatt::PROV_SERVICE_UUID];
        let config = SessionConfig {
            match_rule: MatchRule::Service(gatt::PROV_SERVICE_UUID),
            scan_mode: ScanMode::Collect,
            ..test_config()
        };
        let mut h = harness_with(device, FakeApi::new(), config);

        let ids: Vec<String> = h
            .session
            .start_scan()
            .await
            .unwrap()
            .iter()
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(ids, vec!["hci0/dev_11_22", "hci0/dev_AA_BB"]);
        assert_eq!(h.session.state(), &SessionState::Scanning);

        h.session.connect("hci0/dev_AA_BB").await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Ready);
        assert!(h
            .device
            .lock()
            .unwrap()
            .ops
            .contains(&Op::Connect("hci0/dev_AA_BB".to_string())));
    }

    #[tokio::test]
    async fn test_validation_keeps_session_ready() {
        let mut h = harness();
        connected(&mut h).await;

        let mut request = home_request(4);
        request.location = None;
        let err = h.session.submit(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.session.state(), &SessionState::Ready);

        let mut request = home_request(4);
        request.network = Some(NetworkCredentials {
            ssid: "  ".to_string(),
            password: "secret123".to_string(),
        });
        assert_eq!(h.session.submit(request).await.unwrap_err().kind(), ErrorKind::Validation);
        assert!(h.device.lock().unwrap().writes().is_empty());
    }

    #[tokio::test]
    async fn test_identity_read_failure_is_not_fatal() {
        let mut device = FakeDevice::led(MAC);
        device
            .reads
            .insert(gatt::CHAR_POP_UUID, Err(TransportError::Timeout(Duration::from_secs(5))));
        let mut h = harness_with(device, FakeApi::new(), test_config());
        h.session.start_scan().await.unwrap();

        let err = h.session.read_identity().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadError);
        assert_eq!(h.session.state(), &SessionState::Ready);
        assert!(h.session.identity().mac.is_some());

        // Without a PoP the claim cannot happen, so nothing is written
        let err = h.session.submit(home_request(4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadError);
        assert_eq!(h.session.state(), &SessionState::Ready);
        assert!(h.device.lock().unwrap().writes().is_empty());

        // Once the read succeeds the earlier MAC is kept and the flow completes
        h.device
            .lock()
            .unwrap()
            .reads
            .insert(gatt::CHAR_POP_UUID, Ok(POP.to_vec()));
        h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Done { device_id: 17 });
    }

    #[tokio::test]
    async fn test_keep_existing_network_skips_wifi_writes() {
        let mut h = harness();
        connected(&mut h).await;
        let request = ProvisionRequest {
            network: None,
            location: Some(LocationChoice::Name("kitchen".to_string())),
            device_name: None,
        };
        h.session.submit(request).await.unwrap();

        let writes = h.device.lock().unwrap().writes();
        assert_eq!(
            writes,
            vec![
                (gatt::CHAR_IDS_UUID, b"1,51,AABBCCDDEEFF".to_vec()),
                (gatt::CHAR_COMMAND_UUID, vec![0x01]),
            ]
        );
        assert_eq!(h.api.lock().unwrap().claims[0].location_id, 51);
    }

    #[tokio::test]
    async fn test_configured_customer_id_skips_lookup() {
        let config = SessionConfig {
            customer_id: Some("42".to_string()),
            ..test_config()
        };
        let mut h = harness_with(FakeDevice::led(MAC), FakeApi::new(), config);
        connected(&mut h).await;
        h.session.submit(home_request(4)).await.unwrap();
        assert_eq!(h.session.linkage().unwrap().customer_id, "42");
    }

    #[tokio::test]
    async fn test_maintenance_commands() {
        let mut h = harness();
        connected(&mut h).await;
        assert_eq!(h.session.read_device_status().await.unwrap(), DeviceStatus::Ready);

        h.device.lock().unwrap().reboot_on_save = false;
        h.session.send_command(DeviceCommand::ClearWifi).await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Ready);
        assert_eq!(
            h.session.send_command(DeviceCommand::Save).await.unwrap_err().kind(),
            ErrorKind::Validation
        );

        h.session.send_command(DeviceCommand::FactoryReset).await.unwrap();
        assert_eq!(h.session.state(), &SessionState::Idle);
        assert_eq!(h.device.lock().unwrap().ops.last(), Some(&Op::Disconnect));
    }

    #[tokio::test]
    async fn test_provision_convenience_flow() {
        let mut h = harness();
        let record = h.session.provision(home_request(4)).await.unwrap();
        assert_eq!(record.id, 17);
        assert_eq!(h.session.status_text(), "Device registered (id 17).");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = NetworkCredentials {
            ssid: "HomeNet".to_string(),
            password: "secret123".to_string(),
        };
        let text = format!("{creds:?}");
        assert!(text.contains("HomeNet"));
        assert!(!text.contains("secret123"));
    }

    #[test]
    fn test_oversized_broker_url_is_dropped_from_plan() {
        let linkage = BackendLinkage {
            customer_id: "1".to_string(),
            location_id: 4,
            device_id: "AABBCCDDEEFF".to_string(),
            broker_url: Some(format!("mqtt://{}", "b".repeat(200))),
        };
        let steps: Vec<WriteStep> = plan_writes(None, &linkage)
            .unwrap()
            .into_iter()
            .map(|w| w.step)
            .collect();
        assert_eq!(steps, vec![WriteStep::Ids, WriteStep::Save]);
    }
}
