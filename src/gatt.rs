// Smart-LED provisioning GATT layout
//
// The firmware exposes one primary service with read characteristics for the
// device identity and write characteristics for the network + backend
// linkage. A single command byte persists the staged configuration and
// reboots the device.
//
// Service UUID: 12345678-9abc-def0-1234-56789abcdef0

use crate::ble_common;
use uuid::Uuid;

// ============================================================================
// GATT UUIDs
// ============================================================================

pub const PROV_SERVICE_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef0);
pub const CHAR_MAC_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdee0);
pub const CHAR_POP_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdee1);
pub const CHAR_SSID_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef1);
pub const CHAR_PASSWORD_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef2);
pub const CHAR_STATUS_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef3);
pub const CHAR_COMMAND_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef4);
pub const CHAR_IDS_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef5);
pub const CHAR_BROKER_URL_UUID: Uuid = ble_common::uuid_from_fields(0x12345678, 0x9abc, 0xdef0, 0x1234, 0x56789abcdef8);

/// Name the firmware advertises while waiting for provisioning.
pub const DEFAULT_ADVERTISED_NAME: &str = "LED_WiFi_Config";

pub const MAC_LEN: usize = 6;
pub const POP_LEN: usize = 32;

/// Firmware-side buffer limit for the broker URL characteristic.
pub const BROKER_URL_MAX_LEN: usize = 128;

/// Each ID field lands in a 36-char buffer on the device; longer values
/// would be silently truncated there.
pub const ID_FIELD_MAX_LEN: usize = 36;

/// Three field buffers (with NUL) plus two separators, minus one: the
/// firmware rejects payloads of 113 bytes or more.
pub const IDS_MAX_LEN: usize = 3 * (ID_FIELD_MAX_LEN + 1) + 2 - 1;

// ============================================================================
// Command byte values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Persist staged WiFi + linkage config and reboot.
    Save,
    /// Erase the stored WiFi config only.
    ClearWifi,
    /// Unbind the device and wipe its config. PoP survives.
    FactoryReset,
}

impl DeviceCommand {
    pub fn byte(self) -> u8 {
        match self {
            DeviceCommand::Save => 0x01,
            DeviceCommand::ClearWifi => 0x02,
            DeviceCommand::FactoryReset => 0x03,
        }
    }

    /// Commands after which the firmware drops the link and restarts.
    pub fn reboots(self) -> bool {
        matches!(self, DeviceCommand::Save | DeviceCommand::FactoryReset)
    }
}

// ============================================================================
// Status characteristic
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ready,
    SsidSet,
    PasswordSet,
    Saved,
    Error,
    Unknown(u8),
}

impl DeviceStatus {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x00 => DeviceStatus::Ready,
            0x01 => DeviceStatus::SsidSet,
            0x02 => DeviceStatus::PasswordSet,
            0x03 => DeviceStatus::Saved,
            0xFF => DeviceStatus::Error,
            other => DeviceStatus::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Ready => "ready",
            DeviceStatus::SsidSet => "ssid set",
            DeviceStatus::PasswordSet => "password set",
            DeviceStatus::Saved => "saved",
            DeviceStatus::Error => "error",
            DeviceStatus::Unknown(_) => "unknown",
        }
    }
}

// ============================================================================
// Payload encoders
// ============================================================================

/// Combined identifier payload: `<customerId>,<locationId>,<deviceId-or-mac>`.
/// The firmware splits on `,` so none of the parts may contain one.
pub fn encode_ids(customer_id: &str, location_id: i64, device_id: &str) -> Result<Vec<u8>, String> {
    if customer_id.is_empty() || device_id.is_empty() {
        return Err("customer and device identifiers must not be empty".to_string());
    }
    if customer_id.contains(',') || device_id.contains(',') {
        return Err("identifiers must not contain ','".to_string());
    }
    let location = location_id.to_string();
    for (field, value) in [("customer", customer_id), ("location", location.as_str()), ("device", device_id)] {
        if value.len() > ID_FIELD_MAX_LEN {
            return Err(format!(
                "{field} identifier is {} bytes, device stores at most {ID_FIELD_MAX_LEN}",
                value.len()
            ));
        }
    }
    let payload = format!("{customer_id},{location},{device_id}");
    if payload.len() > IDS_MAX_LEN {
        return Err(format!(
            "identifier payload is {} bytes, device accepts at most {IDS_MAX_LEN}",
            payload.len()
        ));
    }
    Ok(payload.into_bytes())
}
