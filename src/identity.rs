//! Device identity read from the provisioning service.

use crate::gatt::{MAC_LEN, POP_LEN};

/// 6-byte hardware address as read from the MAC characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; MAC_LEN]);

impl MacAddress {
    pub fn new(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, String> {
        let bytes: [u8; MAC_LEN] = data
            .try_into()
            .map_err(|_| format!("expected {MAC_LEN} MAC bytes, got {}", data.len()))?;
        Ok(Self(bytes))
    }

    pub fn bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    /// `AABBCCDDEEFF`, used as the device-id placeholder in the IDs payload.
    pub fn compact(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Default device name: `Smart LED` plus the last two bytes.
    pub fn default_device_name(&self) -> String {
        format!("Smart LED {}", hex::encode_upper(&self.0[MAC_LEN - 2..]))
    }
}

/// `AA:BB:CC:DD:EE:FF`
impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02X}")).collect();
        f.write_str(&parts.join(":"))
    }
}

impl std::str::FromStr for MacAddress {
    type Err = String;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-...` or bare `AABBCCDDEEFF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits).map_err(|e| format!("invalid MAC address '{s}': {e}"))?;
        Self::from_slice(&bytes).map_err(|e| format!("invalid MAC address '{s}': {e}"))
    }
}

/// Proof-of-Possession secret. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct ProofOfPossession(Vec<u8>);

impl ProofOfPossession {
    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        if data.len() != POP_LEN {
            return Err(format!("expected {POP_LEN} PoP bytes, got {}", data.len()));
        }
        Ok(Self(data.to_vec()))
    }

    /// Parse the lowercase-hex transport form (used when retrying a claim).
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("invalid PoP hex: {e}"))?;
        if bytes.is_empty() {
            return Err("PoP must not be empty".to_string());
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for ProofOfPossession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProofOfPossession(<{} bytes>)", self.0.len())
    }
}

/// Identity of the connected peripheral. Either half may be missing if its
/// read failed; the session refuses to write until both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: Option<MacAddress>,
    pub pop: Option<ProofOfPossession>,
}

impl DeviceIdentity {
    pub fn is_complete(&self) -> bool {
        self.mac.is_some() && self.pop.is_some()
    }
}
