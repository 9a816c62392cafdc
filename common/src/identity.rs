use std::fmt;

pub const DEFAULT_TOPIC_PREFIX: &str = "vnode";

/// Hardware identity of the node, derived from the station MAC address.
///
/// Everything here is recomputed on every boot and never written to the
/// configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
}

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self { mac }
    }

    /// Parses `aa:bb:cc:dd:ee:ff` (or `-` separated) into an identity.
    pub fn parse_mac(value: &str) -> Option<Self> {
        let mut mac = [0_u8; 6];
        let mut parts = value.trim().split([':', '-']);
        for octet in mac.iter_mut() {
            *octet = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self { mac })
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// The 24-bit chip id, taken from the NIC-specific half of the MAC.
    pub fn chip_id(&self) -> u32 {
        u32::from_be_bytes([0, self.mac[3], self.mac[4], self.mac[5]])
    }

    pub fn default_topic(&self) -> String {
        format!("{DEFAULT_TOPIC_PREFIX}-{}", self.chip_id())
    }

    /// Hostname, broker client id and provisioning SSID for the given topic.
    pub fn session_id(&self, topic: &str) -> String {
        format!(
            "{topic}-{:02X}{:02X}{:02X}",
            self.mac[3], self.mac[4], self.mac[5]
        )
    }

    pub fn mac_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.mac;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}
