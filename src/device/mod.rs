//! Device identity reported to the management server.
//!
//! The metadata map is sent with every registration and update check:
//!
//! | Key                      | Source                              |
//! |--------------------------|-------------------------------------|
//! | `rdfm.software.version`  | `[device] software_version`         |
//! | `rdfm.hardware.macaddr`  | `[device] mac_address` or first NIC |
//! | `rdfm.hardware.devtype`  | `[device] device_type`              |

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::DeviceConfig;
use crate::error::DeviceError;

pub mod keys;

pub const META_SOFTWARE_VERSION: &str = "rdfm.software.version";
pub const META_MAC_ADDRESS: &str = "rdfm.hardware.macaddr";
pub const META_DEVICE_TYPE: &str = "rdfm.hardware.devtype";

const SYSFS_NET: &str = "/sys/class/net";

/// Static device attributes, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub mac_address: String,
    pub device_type: String,
    pub software_version: String,
}

impl DeviceInfo {
    /// Resolve identity from config, discovering the MAC address if unset.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let mac_address = match &config.mac_address {
            Some(mac) => normalize_mac(mac)?,
            None => discover_mac(Path::new(SYSFS_NET))?,
        };
        Ok(Self {
            mac_address,
            device_type: config.device_type.clone(),
            software_version: config.software_version.clone(),
        })
    }

    /// Metadata map in a stable key order.
    pub fn metadata(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (META_SOFTWARE_VERSION, self.software_version.clone()),
            (META_MAC_ADDRESS, self.mac_address.clone()),
            (META_DEVICE_TYPE, self.device_type.clone()),
        ])
    }
}

/// Canonicalize a MAC address to uppercase, colon-separated hex.
pub fn normalize_mac(mac: &str) -> Result<String, DeviceError> {
    let octets: Vec<&str> = mac.trim().split(|c: char| c == ':' || c == '-').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(DeviceError::InvalidMac(mac.to_string()));
    }
    Ok(octets.join(":").to_ascii_uppercase())
}

/// Pick the MAC of the first usable interface under a sysfs `class/net` root.
///
/// Loopback and all-zero addresses are skipped. Interfaces reporting
/// `operstate = up` are preferred over the rest; ties break by name.
fn discover_mac(sysfs_net: &Path) -> Result<String, DeviceError> {
    let mut candidates: Vec<(bool, String, String)> = Vec::new();
    let entries = std::fs::read_dir(sysfs_net).map_err(|_| DeviceError::NoMacAddress)?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let Ok(address) = std::fs::read_to_string(entry.path().join("address")) else {
            continue;
        };
        let Ok(mac) = normalize_mac(&address) else {
            continue;
        };
        if mac == "00:00:00:00:00:00" {
            continue;
        }
        let up = std::fs::read_to_string(entry.path().join("operstate"))
            .is_ok_and(|s| s.trim() == "up");
        candidates.push((!up, name, mac));
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .map(|(_, name, mac)| {
            tracing::debug!("Using MAC address {mac} from interface {name} as device identifier");
            mac
        })
        .ok_or(DeviceError::NoMacAddress)
}
