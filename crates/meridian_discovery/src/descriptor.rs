//! Service instance records and their registry key format.

use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};

/// One registered service instance.
///
/// Stored as JSON under [`ServiceDescriptor::build_register_key`]. The key
/// uniquely identifies a live instance, so re-registration overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub weight: u32,
    /// Lease ttl in seconds
    #[serde(default)]
    pub ttl: i64,
}

/// Resolver-side view of one instance: where it is and how much load it takes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressEntry {
    pub addr: String,
    pub weight: u32,
}

impl AddressEntry {
    pub fn new(addr: impl Into<String>, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            weight,
        }
    }
}

/// Prefix under which every instance of `name` is registered.
pub fn service_prefix(name: &str) -> String {
    format!("/{name}/")
}

impl ServiceDescriptor {
    /// `/name/addr`, or `/name/version/addr` when a version is set.
    pub fn build_register_key(&self) -> String {
        if self.version.is_empty() {
            format!("/{}/{}", self.name, self.addr)
        } else {
            format!("/{}/{}/{}", self.name, self.version, self.addr)
        }
    }

    /// Parses a registry value.
    pub fn parse_value(value: &[u8]) -> Result<Self, DiscoveryError> {
        Ok(serde_json::from_slice(value)?)
    }

    /// Recovers name, optional version and address from a registry key.
    ///
    /// Delete events carry no value, so this is the only way to learn which
    /// address went away.
    pub fn parse_key(key: &str) -> Result<Self, DiscoveryError> {
        let tokens: Vec<&str> = key.trim_start_matches('/').split('/').collect();
        match tokens.as_slice() {
            [name, addr] => Ok(Self {
                name: name.to_string(),
                addr: addr.to_string(),
                ..Default::default()
            }),
            [name, version, addr] => Ok(Self {
                name: name.to_string(),
                version: version.to_string(),
                addr: addr.to_string(),
                ..Default::default()
            }),
            _ => Err(DiscoveryError::InvalidKey(key.to_string())),
        }
    }

    pub fn to_value(&self) -> Result<String, DiscoveryError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn address_entry(&self) -> AddressEntry {
        AddressEntry::new(self.addr.clone(), self.weight)
    }
}
