//! Payloads of the Hilo Automation and GD-service APIs.
//!
//! Only the fields this bridge reads are modeled; unknown fields are ignored.
//! Device attribute payloads stay loosely typed (`name -> {"value": ...}`)
//! because every device type declares its own attribute set.

use crate::utils::string_or_number;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const GATEWAY_TYPE: &str = "Gateway";
pub const GATEWAY_NAME: &str = "hilo_gateway";

/// Attribute fields copied from the gateway-info payload onto the gateway device.
pub const GATEWAY_ATTRIBUTES: [&str; 4] = [
    "zigBeePairingActivated",
    "zigBeeChannel",
    "firmwareVersion",
    "onlineStatus",
];

/// Attribute name → `{"value": ...}` entry, as returned by the attributes endpoint.
pub type RawAttributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(#[serde(deserialize_with = "string_or_number")] pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(#[serde(deserialize_with = "string_or_number")] pub String);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&LocationId> for DeviceId {
    fn from(value: &LocationId) -> Self {
        DeviceId(value.0.clone())
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub id: LocationId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// One entry of the location's device list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Comma-joined attribute names, e.g. `"CurrentTemperature, TargetTemperature"`.
    #[serde(default)]
    pub supported_attributes: Option<String>,
    #[serde(default)]
    pub settable_attributes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    #[serde(default)]
    pub online_status: Option<String>,
    #[serde(default)]
    pub last_status_time_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub zig_bee_pairing_activated: Option<bool>,
    #[serde(default)]
    pub zig_bee_channel: Option<i64>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

impl GatewayInfo {
    pub fn is_online(&self) -> bool {
        self.online_status.as_deref() == Some("Online")
    }

    /// Attribute payload of the gateway pseudo-device, shaped like the per-device
    /// attributes endpoint.
    pub fn to_attributes(&self) -> RawAttributes {
        let mut attrs = RawAttributes::new();
        attrs.insert("Disconnected".into(), json!({ "value": !self.is_online() }));
        attrs.insert(
            "zigBeePairingActivated".into(),
            json!({ "value": self.zig_bee_pairing_activated }),
        );
        attrs.insert("zigBeeChannel".into(), json!({ "value": self.zig_bee_channel }));
        attrs.insert("firmwareVersion".into(), json!({ "value": self.firmware_version }));
        attrs.insert("onlineStatus".into(), json!({ "value": self.online_status }));
        attrs
    }
}

/// Descriptor of the gateway pseudo-device. Its id is the location id.
pub fn gateway_descriptor(location_id: &LocationId) -> DeviceDescriptor {
    DeviceDescriptor {
        id: DeviceId::from(location_id),
        name: Some(GATEWAY_NAME.to_string()),
        device_type: GATEWAY_TYPE.to_string(),
        category: Some(GATEWAY_TYPE.to_string()),
        supported_attributes: Some(GATEWAY_ATTRIBUTES.join(", ")),
        settable_attributes: Some(String::new()),
    }
}

/// Demand-response ("challenge") event from the GD service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub is_participating: Option<bool>,
}

impl Event {
    pub fn in_progress(&self) -> bool {
        self.progress.as_deref() == Some("inProgress")
    }
}
