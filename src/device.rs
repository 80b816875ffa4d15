//! A remote Hilo device as seen by the bridge.
//!
//! The declared attribute names are fixed when the device list is applied; the
//! fetched values live in an explicit name → value map seeded with those names.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::client::{HiloClient, HiloError};
use crate::models::hilo::{DeviceDescriptor, DeviceId, RawAttributes, GATEWAY_TYPE};
use crate::utils::attribute_string;

/// Attributes whose value is logged at debug level on every sync.
const LOGGED_ATTRIBUTES: [&str; 4] = ["CurrentTemperature", "TargetTemperature", "Power", "Heating"];
const DISCONNECTED: &str = "Disconnected";
const NONE_SENTINEL: &str = "None";
const ENTITY_PREFIX: &str = "sensor.hilo_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    /// Locally synthesized hub device; read-only.
    Gateway,
    /// Any type served by the per-device endpoints (thermostat, switch, meter...).
    Remote(String),
}

impl DeviceType {
    pub fn from_tag(tag: &str) -> Self {
        if tag == GATEWAY_TYPE {
            DeviceType::Gateway
        } else {
            DeviceType::Remote(tag.to_string())
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            DeviceType::Gateway => GATEWAY_TYPE,
            DeviceType::Remote(t) => t,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    id: DeviceId,
    name: String,
    device_type: DeviceType,
    category: Option<String>,
    supported_attributes: Vec<String>,
    settable_attributes: Vec<String>,
    device_url: String,
    /// Gateway payload built from gateway info; used instead of a remote fetch.
    synthesized: Option<RawAttributes>,
    /// Last non-empty fetch, keys lower-cased.
    raw_attributes: RawAttributes,
    values: BTreeMap<String, Option<Value>>,
    last_update: Option<DateTime<Utc>>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

fn split_attribute_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Declared attribute names: sentinel "None" removed, "Disconnected" always present.
pub fn normalize_supported(raw: Option<&str>) -> Vec<String> {
    let mut attrs: Vec<String> = split_attribute_list(raw)
        .into_iter()
        .filter(|a| a != NONE_SENTINEL)
        .collect();
    // Devices like smoke detectors don't declare it but it can be fetched
    if !attrs.iter().any(|a| a.eq_ignore_ascii_case(DISCONNECTED)) {
        attrs.push(DISCONNECTED.to_string());
    }
    attrs
}

impl Device {
    pub fn new(id: DeviceId) -> Self {
        Device {
            id,
            name: String::new(),
            device_type: DeviceType::Remote(String::new()),
            category: None,
            supported_attributes: Vec::new(),
            settable_attributes: Vec::new(),
            device_url: String::new(),
            synthesized: None,
            raw_attributes: RawAttributes::new(),
            values: BTreeMap::new(),
            last_update: None,
        }
    }

    fn tag(&self) -> String {
        format!("[Device {} ({})]", self.name, self.device_type.tag())
    }

    /// Apply the declared attributes from a device-list entry, in place.
    pub fn apply_descriptor(&mut self, desc: &DeviceDescriptor, device_url: String, synthesized: Option<RawAttributes>) {
        self.name = desc.name.clone().unwrap_or_default();
        self.device_type = DeviceType::from_tag(&desc.device_type);
        self.category = desc.category.clone();
        self.supported_attributes = normalize_supported(desc.supported_attributes.as_deref());
        self.settable_attributes = split_attribute_list(desc.settable_attributes.as_deref());
        self.device_url = device_url;
        self.synthesized = synthesized;
        debug!("{} Setting attributes {:?}", self.tag(), desc);

        let mut values = BTreeMap::new();
        for name in &self.supported_attributes {
            let previous = self.values.remove(name).flatten();
            values.insert(name.clone(), previous);
        }
        self.values = values;
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> &DeviceType {
        &self.device_type
    }

    pub fn is_gateway(&self) -> bool {
        self.device_type == DeviceType::Gateway
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn settable_attributes(&self) -> &[String] {
        &self.settable_attributes
    }

    pub fn device_url(&self) -> &str {
        &self.device_url
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(Option::as_ref)
    }

    pub fn values(&self) -> &BTreeMap<String, Option<Value>> {
        &self.values
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    fn load_attributes(&self, client: &mut HiloClient) -> Result<RawAttributes, HiloError> {
        match &self.synthesized {
            Some(attrs) => Ok(attrs.clone()),
            None => client.device_attributes(&self.device_url),
        }
    }

    pub fn fetch_attributes(&mut self, client: &mut HiloClient) -> Result<(), HiloError> {
        let mut fetched = self.load_attributes(client)?;
        if fetched.is_empty() && self.raw_attributes.is_empty() {
            debug!("{} Empty data returned by hilo, retrying to get attributes", self.tag());
            fetched = self.load_attributes(client)?;
        }
        if fetched.is_empty() {
            debug!("{} Empty data returned by hilo", self.tag());
            return Ok(());
        }
        self.raw_attributes = fetched.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect();
        debug!("{} get_device_attributes (raw): {:?}", self.tag(), self.raw_attributes);
        Ok(())
    }

    /// Optimistically set `name` locally, then write it to the device.
    pub fn push_attribute(&mut self, client: &mut HiloClient, name: &str, value: Value) -> Result<(), HiloError> {
        if self.is_gateway() {
            debug!("{} is read-only, ignoring {} = {}", self.tag(), name, value);
            return Ok(());
        }
        if !self.settable_attributes.iter().any(|a| a == name) {
            warn!("{} {} is not declared settable", self.tag(), name);
        }
        debug!("{} setting remote attribute {} to {}", self.tag(), name, value);
        let encoded = attribute_string(&value);
        self.values.insert(name.to_string(), Some(value));
        client.put_attribute(&self.device_url, name, &encoded)
    }

    /// Fetch the live values and copy every declared attribute into the value map.
    pub fn sync(&mut self, client: &mut HiloClient) -> Result<(), HiloError> {
        self.fetch_attributes(client)?;
        self.last_update = Some(client.now());
        debug!("{} update_device attributes: {:?}", self.tag(), self.supported_attributes);
        for name in &self.supported_attributes {
            let value = self
                .raw_attributes
                .get(&name.to_lowercase())
                .and_then(|entry| entry.get("value"))
                .filter(|v| !v.is_null())
                .cloned();
            if LOGGED_ATTRIBUTES.contains(&name.as_str()) {
                debug!("{} setting local attribute {} to {:?}", self.tag(), name, value);
            }
            self.values.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Host entity mirroring this device, e.g. `sensor.hilo_thermostat_12`.
    pub fn entity_id(&self) -> String {
        format!("{}{}_{}", ENTITY_PREFIX, slug(self.device_type.tag()), slug(&self.id.0))
    }

    /// `unknown` before the first sync, `unavailable` while disconnected, `online` otherwise.
    pub fn entity_state(&self) -> &'static str {
        if self.last_update.is_none() {
            "unknown"
        } else if self.value(DISCONNECTED).and_then(Value::as_bool) == Some(true) {
            "unavailable"
        } else {
            "online"
        }
    }

    /// Every declared value plus the descriptor fields, as host entity attributes.
    pub fn entity_attributes(&self) -> Map<String, Value> {
        let mut attrs: Map<String, Value> = self
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or(Value::Null)))
            .collect();
        attrs.insert("friendly_name".into(), json!(self.name));
        attrs.insert("hilo_id".into(), json!(self.id.0));
        attrs.insert("device_type".into(), json!(self.device_type.tag()));
        attrs.insert("category".into(), json!(self.category()));
        attrs.insert("settable_attributes".into(), json!(self.settable_attributes()));
        if let Some(at) = self.last_update() {
            attrs.insert("last_update".into(), json!(at.to_rfc3339()));
        }
        attrs
    }
}

fn slug(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
