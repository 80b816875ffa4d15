//! Seams to the home-automation host: its state store and service dispatcher.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn numeric_state(&self) -> Option<f64> {
        self.state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

pub trait StateStore {
    fn get_state(&self, entity_id: &str) -> Option<EntityState>;

    /// Replace the entity's state and attributes.
    fn set_state(&self, entity_id: &str, state: &str, attributes: Map<String, Value>);

    fn all_states(&self) -> Vec<EntityState>;
}

pub trait ServiceDispatcher {
    /// Fire and forget.
    fn invoke_service(&self, domain: &str, service: &str, payload: Value);

    /// Unregister every service of `domain`; later calls into it are dropped.
    fn remove_domain(&self, domain: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Keep the entity's current state value and only patch attributes.
    pub keep_state: bool,
    /// Create the entity when it does not exist yet.
    pub force: bool,
}

/// Merge `new_attrs` over the entity's current attributes and write it back.
///
/// Every write stamps `last_update`. Entities carrying a `Cost` attribute get it
/// mirrored from the state. Returns false when the entity is missing and
/// `opts.force` is unset.
pub fn write_state(
    store: &dyn StateStore,
    entity_id: &str,
    state: Option<&str>,
    new_attrs: Map<String, Value>,
    opts: WriteOptions,
    now: DateTime<Utc>,
) -> bool {
    let current = store.get_state(entity_id);
    if current.is_none() && !opts.force {
        warn!(
            "Unable to set state because there's no current: entity={}, state={:?}, new_attrs={:?}",
            entity_id, state, new_attrs
        );
        return false;
    }
    debug!("Setting state entity={} state={:?} keep_state={}", entity_id, state, opts.keep_state);

    let mut attrs = current.as_ref().map(|c| c.attributes.clone()).unwrap_or_default();
    attrs.insert("last_update".into(), Value::String(now.to_rfc3339()));
    attrs.extend(new_attrs);

    let state = match (&current, opts.keep_state) {
        (Some(c), true) => c.state.clone(),
        _ => state.unwrap_or("unknown").to_string(),
    };
    if attrs.contains_key("Cost") {
        attrs.insert("Cost".into(), Value::String(state.clone()));
    }
    store.set_state(entity_id, &state, attrs);
    true
}
