//! Tariff tier selection and the derived states that follow from it.
//!
//! The tier is a pure function of today's consumption, the active plan and the
//! local time of day. It is republished onto the current-rate sensor, pushed to
//! every Hilo utility meter, and used as the occasion to patch energy sensors
//! that were created without unit or device class.

use chrono::NaiveTime;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::host::{write_state, EntityState, ServiceDispatcher, StateStore, WriteOptions};
use crate::utils::Clock;

pub const ENERGY_BASE_SENSOR: &str = "sensor.hilo_energy_total_daily_low";
pub const CURRENT_RATE_SENSOR: &str = "sensor.hilo_rate_current";
const RATE_SENSOR_PREFIX: &str = "sensor.hilo_rate_";
const UTILITY_METER_PREFIX: &str = "utility_meter.hilo_energy";
const ENERGY_SENSOR_PREFIX: &str = "sensor.hilo_energy";
const COST_SUFFIX: &str = "_cost";

pub const UTILITY_METER_DOMAIN: &str = "utility_meter";
pub const SERVICE_SELECT_TARIFF: &str = "select_tariff";
const ATTR_TARIFF: &str = "tariff";
const ATTR_SOURCE: &str = "source";
const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
const ATTR_DEVICE_CLASS: &str = "device_class";
const DEVICE_CLASS_ENERGY: &str = "energy";

pub const DEFAULT_PLAN_NAME: &str = "rate d";
pub const DEFAULT_HIGH_PERIODS: &str = "am=06:00-09:00,pm=16:00-20:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rates in $/kWh. A zero `high` rate means the plan has no peak pricing.
#[derive(Debug, Clone, PartialEq)]
pub struct TariffPlan {
    pub low_threshold: f64,
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl TariffPlan {
    pub fn builtin(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rate d" => Some(TariffPlan {
                low_threshold: 40.0,
                low: 0.06159,
                medium: 0.09502,
                high: 0.0,
            }),
            "flex d" => Some(TariffPlan {
                low_threshold: 40.0,
                low: 0.04336,
                medium: 0.07456,
                high: 0.51761,
            }),
            _ => None,
        }
    }

    pub fn high_enabled(&self) -> bool {
        self.high > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighPeriod {
    pub name: String,
    pub from: NaiveTime,
    pub to: NaiveTime,
}

impl HighPeriod {
    /// Both bounds inclusive.
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.from <= t && t <= self.to
    }
}

/// Parse `name=HH:MM-HH:MM` entries separated by commas.
pub fn parse_high_periods(raw: &str) -> Result<Vec<HighPeriod>, String> {
    let mut periods = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, range) = entry
            .split_once('=')
            .ok_or_else(|| format!("high period `{}` must look like name=HH:MM-HH:MM", entry))?;
        let (from, to) = range
            .split_once('-')
            .ok_or_else(|| format!("high period `{}` is missing `-`", entry))?;
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .map_err(|e| format!("high period `{}`: invalid time `{}`: {}", entry, s.trim(), e))
        };
        let (from, to) = (parse(from)?, parse(to)?);
        if from > to {
            return Err(format!("high period `{}` ends before it starts", entry));
        }
        periods.push(HighPeriod {
            name: name.trim().to_string(),
            from,
            to,
        });
    }
    Ok(periods)
}

#[derive(Debug, Clone)]
pub struct TariffConfig {
    pub plan_name: String,
    pub plan: TariffPlan,
    pub high_periods: Vec<HighPeriod>,
}

/// Tier for a consumption reading. `energy_used` is `None` when unreadable.
pub fn compute_tier(energy_used: Option<f64>, plan: &TariffPlan, in_high_period: bool) -> Tier {
    let mut tier = Tier::Low;
    if energy_used.is_some_and(|e| e >= plan.low_threshold) {
        tier = Tier::Medium;
    }
    if plan.high_enabled() && in_high_period {
        tier = Tier::High;
    }
    tier
}

pub struct TariffEngine {
    config: TariffConfig,
    clock: Arc<dyn Clock>,
}

impl TariffEngine {
    pub fn new(config: TariffConfig, clock: Arc<dyn Clock>) -> Self {
        TariffEngine { config, clock }
    }

    pub fn in_high_period(&self) -> bool {
        let now = self.clock.local_time();
        self.config.high_periods.iter().any(|p| p.contains(now))
    }

    /// Recompute the tier and propagate it.
    ///
    /// Until the base energy sensor exists nothing is published and the tier is
    /// `low`. A present but unreadable reading counts as no consumption.
    pub fn recompute(&self, states: &dyn StateStore, services: &dyn ServiceDispatcher) -> Tier {
        let Some(energy) = states.get_state(ENERGY_BASE_SENSOR) else {
            warn!("check_tarif: Unable to find state for {}", ENERGY_BASE_SENSOR);
            return Tier::Low;
        };
        let energy_used = energy.numeric_state();
        if energy_used.is_none() {
            warn!("Unable to restore a valid state of {}: {}", ENERGY_BASE_SENSOR, energy.state);
        }
        let peak = self.in_high_period();
        let tier = compute_tier(energy_used, &self.config.plan, peak);
        debug!(
            "check_tarif: Current plan: {} Target Tarif: {} Energy used: {:?} Peak: {}",
            self.config.plan_name, tier, energy_used, peak
        );

        self.publish_rate(states, tier);
        for state in states.all_states() {
            self.select_meter_tariff(services, &state, tier);
            if state.entity_id.starts_with(ENERGY_SENSOR_PREFIX) && !state.entity_id.ends_with(COST_SUFFIX) {
                self.repair_utility_sensor(states, &state);
            }
        }
        tier
    }

    /// Copy the tier's reference rate onto the current-rate sensor when it differs.
    fn publish_rate(&self, states: &dyn StateStore, tier: Tier) {
        let target_id = format!("{}{}", RATE_SENSOR_PREFIX, tier);
        let Some(target) = states.get_state(&target_id) else {
            warn!("check_tarif: Unable to find state for {}", target_id);
            return;
        };
        let current = states.get_state(CURRENT_RATE_SENSOR);
        if current.as_ref().is_some_and(|c| c.state == target.state) {
            return;
        }
        debug!(
            "check_tarif: Updating current cost, was {:?} now {}",
            current.map(|c| c.state),
            target.state
        );
        write_state(
            states,
            CURRENT_RATE_SENSOR,
            Some(&target.state),
            Map::new(),
            WriteOptions::default(),
            self.clock.now(),
        );
    }

    fn select_meter_tariff(&self, services: &dyn ServiceDispatcher, state: &EntityState, tier: Tier) {
        if !state.entity_id.starts_with(UTILITY_METER_PREFIX) || state.state == tier.as_str() {
            return;
        }
        debug!(
            "check_tarif: Changing tarif of {} from {} to {}",
            state.entity_id, state.state, tier
        );
        services.invoke_service(
            UTILITY_METER_DOMAIN,
            SERVICE_SELECT_TARIFF,
            json!({ ATTR_TARIFF: tier.as_str(), "entity_id": state.entity_id }),
        );
    }

    /// Utility meters are created without unit and device class; borrow them
    /// from the source sensor.
    fn repair_utility_sensor(&self, states: &dyn StateStore, state: &EntityState) {
        let Some(source) = state.attribute(ATTR_SOURCE).and_then(Value::as_str) else {
            debug!("No source entity defined on {}", state.entity_id);
            return;
        };
        if state.attributes.contains_key(ATTR_UNIT_OF_MEASUREMENT) && state.attributes.contains_key(ATTR_DEVICE_CLASS) {
            return;
        }
        let Some(parent) = states.get_state(source) else {
            warn!("Unable to find state for parent unit {} of {}", source, state.entity_id);
            return;
        };
        let mut new_attrs = Map::new();
        if let Some(unit) = parent.attribute(ATTR_UNIT_OF_MEASUREMENT).filter(|u| !u.is_null()) {
            new_attrs.insert(ATTR_UNIT_OF_MEASUREMENT.into(), unit.clone());
        }
        new_attrs.insert(
            ATTR_DEVICE_CLASS.into(),
            parent
                .attribute(ATTR_DEVICE_CLASS)
                .cloned()
                .unwrap_or_else(|| Value::String(DEVICE_CLASS_ENERGY.into())),
        );
        warn!("Fixing utility sensor: {} new_attrs: {:?}", state.entity_id, new_attrs);
        let opts = WriteOptions {
            keep_state: true,
            force: false,
        };
        write_state(states, &state.entity_id, None, new_attrs, opts, self.clock.now());
    }
}
