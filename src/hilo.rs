//! Poll orchestration: owns the client, the registry and the tariff engine.
//!
//! Everything runs on the caller's thread and takes `&mut self`, so two cycles of
//! one instance never overlap and token refreshes are single-flight.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{HiloClient, HiloError};
use crate::device::Device;
use crate::host::{write_state, ServiceDispatcher, StateStore, WriteOptions};
use crate::models::hilo::DeviceId;
use crate::registry::Registry;
use crate::tariff::{TariffEngine, Tier};
use crate::utils::Clock;

pub const DOMAIN: &str = "hilo";
pub const CHALLENGE_SENSOR: &str = "binary_sensor.hilo_challenge";

pub struct Hilo {
    client: HiloClient,
    registry: Registry,
    tariff: TariffEngine,
    states: Box<dyn StateStore>,
    services: Box<dyn ServiceDispatcher>,
    clock: Arc<dyn Clock>,
    scan_interval: TimeDelta,
    track_events: bool,
    last_poll: Option<DateTime<Utc>>,
}

impl Hilo {
    pub fn new(
        client: HiloClient,
        tariff: TariffEngine,
        states: Box<dyn StateStore>,
        services: Box<dyn ServiceDispatcher>,
        clock: Arc<dyn Clock>,
        scan_interval: Duration,
    ) -> Self {
        Hilo {
            client,
            registry: Registry::new(),
            tariff,
            states,
            services,
            clock,
            scan_interval: TimeDelta::from_std(scan_interval).unwrap_or(TimeDelta::MAX),
            track_events: false,
            last_poll: None,
        }
    }

    pub fn with_event_tracking(mut self, enabled: bool) -> Self {
        self.track_events = enabled;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.registry.get(id)
    }

    pub fn is_disabled(&self) -> bool {
        self.client.is_disabled()
    }

    /// Run a full cycle unless one ran less than a scan interval ago.
    /// Returns whether a cycle ran.
    pub fn poll_cycle(&mut self) -> Result<bool, HiloError> {
        let now = self.clock.now();
        if let Some(last) = self.last_poll
            && now - last < self.scan_interval
        {
            debug!("Poll skipped, last cycle {}s ago", (now - last).num_seconds());
            return Ok(false);
        }
        self.last_poll = Some(now);
        let result = self.run_cycle();
        self.guard(result)?;
        Ok(true)
    }

    fn run_cycle(&mut self) -> Result<(), HiloError> {
        info!("Pulling all devices");
        self.registry.refresh_all(&mut self.client)?;

        info!("Updating attributes for {} device(s)", self.registry.len());
        let now = self.clock.now();
        for device in self.registry.iter_mut() {
            device.sync(&mut self.client)?;
            publish_device(self.states.as_ref(), device, now);
        }

        if self.track_events {
            let active = self.client.active_event()?;
            self.publish_challenge(active);
        }

        self.recompute_tariff();
        Ok(())
    }

    /// Sync a single device and recompute the tariff.
    pub fn sync_device(&mut self, id: &DeviceId) -> Result<(), HiloError> {
        let result = match self.registry.get_mut(id) {
            Some(device) => device.sync(&mut self.client).map(|()| {
                publish_device(self.states.as_ref(), device, self.clock.now());
            }),
            None => Err(HiloError::UnknownDevice(id.clone())),
        };
        self.guard(result)?;
        self.recompute_tariff();
        Ok(())
    }

    /// Write one attribute to a device and republish its entity.
    pub fn set_attribute(&mut self, id: &DeviceId, name: &str, value: Value) -> Result<(), HiloError> {
        let result = match self.registry.get_mut(id) {
            Some(device) => device.push_attribute(&mut self.client, name, value).map(|()| {
                publish_device(self.states.as_ref(), device, self.clock.now());
            }),
            None => Err(HiloError::UnknownDevice(id.clone())),
        };
        self.guard(result)
    }

    pub fn recompute_tariff(&self) -> Tier {
        self.tariff.recompute(self.states.as_ref(), self.services.as_ref())
    }

    fn publish_challenge(&self, active: bool) {
        let opts = WriteOptions {
            keep_state: false,
            force: true,
        };
        let state = if active { "on" } else { "off" };
        write_state(self.states.as_ref(), CHALLENGE_SENSOR, Some(state), Map::new(), opts, self.clock.now());
    }

    /// A rejected login takes the whole integration down.
    fn guard<T>(&self, result: Result<T, HiloError>) -> Result<T, HiloError> {
        if let Err(HiloError::AuthRejected(reason)) = &result {
            error!("Unloading integration: {}", reason);
            self.services.remove_domain(DOMAIN);
        }
        result
    }
}

fn publish_device(states: &dyn StateStore, device: &Device, now: DateTime<Utc>) {
    let opts = WriteOptions {
        keep_state: false,
        force: true,
    };
    write_state(
        states,
        &device.entity_id(),
        Some(device.entity_state()),
        device.entity_attributes(),
        opts,
        now,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tariff::{parse_high_periods, TariffConfig, TariffPlan, CURRENT_RATE_SENSOR, ENERGY_BASE_SENSOR};
    use crate::testing::*;
    use http::Method;
    use serde_json::json;

    const SCAN: Duration = Duration::from_secs(60);

    fn build(transport: &FakeTransport, clock: &Arc<ManualClock>, host: &MemoryHost) -> Hilo {
        let config = TariffConfig {
            plan_name: "rate d".into(),
            plan: TariffPlan::builtin("rate d").unwrap(),
            high_periods: parse_high_periods("am=06:00-09:00").unwrap(),
        };
        Hilo::new(
            test_client(transport, clock),
            TariffEngine::new(config, clock.clone()),
            Box::new(host.clone()),
            Box::new(host.clone()),
            clock.clone(),
            SCAN,
        )
    }

    fn seed_devices(api: &std::cell::RefCell<ApiState>) {
        let mut api = api.borrow_mut();
        api.devices = json!([{
            "id": 12,
            "name": "Salon",
            "type": "Thermostat",
            "category": "Thermostat",
            "supportedAttributes": "CurrentTemperature, TargetTemperature",
            "settableAttributes": "TargetTemperature"
        }]);
        api.set_attributes("12", vec![json!({"CurrentTemperature": {"value": 20.5}})]);
    }

    #[test]
    fn poll_cycle_is_throttled_by_scan_interval() {
        let (transport, api) = fake_api();
        seed_devices(&api);
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        let mut hilo = build(&transport, &clock, &host);

        assert!(hilo.poll_cycle().unwrap());
        let after_first = transport.requests().len();

        clock.advance(TimeDelta::seconds(30));
        assert!(!hilo.poll_cycle().unwrap());
        assert_eq!(transport.requests().len(), after_first);

        clock.advance(TimeDelta::seconds(31));
        assert!(hilo.poll_cycle().unwrap());
        assert!(transport.requests().len() > after_first);
        assert_eq!(hilo.registry().len(), 2);
    }

    #[test]
    fn full_cycle_syncs_devices_and_recomputes_tariff() {
        let (transport, api) = fake_api();
        seed_devices(&api);
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        host.insert(ENERGY_BASE_SENSOR, "55", json!({}));
        host.insert("sensor.hilo_rate_medium", "0.09502", json!({}));
        host.insert(CURRENT_RATE_SENSOR, "0.06159", json!({}));
        let mut hilo = build(&transport, &clock, &host);

        hilo.poll_cycle().unwrap();
        let salon = hilo.device(&DeviceId("12".into())).unwrap();
        assert_eq!(salon.value("CurrentTemperature"), Some(&json!(20.5)));
        assert_eq!(host.state(CURRENT_RATE_SENSOR).unwrap().state, "0.09502");
        let gateway = hilo.device(&DeviceId(LOCATION.into())).unwrap();
        assert_eq!(gateway.value("Disconnected"), Some(&json!(false)));

        let entity = host.state("sensor.hilo_thermostat_12").unwrap();
        assert_eq!(entity.state, "online");
        assert_eq!(entity.attributes["CurrentTemperature"], json!(20.5));
        assert_eq!(entity.attributes["friendly_name"], json!("Salon"));
        let gateway = host.state(&format!("sensor.hilo_gateway_{}", LOCATION)).unwrap();
        assert_eq!(gateway.attributes["firmwareVersion"], json!("2.1.2"));
    }

    #[test]
    fn rejected_credentials_remove_the_domain() {
        let transport = FakeTransport::new(|_| text_response(401, "invalid_grant"));
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        let mut hilo = build(&transport, &clock, &host);

        let err = hilo.poll_cycle().unwrap_err();
        assert!(matches!(err, HiloError::AuthRejected(_)));
        assert_eq!(host.removed_domains(), vec![DOMAIN.to_string()]);
        assert!(hilo.is_disabled());

        clock.advance(TimeDelta::seconds(120));
        let err = hilo.poll_cycle().unwrap_err();
        assert!(matches!(err, HiloError::Disabled));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn exhausted_retries_propagate() {
        let transport = FakeTransport::new(|req| {
            if req.url == TOKEN_URL {
                return json_response(200, json!({"access_token": "t"}));
            }
            text_response(500, "oops")
        });
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        let mut hilo = build(&transport, &clock, &host);

        let err = hilo.poll_cycle().unwrap_err();
        assert!(matches!(err, HiloError::RetryLimit { .. }), "{}", err);
        assert!(host.removed_domains().is_empty());
    }

    #[test]
    fn set_attribute_goes_to_the_device() {
        let (transport, api) = fake_api();
        seed_devices(&api);
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        let mut hilo = build(&transport, &clock, &host);
        hilo.poll_cycle().unwrap();

        hilo.set_attribute(&DeviceId("12".into()), "TargetTemperature", json!(19))
            .unwrap();
        assert_eq!(transport.count_method(Method::PUT), 1);
        let entity = host.state("sensor.hilo_thermostat_12").unwrap();
        assert_eq!(entity.attributes["TargetTemperature"], json!(19));

        hilo.set_attribute(&DeviceId(LOCATION.into()), "zigBeeChannel", json!(11))
            .unwrap();
        assert_eq!(transport.count_method(Method::PUT), 1);

        let err = hilo
            .set_attribute(&DeviceId("999".into()), "OnOff", json!(true))
            .unwrap_err();
        assert!(matches!(err, HiloError::UnknownDevice(_)));
    }

    #[test]
    fn sync_device_recomputes_tariff() {
        let (transport, api) = fake_api();
        seed_devices(&api);
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        let mut hilo = build(&transport, &clock, &host);
        hilo.poll_cycle().unwrap();

        host.insert(ENERGY_BASE_SENSOR, "2", json!({}));
        host.insert("utility_meter.hilo_energy_total", "medium", json!({}));
        hilo.sync_device(&DeviceId("12".into())).unwrap();
        let calls = host.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["tariff"], json!("low"));
    }

    #[test]
    fn challenge_sensor_follows_events() {
        let (transport, api) = fake_api();
        api.borrow_mut().events = json!([{"id": 107, "progress": "inProgress"}]);
        let clock = ManualClock::new();
        let host = MemoryHost::new();
        let mut hilo = build(&transport, &clock, &host).with_event_tracking(true);

        hilo.poll_cycle().unwrap();
        assert_eq!(host.state(CHALLENGE_SENSOR).unwrap().state, "on");

        api.borrow_mut().events = json!([]);
        clock.advance(TimeDelta::seconds(61));
        hilo.poll_cycle().unwrap();
        assert_eq!(host.state(CHALLENGE_SENSOR).unwrap().state, "off");
    }
}
