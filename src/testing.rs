//! In-crate fakes shared by the unit tests.

use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use http::Method;
use serde_json::{json, Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::client::{Credentials, Endpoints, HiloClient};
use crate::host::{EntityState, ServiceDispatcher, StateStore};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::utils::Clock;

pub const TOKEN_URL: &str = "https://auth.test/oauth2/v2.0/token";
pub const AUTOMATION_URL: &str = "https://api.test/Automation/v1/api";
pub const GD_SERVICE_URL: &str = "https://api.test/GDService/v1/api";
pub const LOCATION: &str = "4242";

pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
    local: Cell<NaiveTime>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock {
            now: Cell::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()),
            local: Cell::new(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: TimeDelta) {
        self.now.set(self.now.get() + by);
        self.local.set(self.local.get() + by);
    }

    pub fn set_local_time(&self, hour: u32, minute: u32) {
        self.local.set(NaiveTime::from_hms_opt(hour, minute, 0).unwrap());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn local_time(&self) -> NaiveTime {
        self.local.get()
    }
}

type Handler = Box<dyn FnMut(&HttpRequest) -> Result<HttpResponse, TransportError>>;

struct FakeInner {
    handler: Handler,
    log: Vec<HttpRequest>,
}

/// Transport answering from a closure and recording every request.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Rc<RefCell<FakeInner>>,
}

impl FakeTransport {
    pub fn new(handler: impl FnMut(&HttpRequest) -> Result<HttpResponse, TransportError> + 'static) -> Self {
        FakeTransport {
            inner: Rc::new(RefCell::new(FakeInner {
                handler: Box::new(handler),
                log: Vec::new(),
            })),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner.borrow().log.clone()
    }

    /// Requests sent to exactly `url`.
    pub fn count(&self, url: &str) -> usize {
        self.inner.borrow().log.iter().filter(|r| r.url == url).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.inner.borrow().log.iter().filter(|r| r.url.starts_with(prefix)).count()
    }

    pub fn count_method(&self, method: Method) -> usize {
        self.inner.borrow().log.iter().filter(|r| r.method == method).count()
    }
}

impl HttpTransport for FakeTransport {
    fn do_request(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut inner = self.inner.borrow_mut();
        let FakeInner { handler, log } = &mut *inner;
        log.push(req.clone());
        handler(req)
    }
}

pub fn raw_response(status: u16, content_type: Option<&str>, body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status,
        content_type: content_type.map(str::to_string),
        body: body.to_string(),
    })
}

pub fn json_response(status: u16, body: Value) -> Result<HttpResponse, TransportError> {
    raw_response(status, Some("application/json; charset=utf-8"), &body.to_string())
}

pub fn text_response(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
    raw_response(status, Some("text/plain"), body)
}

pub fn bearer(req: &HttpRequest) -> Option<String> {
    req.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
        .map(|(_, v)| v.clone())
}

/// Scripted state of the fake Hilo API.
pub struct ApiState {
    pub tokens_issued: usize,
    pub locations: Value,
    pub devices: Value,
    pub gateway: Value,
    pub events: Value,
    /// Per-device attribute responses. The last entry repeats once the queue is drained.
    pub attributes: BTreeMap<String, VecDeque<Value>>,
}

impl Default for ApiState {
    fn default() -> Self {
        ApiState {
            tokens_issued: 0,
            locations: json!([{"id": 4242, "name": "Maison"}]),
            devices: json!([]),
            gateway: json!([{
                "onlineStatus": "Online",
                "zigBeePairingActivated": false,
                "zigBeeChannel": 19,
                "firmwareVersion": "2.1.2"
            }]),
            events: json!([]),
            attributes: BTreeMap::new(),
        }
    }
}

impl ApiState {
    pub fn set_attributes(&mut self, device_id: &str, responses: Vec<Value>) {
        self.attributes.insert(device_id.to_string(), responses.into());
    }

    fn next_attributes(&mut self, device_id: &str) -> Value {
        match self.attributes.get_mut(device_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| json!({})),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| json!({})),
            None => json!({}),
        }
    }
}

pub fn fake_api() -> (FakeTransport, Rc<RefCell<ApiState>>) {
    let state = Rc::new(RefCell::new(ApiState::default()));
    let api = state.clone();
    let location_url = format!("{}/Locations/{}", AUTOMATION_URL, LOCATION);
    let transport = FakeTransport::new(move |req| {
        let mut s = api.borrow_mut();
        let url = req.url.as_str();
        if url == TOKEN_URL {
            s.tokens_issued += 1;
            return json_response(200, json!({"access_token": format!("token-{}", s.tokens_issued)}));
        }
        if url == format!("{}/Locations", AUTOMATION_URL) {
            return json_response(200, s.locations.clone());
        }
        if url == format!("{}/Events?active=true", format!("{}/Locations/{}", GD_SERVICE_URL, LOCATION)) {
            return json_response(200, s.events.clone());
        }
        if url == format!("{}/Devices", location_url) {
            return json_response(200, s.devices.clone());
        }
        if url == format!("{}/Gateways/Info", location_url) {
            return json_response(200, s.gateway.clone());
        }
        if let Some(rest) = url.strip_prefix(&format!("{}/Devices/", location_url))
            && let Some(id) = rest.strip_suffix("/Attributes")
        {
            if req.method == Method::PUT {
                return raw_response(200, None, "");
            }
            return json_response(200, s.next_attributes(id));
        }
        text_response(404, "not found")
    });
    (transport, state)
}

pub fn test_endpoints() -> Endpoints {
    Endpoints {
        token_url: TOKEN_URL.to_string(),
        automation_url: AUTOMATION_URL.to_string(),
        gd_service_url: GD_SERVICE_URL.to_string(),
    }
}

pub fn test_client(transport: &FakeTransport, clock: &Arc<ManualClock>) -> HiloClient {
    let credentials = Credentials {
        username: "me@example.com".into(),
        password: "s3cret!".into(),
    };
    HiloClient::new(credentials, Box::new(transport.clone()), clock.clone()).with_endpoints(test_endpoints())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub payload: Value,
}

#[derive(Default)]
struct HostInner {
    states: BTreeMap<String, EntityState>,
    writes: Vec<String>,
    calls: Vec<ServiceCall>,
    removed_domains: Vec<String>,
}

/// In-memory host platform: state store plus service dispatcher.
#[derive(Clone, Default)]
pub struct MemoryHost {
    inner: Rc<RefCell<HostInner>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity_id: &str, state: &str, attributes: Value) {
        let attributes = match attributes {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        self.inner.borrow_mut().states.insert(
            entity_id.to_string(),
            EntityState {
                entity_id: entity_id.to_string(),
                state: state.to_string(),
                attributes,
            },
        );
    }

    pub fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.borrow().states.get(entity_id).cloned()
    }

    pub fn writes(&self) -> Vec<String> {
        self.inner.borrow().writes.clone()
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.inner.borrow().calls.clone()
    }

    pub fn removed_domains(&self) -> Vec<String> {
        self.inner.borrow().removed_domains.clone()
    }
}

impl StateStore for MemoryHost {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.state(entity_id)
    }

    fn set_state(&self, entity_id: &str, state: &str, attributes: Map<String, Value>) {
        let mut inner = self.inner.borrow_mut();
        inner.writes.push(entity_id.to_string());
        inner.states.insert(
            entity_id.to_string(),
            EntityState {
                entity_id: entity_id.to_string(),
                state: state.to_string(),
                attributes,
            },
        );
    }

    fn all_states(&self) -> Vec<EntityState> {
        self.inner.borrow().states.values().cloned().collect()
    }
}

impl ServiceDispatcher for MemoryHost {
    fn invoke_service(&self, domain: &str, service: &str, payload: Value) {
        self.inner.borrow_mut().calls.push(ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            payload,
        });
    }

    fn remove_domain(&self, domain: &str) {
        self.inner.borrow_mut().removed_domains.push(domain.to_string());
    }
}
