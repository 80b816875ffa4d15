//! Home Assistant REST API as the host platform.
//!
//! Uses a long-lived access token against `/api/states` and `/api/services`.
//! Service calls are fire and forget: failures are logged, never returned.
//! Removing a domain marks its `*.<domain>_*` entities unavailable and drops every
//! later write or service call aimed at it.

use http::Method;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use crate::host::{EntityState, ServiceDispatcher, StateStore};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};

const UNAVAILABLE: &str = "unavailable";

#[derive(Clone)]
pub struct HassRest {
    transport: Rc<dyn HttpTransport>,
    base_url: String,
    bearer: String,
    timeout: Duration,
    removed_domains: Rc<RefCell<BTreeSet<String>>>,
}

impl HassRest {
    pub fn new(base_url: &str, token: &str, transport: Rc<dyn HttpTransport>, timeout: Duration) -> Self {
        HassRest {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: format!("Bearer {}", token),
            timeout,
            removed_domains: Rc::new(RefCell::new(BTreeSet::new())),
        }
    }

    fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<HttpResponse, TransportError> {
        let mut headers = vec![("Authorization".to_string(), self.bearer.clone())];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        self.transport.do_request(&HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            headers,
            body: body.map(Value::to_string),
            timeout: self.timeout,
        })
    }

    /// `Ok(None)` on 404.
    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, String> {
        let resp = self.send(Method::GET, path, None).map_err(|e| e.to_string())?;
        if resp.status == 404 {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(format!("http {}: {}", resp.status, resp.body));
        }
        serde_json::from_str(&resp.body).map(Some).map_err(|e| e.to_string())
    }

    fn post(&self, path: &str, body: &Value) -> Result<(), String> {
        let resp = self.send(Method::POST, path, Some(body)).map_err(|e| e.to_string())?;
        if resp.is_success() {
            Ok(())
        } else {
            Err(format!("http {}: {}", resp.status, resp.body))
        }
    }

    fn is_removed(&self, entity_id: &str) -> bool {
        let Some((_, object_id)) = entity_id.split_once('.') else {
            return false;
        };
        self.removed_domains
            .borrow()
            .iter()
            .any(|d| object_id.starts_with(&format!("{}_", d)))
    }

    fn write(&self, entity_id: &str, state: &str, attributes: Map<String, Value>) {
        let body = json!({ "state": state, "attributes": attributes });
        if let Err(e) = self.post(&format!("/api/states/{}", entity_id), &body) {
            error!("Writing state of {} failed: {}", entity_id, e);
        }
    }
}

impl StateStore for HassRest {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.get_json(&format!("/api/states/{}", entity_id)).unwrap_or_else(|e| {
            warn!("Reading state of {} failed: {}", entity_id, e);
            None
        })
    }

    fn set_state(&self, entity_id: &str, state: &str, attributes: Map<String, Value>) {
        if self.is_removed(entity_id) {
            debug!("Dropping write to {}, its domain was removed", entity_id);
            return;
        }
        self.write(entity_id, state, attributes);
    }

    fn all_states(&self) -> Vec<EntityState> {
        match self.get_json::<Vec<EntityState>>("/api/states") {
            Ok(states) => states.unwrap_or_default(),
            Err(e) => {
                warn!("Listing states failed: {}", e);
                Vec::new()
            }
        }
    }
}

impl ServiceDispatcher for HassRest {
    fn invoke_service(&self, domain: &str, service: &str, payload: Value) {
        if self.removed_domains.borrow().contains(domain) {
            debug!("Dropping {}.{} call, domain was removed", domain, service);
            return;
        }
        let path = format!("/api/services/{}/{}", domain, service);
        if let Err(e) = self.post(&path, &payload) {
            warn!("Service call {} failed: {}", path, e);
        }
    }

    fn remove_domain(&self, domain: &str) {
        warn!("Removing service domain {}", domain);
        self.removed_domains.borrow_mut().insert(domain.to_string());
        for state in self.all_states() {
            if self.is_removed(&state.entity_id) && state.state != UNAVAILABLE {
                self.write(&state.entity_id, UNAVAILABLE, state.attributes);
            }
        }
    }
}
