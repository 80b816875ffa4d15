//! Blocking client for the Hilo cloud API.
//!
//! - Goes through an [`HttpTransport`] (a `ureq` agent in production).
//! - Uses the payload models in `crate::models::hilo`.
//!
//! Authentication
//! - OAuth2 password grant against the Hilo B2C tenant. Tokens are treated as
//!   valid for [`TOKEN_LIFETIME_SECS`] after issuance.
//! - Refreshes are throttled: a non-forced refresh within [`REFRESH_COOLDOWN_SECS`]
//!   of the previous one returns the previous outcome without a request.
//! - A 401 on a data endpoint forces one refresh and goes back through the retry
//!   loop. A 401 from the token endpoint means the credentials are wrong; the
//!   client disables itself and every later call fails with [`HiloError::Disabled`].

use chrono::{DateTime, TimeDelta, Utc};
use http::Method;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::http::{HttpRequest, HttpTransport, TransportError};
use crate::models::hilo::*;
use crate::utils::Clock;

const BASE_URL: &str = "https://apim.hiloenergie.com";
const API_END: &str = "v1/api";
const OAUTH_TOKEN_URL: &str = "https://hilodirectoryb2c.b2clogin.com/hilodirectoryb2c.onmicrosoft.com/oauth2/v2.0/token?p=B2C_1A_B2C_1_PasswordFlow";
const OAUTH_CLIENT_ID: &str = "9870f087-25f8-43b6-9cad-d4b74ce512e1";
const OAUTH_SCOPE: &str = "openid 9870f087-25f8-43b6-9cad-d4b74ce512e1 offline_access";
const SUBSCRIPTION_KEY: &str = "20eeaedcb86945afa3fe792cea89b8bf";

pub const TOKEN_LIFETIME_SECS: i64 = 3000;
pub const REFRESH_COOLDOWN_SECS: i64 = 120;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum HiloError {
    Transport(TransportError),
    Status { status: u16, message: String },
    Malformed { status: u16, message: String },
    AuthRejected(String),
    RetryLimit { url: String, last: Box<HiloError> },
    Disabled,
    Payload { url: String, message: String },
    UnknownDevice(DeviceId),
}

impl core::fmt::Display for HiloError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HiloError::Transport(e) => write!(f, "transport error: {}", e),
            HiloError::Status { status, message } => write!(f, "http {}: {}", status, message),
            HiloError::Malformed { status, message } => write!(f, "malformed response (http {}): {}", status, message),
            HiloError::AuthRejected(e) => write!(f, "authentication rejected: {}", e),
            HiloError::RetryLimit { url, last } => write!(f, "retry limit reached for {}: {}", url, last),
            HiloError::Disabled => write!(f, "integration disabled after authentication failure"),
            HiloError::Payload { url, message } => write!(f, "unexpected payload from {}: {}", url, message),
            HiloError::UnknownDevice(id) => write!(f, "unknown device {}", id),
        }
    }
}

impl std::error::Error for HiloError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HiloError::Transport(e) => Some(e),
            HiloError::RetryLimit { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for HiloError {
    fn from(value: TransportError) -> Self {
        HiloError::Transport(value)
    }
}

impl HiloError {
    /// True for errors after which the integration must stop calling the API.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HiloError::AuthRejected(_) | HiloError::Disabled)
    }
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Non-JSON body returned with a 2xx status.
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub token_url: String,
    pub automation_url: String,
    pub gd_service_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            token_url: OAUTH_TOKEN_URL.to_string(),
            automation_url: format!("{}/Automation/{}", BASE_URL, API_END),
            gd_service_url: format!("{}/GDService/{}", BASE_URL, API_END),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default)]
struct Session {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    location_id: Option<LocationId>,
    /// Time and outcome of the last refresh check that was not throttled.
    last_refresh: Option<(DateTime<Utc>, bool)>,
}

enum Attempt {
    Retry(HiloError),
    Fatal(HiloError),
}

pub struct HiloClient {
    transport: Box<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    endpoints: Endpoints,
    credentials: Credentials,
    timeout: Duration,
    max_retries: u32,
    session: Session,
    disabled: bool,
}

impl HiloClient {
    pub fn new(credentials: Credentials, transport: Box<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        HiloClient {
            transport,
            clock,
            endpoints: Endpoints::default(),
            credentials,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            session: Session::default(),
            disabled: false,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_retry_policy(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.timeout = timeout;
        self.max_retries = max_retries;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("Ocp-Apim-Subscription-Key".to_string(), SUBSCRIPTION_KEY.to_string())];
        if let Some(token) = &self.session.access_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        headers
    }

    /// Make sure a usable access token is held. Returns whether one is.
    pub fn refresh_token(&mut self, force: bool) -> Result<bool, HiloError> {
        let now = self.clock.now();
        if !force
            && let Some((at, outcome)) = self.session.last_refresh
            && now - at < TimeDelta::seconds(REFRESH_COOLDOWN_SECS)
        {
            return Ok(outcome);
        }

        let expired = self.session.expires_at.is_none_or(|exp| now > exp);
        debug!(
            "Refreshing token, force: {} expiration: {:?} expired: {}",
            force, self.session.expires_at, expired
        );

        let outcome = if force || self.session.access_token.is_none() || expired {
            self.session.expires_at = Some(now + TimeDelta::seconds(TOKEN_LIFETIME_SECS));
            self.session.access_token = self.fetch_access_token()?;
            self.session.access_token.is_some()
        } else {
            true
        };
        if !outcome {
            warn!("Token endpoint returned no access token");
        }
        self.session.last_refresh = Some((now, outcome));
        Ok(outcome)
    }

    fn fetch_access_token(&mut self) -> Result<Option<String>, HiloError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs([
                ("grant_type", "password"),
                ("scope", OAUTH_SCOPE),
                ("client_id", OAUTH_CLIENT_ID),
                ("response_type", "token id_token"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .finish();
        let headers = vec![(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )];
        debug!("Calling oauth2 url");
        let url = self.endpoints.token_url.clone();
        match self.call(&url, Method::POST, false, &headers, Some(body), &[])? {
            Payload::Json(v) => Ok(serde_json::from_value::<TokenResponse>(v)
                .ok()
                .and_then(|t| t.access_token)
                .filter(|t| !t.is_empty())),
            Payload::Text(_) => Ok(None),
        }
    }

    /// Generic call with bounded, immediate retries.
    ///
    /// `authenticated` calls get fresh auth headers on every attempt, so a retry
    /// after a forced refresh carries the new token.
    pub fn call(
        &mut self,
        url: &str,
        method: Method,
        authenticated: bool,
        headers: &[(String, String)],
        body: Option<String>,
        allowed_status: &[u16],
    ) -> Result<Payload, HiloError> {
        if self.disabled {
            return Err(HiloError::Disabled);
        }
        let mut retries_left = self.max_retries;
        loop {
            let mut req_headers = if authenticated { self.auth_headers() } else { Vec::new() };
            req_headers.extend(headers.iter().cloned());
            let req = HttpRequest {
                method: method.clone(),
                url: url.to_string(),
                headers: req_headers,
                body: body.clone(),
                timeout: self.timeout,
            };

            let err = match self.attempt(&req, allowed_status) {
                Ok(payload) => return Ok(payload),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) => e,
            };
            if retries_left == 0 {
                error!("Unable to {} {}: {}", method, url, err);
                return Err(HiloError::RetryLimit {
                    url: url.to_string(),
                    last: Box::new(err),
                });
            }
            retries_left -= 1;
            error!("Retry #{}: {}", retries_left, err);
        }
    }

    fn attempt(&mut self, req: &HttpRequest, allowed_status: &[u16]) -> Result<Payload, Attempt> {
        let resp = match self.transport.do_request(req) {
            Ok(r) => r,
            Err(e) => {
                error!("{} {} failed: {}", req.method, req.url, e);
                return Err(Attempt::Retry(e.into()));
            }
        };
        debug!("Response: {} {}", resp.status, resp.body);

        if resp.status == 401 {
            if req.url != self.endpoints.token_url {
                self.refresh_token(true).map_err(Attempt::Fatal)?;
                return Err(Attempt::Retry(HiloError::Status {
                    status: 401,
                    message: format!("{} token is expired, trying again", req.url),
                }));
            }
            error!("Access denied when refreshing token, disabling integration. Bad username / password");
            self.disabled = true;
            return Err(Attempt::Fatal(HiloError::AuthRejected(
                "wrong username / password".to_string(),
            )));
        }

        if !resp.is_success() && !allowed_status.contains(&resp.status) {
            error!("{} on {} failed: {} {}", req.method, req.url, resp.status, resp.body);
            return Err(Attempt::Retry(HiloError::Status {
                status: resp.status,
                message: resp.body,
            }));
        }

        match serde_json::from_str::<Value>(&resp.body) {
            Ok(v) => Ok(Payload::Json(v)),
            Err(_) if resp.is_success() && (!resp.declares_json() || resp.body.trim().is_empty()) => {
                if !resp.body.is_empty() {
                    warn!("{} returned {} non-json: {}", req.url, resp.status, resp.body);
                }
                Ok(Payload::Text(resp.body))
            }
            Err(e) => Err(Attempt::Retry(HiloError::Malformed {
                status: resp.status,
                message: e.to_string(),
            })),
        }
    }

    /// Authenticated request: refresh the token if needed, then call.
    pub fn request(&mut self, url: &str, method: Method, body: Option<String>) -> Result<Payload, HiloError> {
        self.refresh_token(false)?;
        let headers = if method == Method::PUT {
            vec![("Content-Type".to_string(), "application/json".to_string())]
        } else {
            Vec::new()
        };
        self.call(url, method, true, &headers, body, &[]).inspect_err(|e| {
            error!("Request to {} failed: {}", url, e);
        })
    }

    fn get_json<T: DeserializeOwned>(&mut self, url: &str) -> Result<T, HiloError> {
        let payload = self.request(url, Method::GET, None)?;
        decode(url, payload)
    }

    pub fn location_id(&mut self) -> Result<LocationId, HiloError> {
        if let Some(id) = &self.session.location_id {
            return Ok(id.clone());
        }
        let url = format!("{}/Locations", self.endpoints.automation_url);
        let locations: Vec<Location> = self.get_json(&url)?;
        let first = locations.into_iter().next().ok_or_else(|| HiloError::Payload {
            url,
            message: "no locations on this account".to_string(),
        })?;
        debug!("Using location {} ({:?})", first.id, first.name);
        self.session.location_id = Some(first.id.clone());
        Ok(first.id)
    }

    pub fn location_url(&mut self, gd_service: bool) -> Result<String, HiloError> {
        let id = self.location_id()?;
        let base = if gd_service {
            &self.endpoints.gd_service_url
        } else {
            &self.endpoints.automation_url
        };
        Ok(format!("{}/Locations/{}", base, id))
    }

    pub fn device_list(&mut self) -> Result<Vec<DeviceDescriptor>, HiloError> {
        let url = format!("{}/Devices", self.location_url(false)?);
        self.get_json(&url)
    }

    pub fn gateway_info(&mut self) -> Result<GatewayInfo, HiloError> {
        let url = format!("{}/Gateways/Info", self.location_url(false)?);
        let infos: Vec<GatewayInfo> = self.get_json(&url)?;
        infos.into_iter().next().ok_or_else(|| HiloError::Payload {
            url,
            message: "empty gateway list".to_string(),
        })
    }

    pub fn device_attributes(&mut self, device_url: &str) -> Result<RawAttributes, HiloError> {
        self.get_json(&format!("{}/Attributes", device_url))
    }

    pub fn put_attribute(&mut self, device_url: &str, name: &str, value: &str) -> Result<(), HiloError> {
        let mut body = serde_json::Map::new();
        body.insert(name.to_string(), Value::String(value.to_string()));
        let url = format!("{}/Attributes", device_url);
        self.request(&url, Method::PUT, Some(Value::Object(body).to_string()))?;
        Ok(())
    }

    /// Whether a demand-response challenge is currently in progress.
    pub fn active_event(&mut self) -> Result<bool, HiloError> {
        let url = format!("{}/Events?active=true", self.location_url(true)?);
        let events: Vec<Event> = self.get_json(&url)?;
        debug!("Events: {:?}", events);
        Ok(events.first().is_some_and(Event::in_progress))
    }
}

fn decode<T: DeserializeOwned>(url: &str, payload: Payload) -> Result<T, HiloError> {
    match payload {
        Payload::Json(v) => serde_path_to_error::deserialize(v).map_err(|e| HiloError::Payload {
            url: url.to_string(),
            message: format!("{} at {}", e.inner(), e.path()),
        }),
        Payload::Text(t) => Err(HiloError::Payload {
            url: url.to_string(),
            message: format!("expected json, got text: {}", t),
        }),
    }
}
