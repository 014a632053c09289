//! HTTP access to the SEMS portal: login and the per-day power chart.

use crate::config::{Credentials, RunConfig, TzOffset};
use crate::portal::envelope::parse_response;
use crate::portal::error::{FailureCause, PortalError};
use crate::portal::session::{normalize_base, Session};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{NaiveDate, Utc};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const V1_LOGIN_URL: &str = "https://www.semsportal.com/api/v1/Common/CrossLogin";
const PORTAL_ORIGIN: &str = "https://www.semsportal.com";
const PORTAL_REFERER: &str = "https://www.semsportal.com/";
const BROWSER_AGENT: &str = "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Mobile Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

/// One day of one station, as the portal expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayRequest {
    pub station_id: String,
    pub date: NaiveDate,
    pub tz_offset: TzOffset,
}

impl DayRequest {
    /// Local midnight of the day, e.g. `2025-09-01T00:00:00+08:00`.
    pub fn portal_date(&self) -> String {
        format!("{}T00:00:00{}", self.date.format("%Y-%m-%d"), self.tz_offset)
    }

    /// Body shapes the chart endpoint has been seen to accept, in the order to try them.
    pub fn bodies(&self) -> [Value; 2] {
        let flat = json!({
            "id": self.station_id,
            "date": self.portal_date(),
            "full_script": false,
        });
        let wrapped = json!({ "model": flat.clone() });
        [flat, wrapped]
    }
}

/// The two portal operations the exporter relies on.
#[allow(async_fn_in_trait)]
pub trait Portal {
    async fn login(&self, credentials: &Credentials) -> Result<Session, PortalError>;

    /// Fetches the raw power chart payload of one day. The payload is returned unmodified.
    async fn fetch_day(&self, session: &Session, request: &DayRequest)
        -> Result<Value, PortalError>;
}

pub struct SemsClient {
    http: Client,
    api_base: String,
    v1_login_url: String,
    language: String,
    client_version: String,
}

impl SemsClient {
    pub fn new(config: &RunConfig) -> Result<Self, PortalError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(ORIGIN, HeaderValue::from_static(PORTAL_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static(PORTAL_REFERER));
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_AGENT));
        let language = HeaderValue::from_str(&format!("{},en;q=0.6", config.language))
            .unwrap_or_else(|_| HeaderValue::from_static("en"));
        headers.insert(ACCEPT_LANGUAGE, language);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .gzip(true)
            .build()
            .map_err(PortalError::ClientBuild)?;

        Ok(Self {
            http,
            api_base: normalize_base(&config.api_base),
            v1_login_url: V1_LOGIN_URL.to_string(),
            language: config.language.clone(),
            client_version: config.client_version.clone(),
        })
    }

    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<Value, PortalError> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| PortalError::NetworkRequest(url.to_string(), e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PortalError::NetworkRequest(url.to_string(), e))?;
        debug!("POST {} -> {} ({} bytes)", url, status, text.len());
        parse_response(url, status, &text)
    }

    async fn login_v2(&self, credentials: &Credentials) -> Result<Session, PortalError> {
        let url = format!("{}v2/Common/CrossLogin", self.api_base);
        let body = json!({ "account": credentials.account, "pwd": credentials.password });
        let payload = self
            .post(&url, &BTreeMap::new(), &body)
            .await
            .map_err(|e| login_refusal(credentials, e))?;

        let data = LoginData::from_payload(&payload);
        let token = data.token().ok_or_else(|| PortalError::Malformed {
            url: url.clone(),
            message: "login returned no token".to_string(),
        })?;
        Ok(Session::new(token, api_base_of(&payload, &self.api_base)))
    }

    async fn login_v1(&self, credentials: &Credentials) -> Result<Session, PortalError> {
        let client_header = json!({
            "version": self.client_version,
            "client": "web",
            "language": self.language,
        })
        .to_string();
        let mut headers = BTreeMap::new();
        headers.insert("Token".to_string(), client_header);
        let body = json!({ "account": credentials.account, "pwd": credentials.password });
        let payload = self
            .post(&self.v1_login_url, &headers, &body)
            .await
            .map_err(|e| login_refusal(credentials, e))?;

        let token = v1_bundle_token(
            &LoginData::from_payload(&payload),
            &self.language,
            &self.client_version,
            Utc::now().timestamp_millis(),
        )
        .ok_or_else(|| PortalError::Malformed {
            url: self.v1_login_url.clone(),
            message: "login returned no token".to_string(),
        })?;
        Ok(Session::new(token, api_base_of(&payload, &self.api_base)))
    }
}

impl Portal for SemsClient {
    async fn login(&self, credentials: &Credentials) -> Result<Session, PortalError> {
        match self.login_v2(credentials).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("v2 login failed ({}), falling back to v1", e);
                self.login_v1(credentials).await
            }
        }
    }

    async fn fetch_day(
        &self,
        session: &Session,
        request: &DayRequest,
    ) -> Result<Value, PortalError> {
        let url = format!("{}v2/Charts/GetPlantPowerChart", session.api_base);
        let [flat, wrapped] = request.bodies();

        let first = match self.post(&url, &session.raw_headers, &flat).await {
            Ok(payload) => return Ok(payload),
            Err(e) if is_shape_specific(&e) => e,
            Err(e) => return Err(e),
        };
        debug!(
            "Flat body refused for {} ({}), retrying with wrapped body",
            request.date, first
        );
        match self.post(&url, &session.raw_headers, &wrapped).await {
            Ok(payload) => Ok(payload),
            Err(second) if is_shape_specific(&second) => Err(more_informative(first, second)),
            Err(second) => Err(second),
        }
    }
}

/// Failures another body shape might get past.
fn is_shape_specific(error: &PortalError) -> bool {
    matches!(
        error.cause(),
        FailureCause::PortalRejectedData | FailureCause::MalformedResponse
    )
}

fn more_informative(first: PortalError, second: PortalError) -> PortalError {
    match (&first, &second) {
        (PortalError::Malformed { .. }, PortalError::Rejected { .. }) => second,
        _ => first,
    }
}

/// Any refusal from a login endpoint means the credentials were not accepted.
fn login_refusal(credentials: &Credentials, error: PortalError) -> PortalError {
    match error {
        PortalError::AuthExpired { reason, .. } => PortalError::AuthRejected {
            account: credentials.account.clone(),
            message: reason,
        },
        PortalError::Rejected { code, message } => PortalError::AuthRejected {
            account: credentials.account.clone(),
            message: format!("code {}: {}", code, message),
        },
        other => other,
    }
}

fn api_base_of(payload: &Value, fallback: &str) -> String {
    payload
        .get("api")
        .and_then(Value::as_str)
        .filter(|api| !api.trim().is_empty())
        .map(normalize_base)
        .unwrap_or_else(|| fallback.to_string())
}

/// The `data` part of a login answer.
#[derive(Debug, Default, Deserialize)]
struct LoginData {
    #[serde(alias = "Token")]
    token: Option<String>,
    #[serde(default)]
    uid: Value,
    #[serde(default)]
    timestamp: Value,
}

impl LoginData {
    fn from_payload(payload: &Value) -> Self {
        payload
            .get("data")
            .cloned()
            .and_then(|data| serde_json::from_value(data).ok())
            .unwrap_or_default()
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|token| !token.is_empty())
    }
}

/// Builds the v2 token the chart endpoint accepts from a v1 login answer.
fn v1_bundle_token(
    data: &LoginData,
    language: &str,
    client_version: &str,
    now_millis: i64,
) -> Option<String> {
    let token = data.token()?;
    let or_default = |value: &Value, default: Value| {
        if value.is_null() {
            default
        } else {
            value.clone()
        }
    };
    let bundle = json!({
        "uid": or_default(&data.uid, json!("")),
        "timestamp": or_default(&data.timestamp, json!(now_millis)),
        "token": token,
        "client": "web",
        "version": client_version,
        "language": language,
    });
    Some(URL_SAFE.encode(bundle.to_string().as_bytes()))
}
