//! In-memory portal used by the unit tests.

use crate::config::Credentials;
use crate::portal::client::{DayRequest, Portal};
use crate::portal::error::PortalError;
use crate::portal::session::Session;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

type Responder = Box<dyn Fn(&DayRequest, usize) -> Result<Value, PortalError> + Send + Sync>;

pub(crate) struct ScriptedPortal {
    reject_logins: bool,
    logins: AtomicU32,
    fetches: Mutex<Vec<(NaiveDate, String)>>,
    respond: Responder,
}

impl ScriptedPortal {
    /// `respond` receives the request and how many times that day was fetched before.
    pub fn new(
        respond: impl Fn(&DayRequest, usize) -> Result<Value, PortalError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reject_logins: false,
            logins: AtomicU32::new(0),
            fetches: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    pub fn rejecting_logins() -> Self {
        Self {
            reject_logins: true,
            ..Self::new(|_, _| Ok(chart_payload(&[])))
        }
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn fetched_days(&self) -> Vec<NaiveDate> {
        self.fetches.lock().unwrap().iter().map(|(d, _)| *d).collect()
    }

    pub fn tokens_used(&self) -> Vec<String> {
        self.fetches.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

impl Portal for ScriptedPortal {
    async fn login(&self, credentials: &Credentials) -> Result<Session, PortalError> {
        if self.reject_logins {
            return Err(PortalError::AuthRejected {
                account: credentials.account.clone(),
                message: "code 100005: Email or password error".to_string(),
            });
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session::new(format!("token-{n}"), "https://portal.test/api"))
    }

    async fn fetch_day(
        &self,
        session: &Session,
        request: &DayRequest,
    ) -> Result<Value, PortalError> {
        let previous = {
            let mut fetches = self.fetches.lock().unwrap();
            let previous = fetches.iter().filter(|(d, _)| *d == request.date).count();
            fetches.push((request.date, session.token.clone()));
            previous
        };
        (self.respond)(request, previous)
    }
}

/// A successful chart payload with one `lines` entry per `(key, points)`.
pub(crate) fn chart_payload(lines: &[(&str, &[(&str, f64)])]) -> Value {
    let lines: Vec<Value> = lines
        .iter()
        .map(|(key, points)| {
            let xy: Vec<Value> = points.iter().map(|(x, y)| json!({ "x": x, "y": y })).collect();
            json!({ "key": key, "xy": xy })
        })
        .collect();
    json!({
        "hasError": false,
        "code": 0,
        "msg": "success",
        "data": { "lines": lines, "generateData": [] },
    })
}

pub(crate) fn expired() -> PortalError {
    PortalError::AuthExpired {
        url: "https://portal.test/api/v2/Charts/GetPlantPowerChart".to_string(),
        reason: "code 100002: The authorization has expired".to_string(),
    }
}
