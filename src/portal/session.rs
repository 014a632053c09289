use crate::config::Credentials;
use crate::portal::client::Portal;
use crate::portal::error::PortalError;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeMap;

/// An authenticated portal session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    /// API host the portal assigned at login, always ending in `/`.
    pub api_base: String,
    pub issued_at: DateTime<Utc>,
    /// Headers every data request of this session must carry.
    pub raw_headers: BTreeMap<String, String>,
}

impl Session {
    pub fn new(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        let token = token.into();
        let mut raw_headers = BTreeMap::new();
        raw_headers.insert("token".to_string(), token.clone());
        Self {
            token,
            api_base: normalize_base(&api_base.into()),
            issued_at: Utc::now(),
            raw_headers,
        }
    }
}

pub(crate) fn normalize_base(base: &str) -> String {
    format!("{}/", base.trim().trim_end_matches('/'))
}

/// Caches the session for a run and logs in again after [`SessionManager::invalidate`].
pub struct SessionManager {
    credentials: Credentials,
    current: Option<Session>,
    logins: u32,
}

impl SessionManager {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            current: None,
            logins: 0,
        }
    }

    /// Returns the cached session, logging in first if there is none.
    pub async fn acquire<P: Portal>(&mut self, portal: &P) -> Result<Session, PortalError> {
        if let Some(session) = &self.current {
            return Ok(session.clone());
        }
        debug!("Logging in as {}", self.credentials.account);
        let session = portal.login(&self.credentials).await?;
        self.logins += 1;
        info!(
            "Authenticated as {} (API base {})",
            self.credentials.account, session.api_base
        );
        self.current = Some(session.clone());
        Ok(session)
    }

    /// Marks `session` stale. A newer session that replaced it is left alone.
    pub fn invalidate(&mut self, session: &Session) {
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.token == session.token)
        {
            debug!("Invalidating session issued at {}", session.issued_at);
            self.current = None;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.is_some()
    }

    /// Number of successful logins so far.
    pub fn logins(&self) -> u32 {
        self.logins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::testing::ScriptedPortal;

    #[tokio::test]
    async fn caches_until_invalidated() -> Result<(), PortalError> {
        let portal = ScriptedPortal::new(|_, _| unreachable!("sessions never fetch"));
        let mut sessions = SessionManager::new(Credentials::new("a", "b"));

        let first = sessions.acquire(&portal).await?;
        let again = sessions.acquire(&portal).await?;
        assert_eq!(first.token, again.token);
        assert_eq!(sessions.logins(), 1);
        assert_eq!(first.api_base, "https://portal.test/api/");
        assert_eq!(first.raw_headers.get("token"), Some(&first.token));

        sessions.invalidate(&first);
        assert!(!sessions.is_authenticated());
        let fresh = sessions.acquire(&portal).await?;
        assert_eq!(fresh.token, "token-2");
        assert_eq!(sessions.logins(), 2);

        // A stale handle must not evict its replacement.
        sessions.invalidate(&first);
        assert!(sessions.is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_credentials_surface_immediately() {
        let portal = ScriptedPortal::rejecting_logins();
        let mut sessions = SessionManager::new(Credentials::new("a", "b"));
        let err = sessions.acquire(&portal).await.unwrap_err();
        assert!(matches!(err, PortalError::AuthRejected { .. }));
        assert!(!sessions.is_authenticated());
        assert_eq!(sessions.logins(), 0);
    }
}
