//! Per `(username, origin)` session state
//!
//! A session is created lazily the first time a key is seen and is never
//! deleted. Every event for the key is folded into it by [`Session::update`].

use super::event::{AuthEvent, AuthStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated state for one user connecting from one origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Per-user sequence number, assigned when the session is first stored
    #[serde(default)]
    pub id: u64,
    pub username: String,
    pub remote_origin: String,
    /// `None` until the first event is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AuthStatus>,

    /// Currently open connections
    #[serde(default)]
    pub active_count: u32,
    /// Accepted connections ever seen
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    /// Open connections broken down by auth method
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_methods: BTreeMap<String, u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_login: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_logout: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fail: Option<DateTime<Utc>>,
}

impl Session {
    /// The canonical "never seen" session for a key
    pub fn empty(username: impl Into<String>, remote_origin: impl Into<String>) -> Self {
        Session {
            id: 0,
            username: username.into(),
            remote_origin: remote_origin.into(),
            status: None,
            active_count: 0,
            total_count: 0,
            fail_count: 0,
            auth_methods: BTreeMap::new(),
            first_login: None,
            last_login: None,
            last_logout: None,
            last_fail: None,
        }
    }

    /// Build a zero session for the event's key and apply the event to it
    pub fn new(event: &AuthEvent) -> Self {
        let mut session = Session::empty(event.username.clone(), event.remote_origin.clone());
        session.update(event);
        session
    }

    /// True when no event has ever been applied
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.active_count > 0
    }

    /// Apply one event to the session
    ///
    /// Disconnects never take the active count below zero. Status only leaves
    /// `Accepted` once no connection remains open.
    pub fn update(&mut self, event: &AuthEvent) {
        let at = event.timestamp;

        match event.status {
            AuthStatus::Accepted => {
                self.active_count = self.active_count.saturating_add(1);
                self.total_count = self.total_count.saturating_add(1);
                if let Some(method) = event.auth_method.as_deref() {
                    *self.auth_methods.entry(method.to_string()).or_insert(0) += 1;
                }

                if self.first_login.is_none() {
                    self.first_login = Some(at);
                }
                self.last_login = Some(at);
                self.status = Some(AuthStatus::Accepted);
            }
            AuthStatus::Disconnected => {
                if self.active_count > 0 {
                    self.active_count -= 1;
                    self.release_method(event.auth_method.as_deref());
                }

                self.last_logout = Some(at);
                if self.active_count == 0 {
                    self.status = Some(AuthStatus::Disconnected);
                }
            }
            AuthStatus::Failed => {
                self.fail_count = self.fail_count.saturating_add(1);
                self.last_fail = Some(at);
                if self.active_count == 0 {
                    self.status = Some(AuthStatus::Failed);
                }
            }
        }
    }

    /// Pure form of [`Session::update`]
    pub fn updated(&self, event: &AuthEvent) -> Session {
        let mut next = self.clone();
        next.update(event);
        next
    }

    /// Drop one open connection from the per-method breakdown.
    ///
    /// sshd does not repeat the method on disconnect lines, so when the named
    /// method has nothing open the first method (in name order) is used.
    fn release_method(&mut self, method: Option<&str>) {
        let key = match method {
            Some(m) if self.auth_methods.get(m).copied().unwrap_or(0) > 0 => m.to_string(),
            _ => match self.auth_methods.iter().find(|(_, n)| **n > 0) {
                Some((k, _)) => k.clone(),
                None => return,
            },
        };

        if let Some(count) = self.auth_methods.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.auth_methods.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(offset)
    }

    #[test]
    fn test_new_session_from_accept() {
        let event = AuthEvent::accepted("bob", "password", "1.2.3.4", t(0));
        let session = Session::new(&event);

        assert_eq!(session.username, "bob");
        assert_eq!(session.remote_origin, "1.2.3.4");
        assert_eq!(session.status, Some(AuthStatus::Accepted));
        assert_eq!(session.active_count, 1);
        assert_eq!(session.total_count, 1);
        assert_eq!(session.first_login, Some(t(0)));
        assert_eq!(session.last_login, Some(t(0)));
        assert_eq!(session.auth_methods.get("password"), Some(&1));
    }

    #[test]
    fn test_disconnect_after_accept() {
        let mut session = Session::new(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(0)));
        session.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(10)));

        assert_eq!(session.active_count, 0);
        assert_eq!(session.total_count, 1);
        assert_eq!(session.status, Some(AuthStatus::Disconnected));
        assert_eq!(session.last_logout, Some(t(10)));
        assert!(session.auth_methods.is_empty());
    }

    #[test]
    fn test_disconnect_keeps_other_connections_accepted() {
        let mut session = Session::new(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(0)));
        session.update(&AuthEvent::accepted("bob", "publickey", "1.2.3.4", t(1)));
        assert_eq!(session.active_count, 2);

        session.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(2)));
        assert_eq!(session.active_count, 1);
        assert_eq!(session.status, Some(AuthStatus::Accepted));
        assert_eq!(session.auth_methods.values().sum::<u32>(), 1);
        assert_eq!(session.first_login, Some(t(0)));
        assert_eq!(session.last_login, Some(t(1)));
    }

    #[test]
    fn test_disconnect_with_method_releases_that_method() {
        let mut session = Session::new(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(0)));
        session.update(&AuthEvent::accepted("bob", "publickey", "1.2.3.4", t(1)));

        session.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(2)).with_method("publickey"));
        assert_eq!(session.auth_methods.get("password"), Some(&1));
        assert!(session.auth_methods.get("publickey").is_none());
    }

    #[test]
    fn test_disconnect_on_idle_session_clamps_at_zero() {
        let mut session = Session::empty("bob", "1.2.3.4");
        session.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(0)));
        session.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(1)));

        assert_eq!(session.active_count, 0);
        assert_eq!(session.total_count, 0);
        assert_eq!(session.status, Some(AuthStatus::Disconnected));
    }

    #[test]
    fn test_failure_sets_status_only_when_idle() {
        let mut idle = Session::empty("bob", "1.2.3.4");
        idle.update(&AuthEvent::failed("bob", "password", "1.2.3.4", t(0)));
        assert_eq!(idle.status, Some(AuthStatus::Failed));
        assert_eq!(idle.fail_count, 1);
        assert_eq!(idle.last_fail, Some(t(0)));

        let mut active = Session::new(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(0)));
        active.update(&AuthEvent::failed("bob", "password", "1.2.3.4", t(1)));
        assert_eq!(active.status, Some(AuthStatus::Accepted));
        assert_eq!(active.fail_count, 1);
        assert_eq!(active.active_count, 1);
    }

    #[test]
    fn test_counts_never_negative_for_any_ordering() {
        let kinds = [AuthStatus::Accepted, AuthStatus::Disconnected, AuthStatus::Failed];

        // every sequence of length 6 over the three statuses
        for mut code in 0..3usize.pow(6) {
            let mut session = Session::empty("bob", "1.2.3.4");
            let mut total = 0;
            let mut fails = 0;

            for step in 0..6 {
                let status = kinds[code % 3];
                code /= 3;

                let event = AuthEvent::new(status, "bob", "1.2.3.4", t(step)).with_method("password");
                let before = session.clone();
                session.update(&event);

                assert!(session.total_count >= before.total_count);
                assert!(session.fail_count >= before.fail_count);
                assert!(session.auth_methods.values().sum::<u32>() <= session.active_count);
                match status {
                    AuthStatus::Accepted => total += 1,
                    AuthStatus::Failed => fails += 1,
                    AuthStatus::Disconnected => {}
                }
            }

            assert_eq!(session.total_count, total);
            assert_eq!(session.fail_count, fails);
        }
    }

    #[test]
    fn test_updated_is_pure() {
        let session = Session::new(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(0)));
        let event = AuthEvent::disconnected("bob", "1.2.3.4", t(5));

        let next = session.updated(&event);
        assert_eq!(session.active_count, 1);
        assert_eq!(next.active_count, 0);
        assert_eq!(next, session.updated(&event));
    }

    #[test]
    fn test_missing_fields_deserialize_to_defaults() {
        let session: Session =
            serde_json::from_str(r#"{"username":"bob","remote_origin":"1.2.3.4"}"#).unwrap();
        assert_eq!(session, Session::empty("bob", "1.2.3.4"));
        assert!(session.is_empty());
    }
}
