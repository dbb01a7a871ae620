use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of a single authentication attempt as reported by sshd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthStatus {
    Accepted,
    Disconnected,
    Failed,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Accepted => "Accepted",
            AuthStatus::Disconnected => "Disconnected",
            AuthStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Accepted" => Ok(AuthStatus::Accepted),
            "Disconnected" => Ok(AuthStatus::Disconnected),
            "Failed" => Ok(AuthStatus::Failed),
            other => Err(format!("unsupported auth status: {}", other)),
        }
    }
}

/// One observed authentication outcome
///
/// Built by the log parser and never modified afterwards. An empty
/// `remote_origin` means the producer could not determine the address; it is
/// tracked as its own origin key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEvent {
    pub status: AuthStatus,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    pub remote_origin: String,
    pub timestamp: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(
        status: AuthStatus,
        username: impl Into<String>,
        remote_origin: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        AuthEvent {
            status,
            username: username.into(),
            auth_method: None,
            remote_origin: remote_origin.into(),
            timestamp,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        let method = method.into();
        self.auth_method = if method.is_empty() { None } else { Some(method) };
        self
    }

    pub fn accepted(
        username: &str,
        method: &str,
        origin: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        AuthEvent::new(AuthStatus::Accepted, username, origin, timestamp).with_method(method)
    }

    pub fn disconnected(username: &str, origin: &str, timestamp: DateTime<Utc>) -> Self {
        AuthEvent::new(AuthStatus::Disconnected, username, origin, timestamp)
    }

    pub fn failed(username: &str, method: &str, origin: &str, timestamp: DateTime<Utc>) -> Self {
        AuthEvent::new(AuthStatus::Failed, username, origin, timestamp).with_method(method)
    }
}
