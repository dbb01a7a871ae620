//! sshd auth log line parser
//!
//! Recognizes the three sshd outcomes the tracker cares about:
//!
//! ```text
//! Jan  1 12:00:00 host sshd[1234]: Accepted publickey for alice from 10.0.0.1 port 5555 ssh2
//! Jan  1 12:05:00 host sshd[1234]: Disconnected from user alice 10.0.0.1 port 5555
//! Jan  1 12:06:00 host sshd[1240]: Failed password for invalid user admin from 10.0.0.9 port 4444 ssh2
//! ```
//!
//! Classic syslog stamps carry no year or zone; they are read as UTC in the
//! parser's configured year. ISO-8601 stamps (as written by rsyslog's high
//! precision format) are used as is.

use crate::models::{AuthEvent, AuthStatus};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("not an sshd log line")]
    NotSshd,

    #[error("sshd line for {0} has an unexpected shape")]
    InvalidLine(AuthStatus),

    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

pub struct LineParser {
    header: Regex,
    accepted: Regex,
    disconnected: Regex,
    failed: Regex,
    year: i32,
}

impl LineParser {
    /// Parser stamping year-less lines with the current year
    pub fn new() -> Result<Self, ParseError> {
        Self::with_year(Utc::now().year())
    }

    pub fn with_year(year: i32) -> Result<Self, ParseError> {
        Ok(LineParser {
            header: Regex::new(
                r"^(?:<\d+>)?(?P<stamp>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}|\d{4}-\d{2}-\d{2}T\S+)\s+\S+\s+sshd\[\d+\]:\s+(?P<status>Accepted|Disconnected|Failed)\s",
            )?,
            accepted: Regex::new(
                r"Accepted\s+(?P<method>\S+)\s+for\s+(?P<user>\S+)\s+from\s+(?P<origin>[0-9A-Fa-f.:]+)",
            )?,
            disconnected: Regex::new(
                r"Disconnected\s+from\s+user\s+(?P<user>\S+)\s+(?P<origin>[0-9A-Fa-f.:]+)",
            )?,
            failed: Regex::new(
                r"Failed\s+(?P<method>\S+)\s+for\s+(?:invalid\s+user\s+)?(?P<user>\S+)\s+from\s+(?P<origin>[0-9A-Fa-f.:]+)",
            )?,
            year,
        })
    }

    /// Parse one log line into an [`AuthEvent`]
    pub fn parse(&self, line: &str) -> Result<AuthEvent, ParseError> {
        let line = line.trim_end();
        let header = self.header.captures(line).ok_or(ParseError::NotSshd)?;

        let timestamp = self.parse_stamp(&header["stamp"])?;
        let status: AuthStatus = header["status"]
            .parse()
            .map_err(|_| ParseError::NotSshd)?;

        let body = match status {
            AuthStatus::Accepted => &self.accepted,
            AuthStatus::Disconnected => &self.disconnected,
            AuthStatus::Failed => &self.failed,
        };
        let caps = body.captures(line).ok_or(ParseError::InvalidLine(status))?;

        let mut event = AuthEvent::new(status, &caps["user"], &caps["origin"], timestamp);
        if let Some(method) = caps.name("method") {
            event = event.with_method(method.as_str());
        }
        Ok(event)
    }

    fn parse_stamp(&self, stamp: &str) -> Result<DateTime<Utc>, ParseError> {
        if stamp.contains('T') {
            return DateTime::parse_from_rfc3339(stamp)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ParseError::Timestamp(stamp.to_string()));
        }

        // "Jan  1" pads the day with a space
        let normalized = stamp.split_whitespace().collect::<Vec<_>>().join(" ");
        NaiveDateTime::parse_from_str(
            &format!("{} {}", self.year, normalized),
            "%Y %b %d %H:%M:%S",
        )
        .map(|naive| naive.and_utc())
        .map_err(|_| ParseError::Timestamp(stamp.to_string()))
    }
}
