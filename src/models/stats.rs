//! Global authentication statistics
//!
//! Maintained incrementally alongside sessions. `active_sessions` is, at all
//! times, the aggregate of every stored session's active count.

use super::event::{AuthEvent, AuthStatus};
use super::session::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One group of counters, broken down by user and by origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub by_user: BTreeMap<String, u64>,
    /// origin -> user -> count
    #[serde(default)]
    pub by_origin: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Counters {
    pub fn increment(&mut self, user: &str, origin: &str) {
        self.count += 1;
        *self.by_user.entry(user.to_string()).or_insert(0) += 1;
        *self
            .by_origin
            .entry(origin.to_string())
            .or_default()
            .entry(user.to_string())
            .or_insert(0) += 1;
    }

    /// Undo one increment for `(user, origin)`.
    ///
    /// Nothing changes unless that pair has a positive count, so a stray
    /// decrement for one key cannot eat into another key's total.
    pub fn decrement(&mut self, user: &str, origin: &str) -> bool {
        let cell = match self
            .by_origin
            .get_mut(origin)
            .and_then(|users| users.get_mut(user))
        {
            Some(cell) if *cell > 0 => cell,
            _ => return false,
        };

        *cell -= 1;
        self.count = self.count.saturating_sub(1);
        if let Some(n) = self.by_user.get_mut(user) {
            *n = n.saturating_sub(1);
        }
        true
    }

    /// Count for a single `(user, origin)` pair
    pub fn get(&self, user: &str, origin: &str) -> u64 {
        self.by_origin
            .get(origin)
            .and_then(|users| users.get(user))
            .copied()
            .unwrap_or(0)
    }

    pub fn for_user(&self, user: &str) -> u64 {
        self.by_user.get(user).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub active_sessions: Counters,
    #[serde(default)]
    pub total_sessions: Counters,
    #[serde(default)]
    pub fail_list: Counters,

    /// Earliest event time folded in (or creation time if earlier)
    pub stats_started: DateTime<Utc>,
    /// Latest accepted event time folded in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
}

impl Stats {
    pub fn new(started: DateTime<Utc>) -> Self {
        Stats {
            active_sessions: Counters::default(),
            total_sessions: Counters::default(),
            fail_list: Counters::default(),
            stats_started: started,
            last_login: None,
        }
    }

    pub fn update(&mut self, event: &AuthEvent) {
        let at = event.timestamp;
        if at < self.stats_started {
            self.stats_started = at;
        }

        let (user, origin) = (event.username.as_str(), event.remote_origin.as_str());
        match event.status {
            AuthStatus::Accepted => {
                if self.last_login.map_or(true, |last| at > last) {
                    self.last_login = Some(at);
                }
                self.active_sessions.increment(user, origin);
                self.total_sessions.increment(user, origin);
            }
            AuthStatus::Disconnected => {
                self.active_sessions.decrement(user, origin);
            }
            AuthStatus::Failed => {
                self.fail_list.increment(user, origin);
            }
        }
    }

    /// Rebuild the aggregate from a set of sessions
    ///
    /// Timestamps come from the sessions; `started` is used when no session
    /// carries an earlier one.
    pub fn from_sessions<'a, I>(sessions: I, started: DateTime<Utc>) -> Stats
    where
        I: IntoIterator<Item = &'a Session>,
    {
        let mut stats = Stats::new(started);

        for session in sessions {
            let (user, origin) = (session.username.as_str(), session.remote_origin.as_str());
            add(&mut stats.active_sessions, user, origin, session.active_count as u64);
            add(&mut stats.total_sessions, user, origin, session.total_count);
            add(&mut stats.fail_list, user, origin, session.fail_count);

            for at in [session.first_login, session.last_fail].into_iter().flatten() {
                if at < stats.stats_started {
                    stats.stats_started = at;
                }
            }
            if let Some(at) = session.last_login {
                if stats.last_login.map_or(true, |last| at > last) {
                    stats.last_login = Some(at);
                }
            }
        }

        stats
    }
}

fn add(counters: &mut Counters, user: &str, origin: &str, n: u64) {
    if n == 0 {
        return;
    }
    counters.count += n;
    *counters.by_user.entry(user.to_string()).or_insert(0) += n;
    *counters
        .by_origin
        .entry(origin.to_string())
        .or_default()
        .entry(user.to_string())
        .or_insert(0) += n;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(offset)
    }

    #[test]
    fn test_accept_and_disconnect() {
        let mut stats = Stats::new(t(0));
        stats.update(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(1)));

        assert_eq!(stats.active_sessions.count, 1);
        assert_eq!(stats.total_sessions.count, 1);
        assert_eq!(stats.active_sessions.get("bob", "1.2.3.4"), 1);
        assert_eq!(stats.last_login, Some(t(1)));

        stats.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(2)));
        assert_eq!(stats.active_sessions.count, 0);
        assert_eq!(stats.active_sessions.for_user("bob"), 0);
        assert_eq!(stats.total_sessions.count, 1);
    }

    #[test]
    fn test_stray_disconnect_does_not_touch_other_keys() {
        let mut stats = Stats::new(t(0));
        stats.update(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(1)));
        stats.update(&AuthEvent::disconnected("bob", "5.6.7.8", t(2)));
        stats.update(&AuthEvent::disconnected("alice", "1.2.3.4", t(3)));

        assert_eq!(stats.active_sessions.count, 1);
        assert_eq!(stats.active_sessions.for_user("bob"), 1);
        assert!(stats.active_sessions.by_origin.get("5.6.7.8").is_none());
    }

    #[test]
    fn test_failures_counted_separately() {
        let mut stats = Stats::new(t(0));
        stats.update(&AuthEvent::failed("root", "password", "6.6.6.6", t(1)));
        stats.update(&AuthEvent::failed("root", "password", "6.6.6.6", t(2)));
        stats.update(&AuthEvent::failed("admin", "password", "6.6.6.6", t(3)));

        assert_eq!(stats.fail_list.count, 3);
        assert_eq!(stats.fail_list.for_user("root"), 2);
        assert_eq!(stats.fail_list.by_origin["6.6.6.6"].len(), 2);
        assert_eq!(stats.active_sessions.count, 0);
        assert!(stats.last_login.is_none());
    }

    #[test]
    fn test_time_bounds() {
        let mut stats = Stats::new(t(100));

        // backfilled event lowers the start
        stats.update(&AuthEvent::failed("bob", "password", "1.2.3.4", t(50)));
        assert_eq!(stats.stats_started, t(50));

        stats.update(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(200)));
        stats.update(&AuthEvent::accepted("bob", "password", "1.2.3.4", t(150)));
        assert_eq!(stats.last_login, Some(t(200)));

        // disconnects never move last_login
        stats.update(&AuthEvent::disconnected("bob", "1.2.3.4", t(300)));
        assert_eq!(stats.last_login, Some(t(200)));
    }

    #[test]
    fn test_incremental_matches_rebuild() {
        let events = vec![
            AuthEvent::accepted("bob", "password", "1.2.3.4", t(1)),
            AuthEvent::accepted("bob", "password", "1.2.3.4", t(2)),
            AuthEvent::accepted("alice", "publickey", "1.2.3.4", t(3)),
            AuthEvent::disconnected("bob", "1.2.3.4", t(4)),
            AuthEvent::disconnected("carol", "9.9.9.9", t(5)),
            AuthEvent::failed("carol", "password", "9.9.9.9", t(6)),
            AuthEvent::disconnected("alice", "1.2.3.4", t(7)),
            AuthEvent::disconnected("alice", "1.2.3.4", t(8)),
        ];

        let mut stats = Stats::new(t(0));
        let mut sessions: BTreeMap<(String, String), Session> = BTreeMap::new();
        for event in &events {
            stats.update(event);
            sessions
                .entry((event.username.clone(), event.remote_origin.clone()))
                .or_insert_with(|| Session::empty(&event.username, &event.remote_origin))
                .update(event);
        }

        let active_sum: u64 = sessions.values().map(|s| s.active_count as u64).sum();
        assert_eq!(stats.active_sessions.count, active_sum);
        assert_eq!(stats.active_sessions.count, 1);

        let rebuilt = Stats::from_sessions(sessions.values(), t(0));
        assert_eq!(rebuilt.active_sessions.count, stats.active_sessions.count);
        assert_eq!(rebuilt.total_sessions, stats.total_sessions);
        assert_eq!(rebuilt.fail_list, stats.fail_list);
        assert_eq!(rebuilt.last_login, stats.last_login);
    }
}
