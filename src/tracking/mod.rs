//! Session tracking engine
//!
//! Folds authentication events into stored sessions and statistics. Each
//! event is applied in one write transaction covering both the session and
//! the stats record, so the stats always aggregate the stored sessions.

use crate::models::{AuthEvent, Session, Stats};
use crate::persistence::{
    BucketSessionRepository, BucketStatsRepository, PersistenceError, SessionRepository,
    StatsRepository, Store,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Storage error: {0}")]
    Storage(#[from] PersistenceError),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),
}

/// Result of comparing stored stats against the stored sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consistency {
    pub sessions: usize,
    pub expected_active: u64,
    pub recorded_active: u64,
    /// `(user, origin, expected, recorded)` for every active cell that differs
    pub mismatched: Vec<(String, String, u64, u64)>,
}

impl Consistency {
    pub fn is_consistent(&self) -> bool {
        self.expected_active == self.recorded_active && self.mismatched.is_empty()
    }
}

/// Tracking engine over a session and a stats repository
pub struct Tracker<S = BucketSessionRepository, T = BucketStatsRepository> {
    store: Arc<Store>,
    sessions: S,
    stats: T,
}

impl Tracker {
    /// Open the store at `path` with the default repositories
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TrackingError> {
        let store = Store::open(path)?;
        Tracker::new(
            Arc::new(store),
            BucketSessionRepository::new(),
            BucketStatsRepository::new(),
        )
    }

    /// Open an existing store for queries only
    ///
    /// Nothing is created or written. Until the first event is recorded
    /// elsewhere, stats read as zero.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, TrackingError> {
        Ok(Tracker {
            store: Arc::new(Store::open_read_only(path)?),
            sessions: BucketSessionRepository::new(),
            stats: BucketStatsRepository::new(),
        })
    }

    /// Tracker over an in-memory store (useful for testing)
    pub fn in_memory() -> Result<Self, TrackingError> {
        Tracker::new(
            Arc::new(Store::in_memory()?),
            BucketSessionRepository::new(),
            BucketStatsRepository::new(),
        )
    }
}

impl<S: SessionRepository, T: StatsRepository> Tracker<S, T> {
    /// Build a tracker, writing initial stats if the store has none
    pub fn new(store: Arc<Store>, sessions: S, stats: T) -> Result<Self, TrackingError> {
        store.update(|tx| {
            if stats.load_stats(tx)?.is_none() {
                log::info!("Initializing authentication statistics");
                stats.put_stats(tx, &Stats::new(Utc::now()))?;
            }
            Ok::<_, PersistenceError>(())
        })?;

        Ok(Tracker {
            store,
            sessions,
            stats,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Apply one event and persist the result
    ///
    /// The session and the stats are written in the same transaction. On any
    /// error nothing is committed and the event may be retried as is.
    pub fn record_event(&self, event: &AuthEvent) -> Result<Session, TrackingError> {
        if event.username.is_empty() {
            return Err(TrackingError::InvalidEvent("empty username".to_string()));
        }

        let session = self.store.update(|tx| {
            let mut session =
                self.sessions
                    .get_session(tx, &event.username, &event.remote_origin)?;
            session.update(event);

            let mut stats = self.stats.get_stats(tx)?;
            stats.update(event);

            self.sessions.put_session(tx, &mut session)?;
            self.stats.put_stats(tx, &stats)?;
            Ok::<_, TrackingError>(session)
        })?;

        log::debug!(
            "Recorded {} for {}@{} (active: {}, total: {}, fails: {})",
            event.status,
            session.username,
            session.remote_origin,
            session.active_count,
            session.total_count,
            session.fail_count
        );
        Ok(session)
    }

    // =====================
    // Queries
    // =====================

    pub fn stats(&self) -> Result<Stats, TrackingError> {
        Ok(self.store.view(|tx| self.stats.get_stats(tx))?)
    }

    pub fn user_sessions(&self, username: &str) -> Result<BTreeMap<String, Session>, TrackingError> {
        Ok(self
            .store
            .view(|tx| self.sessions.get_all_for_user(tx, username))?)
    }

    pub fn session(&self, username: &str, origin: &str) -> Result<Session, TrackingError> {
        Ok(self
            .store
            .view(|tx| self.sessions.get_session(tx, username, origin))?)
    }

    pub fn users(&self) -> Result<Vec<String>, TrackingError> {
        Ok(self.store.view(|tx| self.sessions.users(tx))?)
    }

    /// Check the stored active counters against the stored sessions
    ///
    /// Both are read from one snapshot.
    pub fn verify(&self) -> Result<Consistency, TrackingError> {
        let (sessions, recorded) = self.store.view(|tx| {
            let mut sessions = Vec::new();
            for user in self.sessions.users(tx)? {
                sessions.extend(self.sessions.get_all_for_user(tx, &user)?.into_values());
            }
            let recorded = self.stats.get_stats(tx)?;
            Ok::<_, PersistenceError>((sessions, recorded))
        })?;

        let expected = Stats::from_sessions(&sessions, recorded.stats_started);

        let mut cells = BTreeMap::new();
        for (origin, users) in &expected.active_sessions.by_origin {
            for (user, n) in users {
                cells.entry((user.clone(), origin.clone())).or_insert((0, 0)).0 = *n;
            }
        }
        for (origin, users) in &recorded.active_sessions.by_origin {
            for (user, n) in users {
                cells.entry((user.clone(), origin.clone())).or_insert((0, 0)).1 = *n;
            }
        }

        let mismatched = cells
            .into_iter()
            .filter(|(_, (expected, recorded))| expected != recorded)
            .map(|((user, origin), (expected, recorded))| (user, origin, expected, recorded))
            .collect();

        Ok(Consistency {
            sessions: sessions.len(),
            expected_active: expected.active_sessions.count,
            recorded_active: recorded.active_sessions.count,
            mismatched,
        })
    }
}
