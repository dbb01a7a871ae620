//! Session repository
//!
//! Storage layout:
//!
//! ```text
//! sessions/              bucket
//!   <username>/          bucket, one per user
//!     <origin> -> JSON   one entry per remote origin
//! ```

use super::store::{BucketId, Transaction};
use super::{decode, encode, PersistenceError};
use crate::models::Session;
use std::collections::BTreeMap;
use std::ops::ControlFlow;

pub const SESSIONS_BUCKET: &str = "sessions";

/// Storage of per `(username, origin)` sessions
///
/// Every method runs inside the caller's transaction so session writes can
/// be committed together with other records.
pub trait SessionRepository: Send + Sync {
    /// Load a session, or the empty session if the key was never seen
    fn get_session(
        &self,
        tx: &Transaction<'_>,
        username: &str,
        origin: &str,
    ) -> Result<Session, PersistenceError>;

    /// Visit a user's sessions in ascending origin order until `f` breaks
    fn scan_user(
        &self,
        tx: &Transaction<'_>,
        username: &str,
        f: &mut dyn FnMut(Session) -> ControlFlow<()>,
    ) -> Result<(), PersistenceError>;

    /// Store a session, assigning its id on first write
    fn put_session(&self, tx: &Transaction<'_>, session: &mut Session) -> Result<(), PersistenceError>;

    /// Every username that has at least one stored session
    fn users(&self, tx: &Transaction<'_>) -> Result<Vec<String>, PersistenceError>;

    /// All sessions of a user keyed by origin
    fn get_all_for_user(
        &self,
        tx: &Transaction<'_>,
        username: &str,
    ) -> Result<BTreeMap<String, Session>, PersistenceError> {
        let mut sessions = BTreeMap::new();
        self.scan_user(tx, username, &mut |session| {
            sessions.insert(session.remote_origin.clone(), session);
            ControlFlow::Continue(())
        })?;
        Ok(sessions)
    }
}

/// [`SessionRepository`] over nested buckets
#[derive(Debug, Default, Clone)]
pub struct BucketSessionRepository;

impl BucketSessionRepository {
    pub fn new() -> Self {
        BucketSessionRepository
    }

    fn user_bucket(
        tx: &Transaction<'_>,
        username: &str,
    ) -> Result<Option<BucketId>, PersistenceError> {
        tx.bucket_path(&[SESSIONS_BUCKET, username])
    }
}

impl SessionRepository for BucketSessionRepository {
    fn get_session(
        &self,
        tx: &Transaction<'_>,
        username: &str,
        origin: &str,
    ) -> Result<Session, PersistenceError> {
        let raw = match Self::user_bucket(tx, username)? {
            Some(bucket) => tx.get(bucket, origin.as_bytes())?,
            None => None,
        };

        match raw {
            Some(raw) => decode(&raw, &format!("{}/{}/{}", SESSIONS_BUCKET, username, origin)),
            None => Ok(Session::empty(username, origin)),
        }
    }

    fn scan_user(
        &self,
        tx: &Transaction<'_>,
        username: &str,
        f: &mut dyn FnMut(Session) -> ControlFlow<()>,
    ) -> Result<(), PersistenceError> {
        let bucket = match Self::user_bucket(tx, username)? {
            Some(bucket) => bucket,
            None => return Ok(()),
        };

        tx.ascending_iterate(bucket, |key, raw| {
            let location = format!(
                "{}/{}/{}",
                SESSIONS_BUCKET,
                username,
                String::from_utf8_lossy(key)
            );
            let session: Session = decode(raw, &location)?;
            Ok(f(session))
        })
    }

    fn put_session(&self, tx: &Transaction<'_>, session: &mut Session) -> Result<(), PersistenceError> {
        let root = tx.create_bucket_if_absent(BucketId::ROOT, SESSIONS_BUCKET)?;
        let bucket = tx.create_bucket_if_absent(root, &session.username)?;

        if session.id == 0 {
            session.id = tx.next_sequence(bucket)?;
        }

        tx.put(bucket, session.remote_origin.as_bytes(), &encode(session)?)
    }

    fn users(&self, tx: &Transaction<'_>) -> Result<Vec<String>, PersistenceError> {
        match tx.bucket(BucketId::ROOT, SESSIONS_BUCKET)? {
            Some(root) => tx.child_buckets(root),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthEvent, AuthStatus};
    use crate::persistence::Store;
    use chrono::{TimeZone, Utc};

    fn create_test_store() -> Store {
        Store::in_memory().expect("Failed to create in-memory store")
    }

    fn session(user: &str, origin: &str) -> Session {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Session::new(&AuthEvent::accepted(user, "password", origin, at))
    }

    #[test]
    fn test_missing_session_is_empty() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();

        let found = store
            .view(|tx| repo.get_session(tx, "bob", "1.2.3.4"))
            .unwrap();
        assert_eq!(found, Session::empty("bob", "1.2.3.4"));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();
        let mut stored = session("bob", "1.2.3.4");

        store.update(|tx| repo.put_session(tx, &mut stored)).unwrap();
        assert_eq!(stored.id, 1);

        let first = store.view(|tx| repo.get_session(tx, "bob", "1.2.3.4")).unwrap();
        let second = store.view(|tx| repo.get_session(tx, "bob", "1.2.3.4")).unwrap();
        assert_eq!(first, stored);
        assert_eq!(first, second);
    }

    #[test]
    fn test_ids_assigned_once_per_user() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();
        let mut a = session("bob", "1.1.1.1");
        let mut b = session("bob", "2.2.2.2");
        let mut c = session("alice", "1.1.1.1");

        store
            .update(|tx| {
                repo.put_session(tx, &mut a)?;
                repo.put_session(tx, &mut b)?;
                repo.put_session(tx, &mut c)?;
                // rewriting keeps the id
                repo.put_session(tx, &mut a)
            })
            .unwrap();

        assert_eq!((a.id, b.id, c.id), (1, 2, 1));
    }

    #[test]
    fn test_get_all_for_user() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();

        store
            .update(|tx| {
                for origin in ["9.9.9.9", "1.1.1.1", "5.5.5.5"] {
                    repo.put_session(tx, &mut session("bob", origin))?;
                }
                repo.put_session(tx, &mut session("alice", "1.1.1.1"))
            })
            .unwrap();

        let all = store.view(|tx| repo.get_all_for_user(tx, "bob")).unwrap();
        assert_eq!(
            all.keys().collect::<Vec<_>>(),
            vec!["1.1.1.1", "5.5.5.5", "9.9.9.9"]
        );
        assert!(all.values().all(|s| s.username == "bob"));

        let nobody = store.view(|tx| repo.get_all_for_user(tx, "carol")).unwrap();
        assert!(nobody.is_empty());

        let users = store.view(|tx| repo.users(tx)).unwrap();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn test_scan_stops_early() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();
        store
            .update(|tx| {
                for origin in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
                    repo.put_session(tx, &mut session("bob", origin))?;
                }
                Ok::<_, PersistenceError>(())
            })
            .unwrap();

        let mut seen = Vec::new();
        store
            .view(|tx| {
                repo.scan_user(tx, "bob", &mut |s| {
                    seen.push(s.remote_origin);
                    ControlFlow::Break(())
                })
            })
            .unwrap();
        assert_eq!(seen, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_unknown_origin_is_its_own_key() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();
        let mut unknown = session("bob", "");

        store.update(|tx| repo.put_session(tx, &mut unknown)).unwrap();

        let found = store.view(|tx| repo.get_session(tx, "bob", "")).unwrap();
        assert_eq!(found.status, Some(AuthStatus::Accepted));
        let other = store.view(|tx| repo.get_session(tx, "bob", "1.2.3.4")).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let store = create_test_store();
        let repo = BucketSessionRepository::new();

        store
            .update(|tx| {
                let root = tx.create_bucket_if_absent(BucketId::ROOT, SESSIONS_BUCKET)?;
                let user = tx.create_bucket_if_absent(root, "bob")?;
                tx.put(user, b"1.2.3.4", b"{not json")
            })
            .unwrap();

        let result = store.view(|tx| repo.get_session(tx, "bob", "1.2.3.4"));
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));

        let result = store.view(|tx| repo.get_all_for_user(tx, "bob"));
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));
    }
}
