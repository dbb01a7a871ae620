//! Notification subscribers
//!
//! Subscribers are webhook endpoints that receive accepted sessions. They
//! live in the store under `subscribers/<name>`; the bucket sequence is the
//! list version. [`SubscriberCache`] keeps a read-through copy for the
//! notifier, keyed by that version.

use super::store::{BucketId, Store, Transaction};
use super::{decode, encode, PersistenceError};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::{Arc, RwLock};

pub const SUBSCRIBERS_BUCKET: &str = "subscribers";

/// Payload flavour expected by the endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    #[default]
    Generic,
    Slack,
    Discord,
}

impl std::str::FromStr for SubscriberKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(SubscriberKind::Generic),
            "slack" => Ok(SubscriberKind::Slack),
            "discord" => Ok(SubscriberKind::Discord),
            other => Err(format!("unknown subscriber kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SubscriberKind,
    #[serde(default)]
    pub muted: bool,
}

impl Subscriber {
    pub fn new(name: impl Into<String>, url: impl Into<String>, kind: SubscriberKind) -> Self {
        Subscriber {
            name: name.into(),
            url: url.into(),
            kind,
            muted: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SubscriberRepository;

impl SubscriberRepository {
    pub fn new() -> Self {
        SubscriberRepository
    }

    pub fn get(
        &self,
        tx: &Transaction<'_>,
        name: &str,
    ) -> Result<Option<Subscriber>, PersistenceError> {
        let bucket = match tx.bucket(BucketId::ROOT, SUBSCRIBERS_BUCKET)? {
            Some(bucket) => bucket,
            None => return Ok(None),
        };
        match tx.get(bucket, name.as_bytes())? {
            Some(raw) => decode(&raw, &format!("{}/{}", SUBSCRIBERS_BUCKET, name)).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&self, tx: &Transaction<'_>, subscriber: &Subscriber) -> Result<(), PersistenceError> {
        let bucket = tx.create_bucket_if_absent(BucketId::ROOT, SUBSCRIBERS_BUCKET)?;
        tx.put(bucket, subscriber.name.as_bytes(), &encode(subscriber)?)?;
        tx.next_sequence(bucket)?;
        Ok(())
    }

    pub fn remove(&self, tx: &Transaction<'_>, name: &str) -> Result<bool, PersistenceError> {
        let bucket = match tx.bucket(BucketId::ROOT, SUBSCRIBERS_BUCKET)? {
            Some(bucket) => bucket,
            None => return Ok(false),
        };
        let removed = tx.delete(bucket, name.as_bytes())?;
        if removed {
            tx.next_sequence(bucket)?;
        }
        Ok(removed)
    }

    /// Version of the subscriber list, advanced by every `put` and `remove`
    pub fn version(&self, tx: &Transaction<'_>) -> Result<u64, PersistenceError> {
        match tx.bucket(BucketId::ROOT, SUBSCRIBERS_BUCKET)? {
            Some(bucket) => tx.sequence(bucket),
            None => Ok(0),
        }
    }

    /// All subscribers in name order
    pub fn list(&self, tx: &Transaction<'_>) -> Result<Vec<Subscriber>, PersistenceError> {
        let bucket = match tx.bucket(BucketId::ROOT, SUBSCRIBERS_BUCKET)? {
            Some(bucket) => bucket,
            None => return Ok(Vec::new()),
        };

        let mut subscribers = Vec::new();
        tx.ascending_iterate(bucket, |key, raw| {
            let location = format!("{}/{}", SUBSCRIBERS_BUCKET, String::from_utf8_lossy(key));
            subscribers.push(decode(raw, &location)?);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(subscribers)
    }
}

/// Read-through cache of the subscriber list
///
/// The store stays authoritative. Every read checks the stored list version
/// and reloads when it moved, so changes made through another handle or
/// process are seen on the next read.
pub struct SubscriberCache {
    store: Arc<Store>,
    repo: SubscriberRepository,
    cached: RwLock<Option<Snapshot>>,
}

struct Snapshot {
    version: u64,
    list: Arc<Vec<Subscriber>>,
}

impl SubscriberCache {
    pub fn new(store: Arc<Store>) -> Self {
        SubscriberCache {
            store,
            repo: SubscriberRepository::new(),
            cached: RwLock::new(None),
        }
    }

    /// Current subscriber list, reloaded from the store when it changed
    pub fn all(&self) -> Result<Arc<Vec<Subscriber>>, PersistenceError> {
        self.store.view(|tx| {
            let version = self.repo.version(tx)?;
            if let Some(list) = self.cached_at(version)? {
                return Ok(list);
            }

            let list = Arc::new(self.repo.list(tx)?);
            self.install(version, &list)?;
            Ok(list)
        })
    }

    fn cached_at(&self, version: u64) -> Result<Option<Arc<Vec<Subscriber>>>, PersistenceError> {
        let cached = self.cached.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(cached
            .as_ref()
            .filter(|snapshot| snapshot.version == version)
            .map(|snapshot| Arc::clone(&snapshot.list)))
    }

    /// Keep `list` unless a newer version was installed meanwhile
    fn install(&self, version: u64, list: &Arc<Vec<Subscriber>>) -> Result<(), PersistenceError> {
        let mut cached = self.cached.write().map_err(|_| PersistenceError::LockPoisoned)?;
        if cached.as_ref().map_or(true, |snapshot| snapshot.version <= version) {
            *cached = Some(Snapshot {
                version,
                list: Arc::clone(list),
            });
        }
        Ok(())
    }

    /// Subscribers that should receive notifications
    pub fn unmuted(&self) -> Result<Vec<Subscriber>, PersistenceError> {
        Ok(self.all()?.iter().filter(|s| !s.muted).cloned().collect())
    }

    /// Add or replace a subscriber, keeping its mute flag if it already exists
    pub fn upsert(&self, subscriber: Subscriber) -> Result<(), PersistenceError> {
        self.store.update(|tx| {
            let mut subscriber = subscriber;
            if let Some(existing) = self.repo.get(tx, &subscriber.name)? {
                subscriber.muted = existing.muted;
            }
            self.repo.put(tx, &subscriber)
        })
    }

    /// Returns false if no subscriber has that name
    pub fn set_muted(&self, name: &str, muted: bool) -> Result<bool, PersistenceError> {
        self.store.update(|tx| match self.repo.get(tx, name)? {
            Some(mut subscriber) => {
                subscriber.muted = muted;
                self.repo.put(tx, &subscriber)?;
                Ok::<_, PersistenceError>(true)
            }
            None => Ok(false),
        })
    }

    pub fn remove(&self, name: &str) -> Result<bool, PersistenceError> {
        self.store.update(|tx| self.repo.remove(tx, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_cache() -> SubscriberCache {
        SubscriberCache::new(Arc::new(Store::in_memory().unwrap()))
    }

    #[test]
    fn test_empty_store_has_no_subscribers() {
        let cache = create_cache();
        assert!(cache.all().unwrap().is_empty());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Slack".parse::<SubscriberKind>(), Ok(SubscriberKind::Slack));
        assert_eq!("generic".parse::<SubscriberKind>(), Ok(SubscriberKind::Generic));
        assert!("teams".parse::<SubscriberKind>().is_err());
    }

    #[test]
    fn test_upsert_and_mute() {
        let cache = create_cache();
        cache
            .upsert(Subscriber::new("ops", "http://localhost/ops", SubscriberKind::Slack))
            .unwrap();
        cache
            .upsert(Subscriber::new("audit", "http://localhost/audit", SubscriberKind::Generic))
            .unwrap();

        let names: Vec<_> = cache.all().unwrap().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["audit", "ops"]);

        assert!(cache.set_muted("ops", true).unwrap());
        assert!(!cache.set_muted("nobody", true).unwrap());

        let unmuted = cache.unmuted().unwrap();
        assert_eq!(unmuted.len(), 1);
        assert_eq!(unmuted[0].name, "audit");

        // re-registering from config does not unmute
        cache
            .upsert(Subscriber::new("ops", "http://localhost/ops2", SubscriberKind::Slack))
            .unwrap();
        let ops = cache.all().unwrap().iter().find(|s| s.name == "ops").cloned().unwrap();
        assert!(ops.muted);
        assert_eq!(ops.url, "http://localhost/ops2");
    }

    #[test]
    fn test_cache_reads_through_to_store() {
        let store = Arc::new(Store::in_memory().unwrap());
        let cache = SubscriberCache::new(Arc::clone(&store));
        assert!(cache.all().unwrap().is_empty());

        // written behind the cache's back
        store
            .update(|tx| {
                SubscriberRepository::new().put(tx, &Subscriber::new("late", "http://x", SubscriberKind::Generic))
            })
            .unwrap();
        assert_eq!(cache.all().unwrap().len(), 1);

        let first = cache.all().unwrap();
        let second = cache.all().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(cache.remove("late").unwrap());
        assert!(cache.all().unwrap().is_empty());
    }

    #[test]
    fn test_version_moves_on_every_change() {
        let store = Store::in_memory().unwrap();
        let repo = SubscriberRepository::new();
        let sub = Subscriber::new("ops", "http://x", SubscriberKind::Generic);

        let versions = store
            .update(|tx| {
                let empty = repo.version(tx)?;
                repo.put(tx, &sub)?;
                let added = repo.version(tx)?;
                repo.remove(tx, "nobody")?;
                let unchanged = repo.version(tx)?;
                repo.remove(tx, "ops")?;
                let removed = repo.version(tx)?;
                Ok::<_, PersistenceError>((empty, added, unchanged, removed))
            })
            .unwrap();
        assert_eq!(versions, (0, 1, 1, 2));
    }

    #[test]
    fn test_changes_from_another_handle_are_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loginwatch.db");

        let daemon = SubscriberCache::new(Arc::new(Store::open(&path).unwrap()));
        daemon
            .upsert(Subscriber::new("ops", "http://localhost/ops", SubscriberKind::Slack))
            .unwrap();
        assert_eq!(daemon.unmuted().unwrap().len(), 1);

        let cli = SubscriberCache::new(Arc::new(Store::open(&path).unwrap()));
        assert!(cli.set_muted("ops", true).unwrap());
        assert!(daemon.unmuted().unwrap().is_empty());

        assert!(cli.set_muted("ops", false).unwrap());
        cli.upsert(Subscriber::new("audit", "http://localhost/audit", SubscriberKind::Generic))
            .unwrap();
        let names: Vec<_> = daemon.unmuted().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["audit", "ops"]);

        assert!(cli.remove("ops").unwrap());
        assert_eq!(daemon.all().unwrap().len(), 1);
    }
}
