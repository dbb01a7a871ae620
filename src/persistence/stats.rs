//! Stats repository: a single record under a fixed key

use super::store::{BucketId, Transaction};
use super::{decode, encode, PersistenceError};
use crate::models::Stats;
use chrono::Utc;

pub const STATS_BUCKET: &str = "stats";
pub const STATS_KEY: &[u8] = b"auth_stats";

/// Storage of the global [`Stats`] record
pub trait StatsRepository: Send + Sync {
    /// The stored record, if one was ever written
    fn load_stats(&self, tx: &Transaction<'_>) -> Result<Option<Stats>, PersistenceError>;

    /// Overwrite the stored record
    fn put_stats(&self, tx: &Transaction<'_>, stats: &Stats) -> Result<(), PersistenceError>;

    /// The stored record, or fresh zero stats starting now
    fn get_stats(&self, tx: &Transaction<'_>) -> Result<Stats, PersistenceError> {
        Ok(self
            .load_stats(tx)?
            .unwrap_or_else(|| Stats::new(Utc::now())))
    }
}

#[derive(Debug, Default, Clone)]
pub struct BucketStatsRepository;

impl BucketStatsRepository {
    pub fn new() -> Self {
        BucketStatsRepository
    }
}

impl StatsRepository for BucketStatsRepository {
    fn load_stats(&self, tx: &Transaction<'_>) -> Result<Option<Stats>, PersistenceError> {
        let bucket = match tx.bucket(BucketId::ROOT, STATS_BUCKET)? {
            Some(bucket) => bucket,
            None => return Ok(None),
        };

        match tx.get(bucket, STATS_KEY)? {
            Some(raw) => {
                let location = format!("{}/{}", STATS_BUCKET, String::from_utf8_lossy(STATS_KEY));
                decode(&raw, &location).map(Some)
            }
            None => Ok(None),
        }
    }

    fn put_stats(&self, tx: &Transaction<'_>, stats: &Stats) -> Result<(), PersistenceError> {
        let bucket = tx.create_bucket_if_absent(BucketId::ROOT, STATS_BUCKET)?;
        tx.put(bucket, STATS_KEY, &encode(stats)?)
    }
}
