use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{BucketGrouping, BucketRegistry, GlobalBucket, RestBucket, RouteBucket};

#[derive(Debug, Default)]
struct Discovered {
    /// Server bucket id to the bucket that governs it.
    by_server: HashMap<String, Arc<RouteBucket>>,
    /// Local key to the last server bucket id seen for it.
    server_of: HashMap<String, String>,
}

/// Default bucket manager.
///
/// Buckets are created lazily, one per local key, and live as long as the
/// manager. Once two keys are seen to share a server bucket, the later key is
/// re-pointed to the bucket already governing it. A transaction running on
/// the key's previous bucket keeps its exclusion, but its response is applied
/// to the governing bucket as well.
#[derive(Debug)]
pub struct BucketManager {
    global: Arc<GlobalBucket>,
    buckets: DashMap<String, Arc<RouteBucket>>,
    discovered: Mutex<Discovered>,
    cancel_when_rate_limited: bool,
}

impl Default for BucketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketManager {
    pub fn new() -> Self {
        Self::with_cancel_when_rate_limited(false)
    }

    /// Buckets fail with [`Error::RateLimited`](crate::Error::RateLimited)
    /// instead of waiting when `enabled`.
    pub fn with_cancel_when_rate_limited(enabled: bool) -> Self {
        Self {
            global: Arc::new(GlobalBucket::new().cancel_when_rate_limited(enabled)),
            buckets: DashMap::new(),
            discovered: Mutex::new(Discovered::default()),
            cancel_when_rate_limited: enabled,
        }
    }

    /// The bucket currently governing `key`, created if unseen.
    pub fn route_bucket(&self, key: &str) -> Arc<RouteBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }
        // entry() holds the shard lock, so racing callers share one bucket
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("new bucket for {}", key);
                Arc::new(
                    RouteBucket::new(key).cancel_when_rate_limited(self.cancel_when_rate_limited),
                )
            })
            .clone()
    }

    /// Number of local keys seen so far.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl BucketRegistry for BucketManager {
    fn bucket(&self, key: &str) -> Arc<dyn RestBucket> {
        self.route_bucket(key)
    }

    fn global(&self) -> Arc<dyn RestBucket> {
        self.global.clone()
    }

    fn record_association(&self, key: &str, server_bucket: &str) {
        let mut discovered = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if discovered.server_of.get(key).map(String::as_str) == Some(server_bucket) {
            return;
        }

        let current = self.route_bucket(key);
        let governing = discovered.by_server.get(server_bucket).cloned();
        match governing {
            Some(shared) if !Arc::ptr_eq(&shared, &current) => {
                debug!(
                    "{} shares server bucket {} with {}; re-pointing",
                    key,
                    server_bucket,
                    shared.key()
                );
                current.hand_over_to(&shared);
                self.buckets.insert(key.to_string(), shared);
            }
            Some(_) => {}
            None => {
                debug!("{} belongs to server bucket {}", key, server_bucket);
                discovered
                    .by_server
                    .insert(server_bucket.to_string(), current);
            }
        }
        discovered
            .server_of
            .insert(key.to_string(), server_bucket.to_string());
    }
}

impl BucketGrouping for BucketManager {
    fn bucket_grouping(&self) -> HashMap<String, Vec<String>> {
        let discovered = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut group: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.buckets.iter() {
            let key = entry.key();
            let id = discovered.server_of.get(key).unwrap_or(key);
            group.entry(id.clone()).or_default().push(key.clone());
        }
        for keys in group.values_mut() {
            keys.sort();
        }
        group
    }
}
