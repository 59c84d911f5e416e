//! Rate limit buckets.
//!
//! Discord does not publish which routes share a limit. Every request is first
//! mapped to a local bucket key derived from its path; once a response names
//! the server bucket (`X-RateLimit-Bucket`), keys that share it are re-pointed
//! to a single [`RouteBucket`] so they serialize against each other.
//! A single [`GlobalBucket`] gates every request on top of that; it is
//! consulted last, right before the call goes out.
//!
//! The capabilities are split into narrow traits so that a different limiting
//! strategy can be plugged into the client without touching dispatch.

mod bucket;
mod manager;

pub use bucket::{GlobalBucket, RouteBucket};
pub use manager::BucketManager;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::Response;

/// The network call run inside a transaction. Polled at most once.
pub type Work<'a> = BoxFuture<'a, Result<Response>>;

/// Exclusion plus rate limit state for one bucket.
#[async_trait]
pub trait RestBucket: Send + Sync {
    fn key(&self) -> &str;

    /// Wait out any known window, run `work`, then learn from its response.
    ///
    /// Cancelling `cancel` aborts any wait or the call itself with
    /// [`Error::Cancelled`](crate::Error::Cancelled); a cancelled transaction
    /// leaves the bucket state untouched.
    async fn transaction<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        work: Work<'a>,
    ) -> Result<Response>;
}

/// Lookup of buckets by local key.
pub trait BucketRegistry: Send + Sync {
    /// The bucket for `key`, created on first use.
    fn bucket(&self, key: &str) -> Arc<dyn RestBucket>;

    /// The account-wide bucket every request passes through.
    fn global(&self) -> Arc<dyn RestBucket>;

    /// Note that a response for `key` named `server_bucket`.
    fn record_association(&self, key: &str, server_bucket: &str);
}

/// Diagnostic view of discovered buckets.
pub trait BucketGrouping: Send + Sync {
    /// Server bucket id to the local keys known to share it. Keys with no
    /// known server bucket are listed under their own key.
    fn bucket_grouping(&self) -> HashMap<String, Vec<String>>;
}

/// Everything the client needs from a bucket manager.
pub trait RestBucketManager: BucketRegistry + BucketGrouping {}

impl<T: BucketRegistry + BucketGrouping> RestBucketManager for T {}
