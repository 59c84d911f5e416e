use async_trait::async_trait;
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{RestBucket, Work};
use crate::error::{Error, Result};
use crate::http::headers::RateLimitHeaders;
use crate::types::Response;

pub(crate) const GLOBAL_BUCKET_KEY: &str = "global";

// Upper bound on any server-declared wait; keeps deadline arithmetic in range.
const MAX_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 365);

fn deadline(now: Instant, after: Duration) -> Instant {
    now + after.min(MAX_WINDOW)
}

#[derive(Debug, Default)]
struct BucketState {
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    /// Set by a 429; only time lifts it.
    blocked_until: Option<Instant>,
}

impl BucketState {
    /// Time left before the next call may go out.
    fn wait(&self, now: Instant) -> Option<Duration> {
        let window = match (self.remaining, self.reset_at) {
            (Some(0), reset_at) => reset_at,
            _ => None,
        };
        let until = window.into_iter().chain(self.blocked_until).max()?;
        (until > now).then(|| until - now)
    }

    fn update(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if self.reset_at.is_some_and(|reset_at| reset_at <= now) {
            self.remaining = None;
            self.reset_at = None;
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
        self.remaining = match headers.remaining {
            Some(remaining) => Some(remaining),
            // nothing declared: spend one optimistically, the server has the last word
            None => self.remaining.map(|r| r.saturating_sub(1)),
        };
        if let Some(after) = headers.retry_in() {
            self.reset_at = Some(deadline(now, after));
        }
    }

    fn block_for(&mut self, retry_after: Duration, now: Instant) {
        let until = deadline(now, retry_after);
        self.blocked_until = Some(self.blocked_until.map_or(until, |at| at.max(until)));
    }
}

fn lock(state: &Mutex<BucketState>) -> MutexGuard<'_, BucketState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sleep until `state` allows a call, re-reading it after every sleep since
/// other responses may extend the window meanwhile.
async fn wait_window(
    state: &Mutex<BucketState>,
    key: &str,
    cancel_when_rate_limited: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let Some(wait) = lock(state).wait(Instant::now()) else {
            return Ok(());
        };
        if cancel_when_rate_limited {
            return Err(Error::RateLimited {
                bucket_key: key.to_string(),
                retry_after: wait,
            });
        }
        debug!("bucket {} exhausted, waiting {:?}", key, wait);
        wait_out(cancel, wait).await?;
    }
}

async fn wait_out(cancel: &CancellationToken, wait: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

async fn run(cancel: &CancellationToken, work: Work<'_>) -> Result<Response> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = work => res,
    }
}

/// Bucket for one or more routes. Runs one transaction at a time, in arrival order.
#[derive(Debug)]
pub struct RouteBucket {
    key: String,
    turn: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
    /// Bucket that took over this one's keys; it hears about our responses too.
    successor: Mutex<Weak<RouteBucket>>,
    cancel_when_rate_limited: bool,
}

impl RouteBucket {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState::default()),
            successor: Mutex::new(Weak::new()),
            cancel_when_rate_limited: false,
        }
    }

    /// Fail with [`Error::RateLimited`] instead of waiting out a known window.
    pub fn cancel_when_rate_limited(mut self, enabled: bool) -> Self {
        self.cancel_when_rate_limited = enabled;
        self
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        lock(&self.state)
    }

    /// Hand this bucket's keys over to `next`.
    ///
    /// `next` inherits any window still in force here, and responses of
    /// transactions still running on this bucket are applied to `next` as well.
    pub(crate) fn hand_over_to(&self, next: &Arc<RouteBucket>) {
        let now = Instant::now();
        let wait = self.state().wait(now);
        if let Some(wait) = wait {
            next.state().block_for(wait, now);
        }
        *self
            .successor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(next);
    }

    fn learn(&self, headers: &RateLimitHeaders) {
        if headers.is_rate_limited() && headers.global {
            // belongs to the global bucket; route counters are unaffected
            return;
        }
        let now = Instant::now();
        let mut state = self.state();
        state.update(headers, now);
        if headers.is_rate_limited() {
            let retry_after = headers.retry_in().unwrap_or_default();
            warn!(
                "bucket {} hit a rate limit, blocking for {:?}",
                self.key, retry_after
            );
            state.block_for(retry_after, now);
        }
    }
}

#[async_trait]
impl RestBucket for RouteBucket {
    fn key(&self) -> &str {
        &self.key
    }

    async fn transaction<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        work: Work<'a>,
    ) -> Result<Response> {
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.turn.lock() => guard,
        };
        wait_window(&self.state, &self.key, self.cancel_when_rate_limited, cancel).await?;

        let response = run(cancel, work).await?;
        self.learn(&response.rate_limit);
        let successor = self
            .successor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        if let Some(next) = successor {
            next.learn(&response.rate_limit);
        }
        Ok(response)
    }
}

/// Account-wide gate.
///
/// Unlike a [`RouteBucket`] the exclusion only covers the wait: requests queue
/// up behind a known global window, but calls themselves run concurrently.
/// Compose it innermost, right around the call, so a window opened while a
/// request queues on its route still applies.
#[derive(Debug)]
pub struct GlobalBucket {
    gate: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
    cancel_when_rate_limited: bool,
}

impl Default for GlobalBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalBucket {
    pub fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState::default()),
            cancel_when_rate_limited: false,
        }
    }

    pub fn cancel_when_rate_limited(mut self, enabled: bool) -> Self {
        self.cancel_when_rate_limited = enabled;
        self
    }

    async fn pass_gate(&self, cancel: &CancellationToken) -> Result<()> {
        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.gate.lock() => guard,
        };
        wait_window(
            &self.state,
            GLOBAL_BUCKET_KEY,
            self.cancel_when_rate_limited,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl RestBucket for GlobalBucket {
    fn key(&self) -> &str {
        GLOBAL_BUCKET_KEY
    }

    async fn transaction<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        work: Work<'a>,
    ) -> Result<Response> {
        self.pass_gate(cancel).await?;
        let response = run(cancel, work).await?;

        let headers = &response.rate_limit;
        if headers.is_rate_limited() && headers.global {
            let retry_after = headers.retry_in().unwrap_or_default();
            warn!("global rate limit hit, blocking all routes for {:?}", retry_after);
            lock(&self.state).block_for(retry_after, Instant::now());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::response;
    use futures::FutureExt;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_work(remaining: Option<u32>, reset_after: Option<f64>) -> Work<'static> {
        async move { Ok(response(StatusCode::OK, remaining, reset_after, None, false)) }.boxed()
    }

    fn limited_work(retry_after: f64, global: bool) -> Work<'static> {
        async move {
            Ok(response(
                StatusCode::TOO_MANY_REQUESTS,
                Some(0),
                Some(retry_after),
                None,
                global,
            ))
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_reset() {
        let bucket = RouteBucket::new("GET:/x");
        let cancel = CancellationToken::new();
        bucket
            .transaction(&cancel, ok_work(Some(0), Some(2.0)))
            .await
            .unwrap();

        let start = Instant::now();
        bucket
            .transaction(&cancel, ok_work(Some(4), Some(2.0)))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_quota_does_not_wait() {
        let bucket = RouteBucket::new("GET:/x");
        let cancel = CancellationToken::new();
        bucket
            .transaction(&cancel, ok_work(Some(3), Some(5.0)))
            .await
            .unwrap();
        let start = Instant::now();
        bucket.transaction(&cancel, ok_work(None, None)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_skips_work_and_keeps_state() {
        let bucket = Arc::new(RouteBucket::new("GET:/x"));
        let cancel = CancellationToken::new();
        bucket
            .transaction(&cancel, ok_work(Some(0), Some(10.0)))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let waiting = CancellationToken::new();
        let trigger = waiting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let counter = calls.clone();
        let err = bucket
            .transaction(
                &waiting,
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(response(StatusCode::OK, Some(5), None, None, false))
                }
                .boxed(),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(bucket.state().wait(Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_reports_the_window() {
        let bucket = RouteBucket::new("GET:/x").cancel_when_rate_limited(true);
        let cancel = CancellationToken::new();
        bucket
            .transaction(&cancel, ok_work(Some(0), Some(3.0)))
            .await
            .unwrap();
        let err = bucket.transaction(&cancel, ok_work(None, None)).await.unwrap_err();
        match err {
            Error::RateLimited {
                bucket_key,
                retry_after,
            } => {
                assert_eq!(bucket_key, "GET:/x");
                assert!(retry_after <= Duration::from_secs(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn global_rate_limit_blocks_the_gate_not_the_route() {
        let global = GlobalBucket::new();
        let route = RouteBucket::new("GET:/x");
        let cancel = CancellationToken::new();

        route
            .transaction(&cancel, global.transaction(&cancel, limited_work(1.0, true)))
            .await
            .unwrap();
        assert!(route.state().wait(Instant::now()).is_none());
        assert!(lock(&global.state).wait(Instant::now()).is_some());

        let start = Instant::now();
        global.transaction(&cancel, ok_work(None, None)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_a_429_does_not_lift_the_block() {
        let bucket = RouteBucket::new("GET:/x");
        let cancel = CancellationToken::new();
        bucket
            .transaction(&cancel, limited_work(5.0, false))
            .await
            .unwrap();
        bucket.learn(&response(StatusCode::OK, Some(9), Some(0.1), None, false).rate_limit);
        let wait = bucket.state().wait(Instant::now()).unwrap();
        assert!(wait > Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn handed_over_bucket_forwards_a_429_to_its_successor() {
        let old = RouteBucket::new("PATCH:/users/{id}");
        let next = Arc::new(RouteBucket::new("GET:/users/{id}"));
        let cancel = CancellationToken::new();

        // hand-over happens while the call is in flight, as when the response
        // is the first to name the shared server bucket
        let handed = async {
            old.hand_over_to(&next);
            Ok(response(
                StatusCode::TOO_MANY_REQUESTS,
                Some(0),
                Some(5.0),
                Some("abc"),
                false,
            ))
        }
        .boxed();
        old.transaction(&cancel, handed).await.unwrap();

        let start = Instant::now();
        next.transaction(&cancel, ok_work(Some(4), None)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn hand_over_carries_an_open_window() {
        let now = Instant::now();
        let old = RouteBucket::new("a");
        old.state().block_for(Duration::from_secs(3), now);
        let next = Arc::new(RouteBucket::new("b"));
        old.hand_over_to(&next);
        assert!(next.state().wait(Instant::now()).is_some());
    }

    #[test]
    fn absurd_reset_after_is_clamped() {
        let now = Instant::now();
        let mut state = BucketState::default();
        let huge = Duration::from_secs(18_000_000_000_000_000_000);
        let mut headers = response(StatusCode::OK, Some(0), None, None, false).rate_limit;
        headers.reset_after = Some(huge);
        state.update(&headers, now);
        state.block_for(huge, now);
        assert!(state.wait(now).unwrap() <= MAX_WINDOW);
    }

    #[test]
    fn expired_window_resets_counters() {
        let now = Instant::now();
        let mut state = BucketState {
            remaining: Some(0),
            reset_at: Some(now),
            blocked_until: Some(now),
        };
        let headers = response(StatusCode::OK, None, None, None, false).rate_limit;
        state.update(&headers, now + Duration::from_secs(1));
        assert_eq!(state.remaining, None);
        assert_eq!(state.reset_at, None);
        assert_eq!(state.blocked_until, None);
    }
}
