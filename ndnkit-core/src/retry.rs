//! Retry wrapper for outstanding requests.
//!
//! Timeouts are intercepted here and turned into either a re-issued request
//! or one final failure. Each wrapped request settles exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::face::Face;
use crate::packet::{Request, Response};

/// What to do when a request times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Re-issue immediately, at most `max_retries` times per request.
    Fixed { max_retries: u32 },
    /// Multiply the lifetime by `factor` on each timeout; give up once the
    /// next lifetime would exceed `cutoff`.
    Backoff {
        factor: f64,
        #[serde(with = "crate::config::duration_ms")]
        cutoff: Duration,
    },
    /// Re-issue until cancelled. Used for long-poll requests.
    Forever,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Lifetime for the next attempt after `retries` retries already made,
    /// or `None` to give up.
    pub fn next_lifetime(&self, retries: u32, lifetime: Duration) -> Option<Duration> {
        match self {
            RetryPolicy::Fixed { max_retries } => (retries < *max_retries).then_some(lifetime),
            RetryPolicy::Backoff { factor, cutoff } => {
                if !backoff_grows(*factor) {
                    return None;
                }
                // A lifetime too large for `Duration` is past any cutoff.
                let next = Duration::try_from_secs_f64(lifetime.as_secs_f64() * factor).ok()?;
                (next <= *cutoff).then_some(next)
            }
            RetryPolicy::Forever => Some(lifetime),
        }
    }

    /// Reject a backoff that would never reach its cutoff.
    pub fn validate(&self) -> Result<()> {
        match self {
            RetryPolicy::Backoff { factor, .. } if !backoff_grows(*factor) => {
                Err(Error::InvalidConfig(format!(
                    "backoff factor must be greater than 1, got {}",
                    factor
                )))
            }
            _ => Ok(()),
        }
    }
}

fn backoff_grows(factor: f64) -> bool {
    factor.is_finite() && factor > 1.0
}

/// Counters shared by every request wrapped with the same stats handle.
#[derive(Debug, Default)]
pub struct RetryStats {
    retries: AtomicU32,
    exhausted: AtomicU32,
}

impl RetryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Retries issued across all requests.
    pub fn total_retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Requests that gave up.
    pub fn exhausted(&self) -> u32 {
        self.exhausted.load(Ordering::SeqCst)
    }
}

type SuccessCallback = Box<dyn FnOnce(Response) + Send>;
type FailureCallback = Box<dyn FnOnce(Error) + Send>;

struct Attempt {
    face: Arc<dyn Face>,
    policy: RetryPolicy,
    stats: Arc<RetryStats>,
    retries: AtomicU32,
    settled: AtomicBool,
    outer: CancelToken,
    current: Mutex<Option<CancelToken>>,
    on_success: Mutex<Option<SuccessCallback>>,
    on_failure: Mutex<Option<FailureCallback>>,
}

/// Send `request`, retrying timeouts under `policy`.
///
/// Exactly one of `on_success` / `on_failure` fires, unless the returned
/// token is cancelled first. Budget exhaustion reports
/// [`Error::RequestTimeout`].
pub fn send_with_retry(
    face: Arc<dyn Face>,
    request: Request,
    policy: RetryPolicy,
    stats: Arc<RetryStats>,
    on_success: impl FnOnce(Response) + Send + 'static,
    on_failure: impl FnOnce(Error) + Send + 'static,
) -> Result<CancelToken> {
    let outer = CancelToken::new();
    let attempt = Arc::new(Attempt {
        face,
        policy,
        stats,
        retries: AtomicU32::new(0),
        settled: AtomicBool::new(false),
        outer: outer.clone(),
        current: Mutex::new(None),
        on_success: Mutex::new(Some(Box::new(on_success))),
        on_failure: Mutex::new(Some(Box::new(on_failure))),
    });
    let weak: Weak<Attempt> = Arc::downgrade(&attempt);
    outer.on_cancel(move || {
        if let Some(a) = weak.upgrade() {
            if let Some(t) = a.current.lock().take() {
                t.cancel();
            }
        }
    });
    attempt.issue(request)?;
    Ok(outer)
}

impl Attempt {
    fn issue(self: &Arc<Self>, request: Request) -> Result<()> {
        let on_response = {
            let a = self.clone();
            Box::new(move |r: Response| a.succeed(r))
        };
        let on_timeout = {
            let a = self.clone();
            let request = request.clone();
            Box::new(move || a.timed_out(request))
        };
        let token = self.face.send_request(request, on_response, on_timeout)?;
        if self.outer.is_cancelled() {
            token.cancel();
        } else {
            *self.current.lock() = Some(token);
        }
        Ok(())
    }

    fn timed_out(self: &Arc<Self>, request: Request) {
        if self.outer.is_cancelled() || self.settled.load(Ordering::SeqCst) {
            return;
        }
        let retries = self.retries.load(Ordering::SeqCst);
        match self.policy.next_lifetime(retries, request.lifetime) {
            Some(lifetime) => {
                self.retries.fetch_add(1, Ordering::SeqCst);
                self.stats.retries.fetch_add(1, Ordering::SeqCst);
                debug!(name = %request.name, retry = retries + 1, ?lifetime, "retrying request");
                let name = request.name.clone();
                if let Err(e) = self.issue(request.with_lifetime(lifetime)) {
                    warn!(%name, error = %e, "failed to re-issue request");
                    self.fail(e);
                }
            }
            None => {
                warn!(name = %request.name, retries, "retry budget exhausted");
                self.stats.exhausted.fetch_add(1, Ordering::SeqCst);
                self.fail(Error::RequestTimeout { name: request.name });
            }
        }
    }

    fn settle(&self) -> bool {
        !self.outer.is_cancelled()
            && self
                .settled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn succeed(&self, response: Response) {
        if self.settle() {
            if let Some(cb) = self.on_success.lock().take() {
                cb(response);
            }
            self.on_failure.lock().take();
        }
    }

    fn fail(&self, error: Error) {
        if self.settle() {
            if let Some(cb) = self.on_failure.lock().take() {
                cb(error);
            }
            self.on_success.lock().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::LocalFace;
    use crate::name::Name;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct Outcome {
        successes: u32,
        failures: Vec<Error>,
    }

    fn run(
        face: &Arc<LocalFace>,
        request: Request,
        policy: RetryPolicy,
        stats: Arc<RetryStats>,
    ) -> (Arc<Mutex<Outcome>>, CancelToken) {
        let outcome = Arc::new(Mutex::new(Outcome::default()));
        let (o1, o2) = (outcome.clone(), outcome.clone());
        let token = send_with_retry(
            face.clone(),
            request,
            policy,
            stats,
            move |_| o1.lock().successes += 1,
            move |e| o2.lock().failures.push(e),
        )
        .unwrap();
        (outcome, token)
    }

    fn echo_face() -> Arc<LocalFace> {
        let face = Arc::new(LocalFace::with_tick(Duration::from_millis(10)));
        face.register_provider(
            name("/svc"),
            Arc::new(|r: &Request| Some(Response::new(r.name.clone(), b"ok".to_vec()))),
        )
        .unwrap();
        face
    }

    fn pump(face: &LocalFace, n: usize) {
        for _ in 0..n {
            face.pump().unwrap();
        }
    }

    #[test]
    fn fixed_policy_counts_retries_then_succeeds() {
        let face = echo_face();
        face.drop_next_requests(3);
        let stats = RetryStats::new();
        let request = Request::new(name("/svc/x")).with_lifetime(Duration::from_millis(20));
        let policy = RetryPolicy::Fixed { max_retries: 3 };
        let (outcome, _token) = run(&face, request, policy, stats.clone());
        pump(&face, 20);
        let outcome = outcome.lock();
        assert_eq!(stats.total_retries(), 3);
        assert_eq!(outcome.successes, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(face.sent_requests(), 4);
    }

    #[test]
    fn fixed_policy_exhaustion_fails_once() {
        let face = echo_face();
        face.drop_next_requests(10);
        let stats = RetryStats::new();
        let request = Request::new(name("/svc/x")).with_lifetime(Duration::from_millis(20));
        let policy = RetryPolicy::Fixed { max_retries: 2 };
        let (outcome, _token) = run(&face, request, policy, stats.clone());
        pump(&face, 30);
        let outcome = outcome.lock();
        assert_eq!(outcome.successes, 0);
        assert_eq!(
            outcome.failures,
            vec![Error::RequestTimeout { name: name("/svc/x") }]
        );
        assert_eq!(stats.total_retries(), 2);
        assert_eq!(stats.exhausted(), 1);
    }

    #[test]
    fn shared_stats_across_concurrent_requests() {
        let face = echo_face();
        face.drop_next_requests(2);
        let stats = RetryStats::new();
        let lifetime = Duration::from_millis(20);
        let (a, _ta) = run(
            &face,
            Request::new(name("/svc/a")).with_lifetime(lifetime),
            RetryPolicy::Fixed { max_retries: 1 },
            stats.clone(),
        );
        let (b, _tb) = run(
            &face,
            Request::new(name("/svc/b")).with_lifetime(lifetime),
            RetryPolicy::Fixed { max_retries: 1 },
            stats.clone(),
        );
        pump(&face, 10);
        assert_eq!(stats.total_retries(), 2);
        assert_eq!(a.lock().successes, 1);
        assert_eq!(b.lock().successes, 1);
    }

    #[test]
    fn backoff_grows_lifetime_until_cutoff() {
        let policy = RetryPolicy::Backoff {
            factor: 2.0,
            cutoff: Duration::from_millis(100),
        };
        let l = Duration::from_millis(20);
        assert_eq!(policy.next_lifetime(0, l), Some(Duration::from_millis(40)));
        assert_eq!(
            policy.next_lifetime(1, Duration::from_millis(40)),
            Some(Duration::from_millis(80))
        );
        assert_eq!(policy.next_lifetime(2, Duration::from_millis(80)), None);
    }

    #[test]
    fn backoff_policy_gives_up() {
        let face = echo_face();
        face.drop_next_requests(10);
        let stats = RetryStats::new();
        let policy = RetryPolicy::Backoff {
            factor: 2.0,
            cutoff: Duration::from_millis(100),
        };
        let request = Request::new(name("/svc/x")).with_lifetime(Duration::from_millis(20));
        let (outcome, _token) = run(&face, request, policy, stats.clone());
        // 20 + 40 + 80 ms of lifetimes, then the 160 ms attempt is refused.
        pump(&face, 20);
        assert_eq!(outcome.lock().failures.len(), 1);
        assert_eq!(stats.total_retries(), 2);
        assert_eq!(face.sent_requests(), 3);
    }

    #[test]
    fn oversized_backoff_gives_up_instead_of_overflowing() {
        let policy = RetryPolicy::Backoff {
            factor: 1e30,
            cutoff: Duration::from_secs(10),
        };
        assert_eq!(policy.next_lifetime(0, Duration::from_secs(4)), None);

        let face = echo_face();
        face.drop_next_requests(10);
        let stats = RetryStats::new();
        let request = Request::new(name("/svc/x")).with_lifetime(Duration::from_millis(20));
        let (outcome, _token) = run(&face, request, policy, stats.clone());
        pump(&face, 5);
        assert_eq!(
            outcome.lock().failures,
            vec![Error::RequestTimeout { name: name("/svc/x") }]
        );
        assert_eq!(stats.total_retries(), 0);
        assert_eq!(face.sent_requests(), 1);
    }

    #[test]
    fn backoff_that_cannot_grow_is_rejected() {
        let l = Duration::from_millis(20);
        for factor in [1.0, 0.5, -2.0, f64::NAN, f64::INFINITY] {
            let policy = RetryPolicy::Backoff {
                factor,
                cutoff: Duration::from_secs(1),
            };
            assert!(matches!(policy.validate(), Err(Error::InvalidConfig(_))));
            assert_eq!(policy.next_lifetime(0, l), None);
        }
        let ok = RetryPolicy::Backoff {
            factor: 1.5,
            cutoff: Duration::from_secs(1),
        };
        assert!(ok.validate().is_ok());
        assert!(RetryPolicy::Forever.validate().is_ok());
    }

    #[test]
    fn cancel_stops_retries_and_callbacks() {
        let face = echo_face();
        face.drop_next_requests(1);
        let stats = RetryStats::new();
        let request = Request::new(name("/svc/x")).with_lifetime(Duration::from_millis(20));
        let (outcome, token) = run(&face, request, RetryPolicy::Forever, stats);
        token.cancel();
        pump(&face, 10);
        let outcome = outcome.lock();
        assert_eq!(outcome.successes, 0);
        assert!(outcome.failures.is_empty());
        assert_eq!(face.sent_requests(), 1);
    }
}
