//! In-process face with a virtual clock.
//!
//! Every `pump()` advances the clock by one tick, routes queued requests to
//! providers, delivers satisfied responses and expires overdue requests.
//! Requests that no provider answers stay outstanding until a `put` or
//! their lifetime elapses, the way a forwarder holds pending requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{Face, FaceTable, RequestHandler, ResponseCallback, TimeoutCallback};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::packet::{Request, Response};

/// Default virtual time per pump.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

pub struct LocalFace {
    state: Mutex<LocalState>,
    tick: Duration,
    sent: AtomicU64,
}

#[derive(Default)]
struct LocalState {
    now: Duration,
    table: FaceTable,
    inbound: VecDeque<Request>,
    drop_next: usize,
    refuse_registrations: bool,
}

impl LocalFace {
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            tick,
            sent: AtomicU64::new(0),
        }
    }

    /// Lose the next `n` requests sent; they will time out.
    pub fn drop_next_requests(&self, n: usize) {
        self.state.lock().drop_next += n;
    }

    /// Make `register_provider` fail with `RegistrationFailure`.
    pub fn refuse_registrations(&self, refuse: bool) {
        self.state.lock().refuse_registrations = refuse;
    }

    /// Total requests sent through this face, lost ones included.
    pub fn sent_requests(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response or a timeout.
    pub fn pending_requests(&self) -> usize {
        self.state.lock().table.pending_len()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }
}

impl Default for LocalFace {
    fn default() -> Self {
        Self::new()
    }
}

impl Face for LocalFace {
    fn send_request(
        &self,
        request: Request,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> Result<CancelToken> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let now = state.now;
        let token = state
            .table
            .add_pending(request.clone(), now, on_response, on_timeout);
        if state.drop_next > 0 {
            state.drop_next -= 1;
            debug!(name = %request.name, "dropping request");
        } else {
            state.inbound.push_back(request);
        }
        Ok(token)
    }

    fn register_provider(&self, prefix: Name, on_request: RequestHandler) -> Result<CancelToken> {
        let mut state = self.state.lock();
        if state.refuse_registrations {
            return Err(Error::RegistrationFailure {
                prefix,
                reason: "refused by face".to_string(),
            });
        }
        Ok(state.table.add_provider(prefix, on_request))
    }

    fn put(&self, response: Response) -> Result<()> {
        let satisfied = self.state.lock().table.satisfy(&response);
        if satisfied == 0 {
            debug!(name = %response.name, "dropping unsolicited response");
        }
        Ok(())
    }

    fn pump(&self) -> Result<()> {
        let requests: Vec<Request> = {
            let mut state = self.state.lock();
            state.now = state.now.saturating_add(self.tick);
            state.inbound.drain(..).collect()
        };
        for request in requests {
            let handlers = self.state.lock().table.providers_for(&request.name);
            for handler in handlers {
                if let Some(response) = handler(&request) {
                    if request.accepts(&response.name) {
                        self.put(response)?;
                    } else {
                        debug!(
                            request = %request.name,
                            response = %response.name,
                            "provider answered with a non-matching name"
                        );
                    }
                }
            }
        }
        let ready = {
            let mut state = self.state.lock();
            let now = state.now;
            state.table.expire(now);
            state.table.take_ready()
        };
        for delivery in ready {
            delivery.run();
        }
        Ok(())
    }
}
