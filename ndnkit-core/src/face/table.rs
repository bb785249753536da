//! Provider and pending-request bookkeeping shared by face implementations.

use std::time::Duration;

use tracing::debug;

use super::{RequestHandler, ResponseCallback, TimeoutCallback};
use crate::cancel::CancelToken;
use crate::name::Name;
use crate::packet::{Request, Response};

/// A completion queued for delivery on the next pump.
pub struct Delivery {
    token: CancelToken,
    kind: DeliveryKind,
}

enum DeliveryKind {
    Response(ResponseCallback, Response),
    Timeout(TimeoutCallback),
}

impl Delivery {
    /// Invoke the callback unless its request was cancelled meanwhile.
    pub fn run(self) {
        if self.token.is_cancelled() {
            return;
        }
        match self.kind {
            DeliveryKind::Response(cb, response) => cb(response),
            DeliveryKind::Timeout(cb) => cb(),
        }
    }
}

struct Provider {
    prefix: Name,
    handler: RequestHandler,
    token: CancelToken,
}

struct Pending {
    request: Request,
    deadline: Duration,
    on_response: ResponseCallback,
    on_timeout: TimeoutCallback,
    token: CancelToken,
}

/// Registered providers, outstanding requests and ready completions.
///
/// Time is an offset from the face's own epoch; the table never reads a clock.
#[derive(Default)]
pub struct FaceTable {
    providers: Vec<Provider>,
    pending: Vec<Pending>,
    ready: Vec<Delivery>,
}

impl FaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, prefix: Name, handler: RequestHandler) -> CancelToken {
        let token = CancelToken::new();
        self.providers.push(Provider {
            prefix,
            handler,
            token: token.clone(),
        });
        token
    }

    /// Handlers whose prefix covers `name`. Drops cancelled registrations.
    pub fn providers_for(&mut self, name: &Name) -> Vec<RequestHandler> {
        self.providers.retain(|p| !p.token.is_cancelled());
        self.providers
            .iter()
            .filter(|p| p.prefix.is_prefix_of(name))
            .map(|p| p.handler.clone())
            .collect()
    }

    pub fn add_pending(
        &mut self,
        request: Request,
        now: Duration,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> CancelToken {
        let token = CancelToken::new();
        let deadline = now.saturating_add(request.lifetime);
        self.pending.push(Pending {
            request,
            deadline,
            on_response,
            on_timeout,
            token: token.clone(),
        });
        token
    }

    /// Queue `response` for every outstanding request it satisfies.
    /// Returns how many requests it satisfied.
    pub fn satisfy(&mut self, response: &Response) -> usize {
        let mut satisfied = 0;
        let mut kept = Vec::with_capacity(self.pending.len());
        for p in self.pending.drain(..) {
            if p.token.is_cancelled() {
                continue;
            }
            if p.request.accepts(&response.name) {
                satisfied += 1;
                self.ready.push(Delivery {
                    token: p.token,
                    kind: DeliveryKind::Response(p.on_response, response.clone()),
                });
            } else {
                kept.push(p);
            }
        }
        self.pending = kept;
        satisfied
    }

    /// Move requests whose deadline passed into the ready queue as timeouts.
    pub fn expire(&mut self, now: Duration) {
        let mut kept = Vec::with_capacity(self.pending.len());
        for p in self.pending.drain(..) {
            if p.token.is_cancelled() {
                continue;
            }
            if p.deadline <= now {
                debug!(name = %p.request.name, "request expired");
                self.ready.push(Delivery {
                    token: p.token,
                    kind: DeliveryKind::Timeout(p.on_timeout),
                });
            } else {
                kept.push(p);
            }
        }
        self.pending = kept;
    }

    pub fn take_ready(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.ready)
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| !p.token.is_cancelled())
            .count()
    }
}
