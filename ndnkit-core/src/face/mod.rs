//! The transport collaborator: everything the core needs from the network.
//!
//! A face never invokes callbacks from inside `send_request`, `put` or
//! `register_provider`; completions are delivered from `pump()`, which the
//! host calls repeatedly.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::packet::{Request, Response};

mod local;
mod table;

pub use local::LocalFace;
pub use table::{Delivery, FaceTable};

pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;
/// Provider handler: answer now with `Some`, or return `None` and answer
/// later through [`Face::put`].
pub type RequestHandler = Arc<dyn Fn(&Request) -> Option<Response> + Send + Sync>;

pub trait Face: Send + Sync {
    /// Express `request`; exactly one of the callbacks fires unless the
    /// returned token is cancelled first.
    fn send_request(
        &self,
        request: Request,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> Result<CancelToken>;

    /// Receive requests under `prefix` until the token is cancelled.
    fn register_provider(&self, prefix: Name, on_request: RequestHandler) -> Result<CancelToken>;

    /// Hand a response to the transport. Satisfies any request it is holding
    /// for that name; unsolicited responses are dropped.
    fn put(&self, response: Response) -> Result<()>;

    /// Drive outstanding work: route requests, deliver responses, expire timeouts.
    fn pump(&self) -> Result<()>;
}

/// How blocking wrappers drive a face.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpConfig {
    /// Sleep between pumps; `None` spins.
    pub interval: Option<Duration>,
    /// Stop with [`Error::Stalled`] after this many pumps.
    pub max_iterations: Option<u64>,
}

/// Pump `face` until `done()` holds.
pub fn pump_until(
    face: &dyn Face,
    config: &PumpConfig,
    mut done: impl FnMut() -> bool,
) -> Result<()> {
    let mut iterations = 0u64;
    while !done() {
        if let Some(max) = config.max_iterations {
            if iterations >= max {
                return Err(Error::Stalled { iterations });
            }
        }
        face.pump()?;
        iterations += 1;
        if let Some(interval) = config.interval {
            std::thread::sleep(interval);
        }
    }
    Ok(())
}
