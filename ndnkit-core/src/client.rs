//! Segmented fetch: drives a [`SegmentAssembler`] by issuing fragment requests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::assembler::SegmentAssembler;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Result;
use crate::face::{Face, PumpConfig};
use crate::name::Name;
use crate::packet::{Request, Response};
use crate::retry::{send_with_retry, RetryPolicy, RetryStats};
use crate::segment;

/// Fetches possibly-segmented content through a face.
///
/// The first request goes out as given. Its response names the stream; after
/// that, segments are requested by id, one at a time until the final segment
/// is known and then up to `window` ahead of the last delivered one.
#[derive(Clone)]
pub struct SegmentedClient {
    face: Arc<dyn Face>,
    policy: RetryPolicy,
    window: u64,
    lifetime: Duration,
    pump: PumpConfig,
    stats: Arc<RetryStats>,
}

/// An in-progress fetch.
pub struct FetchHandle {
    assembler: Arc<SegmentAssembler>,
    cancel: CancelToken,
}

impl FetchHandle {
    pub fn assembler(&self) -> &Arc<SegmentAssembler> {
        &self.assembler
    }

    /// Stop issuing and retrying fragment requests.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

struct Fetch {
    face: Arc<dyn Face>,
    policy: RetryPolicy,
    window: u64,
    template: Request,
    stats: Arc<RetryStats>,
    assembler: Arc<SegmentAssembler>,
    cancel: CancelToken,
    base: Mutex<Option<Name>>,
    requested: Mutex<BTreeSet<u64>>,
}

impl SegmentedClient {
    pub fn new(face: Arc<dyn Face>) -> Self {
        Self::from_config(face, &Config::default())
    }

    pub fn from_config(face: Arc<dyn Face>, config: &Config) -> Self {
        Self {
            face,
            policy: config.retry.clone(),
            window: config.pipeline_window.max(1),
            lifetime: config.default_lifetime,
            pump: config.pump(),
            stats: RetryStats::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_window(mut self, window: u64) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_pump(mut self, pump: PumpConfig) -> Self {
        self.pump = pump;
        self
    }

    /// Count retries into `stats` instead of a counter owned by this client.
    pub fn with_stats(mut self, stats: Arc<RetryStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Retry counters shared by every fetch made through this client.
    pub fn stats(&self) -> &Arc<RetryStats> {
        &self.stats
    }

    /// A request for `name` with this client's default lifetime.
    pub fn request(&self, name: Name) -> Request {
        Request::new(name).with_lifetime(self.lifetime)
    }

    /// Start fetching `request`; completion is observed on the assembler.
    pub fn fetch(&self, request: Request) -> Result<FetchHandle> {
        let assembler = Arc::new(SegmentAssembler::new(request.name.clone()));
        let cancel = CancelToken::new();
        let fetch = Arc::new(Fetch {
            face: self.face.clone(),
            policy: self.policy.clone(),
            window: self.window,
            template: request.clone(),
            stats: self.stats.clone(),
            assembler: assembler.clone(),
            cancel: cancel.clone(),
            base: Mutex::new(None),
            requested: Mutex::new(BTreeSet::new()),
        });
        fetch.send(request)?;
        Ok(FetchHandle { assembler, cancel })
    }

    /// Fetch and block, pumping the face, until the stream settles.
    pub fn get(&self, request: Request) -> Result<Response> {
        let handle = self.fetch(request)?;
        let result = handle.assembler.wait(self.face.as_ref(), &self.pump);
        if result.is_err() {
            handle.cancel();
        }
        result
    }
}

impl Fetch {
    fn send(self: &Arc<Self>, request: Request) -> Result<()> {
        let on_response = {
            let f = self.clone();
            move |r: Response| f.on_response(r)
        };
        let on_failure = {
            let f = self.clone();
            move |e| f.assembler.fail(e)
        };
        let token = send_with_retry(
            self.face.clone(),
            request,
            self.policy.clone(),
            self.stats.clone(),
            on_response,
            on_failure,
        )?;
        self.cancel.link(token);
        Ok(())
    }

    fn on_response(self: &Arc<Self>, response: Response) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.base
            .lock()
            .get_or_insert_with(|| segment::strip_segment(&response.name));
        self.assembler.receive(response);
        self.request_more();
    }

    fn request_more(self: &Arc<Self>) {
        if self.assembler.is_terminal() || self.cancel.is_cancelled() {
            return;
        }
        let Some(base) = self.base.lock().clone() else {
            return;
        };
        let next = self.assembler.current().map_or(0, |c| c + 1);
        let last = match self.assembler.end() {
            Some(end) => end.min(next.saturating_add(self.window - 1)),
            None => next,
        };
        for id in next..=last {
            if self.assembler.has(id) || !self.requested.lock().insert(id) {
                continue;
            }
            let request = Request {
                name: base.append_segment(id),
                must_be_fresh: self.template.must_be_fresh,
                lifetime: self.template.lifetime,
                ..Request::new(Name::new())
            };
            debug!(name = %request.name, "requesting segment");
            if let Err(e) = self.send(request) {
                self.assembler.fail(e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NamedCache;
    use crate::error::Error;
    use crate::face::LocalFace;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn serve(
        face: &Arc<LocalFace>,
        prefix: Name,
        content: Vec<u8>,
        segment_size: usize,
    ) -> CancelToken {
        let mut cache = NamedCache::new();
        let whole = Response::new(prefix.clone(), content);
        for s in segment::segment_response(&whole, segment_size) {
            cache.put(s);
        }
        let cache = Arc::new(Mutex::new(cache));
        face.register_provider(
            prefix,
            Arc::new(move |req: &Request| {
                let cache = cache.lock();
                cache.get(req).or_else(|| {
                    // First request names the stream, answer with segment 0.
                    cache.get_name(&req.name.append_segment(0))
                })
            }),
        )
        .unwrap()
    }

    fn client(face: &Arc<LocalFace>) -> SegmentedClient {
        SegmentedClient::new(face.clone()).with_pump(PumpConfig {
            interval: None,
            max_iterations: Some(500),
        })
    }

    #[test]
    fn fetches_segmented_content() {
        let face = Arc::new(LocalFace::new());
        let content: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let _reg = serve(&face, name("/big"), content.clone(), 64);
        let got = client(&face).get(Request::new(name("/big"))).unwrap();
        assert_eq!(got.name, name("/big"));
        assert_eq!(got.content, content);
    }

    #[test]
    fn fetches_unsegmented_content() {
        let face = Arc::new(LocalFace::new());
        let _reg = serve(&face, name("/small"), b"tiny".to_vec(), 64);
        let got = client(&face).get(Request::new(name("/small"))).unwrap();
        assert_eq!(got.content, b"tiny");
        assert_eq!(face.sent_requests(), 1);
    }

    #[test]
    fn window_bounds_requests_in_flight() {
        let face = Arc::new(LocalFace::new());
        let content = vec![7u8; 100];
        let _reg = serve(&face, name("/w"), content.clone(), 10);
        let c = client(&face).with_window(2);
        let handle = c.fetch(Request::new(name("/w"))).unwrap();
        // Route the first request and deliver segment 0.
        face.pump().unwrap();
        assert_eq!(handle.assembler().current(), Some(0));
        assert_eq!(face.pending_requests(), 2);
        let got = handle.assembler().wait(face.as_ref(), &PumpConfig::default()).unwrap();
        assert_eq!(got.content, content);
        assert_eq!(face.sent_requests(), 10);
    }

    #[test]
    fn lost_segments_are_retried() {
        let face = Arc::new(LocalFace::new());
        let _reg = serve(&face, name("/r"), vec![1u8; 30], 10);
        let c = client(&face);
        let handle = c
            .fetch(Request::new(name("/r")).with_lifetime(Duration::from_millis(30)))
            .unwrap();
        // Segment 0 arrives; the request for segment 1 that follows is lost.
        face.drop_next_requests(1);
        face.pump().unwrap();
        let got = handle.assembler().wait(face.as_ref(), &PumpConfig::default()).unwrap();
        assert_eq!(got.content.len(), 30);
        assert_eq!(c.stats().total_retries(), 1);
    }

    #[test]
    fn missing_content_fails_stream_with_timeout() {
        let face = Arc::new(LocalFace::new());
        let c = client(&face).with_policy(RetryPolicy::Fixed { max_retries: 1 });
        let err = c
            .get(Request::new(name("/nothing")).with_lifetime(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::StreamFailure(_)));
        assert!(err.is_timeout());
        assert_eq!(face.sent_requests(), 2);
    }
}
