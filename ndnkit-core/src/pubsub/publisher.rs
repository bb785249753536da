//! Publisher side: stores messages and answers requests for them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use super::{message_name, publisher_prefix, AnnouncementService};
use crate::cache::NamedCache;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::face::{Face, RequestHandler};
use crate::name::Name;
use crate::packet::{ChildSelector, Request, Response};
use crate::pit::PendingRequestTable;
use crate::segment;

/// Publishes a numbered message stream under `<topic>/<P:id>`.
///
/// Messages wait in the publisher's cache until requested. A request that
/// arrives before its message is held in the pending table and answered the
/// moment `publish` produces it. Messages larger than the configured
/// segment size go out as segments `0..=k` of `<topic>/<P:id>/<S:seq>`,
/// and a request for the message itself is answered with segment 0.
pub struct Publisher {
    shared: Arc<Shared>,
}

struct Shared {
    face: Arc<dyn Face>,
    topic: Name,
    id: u64,
    prefix: Name,
    max_segment_size: usize,
    next_sequence: AtomicU64,
    // Lock order: pit before cache.
    cache: Mutex<NamedCache>,
    pit: Mutex<PendingRequestTable>,
    announcer: AnnouncementService,
    registration: Mutex<Option<CancelToken>>,
    closed: AtomicBool,
}

impl Publisher {
    /// Publisher with a random id.
    pub fn new(face: Arc<dyn Face>, topic: Name, config: &Config) -> Result<Self> {
        let id = rand::thread_rng().gen();
        Self::with_id(face, topic, id, config)
    }

    pub fn with_id(face: Arc<dyn Face>, topic: Name, id: u64, config: &Config) -> Result<Self> {
        config.validate()?;
        let announcer = AnnouncementService::new(
            face.clone(),
            config.broadcast_prefix()?,
            topic.clone(),
            config.default_lifetime,
        );
        Ok(Self {
            shared: Arc::new(Shared {
                face,
                prefix: publisher_prefix(&topic, id),
                max_segment_size: config.max_segment_size,
                topic,
                id,
                next_sequence: AtomicU64::new(0),
                cache: Mutex::new(NamedCache::with_capacity(config.cache_capacity)),
                pit: Mutex::new(PendingRequestTable::with_capacity(config.pit_capacity)),
                announcer,
                registration: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn publisher_id(&self) -> u64 {
        self.shared.id
    }

    pub fn topic(&self) -> &Name {
        &self.shared.topic
    }

    /// Sequence number the next `publish` will use.
    pub fn next_sequence(&self) -> u64 {
        self.shared.next_sequence.load(Ordering::SeqCst)
    }

    /// Start answering requests for the topic and announce entrance.
    pub fn open(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if shared.registration.lock().is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(shared);
        let handler: RequestHandler =
            Arc::new(move |request: &Request| weak.upgrade().and_then(|s| s.on_request(request)));
        let token = shared
            .face
            .register_provider(shared.topic.clone(), handler)
            .map_err(|e| match e {
                Error::RegistrationFailure { .. } => e,
                other => Error::RegistrationFailure {
                    prefix: shared.topic.clone(),
                    reason: other.to_string(),
                },
            })?;
        if let Err(e) = shared.announcer.announce_entrance(shared.id) {
            token.cancel();
            return Err(e);
        }
        *shared.registration.lock() = Some(token);
        info!(topic = %shared.topic, publisher_id = shared.id, "publisher open");
        Ok(())
    }

    /// Store `content` as the next message and answer anyone waiting for it.
    pub fn publish(&self, content: impl Into<Vec<u8>>) -> Result<u64> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let sequence = shared.next_sequence.fetch_add(1, Ordering::SeqCst);
        let name = message_name(&shared.topic, shared.id, sequence);
        let response = Response::new(name.clone(), content);
        // Everything waiting on this name wants its first segment.
        let first = segment::segment_response(&response, shared.max_segment_size)
            .into_iter()
            .next();
        let waiting = {
            let mut pit = shared.pit.lock();
            shared.cache.lock().put(response);
            pit.extract(&name)
        };
        if !waiting.is_empty() {
            if let Some(first) = first {
                debug!(%name, waiting = waiting.len(), "answering pending requests");
                shared.face.put(first)?;
            }
        }
        Ok(sequence)
    }

    /// Stop answering, drop stored messages and announce exit.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let registration = shared.registration.lock().take();
        {
            let mut pit = shared.pit.lock();
            shared.cache.lock().clear();
            pit.clear();
        }
        if let Some(token) = registration {
            token.cancel();
            info!(topic = %shared.topic, publisher_id = shared.id, "publisher closed");
            shared.announcer.announce_exit(shared.id)?;
        }
        Ok(())
    }
}

impl Shared {
    fn on_request(&self, request: &Request) -> Option<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        if request.name == self.topic {
            return Some(Response::new(self.prefix.clone(), Vec::new()));
        }
        if !self.prefix.is_prefix_of(&request.name) {
            return None;
        }
        let mut pit = self.pit.lock();
        let cache = self.cache.lock();
        match self.answer(&cache, request) {
            Ok(answer) => answer,
            Err(_) => {
                debug!(name = %request.name, "holding request until published");
                pit.add(request.clone());
                None
            }
        }
    }

    /// The fragment of a stored message that `request` asks for.
    ///
    /// A segment-marked name selects that segment of the message; any other
    /// request resolves to a whole message and gets its segment 0.
    /// `DataNotFound` when no stored message matches.
    fn answer(&self, cache: &NamedCache, request: &Request) -> Result<Option<Response>> {
        let (lookup, wanted) = match segment::segment_id(&request.name) {
            Ok(Some(id)) => {
                let lookup = Request {
                    name: segment::strip_segment(&request.name),
                    child_selector: ChildSelector::None,
                    ..request.clone()
                };
                (lookup, id)
            }
            Ok(None) => (request.clone(), 0),
            Err(_) => return Ok(None),
        };
        let mut answer = None;
        cache.push(&lookup, self.max_segment_size, |fragment| {
            let id = segment::segment_id(&fragment.name).ok().flatten().unwrap_or(0);
            if id == wanted && answer.is_none() {
                answer = Some(fragment);
            }
        })?;
        Ok(answer)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(token) = self.shared.registration.lock().take() {
            token.cancel();
        }
    }
}
