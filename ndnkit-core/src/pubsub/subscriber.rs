//! Subscriber side: finds publishers and follows each one's message stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{message_name, parse_message, publisher_prefix, AnnouncementService, Message};
use crate::cancel::CancelToken;
use crate::client::SegmentedClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::face::Face;
use crate::name::Name;
use crate::packet::{ChildSelector, Request, Response};
use crate::retry::{RetryPolicy, RetryStats};

type MessageHandler = Box<dyn FnMut(Message) + Send>;
type ErrorHandler = Box<dyn FnMut(Error) + Send>;

struct Handlers {
    on_message: MessageHandler,
    on_error: ErrorHandler,
}

#[derive(Default)]
struct SubscriberContext {
    last_consumed: Option<u64>,
    /// Answer to the "latest" request, delivered when catch-up reaches it.
    latest: Option<(u64, Response)>,
    in_flight: Option<CancelToken>,
    subscribed: bool,
    stopped: bool,
}

impl SubscriberContext {
    fn next_sequence(&self) -> u64 {
        self.last_consumed.map_or(0, |s| s + 1)
    }

    fn cancel_in_flight(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
    }
}

/// Follows every publisher on a topic, delivering each one's messages in
/// sequence order starting from the oldest the publisher still stores.
///
/// Each message is fetched as a segment stream, so messages of any size
/// arrive whole.
pub struct Subscriber {
    shared: Arc<Shared>,
}

struct Shared {
    topic: Name,
    announcer: AnnouncementService,
    lifetime: Duration,
    client: Mutex<SegmentedClient>,
    stats: Arc<RetryStats>,
    // Never held while calling handlers.
    contexts: Mutex<BTreeMap<u64, SubscriberContext>>,
    handlers: Mutex<Option<Handlers>>,
    listeners: Mutex<Vec<CancelToken>>,
    closed: AtomicBool,
}

enum Step {
    Deliver(Message),
    Request(u64),
}

impl Subscriber {
    pub fn new(face: Arc<dyn Face>, topic: Name, config: &Config) -> Result<Self> {
        config.validate()?;
        let announcer = AnnouncementService::new(
            face.clone(),
            config.broadcast_prefix()?,
            topic.clone(),
            config.default_lifetime,
        );
        let stats = RetryStats::new();
        let client = SegmentedClient::from_config(face, config)
            .with_policy(RetryPolicy::Forever)
            .with_stats(stats.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                topic,
                announcer,
                lifetime: config.default_lifetime,
                client: Mutex::new(client),
                stats,
                contexts: Mutex::new(BTreeMap::new()),
                handlers: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Policy for message requests. Defaults to re-issuing until cancelled,
    /// since a request for a message not yet published is a long poll.
    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        {
            let mut client = self.shared.client.lock();
            *client = client.clone().with_policy(policy);
        }
        self
    }

    pub fn topic(&self) -> &Name {
        &self.shared.topic
    }

    pub fn retry_stats(&self) -> &Arc<RetryStats> {
        &self.shared.stats
    }

    /// Start discovering and observing publishers. Opening twice is a no-op.
    pub fn open(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut listeners = shared.listeners.lock();
        if !listeners.is_empty() {
            return Ok(());
        }
        let weak = Arc::downgrade(shared);
        let (added, removed, observe_error) = (weak.clone(), weak.clone(), weak.clone());
        let observer = shared.announcer.observe_new_announcements(
            move |id| with_shared(&added, |s| s.add_publisher(id)),
            move |id| with_shared(&removed, |s| s.remove_publisher(id)),
            move |e| with_shared(&observe_error, |s| s.report(e)),
        )?;
        let found = weak.clone();
        let discovery = shared.announcer.discover_existing_announcements(
            move |id| with_shared(&found, |s| s.add_publisher(id)),
            || debug!("discovery finished"),
            move |e| with_shared(&weak, |s| s.report(e)),
        );
        let discovery = match discovery {
            Ok(token) => token,
            Err(e) => {
                observer.cancel();
                return Err(e);
            }
        };
        listeners.extend([observer, discovery]);
        info!(topic = %shared.topic, "subscriber open");
        Ok(())
    }

    /// Deliver messages from every known and future publisher.
    ///
    /// Handlers must not call back into this subscriber.
    pub fn subscribe(
        &self,
        on_message: impl FnMut(Message) + Send + 'static,
        on_error: impl FnMut(Error) + Send + 'static,
    ) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        *shared.handlers.lock() = Some(Handlers {
            on_message: Box::new(on_message),
            on_error: Box::new(on_error),
        });
        let ids: Vec<u64> = shared.contexts.lock().keys().copied().collect();
        for id in ids {
            shared.start(id);
        }
        Ok(())
    }

    pub fn known_publishers(&self) -> Vec<u64> {
        self.shared.contexts.lock().keys().copied().collect()
    }

    /// Cancel announcement listeners and every outstanding message request.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for token in shared.listeners.lock().drain(..) {
            token.cancel();
        }
        for ctx in shared.contexts.lock().values_mut() {
            ctx.cancel_in_flight();
            ctx.stopped = true;
        }
        shared.handlers.lock().take();
        info!(topic = %shared.topic, "subscriber closed");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

fn with_shared(weak: &Weak<Shared>, f: impl FnOnce(&Arc<Shared>)) {
    if let Some(shared) = weak.upgrade() {
        f(&shared);
    }
}

impl Shared {
    fn is_subscribed(&self) -> bool {
        self.handlers.lock().is_some()
    }

    fn add_publisher(self: &Arc<Self>, id: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let is_new = {
            let mut contexts = self.contexts.lock();
            let fresh = !contexts.contains_key(&id);
            contexts.entry(id).or_default();
            fresh
        };
        if is_new {
            debug!(topic = %self.topic, publisher_id = id, "tracking publisher");
        }
        if self.is_subscribed() {
            self.start(id);
        }
    }

    fn remove_publisher(&self, id: u64) {
        if let Some(mut ctx) = self.contexts.lock().remove(&id) {
            ctx.cancel_in_flight();
            debug!(topic = %self.topic, publisher_id = id, "publisher gone");
        }
    }

    /// Ask for the publisher's latest message, then catch up.
    fn start(self: &Arc<Self>, id: u64) {
        {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&id) else {
                return;
            };
            if ctx.subscribed || ctx.stopped {
                return;
            }
            ctx.subscribed = true;
        }
        let request = Request::new(publisher_prefix(&self.topic, id))
            .with_child_selector(ChildSelector::Rightmost)
            .with_lifetime(self.lifetime);
        self.issue(id, request, move |s, r| s.on_latest(id, r));
    }

    fn on_latest(self: &Arc<Self>, id: u64, response: Response) {
        if response.name == publisher_prefix(&self.topic, id) {
            // A discovery answer, not a message: ask again.
            if let Some(ctx) = self.contexts.lock().get_mut(&id) {
                ctx.in_flight = None;
                ctx.subscribed = false;
            }
            self.start(id);
            return;
        }
        let Some(sequence) = self.sequence_of(id, &response) else {
            return;
        };
        let find_oldest = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&id) else {
                return;
            };
            ctx.in_flight = None;
            ctx.latest = Some((sequence, response));
            ctx.last_consumed.is_none() && sequence > 0
        };
        debug!(topic = %self.topic, publisher_id = id, sequence, "latest message known");
        if find_oldest {
            // The publisher may have evicted its first messages.
            let request = Request::new(publisher_prefix(&self.topic, id))
                .with_child_selector(ChildSelector::Leftmost)
                .with_lifetime(self.lifetime);
            self.issue(id, request, move |s, r| s.on_oldest(id, r));
        } else {
            self.advance(id);
        }
    }

    fn on_oldest(self: &Arc<Self>, id: u64, response: Response) {
        let Some(sequence) = self.sequence_of(id, &response) else {
            return;
        };
        let message = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&id) else {
                return;
            };
            ctx.in_flight = None;
            if ctx.stopped || ctx.last_consumed.is_some() {
                None
            } else {
                if sequence > 0 {
                    debug!(
                        topic = %self.topic,
                        publisher_id = id,
                        sequence,
                        "earlier messages no longer stored"
                    );
                }
                ctx.last_consumed = Some(sequence);
                Some(Message {
                    publisher_id: id,
                    sequence,
                    content: response.content,
                })
            }
        };
        if let Some(message) = message {
            self.deliver(message);
        }
        self.advance(id);
    }

    fn on_message(self: &Arc<Self>, id: u64, sequence: u64, response: Response) {
        let message = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&id) else {
                return;
            };
            ctx.in_flight = None;
            if ctx.stopped || ctx.next_sequence() != sequence {
                return;
            }
            ctx.last_consumed = Some(sequence);
            Message {
                publisher_id: id,
                sequence,
                content: response.content,
            }
        };
        self.deliver(message);
        self.advance(id);
    }

    /// Sequence number of a message from publisher `id`. Anything else stops
    /// following that publisher.
    fn sequence_of(&self, id: u64, response: &Response) -> Option<u64> {
        match parse_message(&self.topic, &response.name) {
            Ok((publisher, sequence)) if publisher == id => Some(sequence),
            Ok(_) => {
                self.fail_publisher(
                    id,
                    Error::MalformedName {
                        name: response.name.clone(),
                        reason: "answer from another publisher".to_string(),
                    },
                );
                None
            }
            Err(e) => {
                self.fail_publisher(id, e);
                None
            }
        }
    }

    /// Deliver whatever is already known, then request the next sequence.
    fn advance(self: &Arc<Self>, id: u64) {
        loop {
            let step = {
                let mut contexts = self.contexts.lock();
                let Some(ctx) = contexts.get_mut(&id) else {
                    return;
                };
                if ctx.stopped || ctx.in_flight.is_some() {
                    return;
                }
                let next = ctx.next_sequence();
                match ctx.latest.take() {
                    Some((seq, response)) if seq == next => {
                        ctx.last_consumed = Some(seq);
                        Step::Deliver(Message {
                            publisher_id: id,
                            sequence: seq,
                            content: response.content,
                        })
                    }
                    Some((seq, response)) if seq > next => {
                        ctx.latest = Some((seq, response));
                        Step::Request(next)
                    }
                    _ => Step::Request(next),
                }
            };
            match step {
                Step::Deliver(message) => self.deliver(message),
                Step::Request(next) => {
                    let request = Request::new(message_name(&self.topic, id, next))
                        .with_lifetime(self.lifetime);
                    self.issue(id, request, move |s, r| s.on_message(id, next, r));
                    return;
                }
            }
        }
    }

    /// Fetch `request` for publisher `id` unless something is already in
    /// flight for it. The assembled response goes to `on_response`.
    fn issue(
        self: &Arc<Self>,
        id: u64,
        request: Request,
        on_response: impl FnOnce(&Arc<Shared>, Response) + Send + 'static,
    ) {
        let mut contexts = self.contexts.lock();
        let Some(ctx) = contexts.get_mut(&id) else {
            return;
        };
        if ctx.stopped || ctx.in_flight.is_some() {
            return;
        }
        match self.fetch(id, request, on_response) {
            Ok(token) => ctx.in_flight = Some(token),
            Err(e) => {
                drop(contexts);
                self.fail_publisher(id, e);
            }
        }
    }

    fn fetch(
        self: &Arc<Self>,
        id: u64,
        request: Request,
        on_response: impl FnOnce(&Arc<Shared>, Response) + Send + 'static,
    ) -> Result<CancelToken> {
        let client = self.client.lock().clone();
        let handle = client.fetch(request)?;
        let assembler = Arc::downgrade(handle.assembler());
        let (done, failed) = (Arc::downgrade(self), Arc::downgrade(self));
        handle.assembler().on_complete(move || {
            let Some(assembler) = assembler.upgrade() else {
                return;
            };
            match assembler.assemble() {
                Ok(response) => with_shared(&done, |s| on_response(s, response)),
                Err(e) => with_shared(&done, |s| s.fail_publisher(id, e)),
            }
        });
        handle
            .assembler()
            .on_error(move |e| with_shared(&failed, |s| s.fail_publisher(id, e.clone())));
        Ok(handle.cancel_token().clone())
    }

    fn deliver(&self, message: Message) {
        if let Some(handlers) = self.handlers.lock().as_mut() {
            (handlers.on_message)(message);
        }
    }

    /// Stop following `id` and surface `error` once.
    fn fail_publisher(&self, id: u64, error: Error) {
        {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&id) else {
                return;
            };
            if ctx.stopped {
                return;
            }
            ctx.stopped = true;
            ctx.cancel_in_flight();
        }
        warn!(
            topic = %self.topic,
            publisher_id = id,
            error = %error,
            "stopped following publisher"
        );
        self.report(error);
    }

    fn report(&self, error: Error) {
        if let Some(handlers) = self.handlers.lock().as_mut() {
            (handlers.on_error)(error);
        }
    }
}
