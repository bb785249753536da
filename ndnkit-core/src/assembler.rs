//! Segment reassembly: buffer fragments, deliver them in order, detect the end.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::face::{pump_until, Face, PumpConfig};
use crate::name::Name;
use crate::packet::Response;
use crate::segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Collecting,
    Complete,
    Failed,
}

/// Everything a stream reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Next in-order fragment.
    Data(Response),
    /// The stream failed because a fragment request ran out of retries.
    Timeout(Name),
    Error(Error),
    Complete,
}

type DataHandler = Box<dyn FnMut(&Response) + Send>;
type TimeoutHandler = Box<dyn FnMut(&Name) + Send>;
type ErrorHandler = Box<dyn FnOnce(&Error) + Send>;
type CompleteHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Handlers {
    data: Vec<DataHandler>,
    timeout: Vec<TimeoutHandler>,
    error: Vec<ErrorHandler>,
    complete: Vec<CompleteHandler>,
}

impl Handlers {
    fn dispatch(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Data(r) => self.data.iter_mut().for_each(|h| h(r)),
            StreamEvent::Timeout(n) => self.timeout.iter_mut().for_each(|h| h(n)),
            StreamEvent::Error(e) => self.error.drain(..).for_each(|h| h(e)),
            StreamEvent::Complete => self.complete.drain(..).for_each(|h| h()),
        }
    }
}

#[derive(Debug)]
struct Stream {
    state: StreamState,
    /// Last contiguous id delivered; `None` before segment 0.
    current: Option<u64>,
    end: Option<u64>,
    buffer: BTreeMap<u64, Response>,
    error: Option<Error>,
}

impl Stream {
    fn receive(&mut self, response: Response) -> Vec<StreamEvent> {
        if self.state != StreamState::Collecting {
            return Vec::new();
        }
        let id = match segment::segment_id(&response.name) {
            Ok(Some(id)) => id,
            Ok(None) if self.buffer.is_empty() => {
                self.current = Some(0);
                self.end = Some(0);
                self.state = StreamState::Complete;
                self.buffer.insert(0, response.clone());
                return vec![StreamEvent::Data(response), StreamEvent::Complete];
            }
            Ok(None) | Err(_) => {
                return self.fail(Error::MalformedSegmentMarker {
                    name: response.name,
                })
            }
        };
        match response.final_segment_id() {
            Ok(Some(end)) => {
                if self.current.is_some_and(|c| end < c) {
                    return self.fail(Error::MalformedSegmentMarker {
                        name: response.name,
                    });
                }
                // Anything buffered past the end was never part of the stream.
                self.buffer.retain(|&id, _| id <= end);
                self.end = Some(end);
            }
            Ok(None) => {}
            Err(_) => {
                return self.fail(Error::MalformedSegmentMarker {
                    name: response.name,
                })
            }
        }
        let past_end = self.end.is_some_and(|end| id > end);
        let delivered = self.current.is_some_and(|c| id <= c);
        if past_end || delivered || self.buffer.contains_key(&id) {
            debug!(name = %response.name, id, "ignoring duplicate or out-of-range segment");
        } else {
            self.buffer.insert(id, response);
        }

        let mut events = Vec::new();
        let mut next = self.current.map_or(0, |c| c + 1);
        while let Some(r) = self.buffer.get(&next) {
            events.push(StreamEvent::Data(r.clone()));
            self.current = Some(next);
            next += 1;
        }
        if self.end.is_some() && self.current == self.end {
            self.state = StreamState::Complete;
            events.push(StreamEvent::Complete);
        }
        events
    }

    fn fail(&mut self, error: Error) -> Vec<StreamEvent> {
        if self.state != StreamState::Collecting {
            return Vec::new();
        }
        warn!(error = %error, "segment stream failed");
        let mut events = Vec::new();
        if let Error::RequestTimeout { name } = &error {
            events.push(StreamEvent::Timeout(name.clone()));
        }
        let error = error.into_stream_failure();
        self.state = StreamState::Failed;
        self.error = Some(error.clone());
        events.push(StreamEvent::Error(error));
        events
    }
}

/// Per-request reassembly state machine.
///
/// `Data` events fire strictly in increasing segment order whatever order
/// fragments arrive in. Error and completion observers fire at most once;
/// registering one after the stream settled fires it immediately.
///
/// Handlers run with the stream's handler lock held and must not register
/// further handlers or feed the same assembler.
pub struct SegmentAssembler {
    name: Name,
    handlers: Mutex<Handlers>,
    stream: Mutex<Stream>,
}

impl SegmentAssembler {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            handlers: Mutex::new(Handlers::default()),
            stream: Mutex::new(Stream {
                state: StreamState::Collecting,
                current: None,
                end: None,
                buffer: BTreeMap::new(),
                error: None,
            }),
        }
    }

    /// Name the stream was requested under.
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn on_data(&self, handler: impl FnMut(&Response) + Send + 'static) {
        self.handlers.lock().data.push(Box::new(handler));
    }

    pub fn on_timeout(&self, handler: impl FnMut(&Name) + Send + 'static) {
        self.handlers.lock().timeout.push(Box::new(handler));
    }

    pub fn on_error(&self, handler: impl FnOnce(&Error) + Send + 'static) {
        let mut handlers = self.handlers.lock();
        let stored = self.stream.lock().error.clone();
        match stored {
            Some(e) => {
                drop(handlers);
                handler(&e);
            }
            None => handlers.error.push(Box::new(handler)),
        }
    }

    pub fn on_complete(&self, handler: impl FnOnce() + Send + 'static) {
        let mut handlers = self.handlers.lock();
        if self.state() == StreamState::Complete {
            drop(handlers);
            handler();
        } else {
            handlers.complete.push(Box::new(handler));
        }
    }

    /// Feed one fragment response.
    pub fn receive(&self, response: Response) {
        let mut handlers = self.handlers.lock();
        let events = self.stream.lock().receive(response);
        for event in &events {
            handlers.dispatch(event);
        }
    }

    /// Fail the stream from outside, e.g. when a fragment ran out of retries.
    pub fn fail(&self, error: Error) {
        let mut handlers = self.handlers.lock();
        let events = self.stream.lock().fail(error);
        for event in &events {
            handlers.dispatch(event);
        }
    }

    pub fn state(&self) -> StreamState {
        self.stream.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state() != StreamState::Collecting
    }

    pub fn current(&self) -> Option<u64> {
        self.stream.lock().current
    }

    pub fn end(&self) -> Option<u64> {
        self.stream.lock().end
    }

    /// Whether segment `id` is buffered.
    pub fn has(&self, id: u64) -> bool {
        self.stream.lock().buffer.contains_key(&id)
    }

    pub fn error(&self) -> Option<Error> {
        self.stream.lock().error.clone()
    }

    /// Concatenate buffered fragments in segment order into one response
    /// named like the first fragment minus its segment component.
    pub fn assemble(&self) -> Result<Response> {
        let stream = self.stream.lock();
        if let Some(e) = &stream.error {
            return Err(e.clone());
        }
        let first = stream
            .buffer
            .values()
            .next()
            .ok_or_else(|| Error::DataNotFound {
                name: self.name.clone(),
            })?;
        let size: usize = stream.buffer.values().map(|r| r.content.len()).sum();
        let mut content = Vec::with_capacity(size);
        for r in stream.buffer.values() {
            content.extend_from_slice(&r.content);
        }
        let name = segment::strip_segment(&first.name);
        Ok(Response::new(name, content).with_freshness(first.freshness))
    }

    /// Pump `face` until the stream settles, then assemble.
    pub fn wait(&self, face: &dyn Face, pump: &PumpConfig) -> Result<Response> {
        pump_until(face, pump, || self.is_terminal())?;
        self.assemble()
    }
}

impl std::fmt::Debug for SegmentAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stream = self.stream.lock();
        f.debug_struct("SegmentAssembler")
            .field("name", &self.name)
            .field("state", &stream.state)
            .field("current", &stream.current)
            .field("end", &stream.end)
            .finish()
    }
}
