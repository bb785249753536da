//! Publisher announcements and discovery under the broadcast namespace.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{announcement_name, announcement_prefix, parse_announcement, parse_publisher, Action};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::face::{Face, RequestHandler};
use crate::name::Name;
use crate::packet::{Request, Response};

/// Entrance/exit announcements and publisher discovery for one topic.
///
/// Clones share the set of known publisher ids.
#[derive(Clone)]
pub struct AnnouncementService {
    face: Arc<dyn Face>,
    broadcast: Name,
    topic: Name,
    lifetime: Duration,
    known: Arc<Mutex<BTreeSet<u64>>>,
}

struct Observers<A, R, E> {
    on_added: A,
    on_removed: R,
    on_error: E,
}

impl AnnouncementService {
    pub fn new(face: Arc<dyn Face>, broadcast: Name, topic: Name, lifetime: Duration) -> Self {
        Self {
            face,
            broadcast,
            topic,
            lifetime,
            known: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn topic(&self) -> &Name {
        &self.topic
    }

    /// Publisher ids seen so far through discovery or announcements.
    pub fn known_publishers(&self) -> Vec<u64> {
        self.known.lock().iter().copied().collect()
    }

    pub fn announce_entrance(&self, publisher_id: u64) -> Result<()> {
        self.announce(publisher_id, Action::Entrance)
    }

    pub fn announce_exit(&self, publisher_id: u64) -> Result<()> {
        self.announce(publisher_id, Action::Exit)
    }

    fn announce(&self, publisher_id: u64, action: Action) -> Result<()> {
        let name = announcement_name(&self.broadcast, &self.topic, publisher_id, action);
        info!(topic = %self.topic, publisher_id, ?action, "announcing");
        // Nobody answers announcements; the request simply expires.
        self.face.send_request(
            Request::new(name).with_lifetime(self.lifetime),
            Box::new(|_| {}),
            Box::new(|| {}),
        )?;
        Ok(())
    }

    /// Report already-known publishers, then ask the topic once for more.
    ///
    /// Only the first publisher to answer is found by the request; the rest
    /// are learned from their announcements.
    pub fn discover_existing_announcements(
        &self,
        mut on_found: impl FnMut(u64) + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) -> Result<CancelToken> {
        for id in self.known_publishers() {
            on_found(id);
        }
        let token = CancelToken::new();
        let complete: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(on_complete))));

        let on_response = {
            let topic = self.topic.clone();
            let known = self.known.clone();
            let complete = complete.clone();
            let token = token.clone();
            Box::new(move |r: Response| {
                if token.is_cancelled() {
                    return;
                }
                match parse_publisher(&topic, &r.name) {
                    Ok(id) => {
                        let added = known.lock().insert(id);
                        if added {
                            debug!(%topic, publisher_id = id, "discovered publisher");
                            on_found(id);
                        }
                        if let Some(done) = complete.lock().take() {
                            done();
                        }
                    }
                    Err(e) => {
                        warn!(%topic, error = %e, "bad discovery answer");
                        on_error(e);
                    }
                }
            })
        };
        let on_timeout = {
            let token = token.clone();
            Box::new(move || {
                if token.is_cancelled() {
                    return;
                }
                if let Some(done) = complete.lock().take() {
                    done();
                }
            })
        };
        let request = Request::new(self.topic.clone()).with_lifetime(self.lifetime);
        let inner = self.face.send_request(request, on_response, on_timeout)?;
        token.link(inner);
        Ok(token)
    }

    /// Listen under `<broadcast>/<topic>` for entrances and exits.
    ///
    /// Each id is reported as added once until it exits.
    pub fn observe_new_announcements(
        &self,
        on_added: impl FnMut(u64) + Send + 'static,
        on_removed: impl FnMut(u64) + Send + 'static,
        on_error: impl FnMut(Error) + Send + 'static,
    ) -> Result<CancelToken> {
        let prefix = announcement_prefix(&self.broadcast, &self.topic);
        let token = CancelToken::new();
        let observers = Mutex::new(Observers {
            on_added,
            on_removed,
            on_error,
        });
        let handler: RequestHandler = {
            let prefix = prefix.clone();
            let known = self.known.clone();
            let token = token.clone();
            Arc::new(move |request: &Request| {
                if token.is_cancelled() {
                    return None;
                }
                let mut observers = observers.lock();
                match parse_announcement(&prefix, &request.name) {
                    Ok((id, Action::Entrance)) => {
                        let added = known.lock().insert(id);
                        if added {
                            info!(publisher_id = id, "publisher entered");
                            (observers.on_added)(id);
                        }
                    }
                    Ok((id, Action::Exit)) => {
                        let removed = known.lock().remove(&id);
                        if removed {
                            info!(publisher_id = id, "publisher left");
                            (observers.on_removed)(id);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed announcement");
                        (observers.on_error)(e);
                    }
                }
                None
            })
        };
        let registration = self
            .face
            .register_provider(prefix.clone(), handler)
            .map_err(|e| match e {
                Error::RegistrationFailure { .. } => e,
                other => Error::RegistrationFailure {
                    prefix: prefix.clone(),
                    reason: other.to_string(),
                },
            })?;
        token.link(registration);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::LocalFace;
    use crate::name::Component;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn service(face: &Arc<LocalFace>) -> AnnouncementService {
        let lifetime = Duration::from_millis(50);
        AnnouncementService::new(face.clone(), name("/bc"), name("/chat"), lifetime)
    }

    #[test]
    fn observer_sees_entrance_and_exit_once() {
        let face = Arc::new(LocalFace::new());
        let listener = service(&face);
        let events = Arc::new(Mutex::new(Vec::new()));
        let (a, r) = (events.clone(), events.clone());
        let _t = listener
            .observe_new_announcements(
                move |id| a.lock().push(format!("+{}", id)),
                move |id| r.lock().push(format!("-{}", id)),
                |_| {},
            )
            .unwrap();
        let speaker = service(&face);
        speaker.announce_entrance(4).unwrap();
        speaker.announce_entrance(4).unwrap();
        speaker.announce_exit(4).unwrap();
        face.pump().unwrap();
        assert_eq!(*events.lock(), vec!["+4".to_string(), "-4".to_string()]);
        assert!(listener.known_publishers().is_empty());
    }

    #[test]
    fn cancelled_observer_is_silent() {
        let face = Arc::new(LocalFace::new());
        let listener = service(&face);
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let token = listener
            .observe_new_announcements(move |_| *c.lock() += 1, |_| {}, |_| {})
            .unwrap();
        token.cancel();
        service(&face).announce_entrance(1).unwrap();
        face.pump().unwrap();
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn malformed_announcement_reports_error() {
        let face = Arc::new(LocalFace::new());
        let listener = service(&face);
        let errors = Arc::new(Mutex::new(0));
        let e = errors.clone();
        let _t = listener
            .observe_new_announcements(|_| {}, |_| {}, move |_| *e.lock() += 1)
            .unwrap();
        let bad = name("/bc/chat").append(Component::from("junk"));
        face.send_request(Request::new(bad), Box::new(|_| {}), Box::new(|| {}))
            .unwrap();
        face.pump().unwrap();
        assert_eq!(*errors.lock(), 1);
    }

    #[test]
    fn discovery_finds_answering_publisher_and_replays_known() {
        let face = Arc::new(LocalFace::new());
        let _reg = face
            .register_provider(
                name("/chat"),
                Arc::new(|req: &Request| {
                    (req.name == name("/chat"))
                        .then(|| Response::new(name("/chat").append_publisher_id(9), Vec::new()))
                }),
            )
            .unwrap();
        let svc = service(&face);
        let found = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Mutex::new(false));
        let (f, d) = (found.clone(), done.clone());
        let _t = svc
            .discover_existing_announcements(
                move |id| f.lock().push(id),
                move || *d.lock() = true,
                |_| {},
            )
            .unwrap();
        face.pump().unwrap();
        assert_eq!(*found.lock(), vec![9]);
        assert!(*done.lock());

        // A second discovery replays 9 first and does not report it twice.
        let again = Arc::new(Mutex::new(Vec::new()));
        let g = again.clone();
        let _t = svc
            .discover_existing_announcements(move |id| g.lock().push(id), || {}, |_| {})
            .unwrap();
        face.pump().unwrap();
        assert_eq!(*again.lock(), vec![9]);
    }

    #[test]
    fn discovery_without_publishers_completes_on_timeout() {
        let face = Arc::new(LocalFace::new());
        let done = Arc::new(Mutex::new(false));
        let d = done.clone();
        let _t = service(&face)
            .discover_existing_announcements(|_| {}, move || *d.lock() = true, |_| {})
            .unwrap();
        for _ in 0..5 {
            face.pump().unwrap();
        }
        assert!(*done.lock());
    }

    #[test]
    fn refused_registration_is_reported() {
        let face = Arc::new(LocalFace::new());
        face.refuse_registrations(true);
        let err = service(&face)
            .observe_new_announcements(|_| {}, |_| {}, |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::RegistrationFailure { .. }));
    }
}
