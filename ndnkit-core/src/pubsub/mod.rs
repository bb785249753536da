//! Publish/subscribe over plain request/response.
//!
//! Namespaces, all under a topic name:
//! - messages: `<topic>/<P:publisher>/<S:sequence>`
//! - announcements: `<broadcast>/<topic>/<P:publisher>/<A:action>`
//! - discovery: a request for exactly `<topic>`, answered by each open
//!   publisher with `<topic>/<P:publisher>`.

use crate::error::{Error, Result};
use crate::name::{Component, Name, ACTION_MARKER, PUBLISHER_ID_MARKER, SEQUENCE_MARKER};

mod announce;
mod publisher;
mod subscriber;

pub use announce::AnnouncementService;
pub use publisher::Publisher;
pub use subscriber::Subscriber;

/// Announcement action carried in the last name component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Entrance = 0,
    Exit = 1,
}

impl Action {
    fn from_number(n: u64) -> Option<Self> {
        match n {
            0 => Some(Action::Entrance),
            1 => Some(Action::Exit),
            _ => None,
        }
    }
}

/// One delivered pub/sub message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub publisher_id: u64,
    pub sequence: u64,
    pub content: Vec<u8>,
}

pub fn publisher_prefix(topic: &Name, publisher_id: u64) -> Name {
    topic.append_publisher_id(publisher_id)
}

pub fn message_name(topic: &Name, publisher_id: u64, sequence: u64) -> Name {
    publisher_prefix(topic, publisher_id).append_sequence(sequence)
}

/// `<broadcast>/<topic>`: where announcements for `topic` are heard.
pub fn announcement_prefix(broadcast: &Name, topic: &Name) -> Name {
    broadcast.join(topic)
}

pub fn announcement_name(
    broadcast: &Name,
    topic: &Name,
    publisher_id: u64,
    action: Action,
) -> Name {
    announcement_prefix(broadcast, topic)
        .append_publisher_id(publisher_id)
        .append(Component::action(action as u64))
}

fn malformed(name: &Name, reason: &str) -> Error {
    Error::MalformedName {
        name: name.clone(),
        reason: reason.to_string(),
    }
}

fn marked(name: &Name, index: usize, marker: u8, what: &str) -> Result<u64> {
    name.get(index)
        .ok_or_else(|| malformed(name, &format!("missing {}", what)))?
        .to_marked_number(marker)
        .map_err(|e| malformed(name, &format!("{}: {}", what, e)))
}

/// Publisher id and action from an announcement name under `prefix`.
pub fn parse_announcement(prefix: &Name, name: &Name) -> Result<(u64, Action)> {
    if !prefix.is_prefix_of(name) || name.len() != prefix.len() + 2 {
        return Err(malformed(name, "not an announcement"));
    }
    let id = marked(name, prefix.len(), PUBLISHER_ID_MARKER, "publisher id")?;
    let action = marked(name, prefix.len() + 1, ACTION_MARKER, "action")?;
    let action = Action::from_number(action).ok_or_else(|| malformed(name, "unknown action"))?;
    Ok((id, action))
}

/// Publisher id from a discovery answer `<topic>/<P:id>` (longer names allowed).
pub fn parse_publisher(topic: &Name, name: &Name) -> Result<u64> {
    if !topic.is_prefix_of(name) || name.len() <= topic.len() {
        return Err(malformed(name, "not under topic"));
    }
    marked(name, topic.len(), PUBLISHER_ID_MARKER, "publisher id")
}

/// Publisher id and sequence from a message name.
pub fn parse_message(topic: &Name, name: &Name) -> Result<(u64, u64)> {
    if name.len() != topic.len() + 2 {
        return Err(malformed(name, "not a message name"));
    }
    let id = parse_publisher(topic, name)?;
    let seq = marked(name, topic.len() + 1, SEQUENCE_MARKER, "sequence")?;
    Ok((id, seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn announcement_names_parse_back() {
        let broadcast = name("/ndn/broadcast/ps");
        let topic = name("/chat");
        let n = announcement_name(&broadcast, &topic, 77, Action::Exit);
        let prefix = announcement_prefix(&broadcast, &topic);
        assert_eq!(prefix, name("/ndn/broadcast/ps/chat"));
        assert_eq!(parse_announcement(&prefix, &n).unwrap(), (77, Action::Exit));
        assert!(parse_announcement(&prefix, &prefix.append("x")).is_err());
    }

    #[test]
    fn message_names_parse_back() {
        let topic = name("/chat");
        let n = message_name(&topic, 5, 0);
        assert_eq!(parse_message(&topic, &n).unwrap(), (5, 0));
        assert_eq!(parse_publisher(&topic, &n).unwrap(), 5);
        assert!(parse_message(&topic, &publisher_prefix(&topic, 5)).is_err());
        assert!(matches!(
            parse_message(&topic, &topic.append("a").append("b")),
            Err(Error::MalformedName { .. })
        ));
    }

    #[test]
    fn unknown_action_rejected() {
        let prefix = name("/b/t");
        let n = prefix.append_publisher_id(1).append(Component::action(9));
        assert!(parse_announcement(&prefix, &n).is_err());
    }
}
