//! Datagram codec: one packet per datagram.
//!
//! A datagram is a magic byte, a format version, then the bincode body.
//! Anything else heard on a shared multicast group fails the header check
//! before the body is touched.

use bincode::Options;

use crate::packet::Packet;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

const MAGIC: u8 = b'N';
const VERSION: u8 = 1;
const HEADER_LEN: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet of {size} bytes does not fit in one datagram")]
    TooLarge { size: usize },
    #[error("not an ndnkit datagram")]
    Foreign,
    #[error("unsupported wire version {0}")]
    Version(u8),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().reject_trailing_bytes()
}

/// Encode `packet` as one datagram, header included.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, WireError> {
    let body = options().serialized_size(packet)?;
    let size = usize::try_from(body)
        .map(|b| b.saturating_add(HEADER_LEN))
        .unwrap_or(usize::MAX);
    if size > MAX_DATAGRAM {
        return Err(WireError::TooLarge { size });
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&[MAGIC, VERSION]);
    options().serialize_into(&mut out, packet)?;
    Ok(out)
}

/// Decode one received datagram. The whole datagram must be one packet.
pub fn decode_packet(datagram: &[u8]) -> Result<Packet, WireError> {
    match datagram {
        [MAGIC, VERSION, body @ ..] => {
            let limit = (MAX_DATAGRAM - HEADER_LEN) as u64;
            Ok(options().with_limit(limit).deserialize(body)?)
        }
        [MAGIC, version, ..] => Err(WireError::Version(*version)),
        _ => Err(WireError::Foreign),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::name::Name;
    use crate::packet::{ChildSelector, Freshness, Request, Response};
    use crate::segment::DEFAULT_SEGMENT_SIZE;

    fn topic() -> Name {
        "/chat/room".parse().unwrap()
    }

    #[test]
    fn latest_request_fits_one_datagram() {
        let packet = Packet::Request(
            Request::new(topic().append_publisher_id(42))
                .with_child_selector(ChildSelector::Rightmost)
                .with_lifetime(Duration::from_millis(1500)),
        );
        let datagram = encode_packet(&packet).unwrap();
        assert_eq!(&datagram[..HEADER_LEN], &[MAGIC, VERSION]);
        assert_eq!(decode_packet(&datagram).unwrap(), packet);
    }

    #[test]
    fn default_sized_segment_fits() {
        let packet = Packet::Response(
            Response::new(topic().append_segment(3), vec![0xab; DEFAULT_SEGMENT_SIZE])
                .with_freshness(Freshness::Period(Duration::from_secs(1)))
                .with_final_segment(9),
        );
        let datagram = encode_packet(&packet).unwrap();
        assert!(datagram.len() <= MAX_DATAGRAM);
        match decode_packet(&datagram).unwrap() {
            Packet::Response(r) => assert_eq!(r.final_segment_id(), Ok(Some(9))),
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn oversized_packet_rejected() {
        let packet = Packet::Response(Response::new(topic(), vec![0; MAX_DATAGRAM]));
        match encode_packet(&packet) {
            Err(WireError::TooLarge { size }) => assert!(size > MAX_DATAGRAM),
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn foreign_and_future_datagrams_rejected() {
        assert!(matches!(decode_packet(b""), Err(WireError::Foreign)));
        assert!(matches!(decode_packet(b"hello"), Err(WireError::Foreign)));
        assert!(matches!(
            decode_packet(&[MAGIC, VERSION + 1, 0]),
            Err(WireError::Version(2))
        ));
    }

    #[test]
    fn truncated_or_padded_body_rejected() {
        let datagram = encode_packet(&Packet::Request(Request::new(topic()))).unwrap();
        let truncated = &datagram[..datagram.len() - 1];
        assert!(matches!(decode_packet(truncated), Err(WireError::Codec(_))));
        let mut padded = datagram.clone();
        padded.push(0);
        assert!(matches!(decode_packet(&padded), Err(WireError::Codec(_))));
    }
}
