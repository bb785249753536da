//! Segmentation: split content into segments, name them, read ids back.

use std::ops::Range;

use crate::name::{MarkerError, Name, SEGMENT_MARKER};
use crate::packet::Response;

/// Default segment payload size in bytes.
pub const DEFAULT_SEGMENT_SIZE: usize = 8 * 1024;

/// Split `total_len` bytes into consecutive ranges of at most `segment_size`.
/// A zero size falls back to [`DEFAULT_SEGMENT_SIZE`].
pub fn split_into_segments(total_len: usize, segment_size: usize) -> Vec<Range<usize>> {
    let size = if segment_size == 0 {
        DEFAULT_SEGMENT_SIZE
    } else {
        segment_size
    };
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(start..end);
        start = end;
    }
    out
}

/// Segment id carried by the last component of `name`.
///
/// `Ok(None)` when the last component is not segment-marked (or the name is
/// empty); `Err` when it is marked but the number does not decode.
pub fn segment_id(name: &Name) -> Result<Option<u64>, MarkerError> {
    match name.last() {
        Some(c) if c.is_marked(SEGMENT_MARKER) => c.to_marked_number(SEGMENT_MARKER).map(Some),
        _ => Ok(None),
    }
}

/// `name` without a trailing segment component.
pub fn strip_segment(name: &Name) -> Name {
    match name.last() {
        Some(c) if c.is_marked(SEGMENT_MARKER) => name.parent(),
        _ => name.clone(),
    }
}

/// Fragment `response` into segments `0..=k` that each carry `final_segment = k`.
///
/// Content that fits in one segment comes back unchanged: unsegmented
/// responses are answered as a single complete fragment by receivers.
pub fn segment_response(response: &Response, segment_size: usize) -> Vec<Response> {
    let ranges = split_into_segments(response.content.len(), segment_size);
    if ranges.len() <= 1 {
        return vec![response.clone()];
    }
    let last = (ranges.len() - 1) as u64;
    ranges
        .into_iter()
        .enumerate()
        .map(|(i, range)| {
            Response::new(
                response.name.append_segment(i as u64),
                response.content[range].to_vec(),
            )
            .with_freshness(response.freshness)
            .with_final_segment(last)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::Component;

    #[test]
    fn split_segments() {
        let segments = split_into_segments(100, 30);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], 0..30);
        assert_eq!(segments[3], 90..100);
    }

    #[test]
    fn split_exact_multiple() {
        let segments = split_into_segments(90, 30);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].end, 90);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_segments(0, 30).is_empty());
    }

    #[test]
    fn split_zero_size_uses_default() {
        let segments = split_into_segments(DEFAULT_SEGMENT_SIZE * 2, 0);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn segment_id_reads_last_component() {
        let base: Name = "/file".parse().unwrap();
        assert_eq!(segment_id(&base.append_segment(5)), Ok(Some(5)));
        assert_eq!(segment_id(&base), Ok(None));
        assert_eq!(segment_id(&Name::new()), Ok(None));
        let bad = base.append(Component::new(vec![0x00; 12]));
        assert!(segment_id(&bad).is_err());
        assert_eq!(strip_segment(&base.append_segment(5)), base);
        assert_eq!(strip_segment(&base), base);
    }

    #[test]
    fn segment_response_sets_final_marker() {
        let name: Name = "/file".parse().unwrap();
        let content: Vec<u8> = (0..100u8).collect();
        let segments = segment_response(&Response::new(name.clone(), content.clone()), 30);
        assert_eq!(segments.len(), 4);
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.name, name.append_segment(i as u64));
            assert_eq!(s.final_segment_id(), Ok(Some(3)));
        }
        let joined: Vec<u8> = segments.iter().flat_map(|s| s.content.clone()).collect();
        assert_eq!(joined, content);
    }

    #[test]
    fn small_response_is_not_segmented() {
        let r = Response::new("/a".parse().unwrap(), b"tiny".to_vec());
        assert_eq!(segment_response(&r, 30), vec![r]);
    }
}
