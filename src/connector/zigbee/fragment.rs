// connector/zigbee/fragment.rs - Fragmentation and Reassembly
//
//! Radio frames carry at most `mtu` bytes, so envelopes are split into
//! fragments, each prefixed with a 5-byte header:
//!
//! ```text
//! +------+------------+-------+-------+----------------+
//! | kind | message_id | index | count | body ...       |
//! |  u8  |  u16 (BE)  |  u8   |  u8   | <= mtu - 5     |
//! +------+------------+-------+-------+----------------+
//! ```
//!
//! The receiver collects fragments per `(source, message_id)` in any order
//! and ignores duplicates. A message is only ever delivered whole.

use crate::address::NodeId;
use crate::codec::FramingError;
use crate::error::SendError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Fragment header size in bytes
pub const HEADER_LEN: usize = 5;

/// Most fragments one message may be split into
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Completed message ids remembered per source to drop late duplicates
const COMPLETED_HISTORY: usize = 32;

/// Frame kinds on the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Fragment of an envelope
    Data = 0x00,
    /// Reply to a join, carrying the node name
    Announce = 0x05,
    /// Broadcast by a node entering the network, carrying its name
    Join = 0x06,
}

impl TryFrom<u8> for FrameKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Data),
            0x05 => Ok(FrameKind::Announce),
            0x06 => Ok(FrameKind::Join),
            other => Err(FramingError::Header(format!("unknown frame kind 0x{other:02X}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub kind: FrameKind,
    pub message_id: u16,
    pub index: u8,
    pub count: u8,
}

impl FragmentHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.message_id);
        buf.put_u8(self.index);
        buf.put_u8(self.count);
    }

    /// Split a radio frame into header and body
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), FramingError> {
        if frame.len() < HEADER_LEN {
            return Err(FramingError::Header(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }

        let header = FragmentHeader {
            kind: FrameKind::try_from(frame[0])?,
            message_id: u16::from_be_bytes([frame[1], frame[2]]),
            index: frame[3],
            count: frame[4],
        };
        if header.count == 0 || header.index >= header.count {
            return Err(FramingError::Header(format!(
                "fragment {} of {} is out of range",
                header.index, header.count
            )));
        }
        Ok((header, &frame[HEADER_LEN..]))
    }
}

/// Split a payload into radio frames of at most `mtu` bytes.
///
/// An empty payload still produces one frame.
pub fn fragment(
    kind: FrameKind,
    message_id: u16,
    payload: &[u8],
    mtu: usize,
) -> Result<Vec<Bytes>, SendError> {
    if mtu <= HEADER_LEN {
        return Err(SendError::fatal(format!("MTU {mtu} leaves no room for data")));
    }

    let chunk = mtu - HEADER_LEN;
    let count = payload.len().div_ceil(chunk).max(1);
    if count > MAX_FRAGMENTS {
        return Err(SendError::fatal(format!(
            "payload of {} bytes needs {count} fragments (max {MAX_FRAGMENTS})",
            payload.len()
        )));
    }

    let mut frames = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * chunk;
        let body = &payload[start.min(payload.len())..(start + chunk).min(payload.len())];

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        FragmentHeader {
            kind,
            message_id,
            index: index as u8,
            count: count as u8,
        }
        .encode(&mut buf);
        buf.put_slice(body);
        frames.push(buf.freeze());
    }
    Ok(frames)
}

/// Outcome of feeding one fragment to the [`Reassembler`]
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    /// The last missing fragment arrived
    Complete(Vec<u8>),
    /// Stored, more fragments outstanding
    Incomplete,
    /// Already had it
    Duplicate,
    /// Contradicts fragments already received
    Inconsistent,
}

/// A message dropped before all fragments arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub source: NodeId,
    pub message_id: u16,
    pub received: usize,
    pub expected: usize,
}

#[derive(Debug)]
struct Partial {
    parts: Vec<Option<Bytes>>,
    received: usize,
    started: Instant,
}

impl Partial {
    fn expired(&self, source: NodeId, message_id: u16) -> Expired {
        Expired {
            source,
            message_id,
            received: self.received,
            expected: self.parts.len(),
        }
    }
}

/// Per-source reorder buffers keyed by message id
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    max_pending_per_source: usize,
    pending: HashMap<NodeId, HashMap<u16, Partial>>,
    completed: HashMap<NodeId, VecDeque<u16>>,
    evicted: Vec<Expired>,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_pending_per_source: usize) -> Self {
        Self {
            timeout,
            max_pending_per_source: max_pending_per_source.max(1),
            pending: HashMap::new(),
            completed: HashMap::new(),
            evicted: Vec::new(),
        }
    }

    /// Feed one data fragment
    pub fn accept(
        &mut self,
        source: NodeId,
        header: FragmentHeader,
        body: &[u8],
        now: Instant,
    ) -> Accepted {
        if self
            .completed
            .get(&source)
            .is_some_and(|ids| ids.contains(&header.message_id))
        {
            return Accepted::Duplicate;
        }

        let count = header.count as usize;
        let index = header.index as usize;
        let buffers = self.pending.entry(source).or_default();

        if !buffers.contains_key(&header.message_id) && buffers.len() >= self.max_pending_per_source
        {
            let oldest = buffers
                .iter()
                .min_by_key(|(_, p)| p.started)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                if let Some(partial) = buffers.remove(&id) {
                    self.evicted.push(partial.expired(source, id));
                }
            }
        }

        let partial = buffers.entry(header.message_id).or_insert_with(|| Partial {
            parts: vec![None; count],
            received: 0,
            started: now,
        });

        if partial.parts.len() != count {
            return Accepted::Inconsistent;
        }
        if partial.parts[index].is_some() {
            return Accepted::Duplicate;
        }

        partial.parts[index] = Some(Bytes::copy_from_slice(body));
        partial.received += 1;
        if partial.received < count {
            return Accepted::Incomplete;
        }

        let Some(partial) = buffers.remove(&header.message_id) else {
            return Accepted::Incomplete;
        };
        if buffers.is_empty() {
            self.pending.remove(&source);
        }

        let history = self.completed.entry(source).or_default();
        history.push_back(header.message_id);
        if history.len() > COMPLETED_HISTORY {
            history.pop_front();
        }

        let mut message = Vec::with_capacity(partial.parts.iter().flatten().map(Bytes::len).sum());
        for part in partial.parts.into_iter().flatten() {
            message.extend_from_slice(&part);
        }
        Accepted::Complete(message)
    }

    /// Drop messages older than the timeout. Also returns messages evicted
    /// since the last call.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = std::mem::take(&mut self.evicted);
        let timeout = self.timeout;

        self.pending.retain(|source, buffers| {
            buffers.retain(|id, partial| {
                if now.saturating_duration_since(partial.started) >= timeout {
                    expired.push(partial.expired(*source, *id));
                    false
                } else {
                    true
                }
            });
            !buffers.is_empty()
        });
        expired
    }

    /// Messages currently waiting for fragments
    pub fn pending(&self) -> usize {
        self.pending.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn feed(r: &mut Reassembler, source: NodeId, frame: &[u8], now: Instant) -> Accepted {
        let (header, body) = FragmentHeader::decode(frame).unwrap();
        r.accept(source, header, body, now)
    }

    #[test]
    fn test_fragment_sizes() {
        let payload = vec![0xAB; 200];
        let frames = fragment(FrameKind::Data, 1, &payload, 84).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= 84));
        assert_eq!(&frames[0][..HEADER_LEN], &[0x00, 0x00, 0x01, 0x00, 0x03]);

        let empty = fragment(FrameKind::Join, 2, b"", 84).unwrap();
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].len(), HEADER_LEN);
    }

    #[test]
    fn test_too_many_fragments() {
        let payload = vec![0u8; 256 * 10];
        let err = fragment(FrameKind::Data, 1, &payload, 15).unwrap_err();
        assert!(!err.is_transient());
        assert!(fragment(FrameKind::Data, 1, &payload[..255 * 10], 15).is_ok());
    }

    #[test]
    fn test_header_validation() {
        assert!(FragmentHeader::decode(&[0, 0, 1]).is_err());
        assert!(FragmentHeader::decode(&[0x42, 0, 1, 0, 1]).is_err());
        assert!(FragmentHeader::decode(&[0, 0, 1, 3, 3]).is_err());
        assert!(FragmentHeader::decode(&[0, 0, 1, 0, 0]).is_err());
    }

    #[test]
    fn test_duplicates_ignored() {
        let now = Instant::now();
        let mut r = Reassembler::new(Duration::from_secs(5), 4);
        let frames = fragment(FrameKind::Data, 9, &[1u8; 150], 84).unwrap();

        assert_eq!(feed(&mut r, NodeId(1), &frames[0], now), Accepted::Incomplete);
        assert_eq!(feed(&mut r, NodeId(1), &frames[0], now), Accepted::Duplicate);
        assert!(matches!(
            feed(&mut r, NodeId(1), &frames[1], now),
            Accepted::Complete(ref m) if m.len() == 150
        ));
        // retransmission after completion
        assert_eq!(feed(&mut r, NodeId(1), &frames[1], now), Accepted::Duplicate);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_sources_kept_apart() {
        let now = Instant::now();
        let mut r = Reassembler::new(Duration::from_secs(5), 4);
        let a = fragment(FrameKind::Data, 1, b"from node a, long enough to need two", 24).unwrap();
        let b = fragment(FrameKind::Data, 1, b"from node b, long enough to need two", 24).unwrap();

        feed(&mut r, NodeId(0xA), &a[0], now);
        feed(&mut r, NodeId(0xB), &b[1], now);
        assert_eq!(r.pending(), 2);
        assert!(matches!(feed(&mut r, NodeId(0xA), &a[1], now), Accepted::Complete(_)));
        assert!(matches!(feed(&mut r, NodeId(0xB), &b[0], now), Accepted::Complete(_)));
    }

    #[test]
    fn test_timeout_expires_incomplete() {
        let start = Instant::now();
        let mut r = Reassembler::new(Duration::from_millis(100), 4);
        let frames = fragment(FrameKind::Data, 3, &[0u8; 200], 84).unwrap();
        feed(&mut r, NodeId(5), &frames[0], start);
        feed(&mut r, NodeId(5), &frames[2], start);

        assert!(r.expire(start + Duration::from_millis(50)).is_empty());
        let expired = r.expire(start + Duration::from_millis(100));
        assert_eq!(
            expired,
            vec![Expired {
                source: NodeId(5),
                message_id: 3,
                received: 2,
                expected: 3
            }]
        );
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_oldest_evicted_when_source_buffer_full() {
        let start = Instant::now();
        let mut r = Reassembler::new(Duration::from_secs(5), 2);
        for id in 0..3u16 {
            let frames = fragment(FrameKind::Data, id, &[0u8; 100], 84).unwrap();
            feed(&mut r, NodeId(1), &frames[0], start + Duration::from_millis(id as u64));
        }
        assert_eq!(r.pending(), 2);
        let expired = r.expire(start);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, 0);
    }

    proptest! {
        #[test]
        fn test_reassembly_any_order_with_duplicates(
            payload in proptest::collection::vec(any::<u8>(), 0..3000),
            seed in any::<u64>(),
            duplicates in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let frames = fragment(FrameKind::Data, 77, &payload, 84).unwrap();
            let mut order: Vec<usize> = (0..frames.len()).collect();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
            for d in duplicates {
                let at = d % order.len();
                let frame = order[(d / 7) % order.len()];
                order.insert(at, frame);
            }

            let now = Instant::now();
            let mut r = Reassembler::new(Duration::from_secs(60), 8);
            let mut delivered = Vec::new();
            for i in order {
                if let Accepted::Complete(message) = feed(&mut r, NodeId(7), &frames[i], now) {
                    delivered.push(message);
                }
            }

            prop_assert_eq!(delivered, vec![payload]);
            prop_assert_eq!(r.pending(), 0);
        }
    }
}
