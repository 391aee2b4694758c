//! Datagram fragmentation over a small link MTU.
//!
//! A datagram is split into fragments of at most `mtu` bytes. The first
//! fragment starts with a two-byte big-endian header holding the total
//! datagram length. Continuation fragments carry payload only.
//!
//! ```text
//! first:        [len_hi][len_lo][payload ...]
//! continuation: [payload ...]
//! ```

use std::collections::HashMap;
use std::hash::Hash;

use bytes::{Bytes, BytesMut};

use crate::error::{ParseError, ParseResult};

/// Size of the length header carried by the first fragment.
pub const HEADER_LEN: usize = 2;

/// Largest datagram the header can describe.
pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// Default link MTU for GATT writes.
pub const DEFAULT_MTU: usize = 20;

/// Smallest MTU that still carries payload in the first fragment.
pub const MIN_MTU: usize = HEADER_LEN + 1;

/// Split `payload` into fragments of at most `mtu` bytes.
///
/// # Errors
///
/// Returns [`ParseError::InvalidValue`] if the payload is empty, longer
/// than [`MAX_DATAGRAM_LEN`], or the MTU is below [`MIN_MTU`].
pub fn fragment(payload: &[u8], mtu: usize) -> ParseResult<Vec<Bytes>> {
    if payload.is_empty() {
        return Err(ParseError::InvalidValue("empty datagram".to_string()));
    }
    if payload.len() > MAX_DATAGRAM_LEN {
        return Err(ParseError::InvalidValue(format!(
            "datagram of {} bytes exceeds {} byte limit",
            payload.len(),
            MAX_DATAGRAM_LEN
        )));
    }
    if mtu < MIN_MTU {
        return Err(ParseError::InvalidValue(format!(
            "mtu {} is below minimum {}",
            mtu, MIN_MTU
        )));
    }

    let first_len = payload.len().min(mtu - HEADER_LEN);
    let mut first = BytesMut::with_capacity(HEADER_LEN + first_len);
    first.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    first.extend_from_slice(&payload[..first_len]);

    let mut fragments = Vec::with_capacity(1 + (payload.len() - first_len).div_ceil(mtu));
    fragments.push(first.freeze());
    for chunk in payload[first_len..].chunks(mtu) {
        fragments.push(Bytes::copy_from_slice(chunk));
    }
    Ok(fragments)
}

/// Number of fragments [`fragment`] produces for a payload of `len` bytes.
#[must_use]
pub fn fragment_count(len: usize, mtu: usize) -> usize {
    if len == 0 || mtu < MIN_MTU {
        return 0;
    }
    let first = len.min(mtu - HEADER_LEN);
    1 + (len - first).div_ceil(mtu)
}

#[derive(Debug)]
struct Partial {
    total: usize,
    buf: BytesMut,
}

/// Rebuilds datagrams from fragments, one partial datagram per key.
///
/// Keys are typically `(address, role)` pairs so that the two directions
/// of a link never interleave.
#[derive(Debug)]
pub struct Reassembler<K> {
    partials: HashMap<K, Partial>,
}

impl<K: Hash + Eq> Default for Reassembler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq> Reassembler<K> {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self {
            partials: HashMap::new(),
        }
    }

    /// Feed one fragment received from `key`.
    ///
    /// Returns the datagram once the last fragment arrives.
    ///
    /// # Errors
    ///
    /// A first fragment that is too short or announces a zero length, and
    /// data beyond the announced total, are rejected. The partial datagram
    /// for `key` is discarded in both cases.
    pub fn push(&mut self, key: K, segment: &[u8]) -> ParseResult<Option<Bytes>> {
        if let Some(partial) = self.partials.get_mut(&key) {
            if partial.buf.len() + segment.len() > partial.total {
                let expected = partial.total;
                let actual = partial.buf.len() + segment.len();
                self.partials.remove(&key);
                return Err(ParseError::InvalidValue(format!(
                    "fragment overflows datagram: expected {} bytes, got {}",
                    expected, actual
                )));
            }
            partial.buf.extend_from_slice(segment);
            if partial.buf.len() == partial.total {
                return Ok(self.partials.remove(&key).map(|p| p.buf.freeze()));
            }
            return Ok(None);
        }

        if segment.len() < HEADER_LEN {
            return Err(ParseError::InsufficientBytes {
                expected: HEADER_LEN,
                actual: segment.len(),
            });
        }
        let total = usize::from(u16::from_be_bytes([segment[0], segment[1]]));
        if total == 0 {
            return Err(ParseError::InvalidValue(
                "datagram header announces zero length".to_string(),
            ));
        }
        let body = &segment[HEADER_LEN..];
        if body.len() > total {
            return Err(ParseError::InvalidValue(format!(
                "fragment overflows datagram: expected {} bytes, got {}",
                total,
                body.len()
            )));
        }
        if body.len() == total {
            return Ok(Some(Bytes::copy_from_slice(body)));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.extend_from_slice(body);
        self.partials.insert(key, Partial { total, buf });
        Ok(None)
    }

    /// Drop any partial datagram for `key`.
    pub fn discard(&mut self, key: &K) -> bool {
        self.partials.remove(key).is_some()
    }

    /// Drop every partial datagram.
    pub fn clear(&mut self) {
        self.partials.clear();
    }

    /// Number of keys with a datagram in progress.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_is_one_fragment() {
        let frags = fragment(b"hello", 20).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(&frags[0][..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_fragment_sizes_respect_mtu() {
        let payload: Vec<u8> = (0..50u8).collect();
        let frags = fragment(&payload, 20).unwrap();
        // 18 in the first, then 20 and 12
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].len(), 20);
        assert_eq!(frags[1].len(), 20);
        assert_eq!(frags[2].len(), 12);
        assert_eq!(fragment_count(payload.len(), 20), 3);
    }

    #[test]
    fn test_fragment_rejects_bad_input() {
        assert!(fragment(&[], 20).is_err());
        assert!(fragment(&[1, 2, 3], 2).is_err());
        let big = vec![0u8; MAX_DATAGRAM_LEN + 1];
        assert!(fragment(&big, 20).is_err());
    }

    #[test]
    fn test_reassemble_in_order() {
        let payload: Vec<u8> = (0..100u8).collect();
        let mut r = Reassembler::new();
        let mut out = None;
        for frag in fragment(&payload, 20).unwrap() {
            assert!(out.is_none());
            out = r.push(1u8, &frag).unwrap();
        }
        assert_eq!(out.unwrap().as_ref(), payload.as_slice());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_keys_do_not_interleave() {
        let a: Vec<u8> = vec![0xAA; 30];
        let b: Vec<u8> = vec![0xBB; 30];
        let fa = fragment(&a, 20).unwrap();
        let fb = fragment(&b, 20).unwrap();
        let mut r = Reassembler::new();

        assert!(r.push("a", &fa[0]).unwrap().is_none());
        assert!(r.push("b", &fb[0]).unwrap().is_none());
        assert_eq!(r.pending(), 2);
        assert_eq!(r.push("b", &fb[1]).unwrap().unwrap().as_ref(), b.as_slice());
        assert_eq!(r.push("a", &fa[1]).unwrap().unwrap().as_ref(), a.as_slice());
    }

    #[test]
    fn test_zero_length_header_is_dropped() {
        let mut r = Reassembler::new();
        assert!(r.push(0u8, &[0x00, 0x00, 0x01]).is_err());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_overflow_discards_partial() {
        let mut r = Reassembler::new();
        assert!(r.push(0u8, &[0x00, 0x04, 1, 2]).unwrap().is_none());
        assert!(r.push(0u8, &[3, 4, 5]).is_err());
        assert_eq!(r.pending(), 0);
        // the next fragment starts a fresh datagram
        assert_eq!(
            r.push(0u8, &[0x00, 0x01, 9]).unwrap().unwrap().as_ref(),
            &[9]
        );
    }

    #[test]
    fn test_discard() {
        let mut r = Reassembler::new();
        r.push(7u8, &[0x00, 0x10, 1]).unwrap();
        assert!(r.discard(&7));
        assert!(!r.discard(&7));
    }
}

/// Property-based tests for the fragment codec.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Feeding arbitrary bytes to the reassembler never panics.
        #[test]
        fn push_never_panics(segments in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..8)) {
            let mut r = Reassembler::new();
            for seg in &segments {
                let _ = r.push(0u8, seg);
            }
        }

        /// Fragmenting then reassembling yields the original datagram.
        #[test]
        fn fragments_reassemble(payload in proptest::collection::vec(any::<u8>(), 1..600), mtu in MIN_MTU..64usize) {
            let frags = fragment(&payload, mtu).unwrap();
            prop_assert_eq!(frags.len(), fragment_count(payload.len(), mtu));
            prop_assert!(frags.iter().all(|f| f.len() <= mtu));

            let mut r = Reassembler::new();
            let mut out = None;
            for f in &frags {
                out = r.push((), f).unwrap();
            }
            let out = out.unwrap();
            prop_assert_eq!(out.as_ref(), payload.as_slice());
        }
    }
}
