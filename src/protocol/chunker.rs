//! Outbound payload chunking.
//!
//! A BLE packet carries at most [`MAX_CHUNK_SIZE`] bytes of attribute data,
//! so a payload is split into consecutive segments before it is written.

use bytes::Bytes;

pub use crate::ble::uuids::MAX_CHUNK_SIZE;

/// Number of segments a payload of `len` bytes produces.
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    let max_chunk_size = max_chunk_size.max(1);
    (len + max_chunk_size - 1) / max_chunk_size
}

/// Split a payload into segments of at most `max_chunk_size` bytes.
///
/// Each segment is taken from the front of the unsent remainder, so the
/// segments concatenate back to `payload`. An empty payload yields no
/// segments. The segments share `payload`'s buffer.
///
/// # Example
///
/// ```
/// use ble_uart_bridge::protocol::{chunk_payload, MAX_CHUNK_SIZE};
/// use bytes::Bytes;
///
/// let chunks = chunk_payload(&Bytes::from(vec![7u8; 45]), MAX_CHUNK_SIZE);
/// let lengths: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
/// assert_eq!(lengths, vec![20, 20, 5]);
/// ```
pub fn chunk_payload(payload: &Bytes, max_chunk_size: usize) -> Vec<Bytes> {
    debug_assert!(max_chunk_size > 0, "chunk size must be non-zero");
    let max_chunk_size = max_chunk_size.max(1);

    let mut remaining = payload.clone();
    let mut chunks = Vec::with_capacity(chunk_count(remaining.len(), max_chunk_size));

    while !remaining.is_empty() {
        let take = remaining.len().min(max_chunk_size);
        chunks.push(remaining.split_to(take));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_empty_payload() {
        assert!(chunk_payload(&Bytes::new(), MAX_CHUNK_SIZE).is_empty());
        assert_eq!(chunk_count(0, MAX_CHUNK_SIZE), 0);
    }

    #[test]
    fn test_single_chunk() {
        let payload = Bytes::from_static(b"hello");
        assert_eq!(chunk_payload(&payload, MAX_CHUNK_SIZE), vec![payload.clone()]);

        let exact = Bytes::from(vec![1u8; MAX_CHUNK_SIZE]);
        assert_eq!(chunk_payload(&exact, MAX_CHUNK_SIZE).len(), 1);
    }

    #[test]
    fn test_boundaries_keep_every_byte() {
        let payload: Bytes = (0u8..45).collect::<Vec<_>>().into();
        let chunks = chunk_payload(&payload, MAX_CHUNK_SIZE);

        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..], &payload[0..20]);
        assert_eq!(&chunks[1][..], &payload[20..40]);
        assert_eq!(&chunks[2][..], &payload[40..45]);
    }

    #[test]
    fn test_one_past_boundary() {
        let payload = Bytes::from(vec![9u8; 21]);
        let lengths: Vec<usize> = chunk_payload(&payload, MAX_CHUNK_SIZE)
            .iter()
            .map(|c| c.len())
            .collect();
        assert_eq!(lengths, vec![20, 1]);
    }

    proptest! {
        #[test]
        fn prop_chunks_reconstruct_payload(data in proptest::collection::vec(any::<u8>(), 0..300)) {
            let payload = Bytes::from(data.clone());
            let chunks = chunk_payload(&payload, MAX_CHUNK_SIZE);

            prop_assert_eq!(chunks.len(), chunk_count(data.len(), MAX_CHUNK_SIZE));
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= MAX_CHUNK_SIZE));

            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            prop_assert_eq!(joined, data);
        }
    }
}
