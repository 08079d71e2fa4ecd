//! Message framing for agent byte streams.
//!
//! Every application message travels as a 4-byte big-endian length prefix
//! followed by the payload. [`MessageFramer::extract`] pulls at most one
//! complete message off the front of a growing receive buffer; a partial
//! frame leaves the buffer exactly as it was, so bytes can be appended in
//! any fragmentation and the same message sequence comes out.
//!
//! The synchronization token is an ordinary message with the distinguished
//! payload [`SYNC_TOKEN`].

use crate::error::FramingError;

/// Payload that means "nothing more from me this cycle".
pub const SYNC_TOKEN: &[u8] = b"(syn)";

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload accepted by default (10 MB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 10_000_000;

/// Returns true if `message` is the synchronization token.
pub fn is_sync_token(message: &[u8]) -> bool {
    message == SYNC_TOKEN
}

/// Boundary contract between a raw byte stream and discrete messages.
pub trait MessageFramer: Send + Sync + 'static {
    /// Produces the self-delimiting wire form of `message`.
    ///
    /// Fails for messages the receiving side's `extract` would reject, so
    /// every frame that leaves the process can be decoded again.
    fn encode(&self, message: &[u8]) -> Result<Vec<u8>, FramingError>;

    /// Removes and returns one complete message from the front of `buffer`.
    ///
    /// Returns `Ok(None)` without touching the buffer when no complete
    /// message is present. Never blocks.
    fn extract(&self, buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FramingError>;
}

/// Length-prefixed framing with an upper bound on the frame size.
///
/// The bound is what turns a corrupt prefix into a [`FramingError`] instead
/// of an endless wait for gigabytes that will never arrive.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixFramer {
    max_frame_len: usize,
}

impl LengthPrefixFramer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Limits accepted payloads to `max_frame_len` bytes, capped at what a
    /// 4-byte prefix can express.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for LengthPrefixFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer for LengthPrefixFramer {
    fn encode(&self, message: &[u8]) -> Result<Vec<u8>, FramingError> {
        if message.len() > self.max_frame_len {
            return Err(FramingError::Oversized {
                length: message.len(),
                limit: self.max_frame_len,
            });
        }
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + message.len());
        frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
        frame.extend_from_slice(message);
        Ok(frame)
    }

    fn extract(&self, buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FramingError> {
        if buffer.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if length > self.max_frame_len {
            return Err(FramingError::Oversized {
                length,
                limit: self.max_frame_len,
            });
        }

        let frame_end = LENGTH_PREFIX_LEN + length;
        if buffer.len() < frame_end {
            return Ok(None);
        }

        let message = buffer[LENGTH_PREFIX_LEN..frame_end].to_vec();
        buffer.drain(..frame_end);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_all(framer: &LengthPrefixFramer, buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        while let Some(message) = framer.extract(buffer).expect("valid framing") {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_encode_layout() {
        let framer = LengthPrefixFramer::new();
        let frame = framer.encode(b"(beam 1 2 3)").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 12]);
        assert_eq!(&frame[4..], b"(beam 1 2 3)");
    }

    #[test]
    fn test_extract_single_message() {
        let framer = LengthPrefixFramer::new();
        let mut buffer = framer.encode(b"(say hello)").unwrap();
        let message = framer.extract(&mut buffer).unwrap();
        assert_eq!(message.as_deref(), Some(&b"(say hello)"[..]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_message_is_a_frame() {
        let framer = LengthPrefixFramer::new();
        let mut buffer = framer.encode(b"").unwrap();
        assert_eq!(framer.extract(&mut buffer).unwrap(), Some(Vec::new()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_buffer_is_left_untouched() {
        let framer = LengthPrefixFramer::new();
        let frame = framer.encode(b"(he1 0.5)").unwrap();

        for cut in 0..frame.len() {
            let mut buffer = frame[..cut].to_vec();
            for _ in 0..3 {
                assert_eq!(framer.extract(&mut buffer).unwrap(), None);
                assert_eq!(buffer, frame[..cut]);
            }
        }
    }

    #[test]
    fn test_every_split_point_yields_same_sequence() {
        let framer = LengthPrefixFramer::new();
        let mut stream = framer.encode(b"(he1 0.5)").unwrap();
        stream.extend(framer.encode(SYNC_TOKEN).unwrap());

        for split in 0..=stream.len() {
            let mut buffer = Vec::new();
            let mut seen = Vec::new();

            buffer.extend_from_slice(&stream[..split]);
            seen.extend(extract_all(&framer, &mut buffer));
            buffer.extend_from_slice(&stream[split..]);
            seen.extend(extract_all(&framer, &mut buffer));

            assert_eq!(seen, vec![b"(he1 0.5)".to_vec(), SYNC_TOKEN.to_vec()], "split at {split}");
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time_feeding() {
        let framer = LengthPrefixFramer::new();
        let mut stream = Vec::new();
        for message in [&b"a"[..], b"", b"(lae3 -10)", SYNC_TOKEN] {
            stream.extend(framer.encode(message).unwrap());
        }

        let mut buffer = Vec::new();
        let mut seen = Vec::new();
        for byte in &stream {
            buffer.push(*byte);
            seen.extend(extract_all(&framer, &mut buffer));
        }

        assert_eq!(
            seen,
            vec![b"a".to_vec(), Vec::new(), b"(lae3 -10)".to_vec(), SYNC_TOKEN.to_vec()]
        );
    }

    #[test]
    fn test_oversized_prefix_is_an_error() {
        let framer = LengthPrefixFramer::with_max_frame_len(16);
        let mut buffer = vec![0xFF, 0xFF, 0xFF, 0xFF, b'x'];
        let err = framer.extract(&mut buffer).unwrap_err();
        assert_eq!(
            err,
            FramingError::Oversized {
                length: u32::MAX as usize,
                limit: 16
            }
        );
        // Nothing was consumed.
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_encode_rejects_what_extract_would_reject() {
        let framer = LengthPrefixFramer::with_max_frame_len(8);
        let at_limit = framer.encode(b"12345678").unwrap();
        let mut buffer = at_limit.clone();
        assert_eq!(framer.extract(&mut buffer).unwrap(), Some(b"12345678".to_vec()));

        assert_eq!(
            framer.encode(b"123456789").unwrap_err(),
            FramingError::Oversized { length: 9, limit: 8 }
        );
    }

    #[test]
    fn test_limit_is_capped_at_prefix_range() {
        let framer = LengthPrefixFramer::with_max_frame_len(usize::MAX);
        assert_eq!(framer.max_frame_len(), u32::MAX as usize);
    }

    #[test]
    fn test_sync_token_recognition() {
        assert!(is_sync_token(SYNC_TOKEN));
        assert!(!is_sync_token(b"(syn"));
        assert!(!is_sync_token(b"(sync)"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use proptest::sample::Index;

        fn feed(framer: &LengthPrefixFramer, pieces: &[&[u8]]) -> (Vec<Vec<u8>>, Vec<u8>) {
            let mut buffer = Vec::new();
            let mut seen = Vec::new();
            for piece in pieces {
                buffer.extend_from_slice(piece);
                seen.extend(extract_all(framer, &mut buffer));
            }
            (seen, buffer)
        }

        proptest! {
            #[test]
            fn encoded_message_extracts_unchanged(
                message in prop::collection::vec(any::<u8>(), 0..512),
            ) {
                let framer = LengthPrefixFramer::new();
                let mut buffer = framer.encode(&message).unwrap();
                prop_assert_eq!(framer.extract(&mut buffer).unwrap(), Some(message));
                prop_assert!(buffer.is_empty());
            }

            #[test]
            fn two_arbitrary_splits_yield_the_same_sequence(
                messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8),
                first in any::<Index>(),
                second in any::<Index>(),
            ) {
                let framer = LengthPrefixFramer::new();
                let mut stream = Vec::new();
                for message in &messages {
                    stream.extend(framer.encode(message).unwrap());
                }

                let mut cuts = [first.index(stream.len() + 1), second.index(stream.len() + 1)];
                cuts.sort_unstable();
                let (seen, rest) = feed(
                    &framer,
                    &[&stream[..cuts[0]], &stream[cuts[0]..cuts[1]], &stream[cuts[1]..]],
                );

                prop_assert_eq!(seen, messages);
                prop_assert!(rest.is_empty());
            }

            #[test]
            fn truncated_stream_keeps_the_partial_frame(
                messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..6),
                cut in any::<Index>(),
            ) {
                let framer = LengthPrefixFramer::new();
                let frames: Vec<Vec<u8>> = messages.iter().map(|m| framer.encode(m).unwrap()).collect();
                let stream: Vec<u8> = frames.concat();
                let cut = cut.index(stream.len());

                let (seen, rest) = feed(&framer, &[&stream[..cut]]);
                let whole: usize = frames
                    .iter()
                    .scan(0, |end, frame| {
                        *end += frame.len();
                        Some(*end)
                    })
                    .take_while(|end| *end <= cut)
                    .count();
                prop_assert_eq!(&seen[..], &messages[..whole]);
                let consumed: usize = frames[..whole].iter().map(Vec::len).sum();
                prop_assert_eq!(rest.len(), cut - consumed);
            }
        }
    }
}
