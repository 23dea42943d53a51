//! Framing of telegrams on the wire.
//!
//! [`parse`] and [`serialize`] convert single frames, [`Decoder`] splits a byte
//! stream into frames and resynchronizes after garbage or corrupted frames.
//!
//! ## Example
//! ```
//! use eltako_bus::codec::{self, Decoded, Decoder};
//! use eltako_bus::Telegram;
//!
//! let frame = codec::serialize(&Telegram::Poll(5));
//! assert_eq!(codec::parse(&frame), Ok(Telegram::Poll(5)));
//!
//! let mut decoder = Decoder::new();
//! decoder.feed(&[0x00, 0x42]); // noise
//! decoder.feed(&frame);
//! assert_eq!(decoder.next(), Some(Decoded::Telegram(Telegram::Poll(5))));
//! assert_eq!(decoder.next(), None);
//! ```

use core::fmt;

use log::trace;
use snafu::Snafu;

use crate::buffer::Buffer;
use crate::nom_parser::{parse_frame, FrameToken};
use crate::telegram::{Body, Telegram, BODY_LEN, FRAME_LEN, SYNC};
use crate::Hex;

/// Why a frame was rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    /// The frame doesn't start with `A5 5A`.
    Sync,
    /// The frame isn't 14 bytes long, or its header announces another length.
    Length,
    /// The checksum doesn't match the frame content.
    Checksum,
    /// The header names an unknown telegram class.
    Header,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync => "missing sync",
            Self::Length => "invalid length",
            Self::Checksum => "checksum mismatch",
            Self::Header => "unknown header",
        })
    }
}

/// A frame that failed validation, with the bytes it was read from.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Malformed frame ({}): {}", reason, Hex(raw)))]
pub struct MalformedFrame {
    pub reason: MalformedReason,
    pub raw: Vec<u8>,
}

fn malformed(reason: MalformedReason, raw: &[u8]) -> MalformedFrame {
    MalformedFrameSnafu { reason, raw }.build()
}

/// Parse exactly one frame.
pub fn parse(bytes: &[u8]) -> Result<Telegram, MalformedFrame> {
    if bytes.len() < SYNC.len() || bytes[..SYNC.len()] != SYNC {
        return Err(malformed(MalformedReason::Sync, bytes));
    }
    if bytes.len() != FRAME_LEN {
        return Err(malformed(MalformedReason::Length, bytes));
    }
    let mut body: Body = [0; BODY_LEN];
    body.copy_from_slice(&bytes[SYNC.len()..FRAME_LEN - 1]);
    if crate::checksum(&body) != bytes[FRAME_LEN - 1] {
        return Err(malformed(MalformedReason::Checksum, bytes));
    }
    Telegram::from_body(&body).map_err(|reason| malformed(reason, bytes))
}

/// Serialize a telegram into a frame, computing its checksum.
pub fn serialize(telegram: &Telegram) -> [u8; FRAME_LEN] {
    let body = telegram.to_body();
    let mut frame = [0u8; FRAME_LEN];
    frame[..SYNC.len()].copy_from_slice(&SYNC);
    frame[SYNC.len()..FRAME_LEN - 1].copy_from_slice(&body);
    frame[FRAME_LEN - 1] = crate::checksum(&body);
    frame
}

/// Item produced by the [`Decoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Telegram(Telegram),
    Malformed(MalformedFrame),
}

/// Streaming decoder for the receive direction.
///
/// Feed it bytes as they arrive and iterate to take out complete telegrams.
/// Bytes outside of frames are skipped silently, a corrupted frame is reported
/// once as [`Decoded::Malformed`] and decoding resumes at the next sync marker.
/// Sync markers inside the span of a reported frame only yield a telegram if a
/// valid frame starts there.
#[derive(Debug)]
pub struct Decoder {
    buffer: Buffer,
    /// Bytes left of the last frame reported as malformed.
    shadow: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: Buffer::new(),
            shadow: 0,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Forget buffered bytes, e.g. after the link was reopened.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.shadow = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Decoder {
    type Item = Decoded;

    fn next(&mut self) -> Option<Decoded> {
        loop {
            let (consumed, token) = parse_frame(self.buffer.as_ref());
            self.buffer.consume(consumed);
            let in_shadow = self.shadow > 0;
            self.shadow = self.shadow.saturating_sub(consumed);
            match token {
                FrameToken::NeedData => return None,
                FrameToken::Noise => trace!("Skipped {} bytes outside of a frame", consumed),
                FrameToken::ChecksumMismatch(_) if in_shadow => {
                    trace!("Skipped sync marker inside a malformed frame")
                }
                FrameToken::ChecksumMismatch(raw) => {
                    self.shadow = FRAME_LEN - consumed;
                    return Some(Decoded::Malformed(malformed(MalformedReason::Checksum, &raw)));
                }
                FrameToken::Frame(body) => {
                    self.shadow = 0;
                    return Some(match Telegram::from_body(&body) {
                        Ok(telegram) => Decoded::Telegram(telegram),
                        Err(reason) => {
                            let mut raw = SYNC.to_vec();
                            raw.extend_from_slice(&body);
                            raw.push(crate::checksum(&body));
                            Decoded::Malformed(MalformedFrame { reason, raw })
                        }
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{DiscoveryReply, RadioTelegram, DEVICE_FLAGS};
    use crate::types::RadioId;

    fn temperature() -> Telegram {
        let sender = RadioId::from_bytes([0xff, 0xdd, 0xcc, 0xbb]);
        Telegram::RadioReceived(RadioTelegram::four_bs(sender, [0, 0, 0x7f, 0x08], 0))
    }

    #[test]
    fn test_serialize() {
        let frame = serialize(&Telegram::Lock);
        assert_eq!(
            frame,
            [0xa5, 0x5a, 0xab, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xa9]
        );
    }

    #[test]
    fn test_round_trip() {
        for telegram in [
            temperature(),
            Telegram::Unlock,
            Telegram::DiscoveryReply(DiscoveryReply {
                address: 3,
                size: 1,
                memory_size: 0x40,
                flags: DEVICE_FLAGS,
                model: [0x04, 0x04, 0x10, 0x00],
            }),
            Telegram::MemoryResponse {
                row: 7,
                value: [0xff; 8],
            },
        ] {
            assert_eq!(parse(&serialize(&telegram)), Ok(telegram));
        }
    }

    #[test]
    fn test_every_single_byte_corruption_is_detected() {
        let frame = serialize(&temperature());
        for i in 0..FRAME_LEN {
            for flip in [0x01u8, 0x80, 0xff] {
                let mut corrupted = frame;
                corrupted[i] ^= flip;
                let err = parse(&corrupted).unwrap_err();
                let expected = if i < SYNC.len() {
                    MalformedReason::Sync
                } else {
                    MalformedReason::Checksum
                };
                assert_eq!(err.reason, expected, "byte {} flip {:02x}", i, flip);
                assert_eq!(err.raw, corrupted.to_vec());
            }
        }
    }

    #[test]
    fn test_parse_length() {
        let frame = serialize(&Telegram::Poll(1));
        assert_eq!(parse(&frame[..13]).unwrap_err().reason, MalformedReason::Length);
        assert_eq!(parse(&[0xa5]).unwrap_err().reason, MalformedReason::Sync);
    }

    #[test]
    fn test_decoder_resync() {
        let mut corrupted = serialize(&temperature());
        corrupted[8] ^= 0x10;
        let mut decoder = Decoder::new();
        decoder.feed(&[0x12, 0x34]);
        decoder.feed(&corrupted);
        decoder.feed(&[0x00, 0xa5]);
        decoder.feed(&serialize(&Telegram::Poll(7)));

        let items: Vec<_> = decoder.by_ref().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Decoded::Malformed(m) if m.reason == MalformedReason::Checksum));
        assert_eq!(items[1], Decoded::Telegram(Telegram::Poll(7)));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_sync_inside_corrupted_frame() {
        // the sender id contains the sync marker
        let sender = RadioId::from_bytes([0xa5, 0x5a, 0x01, 0x02]);
        let telegram = Telegram::RadioReceived(RadioTelegram::four_bs(sender, [0, 0, 0x7f, 0x08], 0));
        let frame = serialize(&telegram);
        let mut corrupted = frame;
        corrupted[13] ^= 0xff;

        let mut decoder = Decoder::new();
        decoder.feed(&corrupted);
        decoder.feed(&frame);
        let items: Vec<_> = decoder.by_ref().collect();
        assert_eq!(items.len(), 2, "{:?}", items);
        assert_eq!(
            items[0],
            Decoded::Malformed(MalformedFrame {
                reason: MalformedReason::Checksum,
                raw: corrupted.to_vec()
            })
        );
        assert_eq!(items[1], Decoded::Telegram(telegram));

        // two corrupted frames in a row are both reported
        decoder.feed(&corrupted);
        decoder.feed(&corrupted);
        decoder.feed(&serialize(&Telegram::Poll(3)));
        let malformed = decoder
            .by_ref()
            .filter(|item| matches!(item, Decoded::Malformed(_)))
            .count();
        assert_eq!(malformed, 2);
    }

    #[test]
    fn test_malformed_display() {
        let err = parse(&[0xa5, 0x00]).unwrap_err();
        assert_eq!(err.to_string(), "Malformed frame (missing sync): a5 00");
    }

    #[test]
    fn test_decoder_split_frames() {
        let frame = serialize(&temperature());
        let mut decoder = Decoder::new();
        for chunk in frame.chunks(3) {
            decoder.feed(chunk);
            if decoder.pending() < FRAME_LEN {
                assert_eq!(decoder.next(), None);
            }
        }
        assert_eq!(decoder.next(), Some(Decoded::Telegram(temperature())));
        assert_eq!(decoder.next(), None);
    }

    #[test]
    fn test_decoder_truncated_frame() {
        // a frame cut short by the start of the next one
        let first = serialize(&Telegram::Poll(1));
        let second = serialize(&Telegram::Poll(2));
        let mut decoder = Decoder::new();
        decoder.feed(&first[..6]);
        decoder.feed(&second);
        let items: Vec<_> = decoder.by_ref().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Decoded::Malformed(_)));
        assert_eq!(items[1], Decoded::Telegram(Telegram::Poll(2)));
    }

    #[test]
    fn test_decoder_unknown_header() {
        let mut body = Telegram::Poll(1).to_body();
        body[0] = (1 << 5) | 0x0b;
        let mut frame = SYNC.to_vec();
        frame.extend_from_slice(&body);
        frame.push(crate::checksum(&body));
        let mut decoder = Decoder::new();
        decoder.feed(&frame);
        assert_eq!(
            decoder.next(),
            Some(Decoded::Malformed(MalformedFrame {
                reason: MalformedReason::Header,
                raw: frame
            }))
        );
    }
}
