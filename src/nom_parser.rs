use nom::bytes::streaming::{tag, take};
use nom::combinator::verify;
use nom::number::streaming::u8;
use nom::Err::Incomplete;
use nom::IResult;

use crate::telegram::{Body, BODY_LEN, FRAME_LEN, SYNC};

type Buf = [u8];

/// Outcome of scanning the front of the receive buffer.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) enum FrameToken {
    /// A frame with a valid checksum.
    Frame(Body),
    /// A complete frame whose checksum doesn't match.
    ChecksumMismatch([u8; FRAME_LEN]),
    /// Bytes before the next sync marker.
    Noise,
    NeedData,
}

/// Scan for the next frame. Returns the number of bytes to consume along with the token.
///
/// A frame with a bad checksum consumes only its sync bytes, so that a valid
/// frame starting inside of it is still found.
pub(crate) fn parse_frame(buf: &Buf) -> (usize, FrameToken) {
    match find_sync(buf) {
        Some(0) => {}
        Some(pos) => return (pos, FrameToken::Noise),
        None => {
            // keep a trailing first sync byte, its partner may be on the way
            let keep = usize::from(buf.last() == Some(&SYNC[0]));
            let skip = buf.len() - keep;
            let token = if skip == 0 {
                FrameToken::NeedData
            } else {
                FrameToken::Noise
            };
            return (skip, token);
        }
    }
    match sync_frame(buf) {
        Ok((_rest, body)) => {
            let mut frame = [0u8; BODY_LEN];
            frame.copy_from_slice(body);
            (FRAME_LEN, FrameToken::Frame(frame))
        }
        Err(Incomplete(_)) => (0, FrameToken::NeedData),
        Err(_) => {
            let mut raw = [0u8; FRAME_LEN];
            raw.copy_from_slice(&buf[..FRAME_LEN]);
            (SYNC.len(), FrameToken::ChecksumMismatch(raw))
        }
    }
}

fn find_sync(buf: &Buf) -> Option<usize> {
    buf.windows(SYNC.len()).position(|w| w == &SYNC[..])
}

/// Sync, 11 checksummed bytes and a matching checksum.
fn sync_frame(buf: &Buf) -> IResult<&Buf, &Buf> {
    let (buf, _sync) = tag(&SYNC[..])(buf)?;
    let (buf, body) = take(BODY_LEN)(buf)?;
    let (buf, _) = verify(u8, |sum: &u8| crate::checksum(body) == *sum)(buf)?;
    Ok((buf, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::telegram::Telegram;

    use nom::Needed;

    macro_rules! incomplete {
        ($x: expr) => {
            Err(Incomplete(Needed::new($x)))
        };
    }

    fn frame(telegram: Telegram) -> Vec<u8> {
        let body = telegram.to_body();
        let mut frame = SYNC.to_vec();
        frame.extend_from_slice(&body);
        frame.push(crate::checksum(&body));
        frame
    }

    #[test]
    fn test_sync_frame() {
        let f = frame(Telegram::Poll(5));
        let empty: &[u8] = &[];
        assert_eq!(sync_frame(&f), Ok((empty, &f[2..13])));
        assert_eq!(sync_frame(&f[..13]), incomplete!(1));
        assert_eq!(sync_frame(&f[..2]), incomplete!(BODY_LEN));
        assert!(sync_frame(&f[1..]).is_err());
    }

    #[test]
    fn test_parse_frame() {
        let mut buf = Buffer::new();
        assert_eq!(parse_frame(buf.as_ref()), (0, FrameToken::NeedData));

        buf.write(&[0x00, 0x11]);
        assert_eq!(parse_frame(buf.as_ref()), (2, FrameToken::Noise));
        buf.consume(2);

        buf.write(&[0x00, 0xa5]);
        assert_eq!(parse_frame(buf.as_ref()), (1, FrameToken::Noise));
        buf.consume(1);
        assert_eq!(parse_frame(buf.as_ref()), (0, FrameToken::NeedData));

        let f = frame(Telegram::Poll(5));
        buf.write(&f[1..]);
        assert_eq!(
            parse_frame(buf.as_ref()),
            (FRAME_LEN, FrameToken::Frame(Telegram::Poll(5).to_body()))
        );
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut f = frame(Telegram::Poll(5));
        f[13] ^= 0x01;
        let mut raw = [0u8; FRAME_LEN];
        raw.copy_from_slice(&f);
        assert_eq!(
            parse_frame(&f),
            (2, FrameToken::ChecksumMismatch(raw))
        );
    }
}
