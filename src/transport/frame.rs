//! Self-synchronizing frame codec for the fluidic firmware link.
//!
//! Reference: consistent-overhead byte stuffing over a 0x00 delimiter.
//!
//! Encoding overview:
//! - The delimiter byte (0x00) never appears inside an encoded frame; it is
//!   reserved as the frame terminator.
//! - Payload bytes are emitted as length-prefixed runs: each run starts with
//!   a length byte equal to 1 + the number of non-delimiter bytes that
//!   follow, capped at 255 (i.e. at most 254 payload bytes per run).
//! - A length byte of 255 marks a run truncated at the cap; the decoder does
//!   not reinsert a delimiter after it. Every other run boundary stands in
//!   for one payload delimiter byte.
//! - A length byte of 0 terminates the frame.
//!
//! Decoding is driven by a caller-supplied exact-read function so the same
//! routine serves both live serial streams (with timeout semantics) and
//! in-memory buffers in tests. On a malformed frame (a delimiter where the
//! length byte promised payload), the decoder consumes bytes up to the next
//! delimiter before raising, leaving the stream at a frame boundary.

use crate::error::{FluidicError, Result};

/// Reserved frame boundary byte. Never appears inside an encoded frame.
pub const DELIMITER: u8 = 0x00;

/// Maximum number of payload bytes in one length-prefixed run.
pub const MAX_RUN: usize = 254;

/// Encode a payload into one self-delimited frame.
///
/// Any byte string is valid input, including empty and all-delimiter
/// payloads; the minimal frame is `[0x01, 0x00]`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / MAX_RUN + 2);
    out.push(0); // run length placeholder, patched below
    let mut run_idx = 0;
    let mut run_len: u8 = 1;

    for &b in payload {
        if b == DELIMITER {
            out[run_idx] = run_len;
            run_idx = out.len();
            out.push(0);
            run_len = 1;
        } else {
            out.push(b);
            run_len += 1;
            if run_len == 0xFF {
                // Run truncated at the cap: no delimiter is implied here.
                out[run_idx] = run_len;
                run_idx = out.len();
                out.push(0);
                run_len = 1;
            }
        }
    }

    out[run_idx] = run_len;
    out.push(DELIMITER);
    out
}

/// Decode one frame, pulling bytes through `read`.
///
/// `read(n)` must return exactly `n` bytes or fail (short reads are the
/// transport's timeout error). Leading delimiter bytes are skipped so the
/// decoder tolerates stale terminators left over from a resync.
pub fn decode_from<F>(mut read: F) -> Result<Vec<u8>>
where
    F: FnMut(usize) -> Result<Vec<u8>>,
{
    // Skip to the first nonzero length byte.
    let mut run_len = loop {
        let b = read(1)?[0];
        if b != DELIMITER {
            break b;
        }
    };

    let mut out = Vec::new();
    loop {
        let chunk = read(run_len as usize - 1)?;
        if chunk.contains(&DELIMITER) {
            // The length byte promised payload but a frame boundary showed
            // up early. Discard through the next delimiter so the caller
            // resumes at a frame boundary.
            while read(1)?[0] != DELIMITER {}
            return Err(FluidicError::FrameCorruption);
        }
        out.extend_from_slice(&chunk);

        let next = read(1)?[0];
        if next == DELIMITER {
            break;
        }
        if run_len != 0xFF {
            out.push(DELIMITER);
        }
        run_len = next;
    }

    Ok(out)
}

/// Decode one frame from an in-memory buffer.
///
/// Convenience wrapper over [`decode_from`]; trailing bytes after the frame
/// terminator are ignored.
pub fn decode_slice(buf: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    decode_from(|n| {
        if pos + n > buf.len() {
            return Err(FluidicError::Timeout);
        }
        let chunk = buf[pos..pos + n].to_vec();
        pos += n;
        Ok(chunk)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &[u8]) {
        let encoded = encode(payload);
        // The delimiter must only appear as the final terminator.
        assert_eq!(encoded.last(), Some(&DELIMITER));
        assert!(!encoded[..encoded.len() - 1].contains(&DELIMITER));
        assert_eq!(decode_slice(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_round_trip_simple() {
        round_trip(b"hello");
        round_trip(&[0x02, 0x41, 0x00, 0x42]);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let encoded = encode(&[]);
        assert_eq!(encoded, vec![0x01, 0x00]);
        round_trip(&[]);
    }

    #[test]
    fn test_round_trip_all_delimiters() {
        round_trip(&[0x00]);
        round_trip(&[0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_long_run_splits_and_recombines() {
        // 300 zero-free bytes must encode as two or more runs.
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 255) as u8 + 1).collect();
        let encoded = encode(&payload);
        assert_eq!(encoded[0], 0xFF);
        let second_run_len = encoded[1 + MAX_RUN];
        assert_eq!(second_run_len as usize, payload.len() - MAX_RUN + 1);
        round_trip(&payload);
    }

    #[test]
    fn test_exact_cap_payload() {
        let payload = vec![0x55u8; MAX_RUN];
        round_trip(&payload);
        round_trip(&vec![0x55u8; MAX_RUN + 1]);
    }

    #[test]
    fn test_delimiter_at_payload_boundaries() {
        round_trip(&[0x00, 0x01, 0x02]);
        round_trip(&[0x01, 0x02, 0x00]);
        let mut long = vec![0x33u8; MAX_RUN];
        long.push(0x00);
        round_trip(&long);
    }

    #[test]
    fn test_corrupt_frame_resynchronizes() {
        // Length byte 0x04 promises three payload bytes, but a delimiter
        // arrives after two. The decoder must consume through the next
        // delimiter and report corruption.
        let stream = [0x04, 0x41, 0x42, 0x00, 0x43, 0x00, 0x02, 0x5A, 0x00];
        let mut pos = 0;
        let mut read = |n: usize| {
            let chunk = stream[pos..pos + n].to_vec();
            pos += n;
            Ok(chunk)
        };
        match decode_from(&mut read) {
            Err(FluidicError::FrameCorruption) => {}
            other => panic!("expected corruption error, got {:?}", other),
        }
        // The stream is now positioned at the next frame.
        assert_eq!(decode_from(&mut read).unwrap(), vec![0x5A]);
    }

    #[test]
    fn test_leading_delimiters_are_skipped() {
        let mut stream = vec![0x00, 0x00];
        stream.extend(encode(b"ok"));
        assert_eq!(decode_slice(&stream).unwrap(), b"ok");
    }

    #[test]
    fn test_truncated_frame_times_out() {
        let encoded = encode(b"hello");
        match decode_slice(&encoded[..3]) {
            Err(FluidicError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
