//! Wire codec for command and notification frames.
//!
//! Outbound frames are `[length][command][payload...]` with
//! `length = payload.len() + 1`. A frame longer than the link's write size
//! is cut into plain chunks of exactly that size; chunks carry no header of
//! their own.
//!
//! Inbound notifications share the `[length][type]` envelope:
//!
//! ```text
//! exec result : [len][EXEC][command][status][payload...]
//! fragment    : [len][command][total][index][data...]
//! single shot : [len][command][payload...]
//! ```
//!
//! Whether a data frame is a fragment depends on the request that is
//! waiting for it, so the codec only exposes the envelope and leaves the
//! fragment split to [`decode_fragment`].

use data_encoding::HEXUPPER;
use thiserror::Error;

use super::constants::{FRAGMENT_HEADER_LEN, FRAME_HEADER_LEN, MAX_PAYLOAD_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Write size must be at least 1 byte")]
    ZeroWriteLen,
    #[error("Fragment {actual} arrived, expected fragment {expected}")]
    FragmentGap { expected: u8, actual: u8 },
}

/// Encode a command into a single frame.
pub fn encode_command(command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push((payload.len() + 1) as u8);
    frame.push(command);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame into link-sized writes, preserving order.
pub fn chunk_frame(frame: &[u8], max_write: usize) -> Result<Vec<&[u8]>, FrameError> {
    if max_write == 0 {
        return Err(FrameError::ZeroWriteLen);
    }
    Ok(frame.chunks(max_write).collect())
}

/// Encode a command and split it into link-sized writes.
pub fn encode_chunks(
    command: u8,
    payload: &[u8],
    max_write: usize,
) -> Result<Vec<Vec<u8>>, FrameError> {
    let frame = encode_command(command, payload)?;
    Ok(chunk_frame(&frame, max_write)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect())
}

/// Decoded notification envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification<'a> {
    /// Completion report for `command`.
    ExecResult {
        command: u8,
        status: u8,
        payload: &'a [u8],
    },
    /// Data frame for `command`, possibly one fragment of a larger reply.
    Data { command: u8, payload: &'a [u8] },
}

impl<'a> Notification<'a> {
    /// Command code the notification answers.
    pub fn command(&self) -> u8 {
        match self {
            Notification::ExecResult { command, .. } | Notification::Data { command, .. } => {
                *command
            }
        }
    }

    pub fn payload(&self) -> &'a [u8] {
        match self {
            Notification::ExecResult { payload, .. } | Notification::Data { payload, .. } => {
                *payload
            }
        }
    }
}

/// Decode a notification envelope.
///
/// The length byte trims trailing padding when it is consistent with the
/// frame; otherwise the whole frame is taken.
pub fn decode_notification(bytes: &[u8], exec_marker: u8) -> Result<Notification<'_>, FrameError> {
    if bytes.is_empty() {
        return Err(FrameError::Empty);
    }
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort {
            expected: FRAME_HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let declared = bytes[0] as usize;
    let mut body = &bytes[1..];
    if declared >= 1 && declared < body.len() {
        body = &body[..declared];
    }

    let kind = body[0];
    if kind == exec_marker {
        if body.len() < 3 {
            return Err(FrameError::TooShort {
                expected: 4,
                actual: body.len() + 1,
            });
        }
        return Ok(Notification::ExecResult {
            command: body[1],
            status: body[2],
            payload: &body[3..],
        });
    }

    Ok(Notification::Data {
        command: kind,
        payload: &body[1..],
    })
}

/// One part of a fragmented response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub total: u8,
    pub index: u8,
    pub data: &'a [u8],
}

impl Fragment<'_> {
    /// Whether this fragment closes the response (`index >= total - 1`).
    pub fn is_terminal(&self) -> bool {
        u16::from(self.index) + 1 >= u16::from(self.total)
    }
}

/// Split a data payload into its fragment header and data.
pub fn decode_fragment(payload: &[u8]) -> Result<Fragment<'_>, FrameError> {
    if payload.len() < FRAGMENT_HEADER_LEN {
        return Err(FrameError::TooShort {
            expected: FRAGMENT_HEADER_LEN,
            actual: payload.len(),
        });
    }
    Ok(Fragment {
        total: payload[0],
        index: payload[1],
        data: &payload[FRAGMENT_HEADER_LEN..],
    })
}

// ============================================================================
// Device-side encoders (simulated peripherals)
// ============================================================================

/// Build an exec-result notification.
pub fn encode_exec_result(exec_marker: u8, command: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push((payload.len() + 3) as u8);
    frame.push(exec_marker);
    frame.push(command);
    frame.push(status);
    frame.extend_from_slice(payload);
    frame
}

/// Build one fragment notification.
pub fn encode_fragment(command: u8, total: u8, index: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + data.len());
    payload.push(total);
    payload.push(index);
    payload.extend_from_slice(data);
    encode_command(command, &payload)
}

/// Cut `data` into fragment notifications carrying at most `per_fragment`
/// data bytes each.
pub fn encode_fragments(
    command: u8,
    data: &[u8],
    per_fragment: usize,
) -> Result<Vec<Vec<u8>>, FrameError> {
    if per_fragment == 0 {
        return Err(FrameError::ZeroWriteLen);
    }
    let parts: Vec<&[u8]> = if data.is_empty() {
        vec![&[][..]]
    } else {
        data.chunks(per_fragment).collect()
    };
    if parts.len() > u8::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            len: data.len(),
            max: per_fragment * u8::MAX as usize,
        });
    }
    let total = parts.len() as u8;
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| encode_fragment(command, total, i as u8, part))
        .collect()
}

/// Upper-case hex rendering used in logs.
pub fn to_hex(bytes: &[u8]) -> String {
    HEXUPPER.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::MAX_WRITE_LEN;

    const EXEC: u8 = 0xFF;

    #[test]
    fn test_encode_command_layout() {
        let frame = encode_command(0x01, &[0xAA, 0xBB]).unwrap();
        assert_eq!(frame, vec![0x03, 0x01, 0xAA, 0xBB]);
    }

    #[test]
    fn test_empty_payload_frame() {
        assert_eq!(encode_command(0x2F, &[]).unwrap(), vec![0x01, 0x2F]);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_command(0x01, &payload),
            Err(FrameError::PayloadTooLarge { .. })
        ));
        assert!(encode_command(0x01, &payload[1..]).is_ok());
    }

    #[test]
    fn test_chunk_counts_and_concatenation() {
        for len in [0usize, 1, 17, 18, 19, 38, 39, 100, 254] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = encode_command(0x17, &payload).unwrap();
            let chunks = encode_chunks(0x17, &payload, MAX_WRITE_LEN).unwrap();

            assert_eq!(chunks.len(), (len + 2).div_ceil(MAX_WRITE_LEN), "len {len}");
            assert!(chunks.iter().all(|c| c.len() <= MAX_WRITE_LEN));
            assert!(
                chunks[..chunks.len() - 1]
                    .iter()
                    .all(|c| c.len() == MAX_WRITE_LEN)
            );
            assert_eq!(chunks.concat(), frame);
        }
    }

    #[test]
    fn test_zero_write_len_rejected() {
        assert_eq!(chunk_frame(&[1, 2], 0), Err(FrameError::ZeroWriteLen));
    }

    #[test]
    fn test_decode_exec_result() {
        let bytes = [0x04, EXEC, 0x02, 0x00, 0x7A];
        let n = decode_notification(&bytes, EXEC).unwrap();
        assert_eq!(
            n,
            Notification::ExecResult {
                command: 0x02,
                status: 0x00,
                payload: &[0x7A],
            }
        );
        assert_eq!(n.command(), 0x02);
    }

    #[test]
    fn test_decode_exec_result_too_short() {
        assert!(matches!(
            decode_notification(&[0x02, EXEC, 0x01], EXEC),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_data_frame_trims_padding() {
        let mut bytes = vec![0x03, 0x2F, 0x01, 0x02];
        bytes.resize(20, 0x00);
        let n = decode_notification(&bytes, EXEC).unwrap();
        assert_eq!(
            n,
            Notification::Data {
                command: 0x2F,
                payload: &[0x01, 0x02],
            }
        );
    }

    #[test]
    fn test_decode_inconsistent_length_takes_whole_frame() {
        let bytes = [0x09, 0x30, 0x01];
        let n = decode_notification(&bytes, EXEC).unwrap();
        assert_eq!(n.payload(), &[0x01]);
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode_notification(&[], EXEC), Err(FrameError::Empty));
        assert!(decode_notification(&[0x01], EXEC).is_err());
    }

    #[test]
    fn test_fragment_terminal_rule() {
        let mid = decode_fragment(&[3, 1, 0xAA]).unwrap();
        assert!(!mid.is_terminal());
        let last = decode_fragment(&[3, 2, 0xBB]).unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.data, &[0xBB]);

        // A lone fragment (or a bogus total of zero) closes immediately.
        assert!(decode_fragment(&[1, 0]).unwrap().is_terminal());
        assert!(decode_fragment(&[0, 0]).unwrap().is_terminal());
    }

    #[test]
    fn test_encode_fragments_reassemble() {
        let data: Vec<u8> = (0..40).collect();
        let frames = encode_fragments(0x2F, &data, 16).unwrap();
        assert_eq!(frames.len(), 3);

        let mut rebuilt = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let n = decode_notification(frame, EXEC).unwrap();
            let fragment = decode_fragment(n.payload()).unwrap();
            assert_eq!(fragment.index as usize, i);
            assert_eq!(fragment.is_terminal(), i == 2);
            rebuilt.extend_from_slice(fragment.data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_exec_result_encoder_matches_decoder() {
        let frame = encode_exec_result(EXEC, 0x17, 0x01, &[]);
        assert_eq!(frame, vec![0x03, EXEC, 0x17, 0x01]);
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x0A, 0xFF]), "0AFF");
    }
}
