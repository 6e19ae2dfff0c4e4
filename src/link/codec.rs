//! Link-layer framing codec.
//!
//! `encode_packet` builds a complete `DLE STX CMD ... DLE ETX LRC RUB`
//! frame, including the shift-state escaping, run-length compression and
//! the final high-bit-set pass. `decode_packet` is its inverse, operating
//! on a buffer that already starts with `DLE STX CMD`.

use crate::error::{OasisError, Result};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const VT: u8 = 0x0B;
pub const SO: u8 = 0x0E;
pub const SI: u8 = 0x0F;
pub const DLE: u8 = 0x10;
pub const CAN: u8 = 0x18;
pub const ESC: u8 = 0x1B;
pub const RUB: u8 = 0x7F;

const MAX_RUN: usize = 127;

/// Encodes `cmd` and `payload` into a full wire frame ready for
/// transmission (octets already ORed with 0x80 over the source range).
pub fn encode_packet(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![DLE, STX, cmd];
    let mut shift: u8 = 0;
    let mut i = 0;
    while i < payload.len() {
        let byte = payload[i];
        let top = byte & 0x80;

        let mut run_len = 1;
        while run_len < MAX_RUN
            && i + run_len < payload.len()
            && payload[i + run_len] == byte
        {
            run_len += 1;
        }

        if top != shift {
            if top == 0x80 {
                frame.push(DLE);
                frame.push(SI);
            } else {
                frame.push(DLE);
                frame.push(SO);
            }
            shift = top;
        }

        let emitted = if shift == 0x80 { byte & 0x7F } else { byte };
        if run_len >= 4 {
            push_escaped(&mut frame, emitted);
            frame.push(DLE);
            frame.push(VT);
            push_escaped(&mut frame, run_len as u8);
            i += run_len;
        } else {
            push_escaped(&mut frame, emitted);
            i += 1;
        }
    }

    frame.push(DLE);
    frame.push(ETX);
    let lrc = compute_lrc(&frame);
    frame.push(lrc);
    frame.push(RUB);

    let source_len = frame.len() - 1; // through LRC, before RUB, matches "offset 0..len-1"
    for b in frame.iter_mut().take(source_len) {
        *b |= 0x80;
    }
    frame
}

fn push_escaped(frame: &mut Vec<u8>, byte: u8) {
    if byte == DLE {
        frame.push(DLE);
        frame.push(DLE);
    } else if byte == ESC {
        frame.push(DLE);
        frame.push(CAN);
    } else {
        frame.push(byte);
    }
}

fn compute_lrc(frame: &[u8]) -> u8 {
    let sum: u8 = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (sum | 0xC0) & 0x7F
}

pub struct DecodedPacket {
    pub payload: Vec<u8>,
}

/// Decodes a frame that begins with `DLE STX CMD` (header already
/// inspected by the caller to extract `cmd`) and masks trailing bytes
/// back to 7 bits before interpreting them.
pub fn decode_packet(frame: &[u8]) -> Result<DecodedPacket> {
    if frame.len() < 3 {
        return Err(OasisError::protocol("frame shorter than DLE STX CMD header"));
    }
    let masked: Vec<u8> = frame.iter().map(|&b| b & 0x7F).collect();

    let mut payload = Vec::new();
    let mut shift: u8 = 0;
    let mut i = 3;
    let mut checksum_ok = None;

    while i < masked.len() {
        if masked[i] != DLE {
            payload.push(masked[i].wrapping_add(shift));
            i += 1;
            continue;
        }
        i += 1;
        if i >= masked.len() {
            return Err(OasisError::protocol("frame truncated after DLE"));
        }
        match masked[i] {
            SI => {
                shift = 0x80;
                i += 1;
            }
            SO => {
                shift = 0;
                i += 1;
            }
            DLE => {
                payload.push(DLE ^ shift);
                i += 1;
            }
            CAN => {
                payload.push(ESC ^ shift);
                i += 1;
            }
            VT => {
                i += 1;
                if i >= masked.len() {
                    return Err(OasisError::protocol("frame truncated in run-length escape"));
                }
                let (count, consumed) = read_possibly_escaped_count(&masked, i)?;
                i += consumed;
                let last = *payload
                    .last()
                    .ok_or_else(|| OasisError::protocol("run-length escape with no prior byte"))?;
                for _ in 0..count.saturating_sub(1) {
                    payload.push(last);
                }
            }
            ETX => {
                i += 1;
                if i >= masked.len() {
                    return Err(OasisError::protocol("frame missing trailing LRC"));
                }
                // `i` now indexes the LRC byte; the sum runs from DLE STX
                // through DLE ETX inclusive, i.e. masked[..i].
                let lrc_over = masked[..i].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
                let computed = (lrc_over | 0xC0) & 0x7F;
                let received = masked[i];
                checksum_ok = Some(computed == received);
                break;
            }
            other => {
                return Err(OasisError::protocol(format!(
                    "unexpected byte {other:#x} after DLE"
                )));
            }
        }
    }

    match checksum_ok {
        Some(true) => Ok(DecodedPacket { payload }),
        Some(false) => Err(OasisError::protocol("bad LRC checksum")),
        None => Err(OasisError::protocol("frame missing DLE ETX trailer")),
    }
}

fn read_possibly_escaped_count(masked: &[u8], i: usize) -> Result<(usize, usize)> {
    if masked[i] == DLE {
        if i + 1 >= masked.len() {
            return Err(OasisError::protocol("truncated escaped run count"));
        }
        let value = match masked[i + 1] {
            DLE => DLE,
            CAN => ESC,
            other => {
                return Err(OasisError::protocol(format!(
                    "invalid escape {other:#x} in run count"
                )))
            }
        };
        Ok((value as usize, 2))
    } else {
        Ok((masked[i] as usize, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_plain_payload() {
        let payload = b"HELLO";
        let frame = encode_packet(b'W', payload);
        let decoded = decode_packet(&frame).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn run_length_compression_round_trips() {
        let payload = vec![0x41u8; 50];
        let frame = encode_packet(b'W', &payload);
        assert!(frame.len() < payload.len());
        let decoded = decode_packet(&frame).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn high_bit_bytes_use_shift_state() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let frame = encode_packet(b'O', &payload);
        let decoded = decode_packet(&frame).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let mut frame = encode_packet(b'C', b"X");
        let len = frame.len();
        frame[len - 2] ^= 0xFF;
        assert!(decode_packet(&frame).is_err());
    }

    #[test]
    fn literal_dle_and_esc_bytes_round_trip() {
        let payload = vec![DLE, ESC, 0x00, DLE];
        let frame = encode_packet(b'W', &payload);
        let decoded = decode_packet(&frame).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn lrc_matches_worked_example() {
        // LRC over {0x10, 0x02, 'O'} is 0x61.
        assert_eq!(compute_lrc(&[DLE, STX, b'O']), 0x61);
    }

    #[test]
    fn rle_engages_on_fourth_identical_byte() {
        // Five identical bytes compress to a single DLE-VT run.
        let payload = [0x41u8; 5];
        let frame = encode_packet(b'W', &payload);
        let body = &frame[3..frame.len() - 4]; // after DLE STX CMD, before DLE ETX LRC RUB
        assert_eq!(body, &[0x41 | 0x80, DLE | 0x80, VT | 0x80, 0x05 | 0x80]);
    }
}
