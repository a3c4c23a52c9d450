//! Line-oriented ISO-TP (ISO 15765-2) reassembly
//!
//! With `ATH1 ATS1` programmed, the adapter prints one line per CAN frame:
//! a 3-nibble CAN id followed by space-separated hex bytes, e.g.
//! `7E8 10 0A 59 02 FF 04 20 09`. This module turns that text back into the
//! transported payload. It is pure and stateless per call; flow control for
//! multi-frame responses is the adapter's job (ATFCSD/ATFCSM), never ours.

use log::warn;

use crate::{DiagError, DiagResult};

/// Markers the adapter prints instead of frames when nothing answered
const NO_DATA_MARKERS: &[&str] = &["NO DATA", "ERROR", "UNABLE", "?"];

/// Reassembles the payload carried by one adapter reply.
///
/// Returns [DiagError::NoData] when the adapter reported an empty window
/// and [DiagError::ProtocolMismatch] when frames do not form a coherent
/// ISO-TP sequence.
pub fn parse_response(reply: &str) -> DiagResult<Vec<u8>> {
    let lines: Vec<&str> = reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(DiagError::NoData);
    }
    if lines
        .iter()
        .any(|l| NO_DATA_MARKERS.iter().any(|m| l.contains(m)))
    {
        return Err(DiagError::NoData);
    }

    let mut payload: Vec<u8> = Vec::new();
    // Declared total once a First Frame was seen
    let mut expected_total: Option<usize> = None;
    let mut next_seq: u8 = 1;

    for line in lines {
        let data = frame_bytes(line)?;
        if data.is_empty() {
            continue;
        }
        let pci = data[0] & 0xF0;
        match (pci, expected_total) {
            // Single Frame; only meaningful before any First Frame
            (0x00, None) => {
                let declared = (data[0] & 0x0F) as usize;
                let rest = &data[1..];
                if declared > 0 && declared == rest.len() {
                    payload.extend_from_slice(rest);
                } else {
                    // Length nibble disagrees with the line; clone adapters
                    // get this wrong in both directions, so trust the bytes
                    warn!(
                        "single frame length nibble {} but {} bytes on line, consuming line",
                        declared,
                        rest.len()
                    );
                    payload.extend_from_slice(rest);
                }
            }
            (0x10, None) => {
                let total = (((data[0] & 0x0F) as usize) << 8)
                    | *data.get(1).ok_or(DiagError::ProtocolMismatch)? as usize;
                expected_total = Some(total);
                next_seq = 1;
                payload.extend_from_slice(&data[2..]);
            }
            // Once a First Frame was seen only Consecutive Frames contribute
            (0x20, Some(total)) => {
                let seq = data[0] & 0x0F;
                if seq != next_seq {
                    return Err(DiagError::ProtocolMismatch);
                }
                next_seq = (next_seq + 1) & 0x0F;
                let remaining = total.saturating_sub(payload.len());
                let take = remaining.min(data.len() - 1);
                payload.extend_from_slice(&data[1..1 + take]);
                if payload.len() >= total {
                    break;
                }
            }
            // A stray frame type for the current state
            _ => return Err(DiagError::ProtocolMismatch),
        }
        if expected_total.is_none() && !payload.is_empty() {
            // Single-frame replies carry everything in one line
            break;
        }
    }

    if let Some(total) = expected_total {
        if payload.len() < total {
            return Err(DiagError::ProtocolMismatch);
        }
        payload.truncate(total);
    }
    if payload.is_empty() {
        return Err(DiagError::NoData);
    }
    Ok(payload)
}

/// Splits one adapter line into frame data bytes, dropping the leading
/// 3-nibble CAN id when present.
fn frame_bytes(line: &str) -> DiagResult<Vec<u8>> {
    let mut tokens = line.split_whitespace().peekable();
    if let Some(first) = tokens.peek() {
        if first.len() == 3 && first.chars().all(|c| c.is_ascii_hexdigit()) {
            tokens.next();
        }
    }
    tokens
        .map(|t| u8::from_str_radix(t, 16).map_err(|_| DiagError::ProtocolMismatch))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_with_id() {
        let payload = parse_response("7E8 06 62 D4 1F 0C 5E 00").unwrap();
        assert_eq!(payload, vec![0x62, 0xD4, 0x1F, 0x0C, 0x5E, 0x00]);
    }

    #[test]
    fn single_frame_without_id() {
        let payload = parse_response("04 62 D5 46 12").unwrap();
        assert_eq!(payload, vec![0x62, 0xD5, 0x46, 0x12]);
    }

    #[test]
    fn permissive_single_frame_consumes_line() {
        // Zero length nibble: trust the bytes on the line instead
        let payload = parse_response("7E8 00 62 D4 1F 0B B8").unwrap();
        assert_eq!(payload, vec![0x62, 0xD4, 0x1F, 0x0B, 0xB8]);
        // Nibble short of the line: the trailing bytes are real data
        let payload = parse_response("7E8 04 62 D5 46 12 34").unwrap();
        assert_eq!(payload, vec![0x62, 0xD5, 0x46, 0x12, 0x34]);
        // Nibble past the line: same treatment
        let payload = parse_response("7E8 06 62 D4 1F 0B B8").unwrap();
        assert_eq!(payload, vec![0x62, 0xD4, 0x1F, 0x0B, 0xB8]);
    }

    #[test]
    fn multi_frame_reassembly_matches_declared_length() {
        let reply = "7E8 10 0A 59 02 FF 04 20 09\n7E8 21 01 34 21 05 00 00 00";
        let payload = parse_response(reply).unwrap();
        assert_eq!(payload.len(), 0x0A);
        assert_eq!(
            payload,
            vec![0x59, 0x02, 0xFF, 0x04, 0x20, 0x09, 0x01, 0x34, 0x21, 0x05]
        );
    }

    #[test]
    fn consecutive_frame_gap_is_mismatch() {
        let reply = "7E8 10 14 59 02 FF 04 20 09\n7E8 23 01 34 21 05 00 00 00";
        assert!(matches!(
            parse_response(reply),
            Err(DiagError::ProtocolMismatch)
        ));
    }

    #[test]
    fn truncated_multi_frame_is_mismatch() {
        let reply = "7E8 10 14 59 02 FF 04 20 09";
        assert!(matches!(
            parse_response(reply),
            Err(DiagError::ProtocolMismatch)
        ));
    }

    #[test]
    fn no_data_markers() {
        assert!(matches!(parse_response("NO DATA"), Err(DiagError::NoData)));
        assert!(matches!(
            parse_response("CAN ERROR"),
            Err(DiagError::NoData)
        ));
        assert!(matches!(
            parse_response("UNABLE TO CONNECT"),
            Err(DiagError::NoData)
        ));
        assert!(matches!(parse_response(""), Err(DiagError::NoData)));
    }

    #[test]
    fn sequence_wraps_past_fifteen() {
        // 0x76 bytes total: FF carries 6, then 16 CFs of 7 bytes each,
        // so the sequence nibble runs 1..15 and wraps to 0.
        let mut reply = String::from("7E8 10 76 01 02 03 04 05 06");
        let mut seq = 1u8;
        for _ in 0..16 {
            reply.push_str(&format!("\n7E8 2{seq:X} AA AA AA AA AA AA AA"));
            seq = (seq + 1) & 0x0F;
        }
        let payload = parse_response(&reply).unwrap();
        assert_eq!(payload.len(), 0x76);
    }
}
