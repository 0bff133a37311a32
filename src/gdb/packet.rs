//! `$payload#cc` framing: the 8-bit sum-mod-256 checksum, lowercase hex.

/// Sum of `bytes` mod 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Wraps `msg` as a full `$msg#cc` wire packet.
pub fn encode(msg: &str) -> Vec<u8> {
    format!("${}#{:02x}", msg, checksum(msg.as_bytes())).into_bytes()
}

/// Result of attempting to pull one complete packet out of `buf`.
/// `Err(())` signals a checksum mismatch, which per the protocol is
/// fatal for the connection.
pub type ExtractResult = Option<Result<String, ()>>;

/// Strips leading `+` acks and any garbage preceding the first `$`,
/// then looks for a complete `$...#xx` packet. Returns `None` if no
/// complete packet is buffered yet.
pub fn extract_packet(buf: &mut Vec<u8>) -> ExtractResult {
    while buf.first() == Some(&b'+') {
        buf.remove(0);
    }
    let dollar = buf.iter().position(|&b| b == b'$')?;
    if dollar > 0 {
        buf.drain(0..dollar);
    }
    let hash = buf.iter().position(|&b| b == b'#')?;
    if buf.len() < hash + 3 {
        return None;
    }

    let msg_bytes = buf[1..hash].to_vec();
    let sum_str = std::str::from_utf8(&buf[hash + 1..hash + 3]).ok();
    let expected = sum_str.and_then(|s| u8::from_str_radix(s, 16).ok());
    let result = match expected {
        Some(expected) if expected == checksum(&msg_bytes) => {
            Ok(String::from_utf8_lossy(&msg_bytes).into_owned())
        }
        _ => Err(()),
    };
    buf.drain(0..hash + 3);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_known_checksum() {
        // "OK" -> 'O'(0x4f) + 'K'(0x4b) = 0x9a
        assert_eq!(encode("OK"), b"$OK#9a");
    }

    #[test]
    fn extract_round_trips_encoded_packet() {
        let mut buf = encode("S05");
        let parsed = extract_packet(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, "S05");
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_detects_checksum_mismatch() {
        let mut buf = b"$OK#00".to_vec();
        assert_eq!(extract_packet(&mut buf), Some(Err(())));
    }

    #[test]
    fn extract_skips_leading_acks_and_garbage() {
        let mut buf = b"++garbage$g#67".to_vec();
        let parsed = extract_packet(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, "g");
    }

    #[test]
    fn extract_waits_for_more_data() {
        let mut buf = b"$g#6".to_vec();
        assert_eq!(extract_packet(&mut buf), None);
    }
}
