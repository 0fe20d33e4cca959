//! KWP2000 PDU framing.
//!
//! Frame layout on the wire: `CNT TX RX DATA... CHK`. When the application
//! data is shorter than 127 bytes its length is folded into the counter byte
//! (`0x80 + len`); otherwise the counter is a bare `0x80` and an explicit
//! length byte precedes the data. The checksum is the sum of every preceding
//! byte modulo 256.

/// Service and status bytes used on the live-polling code path.
#[allow(dead_code)]
pub mod services {
    pub const START_DIAGNOSTIC_SESSION: u8 = 0x10;
    pub const READ_DATA_BY_LOCAL_ID: u8 = 0x21;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const START_COMMUNICATION: u8 = 0x81;
    pub const ACCESS_TIMING_PARAMETERS: u8 = 0x83;

    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    pub const RESPONSE_PENDING: u8 = 0x78;
}

/// Sum of all bytes modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build a complete frame around `data` (service byte plus payload).
pub fn build_frame(tx_id: u8, rx_id: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 5);

    if data.len() < 127 {
        frame.push(0x80 + data.len() as u8);
        frame.push(tx_id);
        frame.push(rx_id);
    } else {
        frame.push(0x80);
        frame.push(tx_id);
        frame.push(rx_id);
        frame.push(data.len() as u8);
    }
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));

    frame
}

/// Parse a complete frame back into its application data.
///
/// Returns `(tx_id, rx_id, data)` or `None` if the buffer is too short for
/// the declared length. Used by tests and by scripted ECU doubles; the live
/// receive path decodes incrementally in [`crate::link`].
pub fn parse_frame(frame: &[u8]) -> Option<(u8, u8, Vec<u8>)> {
    if frame.len() < 5 {
        return None;
    }

    let counter = frame[0];
    let tx_id = frame[1];
    let rx_id = frame[2];

    let (len, data_start) = if counter == 0x80 {
        (frame[3] as usize, 4)
    } else {
        ((counter - 0x80) as usize, 3)
    };

    if frame.len() < data_start + len + 1 {
        return None;
    }

    Some((tx_id, rx_id, frame[data_start..data_start + len].to_vec()))
}

/// Human-readable description of a negative-response code.
pub fn error_description(code: u8) -> &'static str {
    match code {
        0x10 => "General reject",
        0x11 => "Service not supported",
        0x12 => "Sub-function not supported",
        0x13 => "Message length incorrect",
        0x21 => "Busy - repeat request",
        0x22 => "Conditions not correct",
        0x24 => "Request sequence error",
        0x31 => "Request out of range",
        0x33 => "Security access denied",
        0x35 => "Invalid key",
        0x36 => "Exceed number of attempts",
        0x37 => "Required time delay not expired",
        0x78 => "Request correctly received, response pending",
        0x80 => "Service not supported in active session",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frame_round_trip() {
        let data = vec![0x21, 0x01];
        let frame = build_frame(0x11, 0xF1, &data);

        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1], 0x11);
        assert_eq!(frame[2], 0xF1);
        assert_eq!(*frame.last().unwrap(), checksum(&frame[..frame.len() - 1]));

        let (tx, rx, parsed) = parse_frame(&frame).unwrap();
        assert_eq!((tx, rx), (0x11, 0xF1));
        assert_eq!(parsed, data);
    }

    #[test]
    fn long_frame_uses_explicit_length_byte() {
        let data: Vec<u8> = (0..140).map(|i| (i % 251) as u8).collect();
        let frame = build_frame(0x11, 0xF1, &data);

        assert_eq!(frame[0], 0x80);
        assert_eq!(frame[3], 140);
        assert_eq!(frame.len(), 140 + 5);

        let (_, _, parsed) = parse_frame(&frame).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn boundary_at_127_bytes() {
        let short: Vec<u8> = vec![0xAA; 126];
        assert_eq!(build_frame(0x11, 0xF1, &short)[0], 0x80 + 126);

        let long: Vec<u8> = vec![0xAA; 127];
        let frame = build_frame(0x11, 0xF1, &long);
        assert_eq!(frame[0], 0x80);
        assert_eq!(frame[3], 127);
        let (_, _, parsed) = parse_frame(&frame).unwrap();
        assert_eq!(parsed, long);
    }

    #[test]
    fn checksum_is_sum_mod_256() {
        let bytes = [0x81, 0x12, 0xF1, 0x3E];
        assert_eq!(checksum(&bytes), ((0x81u32 + 0x12 + 0xF1 + 0x3E) & 0xFF) as u8);

        // Corrupting any byte must change the sum.
        let mut corrupted = bytes;
        corrupted[2] = corrupted[2].wrapping_add(1);
        assert_ne!(checksum(&corrupted), checksum(&bytes));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = build_frame(0x11, 0xF1, &[0x3E, 0x01]);
        assert!(parse_frame(&frame[..frame.len() - 2]).is_none());
        assert!(parse_frame(&[0x81, 0x11]).is_none());
    }
}
