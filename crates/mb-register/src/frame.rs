//! Raw Modbus RTU frame helpers
//!
//! Normal traffic goes through the client library, which does its own
//! framing. The only raw frames sent by this workspace are the broadcast
//! warm-up frames emitted right after a serial port is opened.
//!
//! # Frame Format
//! ```text
//! [unit] [function] [data...] [crc lo] [crc hi]
//! ```
//!
//! The warm-up frame is a Diagnostics (0x08) "return query data" request to
//! the broadcast unit. Slaves never answer broadcasts, so it is harmless, but
//! it gives auto-baud slaves a few bytes to measure the line rate from.

use crc_all::Crc;

/// Broadcast unit address (no slave answers)
pub const BROADCAST_UNIT: u8 = 0;

/// Warm-up frame body before the CRC trailer
pub const WARMUP_BODY: [u8; 6] = [BROADCAST_UNIT, 0x08, 0x00, 0x00, 0x55, 0x55];

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    const POLYNOMIAL: u16 = 0x8005;
    const WIDTH: usize = 16;
    const INITIAL: u16 = 0xFFFF;
    const XOR: u16 = 0x0000;
    const REFLECT: bool = true;
    let mut crc = Crc::<u16>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc.update(data);
    crc.finish()
}

/// Append the CRC trailer (low byte first) to a frame body
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a complete frame's CRC trailer
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    crc16(body).to_le_bytes() == [trailer[0], trailer[1]]
}

/// The complete warm-up frame, CRC included
pub fn warmup_frame() -> Vec<u8> {
    let mut frame = WARMUP_BODY.to_vec();
    append_crc(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc_trailer_order() {
        // Read holding register 0 from unit 1
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert!(verify_crc(&frame));
    }

    #[test]
    fn test_warmup_frame() {
        let frame = warmup_frame();
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..6], &WARMUP_BODY);
        assert_eq!(frame[0], BROADCAST_UNIT);
        assert!(verify_crc(&frame));
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let mut frame = warmup_frame();
        frame[4] ^= 0xFF;
        assert!(!verify_crc(&frame));
        assert!(!verify_crc(&[0x01]));
    }
}
