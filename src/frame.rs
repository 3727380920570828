//! Byte-level helpers shared by every codec: hex conversion and the Modbus CRC-16
//! that terminates each frame on the wire.

use crc16::{State, MODBUS};

const HEX_PREFIX: &str = "0x";

/// Decodes a hex string, with or without a `0x` prefix.
///
/// Malformed input (odd length, non-hex digits) yields an empty vector, so an
/// empty result always means "unusable" rather than "zero bytes".
pub fn hex_decode(input: &str) -> Vec<u8> {
    let digits = input
        .strip_prefix(HEX_PREFIX)
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    match hex::decode(digits) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::debug!("Cannot decode hex string {input:?} ({err})");
            Vec::new()
        }
    }
}

/// Encodes bytes as two lowercase hex digits each, optionally prefixed with `0x`.
pub fn hex_encode(bytes: &[u8], with_prefix: bool) -> String {
    if with_prefix {
        format!("{HEX_PREFIX}{}", hex::encode(bytes))
    } else {
        hex::encode(bytes)
    }
}

fn checksum(bytes: &[u8]) -> [u8; 2] {
    // Modbus puts the low byte of the CRC register on the wire first
    State::<MODBUS>::calculate(bytes).to_le_bytes()
}

/// Returns `bytes` with its CRC-16 appended.
///
/// Inputs shorter than three bytes are returned unchanged.
pub fn crc16(bytes: &[u8]) -> Vec<u8> {
    let mut frame = bytes.to_vec();
    if bytes.len() < 3 {
        return frame;
    }
    frame.extend_from_slice(&checksum(bytes));
    frame
}

/// Checks the trailing two bytes of `frame` against the CRC of everything before them.
pub fn crc16_verify(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, received) = frame.split_at(frame.len() - 2);
    let calculated = checksum(body);
    if received != calculated {
        log::trace!(
            "Invalid checksum - calculated={:02X?} received={:02X?}",
            calculated,
            received
        );
        return false;
    }
    true
}
