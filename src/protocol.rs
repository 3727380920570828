//! Wire-level constants and frame classification.
//!
//! Every frame on the link starts with `[address, function, ...]` and ends
//! with a Modbus CRC-16. Telemetry answers use function `0x03` (a complete or
//! primary frame) and `0x04` (a continuation of a multi-frame cell-voltage
//! answer). Frames whose first byte is `0x10` belong to the settings
//! sub-protocol handled by [`crate::control`].

use crate::frame::crc16;

/// Function code of a complete, or first, telemetry frame.
pub const FUNCTION_NORMAL: u8 = 0x03;
/// Function code of a telemetry continuation frame.
pub const FUNCTION_CONTINUATION: u8 = 0x04;
/// First byte of every settings (control-data) frame.
pub const FUNCTION_CONTROL: u8 = 0x10;

/// Leading transport bytes (address, function, byte count) in front of the payload.
pub const HEADER_LENGTH: usize = 3;
/// Trailing bytes dropped after the payload, CRC included.
pub const TRAILER_LENGTH: usize = 5;

/// Cells carried by one telemetry frame.
pub const CELLS_PER_FRAME: usize = 16;
/// Cell counts above this are treated as line noise.
pub const MAX_PLAUSIBLE_CELLS: u16 = 500;

/// Verbatim telemetry request: read 0x27 holding registers from address 1.
pub const TELEMETRY_REQUEST: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x27, 0x05, 0xd0];

/// How an inbound frame is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control,
    Telemetry,
    Continuation,
    Unknown,
}

impl FrameKind {
    /// Classifies a frame that already passed CRC verification.
    ///
    /// The control-data test runs first: a control frame never reaches the
    /// telemetry codec, whatever its second byte holds.
    pub fn classify(frame: &[u8]) -> Self {
        match frame {
            [FUNCTION_CONTROL, ..] => FrameKind::Control,
            [_, FUNCTION_NORMAL, ..] => FrameKind::Telemetry,
            [_, FUNCTION_CONTINUATION, ..] => FrameKind::Continuation,
            _ => FrameKind::Unknown,
        }
    }
}

/// Builds the telemetry request from its fields, CRC included.
///
/// Equal to [`TELEMETRY_REQUEST`] for the defaults used by the device.
pub fn telemetry_request(address: u8, start_register: u16, register_count: u16) -> Vec<u8> {
    let start = start_register.to_be_bytes();
    let count = register_count.to_be_bytes();
    crc16(&[
        address,
        FUNCTION_NORMAL,
        start[0],
        start[1],
        count[0],
        count[1],
    ])
}

/// Strips the transport header and trailer, leaving the protocol payload.
pub fn payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < HEADER_LENGTH + TRAILER_LENGTH {
        return None;
    }
    Some(&frame[HEADER_LENGTH..frame.len() - TRAILER_LENGTH])
}

pub(crate) fn read_u16(payload: &[u8], offset: usize) -> Option<u16> {
    payload
        .get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}
