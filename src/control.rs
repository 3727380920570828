//! Settings sub-protocol: module ID and CAN / RS485 protocol selection.
//!
//! Requests are `[0x10, sub-command, 0x00 | 0x01, value]` followed by the
//! CRC-16, where `0x00` reads and `0x01` writes. Answers echo the
//! sub-command and carry their value at offset 3:
//!
//! ```text
//! module id:  10 02 00 <id> crc crc
//! protocols:  10 03 00 <selected> <count> <10-byte slot>... crc crc
//! set ack:    10 07 00 <0 = ok> crc crc
//! ```

use crate::frame::{crc16, hex_encode};
use crate::protocol::FUNCTION_CONTROL;
use crate::{Error, Result};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const VALUE_OFFSET: usize = 3;
const PROTOCOL_COUNT_OFFSET: usize = 4;
const PROTOCOL_TABLE_OFFSET: usize = 5;
const CRC_LENGTH: usize = 2;

/// Width of one protocol name slot.
pub const PROTOCOL_SLOT_WIDTH: usize = 10;

/// Lowest and highest module ID a pack can be assigned.
pub const MODULE_ID_RANGE: std::ops::RangeInclusive<u8> = 1..=16;

const READ: u8 = 0x00;
const WRITE: u8 = 0x01;

/// True when the frame belongs to the settings sub-protocol.
///
/// Must be checked before handing a frame to the telemetry decoder.
pub fn is_control_data(frame: &[u8]) -> bool {
    frame.first() == Some(&FUNCTION_CONTROL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    GetModuleId = 0x02,
    GetRs485 = 0x03,
    GetCan = 0x04,
    SetRs485 = 0x05,
    SetCan = 0x06,
    SetModuleId = 0x07,
}

impl ControlCommand {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(ControlCommand::GetModuleId),
            0x03 => Some(ControlCommand::GetRs485),
            0x04 => Some(ControlCommand::GetCan),
            0x05 => Some(ControlCommand::SetRs485),
            0x06 => Some(ControlCommand::SetCan),
            0x07 => Some(ControlCommand::SetModuleId),
            _ => None,
        }
    }

    pub fn is_set(self) -> bool {
        matches!(
            self,
            ControlCommand::SetRs485 | ControlCommand::SetCan | ControlCommand::SetModuleId
        )
    }

    /// Request bytes, CRC included. `value` is ignored for reads.
    pub fn request(self, value: u8) -> Vec<u8> {
        let body = if self.is_set() {
            [FUNCTION_CONTROL, self as u8, WRITE, value]
        } else {
            [FUNCTION_CONTROL, self as u8, READ, 0x00]
        };
        crc16(&body)
    }

    /// Same bytes as [`ControlCommand::request`] as a hex string.
    pub fn encode_hex(self, value: u8) -> String {
        hex_encode(&self.request(value), false)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ControlCommand::GetModuleId => "getModuleId",
            ControlCommand::GetRs485 => "getRS485",
            ControlCommand::GetCan => "getCAN",
            ControlCommand::SetRs485 => "setRS485",
            ControlCommand::SetCan => "setCAN",
            ControlCommand::SetModuleId => "setModuleId",
        };
        f.write_str(name)
    }
}

fn validate_header(frame: &[u8], min_len: usize, accepted: &[ControlCommand]) -> Result<()> {
    if frame.len() < min_len {
        log::debug!(
            "Invalid control frame size - required={} received={}",
            min_len,
            frame.len()
        );
        return Err(Error::MalformedFrame("control frame too short"));
    }
    if !is_control_data(frame) {
        return Err(Error::ProtocolMismatch("not a control frame"));
    }
    if !accepted.iter().any(|c| *c as u8 == frame[1]) {
        log::debug!(
            "Unexpected control sub-command {:02X?}, expected one of {accepted:?}",
            frame[1]
        );
        return Err(Error::ProtocolMismatch("unexpected control sub-command"));
    }
    Ok(())
}

/// Module ID as reported by the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModuleIdControlData {
    pub module_id: u8,
}

impl ModuleIdControlData {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        validate_header(
            frame,
            VALUE_OFFSET + 1,
            &[ControlCommand::GetModuleId, ControlCommand::SetModuleId],
        )?;
        Ok(Self {
            module_id: frame[VALUE_OFFSET],
        })
    }

    /// Wire value for a zero-based selection index.
    pub fn from_index(index: usize) -> Result<u8> {
        u8::try_from(index + 1)
            .ok()
            .filter(|id| MODULE_ID_RANGE.contains(id))
            .ok_or(Error::RangeError)
    }

    pub fn is_valid(&self) -> bool {
        MODULE_ID_RANGE.contains(&self.module_id)
    }

    pub fn readable_id(&self) -> String {
        format!("ID {}", self.module_id)
    }

    /// Only the pack in slot 1 may also drive the CAN and RS485 settings.
    pub fn other_protocols_enabled(&self) -> bool {
        self.module_id == 1
    }
}

/// Bus whose protocol table a [`ProtocolSelection`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProtocolBus {
    Rs485,
    Can,
}

impl ProtocolBus {
    pub fn get_command(self) -> ControlCommand {
        match self {
            ProtocolBus::Rs485 => ControlCommand::GetRs485,
            ProtocolBus::Can => ControlCommand::GetCan,
        }
    }

    pub fn set_command(self) -> ControlCommand {
        match self {
            ProtocolBus::Rs485 => ControlCommand::SetRs485,
            ProtocolBus::Can => ControlCommand::SetCan,
        }
    }
}

impl fmt::Display for ProtocolBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolBus::Rs485 => write!(f, "RS485"),
            ProtocolBus::Can => write!(f, "CAN"),
        }
    }
}

/// Selected protocol and the table of protocols a bus supports.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtocolSelection {
    pub bus: ProtocolBus,
    pub selected_index: u8,
    pub protocols: Vec<String>,
}

impl ProtocolSelection {
    pub fn decode(bus: ProtocolBus, frame: &[u8]) -> Result<Self> {
        validate_header(
            frame,
            PROTOCOL_COUNT_OFFSET + 1,
            &[bus.get_command(), bus.set_command()],
        )?;
        let body = &frame[..frame.len().saturating_sub(CRC_LENGTH).max(PROTOCOL_COUNT_OFFSET + 1)];
        let count = usize::from(frame[PROTOCOL_COUNT_OFFSET]);
        let mut protocols = Vec::with_capacity(count);
        for slot in 0..count {
            let start = PROTOCOL_TABLE_OFFSET + slot * PROTOCOL_SLOT_WIDTH;
            if start >= body.len() {
                log::warn!("{bus} protocol table truncated: {slot} of {count} names");
                break;
            }
            let end = (start + PROTOCOL_SLOT_WIDTH).min(body.len());
            protocols.push(slot_name(&body[start..end]));
        }
        Ok(Self {
            bus,
            selected_index: frame[VALUE_OFFSET],
            protocols,
        })
    }

    /// Name of the selected protocol, or an empty string if the index is out of range.
    pub fn readable_protocol(&self) -> &str {
        self.readable_protocol_at(usize::from(self.selected_index))
    }

    pub fn readable_protocol_at(&self, index: usize) -> &str {
        self.protocols.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn readable_protocols(&self) -> &[String] {
        &self.protocols
    }
}

// A name ends at the first zero byte; the scan never leaves its slot.
fn slot_name(slot: &[u8]) -> String {
    let len = match slot.iter().position(|&b| b == 0) {
        Some(len) => len,
        None => {
            log::debug!("Protocol slot without terminator: {slot:02X?}");
            slot.len()
        }
    };
    String::from_utf8_lossy(&slot[..len]).into_owned()
}

/// Any decoded settings answer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ControlDatum {
    ModuleId(ModuleIdControlData),
    Rs485(ProtocolSelection),
    Can(ProtocolSelection),
}

impl ControlDatum {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let command = frame
            .get(1)
            .and_then(|&code| ControlCommand::from_code(code))
            .ok_or(Error::ProtocolMismatch("unknown control sub-command"))?;
        match command {
            ControlCommand::GetModuleId | ControlCommand::SetModuleId => {
                Ok(ControlDatum::ModuleId(ModuleIdControlData::decode(frame)?))
            }
            ControlCommand::GetRs485 | ControlCommand::SetRs485 => Ok(ControlDatum::Rs485(
                ProtocolSelection::decode(ProtocolBus::Rs485, frame)?,
            )),
            ControlCommand::GetCan | ControlCommand::SetCan => Ok(ControlDatum::Can(
                ProtocolSelection::decode(ProtocolBus::Can, frame)?,
            )),
        }
    }
}

/// Acknowledgement of a set request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseData {
    pub code: u8,
}

impl ResponseData {
    /// Decodes the answer to `command`; the frame must echo its sub-command.
    pub fn decode(command: ControlCommand, frame: &[u8]) -> Result<Self> {
        validate_header(frame, VALUE_OFFSET + 1, &[command])?;
        Ok(Self {
            code: frame[VALUE_OFFSET],
        })
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::crc16_verify;

    fn protocol_frame(command: ControlCommand, selected: u8, names: &[&str]) -> Vec<u8> {
        let mut frame = vec![FUNCTION_CONTROL, command as u8, 0x00, selected, names.len() as u8];
        for name in names {
            let mut slot = [0u8; PROTOCOL_SLOT_WIDTH];
            slot[..name.len()].copy_from_slice(name.as_bytes());
            frame.extend_from_slice(&slot);
        }
        crc16(&frame)
    }

    #[test]
    fn control_classification() {
        assert!(is_control_data(&[0x10, 0x02, 0x00]));
        assert!(!is_control_data(&[0x01, 0x10, 0x00]));
        assert!(!is_control_data(&[]));
    }

    #[test]
    fn encodes_requests() {
        let set = ControlCommand::SetModuleId.request(3);
        assert_eq!(&set[..4], &[0x10, 0x07, 0x01, 0x03]);
        assert!(crc16_verify(&set));

        let get = ControlCommand::GetCan.request(9);
        assert_eq!(&get[..4], &[0x10, 0x04, 0x00, 0x00]);
        assert!(crc16_verify(&get));

        assert_eq!(ControlCommand::GetModuleId.encode_hex(0), "10020000a524");
    }

    #[test]
    fn module_id_round_trip() {
        for id in MODULE_ID_RANGE {
            let frame = crc16(&[0x10, ControlCommand::SetModuleId as u8, 0x00, id]);
            let data = ModuleIdControlData::decode(&frame).unwrap();
            assert_eq!(data.module_id, id);
            assert_eq!(data.readable_id(), format!("ID {id}"));
            assert_eq!(data.other_protocols_enabled(), id == 1);
            assert!(data.is_valid());
        }
    }

    #[test]
    fn module_id_rejects_other_frames() {
        assert!(matches!(
            ModuleIdControlData::decode(&[0x10, 0x02, 0x00]),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            ModuleIdControlData::decode(&crc16(&[0x10, 0x03, 0x00, 0x01])),
            Err(Error::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn module_id_from_index() {
        assert_eq!(ModuleIdControlData::from_index(0).unwrap(), 1);
        assert_eq!(ModuleIdControlData::from_index(15).unwrap(), 16);
        assert!(matches!(ModuleIdControlData::from_index(16), Err(Error::RangeError)));
    }

    #[test]
    fn parses_protocol_names() {
        let frame = protocol_frame(ControlCommand::GetRs485, 1, &["P02-LUX", "P01-LUX", "P06-LUX"]);
        let selection = ProtocolSelection::decode(ProtocolBus::Rs485, &frame).unwrap();
        assert_eq!(selection.readable_protocols(), ["P02-LUX", "P01-LUX", "P06-LUX"]);
        assert_eq!(selection.selected_index, 1);
        assert_eq!(selection.readable_protocol(), "P01-LUX");
        assert_eq!(selection.readable_protocol_at(2), "P06-LUX");
        assert_eq!(selection.readable_protocol_at(3), "");
    }

    #[test]
    fn unterminated_slot_stays_in_bounds() {
        let frame = protocol_frame(ControlCommand::GetCan, 0, &["ABCDEFGHIJ", "P03-GRW"]);
        let selection = ProtocolSelection::decode(ProtocolBus::Can, &frame).unwrap();
        assert_eq!(selection.readable_protocols(), ["ABCDEFGHIJ", "P03-GRW"]);
    }

    #[test]
    fn truncated_table_keeps_complete_names() {
        let mut frame = protocol_frame(ControlCommand::GetCan, 0, &["P01-GRW", "P02-VIC"]);
        frame[PROTOCOL_COUNT_OFFSET] = 5;
        let selection = ProtocolSelection::decode(ProtocolBus::Can, &frame).unwrap();
        assert_eq!(selection.protocols.len(), 2);
        assert_eq!(selection.readable_protocol_at(4), "");
    }

    #[test]
    fn bus_must_match() {
        let frame = protocol_frame(ControlCommand::GetCan, 0, &["P01-GRW"]);
        assert!(ProtocolSelection::decode(ProtocolBus::Rs485, &frame).is_err());
        let frame = protocol_frame(ControlCommand::SetCan, 0, &["P01-GRW"]);
        assert!(ProtocolSelection::decode(ProtocolBus::Can, &frame).is_ok());
    }

    #[test]
    fn datum_dispatch() {
        let frame = crc16(&[0x10, 0x02, 0x00, 0x04]);
        assert_eq!(
            ControlDatum::decode(&frame).unwrap(),
            ControlDatum::ModuleId(ModuleIdControlData { module_id: 4 })
        );
        let frame = protocol_frame(ControlCommand::GetRs485, 0, &["P02-LUX"]);
        assert!(matches!(ControlDatum::decode(&frame), Ok(ControlDatum::Rs485(_))));
        assert!(ControlDatum::decode(&crc16(&[0x10, 0x09, 0x00, 0x00])).is_err());
    }

    #[test]
    fn set_acknowledgement() {
        let set = ControlCommand::SetModuleId;
        assert!(ResponseData::decode(set, &crc16(&[0x10, 0x07, 0x00, 0x00])).unwrap().is_success());
        assert!(!ResponseData::decode(set, &crc16(&[0x10, 0x07, 0x00, 0x01])).unwrap().is_success());
        assert!(ResponseData::decode(set, &[0x10, 0x07, 0x00]).is_err());
    }

    #[test]
    fn acknowledgement_must_echo_the_set_command() {
        // A late getRS485 answer selecting index 0 looks like a success code.
        let late_get = protocol_frame(ControlCommand::GetRs485, 0, &["P01-GRW"]);
        assert!(matches!(
            ResponseData::decode(ControlCommand::SetCan, &late_get),
            Err(Error::ProtocolMismatch(_))
        ));
        let other_set = crc16(&[0x10, 0x05, 0x00, 0x00]);
        assert!(ResponseData::decode(ControlCommand::SetCan, &other_set).is_err());
        assert!(ResponseData::decode(ControlCommand::SetRs485, &other_set).is_ok());
    }
}
