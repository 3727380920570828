//! Telemetry payload layout and the [`BmsReading`] value it decodes into.
//!
//! Offsets are relative to the protocol payload, i.e. after
//! [`crate::protocol::payload`] removed the transport header and trailer.

use crate::protocol::{read_u16, CELLS_PER_FRAME};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const VOLTAGE_OFFSET: usize = 0;
const CURRENT_OFFSET: usize = 2;
const CELL_VOLTAGE_OFFSET: usize = 4;
const PCB_TEMPERATURE_OFFSET: usize = 36;
const ENV_TEMPERATURE_OFFSET: usize = 40;
const SOH_OFFSET: usize = 46;
const SOC_OFFSET: usize = 48;
const STATUS_OFFSET: usize = 51;
const CELL_TEMPERATURE_OFFSET: usize = 66;
const CELL_COUNT_OFFSET: usize = 72;

const CONTINUATION_FRAME_NO_OFFSET: usize = 0;
const CONTINUATION_CELL_OFFSET: usize = 1;

/// Cell temperature sensors reported by a telemetry frame.
pub const MAX_CELL_TEMPERATURES: usize = 4;

// Raw current values above this wrap around to negative amps
const CURRENT_WRAP_THRESHOLD: u16 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BmsStatus {
    Charging,
    Discharging,
    Protecting,
    ChargingLimit,
    Standby,
}

impl From<u8> for BmsStatus {
    // 2 and 8 both decode to Discharging, and nothing decodes to
    // ChargingLimit. This mirrors what the firmware reports.
    fn from(raw: u8) -> Self {
        match raw {
            1 => BmsStatus::Charging,
            2 => BmsStatus::Discharging,
            4 => BmsStatus::Protecting,
            8 => BmsStatus::Discharging,
            _ => BmsStatus::Standby,
        }
    }
}

impl fmt::Display for BmsStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BmsStatus::Charging => write!(f, "Charging"),
            BmsStatus::Discharging => write!(f, "Discharging"),
            BmsStatus::Protecting => write!(f, "Protecting"),
            BmsStatus::ChargingLimit => write!(f, "Charging limit"),
            BmsStatus::Standby => write!(f, "Standby"),
        }
    }
}

/// One decoded telemetry sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BmsReading {
    /// Pack voltage in volts.
    pub voltage: f32,
    /// Pack current in amps, negative when the raw value wrapped.
    pub current: f32,
    /// Cell voltages in volts, indexed by physical cell position.
    pub cell_voltages: Vec<f32>,
    /// Cell temperatures in °C, at most [`MAX_CELL_TEMPERATURES`].
    pub cell_temperatures: Vec<i8>,
    pub pcb_temperature: i8,
    pub env_temperature: i8,
    /// State of charge in percent; not clamped.
    pub soc: u16,
    /// State of health in percent; not clamped.
    pub soh: u16,
    /// Number of cells the device reports, which may exceed one frame.
    pub cell_count: u16,
    pub status: BmsStatus,
}

impl BmsReading {
    /// Reads the cell-count field of a primary payload.
    ///
    /// `None` when the payload is too short to hold it.
    pub fn cell_count(payload: &[u8]) -> Option<u16> {
        read_u16(payload, CELL_COUNT_OFFSET)
    }

    /// Decodes the scalar fields and the first `cells` cell voltages of a
    /// primary payload. `cell_count` is recorded as-is.
    pub fn decode_primary(payload: &[u8], cells: usize, cell_count: u16) -> Option<Self> {
        let cells = cells.min(CELLS_PER_FRAME);
        let cell_temperatures = payload
            .get(CELL_TEMPERATURE_OFFSET..CELL_TEMPERATURE_OFFSET + MAX_CELL_TEMPERATURES)?
            .iter()
            .map(|&t| t as i8)
            .collect();
        Some(Self {
            voltage: read_u16(payload, VOLTAGE_OFFSET)? as f32 / 100.0,
            current: decode_current(read_u16(payload, CURRENT_OFFSET)?),
            cell_voltages: decode_cell_voltages(payload, CELL_VOLTAGE_OFFSET, cells)?,
            cell_temperatures,
            pcb_temperature: read_u16(payload, PCB_TEMPERATURE_OFFSET)? as i16 as i8,
            env_temperature: read_u16(payload, ENV_TEMPERATURE_OFFSET)? as i16 as i8,
            soh: read_u16(payload, SOH_OFFSET)?,
            soc: read_u16(payload, SOC_OFFSET)?,
            status: BmsStatus::from(*payload.get(STATUS_OFFSET)?),
            cell_count,
        })
    }

    /// True once every reported cell has a voltage.
    pub fn is_complete(&self) -> bool {
        self.cell_voltages.len() == usize::from(self.cell_count)
    }

    pub fn max_cell_voltage(&self) -> Option<f32> {
        self.cell_voltages.iter().copied().reduce(f32::max)
    }

    pub fn min_cell_voltage(&self) -> Option<f32> {
        self.cell_voltages.iter().copied().reduce(f32::min)
    }

    /// Spread between the highest and the lowest cell.
    pub fn cell_voltage_delta(&self) -> Option<f32> {
        Some(self.max_cell_voltage()? - self.min_cell_voltage()?)
    }

    /// Pack power in watts, negative when current is.
    pub fn power(&self) -> f32 {
        self.voltage * self.current
    }
}

/// Frame number of a continuation payload.
pub fn continuation_frame_no(payload: &[u8]) -> Option<u8> {
    payload.get(CONTINUATION_FRAME_NO_OFFSET).copied()
}

/// Decodes `cells` voltages from a continuation payload.
pub fn decode_continuation_cells(payload: &[u8], cells: usize) -> Option<Vec<f32>> {
    decode_cell_voltages(payload, CONTINUATION_CELL_OFFSET, cells)
}

/// Converts the raw current field to amps.
///
/// Values above 3276.8 A are reinterpreted as `value - 6553.6`, rounded to
/// one decimal. Working on the raw integer gives the same result exactly.
pub fn decode_current(raw: u16) -> f32 {
    if raw > CURRENT_WRAP_THRESHOLD {
        (i32::from(raw) - 65536) as f32 / 10.0
    } else {
        f32::from(raw) / 10.0
    }
}

fn decode_cell_voltages(payload: &[u8], offset: usize, cells: usize) -> Option<Vec<f32>> {
    (0..cells)
        .map(|i| {
            let volt = read_u16(payload, offset + 2 * i)? as f32 / 1000.0;
            log::trace!("cell #{} volt={}", i + 1, volt);
            Some(volt)
        })
        .collect()
}
