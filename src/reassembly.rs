//! Streaming decoder that turns telemetry frames into [`BmsReading`]s.
//!
//! Packs with more than [`CELLS_PER_FRAME`] cells answer a telemetry request
//! with one primary frame followed by numbered continuation frames. The
//! decoder keeps at most one partially built reading while those arrive.

use crate::protocol::{
    payload, CELLS_PER_FRAME, FUNCTION_CONTINUATION, FUNCTION_NORMAL, MAX_PLAUSIBLE_CELLS,
};
use crate::reading::{continuation_frame_no, decode_continuation_cells, BmsReading};
use std::mem;

#[derive(Debug, Default)]
enum ReassemblyState {
    #[default]
    Idle,
    Accumulating {
        reading: BmsReading,
        total_cells: u16,
    },
}

/// Best-effort telemetry decoder.
///
/// Input frames must already have passed CRC verification and must not be
/// control data. Malformed or out-of-sequence frames are dropped; they never
/// produce an error.
#[derive(Debug, Default)]
pub struct ReadingDecoder {
    state: ReassemblyState,
}

impl ReadingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_primary_frame(frame: &[u8]) -> bool {
        frame.get(1) == Some(&FUNCTION_NORMAL)
    }

    /// True while a multi-frame answer is being collected.
    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, ReassemblyState::Accumulating { .. })
    }

    /// Drops any partially built reading.
    pub fn reset(&mut self) {
        if self.is_accumulating() {
            log::debug!("Discarding partial reading");
        }
        self.state = ReassemblyState::Idle;
    }

    /// Feeds one frame; returns a reading once one is complete.
    pub fn push(&mut self, frame: &[u8]) -> Option<BmsReading> {
        if Self::is_primary_frame(frame) {
            return self.push_primary(frame);
        }
        match mem::take(&mut self.state) {
            ReassemblyState::Idle => {
                log::debug!(
                    "Dropping telemetry frame without a primary frame: function={:02X?}",
                    frame.get(1)
                );
                None
            }
            ReassemblyState::Accumulating {
                reading,
                total_cells,
            } => {
                if frame.get(1) != Some(&FUNCTION_CONTINUATION) {
                    log::debug!("Dropping unexpected frame during reassembly: {frame:02X?}");
                    self.state = ReassemblyState::Accumulating {
                        reading,
                        total_cells,
                    };
                    return None;
                }
                self.push_continuation(frame, reading, total_cells)
            }
        }
    }

    fn push_primary(&mut self, frame: &[u8]) -> Option<BmsReading> {
        if let ReassemblyState::Accumulating { total_cells, .. } = mem::take(&mut self.state) {
            log::debug!("Primary frame restarts reassembly of {total_cells} cells");
        }
        let payload = payload(frame)?;
        let Some(mut cell_count) = BmsReading::cell_count(payload) else {
            log::debug!("Telemetry frame too short for cell count: {} bytes", frame.len());
            return None;
        };
        if cell_count > MAX_PLAUSIBLE_CELLS {
            log::warn!("Implausible cell count {cell_count}, assuming {CELLS_PER_FRAME}");
            cell_count = CELLS_PER_FRAME as u16;
        }
        let total_cells = usize::from(cell_count);
        let Some(reading) =
            BmsReading::decode_primary(payload, total_cells.min(CELLS_PER_FRAME), cell_count)
        else {
            log::debug!("Cannot decode telemetry frame: {frame:02X?}");
            return None;
        };
        if total_cells <= CELLS_PER_FRAME {
            return Some(reading);
        }
        log::trace!(
            "Awaiting {} continuation frames for {total_cells} cells",
            total_cells.div_ceil(CELLS_PER_FRAME) - 1
        );
        self.state = ReassemblyState::Accumulating {
            reading,
            total_cells: cell_count,
        };
        None
    }

    fn push_continuation(
        &mut self,
        frame: &[u8],
        mut reading: BmsReading,
        total_cells: u16,
    ) -> Option<BmsReading> {
        let Some(frame_no) = payload(frame).and_then(continuation_frame_no) else {
            log::debug!("Continuation frame too short: {} bytes", frame.len());
            self.state = ReassemblyState::Accumulating {
                reading,
                total_cells,
            };
            return None;
        };
        let total = usize::from(total_cells);
        let total_frames = total.div_ceil(CELLS_PER_FRAME);
        // frame #0 is the primary frame; a continuation claiming it would overwrite its cells
        if frame_no == 0 {
            log::debug!("Ignoring continuation frame numbered 0");
            self.state = ReassemblyState::Accumulating {
                reading,
                total_cells,
            };
            return None;
        }

        let start = usize::from(frame_no) * CELLS_PER_FRAME;
        let remaining = total.saturating_sub(start).min(CELLS_PER_FRAME);
        if remaining > 0 {
            match payload(frame).and_then(|p| decode_continuation_cells(p, remaining)) {
                Some(cells) => {
                    log::trace!("Frame #{frame_no} carries cells {}..{}", start + 1, start + remaining);
                    splice_cells(&mut reading.cell_voltages, start, cells);
                }
                None => {
                    log::debug!("Continuation frame #{frame_no} shorter than {remaining} cells");
                    self.state = ReassemblyState::Accumulating {
                        reading,
                        total_cells,
                    };
                    return None;
                }
            }
        }

        if usize::from(frame_no) + 1 == total_frames {
            if !reading.is_complete() {
                log::warn!(
                    "Reading completed with {} of {total} cell voltages",
                    reading.cell_voltages.len()
                );
            }
            return Some(reading);
        }
        self.state = ReassemblyState::Accumulating {
            reading,
            total_cells,
        };
        None
    }
}

/// Places `cells` at absolute index `start`, replacing what is already there.
fn splice_cells(voltages: &mut Vec<f32>, start: usize, cells: Vec<f32>) {
    if voltages.len() < start {
        log::debug!("Cells {}..{} not received yet", voltages.len() + 1, start);
        voltages.resize(start, 0.0);
    }
    let end = (start + cells.len()).min(voltages.len());
    voltages.splice(start..end, cells);
}
