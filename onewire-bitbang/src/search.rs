//! Maxim ROM search, run as a sub-machine of the bus state machine.
//!
//! One request enumerates one device: the bus resets, issues the (alarm)
//! search command, then walks all 64 ROM bit positions reading the
//! bit/complement pair and writing the chosen direction back. A completed
//! round reports `Success`; the caller re-invokes
//! [`OneWireBus::search`] to fetch the next device until
//! [`OneWireBus::search_exhausted`] turns true.

use crate::bus::{Busy, Io, OneWireBus, OneWireResult, ReadPhase, StartPhase, State, WritePhase};
use crate::consts::{ONEWIRE_CONDITIONAL_SEARCH_CMD, ONEWIRE_SEARCH_CMD};
use crate::port::Port;

/// Invoked when a search round completes with a discovered ROM. Receives the
/// bus id and the 64-bit ROM, family byte in the low bits.
pub type SearchCallback = fn(bus_id: u8, rom: u64);

#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchPhase {
    Reset(StartPhase),
    WriteCommand(WritePhase),
    ReadBits(ReadPhase),
    WriteDirection(WritePhase),
}

impl SearchPhase {
    fn begin() -> Self {
        SearchPhase::Reset(StartPhase::DriveLow)
    }
}

/// Enumeration bookkeeping. `last_discrepancy` is a bit mask of positions
/// where the previous rounds chose 0 and the 1-subtree is still unexplored;
/// it reaching zero at the end of a round is the exhaustion signal.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SearchState {
    pub(crate) address: u64,
    pub(crate) bit_mask: u64,
    pub(crate) last_discrepancy: u64,
    /// 1- or 2-bit I/O window shared with the nested read/write steps, and
    /// the command byte before them.
    pub(crate) scratch: u8,
    /// A round ended with branch points pending, so the next `search` call
    /// continues this enumeration instead of starting over.
    pub(crate) resume: bool,
    pub(crate) target_family: Option<u8>,
    pub(crate) found: Option<u64>,
}

impl<P: Port> OneWireBus<P> {
    /// Register a callback fired once per discovered ROM.
    pub fn with_search_callback(mut self, cb: SearchCallback) -> Self {
        self.on_search_done = Some(cb);
        self
    }

    /// Request one search round. `alarm` restricts the round to devices in
    /// alarm state.
    ///
    /// The first call starts a fresh enumeration; after a round that found a
    /// device with branch points remaining, the next call continues where it
    /// left off. Once [`search_exhausted`](OneWireBus::search_exhausted)
    /// reports true (or after [`abort_search`](OneWireBus::abort_search)), a
    /// new call starts over.
    pub fn search(&mut self, alarm: bool) -> Result<(), Busy> {
        self.ensure_idle()?;
        if !self.search.resume {
            self.search.last_discrepancy = 0;
            self.search.target_family = None;
        }
        self.search.found = None;
        self.state = if alarm {
            State::SearchingAlarm(SearchPhase::begin())
        } else {
            State::Searching(SearchPhase::begin())
        };
        Ok(())
    }

    /// Request one search round restricted to a device family. Rounds only
    /// descend into the subtree whose low byte matches `family`; when the
    /// enumeration would leave it, the search reports exhausted instead.
    pub fn search_target(&mut self, alarm: bool, family: u8) -> Result<(), Busy> {
        self.ensure_idle()?;
        if !self.search.resume {
            self.search.last_discrepancy = 0;
        }
        self.search.target_family = Some(family);
        self.search.found = None;
        self.state = if alarm {
            State::SearchingAlarm(SearchPhase::begin())
        } else {
            State::Searching(SearchPhase::begin())
        };
        Ok(())
    }

    /// End the enumeration. A round in flight is dropped on the spot; a
    /// pending continuation is forgotten, so the next `search` starts fresh.
    pub fn abort_search(&mut self) {
        if matches!(self.state, State::Searching(_) | State::SearchingAlarm(_)) {
            self.state = State::Idle;
        }
        self.search.resume = false;
    }

    /// ROM discovered by the last completed round, if it produced one.
    pub fn found_rom(&self) -> Option<u64> {
        self.search.found
    }

    /// True once the enumeration has visited every device (no branch points
    /// left). Meaningful after a round reports `Success`.
    pub fn search_exhausted(&self) -> bool {
        self.search.last_discrepancy == 0
    }

    pub(crate) fn step_search(&mut self, phase: &mut SearchPhase, alarm: bool) -> OneWireResult {
        match phase {
            SearchPhase::Reset(sp) => {
                if self.step_start(sp) == OneWireResult::Success {
                    self.search.address = 0;
                    self.search.bit_mask = 1;
                    self.search.scratch = if alarm {
                        ONEWIRE_CONDITIONAL_SEARCH_CMD
                    } else {
                        ONEWIRE_SEARCH_CMD
                    };
                    self.io = Io::bytes(1);
                    *phase = SearchPhase::WriteCommand(WritePhase::SlotBegin);
                }
            }
            SearchPhase::WriteCommand(wp) => {
                let cmd = [self.search.scratch];
                if self.step_write(wp, &cmd) == OneWireResult::Success {
                    self.search.scratch = 0;
                    self.io = Io::bits(2);
                    *phase = SearchPhase::ReadBits(ReadPhase::Prepare);
                }
            }
            SearchPhase::ReadBits(rp) => {
                let mut window = [self.search.scratch];
                let res = self.step_read(rp, &mut window);
                self.search.scratch = window[0];
                if res == OneWireResult::Success {
                    if self.search.scratch & 0x03 == 0x03 {
                        // Nobody answered this bit position; the round ends
                        // without an address and the caller discards it.
                        self.search.resume = false;
                        self.search.found = None;
                        return OneWireResult::Success;
                    }
                    let bit = match self.search.scratch & 0x03 {
                        0b01 => true,
                        0b10 => false,
                        _ => self.resolve_discrepancy(),
                    };
                    if bit {
                        self.search.address |= self.search.bit_mask;
                    }
                    self.search.scratch = bit as u8;
                    self.io = Io::bits(1);
                    *phase = SearchPhase::WriteDirection(WritePhase::SlotBegin);
                }
            }
            SearchPhase::WriteDirection(wp) => {
                let dir = [self.search.scratch];
                if self.step_write(wp, &dir) == OneWireResult::Success {
                    self.search.bit_mask <<= 1;
                    if self.search.bit_mask != 0 {
                        self.search.scratch = 0;
                        self.io = Io::bits(2);
                        *phase = SearchPhase::ReadBits(ReadPhase::Prepare);
                    } else {
                        // Bit 63 written: the round is complete.
                        return self.finish_round();
                    }
                }
            }
        }
        OneWireResult::Working
    }

    /// Both devices answered 0: pick a direction. Below bit 8 of a targeted
    /// search the family code dictates it outright; otherwise follow the
    /// depth-first backtracking order over `last_discrepancy`.
    fn resolve_discrepancy(&mut self) -> bool {
        let search = &mut self.search;
        if let Some(family) = search.target_family {
            if search.bit_mask < 1 << 8 {
                return family as u64 & search.bit_mask != 0;
            }
        }
        if search.last_discrepancy >= search.bit_mask << 1 {
            // A deeper branch point is still pending: retrace the previous
            // round's path at this level.
            search.last_discrepancy & search.bit_mask == 0
        } else {
            // This is the deepest level: take the 0 branch first and record
            // the position, or flip to 1 and clear it on the revisit.
            let bit = search.last_discrepancy & search.bit_mask != 0;
            search.last_discrepancy ^= search.bit_mask;
            bit
        }
    }

    fn finish_round(&mut self) -> OneWireResult {
        self.search.bit_mask = 1;
        if let Some(family) = self.search.target_family {
            if self.search.address as u8 != family {
                // Crossed out of the target family's subtree: report the
                // enumeration exhausted without surfacing the foreign ROM.
                self.search.last_discrepancy = 0;
                self.search.resume = false;
                self.search.found = None;
                return OneWireResult::Success;
            }
        }
        self.search.found = Some(self.search.address);
        if let Some(cb) = self.on_search_done {
            cb(self.id, self.search.address);
        }
        self.search.resume = self.search.last_discrepancy != 0;
        OneWireResult::Success
    }
}
