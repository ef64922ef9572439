use crate::consts::*;
use crate::port::{PinDirection, PinState, Port};
#[cfg(feature = "search")]
use crate::search::{SearchCallback, SearchPhase, SearchState};

/// Outcome of one [`OneWireBus::process`] tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneWireResult {
    /// The bus is idle; the tick did nothing.
    NothingToDo,
    /// An operation is in progress; keep ticking.
    Working,
    /// The pending operation just completed; the bus is idle again.
    Success,
    /// Reserved terminal failure. The link machine never produces it (a
    /// silent bus simply reads zeros); upper layers may still consume it.
    Failed,
}

/// A request was issued while another operation was still in progress. The
/// bus state is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Invoked during reset when a presence pulse is sampled. Receives the bus
/// id, so one callback can serve several buses.
pub type PresenceCallback = fn(bus_id: u8);

/// Byte/bit cursors over the transfer buffer. `bit_len` is 8 for ordinary
/// byte I/O; the search machinery narrows it to 1 or 2 for its direction and
/// discrepancy sub-transfers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Io {
    pub(crate) len: u8,
    pub(crate) bit_len: u8,
    pub(crate) byte_idx: u8,
    pub(crate) bit_idx: u8,
}

impl Default for Io {
    fn default() -> Self {
        Io { len: 0, bit_len: 8, byte_idx: 0, bit_idx: 0 }
    }
}

impl Io {
    pub(crate) fn bytes(len: u8) -> Self {
        Io { len, ..Io::default() }
    }

    #[cfg(feature = "search")]
    pub(crate) fn bits(bit_len: u8) -> Self {
        Io { len: 1, bit_len, byte_idx: 0, bit_idx: 0 }
    }

    /// Step to the next bit. Returns true when the whole transfer is done;
    /// the cursors are then back at zero.
    fn advance(&mut self) -> bool {
        self.bit_idx += 1;
        if self.bit_idx >= self.bit_len {
            self.bit_idx = 0;
            self.byte_idx += 1;
            if self.byte_idx >= self.len {
                self.byte_idx = 0;
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPhase {
    DriveLow,
    ResetHold,
    PresenceSample,
    SlotTail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritePhase {
    SlotBegin,
    OneHold,
    OneRelease,
    ZeroHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadPhase {
    Prepare,
    SlotBegin,
    Sample,
    Recovery,
}

/// Active operation, tagged with the sub-state that belongs to it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum State {
    Idle,
    Starting(StartPhase),
    Writing(WritePhase),
    Reading(ReadPhase),
    #[cfg(feature = "search")]
    Searching(SearchPhase),
    #[cfg(feature = "search")]
    SearchingAlarm(SearchPhase),
}

/// One bit-banged 1-Wire bus master.
///
/// The bus is a cooperative state machine: request an operation with
/// [`start`](OneWireBus::start), [`write`](OneWireBus::write),
/// [`read`](OneWireBus::read) or the search methods, then call
/// [`process`](OneWireBus::process) from the host loop until it reports
/// [`OneWireResult::Success`]. Each tick performs at most one pin operation
/// and one timer operation and returns immediately.
///
/// Data travels through the buffer passed to `process`: the caller must hand
/// in the *same* buffer on every tick of one operation. Writes only inspect
/// it; reads OR sampled bits into it, so a read buffer must be
/// zero-initialised by the caller. The buffer is never stored inside the
/// bus, which is what makes the machine resumable without borrowing across
/// ticks.
pub struct OneWireBus<P: Port> {
    pub(crate) port: P,
    pub(crate) id: u8,
    pub(crate) state: State,
    pub(crate) io: Io,
    pub(crate) on_presence: Option<PresenceCallback>,
    #[cfg(feature = "search")]
    pub(crate) search: SearchState,
    #[cfg(feature = "search")]
    pub(crate) on_search_done: Option<SearchCallback>,
}

impl<P: Port> OneWireBus<P> {
    /// Create a bus over the given port. `id` is an opaque tag passed to the
    /// callbacks so one callback can route between several buses.
    pub fn new(port: P, id: u8) -> Self {
        OneWireBus {
            port,
            id,
            state: State::Idle,
            io: Io::default(),
            on_presence: None,
            #[cfg(feature = "search")]
            search: SearchState::default(),
            #[cfg(feature = "search")]
            on_search_done: None,
        }
    }

    /// Register a callback fired when a reset samples a presence pulse.
    pub fn with_presence_callback(mut self, cb: PresenceCallback) -> Self {
        self.on_presence = Some(cb);
        self
    }

    /// The id given at construction.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Shared access to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Exclusive access to the underlying port. While an operation is in
    /// progress the pin and timer belong to the bus; don't disturb them.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// True when no operation is in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Restart the port's 1 µs counter. Exposed so upper layers can reuse
    /// the bus timer for their own delay accounting between link operations.
    pub fn restart_timer(&mut self) {
        self.port.restart_timer();
    }

    /// Read the port's 1 µs counter.
    pub fn read_timer(&mut self) -> u16 {
        self.port.read_timer()
    }

    /// Request a reset/presence sequence.
    pub fn start(&mut self) -> Result<(), Busy> {
        self.ensure_idle()?;
        self.state = State::Starting(StartPhase::DriveLow);
        Ok(())
    }

    /// Request a write of `len` bytes, LSB first per byte. The data is taken
    /// from the buffer passed to each subsequent `process` tick.
    pub fn write(&mut self, len: u8) -> Result<(), Busy> {
        self.ensure_idle()?;
        self.io = Io::bytes(len);
        self.state = State::Writing(WritePhase::SlotBegin);
        Ok(())
    }

    /// Request a read of `len` bytes into the buffer passed to each
    /// subsequent `process` tick. Sampled bits are ORed in, so the caller
    /// must clear the buffer first.
    pub fn read(&mut self, len: u8) -> Result<(), Busy> {
        self.ensure_idle()?;
        self.io = Io::bytes(len);
        self.state = State::Reading(ReadPhase::Prepare);
        Ok(())
    }

    /// Drive the state machine one step.
    ///
    /// # Arguments
    /// * `buf` - The transfer buffer of the pending operation. It must be the
    ///   same buffer on every tick until the operation terminates; reset and
    ///   search ticks ignore it.
    ///
    /// # Returns
    /// [`OneWireResult::NothingToDo`] on an idle bus,
    /// [`OneWireResult::Working`] while the operation runs, and
    /// [`OneWireResult::Success`] exactly once when it completes.
    pub fn process(&mut self, buf: &mut [u8]) -> OneWireResult {
        let mut state = self.state;
        let res = match &mut state {
            State::Idle => return OneWireResult::NothingToDo,
            State::Starting(phase) => self.step_start(phase),
            State::Writing(phase) => self.step_write(phase, buf),
            State::Reading(phase) => self.step_read(phase, buf),
            #[cfg(feature = "search")]
            State::Searching(phase) => self.step_search(phase, false),
            #[cfg(feature = "search")]
            State::SearchingAlarm(phase) => self.step_search(phase, true),
        };
        self.state = if res == OneWireResult::Success { State::Idle } else { state };
        res
    }

    /// Tick until the pending operation terminates. Blocking convenience for
    /// hosts without anything else to schedule; misconfigured ports make
    /// this spin forever, exactly like polling `process` would.
    pub fn wait(&mut self, buf: &mut [u8]) {
        while self.process(buf) == OneWireResult::Working {}
    }

    pub(crate) fn ensure_idle(&self) -> Result<(), Busy> {
        if self.is_idle() { Ok(()) } else { Err(Busy) }
    }

    fn timer_passed(&mut self, threshold: u16) -> bool {
        self.port.read_timer() >= threshold
    }

    pub(crate) fn step_start(&mut self, phase: &mut StartPhase) -> OneWireResult {
        match phase {
            StartPhase::DriveLow => {
                self.port.set_pin_direction(PinDirection::Output);
                self.port.write_pin(PinState::Low);
                self.port.restart_timer();
                *phase = StartPhase::ResetHold;
            }
            StartPhase::ResetHold => {
                if self.timer_passed(RESET_PULSE_US) {
                    self.port.set_pin_direction(PinDirection::Input);
                    self.port.restart_timer();
                    *phase = StartPhase::PresenceSample;
                }
            }
            StartPhase::PresenceSample => {
                if self.timer_passed(PRESENCE_SAMPLE_US) {
                    if self.port.read_pin() == PinState::Low {
                        if let Some(cb) = self.on_presence {
                            cb(self.id);
                        }
                    }
                    self.port.restart_timer();
                    *phase = StartPhase::SlotTail;
                }
            }
            StartPhase::SlotTail => {
                if self.timer_passed(RESET_TAIL_US) {
                    *phase = StartPhase::DriveLow;
                    return OneWireResult::Success;
                }
            }
        }
        OneWireResult::Working
    }

    pub(crate) fn step_write(&mut self, phase: &mut WritePhase, buf: &[u8]) -> OneWireResult {
        match phase {
            WritePhase::SlotBegin => {
                let data = buf.get(self.io.byte_idx as usize).copied().unwrap_or(0);
                let bit = data & (1 << self.io.bit_idx) != 0;
                self.port.write_pin(PinState::Low);
                self.port.set_pin_direction(PinDirection::Output);
                self.port.restart_timer();
                *phase = if bit { WritePhase::OneHold } else { WritePhase::ZeroHold };
            }
            WritePhase::OneHold => {
                if self.timer_passed(WRITE_ONE_LOW_US) {
                    self.port.set_pin_direction(PinDirection::Input);
                    self.port.restart_timer();
                    *phase = WritePhase::OneRelease;
                }
            }
            WritePhase::OneRelease => {
                if self.timer_passed(WRITE_ONE_RELEASE_US) {
                    *phase = WritePhase::SlotBegin;
                    if self.io.advance() {
                        return OneWireResult::Success;
                    }
                }
            }
            WritePhase::ZeroHold => {
                // The release doubles as the recovery gap for a zero slot.
                if self.timer_passed(WRITE_ZERO_LOW_US) {
                    self.port.set_pin_direction(PinDirection::Input);
                    *phase = WritePhase::SlotBegin;
                    if self.io.advance() {
                        return OneWireResult::Success;
                    }
                }
            }
        }
        OneWireResult::Working
    }

    pub(crate) fn step_read(&mut self, phase: &mut ReadPhase, buf: &mut [u8]) -> OneWireResult {
        match phase {
            ReadPhase::Prepare => {
                self.port.set_pin_direction(PinDirection::Input);
                self.port.restart_timer();
                *phase = ReadPhase::SlotBegin;
            }
            ReadPhase::SlotBegin => {
                if self.timer_passed(READ_SETUP_US) {
                    self.port.write_pin(PinState::Low);
                    self.port.set_pin_direction(PinDirection::Output);
                    self.port.restart_timer();
                    *phase = ReadPhase::Sample;
                }
            }
            ReadPhase::Sample => {
                if self.timer_passed(READ_LOW_US) {
                    self.port.set_pin_direction(PinDirection::Input);
                    let bit = self.port.read_pin() == PinState::High;
                    if let Some(byte) = buf.get_mut(self.io.byte_idx as usize) {
                        *byte |= (bit as u8) << self.io.bit_idx;
                    }
                    if self.io.advance() {
                        *phase = ReadPhase::Prepare;
                        return OneWireResult::Success;
                    }
                    self.port.restart_timer();
                    *phase = ReadPhase::Recovery;
                }
            }
            ReadPhase::Recovery => {
                if self.timer_passed(READ_SLOT_US) {
                    *phase = ReadPhase::SlotBegin;
                }
            }
        }
        OneWireResult::Working
    }
}
