//! A behavioral simulation of an open-drain 1-Wire line with DS18B20 slaves.
//!
//! [`SimPort`] implements the bit-bang [`Port`] against a virtual line and a
//! virtual 1 µs clock that advances by one tick per timer read, which is
//! exactly how the polling state machines measure time. The line is the
//! wired-AND of the master drive and every slave's pull, so multi-drop
//! behavior (presence pulses, search triplets, parasite detection) falls out
//! naturally.
//!
//! Slaves decode the master's signalling the same way a real part does: by
//! the width of the low pulses. A low of reset length re-arms every slave; a
//! short low is a read slot the addressed slave may answer by holding the
//! line down; anything in between is a write slot carrying a 1 or a 0.

use onewire_bitbang::{OneWireCrc, PinDirection, PinState, Port};
use std::cell::RefCell;
use std::rc::Rc;

/// Low pulses at least this long re-arm every slave (a reset).
const RESET_MIN_US: u64 = 400;
/// Low pulses up to this long are read slots, not data.
const READ_SLOT_MAX_US: u64 = 6;
/// Below this a write slot carries a 1, above a 0.
const WRITE_ONE_MAX_US: u64 = 36;
/// Presence pulse window relative to the reset release.
const PRESENCE_FROM_US: u64 = 20;
const PRESENCE_UNTIL_US: u64 = 140;
/// How long a slave holds the line down to answer a read slot with 0.
const OUTPUT_HOLD_US: u64 = 30;

const MATCH_ROM_CMD: u8 = 0x55;
const SKIP_ROM_CMD: u8 = 0xcc;
const READ_ROM_CMD: u8 = 0x33;
const SEARCH_CMD: u8 = 0xf0;
const ALARM_SEARCH_CMD: u8 = 0xec;
const CONVERT_CMD: u8 = 0x44;
const WRITE_SCRATCHPAD_CMD: u8 = 0x4e;
const READ_SCRATCHPAD_CMD: u8 = 0xbe;
const COPY_SCRATCHPAD_CMD: u8 = 0x48;
const RECALL_EEPROM_CMD: u8 = 0xb8;
const READ_POWER_SUPPLY_CMD: u8 = 0xb4;

/// Build a ROM from a family byte and a 48-bit serial, with a correct
/// trailing CRC byte.
pub fn rom_with_crc(family: u8, serial: u64) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[0] = family;
    bytes[1..7].copy_from_slice(&serial.to_le_bytes()[..6]);
    bytes[7] = OneWireCrc::checksum(&bytes[..7]);
    u64::from_le_bytes(bytes)
}

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    from: u64,
    until: u64,
}

impl Window {
    fn contains(&self, t: u64) -> bool {
        self.from <= t && t < self.until
    }
}

#[derive(Debug, Clone)]
enum Output {
    Bits { data: Vec<u8>, bits: usize, at: usize },
    RecallStatus { ready_at: u64 },
    PowerStatus { external: bool },
}

impl Output {
    fn bytes(data: &[u8]) -> Self {
        Output::Bits { data: data.to_vec(), bits: data.len() * 8, at: 0 }
    }

    /// Next bit to put on the line; an exhausted transmitter releases the
    /// line, which reads as ones.
    fn next_bit(&mut self, t: u64) -> bool {
        match self {
            Output::Bits { data, bits, at } => {
                if *at >= *bits {
                    true
                } else {
                    let bit = data[*at / 8] >> (*at % 8) & 1 != 0;
                    *at += 1;
                    bit
                }
            }
            Output::RecallStatus { ready_at } => t >= *ready_at,
            Output::PowerStatus { external } => *external,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchStep {
    IdBit,
    Complement,
    Direction,
}

#[derive(Debug, Clone)]
enum Mode {
    /// Deselected (or mid-round mismatch): dead until the next reset.
    WaitReset,
    /// Collecting the ROM command byte.
    RomCommand,
    /// Collecting an incoming MATCH ROM address.
    MatchRom,
    /// Selected, collecting a function command byte.
    Function,
    /// Collecting the three WRITE SCRATCHPAD payload bytes.
    ScratchpadWrite { count: u8 },
    /// Answering read slots from an output source.
    Transmit(Output),
    /// Taking part in a search round.
    Search { pos: u8, step: SearchStep },
}

/// One virtual DS18B20 on the simulated line.
#[derive(Debug, Clone)]
pub struct Slave {
    rom: u64,
    alarm: bool,
    parasite: bool,
    scratchpad: [u8; 9],
    eeprom: [u8; 3],
    recall_busy_us: u64,

    mode: Mode,
    presence: Window,
    hold: Window,
    in_bits: u64,
    in_count: u8,
}

impl Slave {
    /// A sensor with the given ROM, reading +85 °C (the power-on value) at
    /// default alarm/configuration registers.
    pub fn new(rom: u64) -> Self {
        let mut slave = Slave {
            rom,
            alarm: false,
            parasite: false,
            scratchpad: [0x50, 0x05, 0x4b, 0x46, 0x7f, 0xff, 0x0c, 0x10, 0],
            eeprom: [0x4b, 0x46, 0x7f],
            recall_busy_us: 3000,
            mode: Mode::WaitReset,
            presence: Window::default(),
            hold: Window::default(),
            in_bits: 0,
            in_count: 0,
        };
        slave.refresh_crc();
        slave
    }

    /// Mark the slave as having a pending alarm condition.
    pub fn with_alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }

    /// Power the slave parasitically off the data line.
    pub fn with_parasite_power(mut self, parasite: bool) -> Self {
        self.parasite = parasite;
        self
    }

    /// Preload the temperature registers, in °C.
    pub fn with_temperature(mut self, celsius: f32) -> Self {
        let raw = (celsius * 16.0) as i16;
        self.scratchpad[..2].copy_from_slice(&raw.to_le_bytes());
        self.refresh_crc();
        self
    }

    /// Preload the first eight scratchpad bytes; the CRC byte is computed.
    pub fn with_scratchpad(mut self, bytes: [u8; 8]) -> Self {
        self.scratchpad[..8].copy_from_slice(&bytes);
        self.refresh_crc();
        self
    }

    /// How long RECALL E² keeps the slave busy before it answers read slots
    /// with ones.
    pub fn with_recall_delay_us(mut self, us: u64) -> Self {
        self.recall_busy_us = us;
        self
    }

    fn refresh_crc(&mut self) {
        self.scratchpad[8] = OneWireCrc::checksum(&self.scratchpad[..8]);
    }

    fn rom_bit(&self, pos: u8) -> bool {
        self.rom >> pos & 1 != 0
    }

    fn pulls_low(&self, t: u64) -> bool {
        self.presence.contains(t) || self.hold.contains(t)
    }

    /// Put `bit` on the line for the read slot that just opened at `t`.
    fn answer(&mut self, t: u64, bit: bool) {
        if !bit {
            self.hold = Window { from: t, until: t + OUTPUT_HOLD_US };
        }
    }

    fn master_fall(&mut self, t: u64) {
        let mut mode = self.mode.clone();
        match &mut mode {
            Mode::Transmit(out) => {
                let bit = out.next_bit(t);
                self.answer(t, bit);
            }
            Mode::Search { pos, step } => match step {
                SearchStep::IdBit => {
                    let bit = self.rom_bit(*pos);
                    self.answer(t, bit);
                    *step = SearchStep::Complement;
                }
                SearchStep::Complement => {
                    let bit = !self.rom_bit(*pos);
                    self.answer(t, bit);
                    *step = SearchStep::Direction;
                }
                // The direction slot is decoded on the rising edge.
                SearchStep::Direction => {}
            },
            _ => {}
        }
        self.mode = mode;
    }

    fn master_rise(&mut self, t: u64, low_for: u64) {
        if low_for >= RESET_MIN_US {
            self.reset(t);
            return;
        }
        match self.mode.clone() {
            Mode::Search { pos, step: SearchStep::Direction } => {
                if low_for <= READ_SLOT_MAX_US {
                    return;
                }
                let master_bit = low_for <= WRITE_ONE_MAX_US;
                self.mode = if master_bit != self.rom_bit(pos) {
                    // Lost the round: stay quiet until the next reset.
                    Mode::WaitReset
                } else if pos == 63 {
                    // Survived the whole round; the master may follow up
                    // with a function command.
                    Mode::Function
                } else {
                    Mode::Search { pos: pos + 1, step: SearchStep::IdBit }
                };
            }
            Mode::RomCommand | Mode::MatchRom | Mode::Function
            | Mode::ScratchpadWrite { .. } => {
                if low_for <= READ_SLOT_MAX_US {
                    return;
                }
                self.feed_bit(t, low_for <= WRITE_ONE_MAX_US);
            }
            _ => {}
        }
    }

    fn reset(&mut self, t: u64) {
        self.presence = Window { from: t + PRESENCE_FROM_US, until: t + PRESENCE_UNTIL_US };
        self.hold = Window::default();
        self.mode = Mode::RomCommand;
        self.in_bits = 0;
        self.in_count = 0;
    }

    fn feed_bit(&mut self, t: u64, bit: bool) {
        self.in_bits |= (bit as u64) << self.in_count;
        self.in_count += 1;
        match self.mode.clone() {
            Mode::RomCommand => {
                if self.in_count == 8 {
                    let cmd = self.in_bits as u8;
                    self.in_bits = 0;
                    self.in_count = 0;
                    self.rom_command(cmd);
                }
            }
            Mode::MatchRom => {
                if self.in_count == 64 {
                    self.mode = if self.in_bits == self.rom {
                        Mode::Function
                    } else {
                        Mode::WaitReset
                    };
                    self.in_bits = 0;
                    self.in_count = 0;
                }
            }
            Mode::Function => {
                if self.in_count == 8 {
                    let cmd = self.in_bits as u8;
                    self.in_bits = 0;
                    self.in_count = 0;
                    self.function_command(cmd, t);
                }
            }
            Mode::ScratchpadWrite { count } => {
                if self.in_count == 8 {
                    self.scratchpad[2 + count as usize] = self.in_bits as u8;
                    self.in_bits = 0;
                    self.in_count = 0;
                    if count == 2 {
                        self.refresh_crc();
                        self.mode = Mode::WaitReset;
                    } else {
                        self.mode = Mode::ScratchpadWrite { count: count + 1 };
                    }
                }
            }
            _ => {}
        }
    }

    fn rom_command(&mut self, cmd: u8) {
        log::trace!("slave {:#018x}: rom command {cmd:#04x}", self.rom);
        self.mode = match cmd {
            SKIP_ROM_CMD => Mode::Function,
            MATCH_ROM_CMD => Mode::MatchRom,
            READ_ROM_CMD => Mode::Transmit(Output::bytes(&self.rom.to_le_bytes())),
            SEARCH_CMD => Mode::Search { pos: 0, step: SearchStep::IdBit },
            ALARM_SEARCH_CMD => {
                if self.alarm {
                    Mode::Search { pos: 0, step: SearchStep::IdBit }
                } else {
                    Mode::WaitReset
                }
            }
            _ => Mode::WaitReset,
        };
    }

    fn function_command(&mut self, cmd: u8, t: u64) {
        log::trace!("slave {:#018x}: function command {cmd:#04x}", self.rom);
        self.mode = match cmd {
            // Conversion result is whatever the scratchpad was seeded with.
            CONVERT_CMD => Mode::WaitReset,
            READ_SCRATCHPAD_CMD => Mode::Transmit(Output::bytes(&self.scratchpad)),
            WRITE_SCRATCHPAD_CMD => Mode::ScratchpadWrite { count: 0 },
            COPY_SCRATCHPAD_CMD => {
                self.eeprom.copy_from_slice(&self.scratchpad[2..5]);
                Mode::WaitReset
            }
            RECALL_EEPROM_CMD => {
                self.scratchpad[2..5].copy_from_slice(&self.eeprom);
                self.refresh_crc();
                Mode::Transmit(Output::RecallStatus { ready_at: t + self.recall_busy_us })
            }
            READ_POWER_SUPPLY_CMD => {
                Mode::Transmit(Output::PowerStatus { external: !self.parasite })
            }
            _ => Mode::WaitReset,
        };
    }
}

struct Inner {
    now: u64,
    timer_base: u64,
    master_dir: PinDirection,
    master_level: PinState,
    master_low: bool,
    fell_at: u64,
    pin_ops: u64,
    slaves: Vec<Slave>,
}

impl Inner {
    fn apply_master(&mut self) {
        let low = self.master_dir == PinDirection::Output && self.master_level == PinState::Low;
        if low == self.master_low {
            return;
        }
        self.master_low = low;
        let t = self.now;
        if low {
            self.fell_at = t;
            for slave in &mut self.slaves {
                slave.master_fall(t);
            }
        } else {
            let low_for = t - self.fell_at;
            for slave in &mut self.slaves {
                slave.master_rise(t, low_for);
            }
        }
    }

    fn line_low(&self) -> bool {
        self.master_low || self.slaves.iter().any(|slave| slave.pulls_low(self.now))
    }
}

/// Handle on a simulated bus; clones of its [`SimPort`] and the handle share
/// the same line, clock and slaves.
pub struct SimBus {
    inner: Rc<RefCell<Inner>>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    /// A bus with no slaves attached.
    pub fn new() -> Self {
        SimBus {
            inner: Rc::new(RefCell::new(Inner {
                now: 0,
                timer_base: 0,
                master_dir: PinDirection::Input,
                master_level: PinState::High,
                master_low: false,
                fell_at: 0,
                pin_ops: 0,
                slaves: Vec::new(),
            })),
        }
    }

    /// The port to hand to `OneWireBus::new`.
    pub fn port(&self) -> SimPort {
        SimPort { inner: Rc::clone(&self.inner) }
    }

    /// Attach a slave; returns its index for the inspection accessors.
    pub fn add_slave(&self, slave: Slave) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.slaves.push(slave);
        inner.slaves.len() - 1
    }

    /// Virtual microseconds since the bus was created.
    pub fn elapsed_us(&self) -> u64 {
        self.inner.borrow().now
    }

    /// Total pin operations (direction changes, writes, samples) the master
    /// has issued.
    pub fn pin_ops(&self) -> u64 {
        self.inner.borrow().pin_ops
    }

    /// Scratchpad contents of slave `idx`.
    pub fn slave_scratchpad(&self, idx: usize) -> [u8; 9] {
        self.inner.borrow().slaves[idx].scratchpad
    }

    /// EEPROM contents of slave `idx`.
    pub fn slave_eeprom(&self, idx: usize) -> [u8; 3] {
        self.inner.borrow().slaves[idx].eeprom
    }
}

/// The [`Port`] implementation over a [`SimBus`].
pub struct SimPort {
    inner: Rc<RefCell<Inner>>,
}

impl Port for SimPort {
    fn set_pin_direction(&mut self, dir: PinDirection) {
        let mut inner = self.inner.borrow_mut();
        inner.pin_ops += 1;
        inner.master_dir = dir;
        inner.apply_master();
    }

    fn write_pin(&mut self, state: PinState) {
        let mut inner = self.inner.borrow_mut();
        inner.pin_ops += 1;
        inner.master_level = state;
        inner.apply_master();
    }

    fn read_pin(&mut self) -> PinState {
        let mut inner = self.inner.borrow_mut();
        inner.pin_ops += 1;
        if inner.line_low() { PinState::Low } else { PinState::High }
    }

    fn restart_timer(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.timer_base = inner.now;
    }

    fn read_timer(&mut self) -> u16 {
        let mut inner = self.inner.borrow_mut();
        let elapsed = inner.now - inner.timer_base;
        // The virtual clock ticks once per poll; that is the only way time
        // passes, so every wait loop terminates.
        inner.now += 1;
        elapsed as u16
    }
}
