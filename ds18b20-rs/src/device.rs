use crate::{BUFFER_SIZE, CallbackFlag, Ds18b20State, ROM_NONE, ReadMode, Resolution, Temperature};
use onewire_bitbang::{Busy, OneWireBus, OneWireCrc, OneWireResult, Port};

// ROM commands.
const MATCH_ROM_CMD: u8 = 0x55;
const SKIP_ROM_CMD: u8 = 0xcc;
const READ_ROM_CMD: u8 = 0x33;

// Function commands.
const CONVERT_CMD: u8 = 0x44;
const WRITE_SCRATCHPAD_CMD: u8 = 0x4e;
const READ_SCRATCHPAD_CMD: u8 = 0xbe;
const COPY_SCRATCHPAD_CMD: u8 = 0x48;
const RECALL_EEPROM_CMD: u8 = 0xb8;
const READ_POWER_SUPPLY_CMD: u8 = 0xb4;

/// Recovery gap between the presence pulse and the first command byte.
const COMMAND_GAP_US: u32 = 1000;

/// EEPROM write time after COPY SCRATCHPAD; the datasheet asks for 10 ms,
/// budget double.
const COPY_WAIT_US: u32 = 20_000;

/// Fired exactly once per finished transaction with the device, the
/// operation tag, the ROM the operation addressed ([`ROM_NONE`] for SKIP-ROM
/// transactions) and a completion flag (only the power-supply probe reports
/// anything but [`CallbackFlag::Normal`]).
pub type Ds18b20Callback<P> = fn(&Ds18b20<P>, Ds18b20State, u64, CallbackFlag);

#[derive(Debug, Clone, Copy)]
enum ConvertPhase {
    Begin,
    Reset,
    CommandDelay,
    CommandWrite,
    WaitConversion,
}

/// Shared by the scratchpad read and write transactions; the write never
/// reaches `Reading`.
#[derive(Debug, Clone, Copy)]
enum ScratchpadPhase {
    Begin,
    Reset,
    CommandDelay,
    CommandWrite,
    Reading,
}

#[derive(Debug, Clone, Copy)]
enum RomPhase {
    Reset,
    CommandDelay,
    CommandWrite,
    Reading,
}

#[derive(Debug, Clone, Copy)]
enum CopyPhase {
    Reset,
    CommandDelay,
    CommandWrite,
    Wait,
}

#[derive(Debug, Clone, Copy)]
enum RecallPhase {
    Reset,
    CommandDelay,
    CommandWrite,
    Poll,
}

#[derive(Debug, Clone, Copy)]
enum PowerPhase {
    Reset,
    CommandDelay,
    CommandWrite,
    Reading,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Convert(ConvertPhase),
    ReadScratchpad(ScratchpadPhase),
    WriteScratchpad(ScratchpadPhase),
    ReadRom(RomPhase),
    CopyScratchpad(CopyPhase),
    RecallEeprom(RecallPhase),
    ReadPowerSupply(PowerPhase),
    Finished,
}

/// One DS18B20 transaction session over a borrowed bus.
///
/// The device borrows the bus for as long as the session lives; several
/// devices share one bus by scoping their borrows sequentially, never
/// concurrently. Request a transaction, then call
/// [`process`](Ds18b20::process) from the host loop (or block on
/// [`wait`](Ds18b20::wait)) until it reports
/// [`Ds18b20State::Finished`]. Requests made while a transaction is in
/// flight are refused with [`Busy`] and leave all state untouched.
pub struct Ds18b20<'bus, P: Port> {
    bus: &'bus mut OneWireBus<P>,
    on_finished: Option<Ds18b20Callback<P>>,
    current_rom: u64,
    resolution: Resolution,
    read_mode: ReadMode,
    state: State,
    /// Prepared write length, carried from the request into the write phase.
    datalen: u8,
    buffer: [u8; BUFFER_SIZE],
    /// One-byte side channel for the EEPROM-recall ready poll and the
    /// power-supply probe.
    temp: u8,
    /// Millisecond accumulator extending the 16-bit bus timer across the
    /// conversion and EEPROM waits. Per device, so two devices on two buses
    /// never share it.
    elapsed_ms: u32,
}

impl<'bus, P: Port> Ds18b20<'bus, P> {
    /// Create a session over `bus`.
    pub fn new(bus: &'bus mut OneWireBus<P>) -> Self {
        Ds18b20 {
            bus,
            on_finished: None,
            current_rom: ROM_NONE,
            resolution: Resolution::default(),
            read_mode: ReadMode::default(),
            state: State::Idle,
            datalen: 0,
            buffer: [0; BUFFER_SIZE],
            temp: 0,
            elapsed_ms: 0,
        }
    }

    /// Register the completion callback.
    pub fn with_callback(mut self, cb: Ds18b20Callback<P>) -> Self {
        self.on_finished = Some(cb);
        self
    }

    /// Set the resolution the conversion wait is budgeted for. This only
    /// affects timing; use [`set_resolution`](Ds18b20::set_resolution) to
    /// reconfigure the sensor itself.
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set how many scratchpad bytes a read fetches.
    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }

    /// See [`with_read_mode`](Ds18b20::with_read_mode).
    pub fn set_read_mode(&mut self, read_mode: ReadMode) {
        self.read_mode = read_mode;
    }

    /// Resolution the conversion wait is budgeted for.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Current scratchpad read depth.
    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    /// Current driver state.
    pub fn state(&self) -> Ds18b20State {
        match self.state {
            State::Idle => Ds18b20State::Idle,
            State::Convert(_) => Ds18b20State::Convert,
            State::ReadScratchpad(_) => Ds18b20State::ReadScratchpad,
            State::WriteScratchpad(_) => Ds18b20State::WriteScratchpad,
            State::ReadRom(_) => Ds18b20State::ReadRom,
            State::CopyScratchpad(_) => Ds18b20State::CopyScratchpad,
            State::RecallEeprom(_) => Ds18b20State::RecallEeprom,
            State::ReadPowerSupply(_) => Ds18b20State::ReadPowerSupply,
            State::Finished => Ds18b20State::Finished,
        }
    }

    /// The I/O buffer. After a finished read it holds the fetched scratchpad
    /// or ROM bytes from offset zero.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// ROM fetched by the last READ ROM transaction, family byte in the low
    /// bits.
    pub fn last_rom(&self) -> u64 {
        let mut rom = [0u8; 8];
        rom.copy_from_slice(&self.buffer[..8]);
        u64::from_le_bytes(rom)
    }

    /// Temperature from the scratchpad bytes of the last read.
    pub fn temperature(&self) -> Temperature {
        crate::decode_temperature(self.buffer[0], self.buffer[1])
    }

    /// Check the scratchpad CRC of the last read. Only a
    /// [`ReadMode::Full`] read carries the CRC byte; shorter reads succeed
    /// vacuously.
    pub fn verify_crc(&self) -> bool {
        self.read_mode != ReadMode::Full || OneWireCrc::validate(&self.buffer[..9])
    }

    /// Request a temperature conversion. `rom` selects one sensor, or
    /// [`ROM_NONE`] to convert on every device at once.
    pub fn begin_conversion(&mut self, rom: u64) -> Result<(), Busy> {
        self.accept()?;
        self.current_rom = rom;
        self.state = State::Convert(ConvertPhase::Begin);
        Ok(())
    }

    /// Request a scratchpad read of [`read_mode`](Ds18b20::read_mode) bytes.
    pub fn read_scratchpad(&mut self, rom: u64) -> Result<(), Busy> {
        self.accept()?;
        self.current_rom = rom;
        self.state = State::ReadScratchpad(ScratchpadPhase::Begin);
        Ok(())
    }

    /// Request a scratchpad write of up to three bytes: user byte 1, user
    /// byte 2, configuration register.
    pub fn write_scratchpad(&mut self, bytes: &[u8], rom: u64) -> Result<(), Busy> {
        self.accept()?;
        self.current_rom = rom;
        self.datalen = self.prepare_buffer(WRITE_SCRATCHPAD_CMD, rom, bytes);
        self.state = State::WriteScratchpad(ScratchpadPhase::Begin);
        Ok(())
    }

    /// Request the 64-bit ROM. Only usable with a single device on the bus;
    /// READ ROM has no addressing prefix.
    pub fn request_read_rom(&mut self) -> Result<(), Busy> {
        self.accept()?;
        self.state = State::ReadRom(RomPhase::Reset);
        Ok(())
    }

    /// Request a copy of the scratchpad user/configuration bytes into
    /// EEPROM. Completion waits out the EEPROM write time.
    pub fn copy_scratchpad(&mut self, rom: u64) -> Result<(), Busy> {
        self.accept()?;
        self.current_rom = rom;
        self.state = State::CopyScratchpad(CopyPhase::Reset);
        Ok(())
    }

    /// Request a reload of the EEPROM bytes into the scratchpad. Completion
    /// polls the bus until the sensor signals ready.
    pub fn recall_eeprom(&mut self, rom: u64) -> Result<(), Busy> {
        self.accept()?;
        self.current_rom = rom;
        self.state = State::RecallEeprom(RecallPhase::Reset);
        Ok(())
    }

    /// Write resolution and user bytes to the scratchpad and budget future
    /// conversions for the new resolution.
    pub fn set_resolution(
        &mut self,
        resolution: Resolution,
        userbytes: [u8; 2],
        rom: u64,
    ) -> Result<(), Busy> {
        self.accept()?;
        self.resolution = resolution;
        self.write_scratchpad(&[userbytes[0], userbytes[1], resolution as u8], rom)
    }

    /// Ask every device at once whether it runs on parasite power; the
    /// completion callback reports [`CallbackFlag::Parasitic`] if any does.
    pub fn read_power_supply(&mut self) -> Result<(), Busy> {
        self.accept()?;
        self.state = State::ReadPowerSupply(PowerPhase::Reset);
        Ok(())
    }

    /// Drive the pending transaction one step.
    pub fn process(&mut self) -> Ds18b20State {
        let state = self.state;
        self.state = match state {
            State::Idle | State::Finished => state,
            State::Convert(phase) => self.step_convert(phase),
            State::ReadScratchpad(phase) => self.step_read_scratchpad(phase),
            State::WriteScratchpad(phase) => self.step_write_scratchpad(phase),
            State::ReadRom(phase) => self.step_read_rom(phase),
            State::CopyScratchpad(phase) => self.step_copy_scratchpad(phase),
            State::RecallEeprom(phase) => self.step_recall_eeprom(phase),
            State::ReadPowerSupply(phase) => self.step_read_power_supply(phase),
        };
        self.state()
    }

    /// Tick until the pending transaction finishes. Blocking convenience.
    pub fn wait(&mut self) -> Ds18b20State {
        loop {
            match self.process() {
                Ds18b20State::Idle | Ds18b20State::Finished => break self.state(),
                _ => {}
            }
        }
    }

    fn accept(&self) -> Result<(), Busy> {
        match self.state {
            State::Idle | State::Finished => Ok(()),
            _ => Err(Busy),
        }
    }

    fn step_convert(&mut self, phase: ConvertPhase) -> State {
        match phase {
            ConvertPhase::Begin => {
                if self.bus.start().is_ok() {
                    return State::Convert(ConvertPhase::Reset);
                }
                State::Convert(ConvertPhase::Begin)
            }
            ConvertPhase::Reset => match self.bus.process(&mut self.buffer) {
                OneWireResult::Success => {
                    self.arm_delay();
                    State::Convert(ConvertPhase::CommandDelay)
                }
                OneWireResult::Failed => State::Convert(ConvertPhase::Begin),
                _ => State::Convert(ConvertPhase::Reset),
            },
            ConvertPhase::CommandDelay => {
                if self.timer_passed(COMMAND_GAP_US)
                    && self.write_command(CONVERT_CMD, self.current_rom, &[]).is_ok()
                {
                    return State::Convert(ConvertPhase::CommandWrite);
                }
                State::Convert(ConvertPhase::CommandDelay)
            }
            ConvertPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.arm_delay();
                    return State::Convert(ConvertPhase::WaitConversion);
                }
                State::Convert(ConvertPhase::CommandWrite)
            }
            ConvertPhase::WaitConversion => {
                if self.timer_passed(self.resolution.conversion_time_us()) {
                    return self.finish(Ds18b20State::Convert, ROM_NONE, CallbackFlag::Normal);
                }
                State::Convert(ConvertPhase::WaitConversion)
            }
        }
    }

    fn step_read_scratchpad(&mut self, phase: ScratchpadPhase) -> State {
        match phase {
            ScratchpadPhase::Begin => {
                if self.bus.start().is_ok() {
                    return State::ReadScratchpad(ScratchpadPhase::Reset);
                }
                State::ReadScratchpad(ScratchpadPhase::Begin)
            }
            ScratchpadPhase::Reset => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.arm_delay();
                    return State::ReadScratchpad(ScratchpadPhase::CommandDelay);
                }
                State::ReadScratchpad(ScratchpadPhase::Reset)
            }
            ScratchpadPhase::CommandDelay => {
                if self.timer_passed(COMMAND_GAP_US)
                    && self
                        .write_command(READ_SCRATCHPAD_CMD, self.current_rom, &[])
                        .is_ok()
                {
                    return State::ReadScratchpad(ScratchpadPhase::CommandWrite);
                }
                State::ReadScratchpad(ScratchpadPhase::CommandDelay)
            }
            ScratchpadPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.clear_buffer();
                    let _ = self.bus.read(self.read_mode as u8);
                    return State::ReadScratchpad(ScratchpadPhase::Reading);
                }
                State::ReadScratchpad(ScratchpadPhase::CommandWrite)
            }
            ScratchpadPhase::Reading => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    return self.finish(
                        Ds18b20State::ReadScratchpad,
                        self.current_rom,
                        CallbackFlag::Normal,
                    );
                }
                State::ReadScratchpad(ScratchpadPhase::Reading)
            }
        }
    }

    fn step_write_scratchpad(&mut self, phase: ScratchpadPhase) -> State {
        match phase {
            // Not part of the write transaction.
            ScratchpadPhase::Reading => State::WriteScratchpad(phase),
            ScratchpadPhase::Begin => {
                if self.bus.start().is_ok() {
                    return State::WriteScratchpad(ScratchpadPhase::Reset);
                }
                State::WriteScratchpad(ScratchpadPhase::Begin)
            }
            ScratchpadPhase::Reset => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.arm_delay();
                    return State::WriteScratchpad(ScratchpadPhase::CommandDelay);
                }
                State::WriteScratchpad(ScratchpadPhase::Reset)
            }
            ScratchpadPhase::CommandDelay => {
                // The buffer was prepared at request time; datalen remembers
                // how much of it goes out.
                if self.timer_passed(COMMAND_GAP_US) && self.bus.write(self.datalen).is_ok() {
                    return State::WriteScratchpad(ScratchpadPhase::CommandWrite);
                }
                State::WriteScratchpad(ScratchpadPhase::CommandDelay)
            }
            ScratchpadPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    return self.finish(
                        Ds18b20State::WriteScratchpad,
                        ROM_NONE,
                        CallbackFlag::Normal,
                    );
                }
                State::WriteScratchpad(ScratchpadPhase::CommandWrite)
            }
        }
    }

    fn step_read_rom(&mut self, phase: RomPhase) -> State {
        match phase {
            RomPhase::Reset => {
                match self.bus.process(&mut self.buffer) {
                    OneWireResult::NothingToDo => {
                        let _ = self.bus.start();
                    }
                    OneWireResult::Success => {
                        self.arm_delay();
                        return State::ReadRom(RomPhase::CommandDelay);
                    }
                    _ => {}
                }
                State::ReadRom(RomPhase::Reset)
            }
            RomPhase::CommandDelay => {
                if self.timer_passed(COMMAND_GAP_US) {
                    self.buffer[0] = READ_ROM_CMD;
                    if self.bus.write(1).is_ok() {
                        return State::ReadRom(RomPhase::CommandWrite);
                    }
                }
                State::ReadRom(RomPhase::CommandDelay)
            }
            RomPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.clear_buffer();
                    let _ = self.bus.read(8);
                    return State::ReadRom(RomPhase::Reading);
                }
                State::ReadRom(RomPhase::CommandWrite)
            }
            RomPhase::Reading => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    return self.finish(Ds18b20State::ReadRom, ROM_NONE, CallbackFlag::Normal);
                }
                State::ReadRom(RomPhase::Reading)
            }
        }
    }

    fn step_copy_scratchpad(&mut self, phase: CopyPhase) -> State {
        match phase {
            CopyPhase::Reset => {
                match self.bus.process(&mut self.buffer) {
                    OneWireResult::NothingToDo => {
                        let _ = self.bus.start();
                    }
                    OneWireResult::Success => {
                        self.arm_delay();
                        return State::CopyScratchpad(CopyPhase::CommandDelay);
                    }
                    _ => {}
                }
                State::CopyScratchpad(CopyPhase::Reset)
            }
            CopyPhase::CommandDelay => {
                if self.timer_passed(COMMAND_GAP_US)
                    && self
                        .write_command(COPY_SCRATCHPAD_CMD, self.current_rom, &[])
                        .is_ok()
                {
                    return State::CopyScratchpad(CopyPhase::CommandWrite);
                }
                State::CopyScratchpad(CopyPhase::CommandDelay)
            }
            CopyPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.arm_delay();
                    return State::CopyScratchpad(CopyPhase::Wait);
                }
                State::CopyScratchpad(CopyPhase::CommandWrite)
            }
            CopyPhase::Wait => {
                if self.timer_passed(COPY_WAIT_US) {
                    return self.finish(
                        Ds18b20State::CopyScratchpad,
                        self.current_rom,
                        CallbackFlag::Normal,
                    );
                }
                State::CopyScratchpad(CopyPhase::Wait)
            }
        }
    }

    fn step_recall_eeprom(&mut self, phase: RecallPhase) -> State {
        match phase {
            RecallPhase::Reset => {
                match self.bus.process(&mut self.buffer) {
                    OneWireResult::NothingToDo => {
                        let _ = self.bus.start();
                    }
                    OneWireResult::Success => {
                        self.arm_delay();
                        return State::RecallEeprom(RecallPhase::CommandDelay);
                    }
                    _ => {}
                }
                State::RecallEeprom(RecallPhase::Reset)
            }
            RecallPhase::CommandDelay => {
                if self.timer_passed(COMMAND_GAP_US)
                    && self
                        .write_command(RECALL_EEPROM_CMD, self.current_rom, &[])
                        .is_ok()
                {
                    return State::RecallEeprom(RecallPhase::CommandWrite);
                }
                State::RecallEeprom(RecallPhase::CommandDelay)
            }
            RecallPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.temp = 0;
                    let _ = self.bus.read(1);
                    return State::RecallEeprom(RecallPhase::Poll);
                }
                State::RecallEeprom(RecallPhase::CommandWrite)
            }
            RecallPhase::Poll => {
                // The sensor holds read slots low until the recall is done;
                // keep reading until something other than zeros comes back.
                if self.bus.process(core::slice::from_mut(&mut self.temp))
                    == OneWireResult::Success
                {
                    if self.temp != 0 {
                        return self.finish(
                            Ds18b20State::RecallEeprom,
                            self.current_rom,
                            CallbackFlag::Normal,
                        );
                    }
                    let _ = self.bus.read(1);
                }
                State::RecallEeprom(RecallPhase::Poll)
            }
        }
    }

    fn step_read_power_supply(&mut self, phase: PowerPhase) -> State {
        match phase {
            PowerPhase::Reset => {
                match self.bus.process(&mut self.buffer) {
                    OneWireResult::NothingToDo => {
                        let _ = self.bus.start();
                    }
                    OneWireResult::Success => {
                        self.arm_delay();
                        return State::ReadPowerSupply(PowerPhase::CommandDelay);
                    }
                    _ => {}
                }
                State::ReadPowerSupply(PowerPhase::Reset)
            }
            PowerPhase::CommandDelay => {
                if self.timer_passed(COMMAND_GAP_US)
                    && self
                        .write_command(READ_POWER_SUPPLY_CMD, self.current_rom, &[])
                        .is_ok()
                {
                    return State::ReadPowerSupply(PowerPhase::CommandWrite);
                }
                State::ReadPowerSupply(PowerPhase::CommandDelay)
            }
            PowerPhase::CommandWrite => {
                if self.bus.process(&mut self.buffer) == OneWireResult::Success {
                    self.temp = 0;
                    let _ = self.bus.read(1);
                    return State::ReadPowerSupply(PowerPhase::Reading);
                }
                State::ReadPowerSupply(PowerPhase::CommandWrite)
            }
            PowerPhase::Reading => {
                if self.bus.process(core::slice::from_mut(&mut self.temp))
                    == OneWireResult::Success
                {
                    // Parasite-powered devices answer the slots with zeros.
                    let flag = if self.temp == 0 {
                        CallbackFlag::Parasitic
                    } else {
                        CallbackFlag::NoParasitic
                    };
                    return self.finish(Ds18b20State::ReadPowerSupply, self.current_rom, flag);
                }
                State::ReadPowerSupply(PowerPhase::Reading)
            }
        }
    }

    /// Lay out `[MATCH ROM + rom | SKIP ROM] + command + params` in the
    /// buffer and return the prepared length.
    fn prepare_buffer(&mut self, command: u8, rom: u64, params: &[u8]) -> u8 {
        let mut at = 0;
        self.buffer[at] = if rom != ROM_NONE { MATCH_ROM_CMD } else { SKIP_ROM_CMD };
        at += 1;
        if rom != ROM_NONE {
            self.buffer[at..at + 8].copy_from_slice(&rom.to_le_bytes());
            at += 8;
        }
        self.buffer[at] = command;
        at += 1;
        let take = params.len().min(BUFFER_SIZE - at);
        self.buffer[at..at + take].copy_from_slice(&params[..take]);
        (at + take) as u8
    }

    fn write_command(&mut self, command: u8, rom: u64, params: &[u8]) -> Result<(), Busy> {
        let len = self.prepare_buffer(command, rom, params);
        self.bus.write(len)
    }

    fn clear_buffer(&mut self) {
        self.buffer = [0; BUFFER_SIZE];
    }

    fn arm_delay(&mut self) {
        self.bus.restart_timer();
        self.elapsed_ms = 0;
    }

    /// Threshold check against the bus timer, accumulating whole
    /// milliseconds so waits can exceed the 16-bit counter range.
    fn timer_passed(&mut self, threshold_us: u32) -> bool {
        let t = self.bus.read_timer() as u32;
        if t >= 1000 {
            self.bus.restart_timer();
            self.elapsed_ms += 1;
        }
        let millis = threshold_us / 1000;
        let micros = threshold_us % 1000;
        if self.elapsed_ms >= millis && t >= micros {
            self.elapsed_ms = 0;
            return true;
        }
        false
    }

    fn finish(&mut self, operation: Ds18b20State, rom: u64, flag: CallbackFlag) -> State {
        self.state = State::Finished;
        if let Some(cb) = self.on_finished {
            cb(self, operation, rom, flag);
        }
        self.current_rom = ROM_NONE;
        State::Finished
    }
}
