/// Direction of the single bus line.
///
/// The line must be wired open-drain with an external pull-up: `Input`
/// releases the line (the pull-up takes it high), `Output` lets the master
/// drive it. The master only ever drives low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    /// High-impedance input; the pull-up resistor holds the line high unless
    /// a slave pulls it low.
    Input,
    /// Push-pull / open-drain output driven by the master.
    Output,
}

/// Logic level of the bus line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    /// Line at pull-up potential.
    High,
    /// Line pulled to ground.
    Low,
}

/// Capability bundle the host supplies for one physical 1-Wire line.
///
/// The bus owns the pin and the timer for the whole lifetime of a non-idle
/// operation; nothing else may touch them during that time. The timer is a
/// free-running counter with a 1 µs period that [`Port::restart_timer`]
/// resets to zero; it may wrap, but only at intervals longer than the longest
/// link-layer wait (800 µs), which a 16-bit 1 µs counter satisfies.
///
/// All methods are infallible. A misconfigured port (e.g. a timer that never
/// counts) surfaces as operations that report `Working` forever, never as a
/// panic.
pub trait Port {
    /// Configure the bus line direction.
    fn set_pin_direction(&mut self, dir: PinDirection);
    /// Drive the bus line. Only meaningful while the direction is
    /// [`PinDirection::Output`].
    fn write_pin(&mut self, state: PinState);
    /// Sample the bus line.
    fn read_pin(&mut self) -> PinState;
    /// Reset the 1 µs counter to zero.
    fn restart_timer(&mut self);
    /// Read the 1 µs counter.
    fn read_timer(&mut self) -> u16;
}
