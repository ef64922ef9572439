//! Timing and command constants for standard-speed 1-Wire signalling.
//!
//! All durations are in microseconds and reflect the datasheet minima for
//! standard speed; they are compared against the [`Port`](crate::Port) timer,
//! so the effective wait is the constant plus up to one polling interval.

/// Reset pulse: how long the master holds the line low.
pub const RESET_PULSE_US: u16 = 480;

/// Reset: delay between releasing the line and sampling for the presence
/// pulse.
pub const PRESENCE_SAMPLE_US: u16 = 80;

/// Reset: tail wait after the presence sample, so the whole recovery phase
/// lasts at least 480 µs.
pub const RESET_TAIL_US: u16 = 400;

/// Write-1 slot: low time before releasing the line.
pub const WRITE_ONE_LOW_US: u16 = 10;

/// Write-1 slot: released time completing the slot and the recovery gap.
pub const WRITE_ONE_RELEASE_US: u16 = 55;

/// Write-0 slot: low time; the release itself is the recovery gap.
pub const WRITE_ZERO_LOW_US: u16 = 65;

/// Read slot: released settling time before the master pulls low.
pub const READ_SETUP_US: u16 = 2;

/// Read slot: low time initiating the slot.
pub const READ_LOW_US: u16 = 2;

/// Read slot: wait after sampling, completing the slot and the recovery gap.
pub const READ_SLOT_US: u16 = 50;

/// SEARCH ROM command byte.
#[cfg(feature = "search")]
pub const ONEWIRE_SEARCH_CMD: u8 = 0xf0;

/// Conditional (alarm) SEARCH ROM command byte; only devices with a pending
/// alarm condition take part.
#[cfg(feature = "search")]
pub const ONEWIRE_CONDITIONAL_SEARCH_CMD: u8 = 0xec;
