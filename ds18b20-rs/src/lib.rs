#![no_std]
#![doc = include_str!("../README.md")]

use fixed::types::I12F4;

mod device;

pub use device::{Ds18b20, Ds18b20Callback};
pub use onewire_bitbang::Busy;

/// Family byte of a genuine DS18B20 ROM.
pub const FAMILY_CODE: u8 = 0x28;

/// Placeholder ROM meaning "address every device with SKIP ROM".
pub const ROM_NONE: u64 = 0;

/// ROM-match prefix (1) + ROM (8) + command (1) + scratchpad payload (3).
pub(crate) const BUFFER_SIZE: usize = 13;

/// Temperature in degrees Celsius, in the sensor's native fixed-point
/// format: two's complement with four fractional bits.
pub type Temperature = I12F4;

/// Conversion resolution, encoded as the configuration-register byte the
/// sensor expects.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 9-bit, 0.5 °C steps.
    Bits9 = 0x1f,
    /// 10-bit, 0.25 °C steps.
    Bits10 = 0x3f,
    /// 11-bit, 0.125 °C steps.
    Bits11 = 0x5f,
    /// 12-bit, 0.0625 °C steps.
    Bits12 = 0x7f,
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Bits12
    }
}

impl Resolution {
    /// Worst-case conversion time budgeted before the driver reports a
    /// conversion finished.
    pub fn conversion_time_us(&self) -> u32 {
        match self {
            Resolution::Bits9 => 95_000,
            Resolution::Bits10 => 190_000,
            Resolution::Bits11 => 400_000,
            Resolution::Bits12 => 800_000,
        }
    }
}

impl TryFrom<u8> for Resolution {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1f => Ok(Resolution::Bits9),
            0x3f => Ok(Resolution::Bits10),
            0x5f => Ok(Resolution::Bits11),
            0x7f => Ok(Resolution::Bits12),
            _ => Err("invalid configuration register value"),
        }
    }
}

/// How much of the scratchpad a read fetches, as a byte count.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// The two temperature bytes only.
    Temperature = 2,
    /// Through the first user byte.
    UserByte1 = 3,
    /// Through the second user byte.
    UserByte2 = 4,
    /// Through the configuration register.
    Configuration = 5,
    /// The whole scratchpad including the CRC byte; the only mode
    /// [`Ds18b20::verify_crc`] can actually check.
    #[default]
    Full = 9,
}

/// Extra completion information passed to the user callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallbackFlag {
    /// Nothing special.
    Normal,
    /// Power-supply probe: every device on the bus is externally powered.
    NoParasitic,
    /// Power-supply probe: at least one device runs on parasite power.
    Parasitic,
}

/// Driver state; also used as the operation tag in the completion callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ds18b20State {
    /// No transaction requested yet.
    Idle,
    /// Temperature conversion in progress.
    Convert,
    /// Scratchpad read in progress.
    ReadScratchpad,
    /// Scratchpad write in progress.
    WriteScratchpad,
    /// ROM readout in progress.
    ReadRom,
    /// Scratchpad-to-EEPROM copy in progress.
    CopyScratchpad,
    /// EEPROM-to-scratchpad recall in progress.
    RecallEeprom,
    /// Power-supply probe in progress.
    ReadPowerSupply,
    /// The last transaction completed; a new one may be requested.
    Finished,
}

/// Decode the two temperature bytes of the scratchpad.
///
/// Only the low 12 bits carry data; the value is sign-extended from bit 11,
/// so readings work regardless of what a counterfeit part leaves in the top
/// nibble.
pub fn decode_temperature(lsb: u8, msb: u8) -> Temperature {
    let raw = i16::from_le_bytes([lsb, msb]) << 4 >> 4;
    Temperature::from_bits(raw)
}

/// Counterfeit heuristic: genuine parts have the DS18B20 family byte and
/// zeros in ROM bytes 5 and 6.
pub fn check_authentic(rom: u64) -> bool {
    rom as u8 == FAMILY_CODE && rom >> 40 & 0xff == 0 && rom >> 48 & 0xff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_datasheet_values() {
        assert_eq!(decode_temperature(0xd0, 0x07), Temperature::from_num(125));
        assert_eq!(decode_temperature(0x50, 0x05), Temperature::from_num(85));
        assert_eq!(decode_temperature(0x08, 0x00), Temperature::from_num(0.5));
        assert_eq!(decode_temperature(0x00, 0x00), Temperature::from_num(0));
        assert_eq!(decode_temperature(0x5e, 0xff), Temperature::from_num(-10.125));
        assert_eq!(decode_temperature(0x90, 0xfc), Temperature::from_num(-55));
    }

    #[test]
    fn decode_ignores_undefined_high_bits() {
        // Bits 12..16 are undefined on the wire; bit 11 alone decides sign.
        assert_eq!(decode_temperature(0x50, 0xf5), Temperature::from_num(85));
        assert_eq!(decode_temperature(0x90, 0x0c), Temperature::from_num(-55));
    }

    #[test]
    fn authenticity_heuristic() {
        let genuine = 0x5a00000403020128u64;
        assert!(check_authentic(genuine));
        assert!(!check_authentic(genuine | 1 << 40));
        assert!(!check_authentic(genuine | 1 << 48));
        assert!(!check_authentic(genuine & !0xff | 0x22));
    }

    #[test]
    fn resolution_round_trips_config_byte() {
        for res in [Resolution::Bits9, Resolution::Bits10, Resolution::Bits11, Resolution::Bits12]
        {
            assert_eq!(Resolution::try_from(res as u8), Ok(res));
        }
        assert!(Resolution::try_from(0x00).is_err());
    }

    #[test]
    fn conversion_times() {
        assert_eq!(Resolution::Bits9.conversion_time_us(), 95_000);
        assert_eq!(Resolution::Bits12.conversion_time_us(), 800_000);
    }

    #[test]
    fn read_mode_is_a_byte_count() {
        assert_eq!(ReadMode::Temperature as u8, 2);
        assert_eq!(ReadMode::Configuration as u8, 5);
        assert_eq!(ReadMode::Full as u8, 9);
        assert_eq!(ReadMode::default(), ReadMode::Full);
    }
}
