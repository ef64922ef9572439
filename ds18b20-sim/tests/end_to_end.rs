//! Full-stack scenarios: real driver state machines against the simulated
//! bus and virtual slaves.

use ds18b20::{
    Busy, CallbackFlag, Ds18b20, Ds18b20State, ROM_NONE, ReadMode, Resolution, Temperature,
    check_authentic,
};
use ds18b20_sim::{SimBus, SimPort, Slave, rom_with_crc};
use onewire_bitbang::{OneWireBus, OneWireCrc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

fn bus_with(slaves: Vec<Slave>) -> (SimBus, OneWireBus<SimPort>) {
    let sim = SimBus::new();
    for slave in slaves {
        sim.add_slave(slave);
    }
    let bus = OneWireBus::new(sim.port(), 0);
    (sim, bus)
}

/// Run search rounds to exhaustion, collecting the discovered ROMs.
fn enumerate(bus: &mut OneWireBus<SimPort>, alarm: bool) -> Vec<u64> {
    let mut roms = Vec::new();
    loop {
        bus.search(alarm).expect("bus busy between search rounds");
        bus.wait(&mut []);
        if let Some(rom) = bus.found_rom() {
            roms.push(rom);
        }
        if bus.search_exhausted() {
            return roms;
        }
    }
}

#[test]
fn read_rom_on_single_device() {
    let rom = 0x5a00000403020128u64;
    let (_sim, mut bus) = bus_with(vec![Slave::new(rom)]);
    let mut device = Ds18b20::new(&mut bus);

    device.request_read_rom().unwrap();
    assert_eq!(device.wait(), Ds18b20State::Finished);
    assert_eq!(
        &device.buffer()[..8],
        &[0x28, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x5a]
    );
    assert_eq!(device.last_rom(), rom);
    assert!(check_authentic(device.last_rom()));
}

static TRANSACTIONS_DONE: AtomicU32 = AtomicU32::new(0);

fn count_transaction(
    _device: &Ds18b20<'_, SimPort>,
    _operation: Ds18b20State,
    _rom: u64,
    flag: CallbackFlag,
) {
    assert_eq!(flag, CallbackFlag::Normal);
    TRANSACTIONS_DONE.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn convert_and_read_datasheet_scratchpad() {
    let scratchpad = [0x50, 0x05, 0x4b, 0x46, 0x7f, 0xff, 0x0c, 0x10];
    let (sim, mut bus) = bus_with(vec![
        Slave::new(rom_with_crc(0x28, 0x77aa)).with_scratchpad(scratchpad),
    ]);
    let mut device = Ds18b20::new(&mut bus).with_callback(count_transaction);

    device.begin_conversion(ROM_NONE).unwrap();
    assert_eq!(device.wait(), Ds18b20State::Finished);
    // The 12-bit conversion budget was actually waited out.
    assert!(sim.elapsed_us() >= 800_000);

    device.read_scratchpad(ROM_NONE).unwrap();
    assert_eq!(device.wait(), Ds18b20State::Finished);

    assert_eq!(&device.buffer()[..8], &scratchpad);
    assert_eq!(device.buffer()[8], OneWireCrc::checksum(&scratchpad));
    assert!(device.verify_crc());
    assert_eq!(device.temperature(), Temperature::from_num(85));
    // Exactly one completion callback per transaction.
    assert_eq!(TRANSACTIONS_DONE.load(Ordering::Relaxed), 2);
}

#[test]
fn short_reads_skip_crc_check() {
    let (_sim, mut bus) = bus_with(vec![Slave::new(rom_with_crc(0x28, 1)).with_temperature(-10.125)]);
    let mut device = Ds18b20::new(&mut bus).with_read_mode(ReadMode::Temperature);

    device.read_scratchpad(ROM_NONE).unwrap();
    device.wait();
    assert_eq!(device.temperature(), Temperature::from_num(-10.125));
    // Two bytes carry no CRC; verification passes vacuously.
    assert!(device.verify_crc());
}

#[test]
fn set_resolution_copy_and_recall() {
    let rom = rom_with_crc(0x28, 0xbeef);
    let (sim, mut bus) = bus_with(vec![Slave::new(rom)]);
    let mut device = Ds18b20::new(&mut bus);

    device
        .set_resolution(Resolution::Bits11, [42, 13], ROM_NONE)
        .unwrap();
    device.wait();
    assert_eq!(device.resolution(), Resolution::Bits11);
    assert_eq!(&device.buffer()[..5], &[0xcc, 0x4e, 42, 13, 0x5f]);
    assert_eq!(&sim.slave_scratchpad(0)[2..5], &[42, 13, 0x5f]);

    let before_copy = sim.elapsed_us();
    device.copy_scratchpad(ROM_NONE).unwrap();
    device.wait();
    assert_eq!(sim.slave_eeprom(0), [42, 13, 0x5f]);
    // The EEPROM write time is waited out before completion.
    assert!(sim.elapsed_us() - before_copy >= 20_000);

    // Scribble over the scratchpad, then restore it from EEPROM.
    device.write_scratchpad(&[7, 8, 0x1f], ROM_NONE).unwrap();
    device.wait();
    assert_eq!(&sim.slave_scratchpad(0)[2..5], &[7, 8, 0x1f]);

    let before_recall = sim.elapsed_us();
    device.recall_eeprom(ROM_NONE).unwrap();
    device.wait();
    assert_eq!(&sim.slave_scratchpad(0)[2..5], &[42, 13, 0x5f]);
    let recall_took = sim.elapsed_us() - before_recall;
    // The busy poll ends as soon as the slave reports ready, well inside
    // the 10 ms the datasheet allows.
    assert!((3_000..12_000).contains(&recall_took), "recall took {recall_took} us");
}

static POWER_PROBED: AtomicBool = AtomicBool::new(false);
static POWER_PARASITIC: AtomicBool = AtomicBool::new(false);

fn note_power(
    _device: &Ds18b20<'_, SimPort>,
    operation: Ds18b20State,
    _rom: u64,
    flag: CallbackFlag,
) {
    assert_eq!(operation, Ds18b20State::ReadPowerSupply);
    POWER_PROBED.store(true, Ordering::Relaxed);
    POWER_PARASITIC.store(flag == CallbackFlag::Parasitic, Ordering::Relaxed);
}

#[test]
fn parasite_powered_device_is_detected() {
    let (_sim, mut bus) = bus_with(vec![
        Slave::new(rom_with_crc(0x28, 1)),
        Slave::new(rom_with_crc(0x28, 2)).with_parasite_power(true),
    ]);
    let mut device = Ds18b20::new(&mut bus).with_callback(note_power);

    device.read_power_supply().unwrap();
    device.wait();
    assert!(POWER_PROBED.load(Ordering::Relaxed));
    assert!(POWER_PARASITIC.load(Ordering::Relaxed));
}

static EXT_PROBED: AtomicBool = AtomicBool::new(false);
static EXT_PARASITIC: AtomicBool = AtomicBool::new(true);

fn note_external(
    _device: &Ds18b20<'_, SimPort>,
    _operation: Ds18b20State,
    _rom: u64,
    flag: CallbackFlag,
) {
    EXT_PROBED.store(true, Ordering::Relaxed);
    EXT_PARASITIC.store(flag == CallbackFlag::Parasitic, Ordering::Relaxed);
}

#[test]
fn externally_powered_bus_reports_no_parasite() {
    let (_sim, mut bus) = bus_with(vec![Slave::new(rom_with_crc(0x28, 1))]);
    let mut device = Ds18b20::new(&mut bus).with_callback(note_external);

    device.read_power_supply().unwrap();
    device.wait();
    assert!(EXT_PROBED.load(Ordering::Relaxed));
    assert!(!EXT_PARASITIC.load(Ordering::Relaxed));
}

static ROMS_REPORTED: AtomicU32 = AtomicU32::new(0);
static LAST_ROM_REPORTED: AtomicU64 = AtomicU64::new(0);

fn note_search(_bus: u8, rom: u64) {
    ROMS_REPORTED.fetch_add(1, Ordering::Relaxed);
    LAST_ROM_REPORTED.store(rom, Ordering::Relaxed);
}

#[test]
fn two_device_enumeration_visits_both_once() {
    // Two ROMs differing at bits 5 and 37. At the first discrepancy the
    // algorithm descends into the 0 branch, so the flipped device comes
    // back first.
    let a = rom_with_crc(0x28, 0);
    let b = a ^ 1 << 5 ^ 1 << 37;
    let (_sim, bus) = bus_with(vec![Slave::new(a), Slave::new(b)]);
    let mut bus = bus.with_search_callback(note_search);

    let roms = enumerate(&mut bus, false);
    assert_eq!(roms, vec![b, a]);
    assert!(bus.search_exhausted());
    assert_eq!(ROMS_REPORTED.load(Ordering::Relaxed), 2);
    assert_eq!(LAST_ROM_REPORTED.load(Ordering::Relaxed), a);

    // A fresh enumeration starts over and sees the same bus.
    assert_eq!(enumerate(&mut bus, false), vec![b, a]);
}

#[test]
fn empty_bus_search_terminates_immediately() {
    let (_sim, mut bus) = bus_with(Vec::new());
    assert_eq!(enumerate(&mut bus, false), Vec::<u64>::new());
}

#[test]
fn alarm_search_only_sees_alarmed_devices() {
    let alarmed = rom_with_crc(0x28, 7);
    let (_sim, mut bus) = bus_with(vec![
        Slave::new(rom_with_crc(0x28, 3)),
        Slave::new(alarmed).with_alarm(true),
    ]);
    assert_eq!(enumerate(&mut bus, true), vec![alarmed]);
    // The normal search still sees both.
    assert_eq!(enumerate(&mut bus, false).len(), 2);
}

#[test]
fn targeted_search_stays_inside_the_family() {
    let a = rom_with_crc(0x28, 1);
    let b = rom_with_crc(0x28, 2);
    let stranger = rom_with_crc(0x10, 5);
    let (_sim, mut bus) =
        bus_with(vec![Slave::new(a), Slave::new(b), Slave::new(stranger)]);

    let mut roms = Vec::new();
    loop {
        bus.search_target(false, 0x28).expect("bus busy");
        bus.wait(&mut []);
        if let Some(rom) = bus.found_rom() {
            roms.push(rom);
        }
        if bus.search_exhausted() {
            break;
        }
    }
    roms.sort_unstable();
    let mut expected = vec![a, b];
    expected.sort_unstable();
    assert_eq!(roms, expected);
}

#[test]
fn requests_are_refused_while_a_transaction_runs() {
    let (sim, mut bus) = bus_with(vec![Slave::new(rom_with_crc(0x28, 9))]);
    let mut device = Ds18b20::new(&mut bus).with_resolution(Resolution::Bits9);

    device.begin_conversion(ROM_NONE).unwrap();
    for _ in 0..50 {
        device.process();
    }
    assert_eq!(device.state(), Ds18b20State::Convert);

    let pin_ops = sim.pin_ops();
    assert_eq!(device.read_scratchpad(ROM_NONE), Err(Busy));
    assert_eq!(device.begin_conversion(ROM_NONE), Err(Busy));
    assert_eq!(device.request_read_rom(), Err(Busy));
    assert_eq!(device.copy_scratchpad(ROM_NONE), Err(Busy));
    // The refused requests caused no bus traffic and no state change.
    assert_eq!(sim.pin_ops(), pin_ops);
    assert_eq!(device.state(), Ds18b20State::Convert);

    assert_eq!(device.wait(), Ds18b20State::Finished);
    device.read_scratchpad(ROM_NONE).unwrap();
    assert_eq!(device.wait(), Ds18b20State::Finished);
}

#[test]
fn match_rom_addresses_one_of_two_devices() {
    let hot = rom_with_crc(0x28, 0x111);
    let cold = rom_with_crc(0x28, 0x222);
    let (_sim, mut bus) = bus_with(vec![
        Slave::new(hot).with_temperature(42.5),
        Slave::new(cold).with_temperature(-0.5),
    ]);
    let mut device = Ds18b20::new(&mut bus);

    device.begin_conversion(ROM_NONE).unwrap();
    device.wait();

    device.read_scratchpad(hot).unwrap();
    device.wait();
    assert!(device.verify_crc());
    assert_eq!(device.temperature(), Temperature::from_num(42.5));

    device.read_scratchpad(cold).unwrap();
    device.wait();
    assert!(device.verify_crc());
    assert_eq!(device.temperature(), Temperature::from_num(-0.5));
}
