use clap::Parser;
use ds18b20::{Ds18b20, ROM_NONE, Resolution, check_authentic};
use ds18b20_sim::{SimBus, Slave, rom_with_crc};
use onewire_bitbang::OneWireBus;

/// Run the full driver stack against a simulated 1-Wire bus.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of simulated sensors on the bus
    #[arg(short, long, default_value_t = 3)]
    sensors: u8,

    /// Conversion resolution in bits (9, 10, 11 or 12)
    #[arg(short, long, default_value_t = 12)]
    resolution: u8,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let resolution = match args.resolution {
        9 => Resolution::Bits9,
        10 => Resolution::Bits10,
        11 => Resolution::Bits11,
        _ => Resolution::Bits12,
    };

    let sim = SimBus::new();
    for i in 0..args.sensors {
        let rom = rom_with_crc(ds18b20::FAMILY_CODE, 0xa1_0000 + i as u64 * 0x0111);
        sim.add_slave(Slave::new(rom).with_temperature(18.5 + i as f32 * 1.25));
    }

    let mut bus = OneWireBus::new(sim.port(), 0);

    // Enumerate the bus, one ROM per search round.
    let mut roms = Vec::new();
    loop {
        bus.search(false).expect("bus should be idle between rounds");
        bus.wait(&mut []);
        if let Some(rom) = bus.found_rom() {
            log::info!("found {rom:#018x} (authentic: {})", check_authentic(rom));
            roms.push(rom);
        }
        if bus.search_exhausted() {
            break;
        }
    }
    log::info!("{} device(s) on the bus", roms.len());

    // One broadcast conversion, then read every sensor back.
    let mut device = Ds18b20::new(&mut bus).with_resolution(resolution);
    device
        .begin_conversion(ROM_NONE)
        .expect("device should be idle");
    device.wait();

    for rom in roms {
        device.read_scratchpad(rom).expect("device should be idle");
        device.wait();
        if device.verify_crc() {
            log::info!("{rom:#018x}: {} degC", device.temperature());
        } else {
            log::warn!("{rom:#018x}: scratchpad CRC mismatch");
        }
    }
}
