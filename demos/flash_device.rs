// Flashes a UF2 to a Pico in BOOTSEL mode: `cargo run --example flash_device -- blink.uf2`

use picoboot_flash::{FirmwareLoader, LoadConfig, LoadMode, PicobootConnection, RusbHost};

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "blink.uf2".to_string());
    let fw = std::fs::read(&path).expect("failed to read firmware");

    let ctx = rusb::Context::new().expect("could not initialize libusb");
    let mut conn = PicobootConnection::new(RusbHost::new(ctx));

    let config = LoadConfig::new()
        .with_mode(LoadMode::ConnectInternally)
        .with_strict_uf2(true);
    let loader = FirmwareLoader::new(config).expect("invalid loader config");

    let mut last = 0;
    let target = loader
        .load_with_progress(&mut conn, &fw, |p| {
            let pct = (p * 100.0) as u32;
            if pct / 10 != last / 10 {
                println!("{}%", pct);
                last = pct;
            }
        })
        .expect("failed to flash device");

    println!("flashed {} and rebooted {:?}", path, target);
}
