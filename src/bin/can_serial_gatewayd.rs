//! Binary entry point: installs logging, reads configuration from the
//! environment/command line, runs the gateway until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use colored::Color;
use fern::colors::ColoredLevelConfig;

use can_serial_gateway::gateway::Config;
use can_serial_gateway::Gateway;

fn setup_logging() {
    let colors_line = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::White)
        .debug(Color::Green)
        .trace(Color::Blue);

    let _ = fern::Dispatch::new()
        .level(log::LevelFilter::Info)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}{}[{}][{}] {}",
                format_args!(
                    "\x1B[{}m",
                    colors_line.get_color(&record.level()).to_fg_str()
                ),
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stdout())
        .apply();
}

fn config_from_env() -> Config {
    let mut config = Config::default();

    let mut args = std::env::args().skip(1);
    if let Some(interface) = args.next() {
        config.interface = interface;
    }
    if let Ok(dir) = std::env::var("CAN_SERIAL_GATEWAY_SYMLINK_DIR") {
        config.symlink_dir = PathBuf::from(dir);
    }
    if let Ok(prefix) = std::env::var("CAN_SERIAL_GATEWAY_SYMLINK_PREFIX") {
        config.symlink_prefix = prefix;
    }
    if let Ok(pings) = std::env::var("CAN_SERIAL_GATEWAY_PINGS_BEFORE_DISCONNECT") {
        if let Ok(pings) = pings.parse() {
            config.pings_before_disconnect = pings;
        }
    }
    if let Ok(max_ports) = std::env::var("CAN_SERIAL_GATEWAY_MAX_PORTS") {
        if let Ok(max_ports) = max_ports.parse() {
            config.max_ports = max_ports;
        }
    }

    config
}

fn main() {
    setup_logging();

    let config = config_from_env();
    log::info!(
        "starting gateway on {} (ports published under {}/{}*)",
        config.interface,
        config.symlink_dir.display(),
        config.symlink_prefix
    );

    let mut gateway = match Gateway::init(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            log::error!("failed to start gateway: {e}");
            std::process::exit(1);
        }
    };

    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            running.store(false, std::sync::atomic::Ordering::SeqCst);
        }) {
            log::warn!("failed to install Ctrl-C handler: {e}");
        }
    }

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
        gateway.ping_tick();
    }

    log::info!("shutting down");
    gateway.shutdown();
}
