use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use uci_core::bus::linux::{self, LinuxParts};
use uci_core::{DriverConfig, FileSource, UciDriver, bus::StdDelay};

type Driver = UciDriver<linux::SpidevBus, linux::GpioOutput, linux::GpioOutput, StdDelay>;

#[derive(Parser, Debug)]
#[command(author, version, about = "UWB UCI-over-SPI Tool", long_about = None)]
struct Cli {
    /// Driver configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the spidev node, e.g. /dev/spidev1.0
    #[arg(long, global = true)]
    spi: Option<String>,

    /// Override the notification timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a firmware image
    Flash {
        /// Image path (defaults to firmware.image_path from the config)
        image: Option<PathBuf>,
        /// Whole-image attempts before giving up
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Optionally flash, then reset and apply calibration
    Init {
        /// Firmware image to upload first
        #[arg(long)]
        firmware: Option<PathBuf>,
    },
    /// Send Device-Reset and wait for Device-Status
    Reset {
        /// Pulse the enable line instead of sending a command
        #[arg(long)]
        hard: bool,
    },
    /// Query device information
    Info,
    /// Query capabilities
    Caps,
    /// Write a configuration parameter
    SetConfig {
        #[arg(value_parser = parse_u8)]
        id: u8,
        /// Value as hex bytes, e.g. 0105
        #[arg(value_parser = parse_hex_bytes)]
        value: HexBytes,
    },
    /// Read a configuration parameter
    GetConfig {
        #[arg(value_parser = parse_u8)]
        id: u8,
    },
    /// Start a ranging session
    Start {
        #[arg(value_parser = parse_u32)]
        session_id: u32,
    },
    /// Stop a ranging session
    Stop {
        #[arg(value_parser = parse_u32)]
        session_id: u32,
    },
    /// Print active and maximum session counts
    Sessions,
    /// Listen for notifications, then print the UWBS state
    State {
        /// How long to listen before reporting
        #[arg(long, default_value_t = 0)]
        listen_ms: u64,
    },
    /// Print the effective configuration as TOML
    DumpConfig {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
struct HexBytes(Vec<u8>);

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u32(s)?;
    u8::try_from(value).map_err(|_| format!("{s} does not fit in a byte"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s}: {e}"))
}

fn parse_hex_bytes(s: &str) -> Result<HexBytes, String> {
    let digits: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(format!("expected an even number of hex digits: {s}"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .map(HexBytes)
        .map_err(|e| format!("invalid hex {s}: {e}"))
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn load_config(cli: &Cli) -> Result<DriverConfig> {
    let mut config = match &cli.config {
        Some(path) => DriverConfig::load_from_file(path)?,
        None => DriverConfig::default(),
    };
    if let Some(spi) = &cli.spi {
        config.hardware.spi_device = spi.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.dispatch.notification_timeout_ms = ms;
    }
    Ok(config)
}

fn open_driver(config: DriverConfig) -> Result<Driver> {
    let parts: LinuxParts = linux::open(&config.hardware).with_context(|| {
        format!(
            "Failed to open {} / {}",
            config.hardware.spi_device, config.hardware.gpio_chip
        )
    })?;
    Ok(UciDriver::new(parts, config)?)
}

fn flash(driver: &Driver, image: Option<PathBuf>) -> Result<()> {
    let path = match image.or_else(|| driver.config().firmware.image_path.clone().map(PathBuf::from)) {
        Some(path) => path,
        None => bail!("No firmware image given and none configured"),
    };
    let report = driver.load_firmware(&FileSource::new(&path))?;
    info!(
        path = %path.display(),
        attempts = report.attempts,
        chunks = report.chunks,
        bytes = report.bytes,
        "Firmware loaded"
    );
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli)?;

    if let Commands::DumpConfig { output } = &cli.command {
        match output {
            Some(path) => config.save_to_file(path)?,
            None => print!("{}", config.to_toml()?),
        }
        return Ok(());
    }

    if let Commands::Flash {
        max_attempts: Some(n),
        ..
    } = &cli.command
    {
        config.firmware.max_attempts = *n;
    }

    let driver = open_driver(config)?;

    match cli.command {
        Commands::Flash { image, .. } => flash(&driver, image)?,
        Commands::Init { firmware } => {
            if firmware.is_some() {
                flash(&driver, firmware)?;
            } else {
                driver.power_on()?;
            }
            driver.initialize()?;
            println!("state: {}", driver.state());
        }
        Commands::Reset { hard: true } => driver.hard_reset()?,
        Commands::Reset { hard: false } => {
            let ntf = driver.reset_device()?;
            println!("{:?}", ntf);
        }
        Commands::Info => {
            let ntf = driver.get_device_info()?;
            println!("{}", ntf.as_hex());
        }
        Commands::Caps => println!("{}", hex(&driver.get_caps_info()?)),
        Commands::SetConfig { id, value } => {
            let ntf = driver.set_config(id, &value.0)?;
            println!("{:?}", ntf);
        }
        Commands::GetConfig { id } => println!("{}", hex(&driver.get_config(id)?)),
        Commands::Start { session_id } => {
            driver.start_ranging(session_id)?;
            println!("session 0x{:08X}: {}", session_id, driver.state());
        }
        Commands::Stop { session_id } => {
            driver.stop_ranging(session_id)?;
            println!("session 0x{:08X}: {}", session_id, driver.state());
        }
        Commands::Sessions => {
            let active = driver.get_session_count()?;
            let max = driver.get_max_sessions()?;
            println!("active: {active}\nmax: {max}");
        }
        Commands::State { listen_ms } => {
            thread::sleep(Duration::from_millis(listen_ms));
            while let Some(ntf) = driver.dispatcher().take_any() {
                println!("{:?}", ntf);
            }
            println!("state: {}", driver.state());
        }
        Commands::DumpConfig { .. } => unreachable!("handled before opening hardware"),
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u32("0x12345678"), Ok(0x1234_5678));
        assert_eq!(parse_u32("42"), Ok(42));
        assert_eq!(parse_u8("0xFF"), Ok(0xFF));
        assert!(parse_u8("256").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("0105").unwrap().0, vec![0x01, 0x05]);
        assert_eq!(parse_hex_bytes("de:ad be").unwrap().0, vec![0xDE, 0xAD, 0xBE]);
        assert!(parse_hex_bytes("123").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["uci", "--verbose", "start", "0x12345678"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Start { session_id: 0x1234_5678 }));

        let cli = Cli::try_parse_from(["uci", "set-config", "1", "05", "--timeout-ms", "50"]).unwrap();
        assert_eq!(cli.timeout_ms, Some(50));
        assert!(matches!(cli.command, Commands::SetConfig { id: 1, .. }));
    }
}
