use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use klap_core::DEFAULT_PORT;

pub fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

/// TP-Link KLAP smart plug and bulb client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TP-Link cloud account username (email).
    /// Can also be set via KLAP_USERNAME environment variable.
    /// Without it, only blank and default credentials are tried.
    #[arg(short, long, global = true, env = "KLAP_USERNAME")]
    pub username: Option<String>,

    /// Read password from stdin.
    /// Useful for scripting: echo "password" | klap -u user@example.com --password-stdin device 192.168.1.100 info
    #[arg(long, global = true)]
    pub password_stdin: bool,

    /// Path of the device registry file
    #[arg(long, global = true, env = "KLAP_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Device HTTP port
    #[arg(short, long, global = true, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Timeout in seconds for handshakes and requests
    #[arg(long, global = true, value_parser = parse_duration, default_value = "10")]
    pub timeout: Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scan subnets for devices
    ///
    /// Scans the subnets of local interfaces, the subnets of registered
    /// devices, and any given with --subnet.
    Discover {
        /// Extra subnet to scan (a.b.c.0/24, a.b.c.d or a.b.c); repeatable
        #[arg(long = "subnet", value_name = "SUBNET")]
        subnets: Vec<String>,

        /// Probe timeout in seconds
        #[arg(long, value_parser = parse_duration, default_value = "2")]
        probe_timeout: Duration,

        /// Skip the subnets of local interfaces
        #[arg(long)]
        no_local: bool,

        /// Add authenticated devices that aren't registered yet
        #[arg(long)]
        register: bool,
    },

    /// Show version information for CLI and core library
    Version,

    /// Send a command to a specific device
    Device {
        /// Target hostname or IP address
        target: String,

        #[command(subcommand)]
        command: DeviceCommand,
    },

    /// Manage the device registry
    Devices {
        #[command(subcommand)]
        command: DevicesCommand,
    },
}

/// Commands available for single device operations
#[derive(Subcommand)]
pub enum DeviceCommand {
    /// Get device info and current state
    Info,
    /// Turn the device on
    On,
    /// Turn the device off
    Off,
    /// Set brightness (1-100, clamped)
    Brightness {
        /// Brightness in percent
        level: u32,
    },
    /// Set color from hue and saturation
    Color {
        /// Hue in degrees (0-360)
        hue: u16,
        /// Saturation in percent (0-100)
        saturation: u8,
    },
    /// Set color from an RGB hex string
    Hex {
        /// Color as #RRGGBB or RRGGBB
        color: String,
    },
    /// Set white color temperature (2000-9000 K, clamped)
    ColorTemp {
        /// Color temperature in Kelvin
        kelvin: u32,
    },
}

/// Commands for the persisted device list
#[derive(Subcommand)]
pub enum DevicesCommand {
    /// List registered devices
    List,
    /// Connect to a device and register it
    Add {
        /// Device address
        address: String,
        /// Display name (defaults to the device's own name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Unregister a device
    Remove {
        /// Device address
        address: String,
    },
    /// Rename a registered device
    Rename {
        /// Device address
        address: String,
        /// New display name
        name: String,
    },
}
