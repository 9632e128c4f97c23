mod cli;
mod handlers;
mod repository;
mod utils;

use clap::Parser;
use klap_core::{ClientConfig, KlapClient};
use tracing::error;

use crate::cli::{Cli, Command};
use crate::handlers::{handle_device, handle_devices, handle_discover};
use crate::repository::JsonFileRepository;
use crate::utils::{CliError, get_credentials, registry_path};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        if matches!(e, CliError::Core(klap_core::Error::Authentication(_))) {
            eprintln!();
            eprintln!("Check that your email and password (both case-sensitive) are correct:");
            eprintln!("  klap -u your-email@example.com device <address> info");
            eprintln!();
            eprintln!("Or set credentials via environment variables:");
            eprintln!("  export KLAP_USERNAME=your-email@example.com");
            eprintln!("  export KLAP_PASSWORD=your-password");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Command::Version = cli.command {
        println!("klap {}", env!("CARGO_PKG_VERSION"));
        println!("klap-core {}", klap_core::VERSION);
        return Ok(());
    }

    let credentials = get_credentials(cli.username, cli.password_stdin)?;
    let repository = JsonFileRepository::new(registry_path(cli.registry)?);
    tracing::debug!(path = %repository.path().display(), "using device registry");

    let mut config = ClientConfig::new(credentials)
        .with_port(cli.port)
        .with_timeout(cli.timeout);

    if let Command::Discover {
        probe_timeout,
        no_local,
        ..
    } = &cli.command
    {
        config = config
            .with_probe_timeout(*probe_timeout)
            .with_local_subnets(!no_local);
    }

    let client = KlapClient::new(config, Box::new(repository))?;

    match cli.command {
        Command::Version => Ok(()),
        Command::Discover {
            subnets, register, ..
        } => handle_discover(&client, &subnets, register).await,
        Command::Device { target, command } => handle_device(&client, &target, command).await,
        Command::Devices { command } => handle_devices(&client, command).await,
    }
}
