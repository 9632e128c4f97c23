use std::io::IsTerminal;

use klap_core::{ColorSpec, DeviceRecord, KlapClient, ScanProgress};
use serde_json::json;
use tracing::{debug, info};

use crate::cli::{DeviceCommand, DevicesCommand};
use crate::utils::{CliError, print_json};

/// Handle the discover command.
pub async fn handle_discover(
    client: &KlapClient,
    subnets: &[String],
    register: bool,
) -> Result<(), CliError> {
    let show_progress = std::io::stderr().is_terminal();
    let mut on_progress = |p: ScanProgress| {
        if show_progress {
            eprint!(
                "\rScanning {}: {}/{} ({} found)",
                p.subnet, p.scanned, p.total, p.found
            );
            if p.scanned == p.total {
                eprintln!();
            }
        }
    };

    let results = client.discover_with_progress(subnets, &mut on_progress).await?;
    debug!(device_count = results.len(), "discovered devices");

    if register {
        let mut added = 0;
        for result in results.iter().filter(|r| !r.already_known) {
            if let Some(info) = &result.info {
                client.register(DeviceRecord::from_snapshot(&result.address, info))?;
                added += 1;
            }
        }
        info!(count = added, "registered discovered devices");
    }

    print_json(&results)
}

/// Handle the device command.
pub async fn handle_device(
    client: &KlapClient,
    target: &str,
    command: DeviceCommand,
) -> Result<(), CliError> {
    let handle = client.connect(target).await?;
    debug!(host = %target, "connected");

    match command {
        DeviceCommand::Info => {
            let info = client.get_device_info(&handle).await?;
            return print_json(&info);
        }
        DeviceCommand::On => client.turn_on(&handle).await?,
        DeviceCommand::Off => client.turn_off(&handle).await?,
        DeviceCommand::Brightness { level } => client.set_brightness(&handle, level).await?,
        DeviceCommand::Color { hue, saturation } => {
            client
                .set_color(&handle, &ColorSpec::HueSaturation { hue, saturation })
                .await?
        }
        DeviceCommand::Hex { color } => client.set_color(&handle, &ColorSpec::Hex(color)).await?,
        DeviceCommand::ColorTemp { kelvin } => client.set_color_temp(&handle, kelvin).await?,
    }

    print_json(&json!({ "address": handle.address(), "success": true }))
}

/// Handle the devices command.
pub async fn handle_devices(client: &KlapClient, command: DevicesCommand) -> Result<(), CliError> {
    match command {
        DevicesCommand::List => print_json(&client.devices()?),
        DevicesCommand::Add { address, name } => {
            let record = client.add_device(&address, name.as_deref()).await?;
            print_json(&record)
        }
        DevicesCommand::Remove { address } => {
            let removed = client.remove_device(&address)?;
            print_json(&json!({ "address": address, "removed": removed.is_some() }))
        }
        DevicesCommand::Rename { address, name } => {
            client.rename_device(&address, &name)?;
            print_json(&client.device(&address)?)
        }
    }
}
