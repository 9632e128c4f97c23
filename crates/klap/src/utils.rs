use std::io::IsTerminal;
use std::path::PathBuf;

use directories::ProjectDirs;
use klap_core::Credentials;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to the user by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Credentials(String),

    #[error(transparent)]
    Core(#[from] klap_core::Error),

    #[error("failed to serialize output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("could not determine a config directory; pass --registry")]
    NoConfigDir,
}

/// Read password securely.
///
/// # Priority
///
/// 1. If `password_stdin` is true, read one line from stdin
/// 2. Otherwise, prompt interactively (if terminal is available)
pub fn read_password(password_stdin: bool, prompt: &str) -> Result<String, CliError> {
    if password_stdin {
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| CliError::Credentials(format!("Failed to read password from stdin: {}", e)))?;
        return Ok(input.trim_end_matches(['\r', '\n']).to_string());
    }

    if std::io::stdin().is_terminal() {
        eprint!("{}: ", prompt);
        rpassword::read_password()
            .map_err(|e| CliError::Credentials(format!("Failed to read password: {}", e)))
    } else {
        Err(CliError::Credentials(
            "No password provided. Use --password-stdin when piping input.".to_string(),
        ))
    }
}

/// Get credentials from CLI options and environment.
///
/// Password is read from KLAP_PASSWORD env var, stdin (if --password-stdin),
/// or interactively prompted. Without a username, blank credentials are used
/// and the handshake falls back to the default sets.
pub fn get_credentials(username: Option<String>, password_stdin: bool) -> Result<Credentials, CliError> {
    let Some(user) = username else {
        return Ok(Credentials::blank());
    };

    if let Ok(pass) = std::env::var("KLAP_PASSWORD") {
        return Ok(Credentials::new(user, pass));
    }

    let prompt = format!("Password for {}", user);
    let pass = read_password(password_stdin, &prompt)?;
    Ok(Credentials::new(user, pass))
}

/// Registry path from the flag, or `devices.json` in the platform config dir.
pub fn registry_path(explicit: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    ProjectDirs::from("", "", "klap")
        .map(|dirs| dirs.config_dir().join("devices.json"))
        .ok_or(CliError::NoConfigDir)
}

/// Print a value as a single line of JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
