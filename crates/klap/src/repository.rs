//! JSON file storage for the device registry.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use klap_core::{DeviceRecord, DeviceRepository, Error};
use serde::{Deserialize, Serialize};
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// Stores device records as pretty-printed JSON.
///
/// A missing file reads as an empty registry. Saves go to a sibling temp file
/// that is then renamed over the original.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn repository_error(path: &Path, action: &str, err: impl std::fmt::Display) -> Error {
    Error::Repository(format!("{} {}: {}", action, path.display(), err))
}

impl DeviceRepository for JsonFileRepository {
    fn load(&self) -> Result<Vec<DeviceRecord>, Error> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No registry file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(repository_error(&self.path, "read", e)),
        };

        let file: RegistryFile = serde_json::from_str(&contents)
            .map_err(|e| repository_error(&self.path, "parse", e))?;
        if file.version != FORMAT_VERSION {
            return Err(repository_error(
                &self.path,
                "load",
                format!("unsupported format version {}", file.version),
            ));
        }
        Ok(file.devices)
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| repository_error(parent, "create", e))?;
        }

        let file = RegistryFile {
            version: FORMAT_VERSION,
            devices: records.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| repository_error(&self.path, "serialize", e))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| repository_error(&tmp, "write", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| repository_error(&self.path, "replace", e))?;

        debug!(path = %self.path.display(), count = records.len(), "Saved registry");
        Ok(())
    }
}
