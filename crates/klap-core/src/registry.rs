//! Persisted device metadata.
//!
//! The registry is independent of runtime sessions: it remembers which
//! devices the user cares about (address, name, model, capabilities) so
//! discovery can tag known devices and rescan the subnets they live on.
//! Storage is injected through [`DeviceRepository`]; the format is the
//! caller's concern.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::Error, response::DeviceSnapshot, scanner::subnet_of};

/// Something a device can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    OnOff,
    Brightness,
    Color,
    ColorTemperature,
}

impl Capability {
    /// Derives capabilities from the fields a device reports.
    ///
    /// Every device switches on and off; the rest depend on which optional
    /// fields show up in `get_device_info`.
    pub fn infer(snapshot: &DeviceSnapshot) -> BTreeSet<Capability> {
        let mut capabilities = BTreeSet::from([Capability::OnOff]);
        if snapshot.brightness.is_some() {
            capabilities.insert(Capability::Brightness);
        }
        if snapshot.hue.is_some() && snapshot.saturation.is_some() {
            capabilities.insert(Capability::Color);
        }
        if snapshot.color_temp.is_some() {
            capabilities.insert(Capability::ColorTemperature);
        }
        capabilities
    }
}

/// A remembered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// IPv4 address or hostname.
    pub address: String,
    /// Name shown to the user.
    pub display_name: String,
    /// Device model.
    pub model: String,
    /// What the device supports.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// When the device was first added.
    pub added_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Builds a record from a freshly fetched snapshot.
    pub fn from_snapshot(address: impl Into<String>, snapshot: &DeviceSnapshot) -> Self {
        Self {
            address: address.into(),
            display_name: snapshot.name.clone(),
            model: snapshot.model.clone(),
            capabilities: Capability::infer(snapshot),
            added_at: Utc::now(),
        }
    }

    /// The address as IPv4, if it is one.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }
}

/// Storage backend for device records.
pub trait DeviceRepository: Send + Sync {
    /// Loads every stored record.
    fn load(&self) -> Result<Vec<DeviceRecord>, Error>;

    /// Replaces the stored records with `records`.
    fn save(&self, records: &[DeviceRecord]) -> Result<(), Error>;
}

/// In-memory repository.
///
/// Clones share storage, so a test can keep a handle and inspect what the
/// registry saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    records: Arc<Mutex<Vec<DeviceRecord>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryRepository {
    /// Creates a repository pre-filled with `records`.
    pub fn with_records(records: Vec<DeviceRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            saves: Arc::default(),
        }
    }

    /// Number of times [`save`](DeviceRepository::save) was called.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Snapshot of what is currently stored.
    pub fn stored(&self) -> Vec<DeviceRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl DeviceRepository for MemoryRepository {
    fn load(&self) -> Result<Vec<DeviceRecord>, Error> {
        self.records
            .lock()
            .map(|records| records.clone())
            .map_err(|_| Error::Repository("memory repository lock poisoned".into()))
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), Error> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| Error::Repository("memory repository lock poisoned".into()))?;
        *stored = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Device records backed by a [`DeviceRepository`].
///
/// Every mutation is written through to the repository before it is applied
/// in memory, so a failed save leaves the registry unchanged.
pub struct DeviceRegistry {
    repository: Box<dyn DeviceRepository>,
    records: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    /// Loads the registry from `repository`.
    pub fn load(repository: Box<dyn DeviceRepository>) -> Result<Self, Error> {
        let records = repository.load()?;
        debug!(count = records.len(), "Loaded device registry");
        Ok(Self {
            repository,
            records,
        })
    }

    /// All records in insertion order.
    pub fn list(&self) -> &[DeviceRecord] {
        &self.records
    }

    /// Looks up a record by address.
    pub fn get(&self, address: &str) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.address == address)
    }

    /// Returns `true` if `address` is registered.
    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    /// Every registered address.
    pub fn addresses(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.address.clone()).collect()
    }

    /// Inserts `record`, or updates the existing record at the same address.
    ///
    /// An update keeps the original `added_at`. Returns `true` if the record
    /// is new.
    pub fn upsert(&mut self, mut record: DeviceRecord) -> Result<bool, Error> {
        let mut next = self.records.clone();
        let inserted = match next.iter_mut().find(|r| r.address == record.address) {
            Some(existing) => {
                record.added_at = existing.added_at;
                *existing = record;
                false
            }
            None => {
                next.push(record);
                true
            }
        };
        self.commit(next)?;
        Ok(inserted)
    }

    /// Removes the record at `address`, returning it if present.
    pub fn remove(&mut self, address: &str) -> Result<Option<DeviceRecord>, Error> {
        let Some(index) = self.records.iter().position(|r| r.address == address) else {
            return Ok(None);
        };
        let mut next = self.records.clone();
        let removed = next.remove(index);
        self.commit(next)?;
        Ok(Some(removed))
    }

    /// Changes the display name of a registered device.
    pub fn rename(&mut self, address: &str, display_name: &str) -> Result<(), Error> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(Error::InvalidArgument("display name is empty".into()));
        }

        let mut next = self.records.clone();
        let record = next
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not registered", address)))?;
        record.display_name = display_name.to_string();
        self.commit(next)
    }

    /// The /24 subnets of every registered IPv4 address, deduplicated.
    pub fn known_subnets(&self) -> Vec<Ipv4Net> {
        self.records
            .iter()
            .filter_map(DeviceRecord::ipv4)
            .map(subnet_of)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn commit(&mut self, next: Vec<DeviceRecord>) -> Result<(), Error> {
        self.repository.save(&next)?;
        self.records = next;
        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}
