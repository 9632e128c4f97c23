//! High-level client tying sessions, discovery and the device registry together.
//!
//! # Example
//!
//! ```no_run
//! use klap_core::{ClientConfig, Credentials, KlapClient, MemoryRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(Credentials::new("user@example.com", "password"));
//!     let client = KlapClient::new(config, Box::new(MemoryRepository::default()))?;
//!
//!     let handle = client.connect("192.168.1.100").await?;
//!     client.turn_on(&handle).await?;
//!     client.set_brightness(&handle, 60).await?;
//!
//!     let info = client.get_device_info(&handle).await?;
//!     println!("{} ({}): on={}", info.name, info.model, info.is_on);
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::warn;

use crate::{
    Credentials,
    cache::{DEFAULT_SESSION_TTL, SessionCache, SessionInfo, SharedSession},
    commands::{MAX_HUE, MAX_SATURATION},
    error::Error,
    registry::{DeviceRecord, DeviceRegistry, DeviceRepository},
    response::DeviceSnapshot,
    scanner::{
        DEFAULT_BATCH_SIZE, DEFAULT_PROBE_TIMEOUT, DiscoveryResult, ScanProgress, SubnetScanner,
        local_subnets, parse_subnet,
    },
    transport::{DEFAULT_PORT, DEFAULT_TIMEOUT, TransportFactory, http_factory},
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Credentials tried first during every handshake.
    pub credentials: Credentials,
    /// Device HTTP port.
    pub port: u16,
    /// Timeout for handshake and request calls.
    pub timeout: Duration,
    /// Timeout for discovery probes.
    pub probe_timeout: Duration,
    /// How long a cached session is reused.
    pub session_ttl: Duration,
    /// Probes in flight at once during discovery.
    pub batch_size: usize,
    /// Whether discovery includes the subnets of local interfaces.
    pub scan_local_subnets: bool,
}

impl ClientConfig {
    /// Configuration with default timeouts for `credentials`.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            batch_size: DEFAULT_BATCH_SIZE,
            scan_local_subnets: true,
        }
    }

    /// Sets the device port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the timeout for handshakes and requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the timeout for discovery probes.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets how long a cached session is reused.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sets how many hosts are probed at once.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enables or disables scanning the host's own subnets during discovery.
    pub fn with_local_subnets(mut self, enabled: bool) -> Self {
        self.scan_local_subnets = enabled;
        self
    }
}

/// A device the client has connected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    address: String,
}

impl DeviceHandle {
    /// Device address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// A color to set on a bulb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSpec {
    /// Hue in degrees (0-360) and saturation in percent (0-100).
    HueSaturation { hue: u16, saturation: u8 },
    /// `#RRGGBB` or `RRGGBB`.
    Hex(String),
}

impl ColorSpec {
    /// Resolves to hue/saturation, clamped into range.
    pub fn to_hue_saturation(&self) -> Result<(u16, u8), Error> {
        match self {
            ColorSpec::HueSaturation { hue, saturation } => {
                Ok(((*hue).min(MAX_HUE), (*saturation).min(MAX_SATURATION)))
            }
            ColorSpec::Hex(hex) => hex_to_hue_saturation(hex),
        }
    }
}

impl FromStr for ColorSpec {
    type Err = Error;

    /// Parses `#RRGGBB`/`RRGGBB` or `hue,saturation`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((hue, saturation)) = s.split_once(',') {
            let parse_err = || Error::InvalidArgument(format!("invalid color: {:?}", s));
            return Ok(ColorSpec::HueSaturation {
                hue: hue.trim().parse().map_err(|_| parse_err())?,
                saturation: saturation.trim().parse().map_err(|_| parse_err())?,
            });
        }
        hex_to_hue_saturation(s)?;
        Ok(ColorSpec::Hex(s.to_string()))
    }
}

/// Converts an RGB hex color to hue (0-360) and saturation (0-100).
///
/// Brightness (HSV value) is not part of the result; set it separately.
pub fn hex_to_hue_saturation(hex: &str) -> Result<(u16, u8), Error> {
    let digits = hex.trim().trim_start_matches('#');
    let invalid = || Error::InvalidArgument(format!("invalid hex color: {:?}", hex));

    if digits.len() != 6 || !digits.is_ascii() {
        return Err(invalid());
    }
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16)
            .map(|v| f64::from(v) / 255.0)
            .map_err(|_| invalid())
    };
    let (r, g, b) = (channel(0..2)?, channel(2..4)?, channel(4..6)?);

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max * 100.0 };

    Ok((
        (hue.round() as u16).min(MAX_HUE),
        (saturation.round() as u8).min(MAX_SATURATION),
    ))
}

/// Entry point for controlling and discovering devices.
///
/// Holds one cached session per device address; concurrent calls against the
/// same device are serialized on that session.
pub struct KlapClient {
    config: ClientConfig,
    cache: SessionCache,
    scanner: SubnetScanner,
    registry: Mutex<DeviceRegistry>,
}

impl KlapClient {
    /// Creates a client talking HTTP on the configured port.
    pub fn new(config: ClientConfig, repository: Box<dyn DeviceRepository>) -> Result<Self, Error> {
        let factory = http_factory(config.port);
        Self::with_factory(config, factory, repository)
    }

    /// Creates a client that builds transports with `factory`.
    pub fn with_factory(
        config: ClientConfig,
        factory: TransportFactory,
        repository: Box<dyn DeviceRepository>,
    ) -> Result<Self, Error> {
        let registry = DeviceRegistry::load(repository)?;
        let cache = SessionCache::new(
            factory.clone(),
            config.credentials.clone(),
            config.timeout,
            config.session_ttl,
        );
        let scanner = SubnetScanner::new(
            factory,
            config.credentials.clone(),
            config.timeout,
            config.probe_timeout,
            config.batch_size,
        );
        Ok(Self {
            config,
            cache,
            scanner,
            registry: Mutex::new(registry),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Establishes (or reuses) a session with the device at `address`.
    pub async fn connect(&self, address: &str) -> Result<DeviceHandle, Error> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::InvalidArgument("device address is empty".into()));
        }
        self.cache.get(address).await?;
        Ok(DeviceHandle {
            address: address.to_string(),
        })
    }

    async fn session(&self, handle: &DeviceHandle) -> Result<SharedSession, Error> {
        self.cache.get(&handle.address).await
    }

    /// Evicts `session` from the cache when `result` failed in a way that breaks it.
    ///
    /// A newer session cached for the same address is left alone.
    fn settle<T>(
        &self,
        handle: &DeviceHandle,
        session: &SharedSession,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.invalidates_session() {
                warn!(address = %handle.address, error = %e, "Dropping cached session");
                if let Err(evict) = self.cache.remove_entry(&handle.address, session) {
                    warn!(error = %evict, "Could not evict cached session");
                }
            }
        }
        result
    }

    /// Fetches the current device state.
    pub async fn get_device_info(&self, handle: &DeviceHandle) -> Result<DeviceSnapshot, Error> {
        let session = self.session(handle).await?;
        let result = session.lock().await.get_device_info().await;
        self.settle(handle, &session, result)
    }

    /// Switches the device on.
    pub async fn turn_on(&self, handle: &DeviceHandle) -> Result<(), Error> {
        self.set_power(handle, true).await
    }

    /// Switches the device off.
    pub async fn turn_off(&self, handle: &DeviceHandle) -> Result<(), Error> {
        self.set_power(handle, false).await
    }

    async fn set_power(&self, handle: &DeviceHandle, on: bool) -> Result<(), Error> {
        let session = self.session(handle).await?;
        let result = session.lock().await.set_power(on).await;
        self.settle(handle, &session, result)
    }

    /// Sets brightness; values outside 1-100 are clamped.
    pub async fn set_brightness(&self, handle: &DeviceHandle, brightness: u32) -> Result<(), Error> {
        let session = self.session(handle).await?;
        let result = session.lock().await.set_brightness(brightness).await;
        self.settle(handle, &session, result)
    }

    /// Sets a color, switching the bulb out of white mode.
    pub async fn set_color(&self, handle: &DeviceHandle, color: &ColorSpec) -> Result<(), Error> {
        let (hue, saturation) = color.to_hue_saturation()?;
        let session = self.session(handle).await?;
        let result = session
            .lock()
            .await
            .set_hue_saturation(hue, saturation)
            .await;
        self.settle(handle, &session, result)
    }

    /// Sets color temperature; values outside 2000-9000 K are clamped.
    pub async fn set_color_temp(&self, handle: &DeviceHandle, kelvin: u32) -> Result<(), Error> {
        let session = self.session(handle).await?;
        let result = session.lock().await.set_color_temp(kelvin).await;
        self.settle(handle, &session, result)
    }

    /// Cache bookkeeping for a connected device.
    pub fn session_info(&self, handle: &DeviceHandle) -> Result<Option<SessionInfo>, Error> {
        self.cache.info(&handle.address)
    }

    /// Drops the cached session for a device.
    pub fn disconnect(&self, handle: &DeviceHandle) -> Result<bool, Error> {
        self.cache.invalidate(&handle.address)
    }

    /// Scans for devices.
    ///
    /// Scans the union of `subnets`, the subnets of registered devices and,
    /// unless disabled, the subnets of local interfaces.
    pub async fn discover<S: AsRef<str>>(&self, subnets: &[S]) -> Result<Vec<DiscoveryResult>, Error> {
        self.discover_with_progress(subnets, &mut |_| {}).await
    }

    /// Like [`discover`](Self::discover), reporting progress after each probe batch.
    pub async fn discover_with_progress<S: AsRef<str>>(
        &self,
        subnets: &[S],
        observer: &mut (dyn FnMut(ScanProgress) + Send),
    ) -> Result<Vec<DiscoveryResult>, Error> {
        let mut targets = subnets
            .iter()
            .map(|s| parse_subnet(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let known_addresses: HashSet<String> = {
            let registry = self.registry()?;
            targets.extend(registry.known_subnets());
            registry.addresses().into_iter().collect()
        };

        if self.config.scan_local_subnets {
            match local_subnets() {
                Ok(local) => targets.extend(local),
                Err(e) => warn!(error = %e, "Could not enumerate local interfaces"),
            }
        }

        if targets.is_empty() {
            warn!("No subnets to scan");
            return Ok(Vec::new());
        }

        Ok(self
            .scanner
            .discover_all(targets, &known_addresses, observer)
            .await)
    }

    fn registry(&self) -> Result<MutexGuard<'_, DeviceRegistry>, Error> {
        self.registry
            .lock()
            .map_err(|_| Error::Protocol("device registry lock poisoned".into()))
    }

    /// Every registered device.
    pub fn devices(&self) -> Result<Vec<DeviceRecord>, Error> {
        Ok(self.registry()?.list().to_vec())
    }

    /// Looks up a registered device.
    pub fn device(&self, address: &str) -> Result<Option<DeviceRecord>, Error> {
        Ok(self.registry()?.get(address).cloned())
    }

    /// Connects to `address`, reads its state and registers it.
    ///
    /// `display_name` overrides the name the device reports.
    pub async fn add_device(
        &self,
        address: &str,
        display_name: Option<&str>,
    ) -> Result<DeviceRecord, Error> {
        let handle = self.connect(address).await?;
        let info = self.get_device_info(&handle).await?;

        let mut record = DeviceRecord::from_snapshot(handle.address(), &info);
        if let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) {
            record.display_name = name.to_string();
        }

        let mut registry = self.registry()?;
        registry.upsert(record)?;
        registry
            .get(handle.address())
            .cloned()
            .ok_or_else(|| Error::Repository("record missing after save".into()))
    }

    /// Registers a device discovered earlier without contacting it again.
    pub fn register(&self, record: DeviceRecord) -> Result<bool, Error> {
        self.registry()?.upsert(record)
    }

    /// Unregisters a device.
    pub fn remove_device(&self, address: &str) -> Result<Option<DeviceRecord>, Error> {
        self.registry()?.remove(address)
    }

    /// Renames a registered device.
    pub fn rename_device(&self, address: &str, display_name: &str) -> Result<(), Error> {
        self.registry()?.rename(address, display_name)
    }
}
