//! Subnet scanning to find KLAP devices.
//!
//! A probe is a bare handshake1 with a throwaway seed: anything answering
//! HTTP 200 on `/app/handshake1` counts as a responder. Probes go out in
//! batches (50 by default); batches run one after another, hosts within a
//! batch run concurrently. Responders are then identified with a full
//! handshake and `get_device_info`.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::future::join_all;
use ipnet::Ipv4Net;
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    Credentials,
    crypto::klap::SEED_LEN,
    error::Error,
    response::DeviceSnapshot,
    session::ProtocolSession,
    transport::{HANDSHAKE1_PATH, TransportFactory},
};

/// Default timeout of a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of probes in flight at once.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Prefix length every scan works on.
pub const SCAN_PREFIX_LEN: u8 = 24;

/// Interface name prefixes of container, VM and VPN adapters.
const VIRTUAL_INTERFACE_PREFIXES: &[&str] = &[
    "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "utun", "tun", "tap", "zt", "wg",
];

/// Progress reported after each probe batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    /// Subnet being scanned.
    pub subnet: Ipv4Net,
    /// Hosts probed so far.
    pub scanned: usize,
    /// Hosts in the subnet.
    pub total: usize,
    /// Responders found so far.
    pub found: usize,
}

/// Outcome for one responding address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryResult {
    /// Device address.
    pub address: String,
    /// The address answered the probe.
    pub responded: bool,
    /// Handshake and `get_device_info` succeeded with the configured credentials.
    pub authenticated: bool,
    /// Device state, when authenticated.
    pub info: Option<DeviceSnapshot>,
    /// The address is already in the device registry.
    pub already_known: bool,
    /// Why identification failed, when it did.
    pub auth_error: Option<String>,
}

/// The /24 subnet containing `address`.
pub fn subnet_of(address: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::new(address, SCAN_PREFIX_LEN)
        .map(|net| net.trunc())
        .unwrap_or_else(|_| Ipv4Net::from(address))
}

/// Parses a caller-supplied subnet into the /24 to scan.
///
/// Accepts `a.b.c.0/24`, `a.b.c.d` (its /24), and `a.b.c`. CIDR prefixes
/// longer than 24 are widened to their /24; shorter ones are rejected.
pub fn parse_subnet(input: &str) -> Result<Ipv4Net, Error> {
    let input = input.trim();
    let invalid = || Error::InvalidArgument(format!("invalid subnet: {:?}", input));

    if input.contains('/') {
        let net: Ipv4Net = input.parse().map_err(|_| invalid())?;
        if net.prefix_len() < SCAN_PREFIX_LEN {
            return Err(Error::InvalidArgument(format!(
                "subnet {} is larger than a /{}",
                net, SCAN_PREFIX_LEN
            )));
        }
        return Ok(subnet_of(net.network()));
    }

    let address = match input.split('.').count() {
        3 => format!("{}.0", input).parse::<Ipv4Addr>(),
        _ => input.parse::<Ipv4Addr>(),
    }
    .map_err(|_| invalid())?;

    Ok(subnet_of(address))
}

/// Returns `true` for container, VM and VPN adapter names.
fn is_virtual_interface(name: &str) -> bool {
    VIRTUAL_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// The /24 base of an interface address.
///
/// The network base is `address & netmask`. Networks wider than a /24 are
/// narrowed to the /24 holding the interface address, so the host's own
/// neighbours are the ones scanned.
fn interface_subnet(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Net {
    let prefix = u32::from(netmask).count_ones() as u8;
    let base = Ipv4Addr::from(u32::from(address) & u32::from(netmask));
    if prefix < SCAN_PREFIX_LEN {
        subnet_of(address)
    } else {
        subnet_of(base)
    }
}

/// Subnets of the non-loopback, non-virtual IPv4 interfaces on this host.
pub fn local_subnets() -> Result<Vec<Ipv4Net>, Error> {
    let interfaces = if_addrs::get_if_addrs()?;

    let subnets: BTreeSet<Ipv4Net> = interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback() && !is_virtual_interface(&iface.name))
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) if !v4.ip.is_link_local() => {
                debug!(interface = %iface.name, ip = %v4.ip, "Found local interface");
                Some(interface_subnet(v4.ip, v4.netmask))
            }
            _ => None,
        })
        .collect();

    Ok(subnets.into_iter().collect())
}

/// Probes subnets for devices and identifies the responders.
pub struct SubnetScanner {
    factory: TransportFactory,
    credentials: Credentials,
    timeout: Duration,
    probe_timeout: Duration,
    batch_size: usize,
}

impl SubnetScanner {
    /// Creates a scanner.
    ///
    /// `timeout` bounds identification handshakes, `probe_timeout` bounds
    /// each probe. A `batch_size` of 0 is treated as 1.
    pub fn new(
        factory: TransportFactory,
        credentials: Credentials,
        timeout: Duration,
        probe_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            factory,
            credentials,
            timeout,
            probe_timeout,
            batch_size: batch_size.max(1),
        }
    }

    /// Returns `true` if `address` answers handshake1 with HTTP 200.
    ///
    /// Timeouts and connection errors mean "not a device", never an error.
    pub async fn probe(&self, address: &str) -> bool {
        let mut seed = [0u8; SEED_LEN];
        rand::rng().fill_bytes(&mut seed);

        let transport = (self.factory)(address);
        match transport
            .post(HANDSHAKE1_PATH, &seed, None, self.probe_timeout)
            .await
        {
            Ok(response) => response.is_success(),
            Err(_) => false,
        }
    }

    /// Probes every usable host of `subnet` and returns the responders.
    ///
    /// `subnet` is normalized to the /24 holding its network address.
    /// `observer` is called after each batch.
    pub async fn scan_subnet(
        &self,
        subnet: Ipv4Net,
        observer: &mut (dyn FnMut(ScanProgress) + Send),
    ) -> Vec<Ipv4Addr> {
        let subnet = subnet_of(subnet.network());
        let hosts: Vec<Ipv4Addr> = subnet.hosts().collect();
        let total = hosts.len();
        let mut found = Vec::new();
        let mut scanned = 0;

        debug!(%subnet, total, batch = self.batch_size, "Scanning subnet");

        for batch in hosts.chunks(self.batch_size) {
            let probes = batch.iter().map(|&address| async move {
                (address, self.probe(&address.to_string()).await)
            });
            let results = join_all(probes).await;

            scanned += batch.len();
            found.extend(
                results
                    .into_iter()
                    .filter_map(|(address, responded)| responded.then_some(address)),
            );

            observer(ScanProgress {
                subnet,
                scanned,
                total,
                found: found.len(),
            });
        }

        info!(%subnet, found = found.len(), "Subnet scan complete");
        found
    }

    /// Scans `subnets` and identifies every responder.
    ///
    /// Duplicate subnets are scanned once and duplicate responders reported
    /// once. Responders that fail authentication are still returned, with
    /// `auth_error` set. Results are ordered by address.
    pub async fn discover_all(
        &self,
        subnets: impl IntoIterator<Item = Ipv4Net>,
        known_addresses: &HashSet<String>,
        observer: &mut (dyn FnMut(ScanProgress) + Send),
    ) -> Vec<DiscoveryResult> {
        let subnets: BTreeSet<Ipv4Net> = subnets
            .into_iter()
            .map(|net| subnet_of(net.network()))
            .collect();

        let mut responders = BTreeSet::new();
        for subnet in subnets {
            responders.extend(self.scan_subnet(subnet, observer).await);
        }

        let responders: Vec<Ipv4Addr> = responders.into_iter().collect();
        let mut results = Vec::with_capacity(responders.len());
        for batch in responders.chunks(self.batch_size) {
            let identifications = batch
                .iter()
                .map(|&address| self.identify(address, known_addresses));
            results.extend(join_all(identifications).await);
        }

        info!(
            responders = results.len(),
            authenticated = results.iter().filter(|r| r.authenticated).count(),
            "Discovery complete"
        );
        results
    }

    async fn identify(&self, address: Ipv4Addr, known_addresses: &HashSet<String>) -> DiscoveryResult {
        let address = address.to_string();
        let transport = (self.factory)(&address);
        let mut session = ProtocolSession::new(transport, self.credentials.clone(), self.timeout);

        let (info, auth_error) = match session.get_device_info().await {
            Ok(info) => (Some(info), None),
            Err(e) => {
                debug!(address = %address, error = %e, "Could not identify responder");
                (None, Some(e.to_string()))
            }
        };

        DiscoveryResult {
            already_known: known_addresses.contains(&address),
            address,
            responded: true,
            authenticated: info.is_some(),
            info,
            auth_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::transport::mock::{MockDevice, MockNetwork};

    fn user() -> Credentials {
        Credentials::new("a@b.com", "pw")
    }

    fn scanner(network: &Arc<MockNetwork>) -> SubnetScanner {
        SubnetScanner::new(
            network.factory(),
            user(),
            Duration::from_secs(10),
            DEFAULT_PROBE_TIMEOUT,
            DEFAULT_BATCH_SIZE,
        )
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_subnet_formats() {
        assert_eq!(parse_subnet("192.168.1.0/24").unwrap(), net("192.168.1.0/24"));
        assert_eq!(parse_subnet("192.168.1.0").unwrap(), net("192.168.1.0/24"));
        assert_eq!(parse_subnet("192.168.1.77").unwrap(), net("192.168.1.0/24"));
        assert_eq!(parse_subnet(" 192.168.1 ").unwrap(), net("192.168.1.0/24"));
        assert_eq!(parse_subnet("10.1.2.64/26").unwrap(), net("10.1.2.0/24"));
    }

    #[test]
    fn test_parse_subnet_rejects_invalid() {
        for input in ["", "192.168", "192.168.1.300", "10.0.0.0/16", "not-a-subnet", "1.2.3.4/33"] {
            assert!(
                matches!(parse_subnet(input), Err(Error::InvalidArgument(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_interface_subnet() {
        let ip = Ipv4Addr::new(192, 168, 1, 42);
        assert_eq!(
            interface_subnet(ip, Ipv4Addr::new(255, 255, 255, 0)),
            net("192.168.1.0/24")
        );
        assert_eq!(
            interface_subnet(ip, Ipv4Addr::new(255, 255, 255, 192)),
            net("192.168.1.0/24")
        );
        assert_eq!(
            interface_subnet(Ipv4Addr::new(172, 16, 5, 9), Ipv4Addr::new(255, 255, 0, 0)),
            net("172.16.5.0/24")
        );
    }

    #[test]
    fn test_virtual_interfaces_filtered() {
        assert!(is_virtual_interface("docker0"));
        assert!(is_virtual_interface("veth12ab"));
        assert!(is_virtual_interface("br-4f1c"));
        assert!(is_virtual_interface("utun3"));
        assert!(!is_virtual_interface("eth0"));
        assert!(!is_virtual_interface("en0"));
        assert!(!is_virtual_interface("wlan0"));
    }

    #[tokio::test]
    async fn test_probe_classifies_by_status() {
        let network = MockNetwork::new();
        network.add("10.0.0.5", MockDevice::new(&user()));
        let scanner = scanner(&network);

        assert!(scanner.probe("10.0.0.5").await);
        assert!(!scanner.probe("10.0.0.6").await);
    }

    #[tokio::test]
    async fn test_scan_subnet_bounded_and_complete() {
        let network = MockNetwork::new();
        network.add("10.0.0.5", MockDevice::new(&user()));
        network.add("10.0.0.200", MockDevice::new(&user()));
        let scanner = scanner(&network);

        let mut progress = Vec::new();
        let found = scanner
            .scan_subnet(net("10.0.0.0/24"), &mut |p| progress.push(p))
            .await;

        assert_eq!(
            found,
            vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 200)]
        );

        let probed = network.probed();
        assert_eq!(probed.len(), 254);
        assert_eq!(network.distinct_probed().len(), 254);
        assert!(!network.distinct_probed().contains("10.0.0.0"));
        assert!(!network.distinct_probed().contains("10.0.0.255"));

        let max = network.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= DEFAULT_BATCH_SIZE, "{max} probes in flight");
        assert!(max > 1);

        let scanned: Vec<usize> = progress.iter().map(|p| p.scanned).collect();
        assert_eq!(scanned, vec![50, 100, 150, 200, 250, 254]);
        assert!(progress.iter().all(|p| p.total == 254));
        assert_eq!(progress.last().unwrap().found, 2);
    }

    #[tokio::test]
    async fn test_small_batch_size() {
        let network = MockNetwork::new();
        let scanner = SubnetScanner::new(
            network.factory(),
            user(),
            Duration::from_secs(10),
            DEFAULT_PROBE_TIMEOUT,
            8,
        );

        let mut batches = 0;
        scanner
            .scan_subnet(net("10.9.9.0/24"), &mut |_| batches += 1)
            .await;

        assert_eq!(batches, 32);
        assert!(network.max_in_flight.load(Ordering::SeqCst) <= 8);
    }

    #[tokio::test]
    async fn test_discover_all_reports_and_tags() {
        let network = MockNetwork::new();
        network.add("10.0.0.5", MockDevice::new(&user()));
        network.add(
            "10.0.0.9",
            MockDevice::new(&Credentials::new("owner@elsewhere.com", "secret")),
        );
        let scanner = scanner(&network);

        let known = HashSet::from(["10.0.0.5".to_string()]);
        let results = scanner
            .discover_all(
                [net("10.0.0.0/24"), net("10.0.0.0/24")],
                &known,
                &mut |_| {},
            )
            .await;

        assert_eq!(results.len(), 2);

        let bulb = &results[0];
        assert_eq!(bulb.address, "10.0.0.5");
        assert!(bulb.responded && bulb.authenticated && bulb.already_known);
        assert_eq!(bulb.info.as_ref().unwrap().name, "Living Room");
        assert_eq!(bulb.auth_error, None);

        let foreign = &results[1];
        assert_eq!(foreign.address, "10.0.0.9");
        assert!(foreign.responded);
        assert!(!foreign.authenticated && !foreign.already_known);
        assert!(foreign.info.is_none());
        assert!(foreign.auth_error.as_deref().unwrap().contains("authentication failed"));

        // One scan of the /24, then handshake1+handshake2+request for the bulb
        // and handshake1 alone for the foreign device.
        assert_eq!(network.probed().len(), 254 + 3 + 1);
    }

    #[tokio::test]
    async fn test_wide_subnets_scan_a_single_slash_24() {
        let network = MockNetwork::new();
        network.add("10.0.0.5", MockDevice::new(&user()));
        let scanner = scanner(&network);

        let mut totals = Vec::new();
        let found = scanner
            .scan_subnet(net("10.0.0.0/16"), &mut |p| totals.push((p.subnet, p.total)))
            .await;
        assert_eq!(found, vec![Ipv4Addr::new(10, 0, 0, 5)]);
        assert!(totals.iter().all(|&(subnet, total)| subnet == net("10.0.0.0/24") && total == 254));

        let before = network.probed().len();
        let results = scanner
            .discover_all([net("10.0.0.0/8")], &HashSet::new(), &mut |_| {})
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(network.probed().len() - before, 254 + 3);
    }
}
