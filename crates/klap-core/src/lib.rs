//! Core library for the KLAP local control protocol spoken by TP-Link smart
//! plugs and bulbs.
//!
//! KLAP is a session-based, authenticated-encryption protocol over plain
//! HTTP. A client and device exchange random seeds, prove knowledge of the
//! same credentials without sending them, and derive AES-128 keys from the
//! seeds and an auth hash. Commands are JSON envelopes encrypted under those
//! keys.
//!
//! # Overview
//!
//! - [`crypto::klap`]: auth hash, handshake proofs, and the per-session cipher
//! - [`transport`]: raw HTTP exchange with a device
//! - [`session`]: handshake state machine and the encrypted request channel
//! - [`cache`]: one live session per device address, with a TTL
//! - [`scanner`]: subnet probing and device identification
//! - [`registry`]: persisted device metadata behind an injected repository
//! - [`client`]: the high-level API tying them together
//!
//! # Example
//!
//! ```no_run
//! use klap_core::{ClientConfig, Credentials, KlapClient, MemoryRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), klap_core::Error> {
//!     let config = ClientConfig::new(Credentials::new("user@example.com", "password"));
//!     let client = KlapClient::new(config, Box::new(MemoryRepository::default()))?;
//!
//!     for result in client.discover(&["192.168.1.0/24"]).await? {
//!         match result.info {
//!             Some(info) => println!("{}: {} ({})", result.address, info.name, info.model),
//!             None => println!("{}: {}", result.address, result.auth_error.unwrap_or_default()),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! 1. `POST /app/handshake1` with a 16-byte local seed; the device answers
//!    with its remote seed, a proof hash, and a `TP_SESSIONID` cookie
//! 2. `POST /app/handshake2` with the client's proof hash
//! 3. `POST /app/request?seq=N` with `signature || AES-128-CBC(envelope)`;
//!    the reply is encrypted under the same sequence number
//! 4. HTTP 403 on a request means the device dropped the session

pub mod cache;
pub mod client;
pub mod commands;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod registry;
pub mod response;
pub mod scanner;
pub mod session;
pub mod transport;

pub use cache::{SessionCache, SessionInfo, SharedSession};
pub use client::{ClientConfig, ColorSpec, DeviceHandle, KlapClient};
pub use credentials::{Credentials, DefaultCredentials};
pub use error::Error;
pub use registry::{Capability, DeviceRecord, DeviceRegistry, DeviceRepository, MemoryRepository};
pub use response::DeviceSnapshot;
pub use scanner::{DiscoveryResult, ScanProgress, SubnetScanner};
pub use session::{ProtocolSession, SessionState};
pub use transport::{DEFAULT_PORT, DEFAULT_TIMEOUT};

/// The version of the klap-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
