//! Transport layer for exchanging raw bytes with KLAP devices.
//!
//! A [`Transport`] knows nothing about encryption: it POSTs an opaque body to
//! a path under `/app` and hands back the status, body and any session cookie
//! the device set. [`ProtocolSession`](crate::session::ProtocolSession) layers
//! the handshake and cipher on top.
//!
//! - [`HttpTransport`]: HTTP/1.1 over a raw TCP socket (port 80)

pub mod http;
#[cfg(test)]
pub(crate) mod mock;

pub use http::HttpTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;

/// Default timeout for protocol calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default HTTP port for KLAP devices.
pub const DEFAULT_PORT: u16 = 80;

/// Path of the first handshake step.
pub const HANDSHAKE1_PATH: &str = "/app/handshake1";

/// Path of the second handshake step.
pub const HANDSHAKE2_PATH: &str = "/app/handshake2";

/// Builds the encrypted request path for a sequence number.
pub fn request_path(seq: i32) -> String {
    format!("/app/request?seq={}", seq)
}

/// Response to a single POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
    /// Session cookie value, if the device set one.
    pub session_cookie: Option<String>,
}

impl HttpResponse {
    /// Returns `true` for a 200 status.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Trait for raw request/response exchange with a device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs `body` to `path`, attaching `cookie` when present.
    ///
    /// Fails with [`Error::Timeout`] if the exchange does not finish within
    /// `timeout`, and [`Error::ConnectionFailed`] if the device is unreachable.
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, Error>;

    /// Returns the device host.
    fn host(&self) -> &str;
}

/// Creates a transport for a device address.
pub type TransportFactory = Arc<dyn Fn(&str) -> Arc<dyn Transport> + Send + Sync>;

/// Factory producing [`HttpTransport`]s on `port`.
pub fn http_factory(port: u16) -> TransportFactory {
    Arc::new(move |host: &str| Arc::new(HttpTransport::new(host, port)) as Arc<dyn Transport>)
}
