//! KLAP protocol session: two-phase handshake plus the encrypted request channel.
//!
//! # Protocol Overview
//!
//! 1. **Handshake 1**: client sends 16 random bytes, device answers with its
//!    own 16-byte seed, a 32-byte proof of the credentials, and a session cookie
//! 2. **Handshake 2**: client proves knowledge of the same credentials
//! 3. **Request**: JSON envelopes are encrypted under keys derived from both
//!    seeds and posted to `/app/request?seq=N`
//!
//! # Authentication
//!
//! The device proves which credentials it is bound to in handshake 1. The
//! session checks the configured credentials first, then blank credentials,
//! then the vendor test account, and adopts whichever matches. A match on a
//! fallback usually means the device was never bound to an account or was
//! reset.
//!
//! # Session expiry
//!
//! Devices drop sessions after a while and answer requests with HTTP 403.
//! [`ProtocolSession::send_request`] re-handshakes once and retries the same
//! request once; a second 403 fails with [`Error::SessionExpired`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    Credentials,
    commands::{self, Request},
    credentials::DefaultCredentials,
    crypto::klap::{
        AuthHash, CipherContext, HASH_LEN, SEED_LEN, generate_auth_hash,
        handshake1_seed_auth_hash, handshake2_seed_auth_hash,
    },
    error::Error,
    response::{DeviceInfo, DeviceSnapshot, ResponseEnvelope},
    transport::{HANDSHAKE1_PATH, HANDSHAKE2_PATH, Transport, request_path},
};

/// HTTP status a device uses to signal that the session is gone.
pub const SESSION_EXPIRED_STATUS: u16 = 403;

/// Label for the configured credentials in logs.
const CONFIGURED_LABEL: &str = "configured";

/// Lifecycle of a [`ProtocolSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake attempted yet, or the last one failed at the transport level.
    Unauthenticated,
    /// A handshake is in progress.
    Handshaking,
    /// Keys are established; requests can be sent.
    Ready,
    /// The device reported the session expired.
    Expired,
    /// No credential set matched the device.
    Failed,
}

/// Result of one encrypted exchange.
enum Exchange {
    Reply(Value),
    Expired,
}

/// An authenticated, encrypted channel to one device.
///
/// A session owns its [`CipherContext`] exclusively. Requests mutate the
/// sequence counter, so every method that talks to the device takes
/// `&mut self`; share a session between tasks behind a mutex, never clone it.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use klap_core::{Credentials, ProtocolSession, transport::HttpTransport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(HttpTransport::new("192.168.1.100", 80));
///     let credentials = Credentials::new("user@example.com", "password");
///     let mut session = ProtocolSession::new(transport, credentials, Duration::from_secs(10));
///
///     session.handshake().await?;
///     let info = session.get_device_info().await?;
///     println!("{} is {}", info.name, if info.is_on { "on" } else { "off" });
///     Ok(())
/// }
/// ```
pub struct ProtocolSession {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    timeout: Duration,
    state: SessionState,
    cipher: Option<CipherContext>,
    cookie: Option<String>,
    matched: Option<&'static str>,
    established_at: Option<DateTime<Utc>>,
}

impl ProtocolSession {
    /// Creates an unauthenticated session over `transport`.
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            transport,
            credentials,
            timeout,
            state: SessionState::Unauthenticated,
            cipher: None,
            cookie: None,
            matched: None,
            established_at: None,
        }
    }

    /// Device address this session talks to.
    pub fn address(&self) -> &str {
        self.transport.host()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns `true` once the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Which credential set the device accepted ("configured", "blank" or
    /// "default test"), once ready.
    pub fn matched_credentials(&self) -> Option<&'static str> {
        self.matched
    }

    /// When the current keys were established.
    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        self.established_at
    }

    /// Sequence number of the most recent request, once ready.
    pub fn seq(&self) -> Option<i32> {
        self.cipher.as_ref().map(CipherContext::seq)
    }

    /// Performs the two-phase handshake, replacing any existing keys.
    ///
    /// On an authentication mismatch the session ends up
    /// [`Failed`](SessionState::Failed); any other failure leaves it
    /// [`Unauthenticated`](SessionState::Unauthenticated).
    pub async fn handshake(&mut self) -> Result<(), Error> {
        self.state = SessionState::Handshaking;
        self.cipher = None;
        self.cookie = None;
        self.matched = None;
        self.established_at = None;

        match self.perform_handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = match e {
                    Error::Authentication(_) => SessionState::Failed,
                    _ => SessionState::Unauthenticated,
                };
                debug!(host = self.address(), error = %e, "Handshake failed");
                Err(e)
            }
        }
    }

    async fn perform_handshake(&mut self) -> Result<(), Error> {
        let host = self.transport.host().to_string();

        let mut local_seed = [0u8; SEED_LEN];
        rand::rng().fill_bytes(&mut local_seed);

        let response = self
            .transport
            .post(HANDSHAKE1_PATH, &local_seed, None, self.timeout)
            .await
            .map_err(|e| Error::Handshake(format!("handshake1 to {}: {}", host, e)))?;

        if !response.is_success() {
            return Err(Error::Handshake(format!(
                "handshake1 to {} returned status {}",
                host, response.status
            )));
        }

        if response.body.len() < SEED_LEN + HASH_LEN {
            return Err(Error::Handshake(format!(
                "handshake1 response too short: {} bytes",
                response.body.len()
            )));
        }

        let (remote, server_hash) = response.body.split_at(SEED_LEN);
        let server_hash = &server_hash[..HASH_LEN];
        let mut remote_seed = [0u8; SEED_LEN];
        remote_seed.copy_from_slice(remote);
        let cookie = response.session_cookie;

        debug!(
            host = %host,
            local_seed = %hex::encode(local_seed),
            remote_seed = %hex::encode(remote_seed),
            "Handshake1 completed, checking credentials"
        );

        let (label, auth_hash) = self
            .match_auth_hash(&local_seed, &remote_seed, server_hash)
            .ok_or_else(|| {
                Error::Authentication(format!(
                    "{}: device proof did not match configured, blank or default credentials",
                    host
                ))
            })?;

        let payload = handshake2_seed_auth_hash(&local_seed, &remote_seed, &auth_hash);
        let response = self
            .transport
            .post(HANDSHAKE2_PATH, &payload, cookie.as_deref(), self.timeout)
            .await
            .map_err(|e| Error::Handshake(format!("handshake2 to {}: {}", host, e)))?;

        if !response.is_success() {
            return Err(Error::Handshake(format!(
                "handshake2 to {} returned status {}",
                host, response.status
            )));
        }

        self.cipher = Some(CipherContext::new(&local_seed, &remote_seed, &auth_hash));
        self.cookie = cookie;
        self.matched = Some(label);
        self.established_at = Some(Utc::now());
        self.state = SessionState::Ready;

        if label == CONFIGURED_LABEL {
            info!(host = %host, "KLAP handshake completed");
        } else {
            warn!(host = %host, credentials = label, "KLAP handshake matched fallback credentials");
        }
        Ok(())
    }

    /// Finds the credential set whose handshake1 proof equals `server_hash`.
    fn match_auth_hash(
        &self,
        local_seed: &[u8; SEED_LEN],
        remote_seed: &[u8; SEED_LEN],
        server_hash: &[u8],
    ) -> Option<(&'static str, AuthHash)> {
        let mut candidates = vec![(CONFIGURED_LABEL, self.credentials.clone())];
        candidates.extend(
            DefaultCredentials::fallback_order()
                .iter()
                .map(|fallback| (fallback.label(), fallback.credentials()))
                .filter(|(_, creds)| *creds != self.credentials),
        );

        candidates.into_iter().find_map(|(label, creds)| {
            let auth_hash = generate_auth_hash(&creds);
            let expected = handshake1_seed_auth_hash(local_seed, remote_seed, &auth_hash);
            (expected.as_slice() == server_hash).then_some((label, auth_hash))
        })
    }

    /// Marks the session expired and drops its keys.
    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
        self.cipher = None;
        self.cookie = None;
    }

    /// Sends a command envelope and returns its `result`.
    ///
    /// Handshakes first if the session isn't ready. On a session-expired
    /// response the session re-handshakes once and retries once.
    pub async fn send_request(&mut self, request: &Request) -> Result<Value, Error> {
        if !self.is_ready() {
            self.handshake().await?;
        }

        if let Exchange::Reply(result) = self.exchange(request).await? {
            return Ok(result);
        }

        warn!(host = self.address(), method = %request.method, "Session expired, re-handshaking");
        self.expire();
        self.handshake().await?;

        match self.exchange(request).await? {
            Exchange::Reply(result) => Ok(result),
            Exchange::Expired => {
                self.expire();
                Err(Error::SessionExpired)
            }
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Exchange, Error> {
        let plaintext = request.to_bytes()?;
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| Error::Protocol("session has no keys".into()))?;
        let (payload, seq) = cipher.encrypt(&plaintext);

        debug!(host = self.transport.host(), method = %request.method, seq, "Sending request");

        let response = self
            .transport
            .post(&request_path(seq), &payload, self.cookie.as_deref(), self.timeout)
            .await?;

        match response.status {
            200 => {}
            SESSION_EXPIRED_STATUS => return Ok(Exchange::Expired),
            status => return Err(Error::Request(status)),
        }

        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Protocol("session has no keys".into()))?;
        let decrypted = cipher
            .decrypt(&response.body, seq)
            .map_err(|e| Error::Decrypt(e.to_string()))?;

        let envelope: ResponseEnvelope = serde_json::from_slice(&decrypted)?;
        if !envelope.is_success() {
            return Err(Error::DeviceCommand(envelope.error_code));
        }
        Ok(Exchange::Reply(envelope.result))
    }

    /// Fetches and normalizes the device state.
    pub async fn get_device_info(&mut self) -> Result<DeviceSnapshot, Error> {
        let result = self.send_request(&commands::get_device_info()).await?;
        let info: DeviceInfo = serde_json::from_value(result)?;
        Ok(info.into())
    }

    /// Switches the device on or off.
    pub async fn set_power(&mut self, on: bool) -> Result<(), Error> {
        self.send_request(&commands::set_power(on)).await.map(drop)
    }

    /// Sets brightness, clamped to 1-100.
    pub async fn set_brightness(&mut self, brightness: u32) -> Result<(), Error> {
        self.send_request(&commands::set_brightness(brightness))
            .await
            .map(drop)
    }

    /// Sets hue (0-360) and saturation (0-100), leaving white mode.
    pub async fn set_hue_saturation(&mut self, hue: u16, saturation: u8) -> Result<(), Error> {
        self.send_request(&commands::set_hue_saturation(hue, saturation))
            .await
            .map(drop)
    }

    /// Sets color temperature, clamped to 2000-9000 K.
    pub async fn set_color_temp(&mut self, kelvin: u32) -> Result<(), Error> {
        self.send_request(&commands::set_color_temp(kelvin))
            .await
            .map(drop)
    }
}

impl fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("address", &self.address())
            .field("state", &self.state)
            .field("credentials", &self.credentials)
            .field("cookie", &self.cookie.as_ref().map(|_| "[REDACTED]"))
            .field("matched", &self.matched)
            .field("seq", &self.seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::transport::mock::{MockDevice, MockNetwork, MockTransport};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn user() -> Credentials {
        Credentials::new("a@b.com", "pw")
    }

    fn session_for(device: &Arc<MockDevice>, credentials: Credentials) -> ProtocolSession {
        let transport = Arc::new(MockTransport::new("10.0.0.5", Arc::clone(device)));
        ProtocolSession::new(transport, credentials, TIMEOUT)
    }

    #[tokio::test]
    async fn test_handshake_with_configured_credentials() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());

        assert_eq!(session.state(), SessionState::Unauthenticated);
        session.handshake().await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.matched_credentials(), Some("configured"));
        assert!(session.established_at().is_some());
        assert_eq!(device.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_handshake_falls_back_to_blank() {
        let device = MockDevice::new(&Credentials::blank());
        let mut session = session_for(&device, user());

        session.handshake().await.unwrap();
        assert_eq!(session.matched_credentials(), Some("blank"));
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_handshake_falls_back_to_default_test_account() {
        let device = MockDevice::new(&DefaultCredentials::Test.credentials());
        let mut session = session_for(&device, user());

        session.handshake().await.unwrap();
        assert_eq!(session.matched_credentials(), Some("default test"));
    }

    #[tokio::test]
    async fn test_handshake_no_credentials_match() {
        let device = MockDevice::new(&Credentials::new("someone@else.com", "secret"));
        let mut session = session_for(&device, user());

        let err = session.handshake().await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(device.handshake1_calls.load(Ordering::SeqCst), 1);
        assert_eq!(device.handshake2_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handshake_unreachable_device() {
        let network = MockNetwork::new();
        let transport = (network.factory())("10.0.0.9");
        let mut session = ProtocolSession::new(transport, user(), TIMEOUT);

        let err = session.handshake().await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_send_request_auto_handshakes() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());

        let info = session.get_device_info().await.unwrap();
        assert_eq!(info.name, "Living Room");
        assert_eq!(info.model, "L530");
        assert!(!info.is_on);
        assert_eq!(device.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_sequence_advances_per_request() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());
        session.handshake().await.unwrap();

        let start = session.seq().unwrap();
        session.get_device_info().await.unwrap();
        session.set_power(true).await.unwrap();
        assert_eq!(session.seq(), Some(start.wrapping_add(2)));
        assert_eq!(device.methods(), ["get_device_info", "set_device_info"]);
    }

    #[tokio::test]
    async fn test_session_expired_once_rehandshakes_and_retries() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());
        session.handshake().await.unwrap();

        device.expire_next(1);
        let info = session.get_device_info().await.unwrap();

        assert_eq!(info.id, "80223A8E5B1C");
        assert_eq!(device.handshakes(), 2);
        assert_eq!(device.request_calls.load(Ordering::SeqCst), 2);
        assert!(session.is_ready());
        // The expired attempt never reached the device
        assert_eq!(device.methods(), ["get_device_info"]);
    }

    #[tokio::test]
    async fn test_session_expired_twice_fails_without_looping() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());
        session.handshake().await.unwrap();

        device.expire_next(2);
        let err = session.get_device_info().await.unwrap_err();

        assert!(matches!(err, Error::SessionExpired));
        assert_eq!(device.handshakes(), 2);
        assert_eq!(device.request_calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_device_error_code() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());

        let err = session
            .send_request(&Request::new("get_energy_usage"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceCommand(-1002)));
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_setters_transmit_clamped_values() {
        let device = MockDevice::new(&user());
        let mut session = session_for(&device, user());

        session.set_brightness(150).await.unwrap();
        session.set_color_temp(1000).await.unwrap();
        session.set_hue_saturation(200, 50).await.unwrap();

        let envelopes = device.envelopes();
        assert_eq!(envelopes[0]["params"]["brightness"], 100);
        assert_eq!(envelopes[1]["params"]["color_temp"], 2000);
        assert_eq!(envelopes[2]["params"]["hue"], 200);
        assert_eq!(envelopes[2]["params"]["color_temp"], 0);

        let info = session.get_device_info().await.unwrap();
        assert_eq!(info.brightness, Some(100));
        assert_eq!(info.hue, Some(200));
        assert_eq!(info.saturation, Some(50));
        assert_eq!(info.color_temp, Some(0));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let device = MockDevice::new(&user());
        let session = session_for(&device, user());
        let output = format!("{:?}", session);
        assert!(output.contains("10.0.0.5"));
        assert!(!output.contains("\"pw\""));
    }
}
