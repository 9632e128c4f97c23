//! Credentials for KLAP authentication.
//!
//! This module provides the [`Credentials`] struct used to derive the auth
//! hash that the KLAP handshake proves knowledge of.
//!
//! # Fallback Credentials
//!
//! A device whose configured account no longer matches (never bound to a
//! cloud account, or factory reset) may still authenticate with one of two
//! fixed credential sets:
//! - **Blank**: empty username and password
//! - **Test**: the vendor's default test account
//!
//! The handshake tries the caller's credentials first, then these, in that
//! order. The caller's [`Credentials`] are never modified.
//!
//! # Security
//!
//! Passwords are stored using [`SecretString`] from the `secrecy` crate to prevent
//! accidental logging or display. Use [`Credentials::expose_password()`] to access
//! the raw password value when needed for authentication.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Credentials for authenticating with KLAP devices.
///
/// # Security
///
/// The password is stored as a [`SecretString`] to prevent accidental logging.
/// Use [`expose_password()`](Self::expose_password) to access the raw password.
///
/// # Example
///
/// ```
/// use klap_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// let blank = Credentials::blank();
///
/// assert!(blank.is_blank());
/// assert_eq!(creds.expose_password(), "password123");
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (typically the cloud account email address).
    pub username: String,
    /// The password for the account (protected from accidental logging).
    password: SecretString,
}

impl Credentials {
    /// Creates new credentials with the given username and password.
    ///
    /// The username is used exactly as given; no case normalization happens.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates blank credentials (empty username and password).
    pub fn blank() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Returns `true` if both username and password are empty.
    ///
    /// ```
    /// use klap_core::Credentials;
    ///
    /// assert!(Credentials::blank().is_blank());
    /// assert!(!Credentials::new("user", "pass").is_blank());
    /// ```
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for authentication purposes.
    ///
    /// Only use this when deriving the auth hash. Never log the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Fixed credential sets tried when the configured credentials don't match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultCredentials {
    /// Empty username and password (device never bound to an account).
    Blank,
    /// The vendor's default test account.
    Test,
}

impl DefaultCredentials {
    /// Returns the credentials for this fallback set.
    pub fn credentials(self) -> Credentials {
        match self {
            DefaultCredentials::Blank => Credentials::blank(),
            DefaultCredentials::Test => Credentials::new("test@tp-link.net", "test"),
        }
    }

    /// Returns the fallback sets in the order the handshake tries them.
    pub fn fallback_order() -> &'static [DefaultCredentials] {
        &[DefaultCredentials::Blank, DefaultCredentials::Test]
    }

    /// Short label used in log output.
    pub fn label(self) -> &'static str {
        match self {
            DefaultCredentials::Blank => "blank",
            DefaultCredentials::Test => "default test",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_new() {
        let creds = Credentials::new("user@example.com", "password123");
        assert_eq!(creds.username, "user@example.com");
        assert_eq!(creds.expose_password(), "password123");
    }

    #[test]
    fn test_credentials_is_blank() {
        assert!(Credentials::blank().is_blank());
        assert!(Credentials::new("", "").is_blank());
        assert!(!Credentials::new("user", "").is_blank());
        assert!(!Credentials::new("", "pass").is_blank());
    }

    #[test]
    fn test_credentials_equality() {
        let a = Credentials::new("user", "pass");
        let b = Credentials::new("user", "pass");
        let c = Credentials::new("User", "pass");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("user@example.com", "secret123");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("user@example.com"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret123"));
    }

    #[test]
    fn test_fallback_order() {
        let order = DefaultCredentials::fallback_order();
        assert_eq!(order, &[DefaultCredentials::Blank, DefaultCredentials::Test]);

        assert!(DefaultCredentials::Blank.credentials().is_blank());
        let test = DefaultCredentials::Test.credentials();
        assert_eq!(test.username, "test@tp-link.net");
        assert_eq!(test.expose_password(), "test");
    }
}
