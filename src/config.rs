//! Session configuration and tunables.
//!
//! * [`SessionConfig`] is what one `connect()` call needs: where the server
//!   is, what to call this player and how to authenticate.
//! * [`Settings`] holds the timing knobs of the manager. They have sensible
//!   defaults and can be overridden from a TOML file.

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use url::Url;
use veil::Redact;

use crate::error::{Error, Result};

/// Name announced when neither the user nor the host provides one.
pub const DEFAULT_CLIENT_NAME: &str = "Sendspin Player";

/// Configuration of a single connection.
///
/// Owned by the session for the duration of one connection. The auth token is
/// redacted from `Debug` output so configs can be logged.
#[derive(Clone, Redact, PartialEq, Eq, Hash)]
pub struct SessionConfig {
    /// Normalized absolute server URL without trailing slash.
    pub server_url: Url,

    /// Display label announced to the server.
    pub client_name: Option<String>,

    /// Credential presented during the handshake.
    #[redact]
    pub auth_token: Option<String>,
}

impl SessionConfig {
    /// Creates a config, normalizing `server_url` as [`normalize_server_url`]
    /// does. Blank names and tokens are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_url`] if the URL is blank or cannot be parsed.
    pub fn new(
        server_url: &str,
        client_name: Option<&str>,
        auth_token: Option<&str>,
    ) -> Result<Self> {
        let non_blank = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
        };

        Ok(Self {
            server_url: normalize_server_url(server_url)?,
            client_name: non_blank(client_name),
            auth_token: non_blank(auth_token),
        })
    }

    /// Server URL as a string without trailing slash.
    #[must_use]
    pub fn server_url_str(&self) -> &str {
        self.server_url.as_str().trim_end_matches('/')
    }
}

/// Normalizes a user-entered server URL.
///
/// Trims whitespace and trailing slashes and defaults the scheme to `http://`
/// when neither `http://` nor `https://` is given.
///
/// # Errors
///
/// Returns [`Error::invalid_url`] if the input is blank or does not parse as
/// an absolute URL with a host.
///
/// # Example
///
/// ```rust
/// let url = normalize_server_url("example.local:9000/")?;
/// assert_eq!(url.as_str(), "http://example.local:9000/");
/// ```
pub fn normalize_server_url(input: &str) -> Result<Url> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::invalid_url("server url is empty"));
    }

    let lowercase = trimmed.to_ascii_lowercase();
    let absolute = if lowercase.starts_with("http://") || lowercase.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&absolute)
        .map_err(|e| Error::invalid_url(format!("{trimmed} is not a valid url: {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::invalid_url(format!("{trimmed} has no host")));
    }

    Ok(url)
}

/// Reconnect backoff parameters.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Delay before the first retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,

    /// Multiplier applied per further retry.
    pub growth_factor: f64,

    /// Consecutive failures after which retrying stops.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            growth_factor: 1.5,
            max_attempts: 10,
        }
    }
}

/// Exclusivity lease parameters.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaseSettings {
    /// How long a lease stays valid without renewal.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ttl: Duration,

    /// How often a waiting context retries to claim the lease.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Tunables of the session manager.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Deadline for transport setup plus handshake.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,

    /// Interval between keepalive pings.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,

    /// Silence after which the peer is considered gone.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_timeout: Duration,

    /// Interval of local progress interpolation.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub progress_tick: Duration,

    /// Interval at which configuration sources are polled for changes.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub config_poll_interval: Duration,

    pub reconnect: ReconnectSettings,
    pub lease: LeaseSettings,

    /// `User-Agent` for configuration requests.
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME");
        let app_version = env!("CARGO_PKG_VERSION");
        let os_name = std::env::consts::OS;

        Self {
            connect_timeout: Duration::from_secs(12),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            progress_tick: Duration::from_millis(500),
            config_poll_interval: Duration::from_secs(5),
            reconnect: ReconnectSettings::default(),
            lease: LeaseSettings::default(),
            user_agent: format!("{app_name}/{app_version} (Rust; {os_name})"),
        }
    }
}

impl Settings {
    /// Settings files should be tiny.
    const MAX_FILE_SIZE: u64 = 16 * 1024;

    /// Loads settings from a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, does not
    /// parse, or holds values that make no sense (see [`Settings::validate`]).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let attributes = fs::metadata(path)?;
        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&contents)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Checks that intervals are non-zero and the heartbeat timeout exceeds
    /// its interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_argument`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("connect_timeout", self.connect_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("progress_tick", self.progress_tick),
            ("config_poll_interval", self.config_poll_interval),
            ("lease.ttl", self.lease.ttl),
            ("lease.retry_interval", self.lease.retry_interval),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::invalid_argument(format!("{name} must not be zero")));
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(Error::invalid_argument(
                "heartbeat_timeout must exceed heartbeat_interval",
            ));
        }

        if !self.reconnect.growth_factor.is_finite() || self.reconnect.growth_factor < 1.0 {
            return Err(Error::invalid_argument(
                "reconnect.growth_factor must be a finite number of at least 1.0",
            ));
        }

        Ok(())
    }
}
