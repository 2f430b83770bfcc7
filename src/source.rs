//! Where session configuration comes from.
//!
//! A [`ConfigSource`] yields a possibly incomplete [`ConfigInput`]. The
//! [`Fallback`] chain merges, per field, in this order:
//!
//! 1. explicit overrides, such as command line arguments,
//! 2. the primary source, usually an [`HttpConfigSource`],
//! 3. the values last used, from storage,
//! 4. for the name only, the host name and finally a fixed default.
//!
//! A resolved configuration is written back to storage so the next start can
//! fall back on it.

use std::{future::Future, time::Duration};

use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::{
    config::{SessionConfig, Settings, DEFAULT_CLIENT_NAME},
    error::{Error, Result},
    storage::{Key, SharedStorage, Storage, StorageExt},
};

/// Configuration fields as a source provides them.
///
/// Field names of the known configuration endpoints are accepted as aliases.
#[derive(Clone, Default, PartialEq, Eq, Redact, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    #[serde(alias = "serverUrl", alias = "ma_url")]
    pub server_url: Option<String>,

    #[serde(alias = "clientName", alias = "player_name", alias = "name")]
    pub client_name: Option<String>,

    #[redact]
    #[serde(alias = "authToken", alias = "token")]
    pub auth_token: Option<String>,
}

impl ConfigInput {
    fn non_blank(value: Option<&String>) -> Option<String> {
        value
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    }

    /// Fills blank fields of `self` from `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            server_url: Self::non_blank(self.server_url.as_ref())
                .or_else(|| Self::non_blank(other.server_url.as_ref())),
            client_name: Self::non_blank(self.client_name.as_ref())
                .or_else(|| Self::non_blank(other.client_name.as_ref())),
            auth_token: Self::non_blank(self.auth_token.as_ref())
                .or_else(|| Self::non_blank(other.auth_token.as_ref())),
        }
    }
}

pub trait ConfigSource {
    /// Fetches the current configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::config_unavailable`] if the source cannot be reached
    /// or returned something unusable.
    fn fetch(&self) -> impl Future<Output = Result<ConfigInput>>;
}

/// Fixed values.
impl ConfigSource for ConfigInput {
    async fn fetch(&self) -> Result<ConfigInput> {
        Ok(self.clone())
    }
}

/// JSON configuration endpoint.
#[derive(Clone, Debug)]
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpConfigSource {
    /// Responses larger than this are refused.
    const MAX_RESPONSE_SIZE: usize = 64 * 1024;

    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a source fetching from `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_url`] if `url` does not parse, or
    /// [`Error::config_unavailable`] if the HTTP client cannot be built.
    pub fn new(url: &str, settings: &Settings) -> Result<Self> {
        let url = Url::parse(url.trim())?;

        let client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(settings.connect_timeout)
            .user_agent(&settings.user_agent)
            .build()?;

        Ok(Self { client, url })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<ConfigInput> {
        trace!("fetching configuration from {}", self.url);

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        if body.len() > Self::MAX_RESPONSE_SIZE {
            return Err(Error::config_unavailable(format!(
                "configuration from {} is too large ({} bytes)",
                self.url,
                body.len()
            )));
        }

        serde_json::from_slice(&body).map_err(|e| {
            Error::config_unavailable(format!("malformed configuration from {}: {e}", self.url))
        })
    }
}

/// Values last used, as persisted in storage.
#[derive(Clone)]
pub struct StoredConfigSource {
    storage: SharedStorage,
}

impl StoredConfigSource {
    #[must_use]
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

impl ConfigSource for StoredConfigSource {
    async fn fetch(&self) -> Result<ConfigInput> {
        let read = |key| {
            self.storage
                .get_non_blank(key)
                .map_err(|e| Error::config_unavailable(format!("cannot read stored {key}: {e}")))
        };

        Ok(ConfigInput {
            server_url: read(Key::ServerUrl)?,
            client_name: read(Key::PlayerName)?,
            auth_token: None,
        })
    }
}

/// System host name, or [`DEFAULT_CLIENT_NAME`] if there is none.
#[must_use]
pub fn default_client_name() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_owned())
}

/// Resolves a [`SessionConfig`] from overrides, a primary source and storage.
pub struct Fallback<P> {
    overrides: ConfigInput,
    primary: Option<P>,
    stored: StoredConfigSource,
    storage: SharedStorage,
    default_name: String,
}

impl<P: ConfigSource> Fallback<P> {
    #[must_use]
    pub fn new(overrides: ConfigInput, primary: Option<P>, storage: SharedStorage) -> Self {
        Self {
            overrides,
            primary,
            stored: StoredConfigSource::new(storage.clone()),
            storage,
            default_name: default_client_name(),
        }
    }

    #[must_use]
    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = name.into();
        self
    }

    /// Resolves the configuration and persists server URL and name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::config_unavailable`] if the primary source fails or no
    /// server URL is known anywhere, and [`Error::invalid_url`] if the
    /// resolved URL is unusable.
    pub async fn resolve(&self) -> Result<SessionConfig> {
        let mut input = self.overrides.clone();

        if let Some(primary) = self.primary.as_ref() {
            input = input.or(primary.fetch().await?);
        }
        input = input.or(self.stored.fetch().await?);

        let Some(server_url) = input.server_url else {
            return Err(Error::config_unavailable("no server url configured"));
        };
        let client_name = input
            .client_name
            .unwrap_or_else(|| self.default_name.clone());

        let config = SessionConfig::new(
            &server_url,
            Some(&client_name),
            input.auth_token.as_deref(),
        )?;

        let persisted = [
            (Key::ServerUrl, config.server_url_str()),
            (Key::PlayerName, client_name.as_str()),
        ];
        for (key, value) in persisted {
            // Resolution runs on every poll; only write what changed.
            if matches!(self.storage.get(key), Ok(Some(saved)) if saved == value) {
                continue;
            }
            if let Err(e) = self.storage.set(key, value) {
                warn!("failed to save {key}: {e}");
            }
        }

        Ok(config)
    }
}
