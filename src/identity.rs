//! Stable client identity.
//!
//! The identity is generated once per installation and then reused across
//! restarts, so the server keeps recognizing this player. It is regenerated
//! only when the stored value is missing or malformed.

use std::{fmt, ops::Deref, str::FromStr};

use crate::{
    error::{Error, Result},
    storage::{Key, Storage},
};

/// Opaque client identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Identities shorter than this are treated as malformed.
    pub const MIN_LENGTH: usize = 8;

    /// Prefix of generated identities. Servers list browser-style players by
    /// this prefix.
    pub const PREFIX: &'static str = "sendspin-browser-";

    /// Generates a new random identity.
    ///
    /// Uses `fastrand` for the UUID bytes: identities need to be unique, not
    /// unpredictable.
    #[must_use]
    pub fn generate() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(format!("{}{uuid}", Self::PREFIX))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ClientIdentity {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses a stored identity.
///
/// # Errors
///
/// Returns [`Error::invalid_argument`] if the string is shorter than
/// [`ClientIdentity::MIN_LENGTH`] characters or contains whitespace or
/// control characters.
impl FromStr for ClientIdentity {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let chars = s.chars().count();
        if chars < Self::MIN_LENGTH {
            return Err(Error::invalid_argument(format!(
                "client identity should be at least {} characters long but is {chars}",
                Self::MIN_LENGTH
            )));
        }

        if s.contains(|chr: char| chr.is_whitespace() || chr.is_control()) {
            return Err(Error::invalid_argument(
                "client identity contains whitespace or control characters",
            ));
        }

        Ok(Self(s.to_owned()))
    }
}

/// Loads the persisted identity, creating it on first use.
pub struct IdentityStore<'a> {
    storage: &'a dyn Storage,
}

impl<'a> IdentityStore<'a> {
    #[must_use]
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// Returns the stored identity, or generates and persists a new one when
    /// the stored value is absent or malformed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read or written. A freshly
    /// generated identity that cannot be persisted is not returned: the next
    /// start would generate a different one.
    pub fn load_or_create(&self) -> Result<ClientIdentity> {
        if let Some(stored) = self.storage.get(Key::ClientId)? {
            match stored.parse::<ClientIdentity>() {
                Ok(identity) => {
                    debug!("client identity: {identity}");
                    return Ok(identity);
                }
                Err(e) => warn!("regenerating client identity: {e}"),
            }
        }

        let identity = ClientIdentity::generate();
        self.storage.set(Key::ClientId, identity.as_str())?;
        info!("created client identity {identity}");

        Ok(identity)
    }
}
