//! Durable client-local key/value storage.
//!
//! Holds the few values that outlive a session and are shared between
//! independent contexts on the same machine: the client identity, the last
//! used server and name, and the player's volume and mute flag.
//!
//! There are no transactions. Every write is a read-modify-write of the whole
//! store and the last writer wins. Readers see other contexts' writes on their
//! next read, which is how settings changes are observed by polling.

use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::error::{Error, Result};

/// Storage shared between the components of one context.
pub type SharedStorage = Arc<dyn Storage>;

/// Keys of the persisted client-local values.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    /// Stable client identifier.
    ClientId,
    /// Last server URL that was connected to.
    ServerUrl,
    /// Display name announced to the server.
    PlayerName,
    /// Last known player volume, `0..=100`.
    Volume,
    /// Last known mute flag.
    Muted,
}

impl Key {
    /// Name of the key in the backing store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientId => "client_id",
            Self::ServerUrl => "server_url",
            Self::PlayerName => "player_name",
            Self::Volume => "volume",
            Self::Muted => "muted",
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string key/value store.
///
/// Implementations must be usable from any context at any time; errors are
/// returned rather than swallowed so callers can classify them.
pub trait Storage: Send + Sync {
    /// Reads the value for `key`, or `None` when it was never written.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get(&self, key: Key) -> Result<Option<String>>;

    /// Writes `value` for `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn set(&self, key: Key, value: &str) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn remove(&self, key: Key) -> Result<()>;
}

/// Typed helpers on top of the string store.
pub trait StorageExt: Storage {
    /// Reads and parses a value. Values that fail to parse read as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get_parsed<T: std::str::FromStr>(&self, key: Key) -> Result<Option<T>> {
        Ok(self
            .get(key)?
            .and_then(|value| value.trim().parse::<T>().ok()))
    }

    /// Reads a value and treats blank strings as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get_non_blank(&self, key: Key) -> Result<Option<String>> {
        Ok(self.get(key)?.filter(|value| !value.trim().is_empty()))
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

/// In-process storage. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    values: Arc<Mutex<HashMap<Key, String>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: Key) -> Result<Option<String>> {
        Ok(self.values.lock()?.get(&key).cloned())
    }

    fn set(&self, key: Key, value: &str) -> Result<()> {
        self.values.lock()?.insert(key, value.to_owned());
        Ok(())
    }

    fn remove(&self, key: Key) -> Result<()> {
        self.values.lock()?.remove(&key);
        Ok(())
    }
}

/// Storage in a TOML file.
///
/// The file is re-read on every access so that writes from other processes
/// become visible without notification.
#[derive(Clone, Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Files larger than this are not state files and are refused.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<toml::Table> {
        match fs::metadata(&self.path) {
            Ok(attributes) if attributes.len() > Self::MAX_FILE_SIZE => {
                return Err(Error::storage(format!(
                    "{} is too large",
                    self.path.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(toml::Table::new()),
            Err(e) => return Err(Error::storage(e)),
        }

        let contents = fs::read_to_string(&self.path).map_err(Error::storage)?;
        contents.parse::<toml::Table>().map_err(|e| {
            Error::storage(format!("{} format is invalid: {e}", self.path.display()))
        })
    }

    fn save(&self, table: &toml::Table) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(Error::storage)?;
            }
        }

        // Readers never see a half-written file.
        let contents = toml::to_string(table)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, contents).map_err(Error::storage)?;
        fs::rename(&staging, &self.path).map_err(Error::storage)
    }
}

impl Storage for FileStorage {
    fn get(&self, key: Key) -> Result<Option<String>> {
        let table = self.load()?;
        Ok(table.get(key.as_str()).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
    }

    fn set(&self, key: Key, value: &str) -> Result<()> {
        let mut table = self.load()?;
        table.insert(
            key.as_str().to_owned(),
            toml::Value::String(value.to_owned()),
        );
        self.save(&table)
    }

    fn remove(&self, key: Key) -> Result<()> {
        let mut table = self.load()?;
        if table.remove(key.as_str()).is_some() {
            self.save(&table)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_clones_share_values() {
        let storage = MemoryStorage::new();
        let other = storage.clone();

        storage.set(Key::Volume, "42").unwrap();
        assert_eq!(other.get_parsed::<u8>(Key::Volume).unwrap(), Some(42));

        other.remove(Key::Volume).unwrap();
        assert_eq!(storage.get(Key::Volume).unwrap(), None);
    }

    #[test]
    fn file_storage_sees_writes_of_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        let first = FileStorage::new(&path);
        let second = FileStorage::new(&path);

        assert_eq!(first.get(Key::ServerUrl).unwrap(), None);

        first.set(Key::ServerUrl, "http://example.local:9000").unwrap();
        second.set(Key::PlayerName, "Kitchen").unwrap();

        assert_eq!(
            second.get(Key::ServerUrl).unwrap().as_deref(),
            Some("http://example.local:9000")
        );
        assert_eq!(first.get(Key::PlayerName).unwrap().as_deref(), Some("Kitchen"));
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "this is = = not toml").unwrap();

        let err = FileStorage::new(&path).get(Key::ClientId).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Storage);
    }

    #[test]
    fn unparsable_and_blank_values_read_as_absent() {
        let storage = MemoryStorage::new();
        storage.set(Key::Volume, "loud").unwrap();
        storage.set(Key::PlayerName, "   ").unwrap();

        assert_eq!(storage.get_parsed::<u8>(Key::Volume).unwrap(), None);
        assert_eq!(storage.get_non_blank(Key::PlayerName).unwrap(), None);
    }
}
