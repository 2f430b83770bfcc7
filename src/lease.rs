//! Exclusivity of the live session per client identity.
//!
//! Before a context starts its session loop it claims a named lease,
//! `sendspin-session:<client id>`, with a fresh owner id. The claim expires
//! after a TTL unless renewed, and the holder renews it at a third of the TTL
//! for as long as it lives. Dropping the [`Lease`] releases it right away, so
//! an orderly teardown hands over immediately, and a context that vanished
//! without teardown blocks the others for at most one TTL.

use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    config::LeaseSettings,
    error::{Error, Result},
    identity::ClientIdentity,
};

/// Backing store of lease records.
pub trait LeaseStore: Send + Sync {
    /// Claims `name` for `owner` for `ttl`, unless another owner holds an
    /// unexpired claim. Returns whether `owner` holds the lease afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be accessed.
    fn try_claim(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extends a claim held by `owner`. Returns `false` if the lease expired
    /// and was claimed by someone else in the meantime.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be accessed.
    fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases the claim if `owner` holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be accessed.
    fn release(&self, name: &str, owner: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
struct Claim {
    owner: String,
    expires_at: Instant,
}

/// Leases shared between the contexts of one process.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseStore {
    claims: Arc<Mutex<HashMap<String, Claim>>>,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn try_claim(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock()?;

        if let Some(claim) = claims.get(name) {
            if claim.owner != owner && claim.expires_at > now {
                return Ok(false);
            }
        }

        claims.insert(
            name.to_owned(),
            Claim {
                owner: owner.to_owned(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock()?;

        match claims.get_mut(name) {
            Some(claim) if claim.owner == owner => {
                claim.expires_at = now + ttl;
                Ok(true)
            }
            Some(claim) if claim.expires_at > now => Ok(false),
            // Expired and unclaimed: still ours to take.
            _ => {
                claims.insert(
                    name.to_owned(),
                    Claim {
                        owner: owner.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    fn release(&self, name: &str, owner: &str) -> Result<()> {
        let mut claims = self.claims.lock()?;
        if claims.get(name).is_some_and(|claim| claim.owner == owner) {
            claims.remove(name);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Record {
    owner: String,
    /// Milliseconds since the Unix epoch.
    expires_at: u64,
}

/// Leases shared between processes through files in a directory.
///
/// Each record is guarded by a `.lock` file created exclusively around every
/// read-modify-write. A guard left behind by a crashed process is broken once
/// it is older than [`FileLeaseStore::STALE_GUARD`]. A guard held by a live
/// process makes the operation fail with [`Error::unavailable`]; callers retry
/// on their next round.
#[derive(Clone, Debug)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    pub const STALE_GUARD: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_stem(name: &str) -> String {
        name.chars()
            .map(|chr| if chr.is_ascii_alphanumeric() || chr == '-' { chr } else { '_' })
            .collect()
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lease", Self::file_stem(name)))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", Self::file_stem(name)))
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs `f` on the current record while holding the guard, and writes or
    /// removes the record as `f` decides.
    fn with_record<T>(
        &self,
        name: &str,
        f: impl FnOnce(Option<Record>) -> (Update, T),
    ) -> Result<T> {
        fs::create_dir_all(&self.dir)?;
        let _guard = Guard::acquire(self.guard_path(name))?;

        let path = self.record_path(name);
        let record = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<Record>(&contents) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("ignoring corrupt lease record {}: {e}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let (update, result) = f(record);
        match update {
            Update::Keep => {}
            Update::Write(record) => {
                let contents = toml::to_string(&record)?;
                let temp = path.with_extension("lease.tmp");
                fs::write(&temp, contents)?;
                fs::rename(&temp, &path)?;
            }
            Update::Remove => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }

        Ok(result)
    }
}

enum Update {
    Keep,
    Write(Record),
    Remove,
}

/// Exclusive `.lock` file holding a random token, removed on drop.
struct Guard {
    path: PathBuf,
}

impl Guard {
    fn acquire(path: PathBuf) -> Result<Self> {
        match Self::create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let Some(token) = Self::stale_token(&path) else {
            return Err(Self::held(&path));
        };

        warn!("breaking stale lease guard {}", path.display());
        Self::break_stale(&path, &token)?;

        match Self::create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Self::held(&path)),
            Err(e) => Err(e.into()),
        }
    }

    fn create(path: &Path) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        write!(file, "{}", uuid::Uuid::new_v4())
    }

    fn held(path: &Path) -> Error {
        Error::unavailable(format!("{} is held by another process", path.display()))
    }

    /// Token of the guard at `path` if it is older than
    /// [`FileLeaseStore::STALE_GUARD`].
    ///
    /// The token is read before the age, so a guard replaced in between is
    /// judged by its own, fresh, modification time.
    fn stale_token(path: &Path) -> Option<String> {
        let token = fs::read_to_string(path).ok()?;
        let age = fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .ok()?
            .elapsed()
            .ok()?;
        (age >= FileLeaseStore::STALE_GUARD).then_some(token)
    }

    /// Moves the guard holding `token` out of the way.
    ///
    /// The rename succeeds for exactly one process. If the file it moved is
    /// not the stale guard, another process replaced it in the meantime and
    /// it is put back.
    fn break_stale(path: &Path, token: &str) -> Result<()> {
        let tombstone =
            path.with_extension(format!("stale-{}", uuid::Uuid::new_v4().simple()));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Self::held(path)),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&tombstone);
        let replaced = !matches!(&moved, Ok(moved) if moved == token);
        if replaced {
            if let Err(e) = fs::hard_link(&tombstone, path) {
                warn!("failed to restore lease guard {}: {e}", path.display());
            }
        }

        if let Err(e) = fs::remove_file(&tombstone) {
            warn!("failed to remove {}: {e}", tombstone.display());
        }

        if replaced {
            return Err(Self::held(path));
        }
        Ok(())
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("failed to remove lease guard {}: {e}", self.path.display());
        }
    }
}

impl LeaseStore for FileLeaseStore {
    fn try_claim(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Self::now_millis();
        self.with_record(name, |record| match record {
            Some(record) if record.owner != owner && record.expires_at > now => {
                (Update::Keep, false)
            }
            _ => {
                let record = Record {
                    owner: owner.to_owned(),
                    expires_at: now.saturating_add(Self::ttl_millis(ttl)),
                };
                (Update::Write(record), true)
            }
        })
    }

    fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Self::now_millis();
        self.with_record(name, |record| match record {
            Some(record) if record.owner != owner && record.expires_at > now => {
                (Update::Keep, false)
            }
            _ => {
                let record = Record {
                    owner: owner.to_owned(),
                    expires_at: now.saturating_add(Self::ttl_millis(ttl)),
                };
                (Update::Write(record), true)
            }
        })
    }

    fn release(&self, name: &str, owner: &str) -> Result<()> {
        self.with_record(name, |record| match record {
            Some(record) if record.owner == owner => (Update::Remove, ()),
            _ => (Update::Keep, ()),
        })
    }
}

/// Hands out leases keyed by client identity.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn LeaseStore>,
    settings: LeaseSettings,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, settings: LeaseSettings) -> Self {
        Self { store, settings }
    }

    #[must_use]
    pub fn lease_name(identity: &ClientIdentity) -> String {
        format!("sendspin-session:{identity}")
    }

    /// Claims the lease for `identity` once, without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be accessed.
    pub fn try_acquire(&self, identity: &ClientIdentity) -> Result<Option<Lease>> {
        let name = Self::lease_name(identity);
        let owner = uuid::Uuid::new_v4().to_string();

        if self.store.try_claim(&name, &owner, self.settings.ttl)? {
            debug!("acquired lease {name} as {owner}");
            Ok(Some(self.lease(name, owner)))
        } else {
            Ok(None)
        }
    }

    /// Waits until the lease for `identity` is acquired, retrying every
    /// `retry_interval`. Store errors are logged and retried.
    pub async fn acquire(&self, identity: &ClientIdentity) -> Lease {
        let name = Self::lease_name(identity);
        let owner = uuid::Uuid::new_v4().to_string();
        let mut waiting = false;

        loop {
            match self.store.try_claim(&name, &owner, self.settings.ttl) {
                Ok(true) => {
                    debug!("acquired lease {name} as {owner}");
                    return self.lease(name, owner);
                }
                Ok(false) => {
                    if !waiting {
                        info!("another context holds the session, waiting for it to end");
                        waiting = true;
                    }
                }
                Err(e) => warn!("failed to claim lease {name}: {e}"),
            }

            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    fn lease(&self, name: String, owner: String) -> Lease {
        Lease {
            store: Arc::clone(&self.store),
            name,
            owner,
            ttl: self.settings.ttl,
        }
    }
}

/// A held lease. Released on drop.
#[must_use = "the lease is released when dropped"]
pub struct Lease {
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: String,
    ttl: Duration,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Lease {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Keeps renewing the lease. Completes only when the lease was lost to
    /// another owner, returning why.
    pub async fn hold(&self) -> Error {
        let period = (self.ttl / 3).max(Duration::from_millis(1));
        let mut renewals = tokio::time::interval_at(Instant::now() + period, period);
        renewals.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            renewals.tick().await;
            match self.store.renew(&self.name, &self.owner, self.ttl) {
                Ok(true) => trace!("renewed lease {}", self.name),
                Ok(false) => {
                    return Error::unavailable(format!(
                        "lease {} was taken over by another context",
                        self.name
                    ));
                }
                Err(e) => warn!("failed to renew lease {}: {e}", self.name),
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.store.release(&self.name, &self.owner) {
            Ok(()) => debug!("released lease {}", self.name),
            Err(e) => warn!("failed to release lease {}: {e}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn identity() -> ClientIdentity {
        "sendspin-browser-test".parse().unwrap()
    }

    fn settings() -> LeaseSettings {
        LeaseSettings {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_context_waits_for_release() {
        let coordinator = Coordinator::new(Arc::new(MemoryLeaseStore::new()), settings());

        let first = coordinator.try_acquire(&identity()).unwrap();
        assert!(first.is_some());
        assert!(coordinator.try_acquire(&identity()).unwrap().is_none());

        drop(first);
        assert!(coordinator.try_acquire(&identity()).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_polls_until_free() {
        let coordinator = Coordinator::new(Arc::new(MemoryLeaseStore::new()), settings());
        let first = coordinator.try_acquire(&identity()).unwrap().unwrap();

        let release = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(first);
        };
        let start = Instant::now();
        let id = identity();
        let ((), second) = tokio::join!(release, coordinator.acquire(&id));

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(8));
        assert_eq!(second.name(), "sendspin-session:sendspin-browser-test");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lease_expires_after_ttl() {
        let store = Arc::new(MemoryLeaseStore::new());
        let coordinator = Coordinator::new(store.clone(), settings());
        let first = coordinator.try_acquire(&identity()).unwrap().unwrap();

        // Simulate a context that vanished without running its teardown.
        std::mem::forget(first);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(coordinator.try_acquire(&identity()).unwrap().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(coordinator.try_acquire(&identity()).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn held_lease_survives_past_ttl() {
        let coordinator = Coordinator::new(Arc::new(MemoryLeaseStore::new()), settings());
        let lease = coordinator.try_acquire(&identity()).unwrap().unwrap();

        let outcome =
            tokio::time::timeout(Duration::from_secs(120), lease.hold()).await;
        assert!(outcome.is_err(), "lease should still be held");
        assert!(coordinator.try_acquire(&identity()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_is_reported_as_loss() {
        let store = Arc::new(MemoryLeaseStore::new());
        let coordinator = Coordinator::new(store.clone(), settings());
        let lease = coordinator.try_acquire(&identity()).unwrap().unwrap();

        store.release(lease.name(), lease.owner()).unwrap();
        assert!(store
            .try_claim(lease.name(), "intruder", Duration::from_secs(30))
            .unwrap());

        let err = lease.hold().await;
        assert_eq!(err.kind, ErrorKind::Unavailable);

        // Dropping the lost lease leaves the new owner alone.
        let name = lease.name().to_owned();
        drop(lease);
        assert!(!store.try_claim(&name, "third", Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn file_store_excludes_other_owners() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path());
        let ttl = Duration::from_secs(30);

        assert!(store.try_claim("sendspin-session:a", "one", ttl).unwrap());
        assert!(!store.try_claim("sendspin-session:a", "two", ttl).unwrap());
        assert!(store.renew("sendspin-session:a", "one", ttl).unwrap());
        assert!(!store.renew("sendspin-session:a", "two", ttl).unwrap());

        store.release("sendspin-session:a", "two").unwrap();
        assert!(!store.try_claim("sendspin-session:a", "two", ttl).unwrap());

        store.release("sendspin-session:a", "one").unwrap();
        assert!(store.try_claim("sendspin-session:a", "two", ttl).unwrap());
    }

    #[test]
    fn file_store_takes_over_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path());

        assert!(store.try_claim("lease", "one", Duration::ZERO).unwrap());
        assert!(store.try_claim("lease", "two", Duration::from_secs(30)).unwrap());
        assert!(!store.renew("lease", "one", Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn file_store_respects_live_guard() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path());
        fs::write(store.guard_path("lease"), "4242").unwrap();

        let err = store
            .try_claim("lease", "one", Duration::from_secs(30))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(!dir.path().join("lease.lease").exists());
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn file_store_breaks_stale_guard() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path());
        let guard = store.guard_path("lease");
        fs::write(&guard, "crashed").unwrap();
        fs::File::options()
            .write(true)
            .open(&guard)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        assert!(store.try_claim("lease", "one", Duration::from_secs(30)).unwrap());
        assert_eq!(entries(dir.path()), ["lease.lease"]);
    }

    #[test]
    fn guard_replaced_while_breaking_is_put_back() {
        let dir = tempfile::tempdir().unwrap();
        let guard = dir.path().join("lease.lock");
        // The stale guard was already broken and a live process created a
        // new one before this breaker got to its rename.
        fs::write(&guard, "live").unwrap();

        let err = Guard::break_stale(&guard, "crashed").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(fs::read_to_string(&guard).unwrap(), "live");
        assert_eq!(entries(dir.path()), ["lease.lock"]);
    }

    #[test]
    fn guard_removed_while_breaking_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let guard = dir.path().join("lease.lock");

        let err = Guard::break_stale(&guard, "crashed").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(entries(dir.path()).is_empty());
    }
}
