//! Publish/subscribe access to the canonical playback state.
//!
//! Listeners receive a snapshot on every publish, and once right away when
//! they subscribe. A listener that panics is logged and skipped; the others
//! are still notified and the canonical state is unaffected.
//!
//! Each listener sees snapshots in publish order: the subscribe-time snapshot
//! is dropped when a newer publish reached the listener first. Listeners must
//! not publish to the registry they are subscribed to.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::state::PlaybackState;

struct Listener {
    callback: Box<dyn Fn(&PlaybackState) + Send + Sync>,
    /// One past the last delivered version. Locked while delivering.
    delivered: Mutex<u64>,
}

struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Arc<Listener>,
}

#[derive(Default)]
struct Inner {
    snapshot: PlaybackState,
    /// Bumped on every publish.
    version: u64,
    entries: Vec<Entry>,
    next_id: u64,
}

/// Registry of state listeners.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A listener panic never happens while the lock is held, so a poisoned
    // lock can only come from a panic inside this module. Recover the data
    // anyway: the snapshot and entry list are always consistent.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `listener` and invokes it with the current snapshot.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PlaybackState) + Send + Sync + 'static,
    {
        let listener = Arc::new(Listener {
            callback: Box::new(listener),
            delivered: Mutex::new(0),
        });
        let active = Arc::new(AtomicBool::new(true));

        let (id, version, snapshot) = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry {
                id,
                active: Arc::clone(&active),
                listener: Arc::clone(&listener),
            });
            (id, inner.version, inner.snapshot.clone())
        };

        notify(id, &listener, version, &snapshot);

        Subscription {
            id,
            active,
            registry: self.clone(),
        }
    }

    /// Stores `state` as the latest snapshot and notifies every active
    /// listener, in subscription order.
    pub fn publish(&self, state: &PlaybackState) {
        let (version, listeners) = {
            let mut inner = self.lock();
            inner.snapshot.clone_from(state);
            inner.version += 1;
            let listeners: Vec<_> = inner
                .entries
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.active), Arc::clone(&entry.listener)))
                .collect();
            (inner.version, listeners)
        };

        for (id, active, listener) in listeners {
            // Unsubscribed by an earlier listener of this round.
            if active.load(Ordering::Acquire) {
                notify(id, &listener, version, state);
            }
        }
    }

    /// The most recently published state.
    #[must_use]
    pub fn snapshot(&self) -> PlaybackState {
        self.lock().snapshot.clone()
    }

    /// Number of active listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.lock().entries.retain(|entry| entry.id != id);
    }
}

/// Delivers `state` as of `version`, unless the listener already saw a
/// newer one.
fn notify(id: u64, listener: &Listener, version: u64, state: &PlaybackState) {
    let mut delivered = listener
        .delivered
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if *delivered > version {
        trace!("skipping stale state {version} for listener {id}");
        return;
    }
    *delivered = version + 1;

    if panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(state))).is_err() {
        error!("state listener {id} panicked");
    }
}

/// Handle to a registered listener.
///
/// The listener is removed when the handle is dropped or
/// [`unsubscribe`](Self::unsubscribe)d, and is never invoked afterwards.
#[must_use = "dropping a subscription unsubscribes its listener"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Registry,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Work happens in `Drop`.
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&PlaybackState) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let listener = {
            let count = Arc::clone(&count);
            move |_: &PlaybackState| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, listener)
    }

    #[test]
    fn subscribe_delivers_current_snapshot() {
        let registry = Registry::new();
        registry.publish(&PlaybackState {
            volume: 42,
            ..PlaybackState::default()
        });

        let seen = Arc::new(Mutex::new(None));
        let _subscription = registry.subscribe({
            let seen = Arc::clone(&seen);
            move |state: &PlaybackState| *seen.lock().unwrap() = Some(state.volume)
        });

        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn every_publish_notifies_once() {
        let registry = Registry::new();
        let (count, listener) = counter();
        let _subscription = registry.subscribe(listener);

        for _ in 0..3 {
            registry.publish(&PlaybackState::default());
        }

        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unsubscribed_listeners_are_not_invoked() {
        let registry = Registry::new();
        let (count, listener) = counter();
        let subscription = registry.subscribe(listener);
        assert!(subscription.is_active());

        subscription.unsubscribe();
        registry.publish(&PlaybackState::default());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let registry = Registry::new();
        let _faulty = registry.subscribe(|state: &PlaybackState| {
            assert!(state.volume < 50, "listener failure");
        });
        let (count, listener) = counter();
        let _healthy = registry.subscribe(listener);

        let state = PlaybackState {
            volume: 80,
            ..PlaybackState::default()
        };
        registry.publish(&state);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.snapshot().volume, 80);
    }

    #[test]
    fn stale_snapshot_is_not_delivered_after_newer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = Listener {
            callback: Box::new({
                let seen = Arc::clone(&seen);
                move |state: &PlaybackState| seen.lock().unwrap().push(state.volume)
            }),
            delivered: Mutex::new(0),
        };
        let state = |volume| PlaybackState {
            volume,
            ..PlaybackState::default()
        };

        // A publish of version 4 overtakes the subscribe-time snapshot of
        // version 3.
        notify(0, &listener, 4, &state(40));
        notify(0, &listener, 3, &state(30));
        notify(0, &listener, 5, &state(50));

        assert_eq!(*seen.lock().unwrap(), [40, 50]);
    }

    #[test]
    fn publishes_racing_subscribe_arrive_in_order() {
        let registry = Registry::new();
        registry.publish(&PlaybackState {
            volume: 0,
            ..PlaybackState::default()
        });
        let publisher = std::thread::spawn({
            let registry = registry.clone();
            move || {
                for volume in 1..=100 {
                    registry.publish(&PlaybackState {
                        volume,
                        ..PlaybackState::default()
                    });
                }
            }
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = registry.subscribe({
            let seen = Arc::clone(&seen);
            move |state: &PlaybackState| seen.lock().unwrap().push(state.volume)
        });
        publisher.join().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn listener_may_unsubscribe_another_during_publish() {
        let registry = Registry::new();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let _killer = registry.subscribe({
            let victim = Arc::clone(&victim);
            move |_: &PlaybackState| {
                victim.lock().unwrap().take();
            }
        });
        let (count, listener) = counter();
        *victim.lock().unwrap() = Some(registry.subscribe(listener));

        registry.publish(&PlaybackState::default());

        // Only the notification at subscribe time.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
