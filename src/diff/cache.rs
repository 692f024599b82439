//! In-memory LRU with single-flight computation.
//!
//! At most one computation runs per key. Callers arriving while it runs
//! wait on a watch channel and share its outcome. If the computing caller
//! is dropped mid-flight, a waiter takes over. Failures are handed to the
//! callers already waiting but never stored.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// How many abandoned flights a waiter sits through before giving up.
const MAX_TAKEOVERS: usize = 3;

/// The computing caller vanished too many times in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned;

enum FlightState<V, E> {
    Pending,
    Done(Result<Arc<V>, E>),
}

impl<V, E: Clone> Clone for FlightState<V, E> {
    fn clone(&self) -> Self {
        match self {
            FlightState::Pending => FlightState::Pending,
            FlightState::Done(result) => FlightState::Done(result.clone()),
        }
    }
}

struct Slot<V> {
    value: Arc<V>,
    last_used: u64,
}

struct Inner<K, V, E> {
    entries: HashMap<K, Slot<V>>,
    in_flight: HashMap<K, watch::Receiver<FlightState<V, E>>>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V, E> Inner<K, V, E> {
    fn touch(&mut self, key: &K) -> Option<Arc<V>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|slot| {
            slot.last_used = tick;
            slot.value.clone()
        })
    }

    fn store(&mut self, key: K, value: Arc<V>, capacity: usize) {
        self.tick += 1;
        self.entries.insert(
            key,
            Slot {
                value,
                last_used: self.tick,
            },
        );
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

pub struct SingleFlightCache<K, V, E> {
    inner: Mutex<Inner<K, V, E>>,
    capacity: usize,
}

/// Owned by the computing caller. Dropping it unfinished frees the key.
struct Flight<'a, K: Eq + Hash + Clone, V, E> {
    cache: &'a SingleFlightCache<K, V, E>,
    key: K,
    tx: watch::Sender<FlightState<V, E>>,
    finished: bool,
}

impl<K: Eq + Hash + Clone, V, E> Drop for Flight<'_, K, V, E> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.lock().in_flight.remove(&self.key);
            tracing::debug!("Cache computation abandoned, waiters will retry");
        }
    }
}

impl<K, V, E> SingleFlightCache<K, V, E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V, E> SingleFlightCache<K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone + From<Abandoned>,
{

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.lock().touch(key)
    }

    pub fn insert(&self, key: K, value: Arc<V>) {
        self.lock().store(key, value, self.capacity);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Cached value, or the outcome of exactly one `compute` per key.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut takeovers = 0;
        let tx = loop {
            let waiter = {
                let mut inner = self.lock();
                if let Some(value) = inner.touch(&key) {
                    return Ok(value);
                }
                match inner.in_flight.get(&key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(FlightState::Pending);
                        inner.in_flight.insert(key.clone(), rx);
                        break tx;
                    }
                }
            };

            if let Some(result) = wait_for_flight(waiter).await {
                return result;
            }
            takeovers += 1;
            if takeovers > MAX_TAKEOVERS {
                return Err(Abandoned.into());
            }
        };

        let mut flight = Flight {
            cache: self,
            key,
            tx,
            finished: false,
        };
        let result = compute().await.map(Arc::new);

        {
            let mut inner = self.lock();
            inner.in_flight.remove(&flight.key);
            if let Ok(value) = &result {
                inner.store(flight.key.clone(), value.clone(), self.capacity);
            }
        }
        flight.finished = true;
        flight.tx.send_replace(FlightState::Done(result.clone()));
        result
    }
}

/// `None` when the computing caller was dropped before finishing.
async fn wait_for_flight<V, E: Clone>(
    mut rx: watch::Receiver<FlightState<V, E>>,
) -> Option<Result<Arc<V>, E>> {
    loop {
        let state = rx.borrow_and_update().clone();
        if let FlightState::Done(result) = state {
            return Some(result);
        }
        if rx.changed().await.is_err() {
            let state = rx.borrow().clone();
            return match state {
                FlightState::Done(result) => Some(result),
                FlightState::Pending => None,
            };
        }
    }
}
