//! Per-key single-flight memoization of asynchronous constructions.
//!
//! Each key maps to a shared future. The first caller for a key spawns the
//! construction on the tokio runtime and installs the shared handle; every
//! concurrent and later caller clones that handle and awaits the same result.
//! Because the construction runs on its own task, dropping any waiter
//! (including the one that started it) never cancels it.
//!
//! The construction task records its own result, so a flight reports
//! completion even when nobody is waiting on it.

use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinError;

/// Shared handle to one construction attempt.
pub type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Observable state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightState {
    Absent,
    InFlight,
    Succeeded,
    Failed,
}

struct Slot<V, E> {
    flight: Flight<V, E>,
    outcome: Arc<OnceLock<Result<V, E>>>,
}

impl<V, E> Slot<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn completed(&self) -> Option<&Result<V, E>> {
        self.outcome.get().or_else(|| self.flight.peek())
    }

    fn state(&self) -> FlightState {
        match self.completed() {
            None => FlightState::InFlight,
            Some(Ok(_)) => FlightState::Succeeded,
            Some(Err(_)) => FlightState::Failed,
        }
    }
}

/// Map of in-flight and completed constructions, one per key.
pub struct SingleFlight<K, V, E> {
    flights: DashMap<K, Slot<V, E>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Returns the flight for `key`, starting one with `init` if none exists.
    ///
    /// `init` is only called for the caller that installs the flight, while
    /// the key's shard is locked: it must only construct the future, all work
    /// belongs inside it. `on_abort` converts a panic of the construction
    /// task into the cached error.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_start<I, Fut, A>(&self, key: &K, init: I, on_abort: A) -> Flight<V, E>
    where
        I: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        A: FnOnce(JoinError) -> E + Send + 'static,
    {
        if let Some(existing) = self.flights.get(key) {
            return existing.flight.clone();
        }
        match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().flight.clone(),
            Entry::Vacant(entry) => {
                let outcome = Arc::new(OnceLock::new());
                let construction = init();
                let recorded = Arc::clone(&outcome);
                let task = tokio::spawn(async move {
                    let result = construction.await;
                    let _ = recorded.set(result.clone());
                    result
                });
                let recorded = Arc::clone(&outcome);
                let flight = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(join_error) => recorded
                            .get_or_init(|| Err(on_abort(join_error)))
                            .clone(),
                    }
                }
                .boxed()
                .shared();
                entry.insert(Slot {
                    flight: flight.clone(),
                    outcome,
                });
                flight
            }
        }
    }

    #[must_use]
    pub fn state(&self, key: &K) -> FlightState {
        self.flights
            .get(key)
            .map_or(FlightState::Absent, |slot| slot.state())
    }

    /// Completed result for `key`, if the construction has finished.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<Result<V, E>> {
        self.flights
            .get(key)
            .and_then(|slot| slot.completed().cloned())
    }

    /// State and completed result of every entry whose key matches
    /// `predicate`.
    #[must_use]
    pub fn snapshot_where(
        &self,
        mut predicate: impl FnMut(&K) -> bool,
    ) -> Vec<(K, FlightState, Option<Result<V, E>>)> {
        self.flights
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| {
                let slot = entry.value();
                (entry.key().clone(), slot.state(), slot.completed().cloned())
            })
            .collect()
    }

    /// Removes the entry for `key`, returning its flight.
    pub fn remove(&self, key: &K) -> Option<Flight<V, E>> {
        self.flights.remove(key).map(|(_, slot)| slot.flight)
    }

    /// Removes the entry for `key` only if it is still `flight`.
    pub fn remove_flight(&self, key: &K, flight: &Flight<V, E>) -> bool {
        self.flights
            .remove_if(key, |_, slot| slot.flight.ptr_eq(flight))
            .is_some()
    }

    /// Removes the entry for `key` only if it completed with an error.
    pub fn remove_if_failed(&self, key: &K) -> bool {
        self.flights
            .remove_if(key, |_, slot| matches!(slot.completed(), Some(Err(_))))
            .is_some()
    }

    /// Removes the entry for `key` only if it completed successfully,
    /// returning the value.
    pub fn remove_if_succeeded(&self, key: &K) -> Option<V> {
        self.flights
            .remove_if(key, |_, slot| matches!(slot.completed(), Some(Ok(_))))
            .and_then(|(_, slot)| slot.completed().cloned())
            .and_then(Result::ok)
    }

    /// Removes every entry whose key matches `predicate`.
    pub fn remove_where(&self, mut predicate: impl FnMut(&K) -> bool) -> Vec<(K, Flight<V, E>)> {
        let keys: Vec<K> = self
            .flights
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.flights.remove(key))
            .map(|(key, slot)| (key, slot.flight))
            .collect()
    }

    /// Removes every entry.
    pub fn drain(&self) -> Vec<(K, Flight<V, E>)> {
        self.remove_where(|_| true)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    type Flights = SingleFlight<&'static str, u32, String>;

    fn abort(err: JoinError) -> String {
        format!("aborted: {err}")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_construction() {
        let flights = Arc::new(Flights::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .get_or_start(
                        &"foo",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7)
                        },
                        abort,
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.state(&"foo"), FlightState::Succeeded);
    }

    #[tokio::test]
    async fn failure_is_cached_until_removed() {
        let flights = Flights::new();
        let first = flights
            .get_or_start(&"bad", || async { Err("boom".to_string()) }, abort)
            .await;
        let second = flights
            .get_or_start(&"bad", || async { Ok(1) }, abort)
            .await;
        assert_eq!(first, Err("boom".to_string()));
        assert_eq!(second, first);
        assert_eq!(flights.state(&"bad"), FlightState::Failed);

        assert!(flights.remove_if_failed(&"bad"));
        let third = flights
            .get_or_start(&"bad", || async { Ok(1) }, abort)
            .await;
        assert_eq!(third, Ok(1));
        assert!(!flights.remove_if_failed(&"bad"));
    }

    #[tokio::test]
    async fn dropped_first_caller_does_not_cancel_construction() {
        let flights = Flights::new();
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let first = flights.get_or_start(
            &"foo",
            || async move {
                let _ = gate.await;
                Ok(3)
            },
            abort,
        );
        drop(first);
        assert_eq!(flights.state(&"foo"), FlightState::InFlight);

        release.send(()).unwrap();
        let second = flights
            .get_or_start(&"foo", || async { Ok(99) }, abort)
            .await;
        assert_eq!(second, Ok(3));
    }

    #[tokio::test]
    async fn completion_is_visible_without_any_waiter() {
        let flights = Flights::new();
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        drop(flights.get_or_start(
            &"foo",
            || async move {
                let _ = gate.await;
                Ok(5)
            },
            abort,
        ));
        release.send(()).unwrap();

        for _ in 0..1000 {
            if flights.state(&"foo") != FlightState::InFlight {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(flights.state(&"foo"), FlightState::Succeeded);
        assert_eq!(flights.peek(&"foo"), Some(Ok(5)));
    }

    #[tokio::test]
    async fn remove_flight_ignores_replaced_entries() {
        let flights = Flights::new();
        let stale = flights.get_or_start(&"foo", || async { Ok(1) }, abort);
        assert_eq!(stale.clone().await, Ok(1));
        flights.remove(&"foo");
        let fresh = flights.get_or_start(&"foo", || async { Ok(2) }, abort);

        assert!(!flights.remove_flight(&"foo", &stale));
        assert!(flights.remove_flight(&"foo", &fresh));
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn panicking_construction_becomes_cached_error() {
        let flights = Flights::new();
        let result = flights
            .get_or_start(
                &"foo",
                || async {
                    let explode = true;
                    assert!(!explode, "factory exploded");
                    Ok(0)
                },
                abort,
            )
            .await;
        assert!(matches!(result, Err(ref msg) if msg.starts_with("aborted")));
        assert_eq!(flights.state(&"foo"), FlightState::Failed);
    }

    #[tokio::test]
    async fn remove_where_and_drain() {
        let flights = Flights::new();
        for key in ["a", "b", "c"] {
            flights
                .get_or_start(&key, || async { Ok(1) }, abort)
                .await
                .unwrap();
        }
        let removed = flights.remove_where(|key| *key == "b");
        assert_eq!(removed.len(), 1);
        assert_eq!(flights.len(), 2);
        assert_eq!(flights.state(&"b"), FlightState::Absent);

        assert_eq!(flights.remove_if_succeeded(&"a"), Some(1));
        assert_eq!(flights.drain().len(), 1);
        assert!(flights.is_empty());
    }
}
