//! Process-scoped store of tenant shells with single-flight construction.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use tenancy_core::TenantIdentity;
use tracing::{debug, info, warn};

use super::shell::{ShellState, TenantShell};
use super::single_flight::{FlightState, SingleFlight};
use crate::error::InitializationError;

/// Store of per-tenant shells.
///
/// At most one shell (or one in-flight construction) exists per
/// [`TenantIdentity`]. A failed construction is cached and returned to every
/// caller until [`reset`](Self::reset) is called for the tenant. Constructions
/// for different tenants never wait on each other.
///
/// Teardown is explicit: [`evict`](Self::evict) for one tenant,
/// [`shutdown`](Self::shutdown) for all of them. Both dispose root containers.
pub struct TenantShellStore<T> {
    shells: SingleFlight<TenantIdentity, Arc<TenantShell<T>>, InitializationError>,
}

impl<T: Send + Sync + 'static> TenantShellStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shells: SingleFlight::new(),
        }
    }

    /// Returns the tenant's shell, constructing it with `factory` on first use.
    ///
    /// `factory` is invoked at most once per identity (until reset), even
    /// under concurrent first access. The construction continues if the
    /// calling request is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the tenant's cached [`InitializationError`] if construction
    /// failed, now or on an earlier call.
    pub async fn get_or_create<F, Fut>(
        &self,
        identity: &TenantIdentity,
        factory: F,
    ) -> Result<Arc<TenantShell<T>>, InitializationError>
    where
        F: FnOnce(TenantIdentity) -> Fut,
        Fut: Future<Output = anyhow::Result<TenantShell<T>>> + Send + 'static,
    {
        let aborted_identity = identity.clone();
        let flight = self.shells.get_or_start(
            identity,
            || {
                let identity = identity.clone();
                let construction = factory(identity.clone());
                async move {
                    counter!("tenancy_shell_initializations_total").increment(1);
                    let start = Instant::now();
                    debug!(tenant = %identity, "initializing tenant shell");
                    match construction.await {
                        Ok(shell) => {
                            #[allow(clippy::cast_possible_truncation)]
                            let duration_ms = start.elapsed().as_millis() as u64;
                            info!(tenant = %identity, duration_ms, "tenant shell ready");
                            Ok(Arc::new(shell))
                        }
                        Err(err) => {
                            counter!("tenancy_shell_failures_total").increment(1);
                            warn!(
                                tenant = %identity,
                                error = %format!("{err:#}"),
                                "tenant shell initialization failed"
                            );
                            Err(InitializationError::new(identity, err))
                        }
                    }
                }
            },
            move |join_error| {
                counter!("tenancy_shell_failures_total").increment(1);
                warn!(tenant = %aborted_identity, %join_error, "tenant shell initialization aborted");
                InitializationError::new(
                    aborted_identity,
                    anyhow::anyhow!("tenant initialization aborted: {join_error}"),
                )
            },
        );
        flight.await
    }

    /// The tenant's shell if it is Ready.
    #[must_use]
    pub fn get(&self, identity: &TenantIdentity) -> Option<Arc<TenantShell<T>>> {
        self.shells.peek(identity).and_then(Result::ok)
    }

    #[must_use]
    pub fn state(&self, identity: &TenantIdentity) -> ShellState {
        match self.shells.state(identity) {
            FlightState::Absent => ShellState::Uninitialized,
            FlightState::InFlight => ShellState::Initializing,
            FlightState::Succeeded => ShellState::Ready,
            FlightState::Failed => ShellState::Failed,
        }
    }

    /// Forgets a completed construction so the next call re-invokes the
    /// factory. A Ready shell's root container is disposed. An in-flight
    /// construction is left alone.
    ///
    /// Returns `true` if an entry was removed.
    pub fn reset(&self, identity: &TenantIdentity) -> bool {
        if self.shells.remove_if_failed(identity) {
            info!(tenant = %identity, "cached tenant failure reset");
            return true;
        }
        if let Some(shell) = self.shells.remove_if_succeeded(identity) {
            shell.dispose();
            info!(tenant = %identity, shell_id = %shell.id(), "tenant shell reset");
            return true;
        }
        false
    }

    /// Removes the tenant and disposes its root container, waiting for an
    /// in-flight construction to finish first.
    ///
    /// Returns `true` if a Ready shell was disposed.
    pub async fn evict(&self, identity: &TenantIdentity) -> bool {
        let Some(flight) = self.shells.remove(identity) else {
            return false;
        };
        match flight.await {
            Ok(shell) => {
                shell.dispose();
                info!(tenant = %identity, shell_id = %shell.id(), "tenant shell evicted");
                true
            }
            Err(_) => false,
        }
    }

    /// Clears the store and disposes every Ready root container.
    ///
    /// In-flight constructions are awaited so their roots are not leaked.
    /// Returns the number of shells disposed.
    pub async fn shutdown(&self) -> usize {
        let mut disposed = 0;
        for (identity, flight) in self.shells.drain() {
            if let Ok(shell) = flight.await {
                shell.dispose();
                debug!(tenant = %identity, "tenant shell disposed");
                disposed += 1;
            }
        }
        info!(disposed, "tenant shell store shut down");
        disposed
    }

    /// Number of tenants with a shell or a cached construction attempt.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }
}

impl<T: Send + Sync + 'static> Default for TenantShellStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TenantShellStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantShellStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use tenancy_core::TenantId;

    use super::*;
    use crate::container::{Container, ContainerExt, ServiceContainer};

    fn identity(name: &str) -> TenantIdentity {
        TenantIdentity::new(TenantId::new_v4(), name)
    }

    /// Factory that counts invocations and fails for tenants named "Bad".
    fn counting_factory(
        calls: Arc<AtomicU32>,
    ) -> impl Fn(TenantIdentity) -> BoxFuture<'static, anyhow::Result<TenantShell<String>>> + Clone {
        move |identity: TenantIdentity| -> BoxFuture<'static, anyhow::Result<TenantShell<String>>> {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                if identity.name() == "Bad" {
                    anyhow::bail!("no registry entry for {}", identity.name());
                }
                let root: Arc<dyn Container> =
                    ServiceContainer::new_root(format!("tenant:{}", identity.name()));
                root.add_instance(Arc::new(identity.clone()))?;
                Ok(TenantShell::new(
                    identity.clone(),
                    Arc::new(identity.name().to_string()),
                    root,
                ))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_invokes_factory_once() {
        let store = Arc::new(TenantShellStore::<String>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let foo = identity("Foo");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let factory = counting_factory(calls.clone());
            let foo = foo.clone();
            handles.push(tokio::spawn(async move {
                store.get_or_create(&foo, factory).await.unwrap()
            }));
        }
        let mut shells = Vec::new();
        for handle in handles {
            shells.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(shells.iter().all(|s| Arc::ptr_eq(s, &shells[0])));
        assert_eq!(store.state(&foo), ShellState::Ready);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failed_factory_is_cached_and_shared() {
        let store = TenantShellStore::<String>::new();
        let calls = Arc::new(AtomicU32::new(0));
        let bad = identity("Bad");

        let first = store
            .get_or_create(&bad, counting_factory(calls.clone()))
            .await
            .unwrap_err();
        let second = store
            .get_or_create(&bad, counting_factory(calls.clone()))
            .await
            .unwrap_err();

        assert!(first.is_same_failure(&second));
        assert_eq!(first.tenant(), &bad);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.state(&bad), ShellState::Failed);
        assert!(store.get(&bad).is_none());
    }

    #[tokio::test]
    async fn reset_allows_a_new_attempt() {
        let store = TenantShellStore::<String>::new();
        let calls = Arc::new(AtomicU32::new(0));
        let bad = identity("Bad");

        let _ = store.get_or_create(&bad, counting_factory(calls.clone())).await;
        assert!(store.reset(&bad));
        assert_eq!(store.state(&bad), ShellState::Uninitialized);
        let _ = store.get_or_create(&bad, counting_factory(calls.clone())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reset_of_ready_shell_disposes_root() {
        let store = TenantShellStore::<String>::new();
        let calls = Arc::new(AtomicU32::new(0));
        let foo = identity("Foo");

        let shell = store
            .get_or_create(&foo, counting_factory(calls.clone()))
            .await
            .unwrap();
        assert!(store.reset(&foo));
        assert!(shell.root().is_disposed());

        let rebuilt = store
            .get_or_create(&foo, counting_factory(calls.clone()))
            .await
            .unwrap();
        assert_ne!(rebuilt.id(), shell.id());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_first_caller_still_populates_store() {
        let store = Arc::new(TenantShellStore::<String>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let foo = identity("Foo");

        let first = {
            let store = store.clone();
            let factory = counting_factory(calls.clone());
            let foo = foo.clone();
            tokio::spawn(async move { store.get_or_create(&foo, factory).await })
        };
        while store.state(&foo) != ShellState::Initializing {
            tokio::task::yield_now().await;
        }
        first.abort();
        let _ = first.await;

        let shell = store
            .get_or_create(&foo, counting_factory(calls.clone()))
            .await
            .unwrap();
        assert_eq!(shell.identity(), &foo);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shell_is_visible_once_built_even_if_every_caller_left() {
        let store = Arc::new(TenantShellStore::<String>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let foo = identity("Foo");

        let first = {
            let store = store.clone();
            let factory = counting_factory(calls.clone());
            let foo = foo.clone();
            tokio::spawn(async move { store.get_or_create(&foo, factory).await })
        };
        while store.state(&foo) != ShellState::Initializing {
            tokio::task::yield_now().await;
        }
        first.abort();
        let _ = first.await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.state(&foo) != ShellState::Ready {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.get(&foo).unwrap().identity(), &foo);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_tenants_have_independent_roots() {
        let store = TenantShellStore::<String>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let foo = store
            .get_or_create(&identity("Foo"), counting_factory(calls.clone()))
            .await
            .unwrap();
        let bar = store
            .get_or_create(&identity("Bar"), counting_factory(calls.clone()))
            .await
            .unwrap();

        foo.root().add_instance(Arc::new(5_u64)).unwrap();
        assert!(foo.root().get_service::<u64>().unwrap().is_some());
        assert!(bar.root().get_service::<u64>().unwrap().is_none());
    }

    #[tokio::test]
    async fn evict_and_shutdown_dispose_roots() {
        let store = TenantShellStore::<String>::new();
        let calls = Arc::new(AtomicU32::new(0));
        let foo = identity("Foo");
        let bar = identity("Bar");

        let foo_shell = store
            .get_or_create(&foo, counting_factory(calls.clone()))
            .await
            .unwrap();
        let bar_shell = store
            .get_or_create(&bar, counting_factory(calls.clone()))
            .await
            .unwrap();
        let _ = store
            .get_or_create(&identity("Bad"), counting_factory(calls.clone()))
            .await;

        assert!(store.evict(&foo).await);
        assert!(foo_shell.root().is_disposed());
        assert!(!store.evict(&foo).await);

        assert_eq!(store.shutdown().await, 1);
        assert!(bar_shell.root().is_disposed());
        assert!(store.is_empty());
    }
}
