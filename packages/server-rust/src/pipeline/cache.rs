//! Per-tenant pipeline cache with single-flight builds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use tenancy_core::{TenantId, TenantIdentity};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chain::Pipeline;
use crate::container::Container;
use crate::error::PipelineBuildError;
use crate::tenant::{FlightState, SingleFlight, TenantContainerScope, TenantShell};

/// Composes a tenant's pipeline.
///
/// `services` is a scope of the tenant's root container, so the builder can
/// consult tenant configuration (e.g. [`TenantSettings`](crate::tenant::TenantSettings))
/// to decide which steps to include.
#[async_trait]
pub trait PipelineBuilder: Send + Sync + 'static {
    async fn build(
        &self,
        identity: &TenantIdentity,
        services: &dyn Container,
    ) -> anyhow::Result<Pipeline>;
}

/// Adapts a synchronous closure into a [`PipelineBuilder`].
pub struct FnPipelineBuilder<F>(F);

impl<F> FnPipelineBuilder<F>
where
    F: Fn(&TenantIdentity, &dyn Container) -> anyhow::Result<Pipeline> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> PipelineBuilder for FnPipelineBuilder<F>
where
    F: Fn(&TenantIdentity, &dyn Container) -> anyhow::Result<Pipeline> + Send + Sync + 'static,
{
    async fn build(
        &self,
        identity: &TenantIdentity,
        services: &dyn Container,
    ) -> anyhow::Result<Pipeline> {
        (self.0)(identity, services)
    }
}

/// A built pipeline and its provenance.
#[derive(Debug, Clone)]
pub struct PipelineEntry {
    pub identity: TenantIdentity,
    /// Id of the shell whose root container the pipeline was built from.
    pub shell_id: Uuid,
    pub pipeline: Pipeline,
    /// Cache-wide build counter value of this build; strictly increasing.
    pub generation: u64,
    pub built_at: Instant,
}

/// Cache key: a pipeline belongs to one shell of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    identity: TenantIdentity,
    shell_id: Uuid,
}

impl PipelineKey {
    fn for_shell<T>(shell: &TenantShell<T>) -> Self {
        Self {
            identity: shell.identity().clone(),
            shell_id: shell.id(),
        }
    }
}

/// Cache of built pipelines keyed by tenant shell.
///
/// Each shell's pipeline is built at most once until invalidated. A failed
/// or timed-out build is cached as well, so requests do not retry it.
/// Entries of one shell are never served to requests holding another shell
/// of the same tenant, and results built against a disposed root are
/// dropped as soon as they complete.
pub struct TenantPipelineCache {
    entries: SingleFlight<PipelineKey, Arc<PipelineEntry>, PipelineBuildError>,
    scopes: TenantContainerScope,
    generation: Arc<AtomicU64>,
    build_timeout: Duration,
}

impl TenantPipelineCache {
    #[must_use]
    pub fn new(scopes: TenantContainerScope, build_timeout: Duration) -> Self {
        Self {
            entries: SingleFlight::new(),
            scopes,
            generation: Arc::new(AtomicU64::new(0)),
            build_timeout,
        }
    }

    /// Returns the shell's pipeline, building it with `builder` on first use.
    ///
    /// The build runs on its own task inside a dedicated scope of the
    /// shell's root container, and keeps running if the caller goes away.
    ///
    /// # Errors
    ///
    /// Returns the shell's cached [`PipelineBuildError`].
    pub async fn get_or_build<T: Send + Sync + 'static>(
        &self,
        shell: &Arc<TenantShell<T>>,
        builder: Arc<dyn PipelineBuilder>,
    ) -> Result<Arc<PipelineEntry>, PipelineBuildError> {
        let key = PipelineKey::for_shell(shell);
        let tenant = shell.identity().clone();
        let flight = self.entries.get_or_start(
            &key,
            || {
                build_entry(
                    Arc::clone(shell),
                    self.scopes.clone(),
                    builder,
                    Arc::clone(&self.generation),
                    self.build_timeout,
                )
            },
            move |join_error| {
                counter!("tenancy_pipeline_build_failures_total").increment(1);
                PipelineBuildError::Aborted {
                    tenant,
                    reason: join_error.to_string(),
                }
            },
        );
        let result = flight.clone().await;
        if shell.root().is_disposed() && self.entries.remove_flight(&key, &flight) {
            debug!(
                tenant = %key.identity,
                shell_id = %key.shell_id,
                "dropped pipeline of disposed tenant shell"
            );
        }
        result
    }

    /// The tenant's most recently built pipeline, if one is cached.
    #[must_use]
    pub fn get(&self, identity: &TenantIdentity) -> Option<Arc<PipelineEntry>> {
        self.entries
            .snapshot_where(|key| &key.identity == identity)
            .into_iter()
            .filter_map(|(_, _, result)| result.and_then(Result::ok))
            .max_by_key(|entry| entry.generation)
    }

    /// The shell's built pipeline, if one is cached.
    #[must_use]
    pub fn get_for_shell<T>(&self, shell: &TenantShell<T>) -> Option<Arc<PipelineEntry>> {
        self.entries
            .peek(&PipelineKey::for_shell(shell))
            .and_then(Result::ok)
    }

    /// Most advanced state among the tenant's shells: a built pipeline wins
    /// over a running build, which wins over a cached failure.
    #[must_use]
    pub fn state(&self, identity: &TenantIdentity) -> FlightState {
        self.entries
            .snapshot_where(|key| &key.identity == identity)
            .into_iter()
            .map(|(_, state, _)| state)
            .max_by_key(|state| match state {
                FlightState::Absent => 0,
                FlightState::Failed => 1,
                FlightState::InFlight => 2,
                FlightState::Succeeded => 3,
            })
            .unwrap_or(FlightState::Absent)
    }

    #[must_use]
    pub fn state_for_shell<T>(&self, shell: &TenantShell<T>) -> FlightState {
        self.entries.state(&PipelineKey::for_shell(shell))
    }

    /// Drops the tenant's cached pipelines and cached failures. Requests
    /// already running keep the pipeline they hold.
    pub fn invalidate(&self, identity: &TenantIdentity) -> bool {
        let removed = !self
            .entries
            .remove_where(|key| &key.identity == identity)
            .is_empty();
        if removed {
            info!(tenant = %identity, "tenant pipeline invalidated");
        }
        removed
    }

    /// Drops cached pipelines of every identity with tenant id `id`.
    pub fn invalidate_tenant_id(&self, id: TenantId) -> usize {
        self.entries
            .remove_where(|key| key.identity.id() == id)
            .len()
    }

    pub fn invalidate_all(&self) -> usize {
        let removed = self.entries.drain().len();
        info!(removed, "all tenant pipelines invalidated");
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TenantPipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPipelineCache")
            .field("entries", &self.entries.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("build_timeout", &self.build_timeout)
            .finish_non_exhaustive()
    }
}

async fn build_entry<T: Send + Sync + 'static>(
    shell: Arc<TenantShell<T>>,
    scopes: TenantContainerScope,
    builder: Arc<dyn PipelineBuilder>,
    generation: Arc<AtomicU64>,
    build_timeout: Duration,
) -> Result<Arc<PipelineEntry>, PipelineBuildError> {
    let tenant = shell.identity().clone();
    counter!("tenancy_pipeline_builds_total").increment(1);

    let result = match scopes.open_scope(&shell, None) {
        Err(err) => Err(PipelineBuildError::Scope {
            tenant: tenant.clone(),
            reason: err.to_string(),
        }),
        Ok(scope) => {
            let built = tokio::time::timeout(build_timeout, builder.build(&tenant, &*scope)).await;
            drop(scope);
            match built {
                Ok(Ok(pipeline)) => {
                    let generation = generation.fetch_add(1, Ordering::AcqRel) + 1;
                    info!(
                        tenant = %tenant,
                        generation,
                        steps = ?pipeline.step_names(),
                        "tenant pipeline built"
                    );
                    Ok(Arc::new(PipelineEntry {
                        identity: tenant.clone(),
                        shell_id: shell.id(),
                        pipeline,
                        generation,
                        built_at: Instant::now(),
                    }))
                }
                Ok(Err(cause)) => Err(PipelineBuildError::Failed {
                    tenant: tenant.clone(),
                    cause: Arc::new(cause),
                }),
                Err(_elapsed) => Err(PipelineBuildError::TimedOut {
                    tenant: tenant.clone(),
                    timeout_ms: u64::try_from(build_timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        }
    };

    if let Err(err) = &result {
        counter!("tenancy_pipeline_build_failures_total").increment(1);
        warn!(tenant = %tenant, error = %err, "tenant pipeline build failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tenancy_core::TenantId;

    use super::*;
    use crate::container::{ContainerExt, ServiceContainer};
    use crate::pipeline::steps::{StaticFileStep, WelcomePageStep};
    use crate::tenant::TenantSettings;

    fn shell(name: &str, settings: TenantSettings) -> Arc<TenantShell<()>> {
        let identity = TenantIdentity::new(TenantId::new_v4(), name);
        let root = ServiceContainer::new_root(format!("tenant:{name}"));
        root.add_instance(Arc::new(settings)).unwrap();
        Arc::new(TenantShell::new(identity, Arc::new(()), root))
    }

    /// Includes the welcome page only for tenants whose settings enable it.
    fn settings_builder(calls: Arc<AtomicU32>) -> Arc<dyn PipelineBuilder> {
        Arc::new(FnPipelineBuilder::new(
            move |_identity: &TenantIdentity, services: &dyn Container| -> anyhow::Result<Pipeline> {
                calls.fetch_add(1, Ordering::SeqCst);
                let settings = services.get_required_service::<TenantSettings>()?;
                Ok(Pipeline::builder()
                    .step_if(settings.has_feature("welcome_page"), WelcomePageStep::default())
                    .step(StaticFileStep::new())
                    .build())
            },
        ))
    }

    struct SlowBuilder {
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    #[async_trait]
    impl PipelineBuilder for SlowBuilder {
        async fn build(
            &self,
            _identity: &TenantIdentity,
            _services: &dyn Container,
        ) -> anyhow::Result<Pipeline> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Pipeline::builder().step(WelcomePageStep::default()).build())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fifty_concurrent_requests_build_once() {
        let cache = Arc::new(TenantPipelineCache::new(
            TenantContainerScope::default(),
            Duration::from_secs(5),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let foo = shell("Foo", TenantSettings::default().with_feature("welcome_page"));
        let builder: Arc<dyn PipelineBuilder> = Arc::new(SlowBuilder {
            calls: calls.clone(),
            delay: Duration::from_millis(20),
        });

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let foo = foo.clone();
            let builder = builder.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_build(&foo, builder).await.unwrap()
            }));
        }
        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(cache.state(foo.identity()), FlightState::Succeeded);
    }

    #[tokio::test]
    async fn settings_drive_composition() {
        let cache = TenantPipelineCache::new(TenantContainerScope::default(), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let foo = shell("Foo", TenantSettings::default().with_feature("welcome_page"));
        let bar = shell("Bar", TenantSettings::default());

        let foo_entry = cache
            .get_or_build(&foo, settings_builder(calls.clone()))
            .await
            .unwrap();
        let bar_entry = cache
            .get_or_build(&bar, settings_builder(calls.clone()))
            .await
            .unwrap();

        assert_eq!(foo_entry.pipeline.step_names(), vec!["welcome_page", "static_files"]);
        assert_eq!(bar_entry.pipeline.step_names(), vec!["static_files"]);
        assert_ne!(foo_entry.generation, bar_entry.generation);
    }

    #[tokio::test]
    async fn build_scope_is_disposed_after_build() {
        let scopes = TenantContainerScope::default();
        let cache = TenantPipelineCache::new(scopes.clone(), Duration::from_secs(5));
        let foo = shell("Foo", TenantSettings::default());

        cache
            .get_or_build(&foo, settings_builder(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap();
        assert_eq!(scopes.open_count(), 0);
    }

    #[tokio::test]
    async fn failure_is_cached_until_invalidated() {
        let cache = TenantPipelineCache::new(TenantContainerScope::default(), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let foo = shell("Foo", TenantSettings::default());
        let counter = calls.clone();
        let failing: Arc<dyn PipelineBuilder> = Arc::new(FnPipelineBuilder::new(
            move |_: &TenantIdentity, _: &dyn Container| -> anyhow::Result<Pipeline> {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("bad pipeline config")
            },
        ));

        let first = cache.get_or_build(&foo, failing.clone()).await.unwrap_err();
        let second = cache.get_or_build(&foo, failing.clone()).await.unwrap_err();
        assert!(matches!(first, PipelineBuildError::Failed { .. }));
        assert!(matches!(second, PipelineBuildError::Failed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(cache.invalidate(foo.identity()));
        let _ = cache.get_or_build(&foo, failing).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rebuild_after_invalidation_leaves_old_entry_intact() {
        let cache = TenantPipelineCache::new(TenantContainerScope::default(), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let foo = shell("Foo", TenantSettings::default().with_feature("welcome_page"));

        let old = cache
            .get_or_build(&foo, settings_builder(calls.clone()))
            .await
            .unwrap();
        assert_eq!(cache.invalidate_all(), 1);
        let new = cache
            .get_or_build(&foo, settings_builder(calls.clone()))
            .await
            .unwrap();

        assert!(new.generation > old.generation);
        assert_eq!(old.pipeline.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.invalidate_tenant_id(foo.identity().id()), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_build_times_out_and_is_cached() {
        let cache = TenantPipelineCache::new(TenantContainerScope::default(), Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let foo = shell("Foo", TenantSettings::default());
        let builder: Arc<dyn PipelineBuilder> = Arc::new(SlowBuilder {
            calls: calls.clone(),
            delay: Duration::from_secs(60),
        });

        let err = cache.get_or_build(&foo, builder.clone()).await.unwrap_err();
        assert!(matches!(err, PipelineBuildError::TimedOut { timeout_ms: 1000, .. }));
        assert!(cache.get_or_build(&foo, builder).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disposed_shell_failure_is_not_kept() {
        let cache = TenantPipelineCache::new(TenantContainerScope::default(), Duration::from_secs(5));
        let foo = shell("Foo", TenantSettings::default());
        foo.root().dispose();

        let err = cache
            .get_or_build(&foo, settings_builder(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineBuildError::Scope { .. }));
        assert!(cache.is_empty());
        assert_eq!(cache.state(foo.identity()), FlightState::Absent);
    }

    #[tokio::test]
    async fn stale_shell_does_not_poison_its_replacement() {
        let cache = TenantPipelineCache::new(TenantContainerScope::default(), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let settings = TenantSettings::default().with_feature("welcome_page");
        let stale = shell("Foo", settings.clone());
        let root = ServiceContainer::new_root("tenant:Foo");
        root.add_instance(Arc::new(settings)).unwrap();
        let fresh = Arc::new(TenantShell::new(stale.identity().clone(), Arc::new(()), root));

        let old = cache
            .get_or_build(&stale, settings_builder(calls.clone()))
            .await
            .unwrap();
        stale.root().dispose();
        let _ = cache.get_or_build(&stale, settings_builder(calls.clone())).await;
        assert!(cache.get_for_shell(&*stale).is_none());

        let new = cache
            .get_or_build(&fresh, settings_builder(calls.clone()))
            .await
            .unwrap();
        assert_eq!(new.shell_id, fresh.id());
        assert_ne!(new.shell_id, old.shell_id);
        assert_eq!(new.pipeline.step_names(), vec!["welcome_page", "static_files"]);
        assert_eq!(cache.state_for_shell(&*fresh), FlightState::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
