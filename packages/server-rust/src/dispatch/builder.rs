//! Assembly of a [`RequestDispatcher`] from host collaborators and config.

use std::sync::Arc;

use async_trait::async_trait;
use tenancy_core::TenantIdentity;

use super::dispatcher::RequestDispatcher;
use crate::config::TenancyConfig;
use crate::container::{Container, ContainerEvents};
use crate::hosting::TenantHostingEnvironment;
use crate::pipeline::{Pipeline, PipelineBuilder, TenantPipelineCache};
use crate::tenant::{
    ContainerConfigurator, ModuleCatalog, ShellFactory, TenantContainerScope, TenantFactory, TenantResolver,
    TenantSettingsStore, TenantShellStore,
};

/// Builder for [`RequestDispatcher`].
///
/// Anything not supplied explicitly comes from the [`TenancyConfig`]
/// (its defaults when no config is given): the resolver, the settings
/// store, the hosting environment, the build timeout, and the degraded
/// status. Without a pipeline builder every tenant gets the empty chain.
pub struct DispatcherBuilder<T> {
    shell_factory: ShellFactory<T>,
    resolver: Option<Arc<dyn TenantResolver>>,
    events: ContainerEvents,
    hosting: Option<Arc<TenantHostingEnvironment>>,
    settings: Option<Arc<TenantSettingsStore>>,
    pipeline: Option<Arc<dyn PipelineBuilder>>,
    config: TenancyConfig,
}

impl<T: Send + Sync + 'static> DispatcherBuilder<T> {
    #[must_use]
    pub fn new(factory: impl TenantFactory<T>) -> Self {
        Self {
            shell_factory: ShellFactory::new(Arc::new(factory)),
            resolver: None,
            events: ContainerEvents::default(),
            hosting: None,
            settings: None,
            pipeline: None,
            config: TenancyConfig::default(),
        }
    }

    #[must_use]
    pub fn resolver(mut self, resolver: impl TenantResolver) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Adds a container configurator; configurators run in call order.
    #[must_use]
    pub fn configure(mut self, configurator: impl ContainerConfigurator<T>) -> Self {
        self.shell_factory = self.shell_factory.with_configurator(configurator);
        self
    }

    #[must_use]
    pub fn events(mut self, events: ContainerEvents) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn hosting(mut self, hosting: TenantHostingEnvironment) -> Self {
        self.hosting = Some(Arc::new(hosting));
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: TenantSettingsStore) -> Self {
        self.settings = Some(Arc::new(settings));
        self
    }

    /// Modules tenants may enable through their settings.
    #[must_use]
    pub fn modules(mut self, catalog: ModuleCatalog) -> Self {
        self.shell_factory = self.shell_factory.with_modules(Arc::new(catalog));
        self
    }

    #[must_use]
    pub fn pipeline(mut self, builder: impl PipelineBuilder) -> Self {
        self.pipeline = Some(Arc::new(builder));
        self
    }

    #[must_use]
    pub fn config(mut self, config: TenancyConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> RequestDispatcher<T> {
        let config = self.config;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(config.resolver()));
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(config.settings_store()));
        let hosting = self
            .hosting
            .or_else(|| config.hosting_environment().map(Arc::new));

        let mut shell_factory = self
            .shell_factory
            .with_events(self.events.clone())
            .with_settings(Arc::clone(&settings));
        if let Some(hosting) = hosting {
            shell_factory = shell_factory.with_hosting(hosting);
        }

        let scopes = TenantContainerScope::new(self.events);
        let pipelines = TenantPipelineCache::new(scopes.clone(), config.pipeline_build_timeout());
        let pipeline_builder = self
            .pipeline
            .unwrap_or_else(|| Arc::new(EmptyPipelineBuilder));

        RequestDispatcher::new(
            resolver,
            Arc::new(shell_factory),
            Arc::new(TenantShellStore::new()),
            scopes,
            Arc::new(pipelines),
            pipeline_builder,
            Some(settings),
            config.degraded_status(),
        )
    }
}

struct EmptyPipelineBuilder;

#[async_trait]
impl PipelineBuilder for EmptyPipelineBuilder {
    async fn build(
        &self,
        _identity: &TenantIdentity,
        _services: &dyn Container,
    ) -> anyhow::Result<Pipeline> {
        Ok(Pipeline::empty())
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use tenancy_core::TenantId;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::dispatch::DispatchOutcome;
    use crate::tenant::FnTenantFactory;

    fn unit_factory() -> impl TenantFactory<()> {
        FnTenantFactory::new(|_identity: TenantIdentity| async { anyhow::Ok(()) })
    }

    #[tokio::test]
    async fn defaults_pass_everything_through() {
        let dispatcher = DispatcherBuilder::new(unit_factory()).build();
        let parts = http::Request::builder().uri("/").body(()).unwrap().into_parts().0;

        let outcome = dispatcher.dispatch(parts, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Passthrough { ref tenant, .. } if tenant.is_null()));
        assert!(dispatcher.pipelines().get(&TenantIdentity::null()).unwrap().pipeline.is_empty());
    }

    #[tokio::test]
    async fn config_supplies_resolver_and_degraded_status() {
        let id = TenantId::new_v4();
        let config = TenancyConfig::from_json_str(&format!(
            r#"{{
                "tenants": [{{ "id": "{}", "name": "Bad", "hosts": ["bad.example"] }}],
                "degraded_status": 500
            }}"#,
            id.as_uuid()
        ))
        .unwrap();
        let dispatcher = DispatcherBuilder::new(FnTenantFactory::new(
            |_identity: TenantIdentity| async { Err::<(), _>(anyhow::anyhow!("tenant store down")) },
        ))
        .config(config)
        .build();

        let parts = http::Request::builder()
            .uri("http://bad.example/")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let outcome = dispatcher.dispatch(parts, CancellationToken::new()).await.unwrap();
        let DispatchOutcome::Handled(response) = outcome else {
            panic!("expected degraded response");
        };
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("retry-after").is_none());
    }

    struct RoutedModule;

    impl crate::tenant::TenantModule for RoutedModule {
        fn name(&self) -> &str {
            "routed"
        }

        fn configure_pipeline(
            &self,
            _tenant: &TenantIdentity,
            _services: &dyn Container,
            chain: crate::pipeline::ChainBuilder,
        ) -> anyhow::Result<crate::pipeline::ChainBuilder> {
            Ok(chain.step(crate::pipeline::WelcomePageStep::new("/routed")))
        }
    }

    #[tokio::test]
    async fn configured_modules_extend_tenant_pipelines() {
        let (bar, foo) = (TenantId::new_v4(), TenantId::new_v4());
        let config = TenancyConfig::from_json_str(&format!(
            r#"{{
                "tenants": [
                    {{ "id": "{}", "name": "Bar", "settings": {{ "modules": ["routed"] }} }},
                    {{ "id": "{}", "name": "Foo" }}
                ]
            }}"#,
            bar.as_uuid(),
            foo.as_uuid()
        ))
        .unwrap();
        let dispatcher = DispatcherBuilder::new(unit_factory())
            .modules(ModuleCatalog::new().with_module(RoutedModule))
            .pipeline(crate::pipeline::FnPipelineBuilder::new(
                |identity: &TenantIdentity, services: &dyn Container| -> anyhow::Result<Pipeline> {
                    Ok(Pipeline::builder().use_modules(identity, services)?.build())
                },
            ))
            .config(config)
            .build();

        let request = |tenant: TenantId| {
            http::Request::builder()
                .uri("/routed")
                .header("x-tenant-id", tenant.to_string())
                .body(())
                .unwrap()
                .into_parts()
                .0
        };
        let bar_outcome = dispatcher.dispatch(request(bar), CancellationToken::new()).await.unwrap();
        let foo_outcome = dispatcher.dispatch(request(foo), CancellationToken::new()).await.unwrap();
        assert!(matches!(bar_outcome, DispatchOutcome::Handled(_)));
        assert!(matches!(foo_outcome, DispatchOutcome::Passthrough { .. }));
    }
}
