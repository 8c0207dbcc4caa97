//! Immutable ordered step chains.

use std::sync::Arc;

use tenancy_core::TenantIdentity;
use tracing::trace;

use super::context::RequestContext;
use super::step::{PipelineStep, StepOutcome};
use crate::container::{Container, ContainerExt};
use crate::error::StepFault;
use crate::tenant::LoadedModules;

/// A tenant's ordered, immutable chain of steps.
///
/// Cloning shares the steps. A rebuilt pipeline is a new value, so requests
/// already running on the previous one are unaffected.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn PipelineStep>]>,
}

impl Pipeline {
    /// The no-op chain: every request passes through.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            steps: Arc::from(Vec::new()),
        }
    }

    #[must_use]
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs the steps in order until one handles the request.
    ///
    /// # Errors
    ///
    /// Stops at the first step that faults and returns its [`StepFault`].
    pub async fn invoke(&self, ctx: &mut RequestContext) -> Result<StepOutcome, StepFault> {
        for step in self.steps.iter() {
            trace!(step = step.name(), "invoking pipeline step");
            if let StepOutcome::Handled(response) = step.invoke(ctx).await? {
                trace!(step = step.name(), status = %response.status(), "request handled");
                return Ok(StepOutcome::Handled(response));
            }
        }
        Ok(StepOutcome::Passthrough)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`Pipeline`]. Step order is the order of the calls.
#[derive(Default)]
pub struct ChainBuilder {
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl ChainBuilder {
    #[must_use]
    pub fn step(mut self, step: impl PipelineStep) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends an already shared step.
    #[must_use]
    pub fn shared_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends `step` only when `condition` holds.
    #[must_use]
    pub fn step_if(self, condition: bool, step: impl PipelineStep) -> Self {
        if condition {
            self.step(step)
        } else {
            self
        }
    }

    /// Appends the steps of the tenant's [`LoadedModules`], found in
    /// `services`. Without loaded modules the chain is unchanged.
    ///
    /// # Errors
    ///
    /// Fails if the container cannot be read or a module fails.
    pub fn use_modules(
        self,
        tenant: &TenantIdentity,
        services: &dyn Container,
    ) -> anyhow::Result<Self> {
        match services.get_service::<LoadedModules>()? {
            Some(modules) => modules.configure_pipeline(tenant, services, self),
            None => Ok(self),
        }
    }

    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            steps: Arc::from(self.steps),
        }
    }
}
