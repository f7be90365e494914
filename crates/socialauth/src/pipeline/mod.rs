//! Resumable authentication pipeline.
//!
//! A [`Pipeline`] is an ordered list of [`PipelineStep`]s resolved by name from
//! a [`StepRegistry`] before anything runs. Steps execute one after another
//! over a shared [`PipelineContext`]; each step returns a [`StepOutput`]:
//!
//! - `Merge(map)` adds named results to the context and continues
//! - `Continue` continues without changes
//! - `Halt(response)` stops the run and hands `response` to the caller
//!
//! A step marked [`suspendable`](PipelineStep::suspendable) that halts also
//! suspends the run: the context as it was before the step ran is stored as a
//! partial state and the run later re-enters at that same step. A suspendable
//! step that merges or continues never stores anything.
//!
//! Errors abort the run and are returned unchanged.

pub mod context;
pub mod partial;
pub mod steps;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::AuthError;
use crate::storage::Session;
use crate::AuthResult;

pub use context::PipelineContext;
pub use partial::{PARTIAL_TOKEN_PARAM, PARTIAL_TOKEN_SESSION_KEY, PartialStateManager};

/// Steps run when no pipeline is configured.
pub const DEFAULT_PIPELINE: &[&str] = &[
    "social_details",
    "social_uid",
    "auth_allowed",
    "social_user",
    "get_username",
    "create_user",
    "associate_user",
    "load_extra_data",
    "user_details",
];

/// What a halted run hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    /// Send the browser to this URL.
    Redirect(String),
    /// Any other value.
    Value(Value),
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Merge these named results into the context.
    Merge(Map<String, Value>),
    /// Nothing to add.
    Continue,
    /// Stop the run.
    Halt(StepResponse),
}

impl StepOutput {
    /// Merge output with a single entry.
    #[must_use]
    pub fn single(key: &str, value: impl Into<Value>) -> Self {
        let mut map = Map::new();
        map.insert(key.to_string(), value.into());
        Self::Merge(map)
    }

    /// Halt with a redirect.
    #[must_use]
    pub fn redirect(url: impl Into<String>) -> Self {
        Self::Halt(StepResponse::Redirect(url.into()))
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Name the step is registered under.
    fn name(&self) -> &str;

    /// Whether halting in this step suspends the run.
    fn suspendable(&self) -> bool {
        false
    }

    /// Whether a suspension also stores the token in the session.
    fn save_to_session(&self) -> bool {
        true
    }

    /// Runs the step.
    ///
    /// # Errors
    ///
    /// Any error aborts the run.
    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput>;
}

/// Steps available to pipelines, keyed by name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn PipelineStep>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in step.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for step in steps::builtin() {
            registry.register(step);
        }
        registry
    }

    /// Registers a step under its name, replacing any step of the same name.
    pub fn register(&mut self, step: Arc<dyn PipelineStep>) {
        self.steps.insert(step.name().to_string(), step);
    }

    /// Registers a step and returns the registry.
    #[must_use]
    pub fn with_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.register(step);
        self
    }

    /// Looks a step up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn PipelineStep>> {
        self.steps.get(name).cloned()
    }

    /// Returns `true` if a step is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every step ran.
    Completed,
    /// A step halted the run.
    Halted(StepResponse),
    /// A suspendable step halted the run and a partial state was stored.
    Suspended {
        /// Token of the stored partial state.
        token: String,
        /// What the step handed back.
        response: StepResponse,
    },
}

/// An ordered list of resolved steps.
#[derive(Clone)]
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.step_names()).finish()
    }
}

impl Pipeline {
    /// Resolves `names` against `registry`.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error naming the first unknown step.
    pub fn resolve<S: AsRef<str>>(registry: &StepRegistry, names: &[S]) -> AuthResult<Self> {
        let steps = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                registry
                    .get(name)
                    .ok_or_else(|| AuthError::pipeline(format!("unknown pipeline step \"{name}\"")))
            })
            .collect::<AuthResult<Vec<_>>>()?;
        Ok(Self { steps })
    }

    /// Resolves [`DEFAULT_PIPELINE`].
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if a built-in step was removed from `registry`.
    pub fn default_pipeline(registry: &StepRegistry) -> AuthResult<Self> {
        Self::resolve(registry, DEFAULT_PIPELINE)
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name())
    }

    /// Runs the steps from index `start` to the end.
    ///
    /// # Errors
    ///
    /// Returns the first step error, a storage error if a suspension cannot
    /// be persisted, or a pipeline error if `start` is out of range.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        start: usize,
        partials: &PartialStateManager,
        session: &dyn Session,
    ) -> AuthResult<PipelineOutcome> {
        if start > self.steps.len() {
            return Err(AuthError::pipeline(format!(
                "cannot start at step {start} of a {}-step pipeline",
                self.steps.len()
            )));
        }

        for (index, step) in self.steps.iter().enumerate().skip(start) {
            let snapshot = step
                .suspendable()
                .then(|| partials.capture(ctx, index, step.name()));

            tracing::debug!(step = step.name(), index, "Running pipeline step");

            match step.run(ctx).await? {
                StepOutput::Merge(output) => ctx.merge(output),
                StepOutput::Continue => {}
                StepOutput::Halt(response) => {
                    let Some(state) = snapshot else {
                        tracing::debug!(step = step.name(), "Pipeline halted");
                        return Ok(PipelineOutcome::Halted(response));
                    };
                    partials
                        .persist(&state, session, step.save_to_session())
                        .await?;
                    return Ok(PipelineOutcome::Suspended {
                        token: state.token,
                        response,
                    });
                }
            }
        }

        Ok(PipelineOutcome::Completed)
    }

    /// Checks that a suspended run still lines up with this pipeline.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if the step at `index` is not `step_name`.
    pub fn check_resume_point(&self, index: usize, step_name: &str) -> AuthResult<()> {
        match self.steps.get(index) {
            Some(step) if step.name() == step_name => Ok(()),
            _ => Err(AuthError::pipeline(format!(
                "suspended step \"{step_name}\" is no longer at index {index}"
            ))),
        }
    }
}
