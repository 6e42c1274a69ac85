// src/script/flow_registry.rs
//! Named script steps per stage
//!
//! Steps keep registration order. Registering a name twice replaces the
//! earlier step in place.

use crate::runtime::context::ExecutionContext;
use crate::script::{ScriptError, Stage, StageArgs};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::rc::Rc;

/// One registered step
pub type Step = Rc<dyn Fn(Rc<ExecutionContext>) -> LocalBoxFuture<'static, Result<(), ScriptError>>>;

/// Registry of initializers, actions and finalizers
#[derive(Default)]
pub struct FlowRegistry {
    initializers: Vec<(String, Step)>,
    actions: Vec<(String, Step)>,
    finalizers: Vec<(String, Step)>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize<F, Fut>(&mut self, name: impl Into<String>, step: F) -> &mut Self
    where
        F: Fn(Rc<ExecutionContext>) -> Fut + 'static,
        Fut: Future<Output = Result<(), ScriptError>> + 'static,
    {
        self.register(Stage::Initialize, name, step)
    }

    pub fn action<F, Fut>(&mut self, name: impl Into<String>, step: F) -> &mut Self
    where
        F: Fn(Rc<ExecutionContext>) -> Fut + 'static,
        Fut: Future<Output = Result<(), ScriptError>> + 'static,
    {
        self.register(Stage::Action, name, step)
    }

    pub fn finalize<F, Fut>(&mut self, name: impl Into<String>, step: F) -> &mut Self
    where
        F: Fn(Rc<ExecutionContext>) -> Fut + 'static,
        Fut: Future<Output = Result<(), ScriptError>> + 'static,
    {
        self.register(Stage::Finalize, name, step)
    }

    /// Register `step` under `name` for `stage`
    pub fn register<F, Fut>(&mut self, stage: Stage, name: impl Into<String>, step: F) -> &mut Self
    where
        F: Fn(Rc<ExecutionContext>) -> Fut + 'static,
        Fut: Future<Output = Result<(), ScriptError>> + 'static,
    {
        let name = name.into();
        let step: Step = Rc::new(move |ctx| step(ctx).boxed_local());
        let steps = self.steps_mut(stage);

        match steps.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = step,
            None => steps.push((name, step)),
        }
        self
    }

    /// Registered step names of `stage`, in order
    pub fn names(&self, stage: Stage) -> Vec<&str> {
        self.steps(stage).iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.steps(stage).len()
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.is_empty() && self.actions.is_empty() && self.finalizers.is_empty()
    }

    /// Steps to run for a stage dispatch
    ///
    /// No flow selects every step, an empty flow selects none, and a named
    /// flow selects exactly those steps in the given order.
    pub fn resolve(&self, args: &StageArgs) -> Result<Vec<(String, Step)>, ScriptError> {
        let steps = self.steps(args.stage);

        let Some(flow) = &args.flow else {
            return Ok(steps.to_vec());
        };

        flow.iter()
            .map(|name| {
                steps
                    .iter()
                    .find(|(existing, _)| existing == name)
                    .cloned()
                    .ok_or_else(|| ScriptError::InvalidFlow(name.clone()))
            })
            .collect()
    }

    fn steps(&self, stage: Stage) -> &[(String, Step)] {
        match stage {
            Stage::Initialize => &self.initializers,
            Stage::Action => &self.actions,
            Stage::Finalize => &self.finalizers,
        }
    }

    fn steps_mut(&mut self, stage: Stage) -> &mut Vec<(String, Step)> {
        match stage {
            Stage::Initialize => &mut self.initializers,
            Stage::Action => &mut self.actions,
            Stage::Finalize => &mut self.finalizers,
        }
    }
}
