//! Saga definitions and their builder.

use std::collections::HashSet;
use std::time::Duration;

use crate::{Result, SagaError};

/// One step of a saga: a forward command and the command that undoes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub name: String,
    /// Event type emitted to run the step.
    pub forward_command: String,
    /// Event type emitted to undo the step.
    pub compensate_command: String,
    /// How long an attempt may stay unanswered before it counts as timed out.
    pub timeout: Duration,
    /// Retries after the first attempt; the budget is `1 + max_retries`.
    pub max_retries: u32,
}

impl StepSpec {
    /// Total attempts allowed for this step.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// An ordered, immutable list of steps.
///
/// Built once at startup via [`SagaDefinition::builder`]; instances refer to
/// a definition by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDefinition {
    name: String,
    version: u32,
    steps: Vec<StepSpec>,
}

impl SagaDefinition {
    /// Starts building a definition.
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// Returns the step at a zero-based index.
    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    /// Number of steps. Never zero.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps. [`SagaDefinitionBuilder::build`]
    /// rejects empty definitions, so a built one is never empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns true if `index` is the final step.
    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.steps.len()
    }

    /// All forward and compensation command types, in step order.
    pub fn command_types(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|s| [s.forward_command.as_str(), s.compensate_command.as_str()])
    }
}

/// Accumulates steps, validating on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct SagaDefinitionBuilder {
    name: String,
    version: u32,
    steps: Vec<StepSpec>,
}

impl SagaDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            steps: Vec::new(),
        }
    }

    /// Sets the definition version (defaults to 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Appends a step. Steps run in the order they are added.
    pub fn add_step(
        mut self,
        name: impl Into<String>,
        forward_command: impl Into<String>,
        compensate_command: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        self.steps.push(StepSpec {
            name: name.into(),
            forward_command: forward_command.into(),
            compensate_command: compensate_command.into(),
            timeout,
            max_retries,
        });
        self
    }

    /// Validates and freezes the definition.
    pub fn build(self) -> Result<SagaDefinition> {
        if self.steps.is_empty() {
            return Err(SagaError::EmptyDefinition { name: self.name });
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.steps.iter().find(|s| !seen.insert(s.name.as_str())) {
            return Err(SagaError::DuplicateStepName {
                definition: self.name.clone(),
                step: dup.name.clone(),
            });
        }

        Ok(SagaDefinition {
            name: self.name,
            version: self.version,
            steps: self.steps,
        })
    }
}
