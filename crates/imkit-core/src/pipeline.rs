//! Ordered hook chains used by the plugin system.
//!
//! A [`Pipeline`] is a list of transform-or-reject stages; a [`Gate`] is a
//! list of boolean predicates; [`Decorators`] run once against a freshly
//! constructed entity. All three run strictly in registration order.

use std::fmt;
use std::sync::Arc;

/// Result of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    /// Hand the (possibly replaced) value to the next stage.
    Continue(T),
    /// Stop processing; later stages do not run.
    Reject(Rejection),
}

impl<T> Flow<T> {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(Rejection {
            stage: None,
            reason: reason.into(),
        })
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }

    /// The carried value, discarding any rejection.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Continue(value) => Some(value),
            Self::Reject(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Flow<U> {
        match self {
            Self::Continue(value) => Flow::Continue(f(value)),
            Self::Reject(rejection) => Flow::Reject(rejection),
        }
    }
}

/// Why a pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Name of the stage that rejected, when it has one.
    pub stage: Option<String>,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "rejected by {}: {}", stage, self.reason),
            None => write!(f, "rejected: {}", self.reason),
        }
    }
}

pub type Middleware<T> = Arc<dyn Fn(T) -> Flow<T> + Send + Sync + 'static>;
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync + 'static>;
pub type Decorator<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Stage<F> {
    name: Option<String>,
    hook: F,
}

impl<F: Clone> Clone for Stage<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            hook: self.hook.clone(),
        }
    }
}

/// Transform-or-reject chain.
pub struct Pipeline<T> {
    stages: Vec<Stage<Middleware<T>>>,
}

impl<T> Pipeline<T> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, name: Option<&str>, hook: Middleware<T>) {
        self.stages.push(Stage {
            name: name.map(str::to_string),
            hook,
        });
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run all stages in order, stopping at the first rejection.
    pub fn run(&self, input: T) -> Flow<T> {
        let mut value = input;
        for stage in &self.stages {
            match (stage.hook)(value) {
                Flow::Continue(next) => value = next,
                Flow::Reject(mut rejection) => {
                    if rejection.stage.is_none() {
                        rejection.stage = stage.name.clone();
                    }
                    return Flow::Reject(rejection);
                }
            }
        }
        Flow::Continue(value)
    }
}

impl<T> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

/// Boolean gate: the value passes only if every predicate allows it.
pub struct Gate<T> {
    stages: Vec<Stage<Predicate<T>>>,
}

impl<T> Gate<T> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, name: Option<&str>, hook: Predicate<T>) {
        self.stages.push(Stage {
            name: name.map(str::to_string),
            hook,
        });
    }

    /// `Ok(())` if allowed, otherwise the name of the first denying stage.
    pub fn check(&self, value: &T) -> Result<(), Option<String>> {
        for stage in &self.stages {
            if !(stage.hook)(value) {
                return Err(stage.name.clone());
            }
        }
        Ok(())
    }

    pub fn allows(&self, value: &T) -> bool {
        self.check(value).is_ok()
    }
}

impl<T> Default for Gate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Gate<T> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

/// One-shot mutators run against a newly constructed entity.
pub struct Decorators<T> {
    stages: Vec<Stage<Decorator<T>>>,
}

impl<T> Decorators<T> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, name: Option<&str>, hook: Decorator<T>) {
        self.stages.push(Stage {
            name: name.map(str::to_string),
            hook,
        });
    }

    pub fn apply(&self, target: &T) {
        for stage in &self.stages {
            (stage.hook)(target);
        }
    }
}

impl<T> Default for Decorators<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Decorators<T> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}
