//! Linear multi-step pipeline.
//!
//! A [`Pipeline`] threads one context value through named steps. The first
//! failing step short-circuits the rest; [`Pipeline::complete`] hands back the
//! context or that step's error. Steps must be idempotent: a reconcile that
//! fails halfway simply builds and runs the whole pipeline again.

use tracing::{debug, warn};

use crate::controller::error::{Error, Result};

#[derive(Debug)]
pub struct Pipeline<C> {
    context: C,
    completed: Vec<&'static str>,
    failed: Option<(&'static str, Error)>,
}

impl<C> Pipeline<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            completed: Vec::new(),
            failed: None,
        }
    }

    /// Run `f` unless an earlier step failed
    pub fn step<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: FnOnce(&mut C) -> Result<()>,
    {
        if self.failed.is_some() {
            return self;
        }
        match f(&mut self.context) {
            Ok(()) => {
                debug!(step = name, "pipeline step done");
                self.completed.push(name);
            }
            Err(e) => {
                warn!(step = name, error = %e, "pipeline step failed");
                self.failed = Some((name, e));
            }
        }
        self
    }

    pub fn completed_steps(&self) -> &[&'static str] {
        &self.completed
    }

    pub fn failed_step(&self) -> Option<&'static str> {
        self.failed.as_ref().map(|(name, _)| *name)
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn complete(self) -> Result<C> {
        match self.failed {
            Some((_, e)) => Err(e),
            None => Ok(self.context),
        }
    }
}
