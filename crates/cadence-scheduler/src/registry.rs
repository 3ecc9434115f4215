use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::types::JobDefinition;

/// The set of loaded job implementations, keyed by name.
///
/// Populated by the loader before the engine starts; the engine only reads it.
#[derive(Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a job.
    ///
    /// Fails with `InvalidJob` when the metadata breaks the job contract and
    /// `DuplicateJob` when the name is taken.
    pub fn register<J: Job>(&mut self, job: J) -> Result<()> {
        self.register_arc(Arc::new(job))
    }

    pub fn register_arc(&mut self, job: Arc<dyn Job>) -> Result<()> {
        validate(job.as_ref())?;
        let name = job.name().to_string();
        if self.jobs.contains_key(&name) {
            return Err(SchedulerError::DuplicateJob { name });
        }
        debug!(job = %name, queue = job.queue(), "job registered");
        self.jobs.insert(name, job);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Job>> {
        self.jobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered jobs in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Job>> {
        self.jobs.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// The definition row a registered job maps to.
pub fn definition_for(job: &dyn Job) -> JobDefinition {
    let delay = if job.reschedule() {
        job.reschedule_delay()
    } else {
        None
    };
    JobDefinition::new(job.name(), delay)
}

fn validate(job: &dyn Job) -> Result<()> {
    let name = job.name();
    let invalid = |reason: &str| SchedulerError::InvalidJob {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if job.queue().trim().is_empty() {
        return Err(invalid("queue must not be empty"));
    }
    match (job.reschedule(), job.reschedule_delay()) {
        (true, None) => Err(invalid("reschedule is set but reschedule_delay is missing")),
        (false, Some(_)) => Err(invalid("reschedule_delay is set but reschedule is false")),
        _ => Ok(()),
    }
}
