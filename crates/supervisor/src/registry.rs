use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::info;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::env_path::DependencyPaths;
use crate::error::SupervisorError;
use crate::job::{Job, JobEvent};
use crate::options::EncodeOptions;

/// All jobs of one supervisor, addressed by id
pub struct JobRegistry {
    config: SupervisorConfig,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl JobRegistry {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an idle job and register it
    pub fn create(&self, options: EncodeOptions, deps: DependencyPaths) -> Job {
        let job = Job::new(options, deps, self.config.clone());
        info!("Registered job {} ({})", job.id(), job.options().input.display());
        self.jobs().insert(job.id(), job.clone());
        job
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs().get(&id).cloned()
    }

    pub fn subscribe(&self, id: Uuid) -> Option<broadcast::Receiver<JobEvent>> {
        self.get(id).map(|job| job.subscribe())
    }

    pub fn ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.jobs().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// Forget a job. A job with a live process has to be cancelled first.
    pub fn remove(&self, id: Uuid) -> Result<Option<Job>, SupervisorError> {
        let mut jobs = self.jobs();
        if jobs.get(&id).is_some_and(Job::is_running) {
            return Err(SupervisorError::AlreadyRunning(id.to_string()));
        }
        let removed = jobs.remove(&id);
        if removed.is_some() {
            info!("Removed job {}", id);
        }
        Ok(removed)
    }
}
