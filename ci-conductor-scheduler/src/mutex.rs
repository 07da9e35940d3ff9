// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;

use ci_conductor_core::data::{ItemId, Job};
use tracing::{debug, error};

/// The observed state of a mutex holder's build, collected before each
/// queue-processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HolderState {
    /// The holding build is still running.
    Running,
    /// The holding build has a terminal result, or the holder is gone.
    Terminal,
}

/// The arbiter of named job mutexes.
///
/// Each mutex name maps to at most one `(item, job)` holder across all
/// pipelines. Dispatch code must acquire before launching a mutex-bearing
/// job and release when the job reaches a terminal result or is cancelled.
#[derive(Debug, Default)]
pub struct MutexRegistry {
    mutexes: HashMap<String, (ItemId, String)>,
}

impl MutexRegistry {
    /// Try to acquire the mutex of a job for an item.
    ///
    /// Jobs without a mutex always succeed, as does re-acquisition by the
    /// current holder. A mutex whose holder's build already finished is
    /// reclaimed; that indicates a missed release and is logged as an
    /// anomaly.
    pub(crate) fn acquire(
        &mut self,
        item: ItemId,
        job: &Job,
        holder_states: &HashMap<String, HolderState>,
    ) -> bool {
        let Some(mutex_name) = &job.mutex else {
            return true;
        };
        match self.mutexes.get(mutex_name) {
            None => {
                debug!(
                    "job {} of item {} acquiring mutex {}",
                    job.name, item, mutex_name,
                );
                self.mutexes
                    .insert(mutex_name.clone(), (item, job.name.clone()));
                true
            },
            Some((held_item, held_job)) if *held_item == item && *held_job == job.name => true,
            Some(_) => {
                let terminal = holder_states
                    .get(mutex_name)
                    .map(|s| *s == HolderState::Terminal)
                    .unwrap_or(true);
                if terminal {
                    error!(
                        "held mutex {} being released because the build that holds it is complete",
                        mutex_name,
                    );
                    self.mutexes
                        .insert(mutex_name.clone(), (item, job.name.clone()));
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Release the mutex of a job held by an item.
    ///
    /// Releasing a mutex that is not held, or held by someone else, is an
    /// anomaly: it is logged and otherwise ignored.
    pub(crate) fn release(&mut self, item: ItemId, job: &Job) {
        let Some(mutex_name) = &job.mutex else {
            return;
        };
        match self.mutexes.get(mutex_name) {
            None => {
                error!(
                    "mutex {} can not be released for item {} because it is not held",
                    mutex_name, item,
                );
            },
            Some((held_item, held_job)) if *held_item == item && *held_job == job.name => {
                debug!(
                    "job {} of item {} releasing mutex {}",
                    job.name, item, mutex_name,
                );
                self.mutexes.remove(mutex_name);
            },
            Some(_) => {
                error!(
                    "mutex {} can not be released for item {} which does not hold it",
                    mutex_name, item,
                );
            },
        }
    }

    /// Release every mutex held by `(item, job_name)`.
    ///
    /// Used on cleanup paths where the job definition is no longer
    /// available to name the mutex.
    pub(crate) fn release_holder(&mut self, item: ItemId, job_name: &str) {
        self.mutexes.retain(|name, (held_item, held_job)| {
            let held = *held_item == item && held_job == job_name;
            if held {
                debug!("job {} of item {} releasing mutex {}", job_name, item, name);
            }
            !held
        });
    }

    /// The current holder of a mutex.
    pub fn holder(&self, name: &str) -> Option<&(ItemId, String)> {
        self.mutexes.get(name)
    }

    /// The names of all held mutexes.
    pub fn held(&self) -> Vec<&str> {
        self.mutexes.keys().map(String::as_str).collect()
    }

    /// Whether no mutex is held.
    pub fn is_empty(&self) -> bool {
        self.mutexes.is_empty()
    }
}
