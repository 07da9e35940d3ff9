// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ci_conductor_core::data::{ItemId, RepoState};
use thiserror::Error;
use uuid::Uuid;

use crate::events::MergeOutcome;
use crate::scheduler::SchedulerHandle;

/// An error that may occur when submitting merge work.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MergerError {
    /// The merger could not be reached.
    #[error("cannot contact the merger: {}", details)]
    Connection {
        /// Details of the error.
        details: String,
    },
}

/// One change to apply in a speculative merge, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct MergeSpec {
    /// The connection the project is reached through.
    pub connection: String,
    /// The name of the project.
    pub project: String,
    /// The target branch.
    pub branch: String,
    /// The refspec which fetches the change.
    pub refspec: String,
}

/// The client side of the merger.
///
/// Merge work is submitted asynchronously; completions flow back into the
/// scheduler as merge-completed result events.
#[async_trait]
pub trait MergerClient: Send + Sync {
    /// Submit a speculative merge: the refspecs of every ancestor of an
    /// item up to and including itself, applied onto the captured
    /// repository state.
    async fn merge_changes(
        &self,
        build_set: Uuid,
        item: ItemId,
        specs: Vec<MergeSpec>,
        repo_state: RepoState,
    ) -> Result<(), MergerError>;

    /// Whether submitted merges have not yet completed.
    fn merges_outstanding(&self) -> bool;
}

/// An in-process merger that completes every merge immediately.
///
/// Used by tests and the demo daemon wiring; the git mechanics of a real
/// merger are out of scope for the engine. Projects can be marked as
/// conflicting to exercise merge-failure handling.
#[derive(Debug)]
pub struct InstantMerger {
    handle: SchedulerHandle,
    commits: AtomicU64,
    failing: Mutex<HashSet<String>>,
}

impl InstantMerger {
    /// Create a merger reporting completions to the given scheduler.
    pub fn new(handle: SchedulerHandle) -> Self {
        Self {
            handle,
            commits: AtomicU64::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make merges touching the given project fail.
    pub fn fail_project(&self, project: &str) {
        self.failing
            .lock()
            .expect("merger lock poisoned")
            .insert(project.into());
    }

    /// Let merges touching the given project succeed again.
    pub fn unfail_project(&self, project: &str) {
        self.failing
            .lock()
            .expect("merger lock poisoned")
            .remove(project);
    }

    fn next_commit(&self) -> String {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{:040x}", n)
    }
}

#[async_trait]
impl MergerClient for InstantMerger {
    async fn merge_changes(
        &self,
        build_set: Uuid,
        item: ItemId,
        specs: Vec<MergeSpec>,
        mut repo_state: RepoState,
    ) -> Result<(), MergerError> {
        let failing = self.failing.lock().expect("merger lock poisoned");
        let merged = !specs.iter().any(|s| failing.contains(&s.project));
        drop(failing);

        let commit = if merged {
            let commit = self.next_commit();
            for spec in &specs {
                repo_state
                    .entry(spec.project.clone())
                    .or_default()
                    .insert(spec.branch.clone(), commit.clone());
            }
            Some(commit)
        } else {
            None
        };
        self.handle.on_merge_completed(MergeOutcome {
            build_set,
            item,
            merged,
            commit,
            files: Vec::new(),
            repo_state,
        });
        Ok(())
    }

    fn merges_outstanding(&self) -> bool {
        false
    }
}
