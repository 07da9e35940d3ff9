// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::data::{ItemId, NodeSet};

/// The per-project, per-ref shas a speculative merge was computed against.
pub type RepoState = BTreeMap<String, BTreeMap<String, String>>;

/// The terminal result of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildResult {
    /// The build succeeded.
    Success,
    /// The build failed.
    Failure,
    /// The main playbook succeeded but a post-phase failed.
    PostFailure,
    /// The build exceeded its timeout.
    TimedOut,
    /// The item's speculative merge failed; no builds ran.
    MergerFailure,
    /// The build was aborted on the worker.
    Aborted,
    /// The worker became unreachable.
    Unreachable,
    /// The build was cancelled by the scheduler.
    Canceled,
    /// The build was retried until the job's attempt limit was exhausted.
    RetryLimit,
}

impl BuildResult {
    /// Whether the result counts as a success for gating purposes.
    pub fn succeeded(&self) -> bool {
        matches!(self, BuildResult::Success)
    }

    /// Whether a build finishing with this result should be relaunched.
    ///
    /// An unreachable worker, or an abort the scheduler did not request,
    /// says nothing about the change under test. A build the scheduler
    /// cancelled is never retried.
    pub fn retryable(&self, canceled: bool) -> bool {
        match self {
            BuildResult::Unreachable | BuildResult::Aborted => !canceled,
            _ => false,
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Failure => "FAILURE",
            BuildResult::PostFailure => "POST_FAILURE",
            BuildResult::TimedOut => "TIMED_OUT",
            BuildResult::MergerFailure => "MERGER_FAILURE",
            BuildResult::Aborted => "ABORTED",
            BuildResult::Unreachable => "UNREACHABLE",
            BuildResult::Canceled => "CANCELED",
            BuildResult::RetryLimit => "RETRY_LIMIT",
        };
        write!(f, "{}", s)
    }
}

/// The output of a successful speculative merge.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct MergeState {
    /// The sha of the merged commit.
    pub commit: String,
    /// The files modified by the merged changes.
    pub files: Vec<String>,
    /// The repository state the merge was computed against.
    pub repo_state: RepoState,
}

impl MergeState {
    /// Create a merge state.
    pub fn new(commit: String, files: Vec<String>, repo_state: RepoState) -> Self {
        Self {
            commit,
            files,
            repo_state,
        }
    }
}

/// One build of one job.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Build {
    /// The unique id of the build.
    pub uuid: Uuid,
    /// The name of the job the build runs.
    pub job_name: String,
    /// The id of the build set the build belongs to.
    pub build_set: Uuid,
    /// The terminal result, if the build has finished.
    pub result: Option<BuildResult>,
    /// When the build was handed to the executor.
    pub launch_time: DateTime<Utc>,
    /// When the worker reported the build started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the worker reported the build finished.
    pub end_time: Option<DateTime<Utc>>,
    /// The estimated duration in seconds, from the time database.
    pub estimated_time: Option<f64>,
    /// The node labels the build runs on.
    pub node_labels: Vec<String>,
    /// The name of the node the build runs on.
    pub node_name: Option<String>,
    /// The URL of the build's log or status page.
    pub url: Option<String>,
    /// Whether the scheduler has requested cancellation.
    pub canceled: bool,
}

impl Build {
    /// Create a build for a job in a build set.
    pub fn new<N>(job_name: N, build_set: Uuid, node_labels: Vec<String>) -> Self
    where
        N: Into<String>,
    {
        Self {
            uuid: Uuid::new_v4(),
            job_name: job_name.into(),
            build_set,
            result: None,
            launch_time: Utc::now(),
            start_time: None,
            end_time: None,
            estimated_time: None,
            node_labels,
            node_name: None,
            url: None,
            canceled: false,
        }
    }
}

/// The collection of builds for one speculative merge attempt of a queue
/// item.
///
/// Only the latest build set of an item is live; results arriving for
/// prior build sets are logged and otherwise ignored.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct BuildSet {
    /// The unique id of the build set.
    pub uuid: Uuid,
    /// The id of the queue item the build set belongs to.
    pub item: ItemId,
    /// The merge output, once the speculative merge has completed.
    pub merge_state: Option<MergeState>,
    /// Whether a merge has been submitted and not yet completed.
    pub merge_pending: bool,
    /// Whether the speculative merge failed.
    pub unable_to_merge: bool,
    /// Whether node requests have been issued for the item's jobs.
    pub nodes_requested: bool,
    builds: IndexMap<String, Build>,
    node_requests: IndexMap<String, Uuid>,
    node_sets: IndexMap<String, NodeSet>,
    retries: HashMap<String, u32>,
}

impl BuildSet {
    /// Create an empty build set for an item.
    pub fn new(item: ItemId) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            item,
            merge_state: None,
            merge_pending: false,
            unable_to_merge: false,
            nodes_requested: false,
            builds: IndexMap::new(),
            node_requests: IndexMap::new(),
            node_sets: IndexMap::new(),
            retries: HashMap::new(),
        }
    }

    /// Record a build for its job.
    pub fn add_build(&mut self, build: Build) {
        self.builds.insert(build.job_name.clone(), build);
    }

    /// The build for a job, if one has been launched.
    pub fn get_build(&self, job_name: &str) -> Option<&Build> {
        self.builds.get(job_name)
    }

    /// The build for a job, mutably.
    pub fn get_build_mut(&mut self, job_name: &str) -> Option<&mut Build> {
        self.builds.get_mut(job_name)
    }

    /// Remove the build for a job, e.g. ahead of a retry.
    pub fn remove_build(&mut self, job_name: &str) -> Option<Build> {
        self.builds.shift_remove(job_name)
    }

    /// The build with the given id, if it belongs to this set.
    pub fn build_by_uuid(&self, uuid: Uuid) -> Option<&Build> {
        self.builds.values().find(|b| b.uuid == uuid)
    }

    /// All builds, in launch order.
    pub fn builds(&self) -> impl Iterator<Item = &Build> {
        self.builds.values()
    }

    /// All builds, mutably.
    pub fn builds_mut(&mut self) -> impl Iterator<Item = &mut Build> {
        self.builds.values_mut()
    }

    /// Record the node request issued for a job.
    pub fn note_node_request(&mut self, job_name: &str, request: Uuid) {
        self.node_requests.insert(job_name.into(), request);
    }

    /// The node request issued for a job.
    pub fn node_request_for(&self, job_name: &str) -> Option<Uuid> {
        self.node_requests.get(job_name).copied()
    }

    /// Store the node set provisioned for a job.
    pub fn assign_nodes(&mut self, job_name: &str, nodes: NodeSet) {
        self.node_sets.insert(job_name.into(), nodes);
    }

    /// Whether nodes have been provisioned (and not yet consumed) for a job.
    pub fn has_nodes(&self, job_name: &str) -> bool {
        self.node_sets.contains_key(job_name)
    }

    /// The node set provisioned for a job, if still held.
    pub fn node_set(&self, job_name: &str) -> Option<&NodeSet> {
        self.node_sets.get(job_name)
    }

    /// Take ownership of the node set provisioned for a job.
    ///
    /// A node set can be taken at most once; the caller is responsible for
    /// returning it to the provisioner.
    pub fn take_node_set(&mut self, job_name: &str) -> Option<NodeSet> {
        self.node_sets.shift_remove(job_name)
    }

    /// Take ownership of every node set still held by the build set.
    pub fn drain_node_sets(&mut self) -> Vec<NodeSet> {
        self.node_sets.drain(..).map(|(_, nodes)| nodes).collect()
    }

    /// How many times a job has been relaunched in this build set.
    pub fn retries_for(&self, job_name: &str) -> u32 {
        self.retries.get(job_name).copied().unwrap_or(0)
    }

    /// Record one more relaunch of a job.
    pub fn increment_retries(&mut self, job_name: &str) {
        *self.retries.entry(job_name.into()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{Build, BuildResult, BuildSet, ItemId, Node, NodeSet};

    #[test]
    fn test_result_retryable() {
        assert!(BuildResult::Unreachable.retryable(false));
        assert!(!BuildResult::Unreachable.retryable(true));
        assert!(BuildResult::Aborted.retryable(false));
        assert!(!BuildResult::Aborted.retryable(true));
        assert!(!BuildResult::Failure.retryable(false));
    }

    #[test]
    fn test_node_set_taken_once() {
        let mut build_set = BuildSet::new(ItemId::new());
        let nodes = NodeSet::new(vec![Node::new("node-1", "small")]);
        build_set.assign_nodes("lint", nodes);
        assert!(build_set.has_nodes("lint"));
        assert!(build_set.take_node_set("lint").is_some());
        assert!(build_set.take_node_set("lint").is_none());
        assert!(build_set.drain_node_sets().is_empty());
    }

    #[test]
    fn test_build_lookup_by_uuid() {
        let mut build_set = BuildSet::new(ItemId::new());
        let build = Build::new("lint", build_set.uuid, Vec::new());
        let uuid = build.uuid;
        build_set.add_build(build);
        assert_eq!(build_set.build_by_uuid(uuid).unwrap().job_name, "lint");
        assert!(build_set
            .build_by_uuid(uuid::Uuid::new_v4())
            .is_none());
    }

    #[test]
    fn test_retry_counting() {
        let mut build_set = BuildSet::new(ItemId::new());
        assert_eq!(build_set.retries_for("lint"), 0);
        build_set.increment_retries("lint");
        build_set.increment_retries("lint");
        assert_eq!(build_set.retries_for("lint"), 2);
    }
}
