// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use derive_builder::Builder;
use regex::Regex;

use crate::data::{BuildResult, BuildSet};

/// A job definition within a layout.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct Job {
    /// The name of the job.
    #[builder(setter(into))]
    pub name: String,
    /// A named mutex; at most one build of any job bearing this name runs
    /// at a time across all pipelines.
    #[builder(default, setter(into, strip_option))]
    pub mutex: Option<String>,
    /// Whether a failure of this job fails the item.
    #[builder(default = "true")]
    pub voting: bool,
    /// Branch patterns the job applies to; empty applies everywhere.
    #[builder(default)]
    pub branches: Vec<String>,
    /// Node labels the job requests.
    #[builder(default)]
    pub node_labels: Vec<String>,
    /// How many launch attempts are made before giving up with
    /// a retry-limit result.
    #[builder(default = "3")]
    pub attempts: u32,
    /// Names of jobs which must succeed before this job launches.
    #[builder(default)]
    pub dependencies: Vec<String>,
    /// The overall timeout of the job in seconds, inherited by its pre- and
    /// post-phases on the worker.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<u64>,
}

impl Job {
    /// Create a builder for the structure.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Whether the job applies to a change targeting the given branch.
    pub fn matches_branch(&self, branch: Option<&str>) -> bool {
        if self.branches.is_empty() {
            return true;
        }
        let Some(branch) = branch else {
            return false;
        };
        self.branches.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(branch))
                .unwrap_or(false)
        })
    }
}

/// The frozen set of jobs applicable to one queue item.
///
/// The tree is computed from the layout when the item is enqueued and
/// recomputed when it is re-enqueued onto a new layout.
#[derive(Debug, Clone, Default, PartialEq)]
#[non_exhaustive]
pub struct JobTree {
    /// The applicable jobs, in configuration order.
    pub jobs: Vec<Job>,
}

impl JobTree {
    /// Create a job tree from a list of jobs.
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
        }
    }

    /// Whether the tree contains no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Look up a job by name.
    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// The names of all jobs in the tree.
    pub fn names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name.clone()).collect()
    }

    /// The jobs which are ready to launch for the given build set: jobs
    /// with no build yet whose dependencies have all succeeded.
    pub fn ready_jobs<'a>(&'a self, build_set: &BuildSet) -> Vec<&'a Job> {
        self.jobs
            .iter()
            .filter(|job| build_set.get_build(&job.name).is_none())
            .filter(|job| {
                job.dependencies.iter().all(|dep| {
                    build_set
                        .get_build(dep)
                        .and_then(|b| b.result.as_ref())
                        .map(|r| *r == BuildResult::Success)
                        .unwrap_or(false)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{Build, BuildResult, BuildSet, ItemId, Job, JobTree};

    fn tree() -> JobTree {
        let base = Job::builder().name("base").build().unwrap();
        let dependent = Job::builder()
            .name("dependent")
            .dependencies(vec!["base".into()])
            .build()
            .unwrap();
        JobTree::new(vec![base, dependent])
    }

    #[test]
    fn test_job_branch_matching() {
        let job = Job::builder()
            .name("docs")
            .branches(vec!["^master$".into()])
            .build()
            .unwrap();
        assert!(job.matches_branch(Some("master")));
        assert!(!job.matches_branch(Some("feature/x")));
        assert!(!job.matches_branch(None));

        let anywhere = Job::builder().name("lint").build().unwrap();
        assert!(anywhere.matches_branch(None));
    }

    #[test]
    fn test_ready_jobs_respect_dependencies() {
        let tree = tree();
        let mut build_set = BuildSet::new(ItemId::new());
        let ready: Vec<_> = tree
            .ready_jobs(&build_set)
            .into_iter()
            .map(|j| j.name.clone())
            .collect();
        assert_eq!(ready, ["base"]);

        let mut build = Build::new("base", build_set.uuid, Vec::new());
        build.result = Some(BuildResult::Success);
        build_set.add_build(build);
        let ready: Vec<_> = tree
            .ready_jobs(&build_set)
            .into_iter()
            .map(|j| j.name.clone())
            .collect();
        assert_eq!(ready, ["dependent"]);
    }

    #[test]
    fn test_failed_dependency_blocks_job() {
        let tree = tree();
        let mut build_set = BuildSet::new(ItemId::new());
        let mut build = Build::new("base", build_set.uuid, Vec::new());
        build.result = Some(BuildResult::Failure);
        build_set.add_build(build);
        assert!(tree.ready_jobs(&build_set).is_empty());
    }
}
