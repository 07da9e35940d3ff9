// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use derive_builder::Builder;
use indexmap::IndexMap;

use crate::data::{Change, Job, JobTree, Pipeline};

/// The default in-repo configuration file of a project.
pub const DEFAULT_CONFIG_PATH: &str = ".conductor.yaml";

/// The jobs a project runs in one pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
#[non_exhaustive]
pub struct ProjectPipelineConfig {
    /// The names of the jobs, in configuration order.
    pub jobs: Vec<String>,
}

impl ProjectPipelineConfig {
    /// Create a project pipeline configuration.
    pub fn new(jobs: Vec<String>) -> Self {
        Self {
            jobs,
        }
    }
}

/// The per-project configuration within a layout.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct ProjectConfig {
    /// The name of the project.
    #[builder(setter(into))]
    pub name: String,
    /// The shared queue the project participates in, for dependent
    /// pipelines. Projects without a queue get one of their own.
    #[builder(default, setter(into, strip_option))]
    pub queue: Option<String>,
    /// The jobs per pipeline.
    #[builder(default)]
    pub pipelines: IndexMap<String, ProjectPipelineConfig>,
    /// The in-repo configuration file whose modification triggers a tenant
    /// reconfiguration.
    #[builder(default = "DEFAULT_CONFIG_PATH.into()", setter(into))]
    pub config_path: String,
}

impl ProjectConfig {
    /// Create a builder for the structure.
    pub fn builder() -> ProjectConfigBuilder {
        ProjectConfigBuilder::default()
    }
}

/// The non-pipeline half of a layout: job definitions and project
/// configuration.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct LayoutConfig {
    /// Job definitions by name.
    pub jobs: IndexMap<String, Job>,
    /// Project configuration by project name.
    pub project_configs: IndexMap<String, ProjectConfig>,
}

impl LayoutConfig {
    /// Create a layout configuration.
    pub fn new(
        jobs: IndexMap<String, Job>,
        project_configs: IndexMap<String, ProjectConfig>,
    ) -> Self {
        Self {
            jobs,
            project_configs,
        }
    }

    /// Compute the frozen job tree for a change in a pipeline.
    pub fn job_tree_for(&self, pipeline: &str, change: &Change) -> JobTree {
        let project = &change.project().name;
        let Some(project_config) = self.project_configs.get(project) else {
            return JobTree::default();
        };
        let Some(pipeline_config) = project_config.pipelines.get(pipeline) else {
            return JobTree::default();
        };
        let jobs = pipeline_config
            .jobs
            .iter()
            .filter_map(|name| self.jobs.get(name))
            .filter(|job| job.matches_branch(change.branch()))
            .cloned()
            .collect();
        JobTree::new(jobs)
    }

    /// Whether a merged change modifies its project's in-repo pipeline
    /// configuration.
    pub fn change_updates_config(&self, change: &Change) -> bool {
        let Some(pr) = change.as_pull_request() else {
            return false;
        };
        let config_path = self
            .project_configs
            .get(&pr.project.name)
            .map(|pc| pc.config_path.as_str())
            .unwrap_or(DEFAULT_CONFIG_PATH);
        pr.files.iter().any(|f| f == config_path)
    }
}

/// A tenant's compiled pipeline and job definitions.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Layout {
    /// The pipelines of the layout, in configuration order.
    pub pipelines: IndexMap<String, Pipeline>,
    /// The job definitions and project configuration.
    pub config: LayoutConfig,
}

impl Layout {
    /// Create a layout.
    pub fn new(pipelines: IndexMap<String, Pipeline>, config: LayoutConfig) -> Self {
        Self {
            pipelines,
            config,
        }
    }

    /// Borrow the pipelines mutably alongside the immutable configuration.
    ///
    /// Pipeline managers mutate queue state while consulting job and
    /// project definitions; the split keeps both borrows alive at once.
    pub fn split_mut(&mut self) -> (&mut IndexMap<String, Pipeline>, &LayoutConfig) {
        (&mut self.pipelines, &self.config)
    }
}

/// An isolation scope containing its own layout, sources, and projects.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Tenant {
    /// The name of the tenant.
    pub name: String,
    /// The tenant's compiled layout.
    pub layout: Layout,
}

impl Tenant {
    /// Create a tenant with a layout.
    pub fn new<N>(name: N, layout: Layout) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            layout,
        }
    }
}

/// The root container of all configured tenants.
///
/// The abide is replaced wholesale on reconfiguration.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Abide {
    /// The tenants by name, in configuration order.
    pub tenants: IndexMap<String, Tenant>,
}

impl Abide {
    /// Add a tenant, replacing any existing tenant of the same name.
    pub fn add_tenant(&mut self, tenant: Tenant) {
        self.tenants.insert(tenant.name.clone(), tenant);
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use crate::data::{Change, Job, LayoutConfig, ProjectConfig, ProjectPipelineConfig};
    use crate::test;

    fn config() -> LayoutConfig {
        let mut jobs = IndexMap::new();
        jobs.insert(
            "lint".to_string(),
            Job::builder().name("lint").build().unwrap(),
        );
        jobs.insert(
            "docs".to_string(),
            Job::builder()
                .name("docs")
                .branches(vec!["^master$".into()])
                .build()
                .unwrap(),
        );
        let mut pipelines = IndexMap::new();
        pipelines.insert(
            "check".to_string(),
            ProjectPipelineConfig::new(vec!["lint".into(), "docs".into()]),
        );
        let mut project_configs = IndexMap::new();
        project_configs.insert(
            "org/project".to_string(),
            ProjectConfig::builder()
                .name("org/project")
                .pipelines(pipelines)
                .build()
                .unwrap(),
        );
        LayoutConfig {
            jobs,
            project_configs,
        }
    }

    #[test]
    fn test_job_tree_filters_branches() {
        let config = config();
        let master = test::pull_request("org/project", 1, "aaaa");
        let tree = config.job_tree_for("check", &master);
        assert_eq!(tree.names(), ["lint", "docs"]);

        let mut feature = test::pull_request("org/project", 2, "bbbb");
        if let Change::PullRequest(pr) = &mut feature {
            pr.branch = "feature/x".into();
        }
        let tree = config.job_tree_for("check", &feature);
        assert_eq!(tree.names(), ["lint"]);
    }

    #[test]
    fn test_job_tree_unknown_project_is_empty() {
        let config = config();
        let change = test::pull_request("org/unknown", 1, "aaaa");
        assert!(config.job_tree_for("check", &change).is_empty());
    }

    #[test]
    fn test_change_updates_config() {
        let config = config();
        let mut change = test::pull_request("org/project", 1, "aaaa");
        assert!(!config.change_updates_config(&change));
        if let Change::PullRequest(pr) = &mut change {
            pr.files.push(".conductor.yaml".into());
        }
        assert!(config.change_updates_config(&change));
    }
}
