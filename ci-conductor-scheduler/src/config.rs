// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Duration;
use ci_conductor_core::data::{
    Abide, ApprovalKind, ApprovalRequirement, ChangeFilter, DisciplineKind, EventFilter, Job,
    Layout, LayoutConfig, Pipeline, ProjectConfig, ProjectPipelineConfig, ReportAction,
    ReporterSpec, SharedQueue, Tenant, TriggerEventKind,
};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Errors which may occur when loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read configuration '{}': {}", path.display(), source)]
    Read {
        /// The path to the configuration.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to parse the daemon configuration.
    #[error("failed to parse configuration '{}': {}", path.display(), source)]
    ParseDaemon {
        /// The path to the configuration.
        path: PathBuf,
        /// The source of the failure.
        source: toml::de::Error,
    },
    /// Failed to parse the tenant configuration.
    #[error("failed to parse configuration '{}': {}", path.display(), source)]
    ParseTenants {
        /// The path to the configuration.
        path: PathBuf,
        /// The source of the failure.
        source: serde_yaml::Error,
    },
    /// A filter carries an invalid pattern.
    #[error("invalid pattern '{}': {}", pattern, source)]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The source of the failure.
        source: regex::Error,
    },
    /// A pipeline names an unknown queueing discipline.
    #[error("unknown manager '{}' in pipeline '{}'", manager, pipeline)]
    UnknownManager {
        /// The manager named.
        manager: String,
        /// The pipeline naming it.
        pipeline: String,
    },
    /// A project references a job the layout does not define.
    #[error("project '{}' references undefined job '{}'", project, job)]
    UndefinedJob {
        /// The project with the reference.
        project: String,
        /// The missing job.
        job: String,
    },
    /// A reporter names an action the driver cannot perform.
    #[error("unknown reporter action '{}' in pipeline '{}'", action, pipeline)]
    UnknownReporterAction {
        /// The action named.
        action: String,
        /// The pipeline naming it.
        pipeline: String,
    },
    /// The requested tenant does not exist in the configuration.
    #[error("unknown tenant '{}'", tenant)]
    UnknownTenant {
        /// The tenant requested.
        tenant: String,
    },
}

impl ConfigError {
    fn read(path: PathBuf, source: io::Error) -> Self {
        Self::Read {
            path,
            source,
        }
    }

    fn pattern(pattern: &str, source: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            source,
        }
    }
}

/// One configured source connection.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// The name of the connection.
    pub name: String,
    /// The driver implementing it, e.g. `github`.
    pub driver: String,
    /// The canonical hostname of the platform.
    pub canonical_hostname: String,
    /// The API root, e.g. `https://api.github.com`.
    #[serde(default)]
    pub api_root: Option<String>,
    /// The shared webhook secret.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// The API token.
    #[serde(default)]
    pub api_token: Option<String>,
}

/// The daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct DaemonConfig {
    /// The directory holding persisted state.
    pub state_dir: PathBuf,
    /// The path to the tenant configuration.
    pub tenant_config: PathBuf,
    /// The configured source connections.
    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionConfig>,
}

/// Load the daemon configuration from a TOML file.
pub fn load_daemon_config<P>(path: P) -> Result<DaemonConfig, ConfigError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigError::read(path.into(), err))?;
    toml::from_str(&contents).map_err(|source| {
        ConfigError::ParseDaemon {
            path: path.into(),
            source,
        }
    })
}

// Raw tenant configuration shapes as they appear in YAML. They are compiled
// into core layout types below, validating patterns and references.

#[derive(Debug, Deserialize)]
struct RawTenantsFile {
    tenants: Vec<RawTenant>,
}

#[derive(Debug, Deserialize)]
struct RawTenant {
    name: String,
    #[serde(default)]
    pipelines: Vec<RawPipeline>,
    #[serde(default)]
    projects: Vec<RawProject>,
    #[serde(default)]
    jobs: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    name: String,
    #[serde(default)]
    description: String,
    manager: String,
    source: String,
    #[serde(default)]
    trigger: Vec<RawEventFilter>,
    #[serde(default)]
    require: Option<RawChangeFilter>,
    #[serde(default)]
    start: Vec<RawReporter>,
    #[serde(default)]
    success: Vec<RawReporter>,
    #[serde(default)]
    failure: Vec<RawReporter>,
    #[serde(default, rename = "merge-failure")]
    merge_failure: Vec<RawReporter>,
}

#[derive(Debug, Deserialize)]
struct RawEventFilter {
    #[serde(default)]
    event: Vec<TriggerEventKind>,
    #[serde(default)]
    action: Vec<String>,
    #[serde(default)]
    branch: Vec<String>,
    #[serde(default, rename = "ref")]
    refs: Vec<String>,
    #[serde(default)]
    comment: Vec<String>,
    #[serde(default)]
    label: Vec<String>,
    #[serde(default, rename = "require-approval")]
    require_approval: Vec<RawApproval>,
    #[serde(default, rename = "reject-approval")]
    reject_approval: Vec<RawApproval>,
    #[serde(default, rename = "require-status")]
    require_status: Vec<String>,
    #[serde(default, rename = "reject-status")]
    reject_status: Vec<String>,
    #[serde(default, rename = "require-username")]
    require_username: Vec<String>,
    #[serde(default, rename = "reject-username")]
    reject_username: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawChangeFilter {
    #[serde(default)]
    open: Option<bool>,
    #[serde(default)]
    status: Vec<String>,
    #[serde(default)]
    approval: Vec<RawApproval>,
    #[serde(default, rename = "reject-approval")]
    reject_approval: Vec<RawApproval>,
}

#[derive(Debug, Deserialize)]
struct RawApproval {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    value: Option<i8>,
    #[serde(default, rename = "newer-than-hours")]
    newer_than_hours: Option<i64>,
    #[serde(default, rename = "older-than-hours")]
    older_than_hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawReporter {
    connection: String,
    action: String,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    name: String,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default, rename = "config-path")]
    config_path: Option<String>,
    #[serde(default)]
    pipelines: IndexMap<String, RawProjectPipeline>,
}

#[derive(Debug, Deserialize)]
struct RawProjectPipeline {
    #[serde(default)]
    jobs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    name: String,
    #[serde(default)]
    mutex: Option<String>,
    #[serde(default = "default_voting")]
    voting: bool,
    #[serde(default)]
    branches: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default = "default_attempts")]
    attempts: u32,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

fn default_voting() -> bool {
    true
}

fn default_attempts() -> u32 {
    3
}

fn patterns(raw: &[String]) -> Result<Vec<Regex>, ConfigError> {
    raw.iter()
        .map(|p| Regex::new(p).map_err(|err| ConfigError::pattern(p, err)))
        .collect()
}

fn approval(raw: &RawApproval) -> ApprovalRequirement {
    let mut builder = ApprovalRequirement::builder();
    if let Some(username) = &raw.username {
        builder = builder.username(username.clone());
    }
    if let Some(kind) = &raw.kind {
        let kind = match kind.as_str() {
            "changes_requested" => ApprovalKind::ChangesRequested,
            "comment" => ApprovalKind::Comment,
            _ => ApprovalKind::Approved,
        };
        builder = builder.kind(kind);
    }
    if let Some(value) = raw.value {
        builder = builder.value(value);
    }
    if let Some(hours) = raw.newer_than_hours {
        builder = builder.newer_than(Duration::hours(hours));
    }
    if let Some(hours) = raw.older_than_hours {
        builder = builder.older_than(Duration::hours(hours));
    }
    builder.build().unwrap_or_default()
}

fn event_filter(raw: &RawEventFilter) -> Result<EventFilter, ConfigError> {
    Ok(EventFilter::builder()
        .kinds(raw.event.clone())
        .actions(raw.action.clone())
        .branches(patterns(&raw.branch)?)
        .refs(patterns(&raw.refs)?)
        .comments(patterns(&raw.comment)?)
        .labels(raw.label.clone())
        .require_approvals(raw.require_approval.iter().map(approval).collect())
        .reject_approvals(raw.reject_approval.iter().map(approval).collect())
        .require_statuses(raw.require_status.clone())
        .reject_statuses(raw.reject_status.clone())
        .require_usernames(patterns(&raw.require_username)?)
        .reject_usernames(patterns(&raw.reject_username)?)
        .build()
        .unwrap_or_default())
}

fn change_filter(raw: Option<&RawChangeFilter>) -> ChangeFilter {
    let Some(raw) = raw else {
        return ChangeFilter::default();
    };
    let mut builder = ChangeFilter::builder()
        .require_statuses(raw.status.clone())
        .require_approvals(raw.approval.iter().map(approval).collect())
        .reject_approvals(raw.reject_approval.iter().map(approval).collect());
    if let Some(open) = raw.open {
        builder = builder.open(open);
    }
    builder.build().unwrap_or_default()
}

fn reporters(raw: &[RawReporter], pipeline: &str) -> Result<Vec<ReporterSpec>, ConfigError> {
    raw.iter()
        .map(|r| {
            let action = match r.action.as_str() {
                "comment" => ReportAction::Comment,
                "merge" => ReportAction::Merge,
                "status" => {
                    ReportAction::Status {
                        context: r.context.clone().unwrap_or_else(|| "ci".into()),
                    }
                },
                other => {
                    return Err(ConfigError::UnknownReporterAction {
                        action: other.into(),
                        pipeline: pipeline.into(),
                    });
                },
            };
            Ok(ReporterSpec::new(r.connection.clone(), action))
        })
        .collect()
}

fn compile_tenant(raw: &RawTenant) -> Result<Tenant, ConfigError> {
    let mut jobs = IndexMap::new();
    for raw_job in &raw.jobs {
        let mut builder = Job::builder()
            .name(raw_job.name.clone())
            .voting(raw_job.voting)
            .branches(raw_job.branches.clone())
            .node_labels(raw_job.labels.clone())
            .attempts(raw_job.attempts)
            .dependencies(raw_job.dependencies.clone());
        if let Some(mutex) = &raw_job.mutex {
            builder = builder.mutex(mutex.clone());
        }
        if let Some(timeout) = raw_job.timeout {
            builder = builder.timeout(timeout);
        }
        // All fields are provided above; the builder cannot fail.
        let job = builder.build().expect("job fields are provided");
        jobs.insert(raw_job.name.clone(), job);
    }

    let mut project_configs = IndexMap::new();
    for raw_project in &raw.projects {
        let mut pipelines = IndexMap::new();
        for (pipeline_name, raw_pipeline) in &raw_project.pipelines {
            for job in &raw_pipeline.jobs {
                if !jobs.contains_key(job) {
                    return Err(ConfigError::UndefinedJob {
                        project: raw_project.name.clone(),
                        job: job.clone(),
                    });
                }
            }
            pipelines.insert(
                pipeline_name.clone(),
                ProjectPipelineConfig::new(raw_pipeline.jobs.clone()),
            );
        }
        let mut builder = ProjectConfig::builder()
            .name(raw_project.name.clone())
            .pipelines(pipelines);
        if let Some(queue) = &raw_project.queue {
            builder = builder.queue(queue.clone());
        }
        if let Some(config_path) = &raw_project.config_path {
            builder = builder.config_path(config_path.clone());
        }
        let project_config = builder.build().expect("project fields are provided");
        project_configs.insert(raw_project.name.clone(), project_config);
    }

    let config = LayoutConfig::new(jobs, project_configs);

    let mut pipelines = IndexMap::new();
    for raw_pipeline in &raw.pipelines {
        let discipline = match raw_pipeline.manager.as_str() {
            "independent" => DisciplineKind::Independent,
            "dependent" => DisciplineKind::Dependent,
            other => {
                return Err(ConfigError::UnknownManager {
                    manager: other.into(),
                    pipeline: raw_pipeline.name.clone(),
                });
            },
        };
        let triggers = raw_pipeline
            .trigger
            .iter()
            .map(event_filter)
            .collect::<Result<Vec<_>, _>>()?;
        let pipeline = Pipeline::builder()
            .name(raw_pipeline.name.clone())
            .description(raw_pipeline.description.clone())
            .source(raw_pipeline.source.clone())
            .discipline(discipline)
            .triggers(triggers)
            .requirements(change_filter(raw_pipeline.require.as_ref()))
            .start_reporters(reporters(&raw_pipeline.start, &raw_pipeline.name)?)
            .success_reporters(reporters(&raw_pipeline.success, &raw_pipeline.name)?)
            .failure_reporters(reporters(&raw_pipeline.failure, &raw_pipeline.name)?)
            .merge_failure_reporters(reporters(
                &raw_pipeline.merge_failure,
                &raw_pipeline.name,
            )?)
            .queues(shared_queues(raw_pipeline, discipline, &config))
            .build()
            .expect("pipeline fields are provided");
        pipelines.insert(raw_pipeline.name.clone(), pipeline);
    }

    Ok(Tenant::new(raw.name.clone(), Layout::new(pipelines, config)))
}

/// Precompute the shared queues of a dependent pipeline from project
/// configuration: projects naming the same queue share one, everything else
/// queues alone. Independent pipelines create queues on demand instead.
fn shared_queues(
    raw: &RawPipeline,
    discipline: DisciplineKind,
    config: &LayoutConfig,
) -> Vec<SharedQueue> {
    if discipline != DisciplineKind::Dependent {
        return Vec::new();
    }
    let mut queues: Vec<SharedQueue> = Vec::new();
    for project_config in config.project_configs.values() {
        if !project_config.pipelines.contains_key(&raw.name) {
            continue;
        }
        let queue_name = project_config
            .queue
            .clone()
            .unwrap_or_else(|| project_config.name.clone());
        match queues.iter_mut().find(|q| q.name == queue_name) {
            Some(queue) => queue.add_project(&project_config.name),
            None => {
                queues.push(SharedQueue::new(
                    queue_name,
                    vec![project_config.name.clone()],
                    false,
                ));
            },
        }
    }
    queues
}

/// Load every tenant from the tenant configuration file.
pub fn load_tenant_config<P>(path: P) -> Result<Abide, ConfigError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigError::read(path.into(), err))?;
    let raw: RawTenantsFile = serde_yaml::from_str(&contents).map_err(|source| {
        ConfigError::ParseTenants {
            path: path.into(),
            source,
        }
    })?;
    let mut abide = Abide::default();
    for raw_tenant in &raw.tenants {
        abide.add_tenant(compile_tenant(raw_tenant)?);
    }
    Ok(abide)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ci_conductor_core::data::DisciplineKind;
    use tempfile::TempDir;

    use crate::config::{load_daemon_config, load_tenant_config, ConfigError};

    const TENANTS: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: check
        manager: independent
        source: github
        trigger:
          - event: [comment-added]
            comment: ["test me"]
        require:
          status: ["conductor:check:success"]
        success:
          - connection: github
            action: comment
      - name: gate
        manager: dependent
        source: github
        trigger:
          - event: [comment-added]
        success:
          - connection: github
            action: merge
    projects:
      - name: org/project1
        queue: integrated
        pipelines:
          check: { jobs: [project1-pipeline] }
          gate: { jobs: [project1-pipeline] }
      - name: org/project2
        queue: integrated
        pipelines:
          gate: { jobs: [project2-test] }
      - name: org/lonely
        pipelines:
          gate: { jobs: [project2-test] }
    jobs:
      - name: project1-pipeline
        labels: [small]
      - name: project2-test
        mutex: two-together
        attempts: 2
"#;

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_tenant_config_compiles() {
        let dir = TempDir::with_prefix("config").unwrap();
        let path = write(&dir, "tenants.yaml", TENANTS);
        let abide = load_tenant_config(&path).unwrap();

        let tenant = abide.tenants.get("example").unwrap();
        let check = tenant.layout.pipelines.get("check").unwrap();
        assert_eq!(check.discipline, DisciplineKind::Independent);
        assert_eq!(check.triggers.len(), 1);
        assert!(check.queues.is_empty());

        let gate = tenant.layout.pipelines.get("gate").unwrap();
        assert_eq!(gate.discipline, DisciplineKind::Dependent);
        // project1 and project2 share a queue; lonely queues alone.
        assert_eq!(gate.queues.len(), 2);
        assert_eq!(gate.queues[0].name, "integrated");
        assert!(gate.queues[0].contains_project("org/project1"));
        assert!(gate.queues[0].contains_project("org/project2"));
        assert_eq!(gate.queues[1].projects, ["org/lonely"]);

        let job = tenant.layout.config.jobs.get("project2-test").unwrap();
        assert_eq!(job.mutex.as_deref(), Some("two-together"));
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn test_undefined_job_is_rejected() {
        let dir = TempDir::with_prefix("config").unwrap();
        let bad = TENANTS.replace("jobs: [project1-pipeline]", "jobs: [missing-job]");
        let path = write(&dir, "tenants.yaml", &bad);
        let err = load_tenant_config(&path).unwrap_err();
        if let ConfigError::UndefinedJob {
            job, ..
        } = err
        {
            assert_eq!(job, "missing-job");
        } else {
            panic!("unexpected error: {:?}", err);
        }
    }

    #[test]
    fn test_unknown_manager_is_rejected() {
        let dir = TempDir::with_prefix("config").unwrap();
        let bad = TENANTS.replace("manager: dependent", "manager: serialized");
        let path = write(&dir, "tenants.yaml", &bad);
        let err = load_tenant_config(&path).unwrap_err();
        if let ConfigError::UnknownManager {
            manager, ..
        } = err
        {
            assert_eq!(manager, "serialized");
        } else {
            panic!("unexpected error: {:?}", err);
        }
    }

    #[test]
    fn test_syntax_error_is_rejected() {
        let dir = TempDir::with_prefix("config").unwrap();
        let path = write(&dir, "tenants.yaml", "tenants: [ {name: ");
        let err = load_tenant_config(&path).unwrap_err();
        if let ConfigError::ParseTenants {
            ..
        } = err
        {
        } else {
            panic!("unexpected error: {:?}", err);
        }
    }

    #[test]
    fn test_daemon_config_parses() {
        let dir = TempDir::with_prefix("config").unwrap();
        let path = write(
            &dir,
            "conductor.toml",
            r#"
state_dir = "/var/lib/ci-conductor"
tenant_config = "/etc/ci-conductor/tenants.yaml"

[[connection]]
name = "github"
driver = "github"
canonical_hostname = "github.example.com"
api_root = "https://api.github.example.com"
webhook_secret = "hunter2"
"#,
        );
        let config = load_daemon_config(&path).unwrap();
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].name, "github");
        assert_eq!(
            config.connections[0].webhook_secret.as_deref(),
            Some("hunter2"),
        );
    }
}
