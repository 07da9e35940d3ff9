// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use async_trait::async_trait;
use ci_conductor_core::data::{Change, Project, TriggerEvent};
use thiserror::Error;

/// An error that may occur when talking to a code-review platform.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The change an event refers to is not known to this connection.
    ///
    /// This is expected when an event belongs to a foreign connection and
    /// is skipped rather than reported.
    #[error("change not found: {}", change)]
    NotFound {
        /// A description of the change looked for.
        change: String,
    },
    /// Authentication to the platform failed.
    #[error("cannot authenticate to the source: {}", details)]
    Auth {
        /// Details of the error.
        details: String,
    },
    /// The connection to the platform failed.
    #[error("cannot contact the source: {}", details)]
    Connection {
        /// Details of the error.
        details: String,
    },
    /// The connection does not support the requested operation.
    #[error("operation is not supported: {}", operation)]
    Unsupported {
        /// The unsupported operation.
        operation: String,
    },
    /// An uncategorized error.
    #[error("{}", details)]
    Other {
        /// Details of the error.
        details: String,
    },
}

impl SourceError {
    /// Whether the error means the change is simply unknown here.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }
}

/// The phase a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPhase {
    /// An item entered a pipeline.
    Start,
    /// An item finished with every voting job successful.
    Success,
    /// An item finished with a failing voting job.
    Failure,
    /// An item's speculative merge failed.
    MergeFailure,
    /// A configuration change could not be loaded.
    SyntaxError,
}

impl fmt::Display for ReportPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ReportPhase::Start => "start",
            ReportPhase::Success => "success",
            ReportPhase::Failure => "failure",
            ReportPhase::MergeFailure => "merge-failure",
            ReportPhase::SyntaxError => "syntax-error",
        };
        write!(f, "{}", s)
    }
}

/// A connection to a code-review platform.
///
/// All scheduler-side access to a platform goes through this trait: fetching
/// the change an event describes, resolving cross-project dependencies, and
/// reporting outcomes back.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// The configured name of the connection.
    fn name(&self) -> &str;

    /// The canonical hostname of the platform.
    fn canonical_hostname(&self) -> &str;

    /// Fetch the change an event describes.
    async fn get_change(&self, event: &TriggerEvent) -> Result<Change, SourceError>;

    /// Obtain the project with the given name.
    async fn get_project(&self, name: &str) -> Result<Project, SourceError>;

    /// The branches of a project.
    async fn get_project_branches(&self, project: &Project) -> Result<Vec<String>, SourceError>;

    /// The changes the given change declares a dependency on.
    async fn get_needed_changes(&self, change: &Change) -> Result<Vec<Change>, SourceError>;

    /// The open changes which declare a dependency on the given change.
    ///
    /// Dependent pipelines use this to pull gated changes in behind the
    /// change they need.
    async fn get_changes_depending_on(&self, change: &Change)
        -> Result<Vec<Change>, SourceError>;

    /// Whether the platform would accept a merge of the change.
    async fn can_merge(&self, change: &Change) -> Result<bool, SourceError>;

    /// Leave a report on the change.
    async fn report(
        &self,
        change: &Change,
        phase: ReportPhase,
        message: &str,
    ) -> Result<(), SourceError>;

    /// Set a commit status on the change's head commit.
    async fn set_commit_status(
        &self,
        change: &Change,
        context: &str,
        state: &str,
        description: &str,
    ) -> Result<(), SourceError>;

    /// Merge the change on the platform.
    async fn merge_change(&self, change: &Change) -> Result<(), SourceError>;

    /// Drop cached changes which are no longer relevant.
    ///
    /// `relevant` holds the snapshot ids of every change still enqueued
    /// anywhere.
    async fn maintain_cache(&self, relevant: &[String]);
}
