// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use chrono::{DateTime, Utc};
use derive_builder::Builder;

use crate::data::{Approval, CommitStatus, Project, TriggerEvent};

/// A pull-request-like change under review.
///
/// The `patchset` sha uniquely identifies a content snapshot of the change;
/// re-emissions with the same sha refer to the same snapshot.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct PullRequest {
    /// The project the change belongs to.
    pub project: Project,
    /// The change number on the platform.
    pub number: u64,
    /// The head sha identifying the content snapshot.
    #[builder(setter(into))]
    pub patchset: String,
    /// The target branch.
    #[builder(setter(into))]
    pub branch: String,
    /// The refspec which fetches the change.
    #[builder(setter(into))]
    pub refspec: String,
    /// The URL of the change.
    #[builder(default, setter(into))]
    pub url: String,
    /// The title of the change.
    #[builder(default, setter(into))]
    pub title: String,
    /// The message body of the change, scanned for `Depends-On` references.
    #[builder(default, setter(into))]
    pub message: String,
    /// When the change was last updated on the platform.
    pub updated_at: DateTime<Utc>,
    /// The files the change modifies.
    #[builder(default)]
    pub files: Vec<String>,
    /// The effective commit statuses on the head sha, deduplicated by
    /// `(user, context)` keeping the newest.
    #[builder(default)]
    pub statuses: Vec<CommitStatus>,
    /// The latest review per user.
    #[builder(default)]
    pub approvals: Vec<Approval>,
    /// Whether the change is open.
    #[builder(default = "true")]
    pub open: bool,
    /// Whether the change has been merged.
    #[builder(default)]
    pub merged: bool,
    /// The trigger event the change was fetched for, if any.
    #[builder(default, setter(strip_option))]
    pub source_event: Option<TriggerEvent>,
}

impl PullRequest {
    /// Create a builder for the structure.
    pub fn builder() -> PullRequestBuilder {
        PullRequestBuilder::default()
    }

    /// The `number,patchset` identifier of this snapshot.
    pub fn id(&self) -> String {
        format!("{},{}", self.number, self.patchset)
    }

    /// The normalised `user:context:state` tuples of the statuses.
    pub fn status_tuples(&self) -> Vec<String> {
        self.statuses.iter().map(CommitStatus::tuple).collect()
    }
}

/// A direct ref update, e.g. a push to a branch or tag.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct RefUpdate {
    /// The project the ref belongs to.
    pub project: Project,
    /// The updated ref, e.g. `refs/heads/master`.
    #[builder(setter(into))]
    pub ref_name: String,
    /// The previous sha of the ref.
    #[builder(setter(into))]
    pub oldrev: String,
    /// The new sha of the ref.
    #[builder(setter(into))]
    pub newrev: String,
    /// The URL of the updated ref.
    #[builder(default, setter(into))]
    pub url: String,
}

impl RefUpdate {
    /// Create a builder for the structure.
    pub fn builder() -> RefUpdateBuilder {
        RefUpdateBuilder::default()
    }
}

/// A unit of proposed code modification tracked in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A pull-request-like snapshot.
    PullRequest(PullRequest),
    /// A direct ref update.
    Ref(RefUpdate),
}

impl Change {
    /// The project the change belongs to.
    pub fn project(&self) -> &Project {
        match self {
            Change::PullRequest(pr) => &pr.project,
            Change::Ref(r) => &r.project,
        }
    }

    /// Rebind the change to another project object.
    ///
    /// Used during reconfiguration when queue items are moved onto a new
    /// pipeline whose source may produce fresh project objects.
    pub fn set_project(&mut self, project: Project) {
        match self {
            Change::PullRequest(pr) => pr.project = project,
            Change::Ref(r) => r.project = project,
        }
    }

    /// The pull request payload, if this is a pull-request-like change.
    pub fn as_pull_request(&self) -> Option<&PullRequest> {
        match self {
            Change::PullRequest(pr) => Some(pr),
            Change::Ref(_) => None,
        }
    }

    /// The target branch of the change, when it has one.
    pub fn branch(&self) -> Option<&str> {
        match self {
            Change::PullRequest(pr) => Some(&pr.branch),
            Change::Ref(_) => None,
        }
    }

    /// The URL of the change.
    pub fn url(&self) -> &str {
        match self {
            Change::PullRequest(pr) => &pr.url,
            Change::Ref(r) => &r.url,
        }
    }

    /// An identifier for the exact snapshot the change refers to.
    pub fn id(&self) -> String {
        match self {
            Change::PullRequest(pr) => pr.id(),
            Change::Ref(r) => format!("{} {}", r.ref_name, r.newrev),
        }
    }

    /// Whether both changes refer to the same snapshot of the same logical
    /// change.
    pub fn same_snapshot(&self, other: &Change) -> bool {
        match (self, other) {
            (Change::PullRequest(a), Change::PullRequest(b)) => {
                a.project == b.project && a.number == b.number && a.patchset == b.patchset
            },
            (Change::Ref(a), Change::Ref(b)) => {
                a.project == b.project && a.ref_name == b.ref_name && a.newrev == b.newrev
            },
            _ => false,
        }
    }

    /// Whether both changes refer to the same logical change, in any
    /// snapshot.
    pub fn same_change(&self, other: &Change) -> bool {
        match (self, other) {
            (Change::PullRequest(a), Change::PullRequest(b)) => {
                a.project == b.project && a.number == b.number
            },
            (Change::Ref(a), Change::Ref(b)) => {
                a.project == b.project && a.ref_name == b.ref_name
            },
            _ => false,
        }
    }

    /// Whether `self` is an older snapshot of the same logical change as
    /// `other`.
    pub fn is_older_version_of(&self, other: &Change) -> bool {
        match (self, other) {
            (Change::PullRequest(a), Change::PullRequest(b)) => {
                a.project == b.project && a.number == b.number && a.patchset != b.patchset
            },
            _ => false,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Change::PullRequest(pr) => {
                write!(f, "{}#{},{}", pr.project.name, pr.number, pr.patchset)
            },
            Change::Ref(r) => write!(f, "{} {}", r.project.name, r.ref_name),
        }
    }
}
