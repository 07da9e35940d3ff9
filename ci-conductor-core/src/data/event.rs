// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// The normalised kind of a trigger event.
///
/// Drivers translate platform-specific webhook payloads into these kinds;
/// the scheduler's trigger processing switches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum TriggerEventKind {
    /// A new patchset of a change was uploaded (opened, pushed to, or
    /// reopened).
    PatchsetCreated,
    /// A comment or review was added to a change.
    CommentAdded,
    /// A change was merged.
    ChangeMerged,
    /// A change was abandoned without merging.
    ChangeAbandoned,
    /// A ref was updated directly.
    RefUpdated,
    /// A commit status was set on a change's head commit.
    CommitStatus,
}

impl fmt::Display for TriggerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TriggerEventKind::PatchsetCreated => "patchset-created",
            TriggerEventKind::CommentAdded => "comment-added",
            TriggerEventKind::ChangeMerged => "change-merged",
            TriggerEventKind::ChangeAbandoned => "change-abandoned",
            TriggerEventKind::RefUpdated => "ref-updated",
            TriggerEventKind::CommitStatus => "commit-status",
        };
        write!(f, "{}", s)
    }
}

/// An external event describing activity on a change or ref.
///
/// Trigger events are produced by webhook listeners and consumed by the
/// scheduler's trigger queue. They serialise so that a paused scheduler can
/// snapshot its pending queue across a restart.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct TriggerEvent {
    /// The normalised kind of the event.
    pub kind: TriggerEventKind,
    /// The platform-level action, e.g. `opened` or `labeled`.
    #[builder(default, setter(into, strip_option))]
    pub action: Option<String>,
    /// The name of the source connection the event arrived on.
    #[builder(setter(into))]
    pub connection: String,
    /// The canonical hostname of the platform the event arrived from.
    #[builder(default, setter(into))]
    pub project_hostname: String,
    /// The name of the project the event concerns.
    #[builder(setter(into))]
    pub project_name: String,
    /// The target branch of the change, when known.
    #[builder(default, setter(into, strip_option))]
    pub branch: Option<String>,
    /// The change number, for pull-request-like changes.
    #[builder(default, setter(strip_option))]
    pub change_number: Option<u64>,
    /// The head sha identifying the content snapshot of the change.
    #[builder(default, setter(into, strip_option))]
    pub patchset: Option<String>,
    /// The refspec which fetches the change.
    #[builder(default, setter(into, strip_option))]
    pub refspec: Option<String>,
    /// The URL of the change.
    #[builder(default, setter(into, strip_option))]
    pub change_url: Option<String>,
    /// The title of the change.
    #[builder(default, setter(into, strip_option))]
    pub title: Option<String>,
    /// The login of the account which caused the event.
    #[builder(default, setter(into, strip_option))]
    pub account: Option<String>,
    /// The comment body, for comment events.
    #[builder(default, setter(into, strip_option))]
    pub comment: Option<String>,
    /// The label added or removed, for label events.
    #[builder(default, setter(into, strip_option))]
    pub label: Option<String>,
    /// The updated ref, for ref-update events.
    #[serde(rename = "ref")]
    #[builder(default, setter(into, strip_option))]
    pub ref_name: Option<String>,
    /// The previous sha of the ref.
    #[builder(default, setter(into, strip_option))]
    pub oldrev: Option<String>,
    /// The new sha of the ref.
    #[builder(default, setter(into, strip_option))]
    pub newrev: Option<String>,
    /// The status context, for commit-status events.
    #[builder(default, setter(into, strip_option))]
    pub status_context: Option<String>,
    /// The status state, for commit-status events.
    #[builder(default, setter(into, strip_option))]
    pub status_state: Option<String>,
    /// When the change was last updated on the platform.
    #[builder(default, setter(strip_option))]
    pub updated_at: Option<DateTime<Utc>>,
    /// A pipeline this event is directly assigned to, bypassing trigger
    /// filters. Used by the operator enqueue operation.
    #[builder(default, setter(into, strip_option))]
    pub forced_pipeline: Option<String>,
}

impl TriggerEvent {
    /// Create a builder for the structure.
    pub fn builder() -> TriggerEventBuilder {
        TriggerEventBuilder::default()
    }

    /// A short identifier of the change the event concerns, for logging.
    pub fn change_key(&self) -> String {
        if let Some(number) = self.change_number {
            format!(
                "{}#{},{}",
                self.project_name,
                number,
                self.patchset.as_deref().unwrap_or(""),
            )
        } else if let Some(ref_name) = &self.ref_name {
            format!("{} {}", self.project_name, ref_name)
        } else {
            self.project_name.clone()
        }
    }
}
