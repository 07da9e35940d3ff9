// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use chrono::{DateTime, Utc};
use ci_conductor_core::data::{BuildResult, Change, ItemId, NodeRequest, RepoState, TriggerEvent};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::scheduler::SchedulerError;

/// The outcome of a remote merge operation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MergeOutcome {
    /// The id of the build set the merge was computed for.
    pub build_set: Uuid,
    /// The id of the queue item the merge was computed for.
    pub item: ItemId,
    /// Whether the merge succeeded.
    pub merged: bool,
    /// The sha of the merged commit, on success.
    pub commit: Option<String>,
    /// The files modified by the merged changes.
    pub files: Vec<String>,
    /// The repository state the merge left behind.
    pub repo_state: RepoState,
}

/// An event that modifies pipeline state due to a result from an external
/// system.
#[derive(Debug)]
#[non_exhaustive]
pub enum ResultEvent {
    /// A build has started on a worker.
    BuildStarted {
        /// The id of the build.
        uuid: Uuid,
        /// When the worker reported the start.
        start_time: DateTime<Utc>,
    },
    /// A build has completed.
    ///
    /// A completed event may arrive without a preceding started event; it
    /// still produces a terminal state.
    BuildCompleted {
        /// The id of the build.
        uuid: Uuid,
        /// The terminal result.
        result: BuildResult,
        /// When the worker reported completion.
        end_time: DateTime<Utc>,
    },
    /// A remote merge operation has completed.
    MergeCompleted(MergeOutcome),
    /// Nodes have been provisioned for a build set.
    NodesProvisioned(NodeRequest),
}

/// A control-plane operation processed within the scheduler loop.
#[derive(Debug)]
#[non_exhaustive]
pub enum ManagementOp {
    /// Reload every tenant from the tenant configuration path.
    Reconfigure,
    /// Rebuild a single tenant in place.
    TenantReconfigure {
        /// The name of the tenant.
        tenant: String,
        /// The merged change whose configuration update triggered the
        /// reconfiguration, for error reporting.
        triggering_change: Option<Change>,
    },
    /// Move the given changes to the head of their shared queue.
    Promote {
        /// The name of the tenant.
        tenant: String,
        /// The name of the pipeline.
        pipeline: String,
        /// Change ids in `number,patchset` form, in the desired order.
        change_ids: Vec<String>,
    },
    /// Enqueue a change directly into the pipeline named by the event's
    /// `forced_pipeline`, bypassing trigger filters and requirements.
    Enqueue {
        /// The name of the tenant.
        tenant: String,
        /// The event describing the change.
        event: TriggerEvent,
    },
}

/// A management event together with its completion signal.
///
/// The sender is fired when the loop finishes processing the operation,
/// propagating any error to the caller waiting on the receiver.
#[derive(Debug)]
pub(crate) struct ManagementEvent {
    pub(crate) op: ManagementOp,
    pub(crate) done: oneshot::Sender<Result<(), SchedulerError>>,
}

impl ManagementEvent {
    pub(crate) fn new(
        op: ManagementOp,
    ) -> (Self, oneshot::Receiver<Result<(), SchedulerError>>) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                op,
                done,
            },
            rx,
        )
    }
}
