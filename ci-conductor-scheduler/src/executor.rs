// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use async_trait::async_trait;
use ci_conductor_core::data::{BuildResult, ItemId, Job, NodeSet};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::SchedulerHandle;

/// An error that may occur when talking to the executor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The executor could not be reached.
    #[error("cannot contact the executor: {}", details)]
    Connection {
        /// Details of the error.
        details: String,
    },
}

/// Everything a worker needs to run one build.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BuildRequest {
    /// The id of the build.
    pub uuid: Uuid,
    /// The id of the build set the build belongs to.
    pub build_set: Uuid,
    /// The id of the queue item the build belongs to.
    pub item: ItemId,
    /// The job to run.
    pub job: Job,
    /// The name of the project under test.
    pub project: String,
    /// The change number under test, for pull-request-like changes.
    pub change_number: Option<u64>,
    /// The head sha under test.
    pub patchset: Option<String>,
    /// The speculatively merged commit to check out.
    pub merge_commit: Option<String>,
    /// The nodes the build runs on.
    pub nodes: NodeSet,
}

/// The client side of the remote job executor.
///
/// Work is submitted asynchronously; start and completion flow back into
/// the scheduler as result events carrying the build id.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Hand a build to a worker.
    async fn execute(&self, request: BuildRequest) -> Result<(), ExecutorError>;

    /// Ask the worker to stop a build.
    ///
    /// This is best-effort: the authoritative terminal state is the
    /// build-completed event that follows. Returns whether the worker
    /// acknowledged the stop.
    async fn cancel(&self, uuid: Uuid) -> Result<bool, ExecutorError>;
}

/// An in-process executor that reports success for every build.
///
/// Used by the demo daemon wiring; the playbook runner itself is an opaque
/// remote worker out of scope for the engine.
#[derive(Debug)]
pub struct InProcessExecutor {
    handle: SchedulerHandle,
}

impl InProcessExecutor {
    /// Create an executor reporting to the given scheduler.
    pub fn new(handle: SchedulerHandle) -> Self {
        Self {
            handle,
        }
    }
}

#[async_trait]
impl ExecutorClient for InProcessExecutor {
    async fn execute(&self, request: BuildRequest) -> Result<(), ExecutorError> {
        self.handle.on_build_started(request.uuid);
        self.handle
            .on_build_completed(request.uuid, BuildResult::Success);
        Ok(())
    }

    async fn cancel(&self, _uuid: Uuid) -> Result<bool, ExecutorError> {
        Ok(false)
    }
}
