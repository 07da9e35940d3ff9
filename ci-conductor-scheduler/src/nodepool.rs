// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ci_conductor_core::data::{Node, NodeRequest, NodeSet};
use thiserror::Error;
use tracing::debug;

use crate::scheduler::SchedulerHandle;

/// An error that may occur when talking to the node provisioner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NodeError {
    /// The provisioner could not be reached.
    #[error("cannot contact the node provisioner: {}", details)]
    Connection {
        /// Details of the error.
        details: String,
    },
}

/// The client side of the node provisioner.
///
/// Requests are fulfilled asynchronously; fulfilled requests flow back into
/// the scheduler as nodes-provisioned result events. Node sets are owned by
/// the build set they were provisioned for and must be returned exactly
/// once.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Submit a request for the nodes of one job.
    async fn request_nodes(&self, request: NodeRequest) -> Result<(), NodeError>;

    /// Accept a fulfilled request, completing the provisioner-side
    /// bookkeeping.
    fn accept_nodes(&self, request: &mut NodeRequest);

    /// Return a node set after its build completed or its build set was
    /// discarded.
    async fn return_node_set(&self, nodes: NodeSet) -> Result<(), NodeError>;
}

/// An in-process provisioner that fulfils every request immediately with
/// synthetic nodes.
///
/// Counts allocations and returns so tests can assert that every node set
/// is returned exactly once.
#[derive(Debug)]
pub struct StaticNodeProvisioner {
    handle: SchedulerHandle,
    names: AtomicU64,
    allocated: AtomicU64,
    returned: AtomicU64,
}

impl StaticNodeProvisioner {
    /// Create a provisioner reporting to the given scheduler.
    pub fn new(handle: SchedulerHandle) -> Self {
        Self {
            handle,
            names: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }

    /// How many node sets have been handed out.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    /// How many node sets have been returned.
    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeProvisioner for StaticNodeProvisioner {
    async fn request_nodes(&self, mut request: NodeRequest) -> Result<(), NodeError> {
        let nodes = request
            .labels
            .iter()
            .map(|label| {
                let n = self.names.fetch_add(1, Ordering::SeqCst) + 1;
                Node::new(format!("node-{}", n), label.clone())
            })
            .collect();
        request.nodes = NodeSet::new(nodes);
        request.fulfilled = true;
        self.allocated.fetch_add(1, Ordering::SeqCst);
        self.handle.on_nodes_provisioned(request);
        Ok(())
    }

    fn accept_nodes(&self, request: &mut NodeRequest) {
        debug!(
            "accepted nodes for job {} of build set {}",
            request.job_name, request.build_set,
        );
    }

    async fn return_node_set(&self, nodes: NodeSet) -> Result<(), NodeError> {
        debug!("returned node set with {} nodes", nodes.nodes.len());
        self.returned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
