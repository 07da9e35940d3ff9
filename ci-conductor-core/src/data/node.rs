// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use uuid::Uuid;

use crate::data::ItemId;

/// A provisioned worker node.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Node {
    /// The name of the node.
    pub name: String,
    /// The label the node was provisioned for.
    pub label: String,
}

impl Node {
    /// Create a node.
    pub fn new<N, L>(name: N, label: L) -> Self
    where
        N: Into<String>,
        L: Into<String>,
    {
        Self {
            name: name.into(),
            label: label.into(),
        }
    }
}

/// A set of nodes allocated for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct NodeSet {
    /// The nodes in the set.
    pub nodes: Vec<Node>,
}

impl NodeSet {
    /// Create a node set.
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
        }
    }

    /// The labels of the nodes in the set.
    pub fn labels(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.label.clone()).collect()
    }
}

/// An outstanding request for nodes for one job of one build set.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct NodeRequest {
    /// The unique id of the request.
    pub uuid: Uuid,
    /// The id of the build set the request belongs to.
    pub build_set: Uuid,
    /// The id of the queue item the request belongs to.
    pub item: ItemId,
    /// The name of the job the nodes are for.
    pub job_name: String,
    /// The labels requested.
    pub labels: Vec<String>,
    /// The provisioned nodes, once fulfilled.
    pub nodes: NodeSet,
    /// Whether the request has been fulfilled.
    pub fulfilled: bool,
}

impl NodeRequest {
    /// Create a request for a job's labels.
    pub fn new<J>(build_set: Uuid, item: ItemId, job_name: J, labels: Vec<String>) -> Self
    where
        J: Into<String>,
    {
        Self {
            uuid: Uuid::new_v4(),
            build_set,
            item,
            job_name: job_name.into(),
            labels,
            nodes: NodeSet::default(),
            fulfilled: false,
        }
    }
}
