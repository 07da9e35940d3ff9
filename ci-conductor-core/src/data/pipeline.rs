// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use chrono::{DateTime, Utc};
use derive_builder::Builder;

use crate::data::{Change, ChangeFilter, EventFilter, ItemId, QueueItem, SharedQueue, TriggerEvent};

/// The queueing discipline of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisciplineKind {
    /// Changes are tested independently of each other.
    Independent,
    /// Changes sharing a queue are tested in sequence on top of each
    /// other's speculative merge, and a failure resets everything behind
    /// it.
    Dependent,
}

/// What a reporter does with a pipeline outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportAction {
    /// Leave a comment on the change.
    Comment,
    /// Set a commit status on the change's head.
    Status {
        /// The status context to set.
        context: String,
    },
    /// Merge the change.
    Merge,
}

/// One configured reporter action of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReporterSpec {
    /// The connection the report is sent through.
    pub connection: String,
    /// The action to perform.
    pub action: ReportAction,
}

impl ReporterSpec {
    /// Create a reporter specification.
    pub fn new<C>(connection: C, action: ReportAction) -> Self
    where
        C: Into<String>,
    {
        Self {
            connection: connection.into(),
            action,
        }
    }
}

/// A configured processing discipline producing reports for changes.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct Pipeline {
    /// The name of the pipeline.
    #[builder(setter(into))]
    pub name: String,
    /// A human-oriented description.
    #[builder(default, setter(into))]
    pub description: String,
    /// The name of the source connection the pipeline listens on.
    #[builder(setter(into))]
    pub source: String,
    /// The queueing discipline.
    pub discipline: DisciplineKind,
    /// Trigger filters, in configuration order.
    #[builder(default)]
    pub triggers: Vec<EventFilter>,
    /// Requirements every enqueued change must satisfy.
    #[builder(default)]
    pub requirements: ChangeFilter,
    /// Reporters run when an item starts.
    #[builder(default)]
    pub start_reporters: Vec<ReporterSpec>,
    /// Reporters run when an item succeeds.
    #[builder(default)]
    pub success_reporters: Vec<ReporterSpec>,
    /// Reporters run when an item fails.
    #[builder(default)]
    pub failure_reporters: Vec<ReporterSpec>,
    /// Reporters run when an item cannot be merged speculatively.
    #[builder(default)]
    pub merge_failure_reporters: Vec<ReporterSpec>,
    /// The shared queues of the pipeline, in configuration order.
    #[builder(default)]
    pub queues: Vec<SharedQueue>,
}

impl Pipeline {
    /// Create a builder for the structure.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Whether any trigger filter matches the event-change pair.
    pub fn event_matches(
        &self,
        event: &TriggerEvent,
        change: &Change,
        now: DateTime<Utc>,
    ) -> bool {
        self.triggers.iter().any(|f| f.matches(event, change, now))
    }

    /// The ids of all items in all queues, in processing order.
    pub fn all_item_ids(&self) -> Vec<ItemId> {
        self.queues.iter().flat_map(SharedQueue::ids).collect()
    }

    /// All items in all queues, in processing order.
    pub fn all_items(&self) -> impl Iterator<Item = &QueueItem> {
        self.queues.iter().flat_map(|q| q.items().iter())
    }

    /// Look up an item by id across all queues.
    pub fn find_item(&self, id: ItemId) -> Option<&QueueItem> {
        self.queues.iter().find_map(|q| q.get(id))
    }

    /// Look up an item by id across all queues, mutably.
    pub fn find_item_mut(&mut self, id: ItemId) -> Option<&mut QueueItem> {
        self.queues.iter_mut().find_map(|q| q.get_mut(id))
    }

    /// The index of the queue holding the given item.
    pub fn queue_index_of(&self, id: ItemId) -> Option<usize> {
        self.queues.iter().position(|q| q.get(id).is_some())
    }

    /// The index of the queue covering the given project, if any.
    pub fn queue_index_for_project(&self, project: &str) -> Option<usize> {
        self.queues.iter().position(|q| q.contains_project(project))
    }

    /// Whether a live item for the same snapshot is already enqueued.
    pub fn has_change(&self, change: &Change) -> bool {
        self.all_items()
            .any(|item| item.live && item.change.same_snapshot(change))
    }

    /// Drop dynamic queues which have emptied.
    pub fn prune_empty_queues(&mut self) {
        self.queues.retain(|q| !q.dynamic || !q.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{DisciplineKind, Pipeline, QueueItem, SharedQueue};
    use crate::test;

    fn pipeline() -> Pipeline {
        Pipeline::builder()
            .name("check")
            .source("github")
            .discipline(DisciplineKind::Independent)
            .build()
            .unwrap()
    }

    #[test]
    fn test_has_change_matches_snapshot() {
        let mut pipeline = pipeline();
        let mut queue = SharedQueue::new("org/project", vec!["org/project".into()], true);
        let change = test::pull_request("org/project", 1, "aaaa");
        queue.enqueue(QueueItem::new(change.clone(), true), "check");
        pipeline.queues.push(queue);

        assert!(pipeline.has_change(&change));
        let newer = test::pull_request("org/project", 1, "bbbb");
        assert!(!pipeline.has_change(&newer));
    }

    #[test]
    fn test_prune_empty_queues() {
        let mut pipeline = pipeline();
        pipeline
            .queues
            .push(SharedQueue::new("org/project", vec!["org/project".into()], true));
        pipeline
            .queues
            .push(SharedQueue::new("static", vec!["org/other".into()], false));
        pipeline.prune_empty_queues();
        let names: Vec<_> = pipeline.queues.iter().map(|q| q.name.clone()).collect();
        assert_eq!(names, ["static"]);
    }
}
