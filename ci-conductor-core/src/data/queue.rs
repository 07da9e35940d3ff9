// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::data::{BuildResult, BuildSet, Change, JobTree};

/// A stable identifier for a queue item.
///
/// Item ids survive resets, promotion, and re-enqueueing onto a new layout
/// during reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Allocate a fresh item id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// One change enqueued in one pipeline.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct QueueItem {
    /// The stable id of the item.
    pub id: ItemId,
    /// The change under test.
    pub change: Change,
    /// The name of the pipeline the item is enqueued in, if any.
    ///
    /// `pipeline` and `queue` are either both set or both cleared.
    pub pipeline: Option<String>,
    /// The name of the shared queue the item is enqueued in, if any.
    pub queue: Option<String>,
    /// The id of the item ahead, `None` iff the item is at the queue head.
    pub item_ahead: Option<ItemId>,
    /// The ids of the items immediately behind.
    pub items_behind: Vec<ItemId>,
    /// The live build set; replaced on reset.
    pub current_build_set: BuildSet,
    /// Prior build sets, kept as immutable history so that late results can
    /// be recognised as stale.
    pub previous_build_sets: Vec<BuildSet>,
    /// The jobs applicable to the item, frozen from the layout.
    pub job_tree: JobTree,
    /// When the item was enqueued.
    pub enqueue_time: DateTime<Utc>,
    /// Whether the item is tested for its own sake.
    ///
    /// Non-live items only provide merge context for dependent changes
    /// behind them.
    pub live: bool,
    /// Whether a terminal report has been sent for the item.
    pub reported: bool,
}

impl QueueItem {
    /// Create an unenqueued item for a change.
    pub fn new(change: Change, live: bool) -> Self {
        let id = ItemId::new();
        Self {
            id,
            change,
            pipeline: None,
            queue: None,
            item_ahead: None,
            items_behind: Vec::new(),
            current_build_set: BuildSet::new(id),
            previous_build_sets: Vec::new(),
            job_tree: JobTree::default(),
            enqueue_time: Utc::now(),
            live,
            reported: false,
        }
    }

    /// Replace the current build set with a fresh one.
    ///
    /// The old set becomes immutable history; results arriving for it are
    /// recognised as stale. Node sets still held by the old set remain
    /// there until taken.
    pub fn reset_build_set(&mut self) -> &mut BuildSet {
        let fresh = BuildSet::new(self.id);
        let old = std::mem::replace(&mut self.current_build_set, fresh);
        self.previous_build_sets.push(old);
        &mut self.current_build_set
    }

    /// Detach the item from its pipeline and queue.
    pub fn detach(&mut self) {
        self.pipeline = None;
        self.queue = None;
        self.item_ahead = None;
        self.items_behind.clear();
    }

    /// Find the build set with the given id, current or historical.
    pub fn build_set(&self, uuid: Uuid) -> Option<&BuildSet> {
        if self.current_build_set.uuid == uuid {
            Some(&self.current_build_set)
        } else {
            self.previous_build_sets.iter().find(|bs| bs.uuid == uuid)
        }
    }

    /// Find the build set with the given id, mutably.
    pub fn build_set_mut(&mut self, uuid: Uuid) -> Option<&mut BuildSet> {
        if self.current_build_set.uuid == uuid {
            Some(&mut self.current_build_set)
        } else {
            self.previous_build_sets
                .iter_mut()
                .find(|bs| bs.uuid == uuid)
        }
    }

    /// Whether every job in the item's tree has a terminal build.
    ///
    /// An item with a failed merge has no jobs to run and counts as
    /// complete.
    pub fn all_jobs_complete(&self) -> bool {
        if self.current_build_set.unable_to_merge {
            return true;
        }
        self.job_tree.jobs.iter().all(|job| {
            self.current_build_set
                .get_build(&job.name)
                .map(|b| b.result.is_some())
                .unwrap_or(false)
        })
    }

    /// Whether any voting job has a terminal, unsuccessful result.
    pub fn did_any_job_fail(&self) -> bool {
        self.job_tree
            .jobs
            .iter()
            .filter(|job| job.voting)
            .any(|job| {
                self.current_build_set
                    .get_build(&job.name)
                    .and_then(|b| b.result)
                    .map(|r| !r.succeeded())
                    .unwrap_or(false)
            })
    }

    /// Whether the item finished with every voting job successful and the
    /// merge intact.
    pub fn succeeded(&self) -> bool {
        !self.current_build_set.unable_to_merge && self.all_jobs_complete() && !self.did_any_job_fail()
    }

    /// The result of the first failing voting job, for reporting.
    pub fn first_failing_job(&self) -> Option<(&str, BuildResult)> {
        self.job_tree
            .jobs
            .iter()
            .filter(|job| job.voting)
            .find_map(|job| {
                self.current_build_set
                    .get_build(&job.name)
                    .and_then(|b| b.result.map(|r| (job.name.as_str(), r)))
                    .filter(|(_, r)| !r.succeeded())
            })
    }
}

/// An ordered queue of items whose projects share an ordering constraint.
///
/// The vector order is authoritative: the head is first, and the
/// `item_ahead` / `items_behind` links are maintained to mirror it, so the
/// chain of links always forms a total order over the queue.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SharedQueue {
    /// The name of the queue.
    pub name: String,
    /// The names of the projects the queue covers.
    pub projects: Vec<String>,
    /// Whether the queue was created on demand for a single change and
    /// should be dropped when it empties.
    pub dynamic: bool,
    items: Vec<QueueItem>,
}

impl SharedQueue {
    /// Create an empty queue.
    pub fn new<N>(name: N, projects: Vec<String>, dynamic: bool) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            projects,
            dynamic,
            items: Vec::new(),
        }
    }

    /// Whether the queue covers the given project.
    pub fn contains_project(&self, name: &str) -> bool {
        self.projects.iter().any(|p| p == name)
    }

    /// Add a project to the queue's coverage.
    pub fn add_project(&mut self, name: &str) {
        if !self.contains_project(name) {
            self.projects.push(name.into());
        }
    }

    /// The items in queue order, head first.
    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// The items in queue order, mutably.
    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut QueueItem> {
        self.items.iter_mut()
    }

    /// The ids of the items in queue order.
    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|i| i.id).collect()
    }

    /// Whether the queue has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an item by id.
    pub fn get(&self, id: ItemId) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Look up an item by id, mutably.
    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    /// The position of an item in the queue.
    pub fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|i| i.id == id)
    }

    /// Append an item to the tail of the queue, linking it behind the
    /// current tail.
    pub fn enqueue(&mut self, mut item: QueueItem, pipeline: &str) -> ItemId {
        item.pipeline = Some(pipeline.into());
        item.queue = Some(self.name.clone());
        let id = item.id;
        self.items.push(item);
        self.relink();
        id
    }

    /// Remove an item, splicing the chain around it.
    ///
    /// The returned item is fully detached: its pipeline, queue, and links
    /// are cleared.
    pub fn dequeue(&mut self, id: ItemId) -> Option<QueueItem> {
        let pos = self.position(id)?;
        let mut item = self.items.remove(pos);
        item.detach();
        self.relink();
        Some(item)
    }

    /// The ids of every item behind the given item, nearest first.
    pub fn ids_behind(&self, id: ItemId) -> Vec<ItemId> {
        match self.position(id) {
            Some(pos) => self.items[pos + 1..].iter().map(|i| i.id).collect(),
            None => Vec::new(),
        }
    }

    /// Reorder the queue to the given id order.
    ///
    /// Ids absent from `order` keep their relative order behind the listed
    /// ones. Returns the ids of items whose chain of ancestors changed.
    pub fn reorder(&mut self, order: &[ItemId]) -> Vec<ItemId> {
        let chains_before = self.ancestor_chains();
        let mut reordered = Vec::with_capacity(self.items.len());
        for id in order {
            if let Some(pos) = self.position(*id) {
                reordered.push(self.items.remove(pos));
            }
        }
        reordered.append(&mut self.items);
        self.items = reordered;
        self.relink();
        self.items
            .iter()
            .filter(|item| {
                chains_before.get(&item.id) != Some(&self.chain_of(item.id))
            })
            .map(|item| item.id)
            .collect()
    }

    /// The sequence of ancestor ids of an item, nearest first.
    pub fn chain_of(&self, id: ItemId) -> Vec<ItemId> {
        match self.position(id) {
            Some(pos) => self.items[..pos].iter().rev().map(|i| i.id).collect(),
            None => Vec::new(),
        }
    }

    fn ancestor_chains(&self) -> std::collections::HashMap<ItemId, Vec<ItemId>> {
        self.items
            .iter()
            .map(|item| (item.id, self.chain_of(item.id)))
            .collect()
    }

    /// Rebuild the `item_ahead` / `items_behind` links from the vector
    /// order.
    fn relink(&mut self) {
        let ids = self.ids();
        for (pos, item) in self.items.iter_mut().enumerate() {
            item.item_ahead = if pos == 0 {
                None
            } else {
                Some(ids[pos - 1])
            };
            item.items_behind = if pos + 1 < ids.len() {
                vec![ids[pos + 1]]
            } else {
                Vec::new()
            };
        }
    }
}
