// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-pipeline state machine.
//!
//! A manager context borrows one pipeline together with everything its
//! queue processing needs: the layout configuration, the source
//! connections, the merger, executor and node-provisioner clients, and the
//! mutex registry. All mutation of pipeline state happens through it, on
//! the scheduler loop.

mod dependent;
mod independent;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ci_conductor_core::data::{
    Build, BuildResult, Change, DisciplineKind, ItemId, Job, LayoutConfig, MergeState,
    NodeRequest, Pipeline, QueueItem, RepoState, ReportAction, SharedQueue, TriggerEvent,
};
use ci_conductor_source::{ReportPhase, SourceConnection};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::events::MergeOutcome;
use crate::executor::{BuildRequest, ExecutorClient};
use crate::merger::{MergeSpec, MergerClient};
use crate::mutex::{HolderState, MutexRegistry};
use crate::nodepool::NodeProvisioner;
use crate::scheduler::SchedulerError;

use self::dependent::DependentDiscipline;
use self::independent::IndependentDiscipline;

/// The behavioural hooks distinguishing the queueing disciplines.
pub(crate) trait Discipline: Send + Sync {
    /// Whether enqueued dependencies run builds of their own.
    fn dependencies_are_live(&self) -> bool;

    /// Whether the platform must accept a merge before a change enters.
    fn requires_mergeable(&self) -> bool;

    /// Whether the first failing voting job dequeues the item and resets
    /// the items behind it.
    fn fails_fast(&self) -> bool;
}

/// The discipline implementation for a pipeline kind.
pub(crate) fn discipline(kind: DisciplineKind) -> &'static dyn Discipline {
    match kind {
        DisciplineKind::Independent => &IndependentDiscipline,
        DisciplineKind::Dependent => &DependentDiscipline,
    }
}

/// Options for enqueueing a change.
#[derive(Debug, Default, Clone)]
pub(crate) struct AddOptions {
    /// Preserve an original enqueue time, e.g. across a promote.
    pub enqueue_time: Option<DateTime<Utc>>,
    /// Suppress the start report.
    pub quiet: bool,
    /// Skip pipeline requirement evaluation.
    pub ignore_requirements: bool,
}

/// One pipeline plus everything its manager needs, borrowed for the
/// duration of an operation on the scheduler loop.
pub(crate) struct ManagerCtx<'a> {
    pub tenant: &'a str,
    pub pipeline: &'a mut Pipeline,
    pub config: &'a LayoutConfig,
    pub connections: &'a HashMap<String, Arc<dyn SourceConnection>>,
    pub merger: &'a Arc<dyn MergerClient>,
    pub executor: &'a Arc<dyn ExecutorClient>,
    pub nodepool: &'a Arc<dyn NodeProvisioner>,
    pub mutexes: &'a mut MutexRegistry,
    pub holder_states: &'a HashMap<String, HolderState>,
}

impl<'a> ManagerCtx<'a> {
    fn disc(&self) -> &'static dyn Discipline {
        discipline(self.pipeline.discipline)
    }

    fn source(&self) -> Result<Arc<dyn SourceConnection>, SchedulerError> {
        self.connections
            .get(&self.pipeline.source)
            .cloned()
            .ok_or_else(|| {
                SchedulerError::UnknownConnection {
                    connection: self.pipeline.source.clone(),
                }
            })
    }

    /// Whether any trigger filter of the pipeline matches the event-change
    /// pair.
    pub(crate) fn event_matches(&self, event: &TriggerEvent, change: &Change) -> bool {
        self.pipeline.event_matches(event, change, Utc::now())
    }

    /// Enqueue a change, resolving its cross-project dependencies first.
    ///
    /// In dependent pipelines, open changes which declare a dependency on
    /// the newly enqueued change are pulled in behind it. Returns whether
    /// anything was enqueued; re-enqueueing an already enqueued snapshot
    /// is a no-op.
    pub(crate) async fn add_change(
        &mut self,
        change: Change,
        opts: AddOptions,
    ) -> Result<bool, SchedulerError> {
        let enqueued = self.add_change_ahead(change.clone(), opts).await?;
        if enqueued && self.disc().dependencies_are_live() {
            self.enqueue_changes_behind(&change).await?;
        }
        Ok(enqueued)
    }

    /// Enqueue one change with its dependency chain ahead of it.
    async fn add_change_ahead(
        &mut self,
        change: Change,
        opts: AddOptions,
    ) -> Result<bool, SchedulerError> {
        let now = Utc::now();
        if self.pipeline.has_change(&change) {
            debug!(
                "change {} is already enqueued in pipeline {}",
                change, self.pipeline.name,
            );
            return Ok(false);
        }
        if !opts.ignore_requirements && !self.pipeline.requirements.matches(&change, now) {
            debug!(
                "change {} does not meet the requirements of pipeline {}",
                change, self.pipeline.name,
            );
            return Ok(false);
        }
        if self.disc().requires_mergeable() && !opts.ignore_requirements {
            let source = self.source()?;
            let mergeable = source
                .can_merge(&change)
                .await
                .map_err(SchedulerError::source)?;
            if !mergeable {
                debug!("change {} can not merge, ignoring", change);
                return Ok(false);
            }
        }

        let ordered = self.resolve_dependency_chain(&change).await?;
        let deps_live = self.disc().dependencies_are_live();
        let qidx = self.ensure_queue(&change);
        let pipeline_name = self.pipeline.name.clone();

        let count = ordered.len();
        let mut enqueued = false;
        for (pos, entry) in ordered.into_iter().enumerate() {
            let is_main = pos + 1 == count;
            let live = is_main || deps_live;
            if self.pipeline.queues[qidx]
                .items()
                .iter()
                .any(|i| i.change.same_snapshot(&entry))
            {
                continue;
            }
            // A live dependency already gated in another queue is not
            // duplicated here.
            if !is_main && deps_live && self.pipeline.has_change(&entry) {
                continue;
            }
            if !is_main
                && deps_live
                && !opts.ignore_requirements
                && !self.pipeline.requirements.matches(&entry, now)
            {
                debug!(
                    "dependency {} of {} does not meet the requirements of pipeline {}",
                    entry, change, pipeline_name,
                );
                return Ok(enqueued);
            }

            let mut item = QueueItem::new(entry.clone(), live);
            item.job_tree = self.config.job_tree_for(&pipeline_name, &entry);
            if is_main {
                if let Some(enqueue_time) = opts.enqueue_time {
                    item.enqueue_time = enqueue_time;
                }
            }
            self.pipeline.queues[qidx].add_project(&entry.project().name);
            let id = self.pipeline.queues[qidx].enqueue(item, &pipeline_name);
            debug!(
                "added change {} to queue {} in pipeline {}",
                entry, self.pipeline.queues[qidx].name, pipeline_name,
            );
            enqueued = true;
            if live && !opts.quiet {
                self.report_item(id, ReportPhase::Start).await;
            }
        }
        Ok(enqueued)
    }

    /// Pull open changes which declare a dependency on `change` into the
    /// queue behind it, transitively.
    async fn enqueue_changes_behind(&mut self, change: &Change) -> Result<(), SchedulerError> {
        let source = self.source()?;
        let mut seen = HashSet::new();
        seen.insert(change.id());
        let mut pending: VecDeque<Change> = source
            .get_changes_depending_on(change)
            .await
            .map_err(SchedulerError::source)?
            .into();
        while let Some(dependent) = pending.pop_front() {
            if !seen.insert(dependent.id()) {
                continue;
            }
            debug!("change {} depends on {}, enqueueing it behind", dependent, change);
            if self
                .add_change_ahead(dependent.clone(), AddOptions::default())
                .await?
            {
                pending.extend(
                    source
                        .get_changes_depending_on(&dependent)
                        .await
                        .map_err(SchedulerError::source)?,
                );
            }
        }
        Ok(())
    }

    /// Flatten the `Depends-On` graph of a change into dependencies-first
    /// order, ending with the change itself. Cycles are broken at the
    /// first revisit.
    async fn resolve_dependency_chain(
        &self,
        change: &Change,
    ) -> Result<Vec<Change>, SchedulerError> {
        let source = self.source()?;
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(change.clone(), false)];
        while let Some((entry, expanded)) = stack.pop() {
            if expanded {
                ordered.push(entry);
                continue;
            }
            if !visited.insert(entry.id()) {
                continue;
            }
            let needed = source
                .get_needed_changes(&entry)
                .await
                .map_err(SchedulerError::source)?;
            stack.push((entry, true));
            for dep in needed.into_iter().rev() {
                stack.push((dep, false));
            }
        }
        Ok(ordered)
    }

    /// The index of the queue a change belongs in, creating one if needed.
    ///
    /// Dependent pipelines use the shared queue covering the change's
    /// project; independent pipelines create a fresh dynamic queue per
    /// head change, holding the change and its context items.
    fn ensure_queue(&mut self, change: &Change) -> usize {
        let project = change.project().name.clone();
        let queue = match self.pipeline.discipline {
            DisciplineKind::Dependent => {
                if let Some(idx) = self.pipeline.queue_index_for_project(&project) {
                    return idx;
                }
                let name = self
                    .config
                    .project_configs
                    .get(&project)
                    .and_then(|pc| pc.queue.clone())
                    .unwrap_or_else(|| project.clone());
                SharedQueue::new(name, vec![project], false)
            },
            DisciplineKind::Independent => {
                SharedQueue::new(change.id(), vec![project], true)
            },
        };
        self.pipeline.queues.push(queue);
        self.pipeline.queues.len() - 1
    }

    /// Purge queue items whose change is an older snapshot of the given
    /// change.
    pub(crate) async fn remove_old_versions_of_change(
        &mut self,
        change: &Change,
    ) -> Result<bool, SchedulerError> {
        let stale: Vec<ItemId> = self
            .pipeline
            .all_items()
            .filter(|item| item.live && item.change.is_older_version_of(change))
            .map(|item| item.id)
            .collect();
        let mut changed = false;
        for id in stale {
            debug!("removing stale snapshot item {} for {}", id, change);
            changed |= self.remove_item(id).await?;
        }
        self.pipeline.prune_empty_queues();
        Ok(changed)
    }

    /// Remove every item testing the given abandoned change.
    pub(crate) async fn remove_abandoned_change(
        &mut self,
        change: &Change,
    ) -> Result<bool, SchedulerError> {
        let abandoned: Vec<ItemId> = self
            .pipeline
            .all_items()
            .filter(|item| item.live && item.change.same_change(change))
            .map(|item| item.id)
            .collect();
        let mut changed = false;
        for id in abandoned {
            debug!("removing abandoned change item {} for {}", id, change);
            changed |= self.remove_item(id).await?;
        }
        self.pipeline.prune_empty_queues();
        Ok(changed)
    }

    /// Cancel the running builds of an item, releasing any mutexes they
    /// hold. The builds stay recorded; the executor's stop is best-effort.
    pub(crate) async fn cancel_jobs(&mut self, id: ItemId) -> Result<(), SchedulerError> {
        let Some(item) = self.pipeline.find_item(id) else {
            return Ok(());
        };
        let running: Vec<(Option<Job>, String, Uuid)> = item
            .current_build_set
            .builds()
            .filter(|b| b.result.is_none() && !b.canceled)
            .map(|b| {
                (
                    item.job_tree.get(&b.job_name).cloned(),
                    b.job_name.clone(),
                    b.uuid,
                )
            })
            .collect();
        for (job, job_name, uuid) in running {
            debug!("canceling build {} of job {}", uuid, job_name);
            if let Err(err) = self.executor.cancel(uuid).await {
                error!("unable to cancel build {}: {}", uuid, err);
            }
            if let Some(item) = self.pipeline.find_item_mut(id) {
                if let Some(build) = item.current_build_set.get_build_mut(&job_name) {
                    build.canceled = true;
                }
            }
            if let Some(job) = job {
                self.mutexes.release(id, &job);
            }
        }
        Ok(())
    }

    /// Return every node set still held by an item, across its current and
    /// historical build sets.
    async fn return_item_nodes(&mut self, id: ItemId) {
        let Some(item) = self.pipeline.find_item_mut(id) else {
            return;
        };
        let mut node_sets = item.current_build_set.drain_node_sets();
        for build_set in &mut item.previous_build_sets {
            node_sets.extend(build_set.drain_node_sets());
        }
        for nodes in node_sets {
            if let Err(err) = self.nodepool.return_node_set(nodes).await {
                error!("unable to return node set: {}", err);
            }
        }
    }

    /// Cancel and dequeue an item.
    pub(crate) async fn remove_item(&mut self, id: ItemId) -> Result<bool, SchedulerError> {
        let Some(qidx) = self.pipeline.queue_index_of(id) else {
            return Ok(false);
        };
        self.cancel_jobs(id).await?;
        self.return_item_nodes(id).await;
        self.pipeline.queues[qidx].dequeue(id);
        Ok(true)
    }

    /// Cancel an item's builds and start over with a fresh build set.
    ///
    /// Used when the item's ancestor chain changed: everything it built so
    /// far was computed against a merge that no longer exists.
    pub(crate) async fn reset_item(&mut self, id: ItemId) -> Result<(), SchedulerError> {
        self.cancel_jobs(id).await?;
        self.return_item_nodes(id).await;
        if let Some(item) = self.pipeline.find_item_mut(id) {
            item.reset_build_set();
            item.reported = false;
        }
        Ok(())
    }

    /// Run one queue-processing pass over every item of every queue.
    ///
    /// Returns whether any progress was made; the loop calls this until it
    /// goes quiescent.
    pub(crate) async fn process_queue(&mut self) -> Result<bool, SchedulerError> {
        let mut changed = false;
        for qidx in 0..self.pipeline.queues.len() {
            for id in self.pipeline.queues[qidx].ids() {
                changed |= self.process_one_item(qidx, id).await?;
            }
        }
        self.pipeline.prune_empty_queues();
        Ok(changed)
    }

    async fn process_one_item(
        &mut self,
        qidx: usize,
        id: ItemId,
    ) -> Result<bool, SchedulerError> {
        let Some(item) = self.pipeline.queues[qidx].get(id) else {
            // Removed earlier in this pass.
            return Ok(false);
        };

        if !item.live {
            // Context items are dropped once nothing is behind them.
            if item.items_behind.is_empty() {
                self.remove_item(id).await?;
                return Ok(true);
            }
            return Ok(false);
        }

        let mut changed = false;

        // Request nodes for every job of the tree.
        if !item.current_build_set.nodes_requested {
            let build_set = item.current_build_set.uuid;
            let jobs = item.job_tree.jobs.clone();
            for job in &jobs {
                let request = NodeRequest::new(build_set, id, &job.name, job.node_labels.clone());
                if let Some(item) = self.pipeline.queues[qidx].get_mut(id) {
                    item.current_build_set
                        .note_node_request(&job.name, request.uuid);
                }
                if let Err(err) = self.nodepool.request_nodes(request).await {
                    error!("unable to request nodes for job {}: {}", job.name, err);
                }
            }
            if let Some(item) = self.pipeline.queues[qidx].get_mut(id) {
                item.current_build_set.nodes_requested = true;
            }
            changed = true;
        }

        // Request the speculative merge, then wait for it.
        let item = match self.pipeline.queues[qidx].get(id) {
            Some(item) => item,
            None => return Ok(changed),
        };
        if item.current_build_set.merge_state.is_none() && !item.current_build_set.unable_to_merge
        {
            if !item.current_build_set.merge_pending {
                self.submit_merge(qidx, id).await?;
                changed = true;
            }
            return Ok(changed);
        }

        if item.current_build_set.unable_to_merge {
            warn!("unable to merge item {} in pipeline {}", id, self.pipeline.name);
            self.report_item(id, ReportPhase::MergeFailure).await;
            let behind = self.pipeline.queues[qidx].ids_behind(id);
            self.remove_item(id).await?;
            for behind_id in behind {
                self.reset_item(behind_id).await?;
            }
            return Ok(true);
        }

        changed |= self.launch_jobs(qidx, id).await?;

        let Some(item) = self.pipeline.queues[qidx].get(id) else {
            return Ok(changed);
        };
        if self.disc().fails_fast() && item.did_any_job_fail() {
            self.cancel_jobs(id).await?;
            self.report_item(id, ReportPhase::Failure).await;
            let behind = self.pipeline.queues[qidx].ids_behind(id);
            self.remove_item(id).await?;
            for behind_id in behind {
                self.reset_item(behind_id).await?;
            }
            return Ok(true);
        }

        let Some(item) = self.pipeline.queues[qidx].get(id) else {
            return Ok(changed);
        };
        if item.all_jobs_complete() {
            let phase = if item.succeeded() {
                ReportPhase::Success
            } else {
                ReportPhase::Failure
            };
            self.report_item(id, phase).await;
            let behind = if phase == ReportPhase::Failure && self.disc().fails_fast() {
                self.pipeline.queues[qidx].ids_behind(id)
            } else {
                Vec::new()
            };
            self.remove_item(id).await?;
            for behind_id in behind {
                self.reset_item(behind_id).await?;
            }
            changed = true;
        }
        Ok(changed)
    }

    /// Submit the speculative merge of an item: the refspecs of every
    /// ancestor up to and including itself, applied onto the repository
    /// state captured by the nearest ancestor merge.
    async fn submit_merge(&mut self, qidx: usize, id: ItemId) -> Result<(), SchedulerError> {
        let queue = &self.pipeline.queues[qidx];
        let Some(pos) = queue.position(id) else {
            return Ok(());
        };
        let specs: Vec<MergeSpec> = queue.items()[..=pos]
            .iter()
            .map(|ancestor| merge_spec(&ancestor.change))
            .collect();
        let repo_state: RepoState = queue.items()[..pos]
            .iter()
            .rev()
            .find_map(|ancestor| ancestor.current_build_set.merge_state.as_ref())
            .map(|state| state.repo_state.clone())
            .unwrap_or_default();
        let build_set = queue.items()[pos].current_build_set.uuid;

        debug!(
            "submitting merge of {} changes for item {} in pipeline {}",
            specs.len(),
            id,
            self.pipeline.name,
        );
        self.merger
            .merge_changes(build_set, id, specs, repo_state)
            .await
            .map_err(SchedulerError::merger)?;
        if let Some(item) = self.pipeline.queues[qidx].get_mut(id) {
            item.current_build_set.merge_pending = true;
        }
        Ok(())
    }

    /// Launch every job that is ready: dependencies succeeded, nodes
    /// provisioned, mutex available.
    async fn launch_jobs(&mut self, qidx: usize, id: ItemId) -> Result<bool, SchedulerError> {
        let Some(item) = self.pipeline.queues[qidx].get(id) else {
            return Ok(false);
        };
        let ready: Vec<Job> = item
            .job_tree
            .ready_jobs(&item.current_build_set)
            .into_iter()
            .cloned()
            .collect();
        if ready.is_empty() {
            return Ok(false);
        }
        let build_set = item.current_build_set.uuid;
        let merge_commit = item
            .current_build_set
            .merge_state
            .as_ref()
            .map(|m| m.commit.clone());
        let project = item.change.project().name.clone();
        let (change_number, patchset) = match item.change.as_pull_request() {
            Some(pr) => (Some(pr.number), Some(pr.patchset.clone())),
            None => (None, None),
        };

        let mut changed = false;
        for job in ready {
            let Some(item) = self.pipeline.queues[qidx].get(id) else {
                break;
            };
            if !item.current_build_set.has_nodes(&job.name) {
                continue;
            }
            if !self.mutexes.acquire(id, &job, self.holder_states) {
                debug!("job {} of item {} waiting on mutex", job.name, id);
                continue;
            }
            let nodes = item
                .current_build_set
                .node_set(&job.name)
                .cloned()
                .unwrap_or_default();
            let build = Build::new(&job.name, build_set, job.node_labels.clone());
            let uuid = build.uuid;
            if let Some(item) = self.pipeline.queues[qidx].get_mut(id) {
                item.current_build_set.add_build(build);
            }
            let request = BuildRequest {
                uuid,
                build_set,
                item: id,
                job: job.clone(),
                project: project.clone(),
                change_number,
                patchset: patchset.clone(),
                merge_commit: merge_commit.clone(),
                nodes,
            };
            debug!("launching build {} of job {} for item {}", uuid, job.name, id);
            match self.executor.execute(request).await {
                Ok(()) => {
                    changed = true;
                },
                Err(err) => {
                    error!("unable to launch job {}: {}", job.name, err);
                    self.mutexes.release(id, &job);
                    if let Some(item) = self.pipeline.queues[qidx].get_mut(id) {
                        if let Some(build) = item.current_build_set.get_build_mut(&job.name) {
                            build.result = Some(BuildResult::Unreachable);
                        }
                    }
                    changed = true;
                },
            }
        }
        Ok(changed)
    }

    /// Handle a build start notification.
    pub(crate) fn on_build_started(&mut self, id: ItemId, job_name: &str) {
        debug!(
            "build of job {} started for item {} in pipeline {}",
            job_name, id, self.pipeline.name,
        );
    }

    /// Handle a build completion: release the mutex and decide whether the
    /// build is relaunched.
    pub(crate) async fn on_build_completed(
        &mut self,
        id: ItemId,
        job_name: &str,
    ) -> Result<(), SchedulerError> {
        let Some(item) = self.pipeline.find_item(id) else {
            return Ok(());
        };
        let job = item.job_tree.get(job_name).cloned();
        let Some(build) = item.current_build_set.get_build(job_name) else {
            return Ok(());
        };
        let canceled = build.canceled;
        let result = build.result;
        let build_set = item.current_build_set.uuid;
        let live = item.live;

        if let Some(job) = &job {
            if !canceled {
                self.mutexes.release(id, job);
            }
        }

        let Some(result) = result else {
            return Ok(());
        };
        if !live || !result.retryable(canceled) {
            return Ok(());
        }
        let Some(job) = job else {
            return Ok(());
        };
        let retries = {
            let Some(item) = self.pipeline.find_item(id) else {
                return Ok(());
            };
            item.current_build_set.retries_for(job_name)
        };
        if retries + 1 < job.attempts {
            debug!(
                "retrying job {} for item {} (attempt {} of {})",
                job_name,
                id,
                retries + 2,
                job.attempts,
            );
            let request = NodeRequest::new(build_set, id, job_name, job.node_labels.clone());
            if let Some(item) = self.pipeline.find_item_mut(id) {
                item.current_build_set.increment_retries(job_name);
                item.current_build_set.remove_build(job_name);
                item.current_build_set
                    .note_node_request(job_name, request.uuid);
            }
            if let Err(err) = self.nodepool.request_nodes(request).await {
                error!("unable to request nodes for retry of {}: {}", job_name, err);
            }
        } else if let Some(item) = self.pipeline.find_item_mut(id) {
            if let Some(build) = item.current_build_set.get_build_mut(job_name) {
                build.result = Some(BuildResult::RetryLimit);
            }
        }
        Ok(())
    }

    /// Handle a merge completion for an item's current build set.
    pub(crate) fn on_merge_completed(&mut self, id: ItemId, outcome: &MergeOutcome) {
        let Some(item) = self.pipeline.find_item_mut(id) else {
            return;
        };
        let build_set = &mut item.current_build_set;
        build_set.merge_pending = false;
        if outcome.merged {
            let commit = outcome.commit.clone().unwrap_or_default();
            build_set.merge_state = Some(MergeState::new(
                commit,
                outcome.files.clone(),
                outcome.repo_state.clone(),
            ));
        } else {
            build_set.unable_to_merge = true;
        }
    }

    /// Handle provisioned nodes for an item's current build set.
    pub(crate) fn on_nodes_provisioned(&mut self, id: ItemId, request: &NodeRequest) {
        let Some(item) = self.pipeline.find_item_mut(id) else {
            return;
        };
        item.current_build_set
            .assign_nodes(&request.job_name, request.nodes.clone());
    }

    /// Re-enqueue a detached item onto this pipeline during
    /// reconfiguration, preserving its build set.
    ///
    /// `last_head` names the previously re-enqueued head of the item's old
    /// queue so chains land in the same new queue. Returns the item on
    /// failure so the caller can cancel its builds.
    pub(crate) fn re_enqueue_item(
        &mut self,
        mut item: QueueItem,
        last_head: Option<ItemId>,
    ) -> Result<ItemId, QueueItem> {
        let change = item.change.clone();
        if item.live {
            let configured = self
                .config
                .project_configs
                .get(&change.project().name)
                .map(|pc| pc.pipelines.contains_key(&self.pipeline.name))
                .unwrap_or(false);
            if !configured {
                return Err(item);
            }
        }
        item.job_tree = self.config.job_tree_for(&self.pipeline.name, &change);
        let qidx = last_head
            .and_then(|head| self.pipeline.queue_index_of(head))
            .unwrap_or_else(|| self.ensure_queue(&change));
        let pipeline_name = self.pipeline.name.clone();
        self.pipeline.queues[qidx].add_project(&change.project().name);
        Ok(self.pipeline.queues[qidx].enqueue(item, &pipeline_name))
    }

    /// Move the given changes to the head of their shared queue.
    ///
    /// Items whose chain of ancestors is unchanged keep their builds;
    /// displaced items are reset.
    pub(crate) async fn promote(&mut self, change_ids: &[String]) -> Result<(), SchedulerError> {
        let Some(first) = change_ids.first() else {
            return Ok(());
        };
        let Some(qidx) = self
            .pipeline
            .queues
            .iter()
            .position(|q| q.items().iter().any(|i| i.change.id() == *first))
        else {
            return Err(SchedulerError::ChangeNotInQueue {
                change: first.clone(),
            });
        };
        let mut order = Vec::with_capacity(change_ids.len());
        for change_id in change_ids {
            let Some(item) = self.pipeline.queues[qidx]
                .items()
                .iter()
                .find(|i| i.change.id() == *change_id)
            else {
                return Err(SchedulerError::ChangeNotInQueue {
                    change: change_id.clone(),
                });
            };
            order.push(item.id);
        }
        let displaced = self.pipeline.queues[qidx].reorder(&order);
        for id in displaced {
            debug!("resetting item {} displaced by promotion", id);
            self.reset_item(id).await?;
        }
        Ok(())
    }

    /// Send the reports configured for a phase.
    pub(crate) async fn report_item(&mut self, id: ItemId, phase: ReportPhase) {
        let Some(item) = self.pipeline.find_item(id) else {
            return;
        };
        let change = item.change.clone();
        let message = self.report_message(item, phase);
        let reporters = match phase {
            ReportPhase::Start => self.pipeline.start_reporters.clone(),
            ReportPhase::Success => self.pipeline.success_reporters.clone(),
            ReportPhase::Failure | ReportPhase::SyntaxError => {
                self.pipeline.failure_reporters.clone()
            },
            ReportPhase::MergeFailure => self.pipeline.merge_failure_reporters.clone(),
        };
        for spec in reporters {
            let Some(connection) = self.connections.get(&spec.connection) else {
                warn!("reporter names unknown connection {}", spec.connection);
                continue;
            };
            let outcome = match &spec.action {
                ReportAction::Comment => connection.report(&change, phase, &message).await,
                ReportAction::Status {
                    context,
                } => {
                    let state = match phase {
                        ReportPhase::Start => "pending",
                        ReportPhase::Success => "success",
                        _ => "failure",
                    };
                    connection
                        .set_commit_status(&change, context, state, &message)
                        .await
                },
                ReportAction::Merge => {
                    if phase == ReportPhase::Success {
                        connection.merge_change(&change).await
                    } else {
                        Ok(())
                    }
                },
            };
            if let Err(err) = outcome {
                error!("unable to report change {}: {}", change, err);
            }
        }
        if phase != ReportPhase::Start {
            if let Some(item) = self.pipeline.find_item_mut(id) {
                item.reported = true;
            }
        }
    }

    fn report_message(&self, item: &QueueItem, phase: ReportPhase) -> String {
        match phase {
            ReportPhase::Start => {
                format!(
                    "Starting {} jobs for tenant {}.",
                    self.pipeline.name, self.tenant,
                )
            },
            ReportPhase::MergeFailure => {
                "Merge failed. This change could not be merged speculatively; \
                 rebase it and try again."
                    .into()
            },
            ReportPhase::SyntaxError => "Syntax error in pipeline configuration.".into(),
            _ => {
                let mut lines = Vec::new();
                match item.first_failing_job() {
                    Some((job, result)) => {
                        lines.push(format!("Build failed: {} ({})", job, result));
                    },
                    None => lines.push("Build succeeded.".into()),
                }
                for build in item.current_build_set.builds() {
                    let result = build
                        .result
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "UNKNOWN".into());
                    let url = build.url.clone().unwrap_or_else(|| "n/a".into());
                    lines.push(format!("- {}: {} ({})", build.job_name, result, url));
                }
                lines.join("\n")
            },
        }
    }
}

fn merge_spec(change: &Change) -> MergeSpec {
    match change {
        Change::PullRequest(pr) => {
            MergeSpec {
                connection: pr.project.connection.clone(),
                project: pr.project.name.clone(),
                branch: pr.branch.clone(),
                refspec: pr.refspec.clone(),
            }
        },
        Change::Ref(r) => {
            MergeSpec {
                connection: r.project.connection.clone(),
                project: r.project.name.clone(),
                branch: r.ref_name.clone(),
                refspec: r.newrev.clone(),
            }
        },
    }
}
