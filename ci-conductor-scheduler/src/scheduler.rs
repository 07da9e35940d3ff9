// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The engine of the system.
//!
//! The scheduler runs a single-task main loop which drains three
//! prioritised event queues (management, then result, then trigger) and
//! then processes every pipeline until quiescent. Producers on any thread
//! or task enqueue events through a [`SchedulerHandle`] and signal the wake
//! condition; no pipeline state is mutated outside the loop.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ci_conductor_core::data::{
    Abide, Build, BuildResult, Change, ItemId, NodeRequest, QueueItem, Tenant, TriggerEvent,
    TriggerEventKind,
};
use ci_conductor_persistence::{
    QueueSnapshot, SnapshotError, TimeDatabase, TimeDatabaseError,
};
use ci_conductor_source::{ReportPhase, SourceConnection, SourceError};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{self, ConfigError};
use crate::events::{ManagementEvent, ManagementOp, MergeOutcome, ResultEvent};
use crate::executor::{ExecutorClient, ExecutorError};
use crate::manager::{AddOptions, ManagerCtx};
use crate::merger::{MergerClient, MergerError};
use crate::mutex::{HolderState, MutexRegistry};
use crate::nodepool::{NodeError, NodeProvisioner};
use crate::stats::StatsSink;

/// An error that may occur inside the scheduler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Loading configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A source connection reported an error.
    #[error("source error: {}", source)]
    Source {
        /// The source of the failure.
        source: SourceError,
    },
    /// The merger reported an error.
    #[error("merger error: {}", source)]
    Merger {
        /// The source of the failure.
        source: MergerError,
    },
    /// The executor reported an error.
    #[error("executor error: {}", source)]
    Executor {
        /// The source of the failure.
        source: ExecutorError,
    },
    /// The node provisioner reported an error.
    #[error("node provisioner error: {}", source)]
    Node {
        /// The source of the failure.
        source: NodeError,
    },
    /// The time database reported an error.
    #[error(transparent)]
    TimeDatabase(#[from] TimeDatabaseError),
    /// The queue snapshot reported an error.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// An operation names a tenant the abide does not hold.
    #[error("unknown tenant '{}'", tenant)]
    UnknownTenant {
        /// The tenant named.
        tenant: String,
    },
    /// An operation names a pipeline the layout does not hold.
    #[error("unknown pipeline '{}'", pipeline)]
    UnknownPipeline {
        /// The pipeline named.
        pipeline: String,
    },
    /// A pipeline names a connection that is not registered.
    #[error("unknown connection '{}'", connection)]
    UnknownConnection {
        /// The connection named.
        connection: String,
    },
    /// A promote operation names a change that is not enqueued.
    #[error("change '{}' is not in the queue", change)]
    ChangeNotInQueue {
        /// The change id named.
        change: String,
    },
    /// An internal invariant failed.
    #[error("{}", details)]
    Internal {
        /// Details of the error.
        details: String,
    },
}

impl SchedulerError {
    pub(crate) fn source(source: SourceError) -> Self {
        Self::Source {
            source,
        }
    }

    pub(crate) fn merger(source: MergerError) -> Self {
        Self::Merger {
            source,
        }
    }

    pub(crate) fn internal<D>(details: D) -> Self
    where
        D: Into<String>,
    {
        Self::Internal {
            details: details.into(),
        }
    }
}

#[derive(Debug)]
struct BusInner {
    management: Mutex<VecDeque<ManagementEvent>>,
    result: Mutex<VecDeque<ResultEvent>>,
    trigger: Mutex<VecDeque<TriggerEvent>>,
    wake: Notify,
    pause: AtomicBool,
    exit: AtomicBool,
    stopped: AtomicBool,
}

/// The enqueue side of the scheduler.
///
/// Handles are cheap to clone and safe to use from any thread or task:
/// webhook listeners, executor callbacks, and node-provisioner callbacks
/// all talk to the loop through one.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    inner: Arc<BusInner>,
}

impl Default for SchedulerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandle {
    /// Create the event queues.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                management: Mutex::new(VecDeque::new()),
                result: Mutex::new(VecDeque::new()),
                trigger: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                pause: AtomicBool::new(false),
                exit: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an external trigger event.
    ///
    /// Events enqueued from one producer are processed in submission
    /// order.
    pub fn add_trigger_event(&self, event: TriggerEvent) {
        debug!("adding trigger event: {}", event.change_key());
        self.inner
            .trigger
            .lock()
            .expect("trigger queue lock poisoned")
            .push_back(event);
        self.wake_up();
    }

    /// Report that a build has started on a worker.
    pub fn on_build_started(&self, uuid: Uuid) {
        self.push_result(ResultEvent::BuildStarted {
            uuid,
            start_time: Utc::now(),
        });
    }

    /// Report that a build has completed.
    pub fn on_build_completed(&self, uuid: Uuid, result: BuildResult) {
        self.push_result(ResultEvent::BuildCompleted {
            uuid,
            result,
            end_time: Utc::now(),
        });
    }

    /// Report a completed merge operation.
    pub fn on_merge_completed(&self, outcome: MergeOutcome) {
        self.push_result(ResultEvent::MergeCompleted(outcome));
    }

    /// Report provisioned nodes.
    pub fn on_nodes_provisioned(&self, request: NodeRequest) {
        self.push_result(ResultEvent::NodesProvisioned(request));
    }

    fn push_result(&self, event: ResultEvent) {
        self.inner
            .result
            .lock()
            .expect("result queue lock poisoned")
            .push_back(event);
        self.wake_up();
    }

    pub(crate) fn submit(
        &self,
        op: ManagementOp,
    ) -> oneshot::Receiver<Result<(), SchedulerError>> {
        let (event, rx) = ManagementEvent::new(op);
        self.inner
            .management
            .lock()
            .expect("management queue lock poisoned")
            .push_back(event);
        self.wake_up();
        rx
    }

    pub(crate) fn pop_management(&self) -> Option<ManagementEvent> {
        self.inner
            .management
            .lock()
            .expect("management queue lock poisoned")
            .pop_front()
    }

    pub(crate) fn pop_result(&self) -> Option<ResultEvent> {
        self.inner
            .result
            .lock()
            .expect("result queue lock poisoned")
            .pop_front()
    }

    pub(crate) fn pop_trigger(&self) -> Option<TriggerEvent> {
        self.inner
            .trigger
            .lock()
            .expect("trigger queue lock poisoned")
            .pop_front()
    }

    pub(crate) fn drain_trigger(&self) -> Vec<TriggerEvent> {
        self.inner
            .trigger
            .lock()
            .expect("trigger queue lock poisoned")
            .drain(..)
            .collect()
    }

    /// The number of pending trigger events.
    pub fn trigger_queue_len(&self) -> usize {
        self.inner
            .trigger
            .lock()
            .expect("trigger queue lock poisoned")
            .len()
    }

    /// The number of pending result events.
    pub fn result_queue_len(&self) -> usize {
        self.inner
            .result
            .lock()
            .expect("result queue lock poisoned")
            .len()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self
            .inner
            .management
            .lock()
            .expect("management queue lock poisoned")
            .is_empty()
            || self.result_queue_len() > 0
            || (!self.paused() && self.trigger_queue_len() > 0)
    }

    pub(crate) fn wake_up(&self) {
        self.inner.wake.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.inner.wake.notified().await;
    }

    pub(crate) fn set_pause(&self, pause: bool) {
        self.inner.pause.store(pause, Ordering::SeqCst);
    }

    pub(crate) fn set_exit(&self) {
        self.inner.exit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether trigger-queue draining is paused.
    pub fn paused(&self) -> bool {
        self.inner.pause.load(Ordering::SeqCst)
    }

    pub(crate) fn exiting(&self) -> bool {
        self.inner.exit.load(Ordering::SeqCst)
    }

    /// Whether the loop has terminated.
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

/// Where the scheduler keeps its state on disk.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SchedulerOptions {
    /// The directory holding persisted state.
    pub state_dir: PathBuf,
    /// The path to the tenant configuration.
    pub tenant_config: PathBuf,
}

impl SchedulerOptions {
    /// Create options.
    pub fn new<S, T>(state_dir: S, tenant_config: T) -> Self
    where
        S: Into<PathBuf>,
        T: Into<PathBuf>,
    {
        Self {
            state_dir: state_dir.into(),
            tenant_config: tenant_config.into(),
        }
    }
}

struct SchedulerState {
    abide: Abide,
    mutexes: MutexRegistry,
    time_db: TimeDatabase,
    last_reconfigured: Option<DateTime<Utc>>,
}

struct BuildLocation {
    tenant: String,
    pipeline: String,
    item: ItemId,
    build_set: Uuid,
    job_name: String,
    current: bool,
}

/// The scheduling and pipeline-management engine.
pub struct Scheduler {
    bus: SchedulerHandle,
    state: tokio::sync::Mutex<SchedulerState>,
    layout_lock: tokio::sync::Mutex<()>,
    connections: HashMap<String, Arc<dyn SourceConnection>>,
    merger: Arc<dyn MergerClient>,
    executor: Arc<dyn ExecutorClient>,
    nodepool: Arc<dyn NodeProvisioner>,
    stats: Arc<dyn StatsSink>,
    tenant_config: PathBuf,
    snapshot: QueueSnapshot,
}

impl Scheduler {
    /// Create a scheduler over the given clients.
    ///
    /// The abide starts empty; call [`Scheduler::reconfigure`] to load the
    /// tenant configuration.
    pub fn new(
        options: SchedulerOptions,
        handle: SchedulerHandle,
        connections: HashMap<String, Arc<dyn SourceConnection>>,
        merger: Arc<dyn MergerClient>,
        executor: Arc<dyn ExecutorClient>,
        nodepool: Arc<dyn NodeProvisioner>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, SchedulerError> {
        let time_db = TimeDatabase::new(options.state_dir.join("times"))?;
        let snapshot = QueueSnapshot::new(options.state_dir.join("queue.json"));
        Ok(Self {
            bus: handle,
            state: tokio::sync::Mutex::new(SchedulerState {
                abide: Abide::default(),
                mutexes: MutexRegistry::default(),
                time_db,
                last_reconfigured: None,
            }),
            layout_lock: tokio::sync::Mutex::new(()),
            connections,
            merger,
            executor,
            nodepool,
            stats,
            tenant_config: options.tenant_config,
            snapshot,
        })
    }

    /// A handle for enqueueing events from other threads and tasks.
    pub fn handle(&self) -> SchedulerHandle {
        self.bus.clone()
    }

    /// Reload every tenant from the tenant configuration path.
    pub async fn reconfigure(&self) -> Result<(), SchedulerError> {
        debug!("prepare to reconfigure");
        let rx = self.bus.submit(ManagementOp::Reconfigure);
        rx.await
            .map_err(|_| SchedulerError::internal("reconfigure event dropped"))?
    }

    /// Rebuild a single tenant in place.
    pub async fn reconfigure_tenant(
        &self,
        tenant: &str,
        triggering_change: Option<Change>,
    ) -> Result<(), SchedulerError> {
        let rx = self.bus.submit(ManagementOp::TenantReconfigure {
            tenant: tenant.into(),
            triggering_change,
        });
        rx.await
            .map_err(|_| SchedulerError::internal("reconfigure event dropped"))?
    }

    /// Move the given changes to the head of their shared queue.
    pub async fn promote(
        &self,
        tenant: &str,
        pipeline: &str,
        change_ids: Vec<String>,
    ) -> Result<(), SchedulerError> {
        let rx = self.bus.submit(ManagementOp::Promote {
            tenant: tenant.into(),
            pipeline: pipeline.into(),
            change_ids,
        });
        rx.await
            .map_err(|_| SchedulerError::internal("promote event dropped"))?
    }

    /// Enqueue a change directly into the pipeline named by the event's
    /// `forced_pipeline`.
    pub async fn enqueue_change(
        &self,
        tenant: &str,
        event: TriggerEvent,
    ) -> Result<(), SchedulerError> {
        let rx = self.bus.submit(ManagementOp::Enqueue {
            tenant: tenant.into(),
            event,
        });
        rx.await
            .map_err(|_| SchedulerError::internal("enqueue event dropped"))?
    }

    /// Stop accepting trigger events and terminate once every build has
    /// completed, snapshotting the pending trigger queue.
    pub fn exit(&self) {
        debug!("prepare to exit");
        self.bus.set_pause(true);
        self.bus.set_exit();
        self.bus.wake_up();
    }

    /// Terminate the loop immediately.
    pub fn stop(&self) {
        self.bus.mark_stopped();
        self.bus.wake_up();
    }

    /// Reload the trigger-queue snapshot left by a paused exit, then
    /// delete it.
    pub fn resume(&self) -> Result<(), SchedulerError> {
        let events = self.snapshot.load()?;
        if !events.is_empty() {
            info!("resuming {} saved trigger events", events.len());
        }
        for event in events {
            self.bus.add_trigger_event(event);
        }
        self.snapshot.delete()?;
        self.bus.wake_up();
        Ok(())
    }

    /// The main loop. Runs until stopped.
    pub async fn run(&self) {
        loop {
            debug!("run handler sleeping");
            self.bus.notified().await;
            if self.bus.stopped() {
                debug!("run handler stopping");
                return;
            }
            debug!("run handler awake");
            let mut state = self.state.lock().await;
            if let Err(err) = self.run_once(&mut state).await {
                // There may still be more events to process.
                error!("exception in run handler: {}", err);
                self.bus.wake_up();
            }
            if self.bus.stopped() {
                return;
            }
        }
    }

    /// Drain and process until no event is pending. Deterministic
    /// alternative to [`Scheduler::run`] used by tests.
    #[cfg(test)]
    pub(crate) async fn run_until_settled(&self) {
        while self.bus.has_pending() && !self.bus.stopped() {
            let mut state = self.state.lock().await;
            if let Err(err) = self.run_once(&mut state).await {
                error!("exception in run handler: {}", err);
            }
        }
    }

    /// The names of the mutexes currently held.
    #[cfg(test)]
    pub(crate) async fn held_mutexes(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.mutexes.held().iter().map(|s| s.to_string()).collect()
    }

    /// When the last successful reconfiguration happened.
    #[cfg(test)]
    pub(crate) async fn last_reconfigured(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_reconfigured
    }

    /// The change ids enqueued in a pipeline, in queue-processing order.
    #[cfg(test)]
    pub(crate) async fn enqueued_changes(&self, tenant: &str, pipeline: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .abide
            .tenants
            .get(tenant)
            .and_then(|t| t.layout.pipelines.get(pipeline))
            .map(|p| p.all_items().map(|i| i.change.id()).collect())
            .unwrap_or_default()
    }

    /// One drain-and-process sweep, holding the run-handler lock.
    async fn run_once(&self, state: &mut SchedulerState) -> Result<(), SchedulerError> {
        while let Some(event) = self.bus.pop_management() {
            let result = self.process_management(state, event.op).await;
            if let Err(err) = &result {
                error!("error processing management event: {}", err);
            }
            let _ = event.done.send(result);
        }

        // Result events take priority over trigger events: results let us
        // stop builds, whereas trigger events make us launch them.
        while let Some(event) = self.bus.pop_result() {
            if let Err(err) = self.process_result(state, event).await {
                error!("error processing result event: {}", err);
                self.bus.wake_up();
            }
        }

        if !self.bus.paused() {
            while let Some(event) = self.bus.pop_trigger() {
                self.stats.incr(&format!("event.{}", event.kind));
                if let Err(err) = self.process_trigger(state, &event).await {
                    error!("error processing trigger event: {}", err);
                    self.bus.wake_up();
                }
            }
        }

        if self.bus.paused() && self.bus.exiting() && self.all_builds_complete(state) {
            debug!("exiting");
            let events = self.bus.drain_trigger();
            debug!("saving queue, length is {}", events.len());
            self.snapshot.save(&events)?;
            self.bus.mark_stopped();
            return Ok(());
        }

        self.process_pipelines(state).await
    }

    async fn process_pipelines(
        &self,
        state: &mut SchedulerState,
    ) -> Result<(), SchedulerError> {
        let tenant_names: Vec<String> = state.abide.tenants.keys().cloned().collect();
        for tenant_name in tenant_names {
            let pipeline_names: Vec<String> = match state.abide.tenants.get(&tenant_name) {
                Some(tenant) => tenant.layout.pipelines.keys().cloned().collect(),
                None => continue,
            };
            for pipeline_name in pipeline_names {
                loop {
                    let holder_states = mutex_holder_states(&state.abide, &state.mutexes);
                    let Some(tenant) = state.abide.tenants.get_mut(&tenant_name) else {
                        break;
                    };
                    let (pipelines, config) = tenant.layout.split_mut();
                    let Some(pipeline) = pipelines.get_mut(&pipeline_name) else {
                        break;
                    };
                    let mut ctx = ManagerCtx {
                        tenant: &tenant_name,
                        pipeline,
                        config,
                        connections: &self.connections,
                        merger: &self.merger,
                        executor: &self.executor,
                        nodepool: &self.nodepool,
                        mutexes: &mut state.mutexes,
                        holder_states: &holder_states,
                    };
                    if !ctx.process_queue().await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_trigger(
        &self,
        state: &mut SchedulerState,
        event: &TriggerEvent,
    ) -> Result<(), SchedulerError> {
        debug!("processing trigger event {}", event.change_key());
        let tenant_names: Vec<String> = state.abide.tenants.keys().cloned().collect();
        for tenant_name in tenant_names {
            let mut reconfigured_tenant = false;
            let pipeline_names: Vec<String> = match state.abide.tenants.get(&tenant_name) {
                Some(tenant) => tenant.layout.pipelines.keys().cloned().collect(),
                None => continue,
            };
            for pipeline_name in pipeline_names {
                if let Err(err) = self
                    .process_trigger_for_pipeline(
                        state,
                        &tenant_name,
                        &pipeline_name,
                        event,
                        &mut reconfigured_tenant,
                    )
                    .await
                {
                    error!(
                        "error processing event in pipeline {}: {}",
                        pipeline_name, err,
                    );
                }
            }
        }
        Ok(())
    }

    async fn process_trigger_for_pipeline(
        &self,
        state: &mut SchedulerState,
        tenant_name: &str,
        pipeline_name: &str,
        event: &TriggerEvent,
        reconfigured_tenant: &mut bool,
    ) -> Result<(), SchedulerError> {
        let source_name = {
            let Some(tenant) = state.abide.tenants.get(tenant_name) else {
                return Ok(());
            };
            let Some(pipeline) = tenant.layout.pipelines.get(pipeline_name) else {
                return Ok(());
            };
            pipeline.source.clone()
        };
        let Some(source) = self.connections.get(&source_name).cloned() else {
            warn!("pipeline {} names unknown connection {}", pipeline_name, source_name);
            return Ok(());
        };

        // Fetch the change even if the project is unknown to us; another
        // enqueued change may depend on this foreign one.
        let change = match source.get_change(event).await {
            Ok(change) => change,
            Err(err) if err.is_not_found() => {
                debug!(
                    "unable to get change for {} from source {} (most likely a change \
                     from another connection)",
                    event.change_key(),
                    source_name,
                );
                return Ok(());
            },
            Err(err) => return Err(SchedulerError::source(err)),
        };

        if event.kind == TriggerEventKind::ChangeMerged && !*reconfigured_tenant {
            let updates_config = state
                .abide
                .tenants
                .get(tenant_name)
                .map(|t| t.layout.config.change_updates_config(&change))
                .unwrap_or(false);
            if updates_config {
                // The change that just landed updates the pipeline
                // configuration; rebuild the tenant once per event.
                info!(
                    "change {} updates the configuration of tenant {}",
                    change, tenant_name,
                );
                let _ = self.bus.submit(ManagementOp::TenantReconfigure {
                    tenant: tenant_name.into(),
                    triggering_change: Some(change.clone()),
                });
                *reconfigured_tenant = true;
            }
        }

        let holder_states = mutex_holder_states(&state.abide, &state.mutexes);
        let Some(tenant) = state.abide.tenants.get_mut(tenant_name) else {
            return Ok(());
        };
        let (pipelines, config) = tenant.layout.split_mut();
        let Some(pipeline) = pipelines.get_mut(pipeline_name) else {
            return Ok(());
        };
        let mut ctx = ManagerCtx {
            tenant: tenant_name,
            pipeline,
            config,
            connections: &self.connections,
            merger: &self.merger,
            executor: &self.executor,
            nodepool: &self.nodepool,
            mutexes: &mut state.mutexes,
            holder_states: &holder_states,
        };

        match event.kind {
            TriggerEventKind::PatchsetCreated => {
                ctx.remove_old_versions_of_change(&change).await?;
            },
            TriggerEventKind::ChangeAbandoned => {
                ctx.remove_abandoned_change(&change).await?;
            },
            _ => {},
        }
        if ctx.event_matches(event, &change) {
            ctx.add_change(change, AddOptions::default()).await?;
        }
        Ok(())
    }

    async fn process_result(
        &self,
        state: &mut SchedulerState,
        event: ResultEvent,
    ) -> Result<(), SchedulerError> {
        match event {
            ResultEvent::BuildStarted {
                uuid,
                start_time,
            } => self.do_build_started(state, uuid, start_time).await,
            ResultEvent::BuildCompleted {
                uuid,
                result,
                end_time,
            } => self.do_build_completed(state, uuid, result, end_time).await,
            ResultEvent::MergeCompleted(outcome) => {
                self.do_merge_completed(state, outcome).await
            },
            ResultEvent::NodesProvisioned(request) => {
                self.do_nodes_provisioned(state, request).await
            },
        }
    }

    async fn do_build_started(
        &self,
        state: &mut SchedulerState,
        uuid: Uuid,
        start_time: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let Some(location) = locate_build(&state.abide, uuid) else {
            warn!("build {} not found for start event", uuid);
            return Ok(());
        };
        if !location.current {
            warn!("build {} is not in the current build set", uuid);
            return Ok(());
        }
        let estimate = match state.time_db.estimated_time(&location.job_name) {
            Ok(estimate) => Some(estimate),
            Err(err) => {
                error!("exception estimating build time: {}", err);
                None
            },
        };
        if let Some(build) = locate_build_mut(&mut state.abide, &location) {
            build.start_time = Some(start_time);
            build.estimated_time = estimate;
        }
        self.with_pipeline_ctx(state, &location.tenant, &location.pipeline, |ctx| {
            ctx.on_build_started(location.item, &location.job_name);
        });
        Ok(())
    }

    async fn do_build_completed(
        &self,
        state: &mut SchedulerState,
        uuid: Uuid,
        result: BuildResult,
        end_time: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let Some(location) = locate_build(&state.abide, uuid) else {
            debug!("build {} not found for completion event", uuid);
            return Ok(());
        };

        // Regardless of any other condition, make sure the nodes go back
        // to the provisioner.
        let nodes = locate_item_mut(&mut state.abide, location.item)
            .and_then(|item| item.build_set_mut(location.build_set))
            .and_then(|bs| bs.take_node_set(&location.job_name));
        if let Some(nodes) = nodes {
            if let Err(err) = self.nodepool.return_node_set(nodes).await {
                error!("unable to return node set for build {}: {}", uuid, err);
            }
        }

        let mut duration = None;
        if let Some(build) = locate_build_mut(&mut state.abide, &location) {
            build.result = Some(result);
            build.end_time = Some(end_time);
            if let Some(start) = build.start_time {
                duration = Some((end_time - start).num_milliseconds().max(0));
            }
        }

        if !location.current {
            debug!("build {} is not in the current build set", uuid);
            return Ok(());
        }

        if let Some(ms) = duration {
            self.stats.timing(
                &format!(
                    "pipeline.{}.job.{}.{}",
                    location.pipeline, location.job_name, result,
                ),
                ms as u64,
            );
            if let Err(err) = state.time_db.update(
                &location.job_name,
                ms as f64 / 1000.0,
                &result.to_string(),
            ) {
                error!("exception recording build time: {}", err);
            }
        }

        let tenant = location.tenant.clone();
        let pipeline = location.pipeline.clone();
        let holder_states = mutex_holder_states(&state.abide, &state.mutexes);
        let Some(tenant_ref) = state.abide.tenants.get_mut(&tenant) else {
            return Ok(());
        };
        let (pipelines, config) = tenant_ref.layout.split_mut();
        let Some(pipeline_ref) = pipelines.get_mut(&pipeline) else {
            return Ok(());
        };
        let mut ctx = ManagerCtx {
            tenant: &tenant,
            pipeline: pipeline_ref,
            config,
            connections: &self.connections,
            merger: &self.merger,
            executor: &self.executor,
            nodepool: &self.nodepool,
            mutexes: &mut state.mutexes,
            holder_states: &holder_states,
        };
        ctx.on_build_completed(location.item, &location.job_name)
            .await
    }

    async fn do_merge_completed(
        &self,
        state: &mut SchedulerState,
        outcome: MergeOutcome,
    ) -> Result<(), SchedulerError> {
        let Some((tenant, pipeline)) = locate_item(&state.abide, outcome.item) else {
            debug!("merge completion for unknown item {}", outcome.item);
            return Ok(());
        };
        let current = state
            .abide
            .tenants
            .get(&tenant)
            .and_then(|t| t.layout.pipelines.get(&pipeline))
            .and_then(|p| p.find_item(outcome.item))
            .map(|item| item.current_build_set.uuid == outcome.build_set)
            .unwrap_or(false);
        if !current {
            warn!("build set {} is not current", outcome.build_set);
            return Ok(());
        }
        self.with_pipeline_ctx(state, &tenant, &pipeline, |ctx| {
            ctx.on_merge_completed(outcome.item, &outcome);
        });
        Ok(())
    }

    async fn do_nodes_provisioned(
        &self,
        state: &mut SchedulerState,
        mut request: NodeRequest,
    ) -> Result<(), SchedulerError> {
        self.nodepool.accept_nodes(&mut request);
        let current_location = locate_item(&state.abide, request.item)
            .filter(|(tenant, pipeline)| {
                state
                    .abide
                    .tenants
                    .get(tenant)
                    .and_then(|t| t.layout.pipelines.get(pipeline))
                    .and_then(|p| p.find_item(request.item))
                    .map(|item| item.current_build_set.uuid == request.build_set)
                    .unwrap_or(false)
            });
        let Some((tenant, pipeline)) = current_location else {
            warn!(
                "node request for build set {} is not current, returning nodes",
                request.build_set,
            );
            if request.fulfilled {
                if let Err(err) = self.nodepool.return_node_set(request.nodes.clone()).await {
                    error!("unable to return node set: {}", err);
                }
            }
            return Ok(());
        };
        self.with_pipeline_ctx(state, &tenant, &pipeline, |ctx| {
            ctx.on_nodes_provisioned(request.item, &request);
        });
        Ok(())
    }

    /// Run a synchronous manager operation against one pipeline.
    fn with_pipeline_ctx<F>(
        &self,
        state: &mut SchedulerState,
        tenant: &str,
        pipeline: &str,
        f: F,
    ) where
        F: FnOnce(&mut ManagerCtx),
    {
        let holder_states = mutex_holder_states(&state.abide, &state.mutexes);
        let Some(tenant_ref) = state.abide.tenants.get_mut(tenant) else {
            return;
        };
        let (pipelines, config) = tenant_ref.layout.split_mut();
        let Some(pipeline_ref) = pipelines.get_mut(pipeline) else {
            return;
        };
        let mut ctx = ManagerCtx {
            tenant,
            pipeline: pipeline_ref,
            config,
            connections: &self.connections,
            merger: &self.merger,
            executor: &self.executor,
            nodepool: &self.nodepool,
            mutexes: &mut state.mutexes,
            holder_states: &holder_states,
        };
        f(&mut ctx);
    }

    async fn process_management(
        &self,
        state: &mut SchedulerState,
        op: ManagementOp,
    ) -> Result<(), SchedulerError> {
        match op {
            ManagementOp::Reconfigure => self.do_reconfigure(state).await,
            ManagementOp::TenantReconfigure {
                tenant,
                triggering_change,
            } => {
                self.do_tenant_reconfigure(state, &tenant, triggering_change)
                    .await
            },
            ManagementOp::Promote {
                tenant,
                pipeline,
                change_ids,
            } => self.do_promote(state, &tenant, &pipeline, change_ids).await,
            ManagementOp::Enqueue {
                tenant,
                event,
            } => self.do_enqueue(state, &tenant, event).await,
        }
    }

    async fn do_reconfigure(&self, state: &mut SchedulerState) -> Result<(), SchedulerError> {
        let _layout = self.layout_lock.lock().await;
        info!("performing reconfiguration");
        let mut new_abide = config::load_tenant_config(&self.tenant_config)?;
        let old_abide = std::mem::take(&mut state.abide);
        for (tenant_name, old_tenant) in old_abide.tenants {
            match new_abide.tenants.get_mut(&tenant_name) {
                Some(new_tenant) => {
                    self.reenqueue_tenant(&mut state.mutexes, old_tenant, new_tenant)
                        .await;
                },
                None => {
                    warn!("tenant {} dropped by reconfiguration", tenant_name);
                    self.cancel_tenant(&mut state.mutexes, old_tenant).await;
                },
            }
        }
        state.abide = new_abide;
        state.last_reconfigured = Some(Utc::now());
        self.maintain_caches(state).await;
        Ok(())
    }

    async fn do_tenant_reconfigure(
        &self,
        state: &mut SchedulerState,
        tenant_name: &str,
        triggering_change: Option<Change>,
    ) -> Result<(), SchedulerError> {
        let _layout = self.layout_lock.lock().await;
        info!("performing tenant reconfiguration for {}", tenant_name);
        let loaded = match config::load_tenant_config(&self.tenant_config) {
            Ok(loaded) => loaded,
            Err(err) => {
                self.report_config_error(triggering_change.as_ref(), &err).await;
                return Err(err.into());
            },
        };
        let mut loaded = loaded;
        let Some(mut new_tenant) = loaded.tenants.shift_remove(tenant_name) else {
            warn!("tenant {} no longer configured", tenant_name);
            if let Some(old_tenant) = state.abide.tenants.shift_remove(tenant_name) {
                self.cancel_tenant(&mut state.mutexes, old_tenant).await;
            }
            return Ok(());
        };
        if let Some(old_tenant) = state.abide.tenants.shift_remove(tenant_name) {
            self.reenqueue_tenant(&mut state.mutexes, old_tenant, &mut new_tenant)
                .await;
        }
        state.abide.add_tenant(new_tenant);
        state.last_reconfigured = Some(Utc::now());
        self.maintain_caches(state).await;
        Ok(())
    }

    async fn report_config_error(&self, change: Option<&Change>, err: &ConfigError) {
        error!("reconfiguration failed, keeping the previous layout: {}", err);
        let Some(change) = change else {
            return;
        };
        let Some(connection) = self.connections.get(&change.project().connection) else {
            return;
        };
        let message = format!("Syntax error in pipeline configuration: {}", err);
        if let Err(report_err) = connection
            .report(change, ReportPhase::SyntaxError, &message)
            .await
        {
            error!("unable to report configuration error: {}", report_err);
        }
    }

    /// Move the items of an old tenant's pipelines onto the new tenant's
    /// pipelines, carrying builds over where the job still exists and
    /// cancelling everything else.
    async fn reenqueue_tenant(
        &self,
        mutexes: &mut MutexRegistry,
        old_tenant: Tenant,
        new_tenant: &mut Tenant,
    ) {
        let tenant_name = new_tenant.name.clone();
        let holder_states = HashMap::new();
        for (pipeline_name, old_pipeline) in old_tenant.layout.pipelines {
            if !new_tenant.layout.pipelines.contains_key(&pipeline_name) {
                warn!(
                    "no pipeline matching {} found when reconfiguring",
                    pipeline_name,
                );
                for mut queue in old_pipeline.queues {
                    while let Some(id) = queue.ids().first().copied() {
                        if let Some(item) = queue.dequeue(id) {
                            self.cancel_detached_item(mutexes, item).await;
                        }
                    }
                }
                continue;
            }
            debug!("re-enqueueing changes for pipeline {}", pipeline_name);
            for mut old_queue in old_pipeline.queues {
                let mut last_head = None;
                while let Some(id) = old_queue.ids().first().copied() {
                    let Some(mut item) = old_queue.dequeue(id) else {
                        break;
                    };
                    // Rebind the change's project to the new pipeline's
                    // source.
                    let source_name = new_tenant
                        .layout
                        .pipelines
                        .get(&pipeline_name)
                        .map(|p| p.source.clone());
                    if let Some(source) = source_name.and_then(|n| self.connections.get(&n)) {
                        match source.get_project(&item.change.project().name).await {
                            Ok(project) => item.change.set_project(project),
                            Err(err) => {
                                warn!(
                                    "unable to rebind project for item {}: {}",
                                    item.id, err,
                                );
                            },
                        }
                    }

                    let (pipelines, config) = new_tenant.layout.split_mut();
                    let pipeline = pipelines
                        .get_mut(&pipeline_name)
                        .expect("pipeline presence checked above");
                    let mut ctx = ManagerCtx {
                        tenant: &tenant_name,
                        pipeline,
                        config,
                        connections: &self.connections,
                        merger: &self.merger,
                        executor: &self.executor,
                        nodepool: &self.nodepool,
                        mutexes,
                        holder_states: &holder_states,
                    };
                    match ctx.re_enqueue_item(item, last_head) {
                        Ok(new_id) => {
                            if last_head.is_none() {
                                last_head = Some(new_id);
                            }
                            self.carry_over_builds(&mut ctx, new_id).await;
                        },
                        Err(item) => {
                            warn!(
                                "canceling item {} which no longer fits during \
                                 reconfiguration",
                                item.id,
                            );
                            self.cancel_detached_item(mutexes, item).await;
                        },
                    }
                }
            }
        }
    }

    /// After re-enqueueing an item onto a new layout, keep the builds
    /// whose jobs survived and cancel the rest.
    async fn carry_over_builds(&self, ctx: &mut ManagerCtx<'_>, id: ItemId) {
        let Some(item) = ctx.pipeline.find_item(id) else {
            return;
        };
        let surviving: Vec<String> = item.job_tree.names();
        let stale: Vec<(String, Uuid, bool)> = item
            .current_build_set
            .builds()
            .filter(|b| !surviving.contains(&b.job_name))
            .map(|b| (b.job_name.clone(), b.uuid, b.result.is_none()))
            .collect();
        for (job_name, uuid, running) in stale {
            warn!("canceling build {} during reconfiguration", uuid);
            if running {
                if let Err(err) = self.executor.cancel(uuid).await {
                    error!("exception while canceling build {}: {}", uuid, err);
                }
            }
            ctx.mutexes.release_holder(id, &job_name);
            let nodes = ctx
                .pipeline
                .find_item_mut(id)
                .and_then(|item| item.current_build_set.take_node_set(&job_name));
            if let Some(nodes) = nodes {
                if let Err(err) = self.nodepool.return_node_set(nodes).await {
                    error!("unable to return node set: {}", err);
                }
            }
            if let Some(item) = ctx.pipeline.find_item_mut(id) {
                item.current_build_set.remove_build(&job_name);
            }
        }
    }

    /// Cancel the builds of an item which is leaving the system entirely.
    async fn cancel_detached_item(&self, mutexes: &mut MutexRegistry, mut item: QueueItem) {
        let running: Vec<(String, Uuid)> = item
            .current_build_set
            .builds()
            .filter(|b| b.result.is_none() && !b.canceled)
            .map(|b| (b.job_name.clone(), b.uuid))
            .collect();
        for (job_name, uuid) in running {
            warn!("canceling build {} during reconfiguration", uuid);
            if let Err(err) = self.executor.cancel(uuid).await {
                error!("exception while canceling build {}: {}", uuid, err);
            }
            mutexes.release_holder(item.id, &job_name);
        }
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

    async fn cancel_tenant(&self, mutexes: &mut MutexRegistry, tenant: Tenant) {
        for (_, pipeline) in tenant.layout.pipelines {
            for mut queue in pipeline.queues {
                while let Some(id) = queue.ids().first().copied() {
                    if let Some(item) = queue.dequeue(id) {
                        self.cancel_detached_item(mutexes, item).await;
                    }
                }
            }
        }
    }

    async fn do_promote(
        &self,
        state: &mut SchedulerState,
        tenant_name: &str,
        pipeline_name: &str,
        change_ids: Vec<String>,
    ) -> Result<(), SchedulerError> {
        let holder_states = mutex_holder_states(&state.abide, &state.mutexes);
        let Some(tenant) = state.abide.tenants.get_mut(tenant_name) else {
            return Err(SchedulerError::UnknownTenant {
                tenant: tenant_name.into(),
            });
        };
        let (pipelines, config) = tenant.layout.split_mut();
        let Some(pipeline) = pipelines.get_mut(pipeline_name) else {
            return Err(SchedulerError::UnknownPipeline {
                pipeline: pipeline_name.into(),
            });
        };
        let mut ctx = ManagerCtx {
            tenant: tenant_name,
            pipeline,
            config,
            connections: &self.connections,
            merger: &self.merger,
            executor: &self.executor,
            nodepool: &self.nodepool,
            mutexes: &mut state.mutexes,
            holder_states: &holder_states,
        };
        ctx.promote(&change_ids).await
    }

    async fn do_enqueue(
        &self,
        state: &mut SchedulerState,
        tenant_name: &str,
        event: TriggerEvent,
    ) -> Result<(), SchedulerError> {
        let Some(pipeline_name) = event.forced_pipeline.clone() else {
            return Err(SchedulerError::internal(
                "enqueue event names no pipeline",
            ));
        };
        let source_name = {
            let Some(tenant) = state.abide.tenants.get(tenant_name) else {
                return Err(SchedulerError::UnknownTenant {
                    tenant: tenant_name.into(),
                });
            };
            let Some(pipeline) = tenant.layout.pipelines.get(&pipeline_name) else {
                return Err(SchedulerError::UnknownPipeline {
                    pipeline: pipeline_name.clone(),
                });
            };
            pipeline.source.clone()
        };
        let Some(source) = self.connections.get(&source_name).cloned() else {
            return Err(SchedulerError::UnknownConnection {
                connection: source_name,
            });
        };
        let change = source
            .get_change(&event)
            .await
            .map_err(SchedulerError::source)?;
        debug!(
            "event for change {} was directly assigned to pipeline {}",
            change, pipeline_name,
        );

        let holder_states = mutex_holder_states(&state.abide, &state.mutexes);
        let Some(tenant) = state.abide.tenants.get_mut(tenant_name) else {
            return Ok(());
        };
        let (pipelines, config) = tenant.layout.split_mut();
        let Some(pipeline) = pipelines.get_mut(&pipeline_name) else {
            return Ok(());
        };
        let mut ctx = ManagerCtx {
            tenant: tenant_name,
            pipeline,
            config,
            connections: &self.connections,
            merger: &self.merger,
            executor: &self.executor,
            nodepool: &self.nodepool,
            mutexes: &mut state.mutexes,
            holder_states: &holder_states,
        };
        let opts = AddOptions {
            ignore_requirements: true,
            ..AddOptions::default()
        };
        ctx.add_change(change, opts).await?;
        Ok(())
    }

    /// Drop cached changes which are no longer enqueued anywhere.
    async fn maintain_caches(&self, state: &SchedulerState) {
        let mut relevant = Vec::new();
        for tenant in state.abide.tenants.values() {
            for pipeline in tenant.layout.pipelines.values() {
                for item in pipeline.all_items() {
                    relevant.push(item.change.id());
                }
            }
        }
        for connection in self.connections.values() {
            connection.maintain_cache(&relevant).await;
        }
        debug!("connection cache size: {}", relevant.len());
    }

    fn all_builds_complete(&self, state: &SchedulerState) -> bool {
        debug!("checking if all builds are complete");
        if self.merger.merges_outstanding() {
            debug!("waiting on merger");
            return false;
        }
        for tenant in state.abide.tenants.values() {
            for pipeline in tenant.layout.pipelines.values() {
                for item in pipeline.all_items() {
                    for build in item.current_build_set.builds() {
                        if build.result.is_none() {
                            debug!("{} waiting on {}", pipeline.name, build.uuid);
                            return false;
                        }
                    }
                }
            }
        }
        debug!("all builds are complete");
        true
    }

    /// Render the current state of a tenant as JSON.
    ///
    /// Takes the run-handler lock, so the snapshot is consistent with a
    /// sweep boundary.
    pub async fn format_status(&self, tenant_name: &str) -> Result<String, SchedulerError> {
        let state = self.state.lock().await;
        let Some(tenant) = state.abide.tenants.get(tenant_name) else {
            return Err(SchedulerError::UnknownTenant {
                tenant: tenant_name.into(),
            });
        };
        let mut data = json!({
            "trigger_event_queue": { "length": self.bus.trigger_queue_len() },
            "result_event_queue": { "length": self.bus.result_queue_len() },
        });
        if self.bus.paused() {
            let mut message = String::from("Queue only mode: preparing to ");
            if self.bus.exiting() {
                message.push_str("exit");
            } else {
                message.push_str("pause");
            }
            data["message"] = json!(message);
        }
        if let Some(when) = state.last_reconfigured {
            data["last_reconfigured"] = json!(when.timestamp_millis());
        }
        let pipelines: Vec<_> = tenant
            .layout
            .pipelines
            .values()
            .map(|pipeline| {
                let queues: Vec<_> = pipeline
                    .queues
                    .iter()
                    .map(|queue| {
                        let items: Vec<_> = queue
                            .items()
                            .iter()
                            .map(|item| {
                                let builds: Vec<_> = item
                                    .current_build_set
                                    .builds()
                                    .map(|build| {
                                        json!({
                                            "job": build.job_name,
                                            "uuid": build.uuid.to_string(),
                                            "result": build.result.map(|r| r.to_string()),
                                            "estimated_time": build.estimated_time,
                                        })
                                    })
                                    .collect();
                                json!({
                                    "change": item.change.id(),
                                    "live": item.live,
                                    "enqueue_time": item.enqueue_time.timestamp_millis(),
                                    "builds": builds,
                                })
                            })
                            .collect();
                        json!({
                            "name": queue.name,
                            "items": items,
                        })
                    })
                    .collect();
                json!({
                    "name": pipeline.name,
                    "queues": queues,
                })
            })
            .collect();
        data["pipelines"] = json!(pipelines);
        Ok(data.to_string())
    }
}

fn mutex_holder_states(
    abide: &Abide,
    mutexes: &MutexRegistry,
) -> HashMap<String, HolderState> {
    let mut states = HashMap::new();
    for name in mutexes.held() {
        let Some((item_id, job_name)) = mutexes.holder(name) else {
            continue;
        };
        let state = find_item(abide, *item_id)
            .and_then(|item| item.current_build_set.get_build(job_name))
            .map(|build| {
                if build.result.is_none() {
                    HolderState::Running
                } else {
                    HolderState::Terminal
                }
            })
            .unwrap_or(HolderState::Terminal);
        states.insert(name.to_string(), state);
    }
    states
}

fn find_item(abide: &Abide, id: ItemId) -> Option<&QueueItem> {
    abide
        .tenants
        .values()
        .flat_map(|t| t.layout.pipelines.values())
        .find_map(|p| p.find_item(id))
}

fn locate_item(abide: &Abide, id: ItemId) -> Option<(String, String)> {
    for (tenant_name, tenant) in &abide.tenants {
        for (pipeline_name, pipeline) in &tenant.layout.pipelines {
            if pipeline.find_item(id).is_some() {
                return Some((tenant_name.clone(), pipeline_name.clone()));
            }
        }
    }
    None
}

fn locate_item_mut(abide: &mut Abide, id: ItemId) -> Option<&mut QueueItem> {
    abide
        .tenants
        .values_mut()
        .flat_map(|t| t.layout.pipelines.values_mut())
        .find_map(|p| p.find_item_mut(id))
}

fn locate_build(abide: &Abide, uuid: Uuid) -> Option<BuildLocation> {
    for (tenant_name, tenant) in &abide.tenants {
        for (pipeline_name, pipeline) in &tenant.layout.pipelines {
            for item in pipeline.all_items() {
                if let Some(build) = item.current_build_set.build_by_uuid(uuid) {
                    return Some(BuildLocation {
                        tenant: tenant_name.clone(),
                        pipeline: pipeline_name.clone(),
                        item: item.id,
                        build_set: item.current_build_set.uuid,
                        job_name: build.job_name.clone(),
                        current: true,
                    });
                }
                for build_set in &item.previous_build_sets {
                    if let Some(build) = build_set.build_by_uuid(uuid) {
                        return Some(BuildLocation {
                            tenant: tenant_name.clone(),
                            pipeline: pipeline_name.clone(),
                            item: item.id,
                            build_set: build_set.uuid,
                            job_name: build.job_name.clone(),
                            current: false,
                        });
                    }
                }
            }
        }
    }
    None
}

fn locate_build_mut<'a>(
    abide: &'a mut Abide,
    location: &BuildLocation,
) -> Option<&'a mut Build> {
    locate_item_mut(abide, location.item)
        .and_then(|item| item.build_set_mut(location.build_set))
        .and_then(|bs| bs.get_build_mut(&location.job_name))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use ci_conductor_core::data::{BuildResult, TriggerEvent, TriggerEventKind};
    use ci_conductor_source::ReportPhase;

    use crate::events::ManagementOp;
    use crate::scheduler::SchedulerError;
    use crate::test::Harness;

    const STATUS_LAYOUT: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: check
        manager: independent
        source: github
        trigger:
          - event: [comment-added]
            comment: ["test me"]
        require:
          status: ["conductor:check:success"]
        success:
          - connection: github
            action: comment
        failure:
          - connection: github
            action: comment
        merge-failure:
          - connection: github
            action: comment
    projects:
      - name: org/project1
        pipelines:
          check: { jobs: [project1-pipeline] }
    jobs:
      - name: project1-pipeline
        labels: [small]
"#;

    const APPROVAL_LAYOUT: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: check
        manager: independent
        source: github
        trigger:
          - event: [comment-added]
            comment: ["test me"]
        require:
          approval:
            - username: derp
              value: 2
        success:
          - connection: github
            action: comment
        failure:
          - connection: github
            action: comment
    projects:
      - name: org/project5
        pipelines:
          check: { jobs: [project5-reviewuserstate] }
    jobs:
      - name: project5-reviewuserstate
"#;

    const GATE_LAYOUT: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: gate
        manager: dependent
        source: github
        trigger:
          - event: [comment-added]
            comment: ["gate me"]
        success:
          - connection: github
            action: comment
          - connection: github
            action: merge
        failure:
          - connection: github
            action: comment
        merge-failure:
          - connection: github
            action: comment
    projects:
      - name: org/project1
        queue: integrated
        pipelines:
          gate: { jobs: [project1-test] }
      - name: org/project2
        queue: integrated
        pipelines:
          gate: { jobs: [project2-test] }
    jobs:
      - name: project1-test
      - name: project2-test
"#;

    fn assert_nodes_balanced(harness: &Harness) {
        assert_eq!(harness.nodepool.allocated(), harness.nodepool.returned());
    }

    #[tokio::test]
    async fn test_status_gated_enqueue() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        let comment = harness.github.comment_event("org/project1", 1, "test me");

        // No status from us yet, so nothing runs.
        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        // An error status does not satisfy the requirement.
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "error");
        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        // A success status does.
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness.emit(comment).await;
        let history = harness.executor.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job_name, "project1-pipeline");
        assert_eq!(history[0].change_number, Some(1));
        assert_eq!(history[0].patchset.as_deref(), Some("aaaa"));
        assert_eq!(history[0].result, BuildResult::Success);

        let reports = harness.github.reports();
        assert!(reports
            .iter()
            .any(|(change, phase, _)| change == "1,aaaa" && *phase == ReportPhase::Success));
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_approval_requires_write_permission_and_user() {
        let harness = Harness::new(APPROVAL_LAYOUT).await;
        harness.github.add_writer("org/project5", "derp");
        harness.github.open_pull_request("org/project5", 1, "aaaa");
        let comment = harness.github.comment_event("org/project5", 1, "test me");

        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        // Changes requested by derp blocks it.
        harness
            .github
            .add_review("org/project5", 1, "derp", "CHANGES_REQUESTED", Utc::now());
        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        // An approval from a non-writer only counts +1.
        harness
            .github
            .add_review("org/project5", 1, "nobody", "APPROVED", Utc::now());
        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        // herp is not a writer either, and is the wrong user anyway.
        harness
            .github
            .add_review("org/project5", 1, "herp", "APPROVED", Utc::now());
        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        // An approval from derp carries +2 and satisfies the requirement.
        harness
            .github
            .add_review("org/project5", 1, "derp", "APPROVED", Utc::now());
        harness.emit(comment).await;
        let history = harness.executor.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job_name, "project5-reviewuserstate");
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_latest_review_per_user_governs() {
        let harness = Harness::new(APPROVAL_LAYOUT).await;
        harness.github.add_writer("org/project5", "derp");
        harness.github.open_pull_request("org/project5", 1, "aaaa");
        let comment = harness.github.comment_event("org/project5", 1, "test me");

        for i in 1..4 {
            harness.github.add_review(
                "org/project5",
                1,
                "derp",
                "CHANGES_REQUESTED",
                Utc::now() - Duration::hours(72) + Duration::minutes(i),
            );
            harness.emit(comment.clone()).await;
            assert!(harness.executor.history().is_empty());
        }

        harness
            .github
            .add_review("org/project5", 1, "derp", "APPROVED", Utc::now());
        harness.emit(comment).await;
        assert_eq!(harness.executor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_approval_newer_than_window() {
        let layout = APPROVAL_LAYOUT.replace(
            "              value: 2\n",
            "              value: 2\n              newer-than-hours: 24\n",
        );
        let harness = Harness::new(&layout).await;
        harness.github.add_writer("org/project5", "derp");
        harness.github.open_pull_request("org/project5", 1, "aaaa");
        let comment = harness.github.comment_event("org/project5", 1, "test me");

        harness.github.add_review(
            "org/project5",
            1,
            "derp",
            "APPROVED",
            Utc::now() - Duration::hours(72),
        );
        harness.emit(comment.clone()).await;
        assert!(harness.executor.history().is_empty());

        harness.github.add_review(
            "org/project5",
            1,
            "derp",
            "APPROVED",
            Utc::now() - Duration::hours(12),
        );
        harness.emit(comment).await;
        assert_eq!(harness.executor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_cross_project_dependency_is_tested_ahead() {
        const LAYOUT: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: check
        manager: independent
        source: github
        trigger:
          - event: [patchset-created]
        success:
          - connection: github
            action: comment
        failure:
          - connection: github
            action: comment
    projects:
      - name: org/projecta
        pipelines:
          check: { jobs: [project-test2] }
      - name: org/projectb
        pipelines:
          check: { jobs: [projectb-test] }
    jobs:
      - name: project-test2
      - name: projectb-test
"#;
        let harness = Harness::new(LAYOUT).await;
        let event_a = harness.github.open_pull_request("org/projecta", 1, "asha");
        harness.emit(event_a).await;

        let event_b = harness.github.open_pull_request("org/projectb", 2, "bsha");
        harness.github.set_message(
            "org/projectb",
            2,
            "Add feature.\n\nDepends-On: https://github.example.com/org/projecta/pull/1",
        );
        harness.emit(event_b).await;

        // A was tested alone, then B with A ahead; both succeed.
        let history = harness.executor.history();
        let jobs: Vec<_> = history.iter().map(|b| b.job_name.clone()).collect();
        assert_eq!(jobs, ["project-test2", "projectb-test"]);
        assert!(history.iter().all(|b| b.result == BuildResult::Success));

        // B's merge was computed with A's refspec ahead of it.
        let requests = harness.executor.requests();
        let b_request = requests.iter().find(|r| r.job.name == "projectb-test").unwrap();
        assert!(b_request.merge_commit.is_some());

        assert!(harness
            .scheduler
            .enqueued_changes("example", "check")
            .await
            .is_empty());
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_retryable_results_hit_the_attempt_limit() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness.executor.script_results(
            "project1-pipeline",
            vec![
                BuildResult::Aborted,
                BuildResult::Aborted,
                BuildResult::Aborted,
            ],
        );
        let comment = harness.github.comment_event("org/project1", 1, "test me");
        harness.emit(comment).await;

        // Three attempts, then the retry limit is surfaced to the report.
        let history = harness.executor.history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|b| b.result == BuildResult::Aborted));
        let reports = harness.github.reports();
        let (_, phase, message) = reports.last().unwrap();
        assert_eq!(*phase, ReportPhase::Failure);
        assert!(message.contains("RETRY_LIMIT"), "message: {}", message);
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_snapshot() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        let comment = harness.github.comment_event("org/project1", 1, "test me");

        harness.emit(comment.clone()).await;
        harness.emit(comment).await;
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "check").await,
            ["1,aaaa"],
        );
        assert_eq!(harness.executor.held().len(), 1);

        harness.executor.release(None);
        harness.settle().await;
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_new_patchset_replaces_old_item() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;
        assert_eq!(harness.executor.held().len(), 1);

        // A new snapshot purges the old one from the queue; its build is
        // cancelled, and the late aborted completion changes nothing.
        let updated = harness.github.push_new_patchset("org/project1", 1, "bbbb");
        harness.emit(updated).await;
        assert!(harness
            .scheduler
            .enqueued_changes("example", "check")
            .await
            .is_empty());
        assert_eq!(harness.executor.canceled().len(), 1);
        assert!(harness.executor.held().is_empty());

        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "check").await,
            ["1,bbbb"],
        );
        let held = harness.executor.held();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].patchset.as_deref(), Some("bbbb"));

        harness.executor.release(None);
        harness.settle().await;
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_abandoned_change_is_removed() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.executor.set_hold(true);
        let opened = harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness.emit(opened).await;
        assert_eq!(harness.executor.held().len(), 1);

        let abandoned = harness.github.abandoned_event("org/project1", 1);
        harness.emit(abandoned).await;
        assert!(harness
            .scheduler
            .enqueued_changes("example", "check")
            .await
            .is_empty());
        assert_eq!(harness.executor.canceled().len(), 1);
        harness.settle().await;
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_merge_failure_reports_and_dequeues() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.merger.fail_project("org/project1");
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        let comment = harness.github.comment_event("org/project1", 1, "test me");
        harness.emit(comment).await;

        assert!(harness.executor.history().is_empty());
        assert!(harness
            .scheduler
            .enqueued_changes("example", "check")
            .await
            .is_empty());
        let reports = harness.github.reports();
        assert!(reports
            .iter()
            .any(|(_, phase, _)| *phase == ReportPhase::MergeFailure));
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_dependent_failure_resets_items_behind() {
        let harness = Harness::new(GATE_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "asha");
        harness.github.open_pull_request("org/project2", 2, "bsha");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "gate me"))
            .await;
        harness
            .emit(harness.github.comment_event("org/project2", 2, "gate me"))
            .await;
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "gate").await,
            ["1,asha", "2,bsha"],
        );
        assert_eq!(harness.executor.held().len(), 2);

        // The head fails: it is reported and dequeued, and the item
        // behind is reset and rebuilt against the new head of the branch.
        harness
            .executor
            .release_with("project1-test", BuildResult::Failure);
        harness.settle().await;
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "gate").await,
            ["2,bsha"],
        );

        harness.executor.release(None);
        harness.settle().await;
        assert!(harness
            .scheduler
            .enqueued_changes("example", "gate")
            .await
            .is_empty());

        let reports = harness.github.reports();
        assert!(reports
            .iter()
            .any(|(change, phase, _)| change == "1,asha" && *phase == ReportPhase::Failure));
        assert!(reports
            .iter()
            .any(|(change, phase, _)| change == "2,bsha" && *phase == ReportPhase::Success));
        // Only the surviving change was merged.
        assert_eq!(harness.github.merged(), ["2,bsha"]);
        assert!(harness.scheduler.held_mutexes().await.is_empty());
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_dependent_change_pulls_dependents_in_behind() {
        let harness = Harness::new(GATE_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "asha");
        harness.github.open_pull_request("org/project2", 2, "bsha");
        harness.github.set_message(
            "org/project2",
            2,
            "Depends-On: https://github.example.com/org/project1/pull/1",
        );

        // Only the dependency gets an event; the change depending on it is
        // pulled into the queue behind it.
        harness
            .emit(harness.github.comment_event("org/project1", 1, "gate me"))
            .await;
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "gate").await,
            ["1,asha", "2,bsha"],
        );
        assert_eq!(harness.executor.held().len(), 2);

        harness.executor.release(None);
        harness.settle().await;
        while !harness.executor.held().is_empty() {
            harness.executor.release(None);
            harness.settle().await;
        }
        assert!(harness
            .scheduler
            .enqueued_changes("example", "gate")
            .await
            .is_empty());
        assert_eq!(harness.github.merged(), ["1,asha", "2,bsha"]);
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_dependent_pipeline_requires_mergeable() {
        let harness = Harness::new(GATE_LAYOUT).await;
        harness.github.open_pull_request("org/project1", 1, "asha");
        harness.github.set_mergeable(false);
        harness
            .emit(harness.github.comment_event("org/project1", 1, "gate me"))
            .await;
        assert!(harness
            .scheduler
            .enqueued_changes("example", "gate")
            .await
            .is_empty());

        harness.github.set_mergeable(true);
        harness
            .emit(harness.github.comment_event("org/project1", 1, "gate me"))
            .await;
        assert_eq!(harness.executor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_promote_reorders_and_resets_displaced_items() {
        let harness = Harness::new(GATE_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "asha");
        harness.github.open_pull_request("org/project1", 2, "bsha");
        harness.github.open_pull_request("org/project2", 3, "csha");
        for (project, number) in [("org/project1", 1), ("org/project1", 2), ("org/project2", 3)]
        {
            harness
                .emit(harness.github.comment_event(project, number, "gate me"))
                .await;
        }
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "gate").await,
            ["1,asha", "2,bsha", "3,csha"],
        );

        // Promoting an id that is not enqueued is an error.
        let err = harness
            .promote("example", "gate", vec!["9,nope".into()])
            .await
            .unwrap_err();
        if let SchedulerError::ChangeNotInQueue {
            change,
        } = err
        {
            assert_eq!(change, "9,nope");
        } else {
            panic!("unexpected error: {:?}", err);
        }

        harness
            .promote("example", "gate", vec!["3,csha".into()])
            .await
            .unwrap();
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "gate").await,
            ["3,csha", "1,asha", "2,bsha"],
        );
        // Everything changed ancestry, so everything was reset.
        let canceled_after_first = harness.executor.canceled().len();
        assert_eq!(canceled_after_first, 3);

        // A promote that does not change the order changes nothing.
        harness
            .promote("example", "gate", vec!["3,csha".into()])
            .await
            .unwrap();
        assert_eq!(harness.executor.canceled().len(), canceled_after_first);

        harness.executor.release(None);
        harness.settle().await;
        // Relaunched builds may interleave, so just check balance.
        while !harness.executor.held().is_empty() {
            harness.executor.release(None);
            harness.settle().await;
        }
        assert!(harness
            .scheduler
            .enqueued_changes("example", "gate")
            .await
            .is_empty());
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_mutex_serialises_jobs_across_queues() {
        const LAYOUT: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: check
        manager: independent
        source: github
        trigger:
          - event: [patchset-created]
    projects:
      - name: org/p1
        pipelines:
          check: { jobs: [mutex-one] }
      - name: org/p2
        pipelines:
          check: { jobs: [mutex-two] }
    jobs:
      - name: mutex-one
        mutex: shared
      - name: mutex-two
        mutex: shared
"#;
        let harness = Harness::new(LAYOUT).await;
        harness.executor.set_hold(true);
        let first = harness.github.open_pull_request("org/p1", 1, "aaaa");
        let second = harness.github.open_pull_request("org/p2", 2, "bbbb");
        harness.emit(first).await;
        harness.emit(second).await;

        // Only one of the two mutex-bearing jobs may run.
        assert_eq!(harness.executor.held().len(), 1);
        assert_eq!(harness.scheduler.held_mutexes().await, ["shared"]);

        harness.executor.release(None);
        harness.settle().await;
        assert_eq!(harness.executor.held().len(), 1);
        harness.executor.release(None);
        harness.settle().await;

        assert!(harness.scheduler.held_mutexes().await.is_empty());
        assert_eq!(harness.executor.history().len(), 2);
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_reconfigure_carries_surviving_builds() {
        const BEFORE: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: check
        manager: independent
        source: github
        trigger:
          - event: [patchset-created]
        success:
          - connection: github
            action: comment
        failure:
          - connection: github
            action: comment
    projects:
      - name: org/project1
        pipelines:
          check: { jobs: [keep-job, drop-job] }
    jobs:
      - name: keep-job
      - name: drop-job
"#;
        let harness = Harness::new(BEFORE).await;
        harness.executor.set_hold(true);
        let opened = harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness.emit(opened).await;
        assert_eq!(harness.executor.held().len(), 2);

        let after = BEFORE.replace("jobs: [keep-job, drop-job]", "jobs: [keep-job]");
        harness.write_tenants(&after);
        harness.reconfigure().await;

        // The build whose job survived was carried over; the other was
        // cancelled exactly once.
        let held = harness.executor.held();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].job.name, "keep-job");
        assert_eq!(harness.executor.canceled().len(), 1);
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "check").await,
            ["1,aaaa"],
        );

        harness.executor.release(None);
        harness.settle().await;
        let reports = harness.github.reports();
        assert!(reports
            .iter()
            .any(|(change, phase, _)| change == "1,aaaa" && *phase == ReportPhase::Success));
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_reconfigure_syntax_error_keeps_previous_layout() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;
        assert_eq!(harness.executor.held().len(), 1);

        harness.write_tenants("tenants: [ {name: ");
        let err = harness.try_reconfigure().await.unwrap_err();
        if let SchedulerError::Config(_) = err {
        } else {
            panic!("unexpected error: {:?}", err);
        }

        // The previous layout is retained and the work in flight is
        // untouched.
        assert_eq!(
            harness.scheduler.enqueued_changes("example", "check").await,
            ["1,aaaa"],
        );
        assert_eq!(harness.executor.held().len(), 1);

        // A tenant reconfiguration triggered by an in-repo config change
        // reports the syntax error back on that change.
        let change = harness.github.change("org/project1", 1).unwrap();
        let rx = harness
            .scheduler
            .handle()
            .submit(ManagementOp::TenantReconfigure {
                tenant: "example".into(),
                triggering_change: Some(change),
            });
        harness.settle().await;
        rx.await.unwrap().unwrap_err();
        let reports = harness.github.reports();
        assert!(reports
            .iter()
            .any(|(_, phase, message)| *phase == ReportPhase::SyntaxError
                && message.contains("Syntax error")));

        harness.executor.release(None);
        harness.settle().await;
    }

    #[tokio::test]
    async fn test_merged_config_change_schedules_tenant_reconfigure() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        let before = harness.scheduler.last_reconfigured().await;
        harness.github.open_pull_request("org/project1", 7, "cafe");
        harness.github.set_files(
            "org/project1",
            7,
            vec!["src/lib.rs".into(), ".conductor.yaml".into()],
        );
        let merged = harness.github.merged_event("org/project1", 7);
        harness.emit(merged).await;
        let after = harness.scheduler.last_reconfigured().await;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_exit_snapshots_pending_triggers_and_resume_restores() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;
        assert_eq!(harness.executor.held().len(), 1);

        harness.scheduler.exit();
        // A trigger event arriving after the pause stays queued.
        harness.github.open_pull_request("org/project1", 2, "bbbb");
        harness
            .scheduler
            .handle()
            .add_trigger_event(harness.github.comment_event("org/project1", 2, "test me"));
        harness.settle().await;
        assert!(!harness.scheduler.handle().stopped());

        // Once the in-flight build completes, the loop saves the queue
        // and terminates.
        harness.executor.release(None);
        harness.settle().await;
        assert!(harness.scheduler.handle().stopped());
        let snapshot = harness.dir.path().join("state").join("queue.json");
        assert!(snapshot.exists());

        // A restarted scheduler resumes the saved events and deletes the
        // snapshot.
        let harness = harness.rebuild(STATUS_LAYOUT);
        harness.scheduler.resume().unwrap();
        assert_eq!(harness.scheduler.handle().trigger_queue_len(), 1);
        assert!(!snapshot.exists());
    }

    #[tokio::test]
    async fn test_operator_enqueue_bypasses_requirements() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        // No status is set, so a trigger event would be refused; the
        // operator enqueue goes in anyway.
        let mut event = harness.github.comment_event("org/project1", 1, "test me");
        event.forced_pipeline = Some("check".into());
        let rx = harness.scheduler.handle().submit(ManagementOp::Enqueue {
            tenant: "example".into(),
            event,
        });
        harness.settle().await;
        rx.await.unwrap().unwrap();
        assert_eq!(harness.executor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_ref_updated_triggers_post_pipeline() {
        const LAYOUT: &str = r#"
tenants:
  - name: example
    pipelines:
      - name: post
        manager: independent
        source: github
        trigger:
          - event: [ref-updated]
            ref: ["^refs/heads/.*$"]
    projects:
      - name: org/project1
        pipelines:
          post: { jobs: [publish-job] }
    jobs:
      - name: publish-job
"#;
        let harness = Harness::new(LAYOUT).await;
        let event = TriggerEvent::builder()
            .kind(TriggerEventKind::RefUpdated)
            .connection("github")
            .project_name("org/project1")
            .ref_name("refs/heads/master")
            .oldrev("0000000000000000000000000000000000000000")
            .newrev("1111111111111111111111111111111111111111")
            .build()
            .unwrap();
        harness.emit(event).await;
        let history = harness.executor.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job_name, "publish-job");
        assert_eq!(history[0].change_number, None);
        assert_nodes_balanced(&harness);
    }

    #[tokio::test]
    async fn test_time_database_records_successful_durations() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;
        assert_eq!(harness.executor.history().len(), 1);
        let record = harness
            .dir
            .path()
            .join("state")
            .join("times")
            .join("project1-pipeline.json");
        assert!(record.exists());
    }

    #[tokio::test]
    async fn test_format_status_reflects_enqueued_work() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.executor.set_hold(true);
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "conductor", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;

        let status = harness.scheduler.format_status("example").await.unwrap();
        let data: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(data["pipelines"][0]["name"], "check");
        let items = &data["pipelines"][0]["queues"][0]["items"];
        assert_eq!(items[0]["change"], "1,aaaa");
        assert_eq!(items[0]["builds"][0]["job"], "project1-pipeline");

        harness.executor.release(None);
        harness.settle().await;
    }

    #[tokio::test]
    async fn test_status_from_unknown_user_is_recorded_but_never_matches() {
        let harness = Harness::new(STATUS_LAYOUT).await;
        harness.github.open_pull_request("org/project1", 1, "aaaa");
        harness
            .github
            .set_status("org/project1", 1, "Unknown", "check", "success");
        harness
            .emit(harness.github.comment_event("org/project1", 1, "test me"))
            .await;
        // The requirement names the conductor user, so the unknown-user
        // status satisfies nothing.
        assert!(harness.executor.history().is_empty());
    }
}
