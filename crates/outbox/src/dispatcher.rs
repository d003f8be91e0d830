//! Outbox dispatcher: the only writer of outbox and delivery state after
//! insert.
//!
//! Each worker repeats one batch at a time:
//!
//! 1. put abandoned IN_FLIGHT deliveries back to PENDING;
//! 2. claim up to `claim_batch` rows under a lease;
//! 3. take the advisory lock of every aggregate in the batch and keep, per
//!    aggregate, only the prefix of its unfinished events; everything else is
//!    released;
//! 4. plan and execute each kept event, aggregates concurrently, events of
//!    one aggregate in order, stopping at the first event that must wait;
//! 5. write every decision in one finalize call and drop the locks.
//!
//! The lease is renewed every `lease / 2`, concurrently with the batch. A
//! store failure aborts the batch: events not yet processed are deferred by
//! `poll_max` and the error is returned to the worker loop.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forgemes_observability::DispatcherMetrics;
use futures_util::future::join_all;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use forgemes_core::{AggregateId, EventId, WorkerId};

use crate::config::DispatcherConfig;
use crate::error::StoreError;
use crate::executor::{DeliveryExecutor, build_client};
use crate::model::{DeliveryStatus, OutboxEvent, Resolution, WebhookDelivery};
use crate::planner::{DeliveryPlanner, Plan, PlanError};
use crate::registry::EventTypeRegistry;
use crate::store::{DeliveryStore, OutboxStore, Stores, chrono_duration};

/// What one `run_once` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub done: usize,
    pub deferred: usize,
    pub failed: usize,
    pub released: usize,
    pub reclaimed_deliveries: u64,
}

impl BatchReport {
    /// Nothing was processed; the worker should sleep before polling again.
    pub fn is_idle(&self) -> bool {
        self.claimed == self.released
    }

    fn count(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Done => self.done += 1,
            Resolution::Defer { .. } => self.deferred += 1,
            Resolution::Failed { .. } => self.failed += 1,
            Resolution::Release => self.released += 1,
        }
    }
}

/// Decisions for one aggregate group, plus the store error that cut it
/// short, if any.
struct GroupOutcome {
    resolutions: Vec<(EventId, Resolution)>,
    error: Option<StoreError>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    outbox: Arc<dyn OutboxStore>,
    deliveries: Arc<dyn DeliveryStore>,
    planner: DeliveryPlanner,
    executor: DeliveryExecutor,
    metrics: Arc<DispatcherMetrics>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        stores: &Stores,
        registry: Arc<EventTypeRegistry>,
        metrics: Arc<DispatcherMetrics>,
    ) -> Result<Self, reqwest::Error> {
        let client = build_client(&config)?;
        let planner = DeliveryPlanner::new(registry, stores.subscriptions.clone(), stores.deliveries.clone());
        let executor = DeliveryExecutor::new(
            client,
            config.http_concurrency,
            stores.deliveries.clone(),
            config.retry_policy(),
            metrics.clone(),
        );
        Ok(Self {
            config,
            outbox: stores.outbox.clone(),
            deliveries: stores.deliveries.clone(),
            planner,
            executor,
            metrics,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        self.metrics.clone()
    }

    /// Start `worker_count` workers. They stop after their current batch
    /// once `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> DispatcherHandle {
        let workers = (0..self.config.worker_count)
            .map(|_| {
                let dispatcher = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(dispatcher.run_worker(WorkerId::new(), cancel))
            })
            .collect();
        DispatcherHandle {
            cancel,
            workers,
            deadline: self.config.shutdown_deadline,
        }
    }

    async fn run_worker(self: Arc<Self>, worker: WorkerId, cancel: CancellationToken) {
        info!(%worker, "outbox worker started");
        while !cancel.is_cancelled() {
            let pause = match self.run_once(worker).await {
                Ok(report) if report.is_idle() => Some(self.idle_pause()),
                Ok(report) => {
                    debug!(%worker, ?report, "batch finished");
                    None
                }
                Err(error) => {
                    warn!(%worker, %error, "outbox batch aborted");
                    Some(self.config.poll_max)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!(%worker, "outbox worker stopped");
    }

    fn idle_pause(&self) -> Duration {
        let min = u64::try_from(self.config.poll_min.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.config.poll_max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
    }

    /// Claim and process one batch for `worker`.
    pub async fn run_once(&self, worker: WorkerId) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let now = Utc::now();
        report.reclaimed_deliveries = self
            .deliveries
            .reclaim_stale_in_flight(now - chrono_duration(self.config.inflight_expiry), now)
            .await?;
        if report.reclaimed_deliveries > 0 {
            warn!(%worker, count = report.reclaimed_deliveries, "abandoned in-flight deliveries reclaimed");
        }

        let claimed = self
            .outbox
            .claim(worker, self.config.claim_batch, self.config.lease)
            .await?;
        if claimed.is_empty() {
            return Ok(report);
        }
        report.claimed = claimed.len();
        self.metrics.events_claimed(claimed.len() as u64);
        let ids: Vec<EventId> = claimed.iter().map(|e| e.id).collect();

        let (resolutions, batch_error) = tokio::select! {
            outcome = self.process_batch(worker, claimed) => outcome,
            never = self.keep_lease(worker, &ids) => match never {},
        };

        for (_, resolution) in &resolutions {
            report.count(resolution);
            match resolution {
                Resolution::Done => self.metrics.event_done(),
                Resolution::Defer { .. } => self.metrics.event_deferred(),
                Resolution::Failed { .. } => self.metrics.event_failed(),
                Resolution::Release => {}
            }
        }

        let finalized = self.outbox.finalize(worker, &resolutions).await;
        if let Err(error) = self.outbox.release_aggregate_locks(worker).await {
            warn!(%worker, %error, "aggregate locks not released");
        }
        let applied = finalized?;
        if applied < resolutions.len() as u64 {
            warn!(%worker, applied, expected = resolutions.len(), "some rows were no longer held at finalize");
        }
        if let Some(error) = batch_error {
            return Err(error);
        }
        Ok(report)
    }

    /// Renew the lease on `ids` every `lease / 2` until dropped. Polled
    /// beside the batch, so a slow renewal does not hold up deliveries.
    async fn keep_lease(&self, worker: WorkerId, ids: &[EventId]) -> Infallible {
        let every = (self.config.lease / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.outbox.extend_lease(worker, ids, self.config.lease).await {
                Ok(extended) => debug!(%worker, extended, "lease renewed"),
                Err(error) => warn!(%worker, %error, "lease renewal failed"),
            }
        }
    }

    async fn process_batch(
        &self,
        worker: WorkerId,
        claimed: Vec<OutboxEvent>,
    ) -> (Vec<(EventId, Resolution)>, Option<StoreError>) {
        let groups = group_by_aggregate(claimed);
        let aggregates: Vec<AggregateId> = groups.iter().map(|(aggregate, _)| *aggregate).collect();

        let locked: HashSet<AggregateId> = match self
            .outbox
            .lock_aggregates(worker, &aggregates, self.config.lease)
            .await
        {
            Ok(locked) => locked.into_iter().collect(),
            Err(error) => {
                let until = Utc::now() + chrono_duration(self.config.poll_max);
                let resolutions = groups
                    .into_iter()
                    .flat_map(|(_, events)| events)
                    .map(|e| (e.id, abort_defer(until, &error)))
                    .collect();
                return (resolutions, Some(error));
            }
        };

        let mut resolutions = Vec::new();
        let mut held = Vec::new();
        for (aggregate, events) in groups {
            if locked.contains(&aggregate) {
                held.push((aggregate, events));
            } else {
                debug!(%worker, %aggregate, "aggregate held elsewhere, releasing its events");
                resolutions.extend(events.into_iter().map(|e| (e.id, Resolution::Release)));
            }
        }

        let outcomes = join_all(held.into_iter().map(|(aggregate, events)| self.process_group(aggregate, events))).await;

        let mut first_error = None;
        for outcome in outcomes {
            resolutions.extend(outcome.resolutions);
            if first_error.is_none() {
                first_error = outcome.error;
            }
        }
        (resolutions, first_error)
    }

    /// Process the events of one locked aggregate in order.
    async fn process_group(&self, aggregate: AggregateId, events: Vec<OutboxEvent>) -> GroupOutcome {
        let mut resolutions = Vec::with_capacity(events.len());

        let heads = match self.outbox.aggregate_heads(aggregate, events.len()).await {
            Ok(heads) => heads,
            Err(error) => return abort_group(events, resolutions, error, self.config.poll_max),
        };
        let prefix = events.iter().zip(&heads).take_while(|(e, head)| e.id == **head).count();
        if prefix < events.len() {
            debug!(%aggregate, kept = prefix, claimed = events.len(), "older events still open, releasing the rest");
        }

        let mut pending = events.into_iter();
        let mut kept = pending.by_ref().take(prefix).collect::<Vec<_>>().into_iter();
        while let Some(event) = kept.next() {
            let resolution = match self.process_event(&event).await {
                Ok(resolution) => resolution,
                Err(error) => {
                    let rest: Vec<OutboxEvent> = std::iter::once(event).chain(kept).collect();
                    resolutions.extend(pending.map(|e| (e.id, Resolution::Release)));
                    return abort_group(rest, resolutions, error, self.config.poll_max);
                }
            };
            let blocks = matches!(resolution, Resolution::Defer { .. });
            resolutions.push((event.id, resolution));
            if blocks {
                // later events of the aggregate wait for this one
                resolutions.extend(kept.by_ref().map(|e| (e.id, Resolution::Release)));
            }
        }
        resolutions.extend(pending.map(|e| (e.id, Resolution::Release)));

        GroupOutcome {
            resolutions,
            error: None,
        }
    }

    async fn process_event(&self, event: &OutboxEvent) -> Result<Resolution, StoreError> {
        let now = Utc::now();
        let (event_type, due) = match self.planner.plan(event, now).await {
            Ok(Plan::Skip) => return Ok(Resolution::Done),
            Ok(Plan::Deliver { event_type, due }) => (event_type, due),
            Err(PlanError::UnknownEventType(id)) => {
                error!(event_id = %event.id, event_type_id = %id, "event type unknown, event failed");
                return Ok(Resolution::Failed {
                    error: format!("event type {id} is not registered"),
                });
            }
            Err(PlanError::Store(error)) => return Err(error),
        };

        let attempts = due
            .iter()
            .map(|(delivery, subscription)| self.executor.execute(event, &event_type, delivery, subscription));
        for outcome in join_all(attempts).await {
            outcome?;
        }

        let deliveries = self.deliveries.deliveries_for_event(event.id).await?;
        Ok(self.resolve(event, &deliveries, Utc::now()))
    }

    fn resolve(&self, event: &OutboxEvent, deliveries: &[WebhookDelivery], now: DateTime<Utc>) -> Resolution {
        if deliveries.iter().all(|d| d.status.is_terminal()) {
            debug!(event_id = %event.id, deliveries = deliveries.len(), "event done");
            return Resolution::Done;
        }

        let next = deliveries
            .iter()
            .filter(|d| d.status.is_waiting())
            .min_by_key(|d| d.next_attempt_at);
        // an IN_FLIGHT row left behind returns to PENDING only through the
        // stale reclaim in `run_once`
        let reclaimable_at = deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::InFlight)
            .map(|d| d.updated_at + chrono_duration(self.config.inflight_expiry))
            .min();

        match (next, reclaimable_at) {
            (Some(next), None) => Resolution::Defer {
                until: next.next_attempt_at.max(now),
                error: next.last_error.clone(),
            },
            (next, Some(reclaimable_at)) => {
                let until = next.map_or(reclaimable_at, |n| n.next_attempt_at.min(reclaimable_at));
                Resolution::Defer {
                    until: until.max(now + chrono_duration(self.config.poll_min)),
                    error: Some("delivery attempt still in flight".to_string()),
                }
            }
            (None, None) => Resolution::Defer {
                until: now + chrono_duration(self.config.poll_max),
                error: None,
            },
        }
    }
}

fn group_by_aggregate(claimed: Vec<OutboxEvent>) -> Vec<(AggregateId, Vec<OutboxEvent>)> {
    let mut groups: Vec<(AggregateId, Vec<OutboxEvent>)> = Vec::new();
    for event in claimed {
        match groups.last_mut() {
            Some((aggregate, events)) if *aggregate == event.aggregate_id => events.push(event),
            _ => groups.push((event.aggregate_id, vec![event])),
        }
    }
    groups
}

fn abort_defer(until: DateTime<Utc>, error: &StoreError) -> Resolution {
    Resolution::Defer {
        until,
        error: Some(format!("batch aborted: {error}")),
    }
}

fn abort_group(
    unprocessed: Vec<OutboxEvent>,
    mut resolutions: Vec<(EventId, Resolution)>,
    error: StoreError,
    poll_max: Duration,
) -> GroupOutcome {
    let until = Utc::now() + chrono_duration(poll_max);
    resolutions.extend(unprocessed.into_iter().map(|e| (e.id, abort_defer(until, &error))));
    GroupOutcome {
        resolutions,
        error: Some(error),
    }
}

/// Running workers.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    deadline: Duration,
}

impl DispatcherHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask every worker to stop and wait up to the shutdown deadline.
    /// Workers still busy after that are aborted; their rows are picked up
    /// again once the lease expires.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.deadline;
        for mut worker in self.workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!("outbox worker missed the shutdown deadline, aborting");
                worker.abort();
            }
        }
        info!("outbox dispatcher stopped");
    }
}
