//! Publish and consume API of the handoff broker
//!
//! Publishing sanitizes, routes (when the producer deferred), validates,
//! and enqueues in one atomic store batch. Consuming runs one loop per
//! agent with bounded parallelism, due-time dequeue, retry scheduling, and
//! dead-lettering of corrupt envelopes. Every status change is coupled
//! with its queue mutation in a single batch so a handoff has exactly one
//! queue entry iff it is pending or retrying.

use crate::broker::config::BrokerConfig;
use crate::broker::registry::AgentRegistry;
use crate::broker::routing::ContentRouter;
use crate::broker::traits::{BrokerError, HandlerOutcome, HandoffHandler, NextHandoff};
use crate::broker::validation::{self, Validator};
use crate::domain_types::{HandoffId, ProjectName};
use crate::handoff::{
    ACTIVE_AGENTS_KEY, HANDOFF_TTL, Handoff, HandoffContent, HandoffMetadata, HandoffStatus,
    METRICS_COMPLETED_KEY, METRICS_FAILED_KEY, METRICS_TOTAL_KEY, PROCESSING_TIMES_CAP,
    PROCESSING_TIMES_KEY, QueueMessage, ValidationSection, dead_letter_key, handoff_key,
    priority_score, queue_key,
};
use crate::store::{BatchOp, Store};
use crate::time_provider::SharedTimeProvider;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often an idle consumer refreshes its active-agent membership
const HEARTBEAT_REFRESH: std::time::Duration = std::time::Duration::from_secs(60);

/// A running consumer: its shutdown signal, loop task, and worker gate
struct ConsumerHandle {
    agent: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

/// Project-scoped handoff broker (C4)
pub struct HandoffBroker {
    project: ProjectName,
    store: Arc<dyn Store>,
    registry: Arc<AgentRegistry>,
    router: Arc<ContentRouter>,
    validator: Validator,
    config: BrokerConfig,
    time: SharedTimeProvider,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl HandoffBroker {
    /// Creates a broker for one project
    #[must_use]
    pub fn new(
        project: ProjectName,
        store: Arc<dyn Store>,
        registry: Arc<AgentRegistry>,
        router: Arc<ContentRouter>,
        config: BrokerConfig,
        time: SharedTimeProvider,
    ) -> Self {
        let validator = Validator::new(Arc::clone(&registry), Arc::clone(&time));
        Self {
            project,
            store,
            registry,
            router,
            validator,
            config,
            time,
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// The project this broker serves
    #[must_use]
    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    /// The agent registry backing this broker
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The store backing this broker
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn queue_for(&self, agent: &str) -> String {
        self.registry.get(agent).map_or_else(
            || queue_key(self.project.as_str(), agent),
            |capability| capability.queue_name_for(self.project.as_str()),
        )
    }

    /// Publishes a handoff: sanitize, route when the target is deferred,
    /// validate, then persist and enqueue atomically
    ///
    /// Republishing under the same id is idempotent: the record SET
    /// overwrites and the queue ZADD upserts.
    ///
    /// # Errors
    ///
    /// Returns a typed error without side effects when validation or
    /// routing fails, or a store error when the batch cannot be applied
    pub async fn publish(&self, mut handoff: Handoff) -> Result<HandoffId, BrokerError> {
        validation::sanitize(&mut handoff);

        if handoff.metadata.to_agent.is_empty() {
            handoff = self.router.resolve(&handoff)?;
        }

        handoff
            .refresh_checksum()
            .map_err(|e| BrokerError::Serialization {
                operation: "publish",
                source: e,
            })?;
        self.validator.validate(&handoff)?;

        let id = handoff
            .metadata
            .handoff_id
            .unwrap_or_else(HandoffId::generate);
        handoff.metadata.handoff_id = Some(id);
        // The id is part of the checksummed metadata.
        handoff
            .refresh_checksum()
            .map_err(|e| BrokerError::Serialization {
                operation: "publish",
                source: e,
            })?;

        let now = self.time.now_utc();
        handoff.status = HandoffStatus::Pending;
        handoff.created_at.get_or_insert(now);
        handoff.updated_at = Some(now);
        handoff.error_msg = None;

        let queue = self.queue_for(&handoff.metadata.to_agent);
        let score = priority_score(handoff.metadata.priority, self.time.unix_nanos());
        let message = QueueMessage {
            handoff_id: id,
            queue: queue.clone(),
            timestamp: now,
            priority: handoff.metadata.priority,
            payload: handoff,
        };
        let serialized =
            crate::handoff::canonical_json(&message).map_err(|e| BrokerError::Serialization {
                operation: "publish",
                source: e,
            })?;

        self.store
            .batch(vec![
                BatchOp::Set {
                    key: handoff_key(id),
                    value: serialized,
                    ttl: Some(HANDOFF_TTL),
                },
                BatchOp::ZAdd {
                    queue: queue.clone(),
                    member: id.to_string(),
                    score,
                },
                BatchOp::Incr {
                    key: METRICS_TOTAL_KEY.to_string(),
                    ttl: Some(HANDOFF_TTL),
                },
            ])
            .await
            .map_err(|e| BrokerError::Store {
                operation: "publish",
                handoff_id: Some(id),
                source: e,
            })?;

        info!(
            handoff_id = %id,
            queue = %queue,
            priority = ?message.priority,
            "handoff published"
        );
        Ok(id)
    }

    /// Reads a handoff envelope by id
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the record is absent or expired, or a
    /// corruption error when the envelope cannot be parsed
    pub async fn get(&self, id: HandoffId) -> Result<QueueMessage, BrokerError> {
        let raw = self
            .store
            .get(&handoff_key(id))
            .await
            .map_err(|e| BrokerError::Store {
                operation: "get",
                handoff_id: Some(id),
                source: e,
            })?
            .ok_or(BrokerError::NotFound { handoff_id: id })?;
        serde_json::from_str(&raw).map_err(|_| BrokerError::Corruption {
            handoff_id: id,
            reason: "unparseable envelope".to_string(),
        })
    }

    /// Lists ids of all live handoff records
    ///
    /// # Errors
    ///
    /// Returns a store error when the scan fails
    pub async fn list_ids(&self) -> Result<Vec<HandoffId>, BrokerError> {
        let keys = self
            .store
            .scan(crate::handoff::HANDOFF_KEY_PREFIX)
            .await
            .map_err(|e| BrokerError::Store {
                operation: "list",
                handoff_id: None,
                source: e,
            })?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                key.strip_prefix(crate::handoff::HANDOFF_KEY_PREFIX)
                    .and_then(|suffix| suffix.parse::<Uuid>().ok())
                    .map(HandoffId::new)
            })
            .collect())
    }

    /// Depth of an agent's queue
    ///
    /// # Errors
    ///
    /// Returns a store error when the count fails
    pub async fn queue_depth(&self, agent: &str) -> Result<u64, BrokerError> {
        self.store
            .zcard(&self.queue_for(agent))
            .await
            .map_err(|e| BrokerError::Store {
                operation: "queue_depth",
                handoff_id: None,
                source: e,
            })
    }

    /// Cancels a pending handoff, removing its queue entry in the same
    /// batch
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the handoff is pending
    pub async fn cancel(&self, id: HandoffId) -> Result<(), BrokerError> {
        self.force_status(id, HandoffStatus::Cancelled).await
    }

    /// Admin-only forced status transition
    ///
    /// The lifecycle DAG is enforced against the stored envelope. The
    /// queue is mutated in the same batch to keep the queue-membership
    /// invariant: the member exists afterwards iff the new status is
    /// pending or retrying.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the DAG forbids the change
    pub async fn force_status(
        &self,
        id: HandoffId,
        status: HandoffStatus,
    ) -> Result<(), BrokerError> {
        let mut message = self.get(id).await?;
        let current = message.payload.status;
        if !current.can_transition_to(status) {
            return Err(BrokerError::InvalidTransition {
                handoff_id: id,
                from: current,
                to: status,
            });
        }

        message.payload.status = status;
        message.payload.updated_at = Some(self.time.now_utc());
        let queue = message.queue.clone();

        let mut ops = vec![self.record_op(&message)?];
        if matches!(status, HandoffStatus::Pending | HandoffStatus::Retrying) {
            ops.push(BatchOp::ZAdd {
                queue,
                member: id.to_string(),
                score: priority_score(message.priority, self.time.unix_nanos()),
            });
        } else {
            ops.push(BatchOp::ZRem {
                queue,
                member: id.to_string(),
            });
        }

        self.store
            .batch(ops)
            .await
            .map_err(|e| BrokerError::Store {
                operation: "force_status",
                handoff_id: Some(id),
                source: e,
            })?;
        info!(handoff_id = %id, from = ?current, to = ?status, "status forced");
        Ok(())
    }

    /// Serializes an envelope into its record SET op with a fresh TTL
    fn record_op(&self, message: &QueueMessage) -> Result<BatchOp, BrokerError> {
        let serialized =
            crate::handoff::canonical_json(message).map_err(|e| BrokerError::Serialization {
                operation: "persist",
                source: e,
            })?;
        Ok(BatchOp::Set {
            key: handoff_key(message.handoff_id),
            value: serialized,
            ttl: Some(HANDOFF_TTL),
        })
    }

    /// Starts the consumer loop for an agent
    ///
    /// One loop per agent: it joins the active-agent set, then repeatedly
    /// acquires a worker permit, pops the next due handoff, and processes
    /// it on a spawned task. An empty queue sleeps one poll interval.
    pub fn start_consumer(self: &Arc<Self>, agent: &str, handler: Arc<dyn HandoffHandler>) {
        let capability = self.registry.get(agent);
        let queue = self.queue_for(agent);
        let max_concurrent = capability.as_ref().map_or_else(
            || self.config.default_max_concurrent.as_usize(),
            |c| c.max_concurrent.as_usize(),
        );
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let broker = Arc::clone(self);
        let agent_name = agent.to_string();
        let loop_semaphore = Arc::clone(&semaphore);
        let task = tokio::spawn(async move {
            info!(agent = %agent_name, queue = %queue, max_concurrent, "consumer started");
            broker.heartbeat(&agent_name).await;
            let mut last_heartbeat = Instant::now();
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                // Keep idle consumers inside the active-agent probation
                // window without a write per poll tick.
                if last_heartbeat.elapsed() >= HEARTBEAT_REFRESH {
                    broker.heartbeat(&agent_name).await;
                    last_heartbeat = Instant::now();
                }
                let permit = tokio::select! {
                    permit = Arc::clone(&loop_semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                #[allow(clippy::cast_precision_loss)]
                let due_bound = broker.time.unix_seconds() as f64;
                let popped = match broker.store.zpop_min(&queue, due_bound).await {
                    Ok(popped) => popped,
                    Err(e) => {
                        warn!(agent = %agent_name, error = %e, "dequeue failed");
                        None
                    }
                };

                match popped {
                    Some(entry) => {
                        broker.heartbeat(&agent_name).await;
                        last_heartbeat = Instant::now();
                        let worker = Arc::clone(&broker);
                        let worker_agent = agent_name.clone();
                        let worker_queue = queue.clone();
                        let worker_handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Some(id) = parse_member(&entry.member) {
                                if let Err(e) = worker
                                    .process_one(id, &worker_queue, worker_handler.as_ref())
                                    .await
                                {
                                    warn!(
                                        agent = %worker_agent,
                                        handoff_id = %id,
                                        error = %e,
                                        "handoff processing errored"
                                    );
                                }
                            } else {
                                warn!(member = %entry.member, "dropping unparseable queue member");
                            }
                        });
                    }
                    None => {
                        drop(permit);
                        tokio::select! {
                            () = broker.time.sleep(broker.config.poll_interval_ms.as_duration()) => {}
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!(agent = %agent_name, "consumer stopped");
        });

        self.consumers
            .lock()
            .expect("consumer lock poisoned")
            .push(ConsumerHandle {
                agent: agent.to_string(),
                shutdown: shutdown_tx,
                task,
                semaphore,
                max_concurrent,
            });
    }

    /// Refreshes this consumer's membership in the active-agent set
    async fn heartbeat(&self, agent: &str) {
        #[allow(clippy::cast_precision_loss)]
        let score = self.time.unix_seconds() as f64;
        if let Err(e) = self.store.zadd(ACTIVE_AGENTS_KEY, agent, score).await {
            warn!(agent = %agent, error = %e, "active-agent heartbeat failed");
        }
    }

    /// Processes one dequeued handoff through its handler
    ///
    /// # Errors
    ///
    /// Returns an error for store failures or corruption; handler failures
    /// are absorbed into retry scheduling or a terminal `failed` status
    pub async fn process_one(
        &self,
        id: HandoffId,
        queue: &str,
        handler: &dyn HandoffHandler,
    ) -> Result<(), BrokerError> {
        let raw = self
            .store
            .get(&handoff_key(id))
            .await
            .map_err(|e| BrokerError::Store {
                operation: "process",
                handoff_id: Some(id),
                source: e,
            })?;
        let Some(raw) = raw else {
            warn!(handoff_id = %id, "dequeued handoff record is gone, dropping");
            return Ok(());
        };

        let Ok(mut message) = serde_json::from_str::<QueueMessage>(&raw) else {
            self.dead_letter(id, raw, "unparseable envelope").await?;
            return Err(BrokerError::Corruption {
                handoff_id: id,
                reason: "unparseable envelope".to_string(),
            });
        };

        match message.payload.verify_checksum() {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.dead_letter(id, raw, "checksum mismatch").await?;
                return Err(BrokerError::Corruption {
                    handoff_id: id,
                    reason: "checksum mismatch".to_string(),
                });
            }
        }

        if !message
            .payload
            .status
            .can_transition_to(HandoffStatus::Processing)
        {
            // An admin forced the status after the pop; the admin wins.
            warn!(
                handoff_id = %id,
                status = ?message.payload.status,
                "dequeued handoff is no longer runnable, dropping"
            );
            return Ok(());
        }

        message.payload.status = HandoffStatus::Processing;
        message.payload.updated_at = Some(self.time.now_utc());
        self.store
            .batch(vec![self.record_op(&message)?])
            .await
            .map_err(|e| BrokerError::Store {
                operation: "process",
                handoff_id: Some(id),
                source: e,
            })?;

        let started = Instant::now();
        let result = handler.handle(&message.payload).await;
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) => self.complete(message, elapsed, outcome).await,
            Err(e) => self.fail_or_retry(message, queue, &e.0).await,
        }
    }

    /// Terminal success path: record, counters, timing sample, follow-ups
    async fn complete(
        &self,
        mut message: QueueMessage,
        elapsed: std::time::Duration,
        outcome: HandlerOutcome,
    ) -> Result<(), BrokerError> {
        let id = message.handoff_id;
        message.payload.status = HandoffStatus::Completed;
        message.payload.updated_at = Some(self.time.now_utc());
        message.payload.error_msg = None;

        self.store
            .batch(vec![
                self.record_op(&message)?,
                BatchOp::Incr {
                    key: METRICS_COMPLETED_KEY.to_string(),
                    ttl: Some(HANDOFF_TTL),
                },
                BatchOp::RPushCapped {
                    list: PROCESSING_TIMES_KEY.to_string(),
                    value: elapsed.as_millis().to_string(),
                    cap: PROCESSING_TIMES_CAP,
                },
            ])
            .await
            .map_err(|e| BrokerError::Store {
                operation: "complete",
                handoff_id: Some(id),
                source: e,
            })?;

        debug!(handoff_id = %id, elapsed_ms = elapsed.as_millis(), "handoff completed");

        for next in outcome.next_handoffs {
            let follow_up = self.lift_follow_up(&message.payload, next);
            match self.publish(follow_up).await {
                Ok(follow_up_id) => {
                    debug!(parent = %id, follow_up = %follow_up_id, "follow-up published");
                }
                Err(e) => {
                    warn!(parent = %id, error = %e, "follow-up publication failed");
                }
            }
        }
        Ok(())
    }

    /// Lifts a handler-emitted follow-up into a full handoff
    ///
    /// The completing agent becomes `from_agent`; the follow-up context
    /// doubles as its first requirement.
    fn lift_follow_up(&self, parent: &Handoff, next: NextHandoff) -> Handoff {
        let requirement = if next.context.is_empty() {
            next.summary.clone()
        } else {
            next.context.clone()
        };
        Handoff {
            metadata: HandoffMetadata {
                project_name: parent.metadata.project_name.clone(),
                from_agent: parent.metadata.to_agent.clone(),
                to_agent: next.to_agent,
                timestamp: self.time.now_utc(),
                task_context: if next.context.is_empty() {
                    parent.metadata.task_context.clone()
                } else {
                    next.context
                },
                priority: next.priority,
                handoff_id: None,
            },
            content: HandoffContent {
                summary: next.summary,
                requirements: vec![requirement],
                artifacts: crate::handoff::ArtifactSet::default(),
                technical_details: serde_json::Map::new(),
                next_steps: vec![],
            },
            validation: ValidationSection::default(),
            status: HandoffStatus::Pending,
            created_at: None,
            updated_at: None,
            retry_count: 0,
            error_msg: None,
        }
    }

    /// Failure path: schedule a retry when the error is retriable and the
    /// ceiling allows, otherwise mark failed
    async fn fail_or_retry(
        &self,
        mut message: QueueMessage,
        queue: &str,
        error_msg: &str,
    ) -> Result<(), BrokerError> {
        let id = message.handoff_id;
        let policy = &self.config.retry;
        let retriable = policy.is_retriable(error_msg);

        if retriable && message.payload.retry_count < policy.max_retries.as_u32() {
            message.payload.retry_count += 1;
            message.payload.status = HandoffStatus::Retrying;
            message.payload.error_msg = Some(error_msg.to_string());
            message.payload.updated_at = Some(self.time.now_utc());

            let delay = policy.delay_for(message.payload.retry_count);
            let due = self.time.now_utc() + chrono::Duration::from_std(delay).unwrap_or_default();
            // Integer part is the dispatch time, so the entry parks behind
            // live items of any priority until due.
            #[allow(clippy::cast_precision_loss)]
            let score = due.timestamp() as f64
                + f64::from(due.timestamp_subsec_millis()) / 1e3;

            self.store
                .batch(vec![
                    self.record_op(&message)?,
                    BatchOp::ZAdd {
                        queue: queue.to_string(),
                        member: id.to_string(),
                        score,
                    },
                ])
                .await
                .map_err(|e| BrokerError::Store {
                    operation: "retry",
                    handoff_id: Some(id),
                    source: e,
                })?;
            info!(
                handoff_id = %id,
                retry_count = message.payload.retry_count,
                delay_ms = delay.as_millis(),
                "handoff scheduled for retry"
            );
            return Ok(());
        }

        message.payload.status = HandoffStatus::Failed;
        message.payload.error_msg = Some(error_msg.to_string());
        message.payload.updated_at = Some(self.time.now_utc());

        self.store
            .batch(vec![
                self.record_op(&message)?,
                BatchOp::Incr {
                    key: METRICS_FAILED_KEY.to_string(),
                    ttl: Some(HANDOFF_TTL),
                },
            ])
            .await
            .map_err(|e| BrokerError::Store {
                operation: "fail",
                handoff_id: Some(id),
                source: e,
            })?;
        warn!(
            handoff_id = %id,
            retriable,
            retry_count = message.payload.retry_count,
            error = %error_msg,
            "handoff failed"
        );
        Ok(())
    }

    /// Moves a corrupt envelope to the dead-letter set and removes the
    /// primary record
    async fn dead_letter(
        &self,
        id: HandoffId,
        raw: String,
        reason: &str,
    ) -> Result<(), BrokerError> {
        warn!(handoff_id = %id, reason, "dead-lettering handoff");
        self.store
            .batch(vec![
                BatchOp::Set {
                    key: dead_letter_key(id),
                    value: raw,
                    ttl: Some(HANDOFF_TTL),
                },
                BatchOp::Del {
                    keys: vec![handoff_key(id)],
                },
            ])
            .await
            .map_err(|e| BrokerError::Store {
                operation: "dead_letter",
                handoff_id: Some(id),
                source: e,
            })
    }

    /// Startup reconciliation: requeue handoffs abandoned in `processing`
    ///
    /// A crash between dequeue and the terminal status update loses the
    /// queue membership but not the record. Any `processing` envelope with
    /// a stale `updated_at` is re-scheduled with `retry_count`
    /// incremented; one past the retry ceiling is marked failed.
    ///
    /// # Errors
    ///
    /// Returns a store error when the sweep cannot run
    pub async fn reconcile(&self) -> Result<u64, BrokerError> {
        let stale_cutoff =
            self.time.now_utc() - chrono::Duration::seconds(self.config.stale_processing_secs.as_secs());
        let mut requeued = 0u64;

        for id in self.list_ids().await? {
            let Ok(mut message) = self.get(id).await else {
                continue;
            };
            if message.payload.status != HandoffStatus::Processing {
                continue;
            }
            let stale = message
                .payload
                .updated_at
                .is_none_or(|updated| updated < stale_cutoff);
            if !stale {
                continue;
            }

            if message.payload.retry_count >= self.config.retry.max_retries.as_u32() {
                self.fail_or_retry(message, "", "abandoned in processing, retries exhausted")
                    .await?;
                continue;
            }

            message.payload.retry_count += 1;
            message.payload.status = HandoffStatus::Retrying;
            message.payload.error_msg = Some("abandoned in processing".to_string());
            message.payload.updated_at = Some(self.time.now_utc());
            let queue = message.queue.clone();
            let score = priority_score(message.priority, self.time.unix_nanos());

            self.store
                .batch(vec![
                    self.record_op(&message)?,
                    BatchOp::ZAdd {
                        queue,
                        member: id.to_string(),
                        score,
                    },
                ])
                .await
                .map_err(|e| BrokerError::Store {
                    operation: "reconcile",
                    handoff_id: Some(id),
                    source: e,
                })?;
            requeued += 1;
            info!(handoff_id = %id, "abandoned handoff requeued");
        }

        if requeued > 0 {
            info!(requeued, "reconciliation requeued abandoned handoffs");
        }
        Ok(requeued)
    }

    /// Stops all consumers and waits for in-flight workers to drain,
    /// bounded by the configured shutdown timeout
    pub async fn shutdown(&self) {
        let handles: Vec<ConsumerHandle> = self
            .consumers
            .lock()
            .expect("consumer lock poisoned")
            .drain(..)
            .collect();

        for handle in &handles {
            let _ = handle.shutdown.send(true);
        }

        let deadline = Instant::now() + self.config.shutdown_timeout_ms.as_duration();
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle.task).await.is_err() {
                warn!(agent = %handle.agent, "consumer loop did not stop in time");
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let permits = u32::try_from(handle.max_concurrent).unwrap_or(u32::MAX);
            match tokio::time::timeout(remaining, handle.semaphore.acquire_many(permits)).await {
                Ok(_) => {}
                Err(_) => warn!(
                    agent = %handle.agent,
                    "abandoning in-flight workers; reconciliation will recover them"
                ),
            }
        }
        info!("broker shut down");
    }
}

/// Parses a queue member back into a handoff id
fn parse_member(member: &str) -> Option<HandoffId> {
    member.parse::<Uuid>().ok().map(HandoffId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::traits::HandlerError;
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::handoff::ArtifactSet;
    use crate::time_provider::TimeProvider;
    use crate::store::SqliteStore;
    use crate::time_provider::MockTimeProvider;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Map;
    use tempfile::TempDir;

    struct OkHandler;

    #[async_trait]
    impl HandoffHandler for OkHandler {
        async fn handle(&self, _handoff: &Handoff) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::default())
        }
    }

    async fn scratch_broker() -> (TempDir, Arc<MockTimeProvider>, Arc<HandoffBroker>) {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = DatabasePath::new(temp_dir.path().join("broker.db")).expect("db path");
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
            .await
            .expect("db init");
        let time = Arc::new(MockTimeProvider::new());
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(conn, time.clone()));
        let broker = Arc::new(HandoffBroker::new(
            ProjectName::try_new("demo".to_string()).unwrap(),
            store,
            Arc::new(AgentRegistry::new()),
            Arc::new(ContentRouter::new(None)),
            BrokerConfig::testing(),
            time.clone(),
        ));
        (temp_dir, time, broker)
    }

    fn sample_handoff() -> Handoff {
        Handoff {
            metadata: HandoffMetadata {
                project_name: "demo".to_string(),
                from_agent: "api-expert".to_string(),
                to_agent: "golang-expert".to_string(),
                timestamp: Utc::now(),
                task_context: "implement login".to_string(),
                priority: crate::handoff::Priority::Normal,
                handoff_id: None,
            },
            content: HandoffContent {
                summary: "Implement login endpoint per OpenAPI".to_string(),
                requirements: vec!["JWT auth".to_string()],
                artifacts: ArtifactSet::default(),
                technical_details: Map::new(),
                next_steps: vec![],
            },
            validation: ValidationSection::default(),
            status: HandoffStatus::Pending,
            created_at: None,
            updated_at: None,
            retry_count: 0,
            error_msg: None,
        }
    }

    #[tokio::test]
    async fn test_should_persist_and_enqueue_when_publishing_valid_handoff() {
        let (_dir, _time, broker) = scratch_broker().await;

        let id = broker.publish(sample_handoff()).await.unwrap();

        let message = broker.get(id).await.unwrap();
        assert_eq!(message.payload.status, HandoffStatus::Pending);
        assert!(message.payload.verify_checksum().unwrap());
        assert_eq!(broker.queue_depth("golang-expert").await.unwrap(), 1);
        assert_eq!(
            broker.store().get(METRICS_TOTAL_KEY).await.unwrap().unwrap(),
            "1"
        );
    }

    #[tokio::test]
    async fn test_should_reject_without_side_effects_when_validation_fails() {
        let (_dir, _time, broker) = scratch_broker().await;

        let mut bad = sample_handoff();
        bad.metadata.to_agent = bad.metadata.from_agent.clone();

        let err = broker.publish(bad).await.unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));
        assert_eq!(broker.queue_depth("api-expert").await.unwrap(), 0);
        assert!(broker.store().get(METRICS_TOTAL_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_complete_handoff_when_handler_succeeds() {
        let (_dir, time, broker) = scratch_broker().await;
        let id = broker.publish(sample_handoff()).await.unwrap();
        let queue = broker.queue_for("golang-expert");

        #[allow(clippy::cast_precision_loss)]
        let bound = time.unix_seconds() as f64;
        let popped = broker.store().zpop_min(&queue, bound).await.unwrap().unwrap();
        let popped_id = parse_member(&popped.member).unwrap();
        assert_eq!(popped_id, id);

        broker.process_one(id, &queue, &OkHandler).await.unwrap();

        let message = broker.get(id).await.unwrap();
        assert_eq!(message.payload.status, HandoffStatus::Completed);
        assert_eq!(
            broker.store().get(METRICS_COMPLETED_KEY).await.unwrap().unwrap(),
            "1"
        );
        assert_eq!(
            broker.store().lrange_all(PROCESSING_TIMES_KEY).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_should_schedule_retry_when_handler_error_is_retriable() {
        let (_dir, time, broker) = scratch_broker().await;
        let id = broker.publish(sample_handoff()).await.unwrap();
        let queue = broker.queue_for("golang-expert");

        struct ResetHandler;
        #[async_trait]
        impl HandoffHandler for ResetHandler {
            async fn handle(&self, _h: &Handoff) -> Result<HandlerOutcome, HandlerError> {
                Err(HandlerError("connection reset".to_string()))
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let bound = time.unix_seconds() as f64;
        broker.store().zpop_min(&queue, bound).await.unwrap().unwrap();
        broker.process_one(id, &queue, &ResetHandler).await.unwrap();

        let message = broker.get(id).await.unwrap();
        assert_eq!(message.payload.status, HandoffStatus::Retrying);
        assert_eq!(message.payload.retry_count, 1);

        // Parked behind live traffic until due.
        #[allow(clippy::cast_precision_loss)]
        let now_bound = time.unix_seconds() as f64;
        assert!(broker.store().zpop_min(&queue, now_bound).await.unwrap().is_none());

        time.advance_ms(2_000);
        #[allow(clippy::cast_precision_loss)]
        let later_bound = time.unix_seconds() as f64;
        assert!(broker.store().zpop_min(&queue, later_bound).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_should_mark_failed_when_error_is_not_retriable() {
        let (_dir, time, broker) = scratch_broker().await;
        let id = broker.publish(sample_handoff()).await.unwrap();
        let queue = broker.queue_for("golang-expert");

        struct BadPayloadHandler;
        #[async_trait]
        impl HandoffHandler for BadPayloadHandler {
            async fn handle(&self, _h: &Handoff) -> Result<HandlerOutcome, HandlerError> {
                Err(HandlerError("invalid payload shape".to_string()))
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let bound = time.unix_seconds() as f64;
        broker.store().zpop_min(&queue, bound).await.unwrap().unwrap();
        broker
            .process_one(id, &queue, &BadPayloadHandler)
            .await
            .unwrap();

        let message = broker.get(id).await.unwrap();
        assert_eq!(message.payload.status, HandoffStatus::Failed);
        assert_eq!(message.payload.error_msg.as_deref(), Some("invalid payload shape"));
        assert_eq!(
            broker.store().get(METRICS_FAILED_KEY).await.unwrap().unwrap(),
            "1"
        );
    }

    #[tokio::test]
    async fn test_should_dead_letter_when_checksum_does_not_verify() {
        let (_dir, _time, broker) = scratch_broker().await;
        let id = broker.publish(sample_handoff()).await.unwrap();
        let queue = broker.queue_for("golang-expert");

        // Tamper with the stored payload without refreshing the checksum.
        let mut message = broker.get(id).await.unwrap();
        message.payload.content.summary = "tampered summary text".to_string();
        let raw = crate::handoff::canonical_json(&message).unwrap();
        broker
            .store()
            .set(&handoff_key(id), &raw, Some(HANDOFF_TTL))
            .await
            .unwrap();

        let err = broker.process_one(id, &queue, &OkHandler).await.unwrap_err();
        assert!(matches!(err, BrokerError::Corruption { .. }));
        assert!(broker.store().get(&handoff_key(id)).await.unwrap().is_none());
        assert!(
            broker
                .store()
                .get(&dead_letter_key(id))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_should_remove_queue_member_when_cancelling_pending_handoff() {
        let (_dir, _time, broker) = scratch_broker().await;
        let id = broker.publish(sample_handoff()).await.unwrap();

        broker.cancel(id).await.unwrap();

        let message = broker.get(id).await.unwrap();
        assert_eq!(message.payload.status, HandoffStatus::Cancelled);
        assert_eq!(broker.queue_depth("golang-expert").await.unwrap(), 0);

        // Terminal: a second cancel violates the DAG.
        assert!(matches!(
            broker.cancel(id).await.unwrap_err(),
            BrokerError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_should_requeue_stale_processing_handoff_when_reconciling() {
        let (_dir, time, broker) = scratch_broker().await;
        let id = broker.publish(sample_handoff()).await.unwrap();
        let queue = broker.queue_for("golang-expert");

        // Simulate a crash: dequeue and transition to processing, then
        // never report back.
        #[allow(clippy::cast_precision_loss)]
        let bound = time.unix_seconds() as f64;
        broker.store().zpop_min(&queue, bound).await.unwrap().unwrap();
        let mut message = broker.get(id).await.unwrap();
        message.payload.status = HandoffStatus::Processing;
        message.payload.updated_at = Some(time.now_utc());
        let raw = crate::handoff::canonical_json(&message).unwrap();
        broker
            .store()
            .set(&handoff_key(id), &raw, Some(HANDOFF_TTL))
            .await
            .unwrap();

        // Not yet stale.
        assert_eq!(broker.reconcile().await.unwrap(), 0);

        time.advance_ms(120_000);
        assert_eq!(broker.reconcile().await.unwrap(), 1);

        let message = broker.get(id).await.unwrap();
        assert_eq!(message.payload.status, HandoffStatus::Retrying);
        assert_eq!(message.payload.retry_count, 1);
        assert_eq!(broker.queue_depth("golang-expert").await.unwrap(), 1);
    }
}
