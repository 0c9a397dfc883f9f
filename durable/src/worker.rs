use crate::entry::{Delivery, EntryId};
use crate::error::Error;
use crate::event_log::EventLog;
use async_trait::async_trait;
use log::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Pause after a failed read before trying again.
const READ_BACKOFF: Duration = Duration::from_secs(1);
/// Pending rows inspected per reclaim sweep.
const SWEEP_BATCH: usize = 100;

/// How a handler failed. The handler decides; the pool never guesses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying (e.g. downstream provider unavailable). The entry stays pending.
    Transient(String),
    /// Will never succeed (e.g. malformed payload). The entry is acknowledged and dead-lettered.
    Permanent(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::Transient(reason) => write!(f, "transient failure: {reason}"),
            HandlerError::Permanent(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// The business action run for every durable entry.
///
/// Claimed entries can be redelivered after a worker crash, so
/// implementations must tolerate seeing the same entry more than once.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub stream: String,
    pub group: String,
    /// Consumers are named `<prefix>-<n>`; use something unique per replica.
    pub consumer_prefix: String,
    pub workers: usize,
    pub read_count: usize,
    pub read_block: Duration,
    /// Pending entries idle this long are considered abandoned and may be claimed.
    pub claim_timeout: Duration,
    pub claim_interval: Duration,
    pub max_deliveries: u32,
}

impl PoolConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_prefix: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer_prefix: consumer_prefix.into(),
            workers: 4,
            read_count: 16,
            read_block: Duration::from_secs(2),
            claim_timeout: Duration::from_secs(30),
            claim_interval: Duration::from_secs(15),
            max_deliveries: 5,
        }
    }

    pub fn consumer_name(&self, n: usize) -> String {
        format!("{}-{n}", self.consumer_prefix)
    }
}

/// A set of competing consumers in one group.
pub struct WorkerPool {
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Ensures the group exists, then spawns `config.workers` consumers.
    pub async fn start(
        log: Arc<dyn EventLog>,
        handler: Arc<dyn EntryHandler>,
        config: PoolConfig,
    ) -> Result<Self, Error> {
        log.create_group(&config.stream, &config.group).await?;

        let (stop, stopped) = watch::channel(false);
        let workers = (0..config.workers)
            .map(|n| {
                let worker = Worker {
                    consumer: config.consumer_name(n),
                    log: log.clone(),
                    handler: handler.clone(),
                    config: config.clone(),
                    trims: n == 0,
                };
                tokio::spawn(worker.run(stopped.clone()))
            })
            .collect();

        info!(
            "Started {} {} worker(s) for group {} on {} ({} backend)",
            config.workers,
            handler.name(),
            config.group,
            config.stream,
            log.backend_name()
        );
        Ok(Self {
            stop,
            workers,
            config,
        })
    }

    pub fn consumers(&self) -> Vec<String> {
        (0..self.workers.len())
            .map(|n| self.config.consumer_name(n))
            .collect()
    }

    /// Stops reading and waits for every worker. Entries read but not yet
    /// processed stay pending for another consumer to claim.
    pub async fn shutdown(self) {
        info!(
            "Stopping {} worker(s) for group {} on {}",
            self.workers.len(),
            self.config.group,
            self.config.stream
        );
        let _ = self.stop.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {e}");
            }
        }
    }
}

struct Worker {
    consumer: String,
    log: Arc<dyn EventLog>,
    handler: Arc<dyn EntryHandler>,
    config: PoolConfig,
    /// Releases acknowledged entries after each sweep; one worker per pool is enough.
    trims: bool,
}

impl Worker {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        debug!("Worker {} started", self.consumer);
        // Sweep once on startup to pick up whatever a crashed worker left behind.
        let mut next_sweep = Instant::now();

        loop {
            if *stop.borrow() {
                break;
            }

            if Instant::now() >= next_sweep {
                self.reclaim(&stop).await;
                if self.trims {
                    self.trim().await;
                }
                next_sweep = Instant::now() + self.config.claim_interval;
            }

            let block = self
                .config
                .read_block
                .min(next_sweep.saturating_duration_since(Instant::now()));
            let read = tokio::select! {
                biased;
                _ = stop.changed() => break,
                read = self.log.read_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.consumer,
                    self.config.read_count,
                    block,
                ) => read,
            };

            match read {
                Ok(deliveries) => self.process_all(deliveries, &stop).await,
                Err(e) => {
                    warn!(
                        "Worker {} failed to read {}: {e}",
                        self.consumer, self.config.stream
                    );
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = time::sleep(READ_BACKOFF) => {}
                    }
                }
            }
        }

        debug!("Worker {} stopped", self.consumer);
    }

    async fn process_all(&self, deliveries: Vec<Delivery>, stop: &watch::Receiver<bool>) {
        let total = deliveries.len();
        for (done, delivery) in deliveries.into_iter().enumerate() {
            if *stop.borrow() {
                debug!(
                    "Worker {} stopping with {} entry(ies) left pending",
                    self.consumer,
                    total - done
                );
                return;
            }
            self.process(delivery).await;
        }
    }

    async fn process(&self, delivery: Delivery) {
        let id = delivery.entry.id;
        if !delivery.entry.is_for(&self.config.group) {
            trace!(
                "Entry {id} on {} was replayed for another group, skipping it",
                self.config.stream
            );
            self.ack(id).await;
            return;
        }

        match self.handler.handle(&delivery).await {
            Ok(()) => self.ack(id).await,
            Err(HandlerError::Permanent(reason)) => {
                error!(
                    "Entry {id} on {} failed permanently in {}: {reason}",
                    self.config.stream,
                    self.handler.name()
                );
                self.dead_letter(&delivery, &reason).await;
            }
            Err(HandlerError::Transient(reason))
                if delivery.delivery_count >= self.config.max_deliveries =>
            {
                warn!(
                    "Entry {id} on {} failed on delivery {} of {}: {reason}",
                    self.config.stream, delivery.delivery_count, self.config.max_deliveries
                );
                self.dead_letter(&delivery, &format!("max deliveries exceeded: {reason}"))
                    .await;
            }
            Err(HandlerError::Transient(reason)) => {
                info!(
                    "Entry {id} on {} failed on delivery {}, leaving it pending: {reason}",
                    self.config.stream, delivery.delivery_count
                );
            }
        }
    }

    async fn ack(&self, id: EntryId) {
        if let Err(e) = self
            .log
            .ack(&self.config.stream, &self.config.group, &[id])
            .await
        {
            // Still pending, so it is claimed and processed again later.
            warn!("Worker {} failed to ack entry {id}: {e}", self.consumer);
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        match self
            .log
            .dead_letter(&self.config.group, delivery, reason)
            .await
        {
            Ok(dead_id) => warn!(
                "Entry {} on {} dead-lettered as {dead_id} after {} delivery(ies): {reason}",
                delivery.entry.id, self.config.stream, delivery.delivery_count
            ),
            Err(e) => error!(
                "Worker {} failed to dead-letter entry {}: {e}",
                self.consumer, delivery.entry.id
            ),
        }
    }

    async fn trim(&self) {
        match self.log.trim(&self.config.stream).await {
            Ok(0) => {}
            Ok(released) => debug!(
                "Worker {} released {released} acknowledged entry(ies) from {}",
                self.consumer, self.config.stream
            ),
            Err(e) => warn!(
                "Worker {} could not trim {}: {e}",
                self.consumer, self.config.stream
            ),
        }
    }

    /// Claims pending entries abandoned for longer than the claim timeout.
    async fn reclaim(&self, stop: &watch::Receiver<bool>) {
        let stream = &self.config.stream;
        let group = &self.config.group;

        let pending = match self.log.pending(stream, group, SWEEP_BATCH).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Worker {} could not list pending entries: {e}", self.consumer);
                return;
            }
        };

        let stale: Vec<EntryId> = pending
            .iter()
            .filter(|row| row.idle >= self.config.claim_timeout)
            .map(|row| row.id)
            .collect();
        if stale.is_empty() {
            return;
        }

        let claimed = match self
            .log
            .claim(stream, group, &self.consumer, self.config.claim_timeout, &stale)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Worker {} could not claim stale entries: {e}", self.consumer);
                return;
            }
        };
        if !claimed.is_empty() {
            info!(
                "Worker {} claimed {} stale entry(ies) on {stream}",
                self.consumer,
                claimed.len()
            );
        }

        let mut retry = Vec::with_capacity(claimed.len());
        for delivery in claimed {
            if delivery.delivery_count > self.config.max_deliveries {
                // The claim counted as a delivery the handler never saw.
                let attempts = delivery.delivery_count - 1;
                let delivery = Delivery {
                    delivery_count: attempts,
                    ..delivery
                };
                self.dead_letter(
                    &delivery,
                    &format!("max deliveries exceeded: abandoned after {attempts} delivery(ies)"),
                )
                .await;
            } else {
                retry.push(delivery);
            }
        }
        self.process_all(retry, stop).await;
    }
}
