use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::api::Receipt;
use crate::model::{Envelope, WireEncoding};
use retry::RetryPolicy;

pub mod kafka;
pub mod memory;
pub mod print;
pub mod retry;

/// One encoded envelope, ready to be written to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

impl Record {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("broker refused record ({reason}): {message}")]
    Terminal {
        reason: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait Broker {
    /// Writes one record and resolves once the broker acknowledged it.
    async fn send(&self, record: &Record) -> Result<Receipt, BrokerError>;

    /// Blocks until buffered records are delivered or `timeout` expires.
    fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum PartitionKey {
    #[default]
    EventId,
    Source,
}

impl FromStr for PartitionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "event_id" => Ok(PartitionKey::EventId),
            "source" => Ok(PartitionKey::Source),
            _ => Err(format!("Unknown partition key: {s}")),
        }
    }
}

/// What to do when every in-flight slot is taken.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum OverloadMode {
    #[default]
    Block,
    Reject,
}

impl FromStr for OverloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "block" => Ok(OverloadMode::Block),
            "reject" => Ok(OverloadMode::Reject),
            _ => Err(format!("Unknown overload mode: {s}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub topic: String,
    pub encoding: WireEncoding,
    pub partition_key: PartitionKey,
    pub retry: RetryPolicy,
    pub max_in_flight: usize,
    pub overload_mode: OverloadMode,
    pub acquire_timeout: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("too many publications in flight")]
    Overloaded,
    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("broker refused record ({reason}): {message}")]
    Terminal {
        reason: &'static str,
        message: String,
    },
    #[error("failed to encode envelope: {0}")]
    Encoding(String),
}

/// Retry state of a single `publish` call.
#[derive(Debug, Default)]
struct PublicationAttempt {
    attempts: u32,
    last_error: Option<String>,
    next_retry_at: Option<Instant>,
}

// One FIFO lane per partition key. tokio's Mutex queues waiters in order, so
// publications sharing a key reach the broker in arrival order.
#[derive(Default)]
struct KeyLanes {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct LaneTicket<'a> {
    lanes: &'a KeyLanes,
    key: String,
    lane: Arc<tokio::sync::Mutex<()>>,
}

impl KeyLanes {
    fn join(&self, key: &str) -> LaneTicket<'_> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(key.to_string()).or_default().clone();
        LaneTicket {
            lanes: self,
            key: key.to_string(),
            lane,
        }
    }

    fn len(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for LaneTicket<'_> {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this ticket still hold the lane: nobody is queued
        if Arc::strong_count(&self.lane) == 2 {
            lanes.remove(&self.key);
        }
    }
}

struct InFlight {
    _permit: OwnedSemaphorePermit,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl InFlight {
    fn report(permits: &Semaphore, capacity: usize) {
        gauge!("ingest_publish_in_flight")
            .set(capacity.saturating_sub(permits.available_permits()) as f64);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // The permit field is released after this body runs
        gauge!("ingest_publish_in_flight").set(
            self.capacity
                .saturating_sub(self.permits.available_permits() + 1) as f64,
        );
    }
}

/// Owns the broker connection and delivers envelopes to it with retries,
/// per-key ordering and bounded concurrency.
pub struct Publisher {
    broker: Arc<dyn Broker + Send + Sync>,
    config: PublisherConfig,
    permits: Arc<Semaphore>,
    lanes: KeyLanes,
}

impl Publisher {
    pub fn new<B: Broker + Send + Sync + 'static>(broker: B, config: PublisherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            broker: Arc::new(broker),
            config,
            permits,
            lanes: KeyLanes::default(),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publishes one envelope and returns the broker receipt. Transient broker
    /// errors are retried with backoff, terminal ones are returned immediately.
    #[instrument(skip_all, fields(event_id = envelope.event_id()))]
    pub async fn publish(&self, envelope: Envelope) -> Result<Receipt, PublishError> {
        let _in_flight = self.acquire().await?;
        let record = self.record(&envelope)?;

        let ticket = self.lanes.join(&record.key);
        let _lane = ticket.lane.lock().await;
        self.send_with_retry(&record).await
    }

    async fn acquire(&self) -> Result<InFlight, PublishError> {
        let permit = match self.config.overload_mode {
            OverloadMode::Reject => self
                .permits
                .clone()
                .try_acquire_owned()
                .map_err(|_| PublishError::Overloaded)?,
            OverloadMode::Block => {
                let acquire = self.permits.clone().acquire_owned();
                match tokio::time::timeout(self.config.acquire_timeout, acquire).await {
                    Ok(Ok(permit)) => permit,
                    // Closed on shutdown, or still saturated after the timeout
                    Ok(Err(_)) | Err(_) => return Err(PublishError::Overloaded),
                }
            }
        };
        InFlight::report(&self.permits, self.config.max_in_flight);

        Ok(InFlight {
            _permit: permit,
            permits: self.permits.clone(),
            capacity: self.config.max_in_flight,
        })
    }

    fn record(&self, envelope: &Envelope) -> Result<Record, PublishError> {
        let value = self
            .config
            .encoding
            .encode(envelope)
            .map_err(|e| PublishError::Encoding(e.to_string()))?;
        let received_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| PublishError::Encoding(e.to_string()))?;
        let key = match self.config.partition_key {
            PartitionKey::EventId => envelope.event_id(),
            PartitionKey::Source => envelope.source(),
        };

        Ok(Record {
            topic: self.config.topic.clone(),
            key: key.to_string(),
            value,
            headers: vec![
                ("event_id", envelope.event_id().to_string()),
                ("event_type", envelope.event_type().to_string()),
                ("schema_version", envelope.schema_version().to_string()),
                ("source", envelope.source().to_string()),
                ("received_at", received_at),
                (
                    "content-encoding",
                    self.config.encoding.content_encoding().to_string(),
                ),
            ],
        })
    }

    async fn send_with_retry(&self, record: &Record) -> Result<Receipt, PublishError> {
        let retry = &self.config.retry;
        let mut attempt = PublicationAttempt::default();
        let start = Instant::now();

        loop {
            attempt.attempts += 1;
            counter!("ingest_publish_attempts_total").increment(1);

            match self.broker.send(record).await {
                Ok(receipt) => {
                    histogram!("ingest_publish_duration_seconds")
                        .record(start.elapsed().as_secs_f64());
                    debug!(attempts = attempt.attempts, "publication acknowledged");
                    return Ok(receipt);
                }
                Err(BrokerError::Terminal { reason, message }) => {
                    warn!(reason, "broker refused record: {}", message);
                    return Err(PublishError::Terminal { reason, message });
                }
                Err(BrokerError::Transient(message)) => {
                    if !retry.should_retry(attempt.attempts) {
                        warn!(
                            attempts = attempt.attempts,
                            "giving up on publication: {}", message
                        );
                        return Err(PublishError::Exhausted {
                            attempts: attempt.attempts,
                            last_error: message,
                        });
                    }

                    let wait = retry.retry_interval(attempt.attempts);
                    attempt.last_error = Some(message);
                    attempt.next_retry_at = Some(Instant::now() + wait);
                    warn!(?attempt, "transient publish failure, retrying");
                    counter!("ingest_publish_retries_total").increment(1);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Waits for in-flight publications, stops accepting new ones and flushes
    /// the broker.
    pub async fn close(&self, timeout: Duration) -> Result<(), BrokerError> {
        let capacity = u32::try_from(self.config.max_in_flight).unwrap_or(u32::MAX);
        let drained =
            tokio::time::timeout(timeout, self.permits.acquire_many(capacity)).await;
        if drained.is_err() {
            warn!("publications still in flight at shutdown");
        }
        self.permits.close();

        let broker = self.broker.clone();
        tokio::task::spawn_blocking(move || broker.flush(timeout))
            .await
            .map_err(|e| BrokerError::Transient(format!("flush task failed: {e}")))?
    }
}
