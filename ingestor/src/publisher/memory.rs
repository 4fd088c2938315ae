use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::Receipt;
use crate::publisher::{Broker, BrokerError, Record};

#[derive(Default)]
struct MemoryState {
    records: Vec<Record>,
    attempts: usize,
    failures: VecDeque<BrokerError>,
}

/// In-process broker for tests: keeps every acknowledged record and can be
/// told to fail the next sends.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    latency: Duration,
}

impl MemoryBroker {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    /// Queues errors returned by the next sends, in order.
    pub fn fail_next(&self, errors: Vec<BrokerError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn send(&self, record: &Record) -> Result<Receipt, BrokerError> {
        self.state.lock().unwrap().attempts += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.records.push(record.clone());
        Ok(Receipt {
            topic: record.topic.clone(),
            partition: 0,
            offset: state.records.len() as i64 - 1,
        })
    }
}
