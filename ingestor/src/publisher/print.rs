use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::api::Receipt;
use crate::publisher::{Broker, BrokerError, Record};

/// Logs records instead of writing them anywhere, for local debugging.
#[derive(Default)]
pub struct PrintBroker {
    offset: AtomicI64,
}

#[async_trait]
impl Broker for PrintBroker {
    async fn send(&self, record: &Record) -> Result<Receipt, BrokerError> {
        let offset = self.offset.fetch_add(1, Ordering::Relaxed);
        info!(
            topic = record.topic,
            key = record.key,
            headers = ?record.headers,
            "record: {}",
            String::from_utf8_lossy(&record.value)
        );
        counter!("ingest_print_records_total").increment(1);

        Ok(Receipt {
            topic: record.topic.clone(),
            partition: 0,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offsets_increase() {
        let broker = PrintBroker::default();
        let record = Record {
            topic: "events_ingestion".to_string(),
            key: "evt-1".to_string(),
            value: b"{}".to_vec(),
            headers: vec![],
        };

        assert_eq!(broker.send(&record).await.unwrap().offset, 0);
        assert_eq!(broker.send(&record).await.unwrap().offset, 1);
    }
}
