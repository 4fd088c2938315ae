use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::api::Receipt;
use crate::config::KafkaConfig;
use crate::publisher::{Broker, BrokerError, Record};

struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        // Update exported metrics
        gauge!("ingest_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("ingest_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("ingest_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("ingest_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("ingest_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (topic, stats) in stats.topics {
            gauge!(
                "ingest_kafka_produce_avg_batch_size_bytes",
                "topic" => topic.clone()
            )
            .set(stats.batchsize.avg as f64);
            gauge!(
                "ingest_kafka_produce_avg_batch_size_events",
                "topic" => topic
            )
            .set(stats.batchcnt.avg as f64);
        }

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "ingest_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            gauge!(
                "ingest_kafka_broker_responses_awaiting",
                "broker" => id_string.clone()
            )
            .set(stats.waitresp_cnt as f64);
            counter!(
                "ingest_kafka_broker_tx_errors_total",
                "broker" => id_string.clone()
            )
            .absolute(stats.txerrs);
            counter!(
                "ingest_kafka_broker_rx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.rxerrs);
        }
    }
}

/// Errors the broker will keep returning for the same record.
fn classify(err: &KafkaError) -> BrokerError {
    let reason = match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge | RDKafkaErrorCode::InvalidMessageSize) => {
            Some("payload_too_large")
        }
        Some(
            RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => Some("unauthorized"),
        Some(RDKafkaErrorCode::InvalidRecord) => Some("broker_rejected"),
        _ => None,
    };

    match reason {
        Some(reason) => BrokerError::Terminal {
            reason,
            message: err.to_string(),
        },
        None => BrokerError::Transient(err.to_string()),
    }
}

#[derive(Clone)]
pub struct KafkaBroker {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaBroker> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("partitioner", "murmur2_random") // Compatibility with python-kafka
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.max.bytes",
                config.kafka_producer_message_max_bytes.to_string(),
            )
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set("acks", &config.kafka_producer_acks);

        if !config.kafka_client_id.is_empty() {
            client_config.set("client.id", &config.kafka_client_id);
        }

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaBroker { producer })
    }

    fn enqueue(&self, record: &Record) -> Result<DeliveryFuture, BrokerError> {
        let headers = record
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_str()),
                })
            });

        match self.producer.send_result(FutureRecord {
            topic: record.topic.as_str(),
            payload: Some(record.value.as_slice()),
            partition: None,
            key: Some(record.key.as_str()),
            timestamp: None,
            headers: Some(headers),
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => {
                error!("failed to enqueue record: {}", e);
                Err(classify(&e))
            }
        }
    }

    async fn process_ack(topic: &str, delivery: DeliveryFuture) -> Result<Receipt, BrokerError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(BrokerError::Transient(
                    "delivery cancelled before acknowledgment".to_string(),
                ))
            }
            Ok(Err((err, _))) => {
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(classify(&err))
            }
            Ok(Ok((partition, offset))) => Ok(Receipt {
                topic: topic.to_string(),
                partition,
                offset,
            }),
        }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    #[instrument(skip_all, fields(key = %record.key))]
    async fn send(&self, record: &Record) -> Result<Receipt, BrokerError> {
        let ack = self.enqueue(record)?;
        Self::process_ack(&record.topic, ack)
            .instrument(info_span!("ack_wait_one"))
            .await
    }

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| BrokerError::Transient(e.to_string()))
    }
}
