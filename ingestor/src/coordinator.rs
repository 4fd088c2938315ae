use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, field, instrument, Instrument, Span};

use crate::api::IngestResult;
use crate::dedup::{DedupCheck, DedupTracker, PriorOutcome, Resolution};
use crate::prometheus::{report_duplicate, report_outcome, report_received};
use crate::publisher::{PublishError, Publisher};
use crate::validator::Validator;

/// Runs one submission through validation, deduplication and publication.
/// Pure transport-independent core: the HTTP layer only decodes bodies and
/// renders the returned [`IngestResult`].
pub struct IntakeCoordinator {
    validator: Validator,
    dedup: DedupTracker,
    publisher: Arc<Publisher>,
    retry_after: Duration,
    duplicate_wait: Duration,
}

impl IntakeCoordinator {
    /// `duplicate_wait` bounds how long a duplicate waits for the outcome of
    /// an in-flight first submission.
    pub fn new(
        validator: Validator,
        dedup: DedupTracker,
        publisher: Arc<Publisher>,
        retry_after: Duration,
        duplicate_wait: Duration,
    ) -> Self {
        Self {
            validator,
            dedup,
            publisher,
            retry_after,
            duplicate_wait,
        }
    }

    #[instrument(
        skip_all,
        fields(
            declared_type = ?declared_type,
            event_id = field::Empty,
            event_type = field::Empty
        )
    )]
    pub async fn ingest(&self, raw: &[u8], declared_type: Option<&str>) -> IngestResult {
        report_received();
        debug!(stage = "received", bytes = raw.len());

        let result = match self.process(raw, declared_type).await {
            Handled::Processed(result) => {
                report_outcome(&result);
                result
            }
            // Counted once, as a duplicate, not again under its replayed outcome
            Handled::Replayed(result) => result,
        };

        debug!(stage = "responded", outcome = result.outcome());
        result
    }

    async fn process(&self, raw: &[u8], declared_type: Option<&str>) -> Handled {
        let envelope = match self.validator.validate(raw, declared_type) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(stage = "validated", reason = err.reason(), "{}", err);
                // A retry of an accepted event may come back after its timestamp
                // left the skew window, the remembered outcome still applies.
                let prior = err
                    .retried_event_id()
                    .and_then(|event_id| self.dedup.prior(event_id));
                if let Some(prior) = prior {
                    report_duplicate();
                    debug!(stage = "dedup_checked", duplicate = true);
                    return Handled::Replayed(self.replay(prior).await);
                }

                let field = Some(err.field().to_string()).filter(|field| !field.is_empty());
                return Handled::Processed(IngestResult::Rejected {
                    reason: err.reason(),
                    field,
                    message: err.to_string(),
                });
            }
        };
        let span = Span::current();
        span.record("event_id", envelope.event_id());
        span.record("event_type", envelope.event_type());
        debug!(stage = "validated");

        let reservation = match self.dedup.check_and_record(envelope.event_id()) {
            DedupCheck::Fresh(reservation) => reservation,
            DedupCheck::Duplicate(prior) => {
                report_duplicate();
                debug!(stage = "dedup_checked", duplicate = true);
                return Handled::Replayed(self.replay(prior).await);
            }
        };
        debug!(stage = "dedup_checked", duplicate = false);

        // Publication runs in its own task: a caller going away must not cancel a
        // broker write halfway, and the reservation is settled either way.
        let publisher = self.publisher.clone();
        let retry_after = self.retry_after;
        let publication = tokio::spawn(
            async move {
                let event_id = envelope.event_id().to_string();
                let result = match publisher.publish(envelope).await {
                    Ok(receipt) => IngestResult::Accepted { event_id, receipt },
                    Err(err) => settle_failure(err, retry_after),
                };
                reservation.complete(&result);
                debug!(stage = "published", outcome = result.outcome());
                result
            }
            .in_current_span(),
        );

        let result = match publication.await {
            Ok(result) => result,
            Err(err) => {
                error!("publication task failed: {}", err);
                IngestResult::Deferred {
                    reason: "internal_error",
                    retry_after: self.retry_after,
                }
            }
        };
        Handled::Processed(result)
    }

    async fn replay(&self, prior: PriorOutcome) -> IngestResult {
        match prior.resolve(self.duplicate_wait).await {
            Resolution::Settled(result) => result,
            Resolution::Released => IngestResult::Deferred {
                reason: "publication_abandoned",
                retry_after: self.retry_after,
            },
            Resolution::TimedOut => IngestResult::Deferred {
                reason: "duplicate_in_flight",
                retry_after: self.retry_after,
            },
        }
    }
}

enum Handled {
    Processed(IngestResult),
    Replayed(IngestResult),
}

fn settle_failure(err: PublishError, retry_after: Duration) -> IngestResult {
    match err {
        PublishError::Overloaded => IngestResult::Deferred {
            reason: "overloaded",
            retry_after,
        },
        PublishError::Exhausted { .. } => IngestResult::Deferred {
            reason: "broker_unavailable",
            retry_after,
        },
        PublishError::Terminal { reason, message } => IngestResult::Rejected {
            reason,
            field: None,
            message,
        },
        PublishError::Encoding(message) => IngestResult::Rejected {
            reason: "encoding_failed",
            field: None,
            message,
        },
    }
}
