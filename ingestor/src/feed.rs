//! Upstream producer polling the GitHub public events API.
//!
//! Each poll fetches the latest page of `/events`, keeps the repository events
//! the catalog knows (`WatchEvent`, `ForkEvent`, `PushEvent`) and pushes them
//! through [`IntakeCoordinator::ingest`], so they are validated, deduplicated
//! and published exactly like HTTP submissions. Pages overlap between polls;
//! the dedup tracker turns re-seen events into replays.

use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::api::IngestResult;
use crate::config::GithubConfig;
use crate::coordinator::IntakeCoordinator;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("GITHUB_TOKEN is not a valid header value")]
    InvalidToken,
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {error}")]
    Request {
        url: String,
        #[source]
        error: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to decode events from {url}: {error}")]
    Decode {
        url: String,
        #[source]
        error: reqwest::Error,
    },
}

/// One entry of the `/events` listing. Only the fields the mapping needs.
#[derive(Debug, Deserialize)]
pub struct GithubEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: Option<Value>,
    pub repo: Option<Value>,
    pub payload: Option<Value>,
    pub created_at: Option<String>,
}

fn catalog_type(kind: &str) -> Option<&'static str> {
    match kind {
        "WatchEvent" => Some("github.watch"),
        "ForkEvent" => Some("github.fork"),
        "PushEvent" => Some("github.push"),
        _ => None,
    }
}

/// Turns a GitHub event into the event type and body of a submission, or
/// names the reason it is skipped.
///
/// The repository name becomes the `source`, so `PARTITION_KEY=source` keeps
/// every event of a repository on one partition. GitHub's own `payload`
/// fields (`commits`, `ref`, ...) are kept next to `actor` and `repo`.
pub fn to_submission(event: GithubEvent) -> Result<(&'static str, Value), &'static str> {
    let event_type = catalog_type(&event.kind).ok_or("low_value")?;
    let repo_name = event
        .repo
        .as_ref()
        .and_then(|repo| repo.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or("missing_repo")?
        .to_string();

    let mut payload = match event.payload {
        Some(Value::Object(fields)) => fields,
        _ => Map::new(),
    };
    payload.insert("actor".to_string(), event.actor.unwrap_or(Value::Null));
    payload.insert("repo".to_string(), event.repo.unwrap_or(Value::Null));

    let body = json!({
        "event_id": format!("github-{}", event.id),
        "event_type": event_type,
        "timestamp": event.created_at,
        "source": repo_name,
        "payload": payload,
    });
    Ok((event_type, body))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub skipped: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub deferred: usize,
}

pub struct GithubFeed {
    client: Client,
    events_url: String,
    poll_interval: Duration,
    coordinator: Arc<IntakeCoordinator>,
    liveness: HealthHandle,
}

impl GithubFeed {
    pub fn new(
        config: &GithubConfig,
        coordinator: Arc<IntakeCoordinator>,
        liveness: HealthHandle,
    ) -> Result<Self, FeedError> {
        let token = config.github_token.as_deref().unwrap_or_default();
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| FeedError::InvalidToken)?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, authorization);
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .user_agent("ingestor github feed")
            .timeout(config.request_timeout())
            .build()
            .map_err(FeedError::Client)?;

        let events_url = format!("{}/events", config.github_api_url.trim_end_matches('/'));
        info!(url = %events_url, "github feed configured");

        Ok(Self {
            client,
            events_url,
            poll_interval: config.poll_interval(),
            coordinator,
            liveness,
        })
    }

    /// Fetches one page of events and ingests the ones worth keeping, oldest
    /// first so a repository's events reach the broker in the order they
    /// happened.
    #[instrument(skip_all)]
    pub async fn poll_once(&self) -> Result<PollSummary, FeedError> {
        let response = self
            .client
            .get(&self.events_url)
            .send()
            .await
            .map_err(|error| FeedError::Request {
                url: self.events_url.clone(),
                error,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                url: self.events_url.clone(),
                status,
            });
        }
        // Entries are decoded one by one, a single odd event must not cost the page
        let events: Vec<Value> = response.json().await.map_err(|error| FeedError::Decode {
            url: self.events_url.clone(),
            error,
        })?;

        let mut summary = PollSummary {
            received: events.len(),
            ..Default::default()
        };
        for raw in events.into_iter().rev() {
            let submission = serde_json::from_value::<GithubEvent>(raw)
                .map_err(|_| "undecodable")
                .and_then(to_submission);
            let (event_type, body) = match submission {
                Ok(submission) => submission,
                Err(reason) => {
                    counter!("ingest_feed_events_skipped_total", "reason" => reason).increment(1);
                    summary.skipped += 1;
                    continue;
                }
            };

            let result = self
                .coordinator
                .ingest(body.to_string().as_bytes(), Some(event_type))
                .await;
            let event_id = &body["event_id"];
            match result {
                IngestResult::Accepted { .. } => summary.accepted += 1,
                IngestResult::Rejected { reason, message, .. } => {
                    warn!(reason, %event_id, "github event rejected: {}", message);
                    summary.rejected += 1;
                }
                IngestResult::Deferred { reason, .. } => {
                    warn!(reason, %event_id, "github event deferred");
                    summary.deferred += 1;
                }
            }
        }

        info!(
            received = summary.received,
            skipped = summary.skipped,
            accepted = summary.accepted,
            rejected = summary.rejected,
            deferred = summary.deferred,
            "github feed polled"
        );
        Ok(summary)
    }

    /// Polls forever with `GITHUB_POLL_INTERVAL_MS` between polls, needs to be
    /// spawned in a separate task. Upstream failures are logged and retried on
    /// the next tick.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.poll_once().await {
                counter!("ingest_feed_poll_errors_total").increment(1);
                error!("github feed poll failed: {}", err);
            }
            // The loop is alive whatever GitHub answered
            self.liveness.report_healthy();
            debug!("github feed waiting for next poll");
        }
    }
}
