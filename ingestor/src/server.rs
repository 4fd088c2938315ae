use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::coordinator::IntakeCoordinator;
use crate::dedup::DedupTracker;
use crate::feed::GithubFeed;
use crate::model::{SchemaCatalog, UuidV7Generator};
use crate::prometheus::setup_metrics_recorder;
use crate::publisher::kafka::KafkaBroker;
use crate::publisher::print::PrintBroker;
use crate::publisher::Publisher;
use crate::router;
use crate::time::SystemTime;
use crate::validator::Validator;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

fn create_publisher(config: &Config, liveness: &HealthRegistry) -> anyhow::Result<Publisher> {
    let publisher_config = config.publisher_config();
    if config.print_sink {
        // Print broker is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("print_sink".to_string(), Duration::from_secs(30))
            .report_status(ComponentStatus::Unhealthy);

        Ok(Publisher::new(PrintBroker::default(), publisher_config))
    } else {
        let sink_liveness = liveness.register("rdkafka".to_string(), Duration::from_secs(30));
        let broker = KafkaBroker::new(&config.kafka, sink_liveness)?;

        Ok(Publisher::new(broker, publisher_config))
    }
}

/// Builds every component from the configuration, serves until `shutdown`
/// resolves, then drains and flushes the publisher.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let liveness = HealthRegistry::new("liveness");

    let catalog = match &config.schema_catalog_path {
        Some(path) => SchemaCatalog::from_path(path)?,
        None => SchemaCatalog::builtin(),
    };
    info!(
        event_types = ?catalog.event_types().collect::<Vec<_>>(),
        "schema catalog loaded"
    );
    let validator = Validator::new(
        catalog,
        config.validation_rules()?,
        SystemTime {},
        UuidV7Generator,
    );

    let dedup = DedupTracker::new(
        config.dedup_window(),
        config.dedup_max_entries,
        SystemTime {},
    );
    {
        // Ensure that the dedup state does not grow unbounded during quiet periods
        let dedup = dedup.clone();
        tokio::spawn(async move {
            dedup.clean_state().await;
        });
    }

    let publisher = Arc::new(create_publisher(&config, &liveness)?);
    let coordinator = Arc::new(IntakeCoordinator::new(
        validator,
        dedup,
        publisher.clone(),
        config.deferred_retry_after(),
        config.publication_budget(),
    ));

    let feed = if config.github.github_feed {
        // A poll may take the whole request timeout before the loop reports again
        let deadline = config.github.poll_interval() + config.github.request_timeout() * 2;
        let feed_liveness = liveness.register("github_feed".to_string(), deadline);
        let feed = GithubFeed::new(&config.github, coordinator.clone(), feed_liveness)?;
        Some(tokio::spawn(feed.run()))
    } else {
        None
    };

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };
    let app = router::router(
        coordinator,
        liveness,
        metrics,
        config.max_body_bytes,
    );

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Some(feed) = feed {
        // Publications already handed to the publisher still complete
        feed.abort();
    }
    info!("draining in-flight publications");
    publisher.close(SHUTDOWN_FLUSH_TIMEOUT).await?;
    info!("publisher closed");
    Ok(())
}
