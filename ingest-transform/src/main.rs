use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_transform::api::router;
use ingest_transform::config::Config;
use ingest_transform::consumer::{BundleConsumer, BundleSettings};
use ingest_transform::dead_letter::{DeadLetterRouter, KafkaDeadLetter};
use ingest_transform::health::HealthRegistry;
use ingest_transform::kafka::create_kafka_producer;
use ingest_transform::pipeline::TransformPipeline;
use ingest_transform::serve_metrics::{serve, setup_metrics_recorder};
use ingest_transform::sink::{PgSink, PrintSink, RowSink};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("failed to load configuration from env")?;
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let liveness = HealthRegistry::new("liveness");

    let sink: Arc<dyn RowSink> = if config.print_sink {
        warn!("PRINT_SINK is set, rows are logged instead of written");
        Arc::new(PrintSink {})
    } else {
        let sink = PgSink::new(
            &config.database_url,
            config.max_pg_connections,
            config.sink_write_timeout.0,
        )
        .await
        .context("failed to connect to the sink database")?;
        Arc::new(sink)
    };

    let dead_letter = match &config.dead_letter_topic {
        Some(topic) => {
            let handle = liveness.register("dead_letter_producer", time::Duration::seconds(30));
            let producer = create_kafka_producer(&config.kafka, handle)
                .await
                .context("failed to create dead-letter producer")?;
            DeadLetterRouter::new(Arc::new(KafkaDeadLetter::new(producer, topic.as_str())))
        }
        None => {
            warn!("DEAD_LETTER_TOPIC is not set, invalid events will be dropped");
            DeadLetterRouter::disabled()
        }
    };

    let pipeline = TransformPipeline::new(sink, dead_letter, config.batch_size.get());

    let consumer = BundleConsumer::new(
        &config.kafka,
        &config.consumer,
        pipeline.clone(),
        BundleSettings {
            bundle_size: config.bundle_size.get(),
            bundle_timeout: config.bundle_timeout.0,
            redelivery_backoff: config.redelivery_backoff.0,
        },
        liveness.register("bundle_consumer", time::Duration::seconds(60)),
    )
    .context("failed to create source consumer")?;
    info!(
        "Subscribed to topic: {}",
        config.consumer.kafka_consumer_topic
    );

    let app = router(pipeline, liveness, Some(recorder));
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!("failed to serve http: {}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    tokio::select! {
        result = &mut consumer_task => {
            // The consumer only stops on its own after a fatal error
            result?.context("bundle consumer stopped")?;
            return Ok(());
        }
        _ = shutdown() => {}
    }

    if shutdown_tx.send(()).is_err() {
        warn!("bundle consumer already stopped");
    }
    consumer_task.await?.context("bundle consumer stopped")?;

    info!("Shut down cleanly");
    Ok(())
}
