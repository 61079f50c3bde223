use std::sync::Arc;

use dotenvy::dotenv;
use outbox_relay::config::Settings;
use outbox_relay::{
    build_server, create_pool, KafkaPublisher, Outbox, OutboxError, PgEventStore,
    PgLockClassifier, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let settings = Settings::from_env()?;

    let pool = create_pool(&settings.database_url)?;
    let policy = RetryPolicy::new(PgLockClassifier)
        .with_retries(settings.db_retry_count)
        .with_delay(settings.db_retry_delay);
    let store = Arc::new(PgEventStore::with_options(pool, policy, settings.store));
    let publisher = Arc::new(KafkaPublisher::new(
        &settings.kafka_brokers,
        &settings.kafka_topic_prefix,
    )?);

    let outbox = Outbox::builder()
        .store(Arc::clone(&store))
        .publisher(publisher)
        .poll_interval(settings.poll_interval)
        .batch_transactions(settings.batch_transactions)
        .build()?;

    let (errors_tx, mut errors_rx) = tokio::sync::mpsc::unbounded_channel::<OutboxError>();
    tokio::spawn(async move {
        while let Some(err) = errors_rx.recv().await {
            log::error!("Outbox: {}", err);
        }
    });

    let shutdown = CancellationToken::new();
    let dispatcher = outbox.init(shutdown.clone(), errors_tx)?;

    log::info!(
        "Starting server at http://{}:{}",
        settings.host,
        settings.port
    );
    let server = build_server(store, &settings.host, settings.port)?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");

    shutdown.cancel();
    dispatcher.join().await?;
    server_handle.stop(true).await;
    server_task.await??;

    Ok(())
}
