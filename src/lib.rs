pub mod application;
pub mod config;
pub mod context;
pub mod db;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod infrastructure;
pub mod retry;
pub mod schema;

use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub use application::outbox::{CycleReport, DispatcherHandle, Outbox, OutboxBuilder};
pub use context::{Context, ContextError};
pub use db::{create_pool, DbPool};
pub use domain::errors::{OutboxError, OutboxResult};
pub use domain::outbox::{Message, OutboxRecord, OutboxStats, OutboxStatus, StoreOptions};
pub use domain::ports::{EventStore, Publisher, Transaction};
pub use infrastructure::kafka::KafkaPublisher;
pub use infrastructure::memory_store::MemoryEventStore;
pub use infrastructure::pg_store::{PgEventStore, PgTransaction};
pub use retry::{PgLockClassifier, RetryPolicy};

/// Applied by `PgEventStore::init`.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Build and return an actix-web `Server` bound to `host:port` exposing the
/// outbox inspection routes.
///
/// The caller is responsible for `.await`-ing (or `tokio::spawn`-ing) the
/// returned server.
pub fn build_server(
    store: Arc<PgEventStore>,
    host: &str,
    port: u16,
) -> std::io::Result<actix_web::dev::Server> {
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(store.clone()))
            .wrap(Logger::default())
            .service(
                web::scope("/outbox")
                    .route("/stats", web::get().to(handlers::outbox::get_stats))
                    .route("/stuck", web::get().to(handlers::outbox::list_stuck))
                    .route("/{id}", web::get().to(handlers::outbox::get_event)),
            )
            .route(
                "/api-docs/openapi.json",
                web::get().to(handlers::outbox::openapi_json),
            )
    })
    .disable_signals()
    .bind((host.to_string(), port))?
    .run())
}
