//! Saga worker entry point.

use std::sync::Arc;

use messaging::{InMemoryBroker, KafkaPublisher, KafkaSource};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::config::{Config, LogFormat};
use worker::routes::sagas::AppState;
use worker::runtime;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &Config) -> Arc<dyn SagaStore> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, saga state is kept in memory only");
        return Arc::new(InMemorySagaStore::new());
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    let store = PostgresSagaStore::new(pool);
    store
        .run_migrations()
        .await
        .expect("failed to run saga store migrations");
    tracing::info!("using PostgreSQL saga store");
    Arc::new(store)
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Saga store
    let store = open_store(&config).await;

    // 4. Broker, consumers and reconciler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let services = match config.kafka_config() {
        Some(kafka) => {
            tracing::info!(brokers = %kafka.brokers, group = %kafka.group_id, "using Kafka");
            let publisher = KafkaPublisher::new(&kafka).expect("failed to create Kafka producer");
            let source = KafkaSource::new(&kafka).expect("failed to create Kafka consumer");
            runtime::spawn_services(
                &config,
                Arc::clone(&store),
                Arc::new(source),
                publisher,
                &shutdown_rx,
            )
        }
        None => {
            tracing::warn!("KAFKA_BROKERS not set, using the in-memory broker");
            let broker = InMemoryBroker::new();
            runtime::spawn_services(
                &config,
                Arc::clone(&store),
                Arc::new(broker.clone()),
                broker,
                &shutdown_rx,
            )
        }
    }
    .expect("invalid saga definitions");

    // 5. HTTP endpoints
    let app = worker::create_app(Arc::new(AppState::new(store)), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting saga worker");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");

    // 6. Drain consumers and stop the reconciler
    services.join().await;
    tracing::info!("saga worker shut down gracefully");
}
