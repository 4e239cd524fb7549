use axum::{routing::get, Router};
use siot_server::config::Config;
use siot_server::db::{self, PgStore};
use siot_server::evaluator::{run_evaluator, Evaluator};
use siot_server::notify::SmtpWebhookDispatcher;
use siot_server::{app_state, metrics, mqtt, rest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting sensor platform server");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    if config.mqtt_enabled {
        info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    }

    metrics::init_metrics();

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(PgStore::new(pool));

    let dispatcher = match SmtpWebhookDispatcher::new(&config.smtp) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            error!("Failed to configure notifications: {}", e);
            std::process::exit(1);
        }
    };

    info!("Evaluation queue capacity: {}", config.evaluation_queue_capacity);
    let (tx, rx) = mpsc::channel(config.evaluation_queue_capacity);

    let evaluator = Evaluator::new(store.clone(), store.clone(), dispatcher);
    let evaluator_handle = tokio::spawn(run_evaluator(rx, evaluator));

    let state = app_state(store, tx);

    let mqtt_handle = if config.mqtt_enabled {
        let client_id = format!("siot-server-{}", uuid::Uuid::new_v4());
        let ingestor = state.ingestor.clone();
        let (broker, port) = (config.mqtt_broker.clone(), config.mqtt_port);
        Some(tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(broker, port, client_id, ingestor).await {
                error!("MQTT task failed: {}", e);
            }
        }))
    } else {
        None
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let mqtt_done = async {
        match mqtt_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = mqtt_done => {
            error!("MQTT task terminated");
        }
        _ = evaluator_handle => {
            error!("Rule evaluator terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
