use crate::errors::{Error, Result};
use crate::ingest::Ingestor;
use crate::metrics::{MQTT_INVALID_MESSAGES_TOTAL, MQTT_MESSAGES_TOTAL};
use crate::model::ReadingBatch;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DATA_TOPIC: &str = "devices/+/data";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Subscribes to device data topics and feeds every publish through the
/// same ingestion path as the HTTP endpoint.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    ingestor: Arc<Ingestor>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);
    client.subscribe(DATA_TOPIC, QoS::AtLeastOnce).await?;
    info!("Subscribed to {} with QoS 1", DATA_TOPIC);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MQTT_MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                if let Err(e) =
                    process_message_with_retry(&publish.topic, &publish.payload, &ingestor).await
                {
                    error!(topic = %publish.topic, "Dropping message: {}", e);
                    MQTT_INVALID_MESSAGES_TOTAL.inc();
                }
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc reconnects on the next poll
                error!("MQTT error: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Extracts the device id from `devices/{device_id}/data`.
pub fn device_id_from_topic(topic: &str) -> Result<Uuid> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("devices"), Some(id), Some("data"), None) => Uuid::parse_str(id)
            .map_err(|_| Error::invalid(format!("invalid device id in topic {topic}"))),
        _ => Err(Error::invalid(format!("unexpected topic {topic}"))),
    }
}

async fn process_message_with_retry(topic: &str, payload: &[u8], ingestor: &Ingestor) -> Result<()> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(topic, payload, ingestor).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Message processed successfully on attempt {}", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES || !is_retryable_error(&e) {
                    return Err(e);
                }

                warn!(
                    "Message processing failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

async fn process_message(topic: &str, payload: &[u8], ingestor: &Ingestor) -> Result<()> {
    let device_id = device_id_from_topic(topic)?;
    let batch = serde_json::from_slice::<ReadingBatch>(payload)
        .map_err(|e| Error::invalid(format!("JSON parse error: {}", e)))?;
    ingestor.ingest(device_id, batch.data).await
}

/// Only storage hiccups are worth another attempt; a bad batch stays bad.
fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Store(_) => true,
        Error::Validation(_)
        | Error::NotFound(_)
        | Error::Conflict(_)
        | Error::InactiveSensor(_)
        | Error::Migration(_)
        | Error::Notification(_)
        | Error::Mqtt(_)
        | Error::Json(_) => false,
    }
}
