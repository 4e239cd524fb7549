mod readings;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use readings::generate_batch;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Publishes synthetic reading batches for registered devices.
#[derive(Debug, Parser)]
#[command(name = "siot-simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Batches per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,

    /// Readings per batch.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 5)]
    batch_size: usize,

    /// Comma-separated ids of devices registered on the server.
    #[arg(long, env = "DEVICE_IDS", value_delimiter = ',', required = true)]
    devices: Vec<Uuid>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let rate = args.rate.max(1);

    info!("Starting reading simulator");
    info!(
        "Broker: {}:{}, Rate: {} batches/s, Batch size: {}, Devices: {}",
        args.broker,
        args.port,
        rate,
        args.batch_size,
        args.devices.len()
    );

    let client_id = format!("siot-sim-{}", rand::thread_rng().gen::<u32>());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish readings");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    const BURST_SIZE: usize = 20;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate);

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = args.devices[(counter % args.devices.len() as u64) as usize];
            let batch = generate_batch(&mut rng, args.batch_size, Utc::now());

            let payload = match serde_json::to_string(&batch) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize batch: {}", e);
                    continue;
                }
            };

            let topic = format!("devices/{}/data", device_id);
            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 1000 == 0 {
            info!("Published {} batches", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!("Burst took {:?}, target was {:?}", elapsed, burst_interval);
        }
    }
}
