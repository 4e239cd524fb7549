//! Broker-level load test. Needs a running server, broker and database, and
//! device ids in `LOAD_TEST_DEVICE_IDS` (comma separated).

use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use siot_server::model::format_timestamp;
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn random_batch(size: usize) -> Value {
    let mut rng = rand::thread_rng();
    let data: Vec<Value> = (0..size)
        .map(|_| {
            json!({
                "temperature": rng.gen_range(15.0..35.0),
                "humidity": rng.gen_range(30.0..80.0),
                "collected_at": format_timestamp(Utc::now()),
            })
        })
        .collect();
    json!({ "data": data })
}

fn device_ids() -> Vec<String> {
    std::env::var("LOAD_TEST_DEVICE_IDS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
#[ignore]
async fn test_500_batches_per_second() {
    let devices = device_ids();
    assert!(!devices.is_empty(), "LOAD_TEST_DEVICE_IDS is not set");

    let test_duration_secs = 10;
    let target_rate = 500;
    let total_batches = test_duration_secs * target_rate;
    let batch_size = 10;

    let mut mqtt_options = MqttOptions::new("siot-load-test", "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    println!(
        "Load test: {} batches/s of {} readings for {}s across {} devices",
        target_rate,
        batch_size,
        test_duration_secs,
        devices.len()
    );

    sleep(Duration::from_millis(500)).await;

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size: usize = 50;
    let delay_per_burst =
        Duration::from_micros((burst_size as u64 * 1_000_000) / target_rate as u64);

    for burst_start in (0..total_batches).step_by(burst_size) {
        for i in burst_start..std::cmp::min(burst_start + burst_size, total_batches) {
            let device_id = &devices[i % devices.len()];
            let payload = random_batch(batch_size).to_string();

            match client
                .publish(
                    format!("devices/{}/data", device_id),
                    QoS::AtLeastOnce,
                    false,
                    payload,
                )
                .await
            {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;
    }

    let duration = start.elapsed();
    let actual_rate = sent_count as f64 / duration.as_secs_f64();

    println!(
        "Sent {} batches in {:.2}s ({:.2} batches/s), {} errors",
        sent_count,
        duration.as_secs_f64(),
        actual_rate,
        error_count
    );

    assert!(
        actual_rate >= 450.0,
        "Throughput too low: {:.2} batches/s (expected >= 450)",
        actual_rate
    );
    assert_eq!(error_count, 0, "Publish errors: {}", error_count);
}
