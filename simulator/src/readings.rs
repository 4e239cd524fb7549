use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};

/// Same timestamp layout the server accepts for `collected_at`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Body published on `devices/{id}/data`.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub data: Vec<Map<String, Value>>,
}

pub fn generate_batch(rng: &mut impl Rng, size: usize, now: DateTime<Utc>) -> Batch {
    let data = (0..size)
        .map(|i| {
            // spread the batch over the preceding seconds, oldest first
            let collected_at = now - chrono::Duration::seconds((size - i) as i64);
            generate_reading(rng, collected_at)
        })
        .collect();
    Batch { data }
}

fn generate_reading(rng: &mut impl Rng, collected_at: DateTime<Utc>) -> Map<String, Value> {
    let mut reading = Map::new();

    let temperature: f64 = if rng.gen_bool(0.05) {
        rng.gen_range(-50.0..100.0) // 5% outliers
    } else {
        rng.gen_range(15.0..35.0)
    };
    reading.insert("temperature".into(), round(temperature).into());

    let humidity: f64 = rng.gen_range(30.0..80.0);
    reading.insert("humidity".into(), round(humidity).into());

    // occasional extra channels exercise sensor discovery
    if rng.gen_bool(0.1) {
        reading.insert("battery".into(), rng.gen_range(0..=100).into());
    }
    if rng.gen_bool(0.02) {
        reading.insert("door".into(), if rng.gen_bool(0.5) { "open" } else { "closed" }.into());
    }

    reading.insert(
        "collected_at".into(),
        collected_at.format(TIMESTAMP_FORMAT).to_string().into(),
    );
    reading
}

fn round(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
