use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_readings_total",
        "Total readings accepted and stored"
    ))
    .unwrap();
    pub static ref REJECTED_BATCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_rejected_batches_total",
        "Total ingestion batches rejected by validation"
    ))
    .unwrap();
    pub static ref SENSORS_DISCOVERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_sensors_discovered_total",
        "Total sensors registered from unknown reading fields"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_store_failures_total",
        "Total transient reading store failures"
    ))
    .unwrap();
    pub static ref EVALUATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_evaluations_total",
        "Total rule evaluation jobs processed"
    ))
    .unwrap();
    pub static ref RULES_FIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_rules_fired_total",
        "Total rule firings"
    ))
    .unwrap();
    pub static ref NOTIFICATIONS_SENT_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_notifications_sent_total",
        "Total notifications delivered"
    ))
    .unwrap();
    pub static ref NOTIFICATIONS_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_notifications_failed_total",
        "Total notifications that failed to render or deliver"
    ))
    .unwrap();
    pub static ref EVALUATION_QUEUE_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_evaluation_queue_full_total",
        "Total number of times the evaluation queue was full (backpressure events)"
    ))
    .unwrap();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_mqtt_messages_total",
        "Total MQTT publishes received"
    ))
    .unwrap();
    pub static ref MQTT_INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "siot_mqtt_invalid_messages_total",
        "Total MQTT publishes dropped after failing to ingest"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "siot_ingest_latency_seconds",
            "Time taken to validate and store a batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(READINGS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(REJECTED_BATCHES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SENSORS_DISCOVERED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(EVALUATIONS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(RULES_FIRED_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_FAILED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVALUATION_QUEUE_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(MQTT_MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(MQTT_INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
