use crate::errors::{Error, Result};
use crate::evaluator::EvaluationJob;
use crate::metrics::{
    EVALUATION_QUEUE_FULL_TOTAL, INGEST_LATENCY_SECONDS, READINGS_TOTAL, REJECTED_BATCHES_TOTAL,
    SENSORS_DISCOVERED_TOTAL,
};
use crate::model::{parse_timestamp, Reading, Sensor, COLLECTED_AT};
use crate::registry::{DeviceDirectory, SensorRegistry};
use crate::timeseries::ReadingStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Checks every reading of a batch and returns the distinct field names it
/// uses, in first-seen order, without `collected_at`.
pub fn validate_batch(readings: &[Reading]) -> Result<Vec<String>> {
    if readings.is_empty() {
        return Err(Error::invalid("data is required"));
    }

    let mut fields: Vec<String> = Vec::new();
    for reading in readings {
        let collected_at = reading
            .get(COLLECTED_AT)
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::invalid("collect date is missing"))?;

        let valid = collected_at
            .as_str()
            .and_then(parse_timestamp)
            .is_some();
        if !valid {
            return Err(Error::invalid("collect date is in the wrong format"));
        }

        for key in reading.keys() {
            if key != COLLECTED_AT && !fields.contains(key) {
                fields.push(key.clone());
            }
        }
    }
    Ok(fields)
}

/// Sorts batch fields into names the device does not know yet.
///
/// Fails with `InactiveSensor` as soon as a field matches a registered but
/// inactive sensor.
pub fn unknown_fields(fields: &[String], sensors: &[Sensor]) -> Result<Vec<String>> {
    let mut unknown = Vec::new();
    for field in fields {
        match sensors.iter().find(|s| &s.name == field) {
            Some(sensor) if sensor.is_active() => {}
            Some(sensor) => return Err(Error::InactiveSensor(sensor.name.clone())),
            None => unknown.push(field.clone()),
        }
    }
    Ok(unknown)
}

/// Validates, discovers and stores reading batches, then queues rule evaluation.
pub struct Ingestor {
    directory: Arc<dyn DeviceDirectory>,
    registry: Arc<dyn SensorRegistry>,
    store: Arc<dyn ReadingStore>,
    evaluations: mpsc::Sender<EvaluationJob>,
}

impl Ingestor {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        registry: Arc<dyn SensorRegistry>,
        store: Arc<dyn ReadingStore>,
        evaluations: mpsc::Sender<EvaluationJob>,
    ) -> Self {
        Self {
            directory,
            registry,
            store,
            evaluations,
        }
    }

    pub async fn ingest(&self, device_id: Uuid, readings: Vec<Reading>) -> Result<()> {
        let start = Instant::now();
        let result = self.ingest_inner(device_id, readings).await;
        match &result {
            Ok(count) => {
                READINGS_TOTAL.inc_by(*count as f64);
                INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
            }
            Err(Error::Store(e)) => error!(%device_id, "Failed to store batch: {}", e),
            Err(e) => {
                REJECTED_BATCHES_TOTAL.inc();
                debug!(%device_id, "Rejected batch: {}", e);
            }
        }
        result.map(|_| ())
    }

    async fn ingest_inner(&self, device_id: Uuid, mut readings: Vec<Reading>) -> Result<usize> {
        let device = self
            .directory
            .find_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        if !device.is_active() {
            return Err(Error::invalid("device is inactive"));
        }

        let fields = validate_batch(&readings)?;
        let unknown = unknown_fields(&fields, &device.sensors)?;

        for name in unknown {
            match self.registry.insert_sensor(&Sensor::new(device_id, &name)).await {
                Ok(()) => {
                    SENSORS_DISCOVERED_TOTAL.inc();
                    info!(%device_id, sensor = %name, "Registered new sensor");
                }
                // lost a race against a concurrent batch registering the same name
                Err(Error::Conflict(_)) => debug!(%device_id, sensor = %name, "Sensor already registered"),
                Err(e) => return Err(e),
            }
        }

        self.store.insert_batch(device_id, &readings).await?;

        let count = readings.len();
        if let Some(latest) = readings.pop() {
            enqueue(&self.evaluations, EvaluationJob { device_id, reading: latest });
        }
        Ok(count)
    }
}

/// Hands a job to the evaluator without ever blocking the caller.
pub fn enqueue(tx: &mpsc::Sender<EvaluationJob>, job: EvaluationJob) {
    match tx.try_send(job) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(job)) => {
            EVALUATION_QUEUE_FULL_TOTAL.inc();
            debug!("Evaluation queue full, sending in background");
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(job).await.is_err() {
                    warn!("Evaluation queue closed, dropping job");
                }
            });
        }
        Err(mpsc::error::TrySendError::Closed(job)) => {
            error!(device_id = %job.device_id, "Evaluation queue closed, dropping job");
        }
    }
}
