use crate::errors::{Error, Result};
use crate::model::{Sensor, SensorInput, Status};
use crate::registry::SensorRegistry;
use crate::timeseries::ReadingStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Sensor lifecycle operations that keep stored readings in step with the
/// registry.
pub struct SensorService {
    registry: Arc<dyn SensorRegistry>,
    readings: Arc<dyn ReadingStore>,
}

impl SensorService {
    pub fn new(registry: Arc<dyn SensorRegistry>, readings: Arc<dyn ReadingStore>) -> Self {
        Self { registry, readings }
    }

    pub async fn list(&self, device_id: Uuid) -> Result<Vec<Sensor>> {
        self.registry.list_sensors(device_id).await
    }

    pub async fn get(&self, device_id: Uuid, sensor_id: Uuid) -> Result<Sensor> {
        self.registry
            .get_sensor(device_id, sensor_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sensor {sensor_id}")))
    }

    pub async fn create(&self, device_id: Uuid, input: SensorInput) -> Result<Sensor> {
        let input = input.normalized();
        let errors = input.validate();
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        let mut sensor = Sensor::new(device_id, &input.name);
        sensor.description = input.description.clone();
        sensor.unit = input.unit.clone();
        sensor.status = input.status().unwrap_or(Status::Active);

        self.registry.insert_sensor(&sensor).await?;
        Ok(sensor)
    }

    /// Updates a sensor; a new name is pushed into every stored reading
    /// before returning.
    pub async fn update(&self, device_id: Uuid, sensor_id: Uuid, input: SensorInput) -> Result<Sensor> {
        let input = input.normalized();
        let errors = input.validate();
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        let existing = self.get(device_id, sensor_id).await?;
        let renamed = existing.name != input.name;
        if renamed
            && self
                .registry
                .find_sensor_by_name(device_id, &input.name)
                .await?
                .is_some()
        {
            return Err(Error::Conflict("sensor with that name already exists".to_string()));
        }

        let updated = Sensor {
            name: input.name.clone(),
            description: input.description.clone(),
            unit: input.unit.clone(),
            status: input.status().unwrap_or(existing.status),
            updated_at: Utc::now(),
            ..existing.clone()
        };
        self.registry.update_sensor(&updated).await?;

        if renamed {
            let changed = self
                .readings
                .rename_field(device_id, &existing.name, &updated.name)
                .await
                .inspect_err(|e| {
                    error!(%device_id, old = %existing.name, new = %updated.name, "Rename propagation failed: {}", e)
                })?;
            info!(%device_id, old = %existing.name, new = %updated.name, changed, "Renamed sensor field");
        }
        Ok(updated)
    }

    /// Deletes a sensor, then drops readings that only carried it and strips
    /// it from the others.
    pub async fn delete(&self, device_id: Uuid, sensor_id: Uuid) -> Result<()> {
        let sensor = self.get(device_id, sensor_id).await?;
        if !self.registry.delete_sensor(device_id, sensor_id).await? {
            return Err(Error::NotFound(format!("sensor {sensor_id}")));
        }

        let others: Vec<String> = self
            .registry
            .list_sensors(device_id)
            .await?
            .into_iter()
            .map(|s| s.name)
            .filter(|name| name != &sensor.name)
            .collect();

        let propagate = async {
            let deleted = self
                .readings
                .delete_documents_with_only_field(device_id, &sensor.name, &others)
                .await?;
            let stripped = self.readings.delete_field(device_id, &sensor.name).await?;
            Ok::<_, Error>((deleted, stripped))
        };
        let (deleted, stripped) = propagate.await.inspect_err(|e| {
            error!(%device_id, sensor = %sensor.name, "Delete propagation failed: {}", e)
        })?;

        info!(%device_id, sensor = %sensor.name, deleted, stripped, "Removed sensor field");
        Ok(())
    }
}
