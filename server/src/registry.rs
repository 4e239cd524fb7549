use crate::errors::Result;
use crate::model::{Device, Sensor};
use async_trait::async_trait;
use uuid::Uuid;

/// Read-only view of the device table owned by the outer platform.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Loads a device together with its sensors.
    async fn find_device(&self, device_id: Uuid) -> Result<Option<Device>>;
}

/// Relational registry of the sensors each device exposes.
#[async_trait]
pub trait SensorRegistry: Send + Sync {
    async fn list_sensors(&self, device_id: Uuid) -> Result<Vec<Sensor>>;

    async fn get_sensor(&self, device_id: Uuid, sensor_id: Uuid) -> Result<Option<Sensor>>;

    async fn find_sensor_by_name(&self, device_id: Uuid, name: &str) -> Result<Option<Sensor>>;

    /// Fails with `Error::Conflict` when the device already has the name.
    async fn insert_sensor(&self, sensor: &Sensor) -> Result<()>;

    /// Fails with `Error::Conflict` when another sensor of the device has the name.
    async fn update_sensor(&self, sensor: &Sensor) -> Result<()>;

    async fn delete_sensor(&self, device_id: Uuid, sensor_id: Uuid) -> Result<bool>;
}
