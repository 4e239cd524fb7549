//! In-process implementation of every store seam.
//!
//! Keeps the same semantics as the Postgres adapters, including the
//! conditional `mark_fired`, so the pipeline can run without a database.

use crate::errors::{Error, Result};
use crate::model::{Device, Reading, Sensor, Status};
use crate::registry::{DeviceDirectory, SensorRegistry};
use crate::rule::{Rule, RuleStore};
use crate::timeseries::{holds_only_field, project, within_window, ReadingQuery, ReadingStore, SortOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    devices: HashMap<Uuid, Device>,
    sensors: Vec<Sensor>,
    rules: Vec<Rule>,
    documents: HashMap<Uuid, Vec<Reading>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active device owned by `tenant_id`.
    pub fn add_device(&self, tenant_id: Uuid, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let device = Device {
            id,
            tenant_id,
            name: name.to_string(),
            status: Status::Active,
            secret_key: Uuid::new_v4().simple().to_string(),
            sensors: Vec::new(),
        };
        self.lock().devices.insert(id, device);
        id
    }

    pub fn set_device_status(&self, device_id: Uuid, status: Status) {
        if let Some(device) = self.lock().devices.get_mut(&device_id) {
            device.status = status;
        }
    }

    /// Raw stored documents of a device, in insertion order.
    pub fn documents(&self, device_id: Uuid) -> Vec<Reading> {
        self.lock()
            .documents
            .get(&device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn find_device(&self, device_id: Uuid) -> Result<Option<Device>> {
        let inner = self.lock();
        Ok(inner.devices.get(&device_id).map(|d| {
            let mut device = d.clone();
            device.sensors = inner
                .sensors
                .iter()
                .filter(|s| s.device_id == device_id)
                .cloned()
                .collect();
            device
        }))
    }
}

#[async_trait]
impl SensorRegistry for MemoryStore {
    async fn list_sensors(&self, device_id: Uuid) -> Result<Vec<Sensor>> {
        Ok(self
            .lock()
            .sensors
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn get_sensor(&self, device_id: Uuid, sensor_id: Uuid) -> Result<Option<Sensor>> {
        Ok(self
            .lock()
            .sensors
            .iter()
            .find(|s| s.device_id == device_id && s.id == sensor_id)
            .cloned())
    }

    async fn find_sensor_by_name(&self, device_id: Uuid, name: &str) -> Result<Option<Sensor>> {
        Ok(self
            .lock()
            .sensors
            .iter()
            .find(|s| s.device_id == device_id && s.name == name)
            .cloned())
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .sensors
            .iter()
            .any(|s| s.device_id == sensor.device_id && s.name == sensor.name)
        {
            return Err(Error::Conflict("sensor already exists".to_string()));
        }
        inner.sensors.push(sensor.clone());
        Ok(())
    }

    async fn update_sensor(&self, sensor: &Sensor) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .sensors
            .iter()
            .any(|s| s.device_id == sensor.device_id && s.name == sensor.name && s.id != sensor.id)
        {
            return Err(Error::Conflict("sensor with that name already exists".to_string()));
        }
        match inner.sensors.iter_mut().find(|s| s.id == sensor.id) {
            Some(existing) => {
                *existing = sensor.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("sensor {}", sensor.id))),
        }
    }

    async fn delete_sensor(&self, device_id: Uuid, sensor_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.sensors.len();
        inner
            .sensors
            .retain(|s| !(s.device_id == device_id && s.id == sensor_id));
        Ok(inner.sensors.len() != before)
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert_batch(&self, device_id: Uuid, readings: &[Reading]) -> Result<()> {
        self.lock()
            .documents
            .entry(device_id)
            .or_default()
            .extend(readings.iter().cloned());
        Ok(())
    }

    async fn query(&self, device_id: Uuid, query: &ReadingQuery) -> Result<Vec<Reading>> {
        let inner = self.lock();
        let Some(docs) = inner.documents.get(&device_id) else {
            return Ok(Vec::new());
        };
        let from = query.lower_bound();
        let to = query.upper_bound();

        let matching = docs
            .iter()
            .filter(|d| within_window(d, from, &to))
            .filter_map(|d| project(d, &query.fields));
        let page: Vec<Reading> = match query.order {
            SortOrder::Ascending => matching.skip(query.offset).take(query.limit).collect(),
            SortOrder::Descending => {
                let all: Vec<Reading> = matching.collect();
                all.into_iter().rev().skip(query.offset).take(query.limit).collect()
            }
        };
        Ok(page)
    }

    async fn latest_with_field(&self, device_id: Uuid, field: &str, limit: usize) -> Result<Vec<Reading>> {
        let inner = self.lock();
        Ok(inner
            .documents
            .get(&device_id)
            .map(|docs| {
                docs.iter()
                    .rev()
                    .filter(|d| d.contains_key(field))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rename_field(&self, device_id: Uuid, old: &str, new: &str) -> Result<u64> {
        let mut inner = self.lock();
        let mut changed = 0;
        for doc in inner.documents.entry(device_id).or_default().iter_mut() {
            if let Some(value) = doc.remove(old) {
                doc.insert(new.to_string(), value);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_field(&self, device_id: Uuid, name: &str) -> Result<u64> {
        let mut inner = self.lock();
        let mut changed = 0;
        for doc in inner.documents.entry(device_id).or_default().iter_mut() {
            if doc.remove(name).is_some() {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_documents_with_only_field(
        &self,
        device_id: Uuid,
        name: &str,
        other_fields: &[String],
    ) -> Result<u64> {
        let mut inner = self.lock();
        let docs = inner.documents.entry(device_id).or_default();
        let before = docs.len();
        docs.retain(|d| !holds_only_field(d, name, other_fields));
        Ok((before - docs.len()) as u64)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        self.lock().rules.push(rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        let mut inner = self.lock();
        let existing = inner
            .rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| Error::NotFound(format!("rule {}", rule.id)))?;
        let last_notification = existing.last_notification;
        *existing = rule.clone();
        existing.last_notification = last_notification;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<Option<Rule>> {
        Ok(self
            .lock()
            .rules
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.id == rule_id)
            .cloned())
    }

    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .lock()
            .rules
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rules)
    }

    async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.rules.len();
        inner
            .rules
            .retain(|r| !(r.tenant_id == tenant_id && r.id == rule_id));
        Ok(inner.rules.len() != before)
    }

    async fn active_rules_for_device(&self, device_id: Uuid) -> Result<Vec<Rule>> {
        Ok(self
            .lock()
            .rules
            .iter()
            .filter(|r| r.device_id == device_id && r.is_active())
            .cloned()
            .collect())
    }

    async fn mark_fired(
        &self,
        rule_id: Uuid,
        previous: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) if rule.last_notification == previous => {
                rule.last_notification = Some(fired_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
